use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ErrorKind — the observable taxonomy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Closed set of observable error kinds. These strings appear verbatim
/// in `tool_call_finished` results and terminal `run_failed` payloads,
/// so the wire form is the snake_case name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Permission,
    NotFound,
    SandboxDenied,
    Timeout,
    HumanRequired,
    Cancelled,
    Budget,
    Io,
    ConfigError,
    ContextLengthExceeded,
    Unknown,
}

impl ErrorKind {
    /// The wire string, e.g. `"sandbox_denied"`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Permission => "permission",
            Self::NotFound => "not_found",
            Self::SandboxDenied => "sandbox_denied",
            Self::Timeout => "timeout",
            Self::HumanRequired => "human_required",
            Self::Cancelled => "cancelled",
            Self::Budget => "budget",
            Self::Io => "io",
            Self::ConfigError => "config_error",
            Self::ContextLengthExceeded => "context_length_exceeded",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error — shared error type across all runtime crates
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shared error type used across all Skills Runtime crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("validation: {0}")]
    Validation(String),

    #[error("permission: {0}")]
    Permission(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("sandbox denied: {0}")]
    SandboxDenied(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("human input required: {0}")]
    HumanRequired(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("budget exhausted: {0}")]
    Budget(String),

    #[error("config: {0}")]
    Config(String),

    /// The backend rejected the request because the prompt no longer
    /// fits the model's context window.
    #[error("context length exceeded")]
    ContextLengthExceeded,

    #[error("backend: {0}")]
    Backend(String),

    #[error("{message}")]
    Unknown {
        message: String,
        /// Type name of the originating error, when one exists.
        exception_class: Option<String>,
    },
}

impl Error {
    /// Map this error onto the observable [`ErrorKind`] taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Io,
            Self::Json(_) => ErrorKind::Validation,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Permission(_) => ErrorKind::Permission,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::SandboxDenied(_) => ErrorKind::SandboxDenied,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::HumanRequired(_) => ErrorKind::HumanRequired,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Budget(_) => ErrorKind::Budget,
            Self::Config(_) => ErrorKind::ConfigError,
            Self::ContextLengthExceeded => ErrorKind::ContextLengthExceeded,
            Self::Backend(_) => ErrorKind::Unknown,
            Self::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    /// Wrap an arbitrary error as `Unknown`, recording its type name.
    pub fn unknown<E: std::error::Error>(err: &E) -> Self {
        Self::Unknown {
            message: err.to_string(),
            exception_class: Some(std::any::type_name::<E>().to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_wire_strings() {
        assert_eq!(ErrorKind::SandboxDenied.as_str(), "sandbox_denied");
        assert_eq!(ErrorKind::ContextLengthExceeded.to_string(), "context_length_exceeded");
        assert_eq!(
            serde_json::to_value(ErrorKind::ConfigError).unwrap(),
            serde_json::json!("config_error")
        );
    }

    #[test]
    fn error_kind_round_trips_through_serde() {
        for kind in [
            ErrorKind::Validation,
            ErrorKind::Permission,
            ErrorKind::NotFound,
            ErrorKind::SandboxDenied,
            ErrorKind::Timeout,
            ErrorKind::HumanRequired,
            ErrorKind::Cancelled,
            ErrorKind::Budget,
            ErrorKind::Io,
            ErrorKind::ConfigError,
            ErrorKind::ContextLengthExceeded,
            ErrorKind::Unknown,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            let back: ErrorKind = serde_json::from_str(&json).unwrap();
            assert_eq!(back, kind);
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn error_maps_to_kind() {
        assert_eq!(Error::Validation("x".into()).kind(), ErrorKind::Validation);
        assert_eq!(Error::Budget("steps".into()).kind(), ErrorKind::Budget);
        assert_eq!(Error::ContextLengthExceeded.kind(), ErrorKind::ContextLengthExceeded);
        assert_eq!(
            Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "x")).kind(),
            ErrorKind::Io
        );
    }

    #[test]
    fn unknown_records_exception_class() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = Error::unknown(&io);
        match err {
            Error::Unknown { exception_class: Some(class), .. } => {
                assert!(class.contains("io::error") || class.contains("Error"));
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
    }
}
