//! The OS sandbox seam ("fence").
//!
//! The core never downgrades a `restricted` requirement: if no adapter
//! is installed (or the adapter refuses), the tool call fails with
//! `sandbox_denied`.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sr_domain::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SandboxLevel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SandboxLevel {
    #[default]
    None,
    Restricted,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SandboxAdapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An installed OS confinement mechanism (landlock, seatbelt, …).
/// Implementations live outside the core.
pub trait SandboxAdapter: Send + Sync {
    /// Short name recorded in `data.sandbox.adapter`.
    fn name(&self) -> &str;

    /// Rewrite an argv so the command runs confined to the workspace.
    /// May refuse (e.g. unsupported kernel), which fails the call.
    fn wrap(&self, argv: Vec<String>, workspace_root: &Path) -> Result<Vec<String>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SandboxInfo — the audit record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Attached to every tool result as `data.sandbox`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub requested: SandboxLevel,
    pub effective: SandboxLevel,
    pub adapter: Option<String>,
    pub active: bool,
}

impl SandboxInfo {
    /// No confinement requested or applied.
    pub fn unsandboxed() -> Self {
        Self {
            requested: SandboxLevel::None,
            effective: SandboxLevel::None,
            adapter: None,
            active: false,
        }
    }

    /// `restricted` was required but no adapter could serve it.
    pub fn denied() -> Self {
        Self {
            requested: SandboxLevel::Restricted,
            effective: SandboxLevel::Restricted,
            adapter: None,
            active: false,
        }
    }

    /// `restricted` served by the named adapter.
    pub fn active(adapter: &str) -> Self {
        Self {
            requested: SandboxLevel::Restricted,
            effective: SandboxLevel::Restricted,
            adapter: Some(adapter.to_string()),
            active: true,
        }
    }
}
