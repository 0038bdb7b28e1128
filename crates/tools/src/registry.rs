//! The tool table: `tool_name → {spec, handler, safety descriptor}`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use sr_domain::tool::{ToolDefinition, ToolResult};
use sr_domain::{Error, Result};

use crate::context::ToolExecutionContext;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One tool's execution body. Handlers may suspend (awaiting PTY
/// output, sub-runs); the dispatcher itself never does.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    async fn execute(&self, arguments: Value, ctx: &ToolExecutionContext) -> ToolResult;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Safety descriptor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which sanitation recipe produces this tool's audit-safe request
/// shape. Registering a tool without choosing one is impossible by
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanitizerKind {
    /// `shell_exec`: argv form.
    ShellArgv,
    /// `shell_command` / `exec_command`: shell-string form with intent.
    ShellString,
    /// `write_stdin`: bytes + digest, plaintext dropped.
    WriteStdin,
    /// `file_write`: path + size + digest, content dropped.
    FileWrite,
    /// `apply_patch`: size + digest + best-effort paths, body dropped.
    ApplyPatch,
    /// `skill_exec`: mention + action digest, env values dropped.
    SkillExec,
    /// Anything else: arguments passed through as-is (no secret-bearing
    /// fields by declaration).
    Passthrough,
}

#[derive(Debug, Clone, Copy)]
pub struct SafetyDescriptor {
    /// Ask even under `mode=allow`? (Used by high-risk builtins.)
    pub requires_approval: bool,
    /// Whether the handler honors an acquired sandbox adapter.
    pub wraps_sandbox: bool,
    pub sanitizer: SanitizerKind,
    /// Builtin tools follow the policy tree; custom tools default to
    /// ask under `mode=ask` unless allowlisted.
    pub builtin: bool,
}

impl SafetyDescriptor {
    pub fn builtin(sanitizer: SanitizerKind) -> Self {
        Self { requires_approval: false, wraps_sandbox: false, sanitizer, builtin: true }
    }

    pub fn custom(sanitizer: SanitizerKind) -> Self {
        Self { requires_approval: false, wraps_sandbox: false, sanitizer, builtin: false }
    }

    pub fn with_sandbox(mut self) -> Self {
        self.wraps_sandbox = true;
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ToolEntry {
    pub definition: ToolDefinition,
    pub handler: Arc<dyn ToolHandler>,
    pub safety: SafetyDescriptor,
}

/// Homogeneous table of registered tools. Registration order is
/// preserved for the definitions handed to the LLM.
#[derive(Default)]
pub struct ToolRegistry {
    entries: HashMap<String, ToolEntry>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Duplicate names are rejected unless `override_existing`.
    pub fn register(&mut self, entry: ToolEntry, override_existing: bool) -> Result<()> {
        let name = entry.definition.name.clone();
        if self.entries.contains_key(&name) && !override_existing {
            return Err(Error::Config(format!("tool {name:?} is already registered")));
        }
        if !self.entries.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.entries.insert(name, entry);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ToolEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Definitions in registration order, for the LLM request.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.entries.get(name))
            .map(|entry| entry.definition.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Argument validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Check `arguments` against a tool's JSON-Schema `parameters`.
///
/// Covers the subset our tool specs use: top-level object, `required`
/// names, and per-property `type` (`string`, `integer`, `number`,
/// `boolean`, `array`, `object`).
pub fn validate_arguments(parameters: &Value, arguments: &Value) -> Result<()> {
    let Some(args) = arguments.as_object() else {
        return Err(Error::Validation("tool arguments must be a JSON object".into()));
    };

    if let Some(required) = parameters.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !args.contains_key(name) {
                return Err(Error::Validation(format!("missing required argument {name:?}")));
            }
        }
    }

    if let Some(properties) = parameters.get("properties").and_then(Value::as_object) {
        for (name, value) in args {
            let Some(spec) = properties.get(name) else {
                continue; // unknown keys pass through for forward compat
            };
            let Some(expected) = spec.get("type").and_then(Value::as_str) else {
                continue;
            };
            let ok = match expected {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok {
                return Err(Error::Validation(format!(
                    "argument {name:?} must be of type {expected}"
                )));
            }
        }
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHandler;

    #[async_trait::async_trait]
    impl ToolHandler for NullHandler {
        async fn execute(&self, _arguments: Value, _ctx: &ToolExecutionContext) -> ToolResult {
            ToolResult::success("")
        }
    }

    fn entry(name: &str) -> ToolEntry {
        ToolEntry {
            definition: ToolDefinition {
                name: name.into(),
                description: "test tool".into(),
                parameters: serde_json::json!({"type": "object", "properties": {}}),
            },
            handler: Arc::new(NullHandler),
            safety: SafetyDescriptor::builtin(SanitizerKind::Passthrough),
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(entry("shell_exec"), false).unwrap();
        assert!(registry.contains("shell_exec"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_rejected_without_override() {
        let mut registry = ToolRegistry::new();
        registry.register(entry("dup"), false).unwrap();
        let err = registry.register(entry("dup"), false).unwrap_err();
        assert_eq!(err.kind(), sr_domain::ErrorKind::ConfigError);

        // With override it replaces in place.
        registry.register(entry("dup"), true).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn definitions_keep_registration_order() {
        let mut registry = ToolRegistry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry.register(entry(name), false).unwrap();
        }
        let names: Vec<_> = registry.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    fn shell_schema() -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "argv": { "type": "array" },
                "cwd": { "type": "string" },
                "timeout_ms": { "type": "integer" }
            },
            "required": ["argv"]
        })
    }

    #[test]
    fn validate_accepts_good_arguments() {
        let args = serde_json::json!({"argv": ["ls", "-l"], "timeout_ms": 500});
        assert!(validate_arguments(&shell_schema(), &args).is_ok());
    }

    #[test]
    fn validate_rejects_missing_required() {
        let err = validate_arguments(&shell_schema(), &serde_json::json!({"cwd": "."})).unwrap_err();
        assert_eq!(err.kind(), sr_domain::ErrorKind::Validation);
    }

    #[test]
    fn validate_rejects_wrong_type() {
        let args = serde_json::json!({"argv": "not an array"});
        let err = validate_arguments(&shell_schema(), &args).unwrap_err();
        assert_eq!(err.kind(), sr_domain::ErrorKind::Validation);
    }

    #[test]
    fn validate_rejects_non_object_arguments() {
        let err = validate_arguments(&shell_schema(), &serde_json::json!("just a string")).unwrap_err();
        assert_eq!(err.kind(), sr_domain::ErrorKind::Validation);
    }

    #[test]
    fn validate_allows_unknown_keys() {
        let args = serde_json::json!({"argv": ["ls"], "future_flag": true});
        assert!(validate_arguments(&shell_schema(), &args).is_ok());
    }
}
