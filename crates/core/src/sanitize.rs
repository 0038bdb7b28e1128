//! Request sanitation: the audit-safe projection of tool arguments.
//!
//! Every WAL-writing path and every approval prompt goes through these
//! recipes; there is no way to log "raw args". Secrets, file content,
//! stdin bytes, and patch bodies are replaced by sizes and SHA-256
//! fingerprints; env var *names* survive, values never do.

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};
use sr_tools::{parse_intent, SandboxLevel, SanitizerKind};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Canonical JSON
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Serialize with sorted object keys and no insignificant whitespace.
/// Array order is preserved. Stable across processes and platforms, so
/// approval keys are bit-identical everywhere.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (key, item)) in sorted.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Scalars already have a canonical single form.
        other => out.push_str(&other.to_string()),
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// `sha256(canonical_json({tool, sanitized_request}))`
pub fn approval_key(tool: &str, sanitized_request: &Value) -> String {
    let keyed = serde_json::json!({
        "tool": tool,
        "sanitized_request": sanitized_request,
    });
    sha256_hex(canonical_json(&keyed).as_bytes())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sanitized request
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Sandbox permission names that do not escalate beyond the workspace.
const BASELINE_SANDBOX_PERMISSIONS: &[&str] = &["workspace_read", "workspace_write"];

/// The gate's view of one tool call: the audit-safe request plus the
/// facts the policy tree needs.
#[derive(Debug, Clone)]
pub struct Sanitized {
    pub tool: String,
    pub request: Value,
    pub approval_key: String,
    /// Leading argv word (direct or from intent), for the lists.
    pub leading_word: Option<String>,
    pub is_complex: bool,
    pub sandbox: SandboxLevel,
    pub sandbox_permissions_escalated: bool,
}

/// Apply a tool's sanitation recipe to its raw arguments.
///
/// Recipes are tolerant of malformed arguments (validation happens
/// separately); missing fields simply do not appear in the projection.
pub fn sanitize(tool: &str, kind: SanitizerKind, arguments: &Value) -> Sanitized {
    let mut leading_word = None;
    let mut is_complex = false;

    let request = match kind {
        SanitizerKind::ShellArgv => {
            leading_word = first_string(arguments.get("argv"));
            keep_fields(
                arguments,
                &["argv", "cwd", "timeout_ms", "tty", "sandbox", "sandbox_permissions", "risk"],
                true,
            )
        }
        SanitizerKind::ShellString => {
            let command = arguments
                .get("command")
                .or_else(|| arguments.get("cmd"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            let intent = parse_intent(command);
            leading_word = intent.argv.first().cloned();
            is_complex = intent.is_complex;
            let mut request = keep_fields(
                arguments,
                &["command", "cmd", "workdir", "timeout_ms", "sandbox", "risk"],
                true,
            );
            if let Value::Object(map) = &mut request {
                map.insert("intent".into(), intent.to_value());
            }
            request
        }
        SanitizerKind::WriteStdin => {
            let chars = arguments.get("chars").and_then(Value::as_str).unwrap_or_default();
            let mut request = keep_fields(
                arguments,
                &["session_id", "yield_time_ms", "max_output_tokens", "is_poll"],
                false,
            );
            if let Value::Object(map) = &mut request {
                map.insert("bytes".into(), Value::from(chars.len()));
                map.insert("chars_sha256".into(), Value::from(sha256_hex(chars.as_bytes())));
            }
            request
        }
        SanitizerKind::FileWrite => {
            let content = arguments.get("content").and_then(Value::as_str).unwrap_or_default();
            let mut request =
                keep_fields(arguments, &["path", "create_dirs", "sandbox_permissions"], false);
            if let Value::Object(map) = &mut request {
                map.insert("bytes".into(), Value::from(content.len()));
                map.insert("content_sha256".into(), Value::from(sha256_hex(content.as_bytes())));
            }
            request
        }
        SanitizerKind::ApplyPatch => {
            let patch = arguments.get("patch").and_then(Value::as_str).unwrap_or_default();
            serde_json::json!({
                "bytes": patch.len(),
                "content_sha256": sha256_hex(patch.as_bytes()),
                "best_effort_file_paths": patch_file_paths(patch),
            })
        }
        SanitizerKind::SkillExec => {
            leading_word = first_string(arguments.get("argv"));
            let mut request = keep_fields(
                arguments,
                &["skill_mention", "action_id", "bundle_root", "argv", "timeout_ms", "risk"],
                true,
            );
            if let Value::Object(map) = &mut request {
                if let Some(action) = arguments.get("action").and_then(Value::as_str) {
                    map.insert("action_sha256".into(), Value::from(sha256_hex(action.as_bytes())));
                }
            }
            request
        }
        // Declared secret-free; recorded verbatim.
        SanitizerKind::Passthrough => arguments.clone(),
    };

    let sandbox = match request.get("sandbox").and_then(Value::as_str) {
        Some("restricted") => SandboxLevel::Restricted,
        _ => SandboxLevel::None,
    };
    let sandbox_permissions_escalated = request
        .get("sandbox_permissions")
        .and_then(Value::as_array)
        .map(|permissions| {
            permissions.iter().filter_map(Value::as_str).any(|permission| {
                !BASELINE_SANDBOX_PERMISSIONS.contains(&permission)
            })
        })
        .unwrap_or(false);

    let approval_key = approval_key(tool, &request);
    Sanitized {
        tool: tool.to_string(),
        request,
        approval_key,
        leading_word,
        is_complex,
        sandbox,
        sandbox_permissions_escalated,
    }
}

/// Project the named fields; optionally replace an `env` object by its
/// sorted key list as `env_keys`.
fn keep_fields(arguments: &Value, fields: &[&str], env_keys: bool) -> Value {
    let mut map = serde_json::Map::new();
    if let Some(source) = arguments.as_object() {
        for field in fields {
            if let Some(value) = source.get(*field) {
                map.insert((*field).to_string(), value.clone());
            }
        }
        if env_keys {
            let mut keys: Vec<String> = match source.get("env") {
                Some(Value::Object(env)) => env.keys().cloned().collect(),
                _ => source
                    .get("env_keys")
                    .and_then(Value::as_array)
                    .map(|list| list.iter().filter_map(Value::as_str).map(str::to_string).collect())
                    .unwrap_or_default(),
            };
            keys.sort();
            map.insert("env_keys".into(), serde_json::json!(keys));
        }
    }
    Value::Object(map)
}

fn first_string(value: Option<&Value>) -> Option<String> {
    value?.as_array()?.first()?.as_str().map(str::to_string)
}

/// Pull file paths out of unified-diff headers, best-effort.
fn patch_file_paths(patch: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for line in patch.lines() {
        let candidate = line
            .strip_prefix("+++ ")
            .or_else(|| line.strip_prefix("--- "))
            .or_else(|| line.strip_prefix("*** Update File: "))
            .or_else(|| line.strip_prefix("*** Add File: "))
            .or_else(|| line.strip_prefix("*** Delete File: "));
        if let Some(raw) = candidate {
            let cleaned = raw
                .trim()
                .trim_start_matches("a/")
                .trim_start_matches("b/")
                .to_string();
            if cleaned != "/dev/null" && !cleaned.is_empty() && !paths.contains(&cleaned) {
                paths.push(cleaned);
            }
        }
    }
    paths
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
