//! Config bootstrap: defaults ← YAML overlays ← environment ←
//! programmatic injection, with a sources map recording where every
//! effective leaf came from.
//!
//! Merge rule: deep-merge for maps, whole-list replacement. The
//! programmatic layer is whitelisted to the keys embedders may
//! reasonably override at run construction.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use sr_domain::config::RuntimeConfig;
use sr_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The whitelisted programmatic overrides.
#[derive(Debug, Clone, Default)]
pub struct ProgrammaticOverrides {
    pub planner_model: Option<String>,
    pub executor_model: Option<String>,
    pub llm_base_url: Option<String>,
    pub llm_api_key_env: Option<String>,
}

/// Environment variables the bootstrap understands, with their target
/// leaves.
const ENV_BINDINGS: &[(&str, &str, LeafKind)] = &[
    ("SR_SAFETY_MODE", "/safety/mode", LeafKind::String),
    ("SR_RUN_MAX_STEPS", "/run/max_steps", LeafKind::Integer),
    ("SR_RUN_MAX_WALL_TIME_SEC", "/run/max_wall_time_sec", LeafKind::Integer),
    ("SR_SKILLS_REFRESH", "/skills/refresh", LeafKind::String),
    ("SR_LLM_PLANNER_MODEL", "/llm/planner_model", LeafKind::String),
    ("SR_LLM_EXECUTOR_MODEL", "/llm/executor_model", LeafKind::String),
    ("SR_LLM_BASE_URL", "/llm/base_url", LeafKind::String),
    ("SR_LLM_API_KEY_ENV", "/llm/api_key_env", LeafKind::String),
];

#[derive(Debug, Clone, Copy)]
enum LeafKind {
    String,
    Integer,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Output
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
pub struct LoadedConfig {
    pub config: RuntimeConfig,
    /// Leaf JSON-pointer → origin (`default`, `overlay:<path>`,
    /// `env:<VAR>`, `programmatic`).
    pub sources: BTreeMap<String, String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Load
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Assemble the effective config for a workspace.
///
/// Overlays are `<workspace>/config/runtime.yaml` followed by
/// `extra_overlays` in order (later wins).
pub fn load(
    workspace_root: &Path,
    extra_overlays: &[PathBuf],
    overrides: &ProgrammaticOverrides,
) -> Result<LoadedConfig> {
    let mut merged = serde_json::to_value(RuntimeConfig::default())?;
    let mut sources = BTreeMap::new();
    record_leaves(&merged, "", "default", &mut sources);

    // ── YAML overlays ─────────────────────────────────────────────
    let mut overlay_paths = vec![workspace_root.join("config").join("runtime.yaml")];
    overlay_paths.extend(extra_overlays.iter().cloned());
    for path in &overlay_paths {
        if !path.exists() {
            continue;
        }
        let text = std::fs::read_to_string(path)?;
        let overlay: Value = serde_yaml::from_str::<serde_yaml::Value>(&text)
            .map_err(|e| Error::Config(format!("invalid overlay {}: {e}", path.display())))
            .and_then(|yaml| {
                serde_json::to_value(yaml)
                    .map_err(|e| Error::Config(format!("invalid overlay {}: {e}", path.display())))
            })?;
        let origin = format!("overlay:{}", path.display());
        deep_merge(&mut merged, &overlay, "", &origin, &mut sources);
    }

    // ── Environment ───────────────────────────────────────────────
    for (var, pointer, kind) in ENV_BINDINGS {
        let Ok(raw) = std::env::var(var) else { continue };
        let value = match kind {
            LeafKind::String => Value::String(raw),
            LeafKind::Integer => Value::from(raw.parse::<u64>().map_err(|_| {
                Error::Config(format!("env {var} must be an integer, got {raw:?}"))
            })?),
        };
        set_pointer(&mut merged, pointer, value)?;
        sources.insert((*pointer).to_string(), format!("env:{var}"));
    }

    // ── Programmatic (whitelisted) ────────────────────────────────
    let programmatic: &[(&str, &Option<String>)] = &[
        ("/llm/planner_model", &overrides.planner_model),
        ("/llm/executor_model", &overrides.executor_model),
        ("/llm/base_url", &overrides.llm_base_url),
        ("/llm/api_key_env", &overrides.llm_api_key_env),
    ];
    for (pointer, value) in programmatic {
        if let Some(value) = value {
            set_pointer(&mut merged, pointer, Value::String(value.clone()))?;
            sources.insert((*pointer).to_string(), "programmatic".into());
        }
    }

    let config: RuntimeConfig = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("effective config is invalid: {e}")))?;
    Ok(LoadedConfig { config, sources })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Merge machinery
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Deep-merge maps; anything else (lists included) replaces whole.
fn deep_merge(
    base: &mut Value,
    overlay: &Value,
    pointer: &str,
    origin: &str,
    sources: &mut BTreeMap<String, String>,
) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let child_pointer = format!("{pointer}/{key}");
                match base_map.get_mut(key) {
                    Some(base_value) if base_value.is_object() && overlay_value.is_object() => {
                        deep_merge(base_value, overlay_value, &child_pointer, origin, sources);
                    }
                    Some(base_value) => {
                        *base_value = overlay_value.clone();
                        record_leaves(overlay_value, &child_pointer, origin, sources);
                    }
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                        record_leaves(overlay_value, &child_pointer, origin, sources);
                    }
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
            record_leaves(overlay, pointer, origin, sources);
        }
    }
}

/// Record an origin for every scalar/list leaf under `value`.
fn record_leaves(value: &Value, pointer: &str, origin: &str, sources: &mut BTreeMap<String, String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                record_leaves(child, &format!("{pointer}/{key}"), origin, sources);
            }
            if map.is_empty() {
                sources.insert(pointer.to_string(), origin.to_string());
            }
        }
        _ => {
            sources.insert(pointer.to_string(), origin.to_string());
        }
    }
}

fn set_pointer(root: &mut Value, pointer: &str, value: Value) -> Result<()> {
    let mut current = root;
    let parts: Vec<&str> = pointer.trim_start_matches('/').split('/').collect();
    for (i, part) in parts.iter().enumerate() {
        let map = current
            .as_object_mut()
            .ok_or_else(|| Error::Config(format!("cannot set {pointer}: not an object")))?;
        if i == parts.len() - 1 {
            map.insert((*part).to_string(), value);
            return Ok(());
        }
        current = map
            .entry((*part).to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
