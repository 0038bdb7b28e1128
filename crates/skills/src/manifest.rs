//! Skill manifests — parsed from `SKILL.md` YAML front-matter.
//!
//! The front-matter is a YAML block delimited by `---` at the top of the
//! file; everything after the closing delimiter is the skill body.
//!
//! ```yaml
//! ---
//! name: ingest-csv
//! description: Load CSV files into the warehouse staging area
//! required_env: [WAREHOUSE_DSN]
//! metadata:
//!   owner: data-platform
//! ---
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Name validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validates a skill or namespace slug: lowercase `[a-z0-9-]`,
/// length 2–64, no leading or trailing hyphen.
pub fn is_valid_slug(name: &str) -> bool {
    let len = name.len();
    if !(2..=64).contains(&len) {
        return false;
    }
    let bytes = name.as_bytes();
    if bytes[0] == b'-' || bytes[len - 1] == b'-' {
        return false;
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SkillManifest
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parsed front-matter from a SKILL.md file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SkillManifest {
    #[serde(default)]
    pub name: Option<String>,
    /// Tells the LLM when this skill is worth injecting.
    #[serde(default)]
    pub description: Option<String>,
    /// Env var *names* the skill's actions expect to find set.
    #[serde(default, alias = "env")]
    pub required_env: Vec<String>,
    /// Free-form operator metadata, carried through to events verbatim.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl SkillManifest {
    /// Fatal problems that make the skill unusable.
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        match &self.name {
            None => errors.push("missing required field: name".into()),
            Some(n) if !is_valid_slug(n) => {
                errors.push(format!("invalid skill name {n:?}: must be a 2-64 char slug"));
            }
            _ => {}
        }
        match &self.description {
            None => errors.push("missing required field: description".into()),
            Some(d) if d.is_empty() => errors.push("description must not be empty".into()),
            _ => {}
        }
        errors
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Front-matter split
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Split a SKILL.md into `(manifest, body)`.
///
/// Returns `(None, full content)` when there is no front-matter block
/// or its YAML does not parse — the caller decides whether that is a
/// skip or an error.
pub fn parse_front_matter(content: &str) -> (Option<SkillManifest>, String) {
    let trimmed = content.trim_start();
    if !trimmed.starts_with("---") {
        return (None, content.to_string());
    }

    let after_open = &trimmed[3..];
    let Some(close_idx) = after_open.find("\n---") else {
        return (None, content.to_string());
    };
    let yaml_str = &after_open[..close_idx];
    let body = after_open[close_idx + 4..].trim_start_matches('\n').to_string();

    match serde_yaml::from_str::<SkillManifest>(yaml_str) {
        Ok(manifest) => (Some(manifest), body),
        Err(e) => {
            tracing::warn!(error = %e, "failed to parse SKILL.md front-matter");
            (None, content.to_string())
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
