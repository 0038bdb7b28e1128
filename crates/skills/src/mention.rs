//! Mention tokens: `$[<ns1>[:<ns2>…]].<skill_name>`.
//!
//! Namespaces are ordered chains of 1–7 slug segments; `a:b` and `b:a`
//! are different skills. Free-text extraction is lenient (invalid
//! fragments are ignored); tool-argument validation is strict (the
//! whole string must be one token).

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use sr_domain::{Error, Result};

/// Slug: lowercase `[a-z0-9-]`, 2–64 chars, no leading/trailing hyphen.
const SLUG: &str = "[a-z0-9][a-z0-9-]{0,62}[a-z0-9]";

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let pattern = format!(r"\$\[({SLUG}(?::{SLUG}){{0,6}})\]\.({SLUG})");
        Regex::new(&pattern).expect("mention regex is valid")
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SkillRef
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A resolved mention: the ordered namespace chain plus the skill name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SkillRef {
    pub namespace: Vec<String>,
    pub name: String,
}

impl SkillRef {
    /// The namespace chain as its configuration key, e.g. `"team:data"`.
    pub fn space_key(&self) -> String {
        self.namespace.join(":")
    }
}

impl fmt::Display for SkillRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "$[{}].{}", self.space_key(), self.name)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl SkillRef {
    /// Strict parse: the entire input must be exactly one token.
    pub fn parse_strict(input: &str) -> Result<Self> {
        let captures = token_regex()
            .captures(input)
            .filter(|c| {
                let m = c.get(0).map(|m| (m.start(), m.end()));
                m == Some((0, input.len()))
            })
            .ok_or_else(|| Error::Validation(format!("invalid skill mention: {input:?}")))?;

        Ok(Self {
            namespace: captures[1].split(':').map(str::to_string).collect(),
            name: captures[2].to_string(),
        })
    }
}

/// Lenient extraction from free text: every well-formed token, in
/// appearance order, duplicates included. Malformed fragments are
/// skipped without complaint.
pub fn extract_mentions(text: &str) -> Vec<SkillRef> {
    token_regex()
        .captures_iter(text)
        .map(|captures| SkillRef {
            namespace: captures[1].split(':').map(str::to_string).collect(),
            name: captures[2].to_string(),
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
