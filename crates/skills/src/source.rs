//! Skill sources — where skill metadata and bodies come from.
//!
//! A scan never reads bodies or bundles; it returns metadata only.
//! Bodies are fetched lazily through [`SkillsSource::load_body`] and
//! loader errors fail the injection closed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sr_domain::{Error, Result};

use crate::manifest;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SkillMeta
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Metadata for one skill as discovered by a scan.
#[derive(Debug, Clone, Serialize)]
pub struct SkillMeta {
    /// Ordered namespace chain of the space that owns this skill.
    pub namespace: Vec<String>,
    pub name: String,
    pub description: String,
    pub required_env: Vec<String>,
    pub metadata: serde_json::Value,
    /// Where the body lives, in source-specific terms (a path here).
    pub origin: String,
}

impl SkillMeta {
    pub fn space_key(&self) -> String {
        self.namespace.join(":")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SkillsSource trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One backing store of skills for a namespace. Filesystem ships here;
/// Redis/SQL implementations live outside the core behind this trait.
pub trait SkillsSource: Send + Sync {
    /// Enumerate skill metadata. MUST NOT read bodies.
    fn scan(&self, namespace: &[String]) -> Result<Vec<SkillMeta>>;

    /// Fetch one skill's body bytes on demand.
    fn load_body(&self, meta: &SkillMeta) -> Result<String>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Filesystem source
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Scans a directory tree for files literally named `SKILL.md` and
/// parses their front-matter. The body stays on disk until asked for.
pub struct FsSource {
    root: PathBuf,
}

impl FsSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl SkillsSource for FsSource {
    fn scan(&self, namespace: &[String]) -> Result<Vec<SkillMeta>> {
        let mut found = Vec::new();
        if !self.root.exists() {
            return Ok(found);
        }
        walk_for_skill_md(&self.root, &mut |path| {
            let content = std::fs::read_to_string(path)?;
            let (parsed, _body) = manifest::parse_front_matter(&content);
            let Some(m) = parsed else {
                tracing::warn!(path = %path.display(), "SKILL.md has no usable front-matter, skipping");
                return Ok(());
            };
            let errors = m.validation_errors();
            if !errors.is_empty() {
                tracing::warn!(path = %path.display(), errors = ?errors, "skipping invalid skill");
                return Ok(());
            }
            found.push(SkillMeta {
                namespace: namespace.to_vec(),
                name: m.name.unwrap_or_default(),
                description: m.description.unwrap_or_default(),
                required_env: m.required_env,
                metadata: serde_json::to_value(m.metadata)?,
                origin: path.display().to_string(),
            });
            Ok(())
        })?;
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    fn load_body(&self, meta: &SkillMeta) -> Result<String> {
        let path = Path::new(&meta.origin);
        if !path.starts_with(&self.root) {
            return Err(Error::Permission(format!(
                "skill origin {} escapes source root",
                meta.origin
            )));
        }
        let content = std::fs::read_to_string(path)?;
        let (_, body) = manifest::parse_front_matter(&content);
        Ok(body)
    }
}

fn walk_for_skill_md(
    dir: &Path,
    visit: &mut dyn FnMut(&Path) -> Result<()>,
) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk_for_skill_md(&path, visit)?;
        } else if path.file_name().is_some_and(|n| n == "SKILL.md") {
            visit(&path)?;
        }
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory source
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Source backed by a map, for tests and embedders.
#[derive(Default)]
pub struct MemorySource {
    skills: HashMap<String, (SkillMeta, String)>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a skill; the namespace is stamped at scan time.
    pub fn insert(
        mut self,
        name: &str,
        description: &str,
        body: &str,
    ) -> Self {
        let meta = SkillMeta {
            namespace: Vec::new(),
            name: name.to_string(),
            description: description.to_string(),
            required_env: Vec::new(),
            metadata: serde_json::Value::Null,
            origin: format!("mem:{name}"),
        };
        self.skills.insert(name.to_string(), (meta, body.to_string()));
        self
    }
}

impl SkillsSource for MemorySource {
    fn scan(&self, namespace: &[String]) -> Result<Vec<SkillMeta>> {
        let mut found: Vec<SkillMeta> = self
            .skills
            .values()
            .map(|(meta, _)| {
                let mut meta = meta.clone();
                meta.namespace = namespace.to_vec();
                meta
            })
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    fn load_body(&self, meta: &SkillMeta) -> Result<String> {
        self.skills
            .get(&meta.name)
            .map(|(_, body)| body.clone())
            .ok_or_else(|| Error::NotFound(format!("skill body for {:?}", meta.name)))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_skill(dir: &Path, rel: &str, name: &str, description: &str) {
        let skill_dir = dir.join(rel);
        fs::create_dir_all(&skill_dir).unwrap();
        fs::write(
            skill_dir.join("SKILL.md"),
            format!("---\nname: {name}\ndescription: {description}\n---\nBody of {name}\n"),
        )
        .unwrap();
    }

    #[test]
    fn fs_scan_finds_nested_skills() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "a", "alpha-skill", "first");
        write_skill(dir.path(), "deep/nested/b", "beta-skill", "second");

        let source = FsSource::new(dir.path());
        let namespace = vec!["team".to_string()];
        let found = source.scan(&namespace).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].name, "alpha-skill");
        assert_eq!(found[1].name, "beta-skill");
        assert!(found.iter().all(|m| m.namespace == namespace));
    }

    #[test]
    fn fs_scan_skips_invalid_manifests() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "good", "good-skill", "fine");
        let bad_dir = dir.path().join("bad");
        fs::create_dir_all(&bad_dir).unwrap();
        fs::write(bad_dir.join("SKILL.md"), "no front matter here").unwrap();

        let found = FsSource::new(dir.path()).scan(&["ns".into()]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "good-skill");
    }

    #[test]
    fn fs_scan_missing_root_is_empty() {
        let found = FsSource::new("/nonexistent/skills/root")
            .scan(&["ns".into()])
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn fs_body_loads_without_front_matter() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "a", "alpha-skill", "first");

        let source = FsSource::new(dir.path());
        let found = source.scan(&["ns".into()]).unwrap();
        let body = source.load_body(&found[0]).unwrap();
        assert_eq!(body.trim(), "Body of alpha-skill");
        assert!(!body.contains("---"));
    }

    #[test]
    fn fs_body_rejects_foreign_origin() {
        let dir = tempfile::tempdir().unwrap();
        let source = FsSource::new(dir.path().join("skills"));
        let meta = SkillMeta {
            namespace: vec!["ns".into()],
            name: "evil".into(),
            description: String::new(),
            required_env: Vec::new(),
            metadata: serde_json::Value::Null,
            origin: "/etc/passwd".into(),
        };
        let err = source.load_body(&meta).unwrap_err();
        assert_eq!(err.kind(), sr_domain::ErrorKind::Permission);
    }

    #[test]
    fn memory_source_round_trip() {
        let source = MemorySource::new().insert("lint", "run the linter", "lint body");
        let found = source.scan(&["tools".into()]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].space_key(), "tools");
        assert_eq!(source.load_body(&found[0]).unwrap(), "lint body");
    }

    #[test]
    fn memory_source_unknown_body_is_not_found() {
        let source = MemorySource::new();
        let meta = SkillMeta {
            namespace: vec![],
            name: "ghost".into(),
            description: String::new(),
            required_env: vec![],
            metadata: serde_json::Value::Null,
            origin: "mem:ghost".into(),
        };
        assert_eq!(
            source.load_body(&meta).unwrap_err().kind(),
            sr_domain::ErrorKind::NotFound
        );
    }
}
