//! The skills manager: configured spaces, the scan cache, and lookups.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use sr_domain::config::{RefreshPolicy, SkillsConfig};
use sr_domain::{Error, Result};

use crate::mention::SkillRef;
use crate::source::{FsSource, SkillMeta, SkillsSource};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Space {
    namespace: Vec<String>,
    sources: Vec<Arc<dyn SkillsSource>>,
}

#[derive(Clone)]
struct CachedSkill {
    meta: SkillMeta,
    source: Arc<dyn SkillsSource>,
}

struct ScanCache {
    scanned_at: Instant,
    /// `(space_key, skill_name)` → skill + owning source.
    by_key: HashMap<(String, String), CachedSkill>,
}

/// Per-process skills manager. Scans are metadata-only and cached per
/// the configured refresh policy; bodies load lazily through the
/// owning source.
pub struct SkillsManager {
    spaces: HashMap<String, Space>,
    refresh: RefreshPolicy,
    cache: RwLock<Option<ScanCache>>,
}

impl SkillsManager {
    /// Build from config: each configured space gets one filesystem
    /// source per path.
    pub fn from_config(config: &SkillsConfig) -> Self {
        let mut manager = Self::empty(config.refresh);
        for (space_key, space_config) in &config.spaces {
            for path in &space_config.paths {
                manager.add_source(space_key, Arc::new(FsSource::new(path)));
            }
        }
        manager
    }

    pub fn empty(refresh: RefreshPolicy) -> Self {
        Self {
            spaces: HashMap::new(),
            refresh,
            cache: RwLock::new(None),
        }
    }

    /// Attach a source (filesystem, in-memory, remote adapter) to a
    /// space. Creates the space if needed; invalidates the cache.
    pub fn add_source(&mut self, space_key: &str, source: Arc<dyn SkillsSource>) {
        let space = self.spaces.entry(space_key.to_string()).or_insert_with(|| Space {
            namespace: space_key.split(':').map(str::to_string).collect(),
            sources: Vec::new(),
        });
        space.sources.push(source);
        *self.cache.write() = None;
    }

    pub fn has_space(&self, space_key: &str) -> bool {
        self.spaces.contains_key(space_key)
    }

    /// Force a rescan of every configured space.
    pub fn rescan(&self) -> Result<usize> {
        let mut by_key = HashMap::new();
        for (space_key, space) in &self.spaces {
            for source in &space.sources {
                for meta in source.scan(&space.namespace)? {
                    // First source registered for a space wins on collision.
                    by_key
                        .entry((space_key.clone(), meta.name.clone()))
                        .or_insert_with(|| CachedSkill { meta, source: Arc::clone(source) });
                }
            }
        }
        let count = by_key.len();
        *self.cache.write() = Some(ScanCache { scanned_at: Instant::now(), by_key });
        tracing::debug!(skills = count, "skills scan complete");
        Ok(count)
    }

    fn ensure_fresh(&self) -> Result<()> {
        let stale = {
            let cache = self.cache.read();
            match (&*cache, self.refresh) {
                (None, _) => true,
                (Some(_), RefreshPolicy::Always) => true,
                (Some(c), RefreshPolicy::Ttl(secs)) => {
                    c.scanned_at.elapsed() > Duration::from_secs(secs)
                }
                (Some(_), RefreshPolicy::Manual) => false,
            }
        };
        if stale {
            self.rescan()?;
        }
        Ok(())
    }

    /// Resolve a mention to its metadata.
    ///
    /// An unconfigured namespace is a configuration error; a configured
    /// namespace without the named skill is not-found.
    pub fn resolve(&self, skill: &SkillRef) -> Result<SkillMeta> {
        let space_key = skill.space_key();
        if !self.spaces.contains_key(&space_key) {
            return Err(Error::Config(format!(
                "skill namespace {space_key:?} is not configured"
            )));
        }
        self.ensure_fresh()?;
        let cache = self.cache.read();
        let cache = cache.as_ref().ok_or_else(|| Error::Config("skills cache empty".into()))?;
        cache
            .by_key
            .get(&(space_key.clone(), skill.name.clone()))
            .map(|c| c.meta.clone())
            .ok_or_else(|| Error::NotFound(format!("skill {skill} is not in namespace {space_key:?}")))
    }

    /// Load a skill body through its owning source. Loader failures are
    /// returned as-is; the injection fails closed.
    pub fn load_body(&self, skill: &SkillRef) -> Result<String> {
        let space_key = skill.space_key();
        if !self.spaces.contains_key(&space_key) {
            return Err(Error::Config(format!(
                "skill namespace {space_key:?} is not configured"
            )));
        }
        self.ensure_fresh()?;
        let cached = {
            let cache = self.cache.read();
            let cache = cache.as_ref().ok_or_else(|| Error::Config("skills cache empty".into()))?;
            cache
                .by_key
                .get(&(space_key.clone(), skill.name.clone()))
                .cloned()
                .ok_or_else(|| {
                    Error::NotFound(format!("skill {skill} is not in namespace {space_key:?}"))
                })?
        };
        cached.source.load_body(&cached.meta)
    }

    /// Everything known, sorted by `(space, name)`. Used by the prompt
    /// manager's skills index.
    pub fn list(&self) -> Result<Vec<SkillMeta>> {
        self.ensure_fresh()?;
        let cache = self.cache.read();
        let mut all: Vec<SkillMeta> = cache
            .as_ref()
            .map(|c| c.by_key.values().map(|s| s.meta.clone()).collect())
            .unwrap_or_default();
        all.sort_by(|a, b| (a.space_key(), &a.name).cmp(&(b.space_key(), &b.name)));
        Ok(all)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;

    fn manager_with(space: &str, source: MemorySource) -> SkillsManager {
        let mut manager = SkillsManager::empty(RefreshPolicy::Manual);
        manager.add_source(space, Arc::new(source));
        manager
    }

    fn skill(token: &str) -> SkillRef {
        SkillRef::parse_strict(token).unwrap()
    }

    #[test]
    fn resolve_known_skill() {
        let manager = manager_with("team", MemorySource::new().insert("lint", "lints", "body"));
        let meta = manager.resolve(&skill("$[team].lint")).unwrap();
        assert_eq!(meta.name, "lint");
        assert_eq!(meta.space_key(), "team");
    }

    #[test]
    fn unknown_namespace_is_config_error() {
        let manager = manager_with("team", MemorySource::new());
        let err = manager.resolve(&skill("$[ghost].lint")).unwrap_err();
        assert_eq!(err.kind(), sr_domain::ErrorKind::ConfigError);
    }

    #[test]
    fn known_namespace_unknown_skill_is_not_found() {
        let manager = manager_with("team", MemorySource::new().insert("lint", "lints", "body"));
        let err = manager.resolve(&skill("$[team].missing")).unwrap_err();
        assert_eq!(err.kind(), sr_domain::ErrorKind::NotFound);
    }

    #[test]
    fn namespaces_are_ordered() {
        let mut manager = SkillsManager::empty(RefreshPolicy::Manual);
        manager.add_source("aa:bb", Arc::new(MemorySource::new().insert("tool", "t", "ab body")));
        manager.add_source("bb:aa", Arc::new(MemorySource::new().insert("tool", "t", "ba body")));

        assert_eq!(manager.load_body(&skill("$[aa:bb].tool")).unwrap(), "ab body");
        assert_eq!(manager.load_body(&skill("$[bb:aa].tool")).unwrap(), "ba body");
    }

    #[test]
    fn first_source_wins_on_collision() {
        let mut manager = SkillsManager::empty(RefreshPolicy::Manual);
        manager.add_source("team", Arc::new(MemorySource::new().insert("lint", "first", "one")));
        manager.add_source("team", Arc::new(MemorySource::new().insert("lint", "second", "two")));

        let meta = manager.resolve(&skill("$[team].lint")).unwrap();
        assert_eq!(meta.description, "first");
        assert_eq!(manager.load_body(&skill("$[team].lint")).unwrap(), "one");
    }

    #[test]
    fn manual_policy_serves_stale_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = SkillsManager::empty(RefreshPolicy::Manual);
        manager.add_source("fs", Arc::new(FsSource::new(dir.path())));

        assert!(manager.list().unwrap().is_empty());

        // A skill appears on disk after the first scan.
        let skill_dir = dir.path().join("late");
        std::fs::create_dir_all(&skill_dir).unwrap();
        std::fs::write(
            skill_dir.join("SKILL.md"),
            "---\nname: late-skill\ndescription: arrived late\n---\nbody\n",
        )
        .unwrap();

        // Manual: still invisible until an explicit rescan.
        assert!(manager.list().unwrap().is_empty());
        manager.rescan().unwrap();
        assert_eq!(manager.list().unwrap().len(), 1);
    }

    #[test]
    fn always_policy_sees_new_skills_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = SkillsManager::empty(RefreshPolicy::Always);
        manager.add_source("fs", Arc::new(FsSource::new(dir.path())));
        assert!(manager.list().unwrap().is_empty());

        let skill_dir = dir.path().join("new");
        std::fs::create_dir_all(&skill_dir).unwrap();
        std::fs::write(
            skill_dir.join("SKILL.md"),
            "---\nname: new-skill\ndescription: just added\n---\nbody\n",
        )
        .unwrap();

        assert_eq!(manager.list().unwrap().len(), 1);
    }

    #[test]
    fn list_sorted_by_space_then_name() {
        let mut manager = SkillsManager::empty(RefreshPolicy::Manual);
        manager.add_source("zz", Arc::new(MemorySource::new().insert("aa-tool", "d", "b")));
        manager.add_source("aa", Arc::new(MemorySource::new().insert("zz-tool", "d", "b")));
        manager.add_source("aa", Arc::new(MemorySource::new().insert("bb-tool", "d", "b")));

        let all = manager.list().unwrap();
        let keys: Vec<_> = all.iter().map(|m| format!("{}/{}", m.space_key(), m.name)).collect();
        assert_eq!(keys, vec!["aa/bb-tool", "aa/zz-tool", "zz/aa-tool"]);
    }

    #[test]
    fn from_config_builds_fs_spaces() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            "spaces:\n  personal:\n    paths: [{:?}]\nrefresh: always\n",
            dir.path().display().to_string()
        );
        let config: SkillsConfig = serde_yaml::from_str(&yaml).unwrap();
        let manager = SkillsManager::from_config(&config);
        assert!(manager.has_space("personal"));
        assert!(!manager.has_space("other"));
    }
}
