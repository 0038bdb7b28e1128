//! Runtime configuration tree with serde defaults.
//!
//! Every section deserializes from YAML/JSON with sensible defaults so
//! a partial overlay file only needs to name the leaves it changes.
//! Discovery, overlay merging, and env/programmatic layering live in
//! the core bootstrap; this module is just the shape.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub run: RunBudgetConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub context_recovery: ContextRecoveryConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub exec: ExecConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workspace
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Root directory all tool path arguments must resolve under.
    #[serde(default = "d_ws_root")]
    pub root: PathBuf,
    /// Name of the per-workspace state directory under `root`.
    #[serde(default = "d_runtime_dir")]
    pub runtime_dir: String,
}

impl WorkspaceConfig {
    /// `<root>/<runtime_dir>` — WALs, server state, artifacts.
    pub fn runtime_path(&self) -> PathBuf {
        self.root.join(&self.runtime_dir)
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self { root: d_ws_root(), runtime_dir: d_runtime_dir() }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run budgets
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunBudgetConfig {
    /// Each LLM request or tool call counts as one step.
    #[serde(default = "d_64")]
    pub max_steps: u32,
    /// Monotonic deadline measured from `run_started`.
    #[serde(default = "d_600")]
    pub max_wall_time_sec: u64,
    /// Steps added when the user chooses "increase budget".
    #[serde(default = "d_16")]
    pub step_increment: u32,
    /// Wall seconds added when the user chooses "increase budget".
    #[serde(default = "d_120")]
    pub wall_time_increment_sec: u64,
}

impl Default for RunBudgetConfig {
    fn default() -> Self {
        Self {
            max_steps: 64,
            max_wall_time_sec: 600,
            step_increment: 16,
            wall_time_increment_sec: 120,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Safety
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SafetyMode {
    Allow,
    #[default]
    Ask,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default)]
    pub mode: SafetyMode,
    /// Leading argv words that may run without asking.
    #[serde(default)]
    pub allowlist: Vec<String>,
    /// Leading argv words that never run. Wins over the allowlist.
    #[serde(default)]
    pub denylist: Vec<String>,
    /// Custom tool names exempt from the ask-by-default rule.
    #[serde(default)]
    pub tool_allowlist: Vec<String>,
    /// How long an approval provider may deliberate before the request
    /// counts as denied.
    #[serde(default = "d_120_000")]
    pub approval_timeout_ms: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            mode: SafetyMode::Ask,
            allowlist: Vec::new(),
            denylist: Vec::new(),
            tool_allowlist: Vec::new(),
            approval_timeout_ms: 120_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Skills
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SkillsConfig {
    /// Namespace → where its skills live. The key is the full ordered
    /// namespace chain, e.g. `"team:data"`.
    #[serde(default)]
    pub spaces: HashMap<String, SkillSpaceConfig>,
    #[serde(default)]
    pub injection: InjectionConfig,
    /// `always` | `manual` | `ttl:<seconds>`
    #[serde(default)]
    pub refresh: RefreshPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SkillSpaceConfig {
    /// Filesystem roots scanned recursively for `SKILL.md` files.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectionConfig {
    /// Budget across all injected skill bodies in one prompt.
    #[serde(default = "d_49152")]
    pub max_bytes: usize,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self { max_bytes: 49_152 }
    }
}

/// When the skills scan cache is refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshPolicy {
    /// Rescan on every call.
    Always,
    /// Rescan when the cache is older than the TTL (seconds).
    Ttl(u64),
    /// Never rescan implicitly.
    #[default]
    Manual,
}

impl RefreshPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "always" => Some(Self::Always),
            "manual" => Some(Self::Manual),
            _ => {
                let secs = s.strip_prefix("ttl:")?;
                secs.parse().ok().map(Self::Ttl)
            }
        }
    }

    pub fn as_string(&self) -> String {
        match self {
            Self::Always => "always".into(),
            Self::Manual => "manual".into(),
            Self::Ttl(secs) => format!("ttl:{secs}"),
        }
    }
}

impl Serialize for RefreshPolicy {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_string())
    }
}

impl<'de> Deserialize<'de> for RefreshPolicy {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid refresh policy: {s:?}")))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// History window
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "d_64us")]
    pub max_messages: usize,
    #[serde(default = "d_120_000us")]
    pub max_chars: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { max_messages: 64, max_chars: 120_000 }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context recovery
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    FailFast,
    #[default]
    CompactFirst,
    AskFirst,
}

/// Fallback when `ask_first` finds no HumanIO provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryFallback {
    FailFast,
    #[default]
    CompactFirst,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRecoveryConfig {
    #[serde(default)]
    pub mode: RecoveryMode,
    #[serde(default = "d_2")]
    pub max_compactions_per_run: u32,
    /// Transcript chars fed to one compaction turn.
    #[serde(default = "d_60_000us")]
    pub compaction_history_max_chars: usize,
    /// Original messages kept verbatim after a compaction.
    #[serde(default = "d_6us")]
    pub compaction_keep_last_messages: usize,
    #[serde(default)]
    pub ask_first_fallback_mode: RecoveryFallback,
}

impl Default for ContextRecoveryConfig {
    fn default() -> Self {
        Self {
            mode: RecoveryMode::CompactFirst,
            max_compactions_per_run: 2,
            compaction_history_max_chars: 60_000,
            compaction_keep_last_messages: 6,
            ask_first_fallback_mode: RecoveryFallback::CompactFirst,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prompt
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    #[serde(default = "d_system_template")]
    pub system_template: String,
    /// Extra policy text merged into the system message.
    #[serde(default)]
    pub developer_policy: Option<String>,
    /// Enumerate known skills (name + description) in the system message.
    #[serde(default = "d_true")]
    pub include_skills_index: bool,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system_template: d_system_template(),
            developer_policy: None,
            include_skills_index: true,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Exec tool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Hard per-command timeout.
    #[serde(default = "d_120_000")]
    pub timeout_ms: u64,
    /// Default interactive-session poll window.
    #[serde(default = "d_2_000")]
    pub yield_time_ms: u64,
    /// Combined output cap per command / session buffer.
    #[serde(default = "d_200_000us")]
    pub max_output_chars: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self { timeout_ms: 120_000, yield_time_ms: 2_000, max_output_chars: 200_000 }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server exits after this long with no sessions or children.
    #[serde(default = "d_300")]
    pub idle_timeout_sec: u64,
    /// Grace period the client waits for a freshly spawned server's
    /// socket to accept.
    #[serde(default = "d_5_000")]
    pub spawn_wait_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { idle_timeout_sec: 300, spawn_wait_ms: 5_000 }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    /// Model used for planning/drive turns.
    #[serde(default)]
    pub planner_model: Option<String>,
    /// Model used for execution turns (compaction reuses this).
    #[serde(default)]
    pub executor_model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the env var holding the API key (never the key itself).
    #[serde(default)]
    pub api_key_env: Option<String>,
}

// ── serde default fns ──────────────────────────────────────────────

fn d_ws_root() -> PathBuf {
    PathBuf::from(".")
}
fn d_runtime_dir() -> String {
    ".skills_runtime".into()
}
fn d_system_template() -> String {
    "You are a capable assistant operating inside a sandboxed workspace. \
     Use the provided tools when a task requires them; otherwise answer directly."
        .into()
}
fn d_true() -> bool {
    true
}
fn d_2() -> u32 {
    2
}
fn d_16() -> u32 {
    16
}
fn d_64() -> u32 {
    64
}
fn d_120() -> u64 {
    120
}
fn d_300() -> u64 {
    300
}
fn d_600() -> u64 {
    600
}
fn d_2_000() -> u64 {
    2_000
}
fn d_5_000() -> u64 {
    5_000
}
fn d_120_000() -> u64 {
    120_000
}
fn d_6us() -> usize {
    6
}
fn d_64us() -> usize {
    64
}
fn d_49152() -> usize {
    49_152
}
fn d_60_000us() -> usize {
    60_000
}
fn d_120_000us() -> usize {
    120_000
}
fn d_200_000us() -> usize {
    200_000
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_empty_yaml() {
        let config: RuntimeConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.safety.mode, SafetyMode::Ask);
        assert_eq!(config.run.max_steps, 64);
        assert_eq!(config.skills.injection.max_bytes, 49_152);
        assert_eq!(config.context_recovery.mode, RecoveryMode::CompactFirst);
        assert_eq!(config.workspace.runtime_dir, ".skills_runtime");
    }

    #[test]
    fn partial_overlay_keeps_sibling_defaults() {
        let yaml = "safety:\n  mode: allow\n  allowlist: [ls, cat]\n";
        let config: RuntimeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.safety.mode, SafetyMode::Allow);
        assert_eq!(config.safety.allowlist, vec!["ls", "cat"]);
        // Untouched leaf keeps its default.
        assert_eq!(config.safety.approval_timeout_ms, 120_000);
        assert_eq!(config.run.max_wall_time_sec, 600);
    }

    #[test]
    fn refresh_policy_parses() {
        assert_eq!(RefreshPolicy::parse("always"), Some(RefreshPolicy::Always));
        assert_eq!(RefreshPolicy::parse("manual"), Some(RefreshPolicy::Manual));
        assert_eq!(RefreshPolicy::parse("ttl:300"), Some(RefreshPolicy::Ttl(300)));
        assert_eq!(RefreshPolicy::parse("ttl:"), None);
        assert_eq!(RefreshPolicy::parse("sometimes"), None);
    }

    #[test]
    fn refresh_policy_serde_round_trip() {
        let yaml = "spaces: {}\nrefresh: \"ttl:60\"\n";
        let skills: SkillsConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(skills.refresh, RefreshPolicy::Ttl(60));
        let out = serde_yaml::to_string(&skills).unwrap();
        assert!(out.contains("ttl:60"));
    }

    #[test]
    fn refresh_policy_rejects_garbage() {
        let err = serde_yaml::from_str::<SkillsConfig>("refresh: never\n");
        assert!(err.is_err());
    }

    #[test]
    fn recovery_mode_snake_case() {
        let config: ContextRecoveryConfig =
            serde_yaml::from_str("mode: ask_first\n").unwrap();
        assert_eq!(config.mode, RecoveryMode::AskFirst);
        assert_eq!(config.ask_first_fallback_mode, RecoveryFallback::CompactFirst);
    }

    #[test]
    fn runtime_path_joins() {
        let ws = WorkspaceConfig { root: PathBuf::from("/tmp/w"), runtime_dir: ".skills_runtime".into() };
        assert_eq!(ws.runtime_path(), PathBuf::from("/tmp/w/.skills_runtime"));
    }

    #[test]
    fn skill_spaces_from_yaml() {
        let yaml = r#"
spaces:
  "team:data":
    paths: ["/srv/skills/data"]
  personal:
    paths: ["./skills"]
"#;
        let skills: SkillsConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(skills.spaces.len(), 2);
        assert_eq!(
            skills.spaces["team:data"].paths,
            vec![PathBuf::from("/srv/skills/data")]
        );
    }
}
