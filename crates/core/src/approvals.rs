//! Approvals: the pluggable provider seam, the per-run decision cache,
//! and the loop guard.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sr_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Decision
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Run this call; do not remember the grant.
    Approved,
    /// Run this call and every later call with the same approval key.
    ApprovedForSession,
    Denied,
    /// Deny and terminate the run.
    Abort,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What a provider sees: never raw arguments, always the sanitized
/// projection.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub tool: String,
    pub sanitized_request: Value,
    pub approval_key: String,
}

/// Interactive (GUI/CLI), scripted (tests), or rule-based
/// (programmatic) approvers all implement this.
#[async_trait::async_trait]
pub trait ApprovalProvider: Send + Sync {
    async fn request_approval(&self, request: &ApprovalRequest) -> Result<Decision>;
}

/// Replays a fixed queue of decisions; running dry denies.
pub struct ScriptedApprovalProvider {
    decisions: Mutex<VecDeque<Decision>>,
}

impl ScriptedApprovalProvider {
    pub fn new(decisions: Vec<Decision>) -> Self {
        Self { decisions: Mutex::new(decisions.into()) }
    }
}

#[async_trait::async_trait]
impl ApprovalProvider for ScriptedApprovalProvider {
    async fn request_approval(&self, request: &ApprovalRequest) -> Result<Decision> {
        let next = self.decisions.lock().pop_front();
        match next {
            Some(decision) => Ok(decision),
            None => {
                tracing::warn!(tool = %request.tool, "scripted approvals exhausted, denying");
                Ok(Decision::Denied)
            }
        }
    }
}

/// Fails the run if consulted. Used to verify that cached / replayed
/// grants short-circuit the provider.
pub struct FailingApprovalProvider;

#[async_trait::async_trait]
impl ApprovalProvider for FailingApprovalProvider {
    async fn request_approval(&self, request: &ApprovalRequest) -> Result<Decision> {
        Err(Error::Config(format!(
            "approval provider consulted unexpectedly for {}",
            request.tool
        )))
    }
}

/// One programmatic rule: `Some(decision)` to match, `None` to pass.
pub type ApprovalRule = Box<dyn Fn(&ApprovalRequest) -> Option<Decision> + Send + Sync>;

/// Evaluates rules in order; a panicking rule is a non-match; no match
/// at all denies (fail-closed).
pub struct RuleBasedApprovalProvider {
    rules: Vec<ApprovalRule>,
}

impl RuleBasedApprovalProvider {
    pub fn new(rules: Vec<ApprovalRule>) -> Self {
        Self { rules }
    }
}

#[async_trait::async_trait]
impl ApprovalProvider for RuleBasedApprovalProvider {
    async fn request_approval(&self, request: &ApprovalRequest) -> Result<Decision> {
        for rule in &self.rules {
            let matched = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| rule(request)));
            match matched {
                Ok(Some(decision)) => return Ok(decision),
                Ok(None) => continue,
                Err(_) => {
                    tracing::warn!(tool = %request.tool, "approval rule panicked, treating as non-match");
                }
            }
        }
        Ok(Decision::Denied)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-run cache
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What the run remembers about past decisions.
///
/// `Approved` is single-use and never stored; `ApprovedForSession`
/// persists for the run; a stored `Denied` seen again is the loop
/// guard condition.
#[derive(Default)]
pub struct ApprovalsCache {
    entries: HashMap<String, Decision>,
}

/// Cache consultation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheHit {
    ApprovedForSession,
    /// The same key was already denied once this run.
    DeniedAgain,
}

impl ApprovalsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, approval_key: &str) -> Option<CacheHit> {
        match self.entries.get(approval_key)? {
            Decision::ApprovedForSession => Some(CacheHit::ApprovedForSession),
            Decision::Denied => Some(CacheHit::DeniedAgain),
            _ => None,
        }
    }

    /// Record a provider decision. Single-use approvals are dropped.
    pub fn record(&mut self, approval_key: &str, decision: Decision) {
        match decision {
            Decision::ApprovedForSession | Decision::Denied => {
                self.entries.insert(approval_key.to_string(), decision);
            }
            Decision::Approved | Decision::Abort => {}
        }
    }

    /// Prime a session grant during WAL replay.
    pub fn prime_session_grant(&mut self, approval_key: &str) {
        self.entries.insert(approval_key.to_string(), Decision::ApprovedForSession);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn request(tool: &str) -> ApprovalRequest {
        ApprovalRequest {
            tool: tool.into(),
            sanitized_request: serde_json::json!({"argv": [tool]}),
            approval_key: format!("key-{tool}"),
        }
    }

    #[tokio::test]
    async fn scripted_provider_replays_then_denies() {
        let provider = ScriptedApprovalProvider::new(vec![
            Decision::Approved,
            Decision::ApprovedForSession,
        ]);
        assert_eq!(provider.request_approval(&request("a")).await.unwrap(), Decision::Approved);
        assert_eq!(
            provider.request_approval(&request("b")).await.unwrap(),
            Decision::ApprovedForSession
        );
        assert_eq!(provider.request_approval(&request("c")).await.unwrap(), Decision::Denied);
    }

    #[tokio::test]
    async fn failing_provider_errors() {
        let err = FailingApprovalProvider.request_approval(&request("x")).await.unwrap_err();
        assert_eq!(err.kind(), sr_domain::ErrorKind::ConfigError);
    }

    #[tokio::test]
    async fn rules_evaluate_in_order() {
        let provider = RuleBasedApprovalProvider::new(vec![
            Box::new(|req| (req.tool == "shell_exec").then_some(Decision::ApprovedForSession)),
            Box::new(|_| Some(Decision::Denied)),
        ]);
        assert_eq!(
            provider.request_approval(&request("shell_exec")).await.unwrap(),
            Decision::ApprovedForSession
        );
        assert_eq!(
            provider.request_approval(&request("file_write")).await.unwrap(),
            Decision::Denied
        );
    }

    #[tokio::test]
    async fn panicking_rule_is_non_match() {
        let provider = RuleBasedApprovalProvider::new(vec![
            Box::new(|_| panic!("rule bug")),
            Box::new(|_| Some(Decision::Approved)),
        ]);
        assert_eq!(provider.request_approval(&request("x")).await.unwrap(), Decision::Approved);
    }

    #[tokio::test]
    async fn no_matching_rule_denies() {
        let provider = RuleBasedApprovalProvider::new(vec![Box::new(|_| None)]);
        assert_eq!(provider.request_approval(&request("x")).await.unwrap(), Decision::Denied);
    }

    #[test]
    fn cache_session_grant_persists() {
        let mut cache = ApprovalsCache::new();
        assert!(cache.lookup("k").is_none());
        cache.record("k", Decision::ApprovedForSession);
        assert_eq!(cache.lookup("k"), Some(CacheHit::ApprovedForSession));
    }

    #[test]
    fn cache_single_use_approval_not_stored() {
        let mut cache = ApprovalsCache::new();
        cache.record("k", Decision::Approved);
        assert!(cache.lookup("k").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn cache_denied_becomes_loop_guard() {
        let mut cache = ApprovalsCache::new();
        cache.record("k", Decision::Denied);
        assert_eq!(cache.lookup("k"), Some(CacheHit::DeniedAgain));
    }

    #[test]
    fn primed_grants_behave_like_session_approvals() {
        let mut cache = ApprovalsCache::new();
        cache.prime_session_grant("replayed");
        assert_eq!(cache.lookup("replayed"), Some(CacheHit::ApprovedForSession));
        assert_eq!(cache.len(), 1);
    }
}
