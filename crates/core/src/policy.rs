//! The deterministic policy stage of the safety gate.
//!
//! A pure function of the configured mode, the lists, and the
//! sanitized request's facts. Approvals and the sandbox come after;
//! this stage never suspends.

use sr_domain::config::{SafetyConfig, SafetyMode};

use crate::sanitize::Sanitized;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Ask,
    Deny,
}

/// Facts about the tool beyond the request itself.
#[derive(Debug, Clone, Copy)]
pub struct ToolFacts {
    /// Builtin tools follow the tree as-is; custom tools only benefit
    /// from the allowlist when named in `safety.tool_allowlist`.
    pub builtin: bool,
    /// Declared ask-always (high-risk builtins).
    pub requires_approval: bool,
}

/// The decision tree. Order matters and is fixed:
///
/// ```text
/// denylist(hit)                     → DENY
/// mode == deny                      → DENY
/// requires_approval                 → ASK
/// sandbox_permissions escalated     → ASK
/// mode == ask AND intent.is_complex → ASK
/// allowlist(hit)                    → ALLOW
/// mode == allow                     → ALLOW
/// otherwise                         → ASK
/// ```
pub fn decide(config: &SafetyConfig, sanitized: &Sanitized, facts: ToolFacts) -> PolicyDecision {
    let leading = sanitized.leading_word.as_deref();

    if leading.is_some_and(|word| config.denylist.iter().any(|entry| entry == word)) {
        return PolicyDecision::Deny;
    }
    if config.mode == SafetyMode::Deny {
        return PolicyDecision::Deny;
    }
    if facts.requires_approval {
        return PolicyDecision::Ask;
    }
    if sanitized.sandbox_permissions_escalated {
        return PolicyDecision::Ask;
    }
    if config.mode == SafetyMode::Ask && sanitized.is_complex {
        return PolicyDecision::Ask;
    }

    // Custom tools only short-circuit through the allowlists when
    // explicitly trusted by name.
    let name_trusted =
        facts.builtin || config.tool_allowlist.iter().any(|entry| entry == &sanitized.tool);
    if name_trusted && leading.is_some_and(|word| config.allowlist.iter().any(|entry| entry == word))
    {
        return PolicyDecision::Allow;
    }
    if config.mode == SafetyMode::Allow {
        return PolicyDecision::Allow;
    }
    PolicyDecision::Ask
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
