//! Tool dispatch: one `ToolCall` through the full safety pipeline.
//!
//! Order per call: sanitize (for the audit event) → validate → policy →
//! approvals (may suspend) → sandbox acquisition → handler under a
//! `ToolExecutionContext` → normalized result. Tool-level failures do
//! not end the run; only abort, the loop guard, and a missing approval
//! provider escalate to the loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use sr_domain::config::RuntimeConfig;
use sr_domain::tool::{ToolCall, ToolResult};
use sr_domain::{ErrorKind, Event, EventKind, Result};
use sr_tools::{validate_arguments, SandboxAdapter, SandboxInfo, SandboxLevel, ToolExecutionContext, ToolRegistry};

use crate::approvals::{ApprovalProvider, ApprovalRequest, ApprovalsCache, CacheHit, Decision};
use crate::cancel::CancelToken;
use crate::emitter::Emitter;
use crate::policy::{self, PolicyDecision, ToolFacts};
use crate::sanitize::{sanitize, Sanitized};

/// Grace added to the per-tool timeout so a handler's own (richer)
/// timeout result wins the race against the dispatcher's.
const DISPATCH_TIMEOUT_GRACE_MS: u64 = 250;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Conditions that end the run right after `tool_call_finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalAfterTool {
    /// Approval provider answered ABORT.
    Abort,
    /// Second denial for the same approval key in this run.
    LoopGuard,
    /// Policy said ASK but no provider is configured.
    MissingProvider,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatcher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Dispatcher<'a> {
    pub config: &'a RuntimeConfig,
    pub registry: &'a ToolRegistry,
    pub sandbox_adapter: Option<&'a Arc<dyn SandboxAdapter>>,
    pub approvals: Option<&'a Arc<dyn ApprovalProvider>>,
    pub cache: &'a mut ApprovalsCache,
    pub emitter: &'a mut Emitter,
    pub cancel: &'a CancelToken,
    pub session_env: &'a HashMap<String, String>,
    pub run_id: &'a str,
    pub turn_id: &'a str,
}

impl Dispatcher<'_> {
    fn event(&self, kind: EventKind, step_id: &str, payload: Value) -> Event {
        Event::now(kind, self.run_id, payload)
            .with_turn(self.turn_id)
            .with_step(step_id)
    }

    /// Run one tool call end to end, emitting `tool_call_requested`,
    /// any approval events, `tool_call_started`, and
    /// `tool_call_finished`.
    pub async fn execute(
        &mut self,
        call: &ToolCall,
        step_id: &str,
    ) -> Result<(ToolResult, Option<FatalAfterTool>)> {
        let Some(entry) = self.registry.get(&call.tool_name) else {
            let requested = self.event(
                EventKind::ToolCallRequested,
                step_id,
                serde_json::json!({
                    "call_id": call.call_id,
                    "tool_name": call.tool_name,
                    "sanitized_request": { "unregistered": true },
                }),
            );
            self.emitter.emit(requested).await?;
            let result = ToolResult::failure(
                ErrorKind::NotFound,
                format!("tool {:?} is not registered", call.tool_name),
            );
            self.finish(call, step_id, &result).await?;
            return Ok((result, None));
        };
        let safety = entry.safety;
        let handler = Arc::clone(&entry.handler);
        let parameters = entry.definition.parameters.clone();

        // Sanitize first so the audit trail never sees raw arguments.
        let sanitized = sanitize(&call.tool_name, safety.sanitizer, &call.arguments);
        let requested = self.event(
            EventKind::ToolCallRequested,
            step_id,
            serde_json::json!({
                "call_id": call.call_id,
                "tool_name": call.tool_name,
                "sanitized_request": sanitized.request,
                "approval_key": sanitized.approval_key,
            }),
        );
        self.emitter.emit(requested).await?;

        if let Err(e) = validate_arguments(&parameters, &call.arguments) {
            let result = ToolResult::failure(ErrorKind::Validation, e.to_string());
            self.finish(call, step_id, &result).await?;
            return Ok((result, None));
        }

        // ── Gate: policy, then approvals ──────────────────────────
        let facts = ToolFacts { builtin: safety.builtin, requires_approval: safety.requires_approval };
        match policy::decide(&self.config.safety, &sanitized, facts) {
            PolicyDecision::Deny => {
                let result = ToolResult::failure(
                    ErrorKind::Permission,
                    format!("policy denied {:?}", call.tool_name),
                );
                self.finish(call, step_id, &result).await?;
                return Ok((result, None));
            }
            PolicyDecision::Allow => {}
            PolicyDecision::Ask => match self.ask(&sanitized, step_id).await? {
                AskOutcome::Approved => {}
                AskOutcome::Denied => {
                    let result = ToolResult::failure(
                        ErrorKind::Permission,
                        format!("approval denied for {:?}", call.tool_name),
                    );
                    self.finish(call, step_id, &result).await?;
                    return Ok((result, None));
                }
                AskOutcome::Fatal(fatal) => {
                    let result = ToolResult::failure(
                        ErrorKind::Permission,
                        match fatal {
                            FatalAfterTool::Abort => "approval aborted the run".to_string(),
                            FatalAfterTool::LoopGuard => {
                                "repeated denial for the same request".to_string()
                            }
                            FatalAfterTool::MissingProvider => {
                                "approval required but no provider is configured".to_string()
                            }
                        },
                    );
                    self.finish(call, step_id, &result).await?;
                    return Ok((result, Some(fatal)));
                }
            },
        }

        // ── Sandbox acquisition (never downgrades) ────────────────
        let sandbox_info;
        let acquired_adapter = match sanitized.sandbox {
            SandboxLevel::Restricted => match self.sandbox_adapter {
                Some(adapter) => {
                    sandbox_info = SandboxInfo::active(adapter.name());
                    Some(Arc::clone(adapter))
                }
                None => {
                    let mut result = ToolResult::failure(
                        ErrorKind::SandboxDenied,
                        "restricted sandbox required but no adapter is available",
                    );
                    result = result.with_data(serde_json::json!({
                        "sandbox": SandboxInfo::denied(),
                    }));
                    self.finish(call, step_id, &result).await?;
                    return Ok((result, None));
                }
            },
            SandboxLevel::None => {
                sandbox_info = SandboxInfo::unsandboxed();
                None
            }
        };

        let started = self.event(
            EventKind::ToolCallStarted,
            step_id,
            serde_json::json!({ "call_id": call.call_id, "tool_name": call.tool_name }),
        );
        self.emitter.emit(started).await?;

        // ── Execution context ─────────────────────────────────────
        let per_call_env: HashMap<String, String> = call
            .arguments
            .get("env")
            .and_then(Value::as_object)
            .map(|env| {
                env.iter()
                    .filter_map(|(key, value)| value.as_str().map(|v| (key.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        let timeout_ms = call
            .arguments
            .get("timeout_ms")
            .and_then(Value::as_u64)
            .unwrap_or(self.config.exec.timeout_ms);

        let mut ctx = ToolExecutionContext::new(self.config.workspace.root.clone(), timeout_ms)
            .with_session_env(self.session_env.clone())
            .with_per_call_env(per_call_env);
        if let Some(adapter) = acquired_adapter {
            ctx = ctx.with_sandbox(adapter);
        }

        // ── Handler (may suspend); dispatcher enforces the timeout ─
        let clock = Instant::now();
        let deadline = std::time::Duration::from_millis(timeout_ms + DISPATCH_TIMEOUT_GRACE_MS);
        let mut result = tokio::select! {
            executed = tokio::time::timeout(deadline, handler.execute(call.arguments.clone(), &ctx)) => {
                match executed {
                    Ok(result) => result,
                    Err(_) => ToolResult::failure(
                        ErrorKind::Timeout,
                        format!("tool timed out after {timeout_ms}ms"),
                    ),
                }
            }
            _ = self.cancel.cancelled() => {
                ToolResult::failure(ErrorKind::Cancelled, "run cancelled during tool execution")
            }
        };
        if result.duration_ms == 0 {
            result.duration_ms = clock.elapsed().as_millis() as u64;
        }

        // ── Normalize: every result carries the sandbox audit record.
        let mut data = match result.data.take() {
            Some(Value::Object(map)) => map,
            Some(other) => {
                let mut map = serde_json::Map::new();
                map.insert("value".into(), other);
                map
            }
            None => serde_json::Map::new(),
        };
        data.insert("sandbox".into(), serde_json::to_value(&sandbox_info)?);
        result.data = Some(Value::Object(data));

        self.finish(call, step_id, &result).await?;
        Ok((result, None))
    }

    async fn finish(&mut self, call: &ToolCall, step_id: &str, result: &ToolResult) -> Result<()> {
        let finished = self.event(
            EventKind::ToolCallFinished,
            step_id,
            serde_json::json!({
                "call_id": call.call_id,
                "tool_name": call.tool_name,
                "result": result,
            }),
        );
        self.emitter.emit(finished).await?;
        Ok(())
    }

    // ── ASK path ───────────────────────────────────────────────────

    async fn ask(&mut self, sanitized: &Sanitized, step_id: &str) -> Result<AskOutcome> {
        // Cache first.
        match self.cache.lookup(&sanitized.approval_key) {
            Some(CacheHit::ApprovedForSession) => {
                let decided = self.event(
                    EventKind::ApprovalDecided,
                    step_id,
                    serde_json::json!({
                        "approval_key": sanitized.approval_key,
                        "decision": Decision::ApprovedForSession,
                        "reason": "cached",
                    }),
                );
                self.emitter.emit(decided).await?;
                return Ok(AskOutcome::Approved);
            }
            Some(CacheHit::DeniedAgain) => {
                let decided = self.event(
                    EventKind::ApprovalDecided,
                    step_id,
                    serde_json::json!({
                        "approval_key": sanitized.approval_key,
                        "decision": Decision::Denied,
                        "reason": "loop_guard",
                    }),
                );
                self.emitter.emit(decided).await?;
                return Ok(AskOutcome::Fatal(FatalAfterTool::LoopGuard));
            }
            None => {}
        }

        let Some(provider) = self.approvals else {
            // Fail closed: nobody to ask.
            return Ok(AskOutcome::Fatal(FatalAfterTool::MissingProvider));
        };

        let request = ApprovalRequest {
            tool: sanitized.tool.clone(),
            sanitized_request: sanitized.request.clone(),
            approval_key: sanitized.approval_key.clone(),
        };
        let requested = self.event(
            EventKind::ApprovalRequested,
            step_id,
            serde_json::json!({
                "approval_key": request.approval_key,
                "tool": request.tool,
                "sanitized_request": request.sanitized_request,
            }),
        );
        self.emitter.emit(requested).await?;

        let timeout = std::time::Duration::from_millis(self.config.safety.approval_timeout_ms);
        let (decision, reason) = tokio::select! {
            answered = tokio::time::timeout(timeout, provider.request_approval(&request)) => {
                match answered {
                    Ok(decision) => (decision?, "provider"),
                    Err(_) => (Decision::Denied, "timeout"),
                }
            }
            _ = self.cancel.cancelled() => (Decision::Abort, "cancelled"),
        };
        self.cache.record(&sanitized.approval_key, decision);

        let decided = self.event(
            EventKind::ApprovalDecided,
            step_id,
            serde_json::json!({
                "approval_key": sanitized.approval_key,
                "decision": decision,
                "reason": reason,
            }),
        );
        self.emitter.emit(decided).await?;

        Ok(match decision {
            Decision::Approved | Decision::ApprovedForSession => AskOutcome::Approved,
            Decision::Denied => AskOutcome::Denied,
            Decision::Abort => AskOutcome::Fatal(FatalAfterTool::Abort),
        })
    }
}

enum AskOutcome {
    Approved,
    Denied,
    Fatal(FatalAfterTool),
}
