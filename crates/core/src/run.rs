//! The agent loop: turn driver, streaming, tool orchestration, budgets,
//! context recovery, resume, and the terminal decision.
//!
//! One loop per run, single-threaded within the run. Every state
//! transition goes through the emitter (durable-append → hooks →
//! stream), and exactly one terminal event ends the WAL.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use sr_backends::{ChatBackend, ChatRequest};
use sr_domain::config::RuntimeConfig;
use sr_domain::stream::{StreamEvent, Usage};
use sr_domain::tool::{Message, ToolCall};
use sr_domain::{Error, ErrorKind, Event, EventKind, Result};
use sr_skills::{SkillRef, SkillsManager};
use sr_tools::file_write::FileWriteHandler;
use sr_tools::shell::{ShellCommandHandler, ShellExecHandler};
use sr_tools::{SandboxAdapter, ToolEntry, ToolRegistry};
use sr_wal::WalWriter;

use crate::approvals::{ApprovalProvider, ApprovalsCache};
use crate::cancel::CancelToken;
use crate::controller::{LoopController, RecoveryAction};
use crate::dispatch::{Dispatcher, FatalAfterTool};
use crate::emitter::{Emitter, ObserverHook};
use crate::human::{HumanIoProvider, HumanRequest};
use crate::prompt;
use crate::resume;
use crate::sanitize;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Public types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

/// What `run` returns once the event stream has drained.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub final_output: Option<String>,
    pub wal_locator: String,
    /// The terminal event's payload (error details, notices, usage).
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeStrategy {
    Summary,
    Replay,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Fixed run id (resume and fork targets need one).
    pub run_id: Option<String>,
    /// Rebuild state from a prior WAL before the first turn.
    pub resume: Option<ResumeStrategy>,
    /// The run whose WAL is read for the resume. Defaults to `run_id`
    /// itself, which is only legal when that WAL has no terminal yet
    /// (a forked prefix); a completed run must be resumed under a new
    /// run id with `resume_from` naming the source.
    pub resume_from: Option<String>,
}

/// Cancellation handle for an in-flight run.
pub struct RunHandle {
    pub run_id: String,
    pub wal_locator: String,
    cancel: CancelToken,
}

impl RunHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-workspace engine. Construct once, run many times; each run owns
/// its own WAL, approvals cache, budgets, and cancellation token.
pub struct Runtime {
    config: RuntimeConfig,
    backend: Arc<dyn ChatBackend>,
    registry: Arc<ToolRegistry>,
    skills: Arc<SkillsManager>,
    approvals: Option<Arc<dyn ApprovalProvider>>,
    human: Option<Arc<dyn HumanIoProvider>>,
    sandbox: Option<Arc<dyn SandboxAdapter>>,
    observers: Vec<ObserverHook>,
    session_env: HashMap<String, String>,
}

impl Runtime {
    /// Build with the builtin tool set and skills from config.
    pub fn new(config: RuntimeConfig, backend: Arc<dyn ChatBackend>) -> Result<Self> {
        let registry = Self::default_registry(&config)?;
        let skills = SkillsManager::from_config(&config.skills);
        Ok(Self {
            config,
            backend,
            registry: Arc::new(registry),
            skills: Arc::new(skills),
            approvals: None,
            human: None,
            sandbox: None,
            observers: Vec::new(),
            session_env: HashMap::new(),
        })
    }

    /// The builtin tool table: `shell_exec` (argv), `shell_command`
    /// (shell-string wrapper), `file_write`.
    pub fn default_registry(config: &RuntimeConfig) -> Result<ToolRegistry> {
        let max = config.exec.max_output_chars;
        let mut registry = ToolRegistry::new();
        registry.register(
            ToolEntry {
                definition: ShellExecHandler::definition(),
                handler: Arc::new(ShellExecHandler::new(max)),
                safety: ShellExecHandler::descriptor(),
            },
            false,
        )?;
        registry.register(
            ToolEntry {
                definition: ShellCommandHandler::definition(),
                handler: Arc::new(ShellCommandHandler::new(max)),
                safety: ShellCommandHandler::descriptor(),
            },
            false,
        )?;
        registry.register(
            ToolEntry {
                definition: FileWriteHandler::definition(),
                handler: Arc::new(FileWriteHandler),
                safety: FileWriteHandler::descriptor(),
            },
            false,
        )?;
        Ok(registry)
    }

    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_skills(mut self, skills: SkillsManager) -> Self {
        self.skills = Arc::new(skills);
        self
    }

    pub fn with_approvals(mut self, provider: Arc<dyn ApprovalProvider>) -> Self {
        self.approvals = Some(provider);
        self
    }

    pub fn with_human_io(mut self, provider: Arc<dyn HumanIoProvider>) -> Self {
        self.human = Some(provider);
        self
    }

    pub fn with_sandbox_adapter(mut self, adapter: Arc<dyn SandboxAdapter>) -> Self {
        self.sandbox = Some(adapter);
        self
    }

    pub fn with_observer(mut self, hook: ObserverHook) -> Self {
        self.observers.push(hook);
        self
    }

    pub fn with_session_env(mut self, env: HashMap<String, String>) -> Self {
        self.session_env = env;
        self
    }

    /// Fork `src_run_id` at `fork_point_index` into `new_run_id`; the
    /// new run can then be started with `resume: replay` or `summary`.
    pub fn fork_run(
        &self,
        src_run_id: &str,
        fork_point_index: u64,
        new_run_id: &str,
    ) -> Result<sr_wal::WalLocator> {
        resume::fork_run(
            &self.config.workspace.runtime_path(),
            src_run_id,
            fork_point_index,
            new_run_id,
        )
    }

    // ── Entry points ───────────────────────────────────────────────

    pub async fn run(&self, task: &str) -> Result<RunOutcome> {
        self.run_with(task, RunOptions::default()).await
    }

    /// Drive a run to completion, collecting the terminal payload.
    pub async fn run_with(&self, task: &str, options: RunOptions) -> Result<RunOutcome> {
        let (handle, mut events) = self.run_stream_with(task, options).await?;
        let mut outcome = RunOutcome {
            status: RunStatus::Failed,
            final_output: None,
            wal_locator: handle.wal_locator.clone(),
            details: None,
        };
        let mut saw_terminal = false;
        while let Some(event) = events.recv().await {
            match event.kind {
                EventKind::RunCompleted => {
                    saw_terminal = true;
                    outcome.status = RunStatus::Completed;
                    outcome.final_output = event
                        .payload
                        .get("final_output")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    outcome.details = Some(event.payload);
                }
                EventKind::RunFailed => {
                    saw_terminal = true;
                    outcome.status = RunStatus::Failed;
                    outcome.details = Some(event.payload);
                }
                EventKind::RunCancelled => {
                    saw_terminal = true;
                    outcome.status = RunStatus::Cancelled;
                    outcome.details = Some(event.payload);
                }
                _ => {}
            }
        }
        if !saw_terminal {
            return Err(Error::Unknown {
                message: "run ended without a terminal event".into(),
                exception_class: None,
            });
        }
        Ok(outcome)
    }

    pub async fn run_stream(&self, task: &str) -> Result<(RunHandle, mpsc::Receiver<Event>)> {
        self.run_stream_with(task, RunOptions::default()).await
    }

    /// Start a run and return its event stream. The loop runs in a
    /// spawned task; dropping the receiver does not stop it (cancel
    /// through the handle).
    pub async fn run_stream_with(
        &self,
        task: &str,
        options: RunOptions,
    ) -> Result<(RunHandle, mpsc::Receiver<Event>)> {
        let run_id = options
            .run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let runtime_dir = self.config.workspace.runtime_path();

        // Resume reads the source WAL before this run's writer opens.
        let source_run_id = options.resume_from.clone().unwrap_or_else(|| run_id.clone());
        let resume_state = match options.resume {
            Some(ResumeStrategy::Replay) => Some((
                ResumeStrategy::Replay,
                resume::replay_from_wal(&runtime_dir, &source_run_id)?,
            )),
            Some(ResumeStrategy::Summary) => Some((
                ResumeStrategy::Summary,
                resume::summary_from_wal(&runtime_dir, &source_run_id)?,
            )),
            None => None,
        };
        if let Some((_, state)) = &resume_state {
            if state.has_terminal && source_run_id == run_id {
                return Err(Error::Validation(format!(
                    "run {run_id:?} already has a terminal event; fork it or resume under a new run id"
                )));
            }
        }

        let wal = WalWriter::open(&runtime_dir, &run_id)?;
        let (tx, rx) = mpsc::channel(64);
        let emitter = Emitter::new(wal, self.observers.clone(), tx);
        let wal_locator = emitter.locator().as_uri();
        let cancel = CancelToken::new();

        let mut cache = ApprovalsCache::new();
        let mut history = Vec::new();
        let mut resume_strategy = None;
        if let Some((strategy, state)) = resume_state {
            resume_strategy = Some(strategy);
            for key in &state.primed_approvals {
                cache.prime_session_grant(key);
            }
            if let Some(summary) = state.summary_message {
                history.push(Message::user(summary));
            }
            history.extend(state.history);
        }

        let ctx = RunContext {
            config: self.config.clone(),
            backend: Arc::clone(&self.backend),
            registry: Arc::clone(&self.registry),
            skills: Arc::clone(&self.skills),
            approvals: self.approvals.clone(),
            human: self.human.clone(),
            sandbox: self.sandbox.clone(),
            session_env: self.session_env.clone(),
            run_id: run_id.clone(),
            task: task.to_string(),
            emitter,
            controller: LoopController::new(
                self.config.run.clone(),
                self.config.context_recovery.clone(),
            ),
            cache,
            cancel: cancel.clone(),
            history,
            usage: Usage::default(),
            resume: resume_strategy,
            injected: Vec::new(),
        };
        tokio::spawn(run_loop(ctx));

        Ok((RunHandle { run_id, wal_locator, cancel }, rx))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RunContext
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct RunContext {
    config: RuntimeConfig,
    backend: Arc<dyn ChatBackend>,
    registry: Arc<ToolRegistry>,
    skills: Arc<SkillsManager>,
    approvals: Option<Arc<dyn ApprovalProvider>>,
    human: Option<Arc<dyn HumanIoProvider>>,
    sandbox: Option<Arc<dyn SandboxAdapter>>,
    session_env: HashMap<String, String>,
    run_id: String,
    task: String,
    emitter: Emitter,
    controller: LoopController,
    cache: ApprovalsCache,
    cancel: CancelToken,
    history: Vec<Message>,
    usage: Usage,
    resume: Option<ResumeStrategy>,
    injected: Vec<SkillRef>,
}

impl RunContext {
    async fn emit(
        &mut self,
        kind: EventKind,
        turn_id: Option<&str>,
        step_id: Option<&str>,
        payload: Value,
    ) -> Result<()> {
        let mut event = Event::now(kind, &self.run_id, payload);
        if let Some(turn_id) = turn_id {
            event = event.with_turn(turn_id);
        }
        if let Some(step_id) = step_id {
            event = event.with_step(step_id);
        }
        self.emitter.emit(event).await?;
        Ok(())
    }

    async fn terminal_completed(&mut self, final_output: &str) -> Result<()> {
        let payload = serde_json::json!({
            "final_output": final_output,
            "usage": self.usage,
            "notices": self.controller.notices_value(),
            "wal_locator": self.emitter.locator().as_uri(),
        });
        self.emit(EventKind::RunCompleted, None, None, payload).await
    }

    async fn terminal_failed(&mut self, kind: ErrorKind, message: &str, details: Value) -> Result<()> {
        let payload = serde_json::json!({
            "error_kind": kind,
            "message": message,
            "details": details,
            "notices": self.controller.notices_value(),
            "wal_locator": self.emitter.locator().as_uri(),
        });
        self.emit(EventKind::RunFailed, None, None, payload).await
    }

    async fn terminal_cancelled(&mut self, reason: &str, partial_output: Option<&str>) -> Result<()> {
        let payload = serde_json::json!({
            "reason": reason,
            "partial_output": partial_output,
            "wal_locator": self.emitter.locator().as_uri(),
        });
        self.emit(EventKind::RunCancelled, None, None, payload).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_loop(mut ctx: RunContext) {
    if let Err(e) = drive(&mut ctx).await {
        // Loop-level fatal: make sure exactly one terminal lands.
        if !ctx.emitter.terminal_emitted() {
            let message = e.to_string();
            if let Err(emit_err) = ctx.terminal_failed(e.kind(), &message, error_details(&e)).await {
                tracing::error!(run_id = %ctx.run_id, error = %emit_err, "failed to emit terminal event");
            }
        } else {
            tracing::error!(run_id = %ctx.run_id, error = %e, "error after terminal event");
        }
    }
}

fn error_details(e: &Error) -> Value {
    match e {
        Error::Unknown { exception_class: Some(class), .. } => {
            serde_json::json!({ "exception_class": class })
        }
        _ => Value::Null,
    }
}

async fn drive(ctx: &mut RunContext) -> Result<()> {
    let mut started = serde_json::json!({
        "task": ctx.task,
        "config_summary": {
            "backend": ctx.backend.backend_id(),
            "safety_mode": ctx.config.safety.mode,
            "max_steps": ctx.config.run.max_steps,
            "max_wall_time_sec": ctx.config.run.max_wall_time_sec,
            "tools": ctx.registry.len(),
        },
    });
    if let Some(strategy) = ctx.resume {
        started["resume"] = serde_json::json!({ "enabled": true, "strategy": strategy });
    }
    ctx.emit(EventKind::RunStarted, None, None, started).await?;

    let mut turn_index: u32 = 0;
    loop {
        turn_index += 1;
        let turn_id = format!("t{turn_index}");

        if ctx.cancel.is_cancelled() {
            return ctx.terminal_cancelled("external_cancel", None).await;
        }

        // An LLM request is one budgeted step.
        let step = match ctx.controller.begin_step() {
            Ok(step) => step,
            Err(e) => {
                return ctx.terminal_failed(ErrorKind::Budget, &e.to_string(), Value::Null).await
            }
        };
        let step_id = format!("s{step}");

        let compiled = prompt::compile(
            &ctx.config.prompt,
            &ctx.config.history,
            &ctx.config.skills,
            &ctx.skills,
            &ctx.history,
            &ctx.task,
        );
        for skill in compiled.injected.clone() {
            if !ctx.injected.contains(&skill) {
                let payload = serde_json::json!({ "skill": skill.to_string() });
                ctx.injected.push(skill);
                ctx.emit(EventKind::SkillInjected, Some(&turn_id), Some(&step_id), payload).await?;
            }
        }
        ctx.emit(EventKind::PromptCompiled, Some(&turn_id), Some(&step_id), compiled.summary())
            .await?;

        let request = ChatRequest {
            messages: compiled.messages,
            tools: ctx.registry.definitions(),
            model: ctx.config.llm.executor_model.clone(),
        };
        ctx.emit(
            EventKind::LlmRequestStarted,
            Some(&turn_id),
            Some(&step_id),
            serde_json::json!({ "model": request.model, "tools": request.tools.len() }),
        )
        .await?;

        let streamed = match stream_completion(ctx, request, &turn_id, &step_id).await {
            Ok(streamed) => streamed,
            Err(e) if e.kind() == ErrorKind::ContextLengthExceeded => {
                match recover_context(ctx, &turn_id).await? {
                    Recovered::Retry => continue,
                    Recovered::Terminal => return Ok(()),
                }
            }
            Err(e) => {
                let message = e.to_string();
                return ctx.terminal_failed(e.kind(), &message, error_details(&e)).await;
            }
        };
        let turn = match streamed {
            StreamedTurn::Cancelled { partial } => {
                return ctx.terminal_cancelled("external_cancel", Some(&partial)).await;
            }
            StreamedTurn::Finished(turn) => turn,
        };

        // Tool calls are recorded in sanitized form only; raw model
        // arguments never reach the WAL.
        let sanitized_calls: Vec<Value> = turn
            .tool_calls
            .iter()
            .map(|call| sanitized_call_value(&ctx.registry, call))
            .collect();
        ctx.emit(
            EventKind::LlmResponseCompleted,
            Some(&turn_id),
            Some(&step_id),
            serde_json::json!({
                "text": turn.text,
                "tool_calls": sanitized_calls,
                "usage": turn.usage,
                "finish_reason": turn.finish_reason,
            }),
        )
        .await?;
        if let Some(usage) = &turn.usage {
            ctx.usage.accumulate(usage);
        }

        if turn.tool_calls.is_empty() {
            return ctx.terminal_completed(&turn.text).await;
        }

        ctx.history.push(Message::assistant_with_tool_calls(&turn.text, &turn.tool_calls));

        for call in &turn.tool_calls {
            if ctx.cancel.is_cancelled() {
                return ctx.terminal_cancelled("external_cancel", Some(&turn.text)).await;
            }
            // A tool call is one budgeted step too.
            let step = match ctx.controller.begin_step() {
                Ok(step) => step,
                Err(e) => {
                    return ctx
                        .terminal_failed(ErrorKind::Budget, &e.to_string(), Value::Null)
                        .await
                }
            };
            let step_id = format!("s{step}");

            let (result, fatal) = {
                let mut dispatcher = Dispatcher {
                    config: &ctx.config,
                    registry: &*ctx.registry,
                    sandbox_adapter: ctx.sandbox.as_ref(),
                    approvals: ctx.approvals.as_ref(),
                    cache: &mut ctx.cache,
                    emitter: &mut ctx.emitter,
                    cancel: &ctx.cancel,
                    session_env: &ctx.session_env,
                    run_id: &ctx.run_id,
                    turn_id: &turn_id,
                };
                dispatcher.execute(call, &step_id).await?
            };

            ctx.history.push(Message::tool_result(&call.call_id, result.content_for_model()));

            match fatal {
                None => {
                    if result.error_kind == Some(ErrorKind::Cancelled) {
                        return ctx.terminal_cancelled("external_cancel", None).await;
                    }
                }
                Some(FatalAfterTool::Abort) => {
                    return ctx.terminal_cancelled("approval_abort", None).await;
                }
                Some(FatalAfterTool::LoopGuard) => {
                    return ctx
                        .terminal_failed(
                            ErrorKind::ConfigError,
                            "approval loop guard: the same request was denied repeatedly",
                            Value::Null,
                        )
                        .await;
                }
                Some(FatalAfterTool::MissingProvider) => {
                    return ctx
                        .terminal_failed(
                            ErrorKind::ConfigError,
                            "approval required but no approval provider is configured",
                            Value::Null,
                        )
                        .await;
                }
            }
        }
        // Tool messages are in history; run the next turn.
    }
}

/// The audit-safe projection of one tool call for event payloads.
fn sanitized_call_value(registry: &ToolRegistry, call: &ToolCall) -> Value {
    let arguments = match registry.get(&call.tool_name) {
        Some(entry) => {
            sanitize::sanitize(&call.tool_name, entry.safety.sanitizer, &call.arguments).request
        }
        None => serde_json::json!({ "unregistered": true }),
    };
    serde_json::json!({
        "call_id": call.call_id,
        "tool_name": call.tool_name,
        "arguments": arguments,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct CompletedTurn {
    text: String,
    tool_calls: Vec<ToolCall>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
}

enum StreamedTurn {
    Finished(CompletedTurn),
    Cancelled { partial: String },
}

/// Consume one completion stream. Tool-call arguments are buffered per
/// `call_id` until finalized; partial deltas never become events.
async fn stream_completion(
    ctx: &mut RunContext,
    request: ChatRequest,
    turn_id: &str,
    step_id: &str,
) -> Result<StreamedTurn> {
    let mut stream = ctx.backend.chat_stream(request).await?;

    let mut text = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut buffers: HashMap<String, (String, String)> = HashMap::new();
    let mut usage = None;
    let mut finish_reason = None;

    loop {
        let item = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Ok(StreamedTurn::Cancelled { partial: text });
            }
            item = stream.next() => item,
        };
        let Some(item) = item else { break };
        match item? {
            StreamEvent::Token { text: delta } => {
                text.push_str(&delta);
                ctx.emit(
                    EventKind::LlmResponseDelta,
                    Some(turn_id),
                    Some(step_id),
                    serde_json::json!({ "text": delta }),
                )
                .await?;
            }
            StreamEvent::ToolCallStarted { call_id, tool_name } => {
                buffers.insert(call_id, (tool_name, String::new()));
            }
            StreamEvent::ToolCallDelta { call_id, delta } => {
                if let Some((_, arguments)) = buffers.get_mut(&call_id) {
                    arguments.push_str(&delta);
                }
            }
            StreamEvent::ToolCallFinished { call_id, tool_name, arguments } => {
                buffers.remove(&call_id);
                tool_calls.push(ToolCall { call_id, tool_name, arguments });
            }
            StreamEvent::Done { usage: reported, finish_reason: reason } => {
                usage = reported;
                finish_reason = reason;
            }
        }
    }

    // Seal calls that streamed start/delta but no finish marker (some
    // backends only use start+delta).
    for (call_id, (tool_name, raw)) in buffers.drain() {
        let arguments = if raw.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            match serde_json::from_str(&raw) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(
                        call_id = %call_id,
                        tool = %tool_name,
                        error = %e,
                        "tool call arguments are not valid JSON; defaulting to empty object"
                    );
                    Value::Object(Default::default())
                }
            }
        };
        tool_calls.push(ToolCall { call_id, tool_name, arguments });
    }

    Ok(StreamedTurn::Finished(CompletedTurn { text, tool_calls, usage, finish_reason }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context recovery
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum Recovered {
    Retry,
    Terminal,
}

async fn recover_context(ctx: &mut RunContext, turn_id: &str) -> Result<Recovered> {
    match ctx.controller.on_context_overflow(ctx.human.is_some()) {
        RecoveryAction::FailFast => {
            ctx.terminal_failed(
                ErrorKind::ContextLengthExceeded,
                "prompt exceeds the model context window",
                Value::Null,
            )
            .await?;
            Ok(Recovered::Terminal)
        }
        RecoveryAction::Compact => compact_history(ctx, turn_id).await,
        RecoveryAction::Ask => {
            let Some(human) = ctx.human.clone() else {
                return compact_history(ctx, turn_id).await;
            };
            let request = HumanRequest {
                prompt: "The conversation no longer fits the model's context window. How should the run proceed?".into(),
                options: vec!["compact".into(), "increase_budget".into(), "abort".into()],
            };
            ctx.emit(
                EventKind::HumanRequest,
                Some(turn_id),
                None,
                serde_json::json!({ "prompt": request.prompt, "options": request.options }),
            )
            .await?;

            let choice = tokio::select! {
                _ = ctx.cancel.cancelled() => "abort".to_string(),
                answer = human.request(&request) => answer?,
            };
            ctx.emit(
                EventKind::HumanResponse,
                Some(turn_id),
                None,
                serde_json::json!({ "choice": choice }),
            )
            .await?;

            match choice.as_str() {
                "compact" => compact_history(ctx, turn_id).await,
                "increase_budget" => {
                    ctx.controller.extend_budgets();
                    Ok(Recovered::Retry)
                }
                _ => {
                    ctx.terminal_cancelled("user_abort", None).await?;
                    Ok(Recovered::Terminal)
                }
            }
        }
    }
}

/// The tools-disabled compaction turn.
async fn compact_history(ctx: &mut RunContext, turn_id: &str) -> Result<Recovered> {
    let step = match ctx.controller.begin_step() {
        Ok(step) => step,
        Err(e) => {
            ctx.terminal_failed(ErrorKind::Budget, &e.to_string(), Value::Null).await?;
            return Ok(Recovered::Terminal);
        }
    };
    let step_id = format!("s{step}");

    let Some(prompt_text) = ctx.controller.compaction_prompt(&ctx.history) else {
        ctx.terminal_failed(
            ErrorKind::ContextLengthExceeded,
            "context window exceeded and nothing is left to compact",
            Value::Null,
        )
        .await?;
        return Ok(Recovered::Terminal);
    };

    ctx.emit(
        EventKind::LlmRequestStarted,
        Some(turn_id),
        Some(&step_id),
        serde_json::json!({ "purpose": "compaction" }),
    )
    .await?;
    let request = ChatRequest {
        messages: vec![Message::user(prompt_text)],
        tools: Vec::new(),
        model: ctx.config.llm.executor_model.clone(),
    };

    match stream_completion(ctx, request, turn_id, &step_id).await {
        Ok(StreamedTurn::Cancelled { .. }) => {
            ctx.terminal_cancelled("external_cancel", None).await?;
            Ok(Recovered::Terminal)
        }
        Ok(StreamedTurn::Finished(turn)) => {
            ctx.emit(
                EventKind::LlmResponseCompleted,
                Some(turn_id),
                Some(&step_id),
                serde_json::json!({
                    "text": turn.text,
                    "tool_calls": [],
                    "compaction": true,
                    "usage": turn.usage,
                }),
            )
            .await?;
            if let Some(usage) = &turn.usage {
                ctx.usage.accumulate(usage);
            }
            ctx.history = ctx.controller.apply_compaction(&ctx.history, &turn.text);
            ctx.controller.record_compaction();
            tracing::info!(
                run_id = %ctx.run_id,
                compactions = ctx.controller.compactions_done(),
                "history compacted, retrying turn"
            );
            Ok(Recovered::Retry)
        }
        Err(e) if e.kind() == ErrorKind::ContextLengthExceeded => {
            ctx.terminal_failed(
                ErrorKind::ContextLengthExceeded,
                "compaction turn itself exceeded the context window",
                Value::Null,
            )
            .await?;
            Ok(Recovered::Terminal)
        }
        Err(e) => {
            let message = e.to_string();
            ctx.terminal_failed(e.kind(), &message, error_details(&e)).await?;
            Ok(Recovered::Terminal)
        }
    }
}
