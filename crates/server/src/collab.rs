//! Collaborative child agents hosted by the runtime server.
//!
//! The server owns the lifecycle (spawn / send_input / wait / close);
//! what a child actually *does* is the embedder's business via
//! [`ChildAgentDriver`]. Drivers must honor cancellation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sr_domain::{Error, Result};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ChildStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Driver seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Runs one child agent to completion. The driver reads queued input
/// lines from `input` and must return promptly once `cancel` fires.
#[async_trait::async_trait]
pub trait ChildAgentDriver: Send + Sync {
    async fn run(
        &self,
        message: String,
        model: Option<String>,
        input: mpsc::Receiver<String>,
        cancel: CancellationToken,
    ) -> Result<String>;
}

/// Loopback driver for tests and wiring checks: completes with the
/// spawn message, or — when the message starts with `"wait:"` — with
/// the first queued input line.
pub struct EchoDriver;

#[async_trait::async_trait]
impl ChildAgentDriver for EchoDriver {
    async fn run(
        &self,
        message: String,
        _model: Option<String>,
        mut input: mpsc::Receiver<String>,
        cancel: CancellationToken,
    ) -> Result<String> {
        if message.starts_with("wait:") {
            tokio::select! {
                line = input.recv() => match line {
                    Some(line) => Ok(format!("echo: {line}")),
                    None => Err(Error::Cancelled("input channel closed".into())),
                },
                _ = cancel.cancelled() => Err(Error::Cancelled("child cancelled".into())),
            }
        } else {
            Ok(format!("echo: {message}"))
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handles + manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ChildHandle {
    status_rx: watch::Receiver<ChildStatus>,
    input_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
    output: Arc<Mutex<Option<String>>>,
    error: Arc<Mutex<Option<String>>>,
}

/// Outcome snapshot returned by `wait` and `close`.
#[derive(Debug, Clone)]
pub struct ChildOutcome {
    pub status: ChildStatus,
    pub output: Option<String>,
    pub error: Option<String>,
}

pub struct ChildManager {
    children: Mutex<HashMap<String, ChildHandle>>,
    driver: Arc<dyn ChildAgentDriver>,
}

impl ChildManager {
    pub fn new(driver: Arc<dyn ChildAgentDriver>) -> Self {
        Self { children: Mutex::new(HashMap::new()), driver }
    }

    pub fn active_count(&self) -> usize {
        self.children
            .lock()
            .values()
            .filter(|handle| !handle.status_rx.borrow().is_terminal())
            .count()
    }

    /// Start a child agent task; returns its id.
    pub fn spawn(&self, message: String, model: Option<String>) -> String {
        let child_id = Uuid::new_v4().to_string();
        let (status_tx, status_rx) = watch::channel(ChildStatus::Running);
        let (input_tx, input_rx) = mpsc::channel::<String>(32);
        let cancel = CancellationToken::new();
        let output = Arc::new(Mutex::new(None));
        let error = Arc::new(Mutex::new(None));

        let driver = Arc::clone(&self.driver);
        let task_cancel = cancel.clone();
        let task_output = Arc::clone(&output);
        let task_error = Arc::clone(&error);
        let task_child_id = child_id.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                result = driver.run(message, model, input_rx, task_cancel.clone()) => result,
                _ = task_cancel.cancelled() => Err(Error::Cancelled("child cancelled".into())),
            };
            let status = match result {
                Ok(text) => {
                    *task_output.lock() = Some(text);
                    ChildStatus::Completed
                }
                Err(e) if e.kind() == sr_domain::ErrorKind::Cancelled => {
                    *task_error.lock() = Some(e.to_string());
                    ChildStatus::Cancelled
                }
                Err(e) => {
                    *task_error.lock() = Some(e.to_string());
                    ChildStatus::Failed
                }
            };
            tracing::debug!(child_id = %task_child_id, ?status, "child agent finished");
            let _ = status_tx.send(status);
        });

        self.children.lock().insert(
            child_id.clone(),
            ChildHandle { status_rx, input_tx, cancel, output, error },
        );
        child_id
    }

    /// Queue one input line. `false` when the child is done or its
    /// queue is full.
    pub fn send_input(&self, child_id: &str, input: String) -> Result<bool> {
        let children = self.children.lock();
        let handle = children
            .get(child_id)
            .ok_or_else(|| Error::NotFound(format!("no child agent {child_id:?}")))?;
        if handle.status_rx.borrow().is_terminal() {
            return Ok(false);
        }
        Ok(handle.input_tx.try_send(input).is_ok())
    }

    /// Block until the child reaches a terminal status or the timeout
    /// elapses; the current snapshot is returned either way.
    pub async fn wait(&self, child_id: &str, timeout_ms: Option<u64>) -> Result<ChildOutcome> {
        let (mut status_rx, output, error) = {
            let children = self.children.lock();
            let handle = children
                .get(child_id)
                .ok_or_else(|| Error::NotFound(format!("no child agent {child_id:?}")))?;
            (handle.status_rx.clone(), Arc::clone(&handle.output), Arc::clone(&handle.error))
        };

        let deadline = timeout_ms.map(|ms| {
            tokio::time::Instant::now() + std::time::Duration::from_millis(ms)
        });
        loop {
            let status = *status_rx.borrow();
            if status.is_terminal() {
                return Ok(ChildOutcome {
                    status,
                    output: output.lock().clone(),
                    error: error.lock().clone(),
                });
            }
            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        changed = status_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep_until(deadline) => {
                            return Ok(ChildOutcome { status, output: None, error: None });
                        }
                    }
                }
                None => {
                    if status_rx.changed().await.is_err() {
                        break;
                    }
                }
            }
        }
        // Status sender dropped without a terminal value: treat as failed.
        Ok(ChildOutcome {
            status: ChildStatus::Failed,
            output: None,
            error: Some("child agent task dropped".into()),
        })
    }

    /// Cooperative cancel. The child winds down on its own schedule;
    /// the response reflects the cancellation immediately.
    pub fn close(&self, child_id: &str) -> Result<ChildStatus> {
        let children = self.children.lock();
        let handle = children
            .get(child_id)
            .ok_or_else(|| Error::NotFound(format!("no child agent {child_id:?}")))?;
        let current = *handle.status_rx.borrow();
        if current.is_terminal() {
            return Ok(current);
        }
        handle.cancel.cancel();
        Ok(ChildStatus::Cancelled)
    }

    /// Cancel every running child. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let children = self.children.lock();
        let mut cancelled = 0;
        for handle in children.values() {
            if !handle.status_rx.borrow().is_terminal() {
                handle.cancel.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
