//! Human-I/O seam: how the loop asks a person something mid-run.

use parking_lot::Mutex;
use serde::Serialize;
use sr_domain::Result;
use std::collections::VecDeque;

/// A question for the human, with the choices the loop can act on.
#[derive(Debug, Clone, Serialize)]
pub struct HumanRequest {
    pub prompt: String,
    pub options: Vec<String>,
}

/// Interactive frontends implement this; absence of a provider makes
/// any `ask_first` path fall back per configuration.
#[async_trait::async_trait]
pub trait HumanIoProvider: Send + Sync {
    /// Returns one of `request.options` (anything else is treated as
    /// the last option, conventionally "abort").
    async fn request(&self, request: &HumanRequest) -> Result<String>;
}

/// Canned answers for tests.
pub struct ScriptedHumanIo {
    answers: Mutex<VecDeque<String>>,
}

impl ScriptedHumanIo {
    pub fn new(answers: Vec<&str>) -> Self {
        Self { answers: Mutex::new(answers.into_iter().map(str::to_string).collect()) }
    }
}

#[async_trait::async_trait]
impl HumanIoProvider for ScriptedHumanIo {
    async fn request(&self, request: &HumanRequest) -> Result<String> {
        match self.answers.lock().pop_front() {
            Some(answer) => Ok(answer),
            None => Ok(request.options.last().cloned().unwrap_or_default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_answers_in_order() {
        let provider = ScriptedHumanIo::new(vec!["compact", "abort"]);
        let request = HumanRequest {
            prompt: "context overflow".into(),
            options: vec!["compact".into(), "increase_budget".into(), "abort".into()],
        };
        assert_eq!(provider.request(&request).await.unwrap(), "compact");
        assert_eq!(provider.request(&request).await.unwrap(), "abort");
        // Exhausted: defaults to the last option.
        assert_eq!(provider.request(&request).await.unwrap(), "abort");
    }
}
