//! Model-call collaborator.
//!
//! The processor treats the model as an opaque callable. Provider wire formats,
//! prompt wording and retries at the HTTP level live behind this trait.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::store::Message;

/// Result of a single model call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelOutcome {
    /// Complete response text.
    Text(String),
    /// The model stopped early; the text is what was produced.
    Truncated(String),
    /// The call observed the cancellation token and gave up.
    Aborted,
}

impl ModelOutcome {
    pub fn text(content: impl Into<String>) -> Self {
        ModelOutcome::Text(content.into())
    }
}

/// Trait for model clients.
///
/// Implementations should watch `cancel` and return [`ModelOutcome::Aborted`]
/// once it fires. Transport failures are reported as `Err`.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn call(
        &self,
        system: &str,
        user: &str,
        history: &[Message],
        cancel: &CancellationToken,
    ) -> Result<ModelOutcome>;
}

/// Scripted model client for tests.
#[cfg(test)]
pub struct MockModel {
    /// Outcomes returned in order.
    pub outcomes: std::sync::Mutex<Vec<Result<ModelOutcome>>>,
    /// Every (system, user) pair the client was called with.
    pub calls: std::sync::Mutex<Vec<(String, String)>>,
}

#[cfg(test)]
impl MockModel {
    pub fn new(outcomes: Vec<Result<ModelOutcome>>) -> Self {
        Self {
            outcomes: std::sync::Mutex::new(outcomes),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn texts(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|t| Ok(ModelOutcome::text(*t))).collect())
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[cfg(test)]
#[async_trait]
impl ModelClient for MockModel {
    async fn call(
        &self,
        system: &str,
        user: &str,
        _history: &[Message],
        cancel: &CancellationToken,
    ) -> Result<ModelOutcome> {
        self.calls.lock().unwrap().push((system.to_string(), user.to_string()));
        if cancel.is_cancelled() {
            return Ok(ModelOutcome::Aborted);
        }
        let mut outcomes = self.outcomes.lock().unwrap();
        if outcomes.is_empty() {
            Ok(ModelOutcome::text(""))
        } else {
            outcomes.remove(0)
        }
    }
}
