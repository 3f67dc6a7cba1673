use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::TaskError;
use crate::core::runtime::{Invocation, InvocationState};
use crate::llm::{Message, TokenUsage};

/// Middleware around one invocation.
///
/// `before` hooks run in registration order, `after` hooks in reverse order. The first hook
/// whose `intercept` returns `Some` replaces the backend call and response parsing.
pub trait TaskHook: Send + Sync {
    fn before(&self, _invocation: &Invocation) {}

    fn intercept(&self, _invocation: &Invocation) -> Option<Result<Value, TaskError>> {
        None
    }

    /// Called once the invocation reached `Completed` or `Failed`.
    fn after(&self, _invocation: &Invocation) {}
}

/// Emits one log record per invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHook;

impl TaskHook for LoggingHook {
    fn before(&self, invocation: &Invocation) {
        log::debug!(
            "[{}] invoking '{}' with {} messages",
            invocation.id,
            invocation.task,
            invocation.messages.len()
        );
    }

    fn after(&self, invocation: &Invocation) {
        let prompt = invocation
            .messages
            .iter()
            .map(Message::to_string)
            .collect::<Vec<_>>()
            .join("\n");
        match invocation.state() {
            InvocationState::Completed(value) => log::info!(
                "[{}] '{}' completed in {:?} (model: {})\nprompt:\n{}\nresult: {}",
                invocation.id,
                invocation.task,
                invocation.elapsed(),
                invocation.model.as_deref().unwrap_or("unknown"),
                prompt,
                invocation.raw_text.as_deref().unwrap_or(&value.to_string())
            ),
            InvocationState::Failed(error) => log::info!(
                "[{}] '{}' failed in {:?}: {}",
                invocation.id,
                invocation.task,
                invocation.elapsed(),
                error
            ),
            other => log::info!("[{}] '{}' ended in state {:?}", invocation.id, invocation.task, other),
        }
    }
}

/// Short-circuits invocations with a closure, e.g. to serve cached or canned answers.
pub struct InterceptHook<F> {
    intercept: F,
}

impl<F> InterceptHook<F>
where
    F: Fn(&Invocation) -> Option<Result<Value, TaskError>> + Send + Sync,
{
    pub fn new(intercept: F) -> Self {
        Self { intercept }
    }
}

impl<F> TaskHook for InterceptHook<F>
where
    F: Fn(&Invocation) -> Option<Result<Value, TaskError>> + Send + Sync,
{
    fn intercept(&self, invocation: &Invocation) -> Option<Result<Value, TaskError>> {
        (self.intercept)(invocation)
    }
}

/// A single entry in the execution trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub timestamp: u64,
    pub invocation_id: String,
    pub task: String,
    pub inputs: Value,
    pub prompt: Vec<Message>,
    pub raw_text: Option<String>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub model: Option<String>,
    pub usage: Option<TokenUsage>,
    pub elapsed_ms: u64,
}

impl TraceEntry {
    pub fn from_invocation(invocation: &Invocation) -> Self {
        let (output, error) = match invocation.state() {
            InvocationState::Completed(value) => (Some(value.clone()), None),
            InvocationState::Failed(error) => (None, Some(error.clone())),
            _ => (None, None),
        };
        Self {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            invocation_id: invocation.id.to_string(),
            task: invocation.task.clone(),
            inputs: Value::Object(invocation.args.clone()),
            prompt: invocation.messages.clone(),
            raw_text: invocation.raw_text.clone(),
            output,
            error,
            model: invocation.model.clone(),
            usage: invocation.usage,
            elapsed_ms: saturating_millis(invocation.elapsed()),
        }
    }
}

fn saturating_millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Simple in-memory collector of finished invocations.
#[derive(Debug, Default)]
pub struct RecordingHook {
    traces: Mutex<Vec<TraceEntry>>,
}

impl RecordingHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn traces(&self) -> Vec<TraceEntry> {
        self.traces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.traces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl TaskHook for RecordingHook {
    fn after(&self, invocation: &Invocation) {
        self.traces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(TraceEntry::from_invocation(invocation));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_millis_saturate() {
        assert_eq!(saturating_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(saturating_millis(Duration::MAX), u64::MAX);
    }
}
