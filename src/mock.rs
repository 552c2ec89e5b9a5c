//! Test doubles for backends and backoff
//!
//! - `MockBackend`: answers every call from a closure over the conversation
//! - `MockErrorBackend`: fails every call with the same error
//! - `ScriptedBackend`: plays back a fixed sequence of outcomes
//! - `RecordingSleeper`: returns immediately and remembers each requested delay
//!
//! Every backend counts its calls; clones share the counter, so a test can hand one clone to
//! the orchestrator and inspect the other.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{LlmError, Result};
use crate::fallback::Sleeper;
use crate::messages::ChatMessage;
use crate::provider::{LlmBackend, LlmOptions, LlmResult};

type Action = Arc<dyn Fn(&[ChatMessage]) -> Vec<String> + Send + Sync>;

#[derive(Clone)]
pub struct MockBackend {
    name: String,
    action: Action,
    calls: Arc<AtomicUsize>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new(|_| vec!["MockBackend".to_string()])
    }
}

impl MockBackend {
    pub fn new(action: impl Fn(&[ChatMessage]) -> Vec<String> + Send + Sync + 'static) -> Self {
        Self {
            name: "mock".to_string(),
            action: Arc::new(action),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn from_response(response: impl Into<String>) -> Self {
        let response = response.into();
        Self::new(move |_| vec![response.clone()])
    }

    pub fn from_responses(responses: Vec<String>) -> Self {
        Self::new(move |_| responses.clone())
    }

    /// One choice made of all `lines` joined with newlines.
    pub fn from_multi_line_response(lines: Vec<String>) -> Self {
        Self::from_response(lines.join("\n"))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, messages: &[ChatMessage], _options: &LlmOptions) -> Result<LlmResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        LlmResult::new((self.action)(messages))
    }
}

#[derive(Clone)]
pub struct MockErrorBackend {
    name: String,
    error: LlmError,
    calls: Arc<AtomicUsize>,
}

impl MockErrorBackend {
    pub fn new(error: LlmError) -> Self {
        Self {
            name: "mock-error".to_string(),
            error,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmBackend for MockErrorBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, _messages: &[ChatMessage], _options: &LlmOptions) -> Result<LlmResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// Returns queued outcomes in order; fails once the script runs out.
#[derive(Clone)]
pub struct ScriptedBackend {
    name: String,
    script: Arc<Mutex<VecDeque<Result<LlmResult>>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn new(outcomes: Vec<Result<LlmResult>>) -> Self {
        Self {
            name: "scripted".to_string(),
            script: Arc::new(Mutex::new(outcomes.into())),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Queue another outcome after the ones already scripted.
    pub fn push(&self, outcome: Result<LlmResult>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(outcome);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, _messages: &[ChatMessage], _options: &LlmOptions) -> Result<LlmResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        next.unwrap_or_else(|| Err(LlmError::invocation("script exhausted")))
    }
}

#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, delay: Duration) {
        self.delays
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_responses() {
        let opts = LlmOptions::new();
        let msgs = [ChatMessage::user("q")];

        let r = MockBackend::default().invoke(&msgs, &opts).await.unwrap();
        assert_eq!(r.first_choice(), "MockBackend");

        let r = MockBackend::from_responses(vec!["a".into(), "b".into()])
            .invoke(&msgs, &opts)
            .await
            .unwrap();
        assert_eq!(r.choices().len(), 2);

        let r = MockBackend::from_multi_line_response(vec!["l1".into(), "l2".into()])
            .invoke(&msgs, &opts)
            .await
            .unwrap();
        assert_eq!(r.first_choice(), "l1\nl2");

        let err = MockBackend::from_responses(vec![]).invoke(&msgs, &opts).await.unwrap_err();
        assert!(err.to_string().contains("no choices"));
    }

    #[tokio::test]
    async fn scripted_backend_plays_in_order_then_fails() {
        let backend = ScriptedBackend::new(vec![Err(LlmError::call(429, "busy"))]);
        backend.push(Ok(LlmResult::single("ok")));
        let opts = LlmOptions::new();

        assert_eq!(backend.invoke(&[], &opts).await.unwrap_err().code(), Some(429));
        assert_eq!(backend.invoke(&[], &opts).await.unwrap().first_choice(), "ok");
        assert!(backend.invoke(&[], &opts).await.is_err());
        assert_eq!(backend.calls(), 3);
    }
}
