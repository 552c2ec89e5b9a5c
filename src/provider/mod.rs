//! Backend invocation contract
//!
//! What this module provides
//! - The seam between the fallback core and concrete LLM backends (HTTP clients, local mocks)
//!
//! Exports
//! - Models
//!   - `LlmOptions`: open option map with typed accessors for the recognized keys
//!   - `LlmResult { choices }`: non-empty list of candidate completions
//!   - `LlmRequest { messages, options }`: owned request for Tower services
//! - Traits
//!   - `LlmBackend`: `invoke(&[ChatMessage], &LlmOptions) -> Result<LlmResult>`
//! - Adapters
//!   - `BackendService<B>`: any `LlmBackend` as `Service<LlmRequest>`
//!   - `ServiceBackend<S>`: any `Service<LlmRequest, Response = LlmResult, Error = LlmError>` as `LlmBackend`
//!
//! Contract for implementors
//! - Transient remote failures surface as `LlmError::call(code, ..)` with the real status code
//! - Token accounting breaches surface as `LlmError::token_limit(..)`
//! - Anything else is an unclassified `LlmError::invocation(..)`
//! - Unknown option keys are ignored or forwarded, never rejected

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tower::{Service, ServiceExt};

use crate::error::{LlmError, Result};
use crate::messages::ChatMessage;

/// Option keys understood by the bundled helpers.
pub mod keys {
    pub const MODEL: &str = "model";
    pub const TEMPERATURE: &str = "temperature";
    pub const MAX_TOKENS: &str = "max_tokens";
    pub const TOP_P: &str = "top_p";
    pub const N: &str = "n";
    pub const STOP: &str = "stop";
}

/// Backend-specific request options.
///
/// Recognized keys are listed in [`keys`]; everything else is carried through untouched
/// for the backend to interpret.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LlmOptions(Map<String, Value>);

impl LlmOptions {
    /// Empty option map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an arbitrary option.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Set the model name.
    pub fn model(self, model: impl Into<String>) -> Self {
        self.with(keys::MODEL, model.into())
    }

    /// Set the sampling temperature.
    pub fn temperature(self, temperature: f64) -> Self {
        self.with(keys::TEMPERATURE, temperature)
    }

    /// Set the completion token budget.
    pub fn max_tokens(self, max_tokens: u64) -> Self {
        self.with(keys::MAX_TOKENS, max_tokens)
    }

    /// Set nucleus sampling mass.
    pub fn top_p(self, top_p: f64) -> Self {
        self.with(keys::TOP_P, top_p)
    }

    /// Set how many choices to request.
    pub fn n(self, n: u64) -> Self {
        self.with(keys::N, n)
    }

    /// Set stop sequences.
    pub fn stop(self, stop: Vec<String>) -> Self {
        self.with(keys::STOP, stop)
    }

    /// Raw value of any option.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Model name, if set as a string.
    pub fn get_model(&self) -> Option<&str> {
        self.get(keys::MODEL).and_then(Value::as_str)
    }

    /// Temperature, if set as a number.
    pub fn get_temperature(&self) -> Option<f64> {
        self.get(keys::TEMPERATURE).and_then(Value::as_f64)
    }

    /// Token budget, if set as an unsigned integer.
    pub fn get_max_tokens(&self) -> Option<u64> {
        self.get(keys::MAX_TOKENS).and_then(Value::as_u64)
    }

    /// Nucleus sampling mass, if set as a number.
    pub fn get_top_p(&self) -> Option<f64> {
        self.get(keys::TOP_P).and_then(Value::as_f64)
    }

    /// Requested choice count, if set as an unsigned integer.
    pub fn get_n(&self) -> Option<u64> {
        self.get(keys::N).and_then(Value::as_u64)
    }

    /// Stop sequences; `None` unless every entry is a string.
    pub fn get_stop(&self) -> Option<Vec<String>> {
        let items = self.get(keys::STOP)?.as_array()?;
        items
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect()
    }

    /// True when no option is set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// All options in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl From<Map<String, Value>> for LlmOptions {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Successful invocation: one or more candidate completions, best first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawLlmResult")]
pub struct LlmResult {
    choices: Vec<String>,
}

#[derive(Deserialize)]
struct RawLlmResult {
    choices: Vec<String>,
}

impl TryFrom<RawLlmResult> for LlmResult {
    type Error = LlmError;

    fn try_from(raw: RawLlmResult) -> Result<Self> {
        Self::new(raw.choices)
    }
}

impl LlmResult {
    /// Fails with an invocation error when `choices` is empty.
    pub fn new(choices: Vec<String>) -> Result<Self> {
        if choices.is_empty() {
            return Err(LlmError::invocation("backend returned no choices"));
        }
        Ok(Self { choices })
    }

    /// Result with exactly one choice.
    pub fn single(choice: impl Into<String>) -> Self {
        Self {
            choices: vec![choice.into()],
        }
    }

    /// All choices, best first.
    pub fn choices(&self) -> &[String] {
        &self.choices
    }

    /// Best choice.
    pub fn first_choice(&self) -> &str {
        self.choices.first().map(String::as_str).unwrap_or_default()
    }

    /// Take ownership of the choices.
    pub fn into_choices(self) -> Vec<String> {
        self.choices
    }
}

/// Owned request, used where a backend sits behind a Tower service.
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub messages: Vec<ChatMessage>,
    pub options: LlmOptions,
}

impl LlmRequest {
    /// Request with no options.
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            options: LlmOptions::default(),
        }
    }

    /// Replace the options.
    pub fn with_options(mut self, options: LlmOptions) -> Self {
        self.options = options;
        self
    }
}

/// A remote (or simulated) LLM endpoint.
///
/// Implementations are selected at construction time and used only through this trait.
/// They must be safe to call concurrently if the orchestrator wrapping them is shared.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        "llm"
    }

    /// Send the conversation and return the candidate completions.
    async fn invoke(&self, messages: &[ChatMessage], options: &LlmOptions) -> Result<LlmResult>;
}

#[async_trait]
impl<B> LlmBackend for Arc<B>
where
    B: LlmBackend + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn invoke(&self, messages: &[ChatMessage], options: &LlmOptions) -> Result<LlmResult> {
        (**self).invoke(messages, options).await
    }
}

/// Exposes an [`LlmBackend`] as a Tower service.
pub struct BackendService<B: ?Sized> {
    backend: Arc<B>,
}

impl<B: ?Sized> BackendService<B> {
    /// Wrap a shared backend.
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }
}

impl<B: ?Sized> Clone for BackendService<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
        }
    }
}

impl<B> Service<LlmRequest> for BackendService<B>
where
    B: LlmBackend + ?Sized + 'static,
{
    type Response = LlmResult;
    type Error = LlmError;
    type Future = Pin<Box<dyn Future<Output = Result<LlmResult>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: LlmRequest) -> Self::Future {
        let backend = self.backend.clone();
        Box::pin(async move { backend.invoke(&req.messages, &req.options).await })
    }
}

/// Adapts a Tower service stack into an [`LlmBackend`].
///
/// Calls are serialized through a mutex because `Service::call` needs `&mut self`.
pub struct ServiceBackend<S> {
    name: String,
    inner: Arc<Mutex<S>>,
}

impl<S> ServiceBackend<S> {
    /// Wrap `inner`, logging under `name`.
    pub fn new(name: impl Into<String>, inner: S) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(Mutex::new(inner)),
        }
    }
}

#[async_trait]
impl<S> LlmBackend for ServiceBackend<S>
where
    S: Service<LlmRequest, Response = LlmResult, Error = LlmError> + Send + 'static,
    S::Future: Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, messages: &[ChatMessage], options: &LlmOptions) -> Result<LlmResult> {
        let req = LlmRequest {
            messages: messages.to_vec(),
            options: options.clone(),
        };
        let mut guard = self.inner.lock().await;
        ServiceExt::ready(&mut *guard).await?.call(req).await
    }
}
