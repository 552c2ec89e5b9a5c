//! Retry-and-fallback orchestration over two backends
//!
//! What this module provides
//! - `LlmFallback`: calls a primary backend, retries transient failures with exponential
//!   backoff, then makes exactly one call against a fallback backend
//!
//! Exports
//! - Models
//!   - `Backoff { initial, factor, max }` with `delay_for_attempt(n) = initial * factor^n`,
//!     optionally capped at `max`
//!   - `RETRYABLE_CODES`: 408, 429, 503, 504
//! - Traits
//!   - `Sleeper`: injectable pause between retries; `TokioSleeper` is the default
//! - Services
//!   - `LlmFallback` implements both `LlmBackend` and `Service<LlmRequest>`, so fallbacks nest
//!     and sit inside Tower stacks
//!
//! Retry rules
//! - Only call failures whose code is in `RETRYABLE_CODES` are retried, and only while the
//!   number of primary attempts is below `retry_before_fallback`
//! - Token-limit, non-retryable and unclassified failures go to the fallback at once
//! - The primary is always attempted at least once
//! - When the fallback fails too, its error is returned with the primary's error at the root
//!   of its cause chain
//! - A cancelled backoff ends the call with `LlmErrorKind::Cancelled`, caused by the primary's
//!   last error, and skips the fallback
//!
//! Concurrency
//! - `invoke` keeps its attempt counter on the stack; the orchestrator itself is immutable and
//!   can be shared across tasks when the wrapped backends allow it
//! - Retries and the fallback call run strictly one after another

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::{debug, info_span, warn, Instrument};

use crate::config::{duration_ms, FallbackConfig};
use crate::error::{LlmError, Result};
use crate::messages::ChatMessage;
use crate::provider::{LlmBackend, LlmOptions, LlmRequest, LlmResult};

/// Status codes worth another attempt against the same backend.
pub const RETRYABLE_CODES: [u16; 4] = [408, 429, 503, 504];

/// Whether a call failure with `code` is worth retrying.
pub fn is_retryable_code(code: u16) -> bool {
    RETRYABLE_CODES.contains(&code)
}

/// Whether the primary should be called again after `error`.
pub fn is_retryable(error: &LlmError) -> bool {
    error.code().is_some_and(is_retryable_code)
}

/// Exponential delay between primary attempts.
///
/// Uncapped by default; `max` is an opt-in ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    #[serde(rename = "initial_ms", with = "duration_ms")]
    pub initial: Duration,
    pub factor: f64,
    #[serde(
        rename = "max_ms",
        with = "duration_ms::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub max: Option<Duration>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1), 1.25)
    }
}

impl Backoff {
    /// Uncapped backoff of `initial * factor^n`.
    pub fn exponential(initial: Duration, factor: f64) -> Self {
        Self {
            initial,
            factor,
            max: None,
        }
    }

    /// Cap every delay at `max`.
    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = Some(max);
        self
    }

    /// Delay before the retry that follows failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ceiling = self.max.unwrap_or(Duration::MAX);
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.factor.powi(exponent);
        if !secs.is_finite() {
            return ceiling;
        }
        Duration::try_from_secs_f64(secs.max(0.0))
            .map_or(ceiling, |delay| delay.min(ceiling))
    }
}

/// Waits out a backoff delay.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

/// Sleeps on the Tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// Primary backend with retries, backed by a fallback backend.
#[derive(Clone)]
pub struct LlmFallback {
    name: String,
    primary: Arc<dyn LlmBackend>,
    fallback: Arc<dyn LlmBackend>,
    retry_before_fallback: usize,
    backoff: Backoff,
    sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for LlmFallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmFallback")
            .field("name", &self.name)
            .field("primary", &self.primary.name())
            .field("fallback", &self.fallback.name())
            .field("retry_before_fallback", &self.retry_before_fallback)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl LlmFallback {
    /// Two primary attempts, default backoff, Tokio timer.
    pub fn new(primary: Arc<dyn LlmBackend>, fallback: Arc<dyn LlmBackend>) -> Self {
        Self::builder(primary, fallback).build()
    }

    pub fn from_config(
        primary: Arc<dyn LlmBackend>,
        fallback: Arc<dyn LlmBackend>,
        config: &FallbackConfig,
    ) -> Self {
        Self::builder(primary, fallback).config(config).build()
    }

    pub fn builder(primary: Arc<dyn LlmBackend>, fallback: Arc<dyn LlmBackend>) -> LlmFallbackBuilder {
        LlmFallbackBuilder::new(primary, fallback)
    }

    pub fn primary(&self) -> &Arc<dyn LlmBackend> {
        &self.primary
    }

    pub fn fallback(&self) -> &Arc<dyn LlmBackend> {
        &self.fallback
    }

    pub fn retry_before_fallback(&self) -> usize {
        self.retry_before_fallback
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Like [`LlmBackend::invoke`], but a cancelled `token` interrupts any backoff wait.
    pub async fn invoke_with_cancel(
        &self,
        messages: &[ChatMessage],
        options: &LlmOptions,
        token: &CancellationToken,
    ) -> Result<LlmResult> {
        self.run(messages, options, Some(token)).await
    }

    async fn run(
        &self,
        messages: &[ChatMessage],
        options: &LlmOptions,
        token: Option<&CancellationToken>,
    ) -> Result<LlmResult> {
        let span = info_span!(
            "llm_fallback",
            llm = %self.name,
            primary = self.primary.name(),
            fallback = self.fallback.name()
        );
        async move {
            let primary_error = match self.call_primary_with_retry(messages, options, token).await {
                Ok(result) => return Ok(result),
                Err(e) => e,
            };
            if primary_error.is_cancelled() {
                return Err(primary_error);
            }

            warn!("Primary failed: {}. Switching to fallback", primary_error);
            match self.fallback.invoke(messages, options).await {
                Ok(result) => {
                    debug!("Fallback succeeded");
                    Ok(result)
                }
                Err(fallback_error) => {
                    warn!("Fallback failed: {}", fallback_error);
                    Err(fallback_error.with_root_cause(primary_error))
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn call_primary_with_retry(
        &self,
        messages: &[ChatMessage],
        options: &LlmOptions,
        token: Option<&CancellationToken>,
    ) -> Result<LlmResult> {
        let mut attempt: u32 = 0;
        loop {
            match self.primary.invoke(messages, options).await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!("Primary succeeded after {} attempts", attempt + 1);
                    }
                    return Ok(result);
                }
                Err(error) => {
                    attempt += 1;
                    if !is_retryable(&error) {
                        debug!("Non-retryable error: {}", error);
                        return Err(error);
                    }
                    if attempt as usize >= self.retry_before_fallback {
                        warn!(
                            "Max attempts ({}) reached. Last error: {}",
                            self.retry_before_fallback, error
                        );
                        return Err(error);
                    }

                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(
                        "Attempt {} failed: {}. Retrying in {:?}...",
                        attempt, error, delay
                    );
                    if !self.pause(delay, token).await {
                        return Err(LlmError::cancelled().caused_by(error));
                    }
                }
            }
        }
    }

    /// Wait out `delay`; false when `token` was cancelled first.
    async fn pause(&self, delay: Duration, token: Option<&CancellationToken>) -> bool {
        match token {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!("Backoff cancelled");
                        false
                    }
                    _ = self.sleeper.sleep(delay) => true,
                }
            }
            None => {
                self.sleeper.sleep(delay).await;
                true
            }
        }
    }
}

#[async_trait]
impl LlmBackend for LlmFallback {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, messages: &[ChatMessage], options: &LlmOptions) -> Result<LlmResult> {
        self.run(messages, options, None).await
    }
}

impl Service<LlmRequest> for LlmFallback {
    type Response = LlmResult;
    type Error = LlmError;
    type Future = Pin<Box<dyn Future<Output = Result<LlmResult>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: LlmRequest) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { this.run(&req.messages, &req.options, None).await })
    }
}

/// Builder for [`LlmFallback`]
pub struct LlmFallbackBuilder {
    primary: Arc<dyn LlmBackend>,
    fallback: Arc<dyn LlmBackend>,
    name: Option<String>,
    config: FallbackConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl LlmFallbackBuilder {
    pub fn new(primary: Arc<dyn LlmBackend>, fallback: Arc<dyn LlmBackend>) -> Self {
        Self {
            primary,
            fallback,
            name: None,
            config: FallbackConfig::default(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn config(mut self, config: &FallbackConfig) -> Self {
        self.config = config.clone();
        self
    }

    /// Primary attempts before failing over. Zero is treated as one.
    pub fn retry_before_fallback(mut self, attempts: usize) -> Self {
        self.config.retry_before_fallback = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn build(self) -> LlmFallback {
        let name = self
            .name
            .unwrap_or_else(|| format!("{}+{}", self.primary.name(), self.fallback.name()));
        LlmFallback {
            name,
            primary: self.primary,
            fallback: self.fallback,
            retry_before_fallback: self.config.retry_before_fallback.max(1),
            backoff: self.config.backoff,
            sleeper: self.sleeper,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, MockErrorBackend, RecordingSleeper, ScriptedBackend};
    use pretty_assertions::assert_eq;

    fn messages() -> Vec<ChatMessage> {
        vec![ChatMessage::user("hello")]
    }

    #[test]
    fn retryable_codes() {
        for code in [408, 429, 503, 504] {
            assert!(is_retryable(&LlmError::call(code, "")));
        }
        for code in [400, 401, 404, 500, 502] {
            assert!(!is_retryable(&LlmError::call(code, "")));
        }
        assert!(!is_retryable(&LlmError::token_limit(10, 5, "m")));
        assert!(!is_retryable(&LlmError::invocation("x")));
    }

    #[test]
    fn backoff_grows_by_a_quarter() {
        let backoff = Backoff::default();
        let delays: Vec<_> = (1..=5).map(|n| backoff.delay_for_attempt(n)).collect();
        assert_eq!(delays[0], Duration::from_secs_f64(1.25));
        assert_eq!(delays[1], Duration::from_secs_f64(1.5625));
        for pair in delays.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn backoff_is_capped() {
        let backoff =
            Backoff::exponential(Duration::from_secs(1), 2.0).with_max(Duration::from_secs(5));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(5));
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn default_backoff_keeps_growing_past_a_minute() {
        let backoff = Backoff::default();
        assert_eq!(backoff.max, None);
        let delays: Vec<_> = (1..=40).map(|n| backoff.delay_for_attempt(n)).collect();
        assert!(delays[19] > Duration::from_secs(60));
        for pair in delays.windows(2) {
            assert!(pair[1] > pair[0]);
        }
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::MAX);
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        let llm = LlmFallback::builder(
            Arc::new(MockBackend::from_response("a")),
            Arc::new(MockBackend::from_response("b")),
        )
        .retry_before_fallback(0)
        .build();
        assert_eq!(llm.retry_before_fallback(), 1);
        assert_eq!(llm.name(), "mock+mock");
    }

    #[tokio::test]
    async fn zero_attempts_still_calls_primary_once() {
        let primary = ScriptedBackend::new(vec![Err(LlmError::call(429, "busy"))]);
        let fallback = MockBackend::from_response("fallback");
        let sleeper = Arc::new(RecordingSleeper::default());
        let llm = LlmFallback::builder(Arc::new(primary.clone()), Arc::new(fallback.clone()))
            .retry_before_fallback(0)
            .sleeper(sleeper.clone())
            .build();

        let result = llm.invoke(&messages(), &LlmOptions::new()).await.unwrap();
        assert_eq!(result.first_choice(), "fallback");
        assert_eq!(primary.calls(), 1);
        assert!(sleeper.delays().is_empty());
    }

    #[tokio::test]
    async fn retries_then_recovers_on_primary() {
        let primary = ScriptedBackend::new(vec![
            Err(LlmError::call(503, "unavailable")),
            Err(LlmError::call(504, "gateway")),
            Ok(LlmResult::single("primary")),
        ]);
        let fallback = MockBackend::from_response("fallback");
        let sleeper = Arc::new(RecordingSleeper::default());
        let llm = LlmFallback::builder(Arc::new(primary.clone()), Arc::new(fallback.clone()))
            .retry_before_fallback(3)
            .sleeper(sleeper.clone())
            .build();

        let result = llm.invoke(&messages(), &LlmOptions::new()).await.unwrap();
        assert_eq!(result.first_choice(), "primary");
        assert_eq!(primary.calls(), 3);
        assert_eq!(fallback.calls(), 0);
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_secs_f64(1.25), Duration::from_secs_f64(1.5625)]
        );
    }

    #[tokio::test]
    async fn fallback_failure_keeps_primary_as_root_cause() {
        let primary = MockErrorBackend::new(LlmError::token_limit(500, 100, "small"));
        let fallback = MockErrorBackend::new(LlmError::invocation("fallback down"));
        let llm = LlmFallback::new(Arc::new(primary.clone()), Arc::new(fallback.clone()));

        let err = llm.invoke(&messages(), &LlmOptions::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "LLM invocation failed: fallback down");
        assert!(err.cause().is_some_and(LlmError::is_token_limit));
        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn default_sleeper_waits_on_tokio_timer() {
        let primary = ScriptedBackend::new(vec![
            Err(LlmError::call(408, "timeout")),
            Ok(LlmResult::single("late")),
        ]);
        let llm = LlmFallback::new(
            Arc::new(primary.clone()),
            Arc::new(MockBackend::from_response("fallback")),
        );

        let started = tokio::time::Instant::now();
        let result = llm.invoke(&messages(), &LlmOptions::new()).await.unwrap();
        assert_eq!(result.first_choice(), "late");
        assert!(started.elapsed() >= Duration::from_secs_f64(1.25));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_backoff_skips_fallback() {
        let primary = MockErrorBackend::new(LlmError::call(429, "busy"));
        let fallback = MockBackend::from_response("fallback");
        let llm = LlmFallback::new(Arc::new(primary.clone()), Arc::new(fallback.clone()));

        let token = CancellationToken::new();
        token.cancel();
        let err = llm
            .invoke_with_cancel(&messages(), &LlmOptions::new(), &token)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.cause().and_then(LlmError::code), Some(429));
        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn works_as_tower_service() {
        use tower::ServiceExt;

        let mut llm = LlmFallback::new(
            Arc::new(MockErrorBackend::new(LlmError::call(400, "bad"))),
            Arc::new(MockBackend::from_response("fallback")),
        );
        let req = LlmRequest::new(messages());
        let result = llm.ready().await.unwrap().call(req).await.unwrap();
        assert_eq!(result.first_choice(), "fallback");
    }
}
