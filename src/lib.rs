//! # Retry-and-fallback for LLM backends
//!
//! A small resilience layer between an application and remote LLM backends. A request goes to
//! a primary backend; transient failures are retried with exponential backoff, and once the
//! primary is exhausted (or fails in a way retrying cannot fix) the request goes to a fallback
//! backend exactly once.
//!
//! ## Core Concepts
//!
//! - **Messages**: [`ChatMessage`] is one immutable turn of conversation produced by a user,
//!   agent, chain or skill; [`ScoredChatMessage`] ranks messages by score
//! - **Errors**: [`LlmError`] classifies failures (unclassified, call failure with a status
//!   code, token limit) and links each one to the failure that caused it
//! - **Backends**: anything implementing [`LlmBackend`]; Tower services plug in through
//!   [`ServiceBackend`]
//! - **Orchestrator**: [`LlmFallback`] retries 408/429/503/504 on the primary, then fails over
//!
//! ## Getting Started
//!
//! ```rust
//! use std::sync::Arc;
//! use tower_llm_fallback::mock::{MockBackend, MockErrorBackend};
//! use tower_llm_fallback::{ChatMessage, LlmBackend, LlmError, LlmFallback, LlmOptions};
//!
//! # async fn example() -> tower_llm_fallback::Result<()> {
//! let primary = MockErrorBackend::new(LlmError::call(400, "bad request"));
//! let fallback = MockBackend::from_response("Hello from the fallback");
//!
//! let llm = LlmFallback::new(Arc::new(primary), Arc::new(fallback));
//! let result = llm
//!     .invoke(&[ChatMessage::user("Hi!")], &LlmOptions::new().temperature(0.2))
//!     .await?;
//!
//! assert_eq!(result.first_choice(), "Hello from the fallback");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod fallback;
pub mod messages;
pub mod mock;
pub mod provider;
pub mod tokens;

pub use config::{ConfigBuilder, ConfigError, FallbackConfig};
pub use error::{LlmError, LlmErrorKind, Result};
pub use fallback::{
    is_retryable, is_retryable_code, Backoff, LlmFallback, LlmFallbackBuilder, Sleeper,
    TokioSleeper, RETRYABLE_CODES,
};
pub use messages::{best_of, ChatMessage, ChatMessageKind, ScoredChatMessage};
pub use provider::{BackendService, LlmBackend, LlmOptions, LlmRequest, LlmResult, ServiceBackend};
pub use tokens::{CharTokenCounter, TokenCounter, TokenGuard, TokenLimit};

// Re-export Tower traits that users need
pub use tower::{Service, ServiceExt};
pub use tokio_util::sync::CancellationToken;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_imports() {
        let _ = std::mem::size_of::<LlmError>();
        let _ = std::mem::size_of::<FallbackConfig>();
    }
}
