//! Token accounting in front of a backend
//!
//! A [`TokenCounter`] measures a conversation and rejects it with a token-limit error when it
//! is over the configured [`TokenLimit`]. [`TokenGuard`] runs that check before every call
//! of the backend it wraps, so oversized conversations never reach the network.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LlmError, Result};
use crate::messages::ChatMessage;
use crate::provider::{LlmBackend, LlmOptions, LlmResult};

/// Maximum number of tokens a conversation may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenLimit {
    #[default]
    Unlimited,
    Max(usize),
}

impl TokenLimit {
    /// Map a raw integer limit, where zero or any negative value means unlimited.
    ///
    /// Limits too large for `usize` saturate at `usize::MAX`.
    pub fn from_raw(raw: i64) -> Self {
        if raw > 0 {
            Self::Max(usize::try_from(raw).unwrap_or(usize::MAX))
        } else {
            Self::Unlimited
        }
    }

    /// Ok when `token_count` fits, token-limit error naming `model` otherwise.
    pub fn check(&self, token_count: usize, model: &str) -> Result<()> {
        match *self {
            Self::Max(limit) if token_count > limit => {
                Err(LlmError::token_limit(token_count, limit, model))
            }
            _ => Ok(()),
        }
    }
}

/// Counts the tokens of a conversation for a given model.
pub trait TokenCounter: Send + Sync {
    /// Number of tokens used by `messages`, or a token-limit error when over the limit.
    fn count_messages_token(&self, messages: &[ChatMessage]) -> Result<usize>;
}

/// Treats every character as one token. Good enough for tests and rough budgeting.
#[derive(Debug, Clone)]
pub struct CharTokenCounter {
    model: String,
    limit: TokenLimit,
}

impl CharTokenCounter {
    /// Counter for `model` enforcing `limit`.
    pub fn new(model: impl Into<String>, limit: TokenLimit) -> Self {
        Self {
            model: model.into(),
            limit,
        }
    }

    pub fn unlimited(model: impl Into<String>) -> Self {
        Self::new(model, TokenLimit::Unlimited)
    }
}

impl TokenCounter for CharTokenCounter {
    fn count_messages_token(&self, messages: &[ChatMessage]) -> Result<usize> {
        let count = messages.iter().map(|m| m.text().chars().count()).sum();
        self.limit.check(count, &self.model)?;
        Ok(count)
    }
}

/// Backend decorator that counts tokens before delegating.
pub struct TokenGuard<B, C> {
    inner: B,
    counter: C,
}

impl<B, C> TokenGuard<B, C> {
    pub fn new(inner: B, counter: C) -> Self {
        Self { inner, counter }
    }
}

#[async_trait]
impl<B, C> LlmBackend for TokenGuard<B, C>
where
    B: LlmBackend,
    C: TokenCounter,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn invoke(&self, messages: &[ChatMessage], options: &LlmOptions) -> Result<LlmResult> {
        let tokens = self.counter.count_messages_token(messages)?;
        debug!(backend = self.inner.name(), tokens, "conversation within token limit");
        self.inner.invoke(messages, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmErrorKind;
    use crate::mock::MockBackend;

    #[test]
    fn raw_sentinels_mean_unlimited() {
        assert_eq!(TokenLimit::from_raw(-1), TokenLimit::Unlimited);
        assert_eq!(TokenLimit::from_raw(0), TokenLimit::Unlimited);
        assert_eq!(TokenLimit::from_raw(10), TokenLimit::Max(10));
    }

    #[test]
    fn huge_raw_limit_stays_bounded() {
        let limit = TokenLimit::from_raw(i64::MAX);
        let expected = usize::try_from(i64::MAX).unwrap_or(usize::MAX);
        assert_eq!(limit, TokenLimit::Max(expected));
        assert!(limit.check(u32::MAX as usize, "m").is_ok());
    }

    #[test]
    fn limit_check_is_inclusive() {
        assert!(TokenLimit::Max(5).check(5, "m").is_ok());
        assert!(TokenLimit::Unlimited.check(usize::MAX, "m").is_ok());
        let err = TokenLimit::Max(5).check(6, "m").unwrap_err();
        assert_eq!(
            err.kind(),
            &LlmErrorKind::TokenLimit {
                token_count: 6,
                limit: 5,
                model: "m".into()
            }
        );
    }

    #[test]
    fn char_counter_counts_every_message() {
        let counter = CharTokenCounter::unlimited("mock");
        let messages = [ChatMessage::user("abc"), ChatMessage::agent("de")];
        assert_eq!(counter.count_messages_token(&messages).unwrap(), 5);
    }

    #[tokio::test]
    async fn guard_rejects_before_calling_backend() {
        let backend = MockBackend::from_response("ok");
        let guard = TokenGuard::new(backend.clone(), CharTokenCounter::new("mock", TokenLimit::Max(3)));

        let err = guard
            .invoke(&[ChatMessage::user("too long")], &LlmOptions::new())
            .await
            .unwrap_err();
        assert!(err.is_token_limit());
        assert_eq!(backend.calls(), 0);

        let ok = guard
            .invoke(&[ChatMessage::user("hi")], &LlmOptions::new())
            .await
            .unwrap();
        assert_eq!(ok.first_choice(), "ok");
        assert_eq!(backend.calls(), 1);
    }
}
