//! Error types for LLM invocation
//!
//! Every failure carries an [`LlmErrorKind`] and, optionally, the failure that caused it.
//! The cause is a first-class field and is reported through
//! [`std::error::Error::source`], so a failed failover surfaces as the fallback's error
//! whose source is the primary's error.

use thiserror::Error;

/// Result type alias for LLM invocation
pub type Result<T> = std::result::Result<T, LlmError>;

/// What went wrong during an invocation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LlmErrorKind {
    /// Unclassified failure, never retried
    #[error("LLM invocation failed: {message}")]
    Invocation { message: String },

    /// The remote call failed with an identifiable status code
    #[error("LLM call failed with code {code}: {message}")]
    Call { code: u16, message: String },

    /// The conversation does not fit the model's token limit
    #[error("token limit exceeded for model {model}: {token_count} tokens, limit {limit}")]
    TokenLimit {
        token_count: usize,
        limit: usize,
        model: String,
    },

    /// The caller cancelled the invocation while it was waiting to retry
    #[error("LLM invocation cancelled")]
    Cancelled,
}

/// Main error type for LLM invocation
#[derive(Debug, Clone, Error)]
#[error("{kind}")]
pub struct LlmError {
    kind: LlmErrorKind,
    #[source]
    cause: Option<Box<LlmError>>,
}

impl LlmError {
    /// Error of `kind` with no cause.
    pub fn new(kind: LlmErrorKind) -> Self {
        Self { kind, cause: None }
    }

    /// Unclassified failure.
    pub fn invocation(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Invocation {
            message: message.into(),
        })
    }

    /// Remote call failure carrying its status code.
    pub fn call(code: u16, message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Call {
            code,
            message: message.into(),
        })
    }

    /// Conversation of `token_count` tokens exceeds `limit` for `model`.
    pub fn token_limit(token_count: usize, limit: usize, model: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::TokenLimit {
            token_count,
            limit,
            model: model.into(),
        })
    }

    /// Invocation cancelled by the caller.
    pub fn cancelled() -> Self {
        Self::new(LlmErrorKind::Cancelled)
    }

    /// Record `cause` as the failure this one was raised because of.
    ///
    /// Replaces any cause already present.
    pub fn caused_by(mut self, cause: LlmError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Attach `root` beneath the deepest cause already recorded, keeping the existing chain.
    pub fn with_root_cause(mut self, root: LlmError) -> Self {
        self.cause = Some(Box::new(match self.cause.take() {
            Some(cause) => (*cause).with_root_cause(root),
            None => root,
        }));
        self
    }

    /// Classification of this error alone.
    pub fn kind(&self) -> &LlmErrorKind {
        &self.kind
    }

    /// Failure that directly caused this one.
    pub fn cause(&self) -> Option<&LlmError> {
        self.cause.as_deref()
    }

    /// Status code of a classified call failure.
    pub fn code(&self) -> Option<u16> {
        match self.kind {
            LlmErrorKind::Call { code, .. } => Some(code),
            _ => None,
        }
    }

    /// True for a token-limit breach.
    pub fn is_token_limit(&self) -> bool {
        matches!(self.kind, LlmErrorKind::TokenLimit { .. })
    }

    /// True when the caller cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, LlmErrorKind::Cancelled)
    }

    /// This error followed by each of its causes, outermost first.
    pub fn chain(&self) -> impl Iterator<Item = &LlmError> {
        std::iter::successors(Some(self), |e| e.cause())
    }
}

impl From<LlmErrorKind> for LlmError {
    fn from(kind: LlmErrorKind) -> Self {
        Self::new(kind)
    }
}
