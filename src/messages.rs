//! Conversation messages exchanged between users, agents, chains and skills
//!
//! What this module provides
//! - `ChatMessageKind`: the closed set of message producers
//! - `ChatMessage`: one immutable turn of conversation
//! - `ScoredChatMessage`: a shared message paired with a quality score, ordered by score
//!
//! Messages carry no identity of their own. Components that need to know whether two
//! handles point at the same turn share them through `Arc<ChatMessage>` and compare with
//! `Arc::ptr_eq`.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Number of characters of text shown by the `Display` preview.
const PREVIEW_LEN: usize = 50;

/// Producer of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChatMessageKind {
    /// Input typed by the user
    User,
    /// Response produced by an agent
    Agent,
    /// Output of a chain
    Chain,
    /// Output of a single skill
    Skill,
}

impl ChatMessageKind {
    /// Every kind, in declaration order.
    pub const ALL: [ChatMessageKind; 4] = [Self::User, Self::Agent, Self::Chain, Self::Skill];

    /// Upper-case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Agent => "AGENT",
            Self::Chain => "CHAIN",
            Self::Skill => "SKILL",
        }
    }
}

impl fmt::Display for ChatMessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single turn of conversation.
///
/// Fields are private: a message is assembled once through one of the kind-specific
/// constructors (optionally refined with the `with_*` methods while still owned) and is
/// read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    text: String,
    kind: ChatMessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    #[serde(default)]
    source: String,
    #[serde(default)]
    is_error: bool,
}

impl ChatMessage {
    /// Message with every field given explicitly.
    pub fn new(
        text: impl Into<String>,
        kind: ChatMessageKind,
        payload: Option<Value>,
        source: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            text: text.into(),
            kind,
            payload,
            source: source.into(),
            is_error,
        }
    }

    /// Message typed by the user.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(text, ChatMessageKind::User, None, "", false)
    }

    /// Message produced by an agent.
    pub fn agent(text: impl Into<String>) -> Self {
        Self::new(text, ChatMessageKind::Agent, None, "", false)
    }

    /// Message produced by a chain.
    pub fn chain(text: impl Into<String>) -> Self {
        Self::new(text, ChatMessageKind::Chain, None, "", false)
    }

    /// Message produced by a skill.
    pub fn skill(text: impl Into<String>) -> Self {
        Self::new(text, ChatMessageKind::Skill, None, "", false)
    }

    /// Attach structured data produced alongside the text.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Name the component that produced the message.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Mark the message as an error report rather than content.
    pub fn with_error(mut self, is_error: bool) -> Self {
        self.is_error = is_error;
        self
    }

    /// Message content.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Producer of the message.
    pub fn kind(&self) -> ChatMessageKind {
        self.kind
    }

    /// Structured data, if any.
    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    /// Producing component; empty when unknown.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// True for an error report.
    pub fn is_error(&self) -> bool {
        self.is_error
    }

    /// Negation of [`ChatMessage::is_error`].
    pub fn is_ok(&self) -> bool {
        !self.is_error
    }

    /// True for user input.
    pub fn is_kind_user(&self) -> bool {
        self.kind == ChatMessageKind::User
    }

    /// True for agent output.
    pub fn is_kind_agent(&self) -> bool {
        self.kind == ChatMessageKind::Agent
    }

    /// True for chain output.
    pub fn is_kind_chain(&self) -> bool {
        self.kind == ChatMessageKind::Chain
    }

    /// True for skill output.
    pub fn is_kind_skill(&self) -> bool {
        self.kind == ChatMessageKind::Skill
    }

    /// True when produced by `kind`.
    pub fn is_of_kind(&self, kind: ChatMessageKind) -> bool {
        self.kind == kind
    }

    /// True when produced by the component named `source`.
    pub fn is_from_source(&self, source: &str) -> bool {
        self.source == source
    }
}

impl fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Message of kind {}: ", self.kind)?;
        if self.text.chars().count() > PREVIEW_LEN {
            let preview: String = self.text.chars().take(PREVIEW_LEN).collect();
            write!(f, "{preview}...")
        } else {
            f.write_str(&self.text)
        }
    }
}

/// A message paired with the score a scorer assigned to it.
///
/// The message is shared, not copied. Comparison looks at the score only; higher is better.
#[derive(Debug, Clone)]
pub struct ScoredChatMessage {
    message: Arc<ChatMessage>,
    score: f64,
}

impl ScoredChatMessage {
    /// Pair `message` with `score`.
    pub fn new(message: impl Into<Arc<ChatMessage>>, score: f64) -> Self {
        Self {
            message: message.into(),
            score,
        }
    }

    /// The shared message.
    pub fn message(&self) -> &Arc<ChatMessage> {
        &self.message
    }

    /// Score; higher is better.
    pub fn score(&self) -> f64 {
        self.score
    }
}

// Total order over scores, NaN included.
impl PartialEq for ScoredChatMessage {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScoredChatMessage {}

impl PartialOrd for ScoredChatMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoredChatMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score.total_cmp(&other.score)
    }
}

impl fmt::Display for ScoredChatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.score)
    }
}

/// Highest-scored message of a candidate set, if any.
pub fn best_of<'a, I>(candidates: I) -> Option<&'a ScoredChatMessage>
where
    I: IntoIterator<Item = &'a ScoredChatMessage>,
{
    candidates.into_iter().max()
}
