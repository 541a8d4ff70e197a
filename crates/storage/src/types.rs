use super::ids::{MessageId, SessionId};

/// Title used when a session is created without one.
pub const DEFAULT_SESSION_TITLE: &str = "New Conversation";

/// Storage-local message role, intentionally decoupled from conversation-layer role enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: SessionId,
    pub title: String,
    pub created_at_unix_seconds: u64,
    pub updated_at_unix_seconds: u64,
    pub deleted_at_unix_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionPatch {
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub session_id: SessionId,
    pub seq: u64,
    pub role: MessageRole,
    pub content: String,
    /// Opaque JSON object attached by the writer; `None` for plain chat turns.
    pub extra_json: Option<String>,
    pub created_at_unix_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    /// Caller-chosen id; the backend generates one when absent.
    pub id: Option<MessageId>,
    pub role: MessageRole,
    pub content: String,
    pub extra_json: Option<String>,
}

impl NewMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: None,
            role,
            content: content.into(),
            extra_json: None,
        }
    }

    /// Stores the message under an id the caller already uses in memory.
    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_extra_json(mut self, extra_json: impl Into<String>) -> Self {
        self.extra_json = Some(extra_json.into());
        self
    }
}

/// One session together with its messages in sequence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session: SessionRecord,
    pub messages: Vec<MessageRecord>,
}
