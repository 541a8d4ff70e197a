use std::time::{SystemTime, UNIX_EPOCH};

use scenecast_storage::{MessageId, MessageRole};

use crate::task::TaskState;

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl From<MessageRole> for Role {
    fn from(role: MessageRole) -> Self {
        match role {
            MessageRole::System => Self::System,
            MessageRole::User => Self::User,
            MessageRole::Assistant => Self::Assistant,
        }
    }
}

impl From<Role> for MessageRole {
    fn from(role: Role) -> Self {
        match role {
            Role::System => Self::System,
            Role::User => Self::User,
            Role::Assistant => Self::Assistant,
        }
    }
}

/// One entry of the visible conversation.
///
/// Only `System` messages carry a task, live or hydrated.
#[derive(Debug, PartialEq)]
pub struct ConversationMessage {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub timestamp_unix_seconds: u64,
    pub task: Option<TaskState>,
}

impl ConversationMessage {
    pub fn new(id: MessageId, role: Role, content: impl Into<String>) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            timestamp_unix_seconds: now_seconds(),
            task: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageId::new_v7(), Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageId::new_v7(), Role::Assistant, content)
    }

    /// Wraps a task; the message takes the task's id.
    pub fn task(content: impl Into<String>, task: TaskState) -> Self {
        let mut message = Self::new(task.id, Role::System, content);
        message.task = Some(task);
        message
    }

    pub fn with_timestamp(mut self, timestamp_unix_seconds: u64) -> Self {
        self.timestamp_unix_seconds = timestamp_unix_seconds;
        self
    }
}

/// Field-wise replacement applied by [`super::ConversationStore::update_message`].
#[derive(Debug, Default)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub task: Option<TaskState>,
}

impl MessagePatch {
    /// Replaces the task and refreshes the content with its status line.
    pub fn task(task: TaskState) -> Self {
        Self {
            content: Some(task.status_line()),
            task: Some(task),
        }
    }
}

fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
