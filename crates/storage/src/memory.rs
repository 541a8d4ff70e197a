use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use snafu::{OptionExt, ensure};

use super::error::{
    ConflictSnafu, DuplicateIdSnafu, InvariantViolationSnafu, NotFoundSnafu, StorageResult,
    UnavailableSnafu,
};
use super::ids::{MessageId, SessionId};
use super::sqlite::{normalize_title, unix_timestamp_seconds};
use super::types::{MessageRecord, NewMessage, NewSession, SessionPatch, SessionRecord};
use super::{MessageStore, SessionStore};

#[derive(Debug, Default)]
struct MemoryState {
    sessions: Vec<SessionRecord>,
    messages: Vec<MessageRecord>,
}

/// Process-local storage with the same contract as [`crate::SqliteStorage`].
///
/// Writes can be switched off to simulate a backend outage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
    reject_writes: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    fn lock(&self, stage: &'static str) -> StorageResult<MutexGuard<'_, MemoryState>> {
        self.state.lock().map_err(|_| {
            InvariantViolationSnafu {
                stage,
                details: "memory storage mutex poisoned".to_string(),
            }
            .build()
        })
    }

    fn ensure_writable(&self, stage: &'static str) -> StorageResult<()> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return UnavailableSnafu {
                stage,
                details: "writes are currently rejected".to_string(),
            }
            .fail();
        }
        Ok(())
    }
}

fn now_seconds() -> u64 {
    unix_timestamp_seconds().max(0) as u64
}

fn live_session_mut<'a>(
    state: &'a mut MemoryState,
    session_id: SessionId,
    stage: &'static str,
) -> StorageResult<&'a mut SessionRecord> {
    state
        .sessions
        .iter_mut()
        .find(|session| session.id == session_id && session.deleted_at_unix_seconds.is_none())
        .context(NotFoundSnafu {
            stage,
            entity: "session",
            id: session_id.to_string(),
        })
}

fn is_json_object(raw: &str) -> bool {
    let trimmed = raw.trim();
    trimmed.starts_with('{') && trimmed.ends_with('}')
}

impl SessionStore for MemoryStorage {
    fn create_session(&self, input: NewSession) -> StorageResult<SessionRecord> {
        self.ensure_writable("memory-session-create")?;
        let mut state = self.lock("memory-session-create")?;
        let now = now_seconds();
        let record = SessionRecord {
            id: SessionId::new_v7(),
            title: normalize_title(input.title),
            created_at_unix_seconds: now,
            updated_at_unix_seconds: now,
            deleted_at_unix_seconds: None,
        };
        state.sessions.push(record.clone());
        Ok(record)
    }

    fn list_sessions(&self, include_deleted: bool) -> StorageResult<Vec<SessionRecord>> {
        let state = self.lock("memory-session-list")?;
        let mut sessions = state
            .sessions
            .iter()
            .filter(|session| include_deleted || session.deleted_at_unix_seconds.is_none())
            .cloned()
            .collect::<Vec<_>>();
        sessions.sort_by(|left, right| {
            right
                .updated_at_unix_seconds
                .cmp(&left.updated_at_unix_seconds)
                .then_with(|| right.id.cmp(&left.id))
        });
        Ok(sessions)
    }

    fn get_session(&self, session_id: SessionId) -> StorageResult<Option<SessionRecord>> {
        let state = self.lock("memory-session-get")?;
        Ok(state
            .sessions
            .iter()
            .find(|session| session.id == session_id)
            .cloned())
    }

    fn update_session(
        &self,
        session_id: SessionId,
        patch: SessionPatch,
    ) -> StorageResult<SessionRecord> {
        self.ensure_writable("memory-session-update")?;
        let mut state = self.lock("memory-session-update")?;
        let session = live_session_mut(&mut state, session_id, "memory-session-update-missing")?;
        if let Some(title) = patch.title {
            session.title = normalize_title(title);
        }
        session.updated_at_unix_seconds = now_seconds();
        Ok(session.clone())
    }

    fn soft_delete_session(&self, session_id: SessionId) -> StorageResult<()> {
        self.ensure_writable("memory-session-soft-delete")?;
        let mut state = self.lock("memory-session-soft-delete")?;
        let session = state
            .sessions
            .iter_mut()
            .find(|session| session.id == session_id)
            .context(NotFoundSnafu {
                stage: "memory-session-soft-delete-missing",
                entity: "session",
                id: session_id.to_string(),
            })?;
        if session.deleted_at_unix_seconds.is_none() {
            let now = now_seconds();
            session.deleted_at_unix_seconds = Some(now);
            session.updated_at_unix_seconds = now;
        }
        Ok(())
    }
}

impl MessageStore for MemoryStorage {
    fn append_message(
        &self,
        session_id: SessionId,
        input: NewMessage,
    ) -> StorageResult<MessageRecord> {
        self.ensure_writable("memory-message-append")?;
        if let Some(extra_json) = input.extra_json.as_deref()
            && !is_json_object(extra_json)
        {
            return ConflictSnafu {
                stage: "memory-message-append-invalid-extra",
                entity: "message",
                details: "extra_json must be a JSON object".to_string(),
            }
            .fail();
        }

        let mut state = self.lock("memory-message-append")?;
        let message_id = input.id.unwrap_or_else(MessageId::new_v7);
        ensure!(
            !state.messages.iter().any(|message| message.id == message_id),
            DuplicateIdSnafu {
                stage: "memory-message-append-duplicate-id",
                id_type: MessageId::ID_TYPE,
                id: message_id.to_string(),
            }
        );
        let now = now_seconds();
        live_session_mut(&mut state, session_id, "memory-message-append-session")?
            .updated_at_unix_seconds = now;

        let seq = state
            .messages
            .iter()
            .filter(|message| message.session_id == session_id)
            .map(|message| message.seq)
            .max()
            .unwrap_or(0)
            + 1;

        let record = MessageRecord {
            id: message_id,
            session_id,
            seq,
            role: input.role,
            content: input.content,
            extra_json: input.extra_json,
            created_at_unix_seconds: now,
        };
        state.messages.push(record.clone());
        Ok(record)
    }

    fn list_messages(&self, session_id: SessionId) -> StorageResult<Vec<MessageRecord>> {
        let mut state = self.lock("memory-message-list")?;
        live_session_mut(&mut state, session_id, "memory-message-list-session")?;
        let mut messages = state
            .messages
            .iter()
            .filter(|message| message.session_id == session_id)
            .cloned()
            .collect::<Vec<_>>();
        messages.sort_by_key(|message| message.seq);
        Ok(messages)
    }
}
