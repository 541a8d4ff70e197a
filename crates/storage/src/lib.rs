pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{MessageId, SessionId};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use types::{
    DEFAULT_SESSION_TITLE, MessageRecord, MessageRole, NewMessage, NewSession, SessionPatch,
    SessionRecord, SessionSnapshot,
};

pub trait SessionStore: Send + Sync {
    fn create_session(&self, input: NewSession) -> StorageResult<SessionRecord>;
    fn list_sessions(&self, include_deleted: bool) -> StorageResult<Vec<SessionRecord>>;
    fn get_session(&self, session_id: SessionId) -> StorageResult<Option<SessionRecord>>;
    fn update_session(
        &self,
        session_id: SessionId,
        patch: SessionPatch,
    ) -> StorageResult<SessionRecord>;
    fn soft_delete_session(&self, session_id: SessionId) -> StorageResult<()>;
}

pub trait MessageStore: Send + Sync {
    fn append_message(
        &self,
        session_id: SessionId,
        input: NewMessage,
    ) -> StorageResult<MessageRecord>;
    fn list_messages(&self, session_id: SessionId) -> StorageResult<Vec<MessageRecord>>;
}

pub trait Storage: SessionStore + MessageStore {
    /// Loads a live session with its ordered messages; deleted sessions read as absent.
    fn load_session(&self, session_id: SessionId) -> StorageResult<Option<SessionSnapshot>> {
        let Some(session) = self.get_session(session_id)? else {
            return Ok(None);
        };
        if session.deleted_at_unix_seconds.is_some() {
            return Ok(None);
        }

        let messages = self.list_messages(session_id)?;
        Ok(Some(SessionSnapshot { session, messages }))
    }
}

impl<T> Storage for T where T: SessionStore + MessageStore {}
