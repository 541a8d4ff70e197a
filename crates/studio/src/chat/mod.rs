/// Conversation entities and the by-id message store.
pub mod message;
pub mod store;

pub use message::{ConversationMessage, MessagePatch, Role};
pub use store::{ConversationStore, StoreError, StoreResult};
