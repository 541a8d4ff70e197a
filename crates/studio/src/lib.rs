#![deny(unsafe_code)]

/// Generation-task orchestration for topic-to-video conversations.
///
/// Streams of pipeline events are reduced into per-task state, shown through an
/// ordered conversation store, and archived to storage once a task finishes.
pub mod chat;
/// Persisted record <-> task state conversion.
pub mod history;
pub mod session;
/// Settings persistence.
pub mod settings;
pub mod studio;
pub mod task;

pub use chat::{ConversationMessage, ConversationStore, MessagePatch, Role, StoreError};
pub use history::{HistoryError, TaskExtra};
pub use session::{
    Routed, RoutedItem, SessionError, SessionResult, Started, StreamSessionController, TaskHandle,
};
pub use settings::{SettingsError, SettingsStore, StudioSettings};
pub use studio::{Studio, StudioError, StudioResult};
pub use task::{
    CANCELLED_MESSAGE, Phase, PipelineStage, ReduceError, Reduction, Scene, SceneUpdate,
    ScriptEntry, TaskEvent, TaskState, merge, reduce,
};
