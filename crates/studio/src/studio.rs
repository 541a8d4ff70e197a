use std::sync::Arc;

use scenecast_storage::{
    MessageId, MessageRole, NewMessage, NewSession, SessionId, Storage, StorageError,
};
use scenecast_stream::{EventSource, GenerationRequest, MAX_TOPIC_CHARS};
use snafu::{OptionExt, ResultExt, Snafu, ensure};

use crate::chat::{ConversationMessage, ConversationStore, StoreError};
use crate::history;
use crate::session::{SessionError, Started, StreamSessionController, TaskHandle};
use crate::settings::StudioSettings;
use crate::task::{TaskEvent, TaskState, reduce};

pub const WELCOME_MESSAGE: &str =
    "Hi! Send me a topic and I will turn it into a short narrated video.";

pub type StudioResult<T> = Result<T, StudioError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StudioError {
    #[snafu(display("topic rejected: {details}"))]
    InvalidTopic {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("stream session failed on `{stage}`: {source}"))]
    Session {
        stage: &'static str,
        source: SessionError,
    },
    #[snafu(display("conversation store failed on `{stage}`: {source}"))]
    Store {
        stage: &'static str,
        source: StoreError,
    },
    #[snafu(display("storage failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("session '{session_id}' does not exist"))]
    SessionNotFound {
        stage: &'static str,
        session_id: SessionId,
    },
}

/// Conversation-level entry point: submits topics, cancels tasks, loads history.
pub struct Studio {
    settings: Arc<StudioSettings>,
    storage: Arc<dyn Storage>,
    controller: StreamSessionController,
    store: ConversationStore,
    session_id: Option<SessionId>,
}

impl Studio {
    pub fn new(
        source: Arc<dyn EventSource>,
        storage: Arc<dyn Storage>,
        settings: Arc<StudioSettings>,
    ) -> Self {
        Self {
            settings,
            controller: StreamSessionController::new(source, storage.clone()),
            storage,
            store: ConversationStore::starting_with(ConversationMessage::assistant(
                WELCOME_MESSAGE,
            )),
            session_id: None,
        }
    }

    pub fn settings(&self) -> &StudioSettings {
        &self.settings
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        self.store.messages()
    }

    pub fn message(&self, message_id: MessageId) -> Option<&ConversationMessage> {
        self.store.get(message_id)
    }

    pub fn task(&self, message_id: MessageId) -> Option<&TaskState> {
        self.store.task(message_id)
    }

    pub fn has_live_tasks(&self) -> bool {
        self.controller.has_live()
    }

    /// Submits a topic with the configured default style.
    pub fn submit(&mut self, topic: &str) -> StudioResult<TaskHandle> {
        let request = GenerationRequest::new(topic, self.settings.default_style);
        self.submit_request(request)
    }

    /// Submits a full request. The topic is trimmed before it is validated or stored.
    pub fn submit_request(&mut self, mut request: GenerationRequest) -> StudioResult<TaskHandle> {
        request.topic = request.topic.trim().to_string();
        validate_topic(&request.topic)?;
        let topic = request.topic.clone();

        self.ensure_session(&topic);
        let user_message = ConversationMessage::user(topic.clone());
        self.persist_message(&user_message);
        self.store.append(user_message).context(StoreSnafu {
            stage: "submit-append-user",
        })?;

        let message_id = MessageId::new_v7();
        match self.controller.start(message_id, self.session_id, request) {
            Ok(Started { handle, cancel }) => {
                let task = TaskState::live(message_id, topic, cancel);
                let appended = self
                    .store
                    .append(ConversationMessage::task(task.status_line(), task));
                if let Err(source) = appended {
                    self.controller.abandon(message_id);
                    return Err(source).context(StoreSnafu {
                        stage: "submit-append-task",
                    });
                }
                Ok(handle)
            }
            Err(SessionError::OpenStream { source, .. }) => {
                // A stream that never opens fails the task like a transport error would.
                tracing::warn!(message_id = %message_id, error = %source, "failed to open generation stream");
                let failed = reduce(
                    TaskState::new(message_id, topic),
                    TaskEvent::Error {
                        message: format!("failed to start generation: {source}"),
                    },
                )
                .state;
                self.controller.persist_terminal(self.session_id, &failed);
                self.store
                    .append(ConversationMessage::task(failed.status_line(), failed))
                    .context(StoreSnafu {
                        stage: "submit-append-failed-task",
                    })?;
                Ok(TaskHandle::new(message_id))
            }
            Err(source) => Err(source).context(SessionSnafu {
                stage: "submit-start-stream",
            }),
        }
    }

    /// Cancels the task shown as `message_id`. Finished or unknown tasks are left alone.
    pub fn cancel_active(&mut self, message_id: MessageId) -> StudioResult<bool> {
        self.controller
            .cancel(&mut self.store, TaskHandle::new(message_id))
            .context(SessionSnafu {
                stage: "cancel-active",
            })
    }

    /// Applies the next queued stream item. Returns `false` when nothing is live.
    pub async fn pump_one(&mut self) -> StudioResult<bool> {
        if !self.controller.has_live() {
            return Ok(false);
        }
        let Some(routed) = self.controller.next_routed().await else {
            return Ok(false);
        };

        self.controller
            .handle_routed(&mut self.store, routed)
            .context(SessionSnafu {
                stage: "pump-routed-item",
            })?;
        Ok(true)
    }

    pub async fn run_until_idle(&mut self) -> StudioResult<()> {
        while self.pump_one().await? {}
        Ok(())
    }

    /// Replaces the conversation with a stored session. Live tasks are dropped.
    pub fn open_session(&mut self, session_id: SessionId) -> StudioResult<()> {
        let snapshot = self
            .storage
            .load_session(session_id)
            .context(StorageSnafu {
                stage: "open-session-load",
            })?
            .context(SessionNotFoundSnafu {
                stage: "open-session-load",
                session_id,
            })?;

        let store = ConversationStore::from_messages(history::hydrate_snapshot(&snapshot))
            .context(StoreSnafu {
                stage: "open-session-hydrate",
            })?;

        self.controller.abandon_all();
        self.store = store;
        self.session_id = Some(session_id);
        tracing::info!(
            session_id = %session_id,
            message_count = self.store.len(),
            "hydrated conversation from storage"
        );
        Ok(())
    }

    // The session is created on first use so idle studios leave no empty rows.
    fn ensure_session(&mut self, topic: &str) {
        if self.session_id.is_some() {
            return;
        }

        let title = self.settings.session_title(topic);
        match self.storage.create_session(NewSession { title }) {
            Ok(session) => {
                tracing::info!(session_id = %session.id, "created persistence session");
                self.session_id = Some(session.id);
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to create persistence session");
            }
        }
    }

    // Stored under the in-memory id so a reload yields the same message.
    fn persist_message(&self, message: &ConversationMessage) {
        let Some(session_id) = self.session_id else {
            return;
        };
        let role = MessageRole::from(message.role);
        let record = NewMessage::new(role, message.content.clone()).with_id(message.id);
        if let Err(error) = self.storage.append_message(session_id, record) {
            tracing::warn!(
                session_id = %session_id,
                message_id = %message.id,
                role = role.as_str(),
                error = %error,
                "failed to persist message"
            );
        }
    }
}

fn validate_topic(topic: &str) -> StudioResult<()> {
    ensure!(
        !topic.is_empty(),
        InvalidTopicSnafu {
            stage: "validate-topic-empty",
            details: "topic is empty".to_string(),
        }
    );
    let length = topic.chars().count();
    ensure!(
        length <= MAX_TOPIC_CHARS,
        InvalidTopicSnafu {
            stage: "validate-topic-length",
            details: format!("topic has {length} characters, limit is {MAX_TOPIC_CHARS}"),
        }
    );
    Ok(())
}
