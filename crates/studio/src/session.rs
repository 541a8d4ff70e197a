use std::collections::HashMap;
use std::sync::Arc;

use scenecast_storage::{MessageId, MessageRole, NewMessage, SessionId, Storage};
use scenecast_stream::{
    CancelHandle, EventSource, EventStream, GenerationRequest, SourceError, StreamItem,
};
use snafu::{ResultExt, Snafu, ensure};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::chat::{ConversationStore, MessagePatch, StoreError};
use crate::history;
use crate::task::{Phase, Reduction, TaskEvent, TaskState, reduce};

/// Error recorded when a stream ends without `done` or `error`.
pub const STREAM_CLOSED_MESSAGE: &str = "event stream ended before the task finished";

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("task '{message_id}' already has a live stream"))]
    DuplicateSubscription {
        stage: &'static str,
        message_id: MessageId,
    },
    #[snafu(display("failed to open event stream for task '{message_id}': {source}"))]
    OpenStream {
        stage: &'static str,
        message_id: MessageId,
        source: SourceError,
    },
    #[snafu(display("conversation store rejected `{stage}`: {source}"))]
    Store {
        stage: &'static str,
        source: StoreError,
    },
}

/// Lightweight reference to a started task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    message_id: MessageId,
}

impl TaskHandle {
    pub fn new(message_id: MessageId) -> Self {
        Self { message_id }
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }
}

/// Result of [`StreamSessionController::start`].
///
/// The cancel handle belongs in the task's state; the controller keeps no copy.
#[derive(Debug)]
pub struct Started {
    pub handle: TaskHandle,
    pub cancel: CancelHandle,
}

/// One stream item tagged with the task it belongs to.
#[derive(Debug)]
pub struct Routed {
    pub message_id: MessageId,
    pub item: RoutedItem,
}

#[derive(Debug)]
pub enum RoutedItem {
    Item(StreamItem),
    /// The stream delivered its last item.
    Closed,
}

struct LiveStream {
    session_id: Option<SessionId>,
    reader: JoinHandle<()>,
}

/// Owns the live subscriptions and turns their events into task transitions.
///
/// Items from every stream funnel into one queue, so transitions are applied
/// one at a time by whoever holds `&mut self`.
pub struct StreamSessionController {
    source: Arc<dyn EventSource>,
    storage: Arc<dyn Storage>,
    live: HashMap<MessageId, LiveStream>,
    routed_tx: mpsc::UnboundedSender<Routed>,
    routed_rx: mpsc::UnboundedReceiver<Routed>,
}

impl StreamSessionController {
    pub fn new(source: Arc<dyn EventSource>, storage: Arc<dyn Storage>) -> Self {
        let (routed_tx, routed_rx) = mpsc::unbounded_channel();
        Self {
            source,
            storage,
            live: HashMap::new(),
            routed_tx,
            routed_rx,
        }
    }

    pub fn is_live(&self, message_id: MessageId) -> bool {
        self.live.contains_key(&message_id)
    }

    pub fn has_live(&self) -> bool {
        !self.live.is_empty()
    }

    /// Opens the stream for `message_id` and returns immediately.
    ///
    /// Must be called inside a tokio runtime; the source worker and the
    /// forwarding reader are spawned onto it.
    pub fn start(
        &mut self,
        message_id: MessageId,
        session_id: Option<SessionId>,
        request: GenerationRequest,
    ) -> SessionResult<Started> {
        ensure!(
            !self.is_live(message_id),
            DuplicateSubscriptionSnafu {
                stage: "session-start",
                message_id,
            }
        );

        let topic = request.topic.clone();
        let handle = self.source.open(request).context(OpenStreamSnafu {
            stage: "session-open-stream",
            message_id,
        })?;

        tokio::spawn(handle.worker);
        let reader = self.spawn_stream_reader(message_id, handle.events);
        self.live.insert(message_id, LiveStream { session_id, reader });

        tracing::info!(
            message_id = %message_id,
            source = %self.source.id(),
            topic = %topic,
            "generation stream opened"
        );

        Ok(Started {
            handle: TaskHandle::new(message_id),
            cancel: handle.cancel,
        })
    }

    fn spawn_stream_reader(&self, message_id: MessageId, mut events: EventStream) -> JoinHandle<()> {
        let routed_tx = self.routed_tx.clone();
        tokio::spawn(async move {
            while let Some(item) = events.recv().await {
                let routed = Routed {
                    message_id,
                    item: RoutedItem::Item(item),
                };
                if routed_tx.send(routed).is_err() {
                    return;
                }
            }

            let _ = routed_tx.send(Routed {
                message_id,
                item: RoutedItem::Closed,
            });
        })
    }

    /// Cancels a live task. Returns `false` when the task was no longer live.
    pub fn cancel(
        &mut self,
        store: &mut ConversationStore,
        handle: TaskHandle,
    ) -> SessionResult<bool> {
        let message_id = handle.message_id();
        if !self.is_live(message_id) {
            tracing::debug!(message_id = %message_id, "cancel ignored for finished task");
            return Ok(false);
        }

        let phase = self.apply(store, message_id, TaskEvent::Cancel)?;
        Ok(phase == Some(Phase::Cancelled))
    }

    pub async fn next_routed(&mut self) -> Option<Routed> {
        self.routed_rx.recv().await
    }

    pub fn try_next_routed(&mut self) -> Option<Routed> {
        self.routed_rx.try_recv().ok()
    }

    /// Applies one routed item. Returns the new phase when it ended the task.
    ///
    /// Items for tasks that are no longer live are dropped.
    pub fn handle_routed(
        &mut self,
        store: &mut ConversationStore,
        routed: Routed,
    ) -> SessionResult<Option<Phase>> {
        let Routed { message_id, item } = routed;
        if !self.is_live(message_id) {
            tracing::trace!(message_id = %message_id, "discarding item for finished task");
            return Ok(None);
        }

        let event = task_event_for(message_id, item);
        self.apply(store, message_id, event)
    }

    /// Forgets a live task without a transition; its handle stops the worker when dropped.
    pub(crate) fn abandon(&mut self, message_id: MessageId) {
        if let Some(live) = self.live.remove(&message_id) {
            live.reader.abort();
        }
    }

    pub(crate) fn abandon_all(&mut self) {
        for (_, live) in self.live.drain() {
            live.reader.abort();
        }
    }

    fn apply(
        &mut self,
        store: &mut ConversationStore,
        message_id: MessageId,
        event: TaskEvent,
    ) -> SessionResult<Option<Phase>> {
        let taken = store.take_task(message_id).context(StoreSnafu {
            stage: "session-take-task",
        })?;
        let Some(state) = taken else {
            tracing::warn!(message_id = %message_id, "live stream has no task state; dropping it");
            self.abandon(message_id);
            return Ok(None);
        };

        let was_live = state.phase.is_live();
        let Reduction { state, released } = reduce(state, event);
        let finished = was_live && state.is_terminal();

        if let Some(mut cancel) = released
            && state.phase == Phase::Cancelled
        {
            cancel.abort();
        }

        if finished {
            self.finalize_stream(&state);
        }

        let phase = state.phase;
        store
            .update_message(message_id, MessagePatch::task(state))
            .context(StoreSnafu {
                stage: "session-update-task",
            })?;

        Ok(finished.then_some(phase))
    }

    fn finalize_stream(&mut self, state: &TaskState) {
        let Some(live) = self.live.remove(&state.id) else {
            return;
        };
        live.reader.abort();

        tracing::info!(
            message_id = %state.id,
            phase = ?state.phase,
            scene_count = state.scenes.len(),
            "generation stream closed"
        );

        // Cancelled generations are not archived.
        if state.phase != Phase::Cancelled {
            self.persist_terminal(live.session_id, state);
        }
    }

    /// Writes the one archive record of a finished task. Failures are logged only.
    pub(crate) fn persist_terminal(&self, session_id: Option<SessionId>, state: &TaskState) {
        let content = match state.phase {
            Phase::Done => format!("Video generation finished: {}", state.topic),
            Phase::Errored => format!(
                "Generation failed: {}",
                state.error_message.as_deref().unwrap_or_default()
            ),
            _ => return,
        };

        let Some(session_id) = session_id else {
            tracing::warn!(message_id = %state.id, "no persistence session; task not archived");
            return;
        };

        let extra_json = match history::encode(state) {
            Ok(extra_json) => extra_json,
            Err(error) => {
                tracing::warn!(message_id = %state.id, error = %error, "failed to encode task record");
                return;
            }
        };

        let message = NewMessage::new(MessageRole::System, content)
            .with_id(state.id)
            .with_extra_json(extra_json);
        if let Err(error) = self.storage.append_message(session_id, message) {
            tracing::warn!(
                message_id = %state.id,
                session_id = %session_id,
                error = %error,
                "failed to persist finished task"
            );
        }
    }
}

fn task_event_for(message_id: MessageId, item: RoutedItem) -> TaskEvent {
    match item {
        RoutedItem::Item(StreamItem::Event(event)) => {
            let name = event.name();
            TaskEvent::try_from(event).unwrap_or_else(|error| {
                tracing::warn!(
                    message_id = %message_id,
                    event = name,
                    error = %error,
                    "malformed stream event"
                );
                TaskEvent::malformed(error)
            })
        }
        RoutedItem::Item(StreamItem::Malformed(details)) => TaskEvent::malformed(details),
        RoutedItem::Item(StreamItem::TransportFailed(details)) => {
            tracing::warn!(message_id = %message_id, details = %details, "event transport failed");
            TaskEvent::Error {
                message: format!("transport failed: {details}"),
            }
        }
        RoutedItem::Closed => TaskEvent::Error {
            message: STREAM_CLOSED_MESSAGE.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use scenecast_storage::{MemoryStorage, MessageStore, NewSession, SessionStore};
    use scenecast_stream::{
        Frame, SceneKind, ScriptDraft, ScriptedSource, StreamEvent, Style,
    };
    use serde_json::json;

    use super::*;
    use crate::chat::ConversationMessage;
    use crate::task::CANCELLED_MESSAGE;

    struct Harness {
        controller: StreamSessionController,
        store: ConversationStore,
        storage: Arc<MemoryStorage>,
        session_id: SessionId,
    }

    impl Harness {
        fn new(source: ScriptedSource) -> Self {
            let storage = Arc::new(MemoryStorage::new());
            let session_id = storage
                .create_session(NewSession {
                    title: "test".to_string(),
                })
                .unwrap()
                .id;
            Self {
                controller: StreamSessionController::new(Arc::new(source), storage.clone()),
                store: ConversationStore::new(),
                storage,
                session_id,
            }
        }

        fn start(&mut self, topic: &str) -> TaskHandle {
            let message_id = MessageId::new_v7();
            let Started { handle, cancel } = self
                .controller
                .start(
                    message_id,
                    Some(self.session_id),
                    GenerationRequest::new(topic, Style::Minimal),
                )
                .unwrap();
            let task = TaskState::live(message_id, topic, cancel);
            self.store
                .append(ConversationMessage::task(task.status_line(), task))
                .unwrap();
            handle
        }

        async fn step(&mut self) -> Option<Phase> {
            let routed = self.controller.next_routed().await.unwrap();
            self.controller
                .handle_routed(&mut self.store, routed)
                .unwrap()
        }

        async fn drain(&mut self) {
            while self.controller.has_live() {
                self.step().await;
            }
        }

        fn task(&self, handle: TaskHandle) -> &TaskState {
            self.store.task(handle.message_id()).unwrap()
        }

        fn archived(&self) -> Vec<scenecast_storage::MessageRecord> {
            self.storage.list_messages(self.session_id).unwrap()
        }
    }

    fn scenario_events() -> Vec<StreamEvent> {
        vec![
            StreamEvent::init("t1"),
            StreamEvent::progress(0.1, "writing"),
            StreamEvent::writing_done(vec![ScriptDraft::new(1, "a", "x", "y")]),
            StreamEvent::scene(1, SceneKind::Image, "u1"),
            StreamEvent::scene(1, SceneKind::Video, "u2"),
            StreamEvent::done("final.mp4"),
        ]
    }

    #[tokio::test]
    async fn done_is_archived_exactly_once() {
        let mut harness = Harness::new(ScriptedSource::from_events(&scenario_events()));
        let handle = harness.start("测试");
        harness.drain().await;

        let task = harness.task(handle);
        assert_eq!(task.phase, Phase::Done);
        assert_eq!(task.final_video_url.as_deref(), Some("final.mp4"));

        let archived = harness.archived();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].role, MessageRole::System);
        assert_eq!(archived[0].content, "Video generation finished: 测试");
        assert_eq!(archived[0].id, handle.message_id());
        let restored = history::hydrate_record(&archived[0]);
        assert_eq!(restored.task.as_ref(), Some(task));
    }

    #[tokio::test]
    async fn starting_a_live_task_twice_is_rejected() {
        let mut harness = Harness::new(ScriptedSource::from_events(&scenario_events()));
        let handle = harness.start("测试");

        let error = harness
            .controller
            .start(
                handle.message_id(),
                None,
                GenerationRequest::new("测试", Style::Minimal),
            )
            .unwrap_err();
        assert!(matches!(error, SessionError::DuplicateSubscription { .. }));
        assert!(harness.controller.is_live(handle.message_id()));
    }

    #[tokio::test]
    async fn cancel_freezes_state_and_archives_nothing() {
        let mut harness = Harness::new(ScriptedSource::from_events(&scenario_events()));
        let handle = harness.start("测试");
        for _ in 0..3 {
            harness.step().await;
        }
        assert_eq!(harness.task(handle).phase, Phase::Rendering);

        assert!(harness.controller.cancel(&mut harness.store, handle).unwrap());
        assert!(!harness.controller.cancel(&mut harness.store, handle).unwrap());

        // Late items that were already queued, plus a synthetic one.
        while let Some(routed) = harness.controller.try_next_routed() {
            harness
                .controller
                .handle_routed(&mut harness.store, routed)
                .unwrap();
        }
        let late = Routed {
            message_id: handle.message_id(),
            item: RoutedItem::Item(StreamItem::Event(StreamEvent::scene(
                1,
                SceneKind::Image,
                "late",
            ))),
        };
        assert_eq!(
            harness.controller.handle_routed(&mut harness.store, late).unwrap(),
            None
        );

        let task = harness.task(handle);
        assert_eq!(task.phase, Phase::Cancelled);
        assert_eq!(task.error_message.as_deref(), Some(CANCELLED_MESSAGE));
        assert!(task.scenes.is_empty());
        assert!(!task.is_cancelable());
        assert!(harness.archived().is_empty());
    }

    #[tokio::test]
    async fn malformed_event_becomes_an_archived_error() {
        let source = ScriptedSource::new(vec![
            Frame::new("init", json!({"task_id": "t1"})),
            Frame::new("done", json!({"message": "no url"})),
            Frame::new("done", json!({"final_video_url": "late.mp4"})),
        ]);
        let mut harness = Harness::new(source);
        let handle = harness.start("tides");
        harness.drain().await;

        let task = harness.task(handle);
        assert_eq!(task.phase, Phase::Errored);
        assert!(
            task.error_message
                .as_deref()
                .is_some_and(|message| message.starts_with("malformed event:"))
        );
        assert_eq!(task.final_video_url, None);

        let archived = harness.archived();
        assert_eq!(archived.len(), 1);
        assert!(archived[0].content.starts_with("Generation failed: malformed event:"));
    }

    #[tokio::test]
    async fn undecodable_frame_becomes_an_error() {
        let source = ScriptedSource::new(vec![Frame::new("heartbeat", json!({}))]);
        let mut harness = Harness::new(source);
        let handle = harness.start("tides");
        harness.drain().await;

        assert_eq!(harness.task(handle).phase, Phase::Errored);
    }

    #[tokio::test]
    async fn transport_failure_is_a_failed_task() {
        let source = ScriptedSource::from_events(&[StreamEvent::init("t1")])
            .with_transport_failure("connection reset");
        let mut harness = Harness::new(source);
        let handle = harness.start("tides");
        harness.drain().await;

        let task = harness.task(handle);
        assert_eq!(task.phase, Phase::Errored);
        assert_eq!(
            task.error_message.as_deref(),
            Some("transport failed: connection reset")
        );
    }

    #[tokio::test]
    async fn early_close_is_a_failed_task() {
        let source = ScriptedSource::from_events(&[StreamEvent::init("t1")]);
        let mut harness = Harness::new(source);
        let handle = harness.start("tides");
        harness.drain().await;

        let task = harness.task(handle);
        assert_eq!(task.phase, Phase::Errored);
        assert_eq!(task.error_message.as_deref(), Some(STREAM_CLOSED_MESSAGE));
        assert_eq!(harness.archived().len(), 1);
    }

    #[tokio::test]
    async fn failed_archive_keeps_the_visible_result() {
        let mut harness = Harness::new(ScriptedSource::from_events(&scenario_events()));
        harness.storage.set_reject_writes(true);
        let handle = harness.start("测试");
        harness.drain().await;

        assert_eq!(harness.task(handle).phase, Phase::Done);
        harness.storage.set_reject_writes(false);
        assert!(harness.archived().is_empty());
    }

    #[tokio::test]
    async fn concurrent_tasks_stay_independent() {
        let source = ScriptedSource::from_events(&scenario_events())
            .with_frame_delay(Duration::from_millis(1));
        let mut harness = Harness::new(source);
        let first = harness.start("first");
        let second = harness.start("second");

        harness.step().await;
        harness.controller.cancel(&mut harness.store, first).unwrap();
        harness.drain().await;

        assert_eq!(harness.task(first).phase, Phase::Cancelled);
        assert_eq!(harness.task(second).phase, Phase::Done);
        assert_eq!(harness.archived().len(), 1);
    }
}
