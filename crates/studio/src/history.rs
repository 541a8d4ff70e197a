use std::sync::Arc;

use scenecast_storage::{MessageId, MessageRecord, MessageRole, SessionSnapshot};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu, ensure};

use crate::chat::{ConversationMessage, Role};
use crate::task::{CANCELLED_MESSAGE, Phase, PipelineStage, Scene, ScriptEntry, TaskState};

/// Error recorded for a stored task that has neither a video nor an error.
pub const INCOMPLETE_RECORD_MESSAGE: &str = "generation record is incomplete";

pub type HistoryResult<T> = Result<T, HistoryError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HistoryError {
    #[snafu(display("task '{message_id}' is still {phase:?} and cannot be archived"))]
    NonTerminalTask {
        stage: &'static str,
        message_id: MessageId,
        phase: Phase,
    },
    #[snafu(display("failed to encode task record on `{stage}`: {source}"))]
    EncodeExtra {
        stage: &'static str,
        source: serde_json::Error,
    },
}

/// Durable form of a terminal task, stored as the message's extra JSON object.
///
/// Every field is optional on the way in; decoding never fails on a missing key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskExtra {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_video_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub scripts: Vec<ScriptEntry>,
    pub scenes: Vec<Scene>,
}

/// Flattens a terminal task into its durable form.
pub fn serialize(state: &TaskState) -> HistoryResult<TaskExtra> {
    ensure!(
        state.is_terminal(),
        NonTerminalTaskSnafu {
            stage: "history-serialize",
            message_id: state.id,
            phase: state.phase,
        }
    );

    Ok(TaskExtra {
        topic: Some(state.topic.clone()),
        task_id: state.remote_task_id.clone(),
        final_video_url: state.final_video_url.clone(),
        error: state.error_message.clone(),
        progress: Some(state.progress),
        stage: Some(state.stage.as_str().to_string()),
        step: state.phase.step_label().map(str::to_string),
        scripts: state.script.clone(),
        scenes: state
            .scenes
            .iter()
            .map(|scene| Scene::clone(scene))
            .collect(),
    })
}

/// Rebuilds a terminal, non-cancelable task from its durable form.
pub fn deserialize(id: MessageId, extra: &TaskExtra) -> TaskState {
    let cancelled = extra.step.as_deref() == Some("cancelled");
    let (phase, final_video_url, error_message) =
        match (cancelled, &extra.final_video_url, &extra.error) {
            (true, _, error) => (
                Phase::Cancelled,
                None,
                Some(error.clone().unwrap_or_else(|| CANCELLED_MESSAGE.to_string())),
            ),
            (false, _, Some(error)) => (Phase::Errored, None, Some(error.clone())),
            (false, Some(url), None) => (Phase::Done, Some(url.clone()), None),
            (false, None, None) => {
                tracing::warn!(message_id = %id, "task record has neither video nor error");
                (
                    Phase::Errored,
                    None,
                    Some(INCOMPLETE_RECORD_MESSAGE.to_string()),
                )
            }
        };

    let default_progress = if phase == Phase::Done { 1.0 } else { 0.0 };
    let progress = extra
        .progress
        .filter(|value| value.is_finite())
        .map(|value| value.clamp(0.0, 1.0))
        .unwrap_or(default_progress);
    let stage = extra
        .stage
        .as_deref()
        .and_then(PipelineStage::parse)
        .unwrap_or(if phase == Phase::Done {
            PipelineStage::Done
        } else {
            PipelineStage::Init
        });

    let mut state = TaskState::new(id, extra.topic.clone().unwrap_or_default());
    state.remote_task_id = extra.task_id.clone();
    state.phase = phase;
    state.stage = stage;
    state.progress = progress;
    state.script = extra.scripts.clone();
    state.scenes = extra.scenes.iter().cloned().map(Arc::new).collect();
    state.final_video_url = final_video_url;
    state.error_message = error_message;
    state
}

/// Encodes a terminal task as a JSON object string for storage.
pub fn encode(state: &TaskState) -> HistoryResult<String> {
    let extra = serialize(state)?;
    serde_json::to_string(&extra).context(EncodeExtraSnafu {
        stage: "history-encode",
    })
}

/// Decodes stored extra JSON; unreadable input is treated as an empty record.
pub fn decode(id: MessageId, extra_json: &str) -> TaskState {
    let extra = match serde_json::from_str::<TaskExtra>(extra_json) {
        Ok(extra) => extra,
        Err(error) => {
            tracing::warn!(
                message_id = %id,
                error = %error,
                "unreadable task record; hydrating with defaults"
            );
            TaskExtra::default()
        }
    };
    deserialize(id, &extra)
}

/// Converts one stored record into a conversation message.
pub fn hydrate_record(record: &MessageRecord) -> ConversationMessage {
    let message = match (&record.role, record.extra_json.as_deref()) {
        (MessageRole::System, Some(extra_json)) => {
            ConversationMessage::task(record.content.clone(), decode(record.id, extra_json))
        }
        (role, _) => ConversationMessage::new(record.id, Role::from(*role), record.content.clone()),
    };
    message.with_timestamp(record.created_at_unix_seconds)
}

pub fn hydrate_snapshot(snapshot: &SessionSnapshot) -> Vec<ConversationMessage> {
    snapshot.messages.iter().map(hydrate_record).collect()
}
