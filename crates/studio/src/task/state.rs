use std::fmt;
use std::sync::Arc;

use scenecast_storage::MessageId;
use scenecast_stream::CancelHandle;
use serde::{Deserialize, Serialize};

/// Error message recorded when the user stops a generation.
pub const CANCELLED_MESSAGE: &str = "cancelled by user";

/// Coarse lifecycle of one generation task.
///
/// Variant order matters: live phases only ever move forward in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    Init,
    Writing,
    Rendering,
    Done,
    Errored,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Errored | Self::Cancelled)
    }

    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    /// Step label written to the persisted record of a terminal task.
    pub fn step_label(&self) -> Option<&'static str> {
        match self {
            Self::Done => Some("done"),
            Self::Errored => Some("error"),
            Self::Cancelled => Some("cancelled"),
            Self::Init | Self::Writing | Self::Rendering => None,
        }
    }
}

/// Fine-grained step reported by the remote pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum PipelineStage {
    #[default]
    Init,
    Writing,
    Imaging,
    Animating,
    Composing,
    Narrating,
    AddingAudio,
    Done,
}

impl PipelineStage {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "init" => Some(Self::Init),
            "writing" => Some(Self::Writing),
            "imaging" => Some(Self::Imaging),
            "animating" => Some(Self::Animating),
            "composing" => Some(Self::Composing),
            "narrating" => Some(Self::Narrating),
            "adding_audio" => Some(Self::AddingAudio),
            "done" => Some(Self::Done),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Writing => "writing",
            Self::Imaging => "imaging",
            Self::Animating => "animating",
            Self::Composing => "composing",
            Self::Narrating => "narrating",
            Self::AddingAudio => "adding_audio",
            Self::Done => "done",
        }
    }

    /// Human-readable step message shown next to the progress value.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Init => "Starting generation...",
            Self::Writing => "Writing the script...",
            Self::Imaging => "Generating scene images...",
            Self::Animating => "Animating scenes...",
            Self::Composing => "Composing the video...",
            Self::Narrating => "Recording narration...",
            Self::AddingAudio => "Mixing audio...",
            Self::Done => "Finishing up...",
        }
    }

    /// Live phase this stage belongs to. `Done` is reached only through a `done` event.
    pub fn phase(&self) -> Phase {
        match self {
            Self::Init => Phase::Init,
            Self::Writing => Phase::Writing,
            Self::Imaging
            | Self::Animating
            | Self::Composing
            | Self::Narrating
            | Self::AddingAudio
            | Self::Done => Phase::Rendering,
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// One script line, fixed once writing completes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScriptEntry {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub text: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub emotion: String,
}

impl ScriptEntry {
    pub fn new(
        id: i64,
        text: impl Into<String>,
        kind: impl Into<String>,
        emotion: impl Into<String>,
    ) -> Self {
        Self {
            id,
            text: text.into(),
            kind: kind.into(),
            emotion: emotion.into(),
        }
    }
}

/// Media produced for one scene.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Scene {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub text: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub emotion: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
}

/// Full state of one generation task.
///
/// The cancel handle lives here while the task is live; the reducer releases it
/// on the first terminal transition.
#[derive(Debug, PartialEq)]
pub struct TaskState {
    pub id: MessageId,
    pub topic: String,
    pub remote_task_id: Option<String>,
    pub phase: Phase,
    pub stage: PipelineStage,
    pub progress: f64,
    pub script: Vec<ScriptEntry>,
    /// First-seen order; untouched entries keep their allocation across updates.
    pub scenes: Vec<Arc<Scene>>,
    pub final_video_url: Option<String>,
    pub error_message: Option<String>,
    pub(crate) cancel: Option<CancelHandle>,
}

impl TaskState {
    pub fn new(id: MessageId, topic: impl Into<String>) -> Self {
        Self {
            id,
            topic: topic.into(),
            remote_task_id: None,
            phase: Phase::Init,
            stage: PipelineStage::Init,
            progress: 0.0,
            script: Vec::new(),
            scenes: Vec::new(),
            final_video_url: None,
            error_message: None,
            cancel: None,
        }
    }

    /// Creates a live task controlled by `cancel`.
    pub fn live(id: MessageId, topic: impl Into<String>, cancel: CancelHandle) -> Self {
        let mut state = Self::new(id, topic);
        state.cancel = Some(cancel);
        state
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn is_cancelable(&self) -> bool {
        self.cancel.is_some()
    }

    pub fn scene(&self, scene_id: i64) -> Option<&Scene> {
        self.scenes
            .iter()
            .find(|scene| scene.id == scene_id)
            .map(Arc::as_ref)
    }

    /// Copies everything except the cancel handle.
    pub fn snapshot(&self) -> Self {
        Self {
            id: self.id,
            topic: self.topic.clone(),
            remote_task_id: self.remote_task_id.clone(),
            phase: self.phase,
            stage: self.stage,
            progress: self.progress,
            script: self.script.clone(),
            scenes: self.scenes.clone(),
            final_video_url: self.final_video_url.clone(),
            error_message: self.error_message.clone(),
            cancel: None,
        }
    }

    /// Inline status shown where the task message renders.
    pub fn status_line(&self) -> String {
        match self.phase {
            Phase::Done => match &self.final_video_url {
                Some(url) => format!("Video ready: {url}"),
                None => "Video ready".to_string(),
            },
            Phase::Errored => format!(
                "Generation failed: {}",
                self.error_message.as_deref().unwrap_or("unknown error")
            ),
            Phase::Cancelled => format!("[{CANCELLED_MESSAGE}]"),
            Phase::Init | Phase::Writing | Phase::Rendering => {
                let percent = (self.progress * 100.0).round() as u32;
                format!("{percent}% {}", self.stage.label())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_map_onto_live_phases() {
        assert_eq!(PipelineStage::Init.phase(), Phase::Init);
        assert_eq!(PipelineStage::Writing.phase(), Phase::Writing);
        assert_eq!(PipelineStage::Imaging.phase(), Phase::Rendering);
        assert_eq!(PipelineStage::AddingAudio.phase(), Phase::Rendering);
        assert_eq!(PipelineStage::Done.phase(), Phase::Rendering);
        assert_eq!(PipelineStage::parse("adding_audio"), Some(PipelineStage::AddingAudio));
        assert_eq!(PipelineStage::parse("Writing"), None);
    }

    #[test]
    fn status_line_follows_phase() {
        let mut state = TaskState::new(MessageId::new_v7(), "tides");
        state.progress = 0.25;
        state.stage = PipelineStage::Imaging;
        assert_eq!(state.status_line(), "25% Generating scene images...");

        state.phase = Phase::Cancelled;
        state.error_message = Some(CANCELLED_MESSAGE.to_string());
        assert_eq!(state.status_line(), "[cancelled by user]");

        state.phase = Phase::Errored;
        state.error_message = Some("quota exceeded".to_string());
        assert_eq!(state.status_line(), "Generation failed: quota exceeded");
    }

    #[test]
    fn snapshot_drops_the_cancel_handle() {
        let (cancel, _cancel_rx) = CancelHandle::pair();
        let state = TaskState::live(MessageId::new_v7(), "tides", cancel);
        let snapshot = state.snapshot();

        assert!(state.is_cancelable());
        assert!(!snapshot.is_cancelable());
        assert_eq!(snapshot.topic, "tides");
    }
}
