use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum topic length accepted by the generation endpoint.
pub const MAX_TOPIC_CHARS: usize = 200;

/// Narrative style presets understood by the remote pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Style {
    Camus,
    Healing,
    Knowledge,
    Humor,
    Growth,
    #[default]
    Minimal,
}

impl Style {
    pub const ALL: [Style; 6] = [
        Self::Camus,
        Self::Healing,
        Self::Knowledge,
        Self::Humor,
        Self::Growth,
        Self::Minimal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Camus => "camus",
            Self::Healing => "healing",
            Self::Knowledge => "knowledge",
            Self::Humor => "humor",
            Self::Growth => "growth",
            Self::Minimal => "minimal",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|style| style.as_str().eq_ignore_ascii_case(raw.trim()))
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Camus => "absurdist philosophy, restrained and poetic",
            Self::Healing => "warm companionship and gentle encouragement",
            Self::Knowledge => "hard science, data-driven and logical",
            Self::Humor => "playful twists and light teasing",
            Self::Growth => "self-improvement and calls to action",
            Self::Minimal => "short, punchy one-liners",
        }
    }
}

impl fmt::Display for Style {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// One generation job as submitted to the remote pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub topic: String,
    #[serde(default)]
    pub style: Style,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
}

impl GenerationRequest {
    pub fn new(topic: impl Into<String>, style: Style) -> Self {
        Self {
            topic: topic.into(),
            style,
            theme: None,
        }
    }

    pub fn with_theme(mut self, theme: impl Into<String>) -> Self {
        self.theme = Some(theme.into());
        self
    }
}

/// Which media field a scene event fills in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SceneKind {
    Image,
    Video,
}

// Payload structs keep required fields optional: deciding what a missing field
// means belongs to the consumer, not to the decoder.

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InitEvent {
    #[serde(rename = "task_id", default, skip_serializing_if = "Option::is_none")]
    pub remote_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "progress", default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(rename = "step", default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// One script line produced by the writing stage.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScriptDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default)]
    pub text: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub emotion: String,
}

impl ScriptDraft {
    pub fn new(
        id: i64,
        text: impl Into<String>,
        kind: impl Into<String>,
        emotion: impl Into<String>,
    ) -> Self {
        Self {
            id: Some(id),
            text: text.into(),
            kind: kind.into(),
            emotion: emotion.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WritingDoneEvent {
    #[serde(rename = "scenes", default, skip_serializing_if = "Option::is_none")]
    pub scenes_draft: Option<Vec<ScriptDraft>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SceneEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_id: Option<i64>,
    #[serde(rename = "scene_type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<SceneKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotion: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DoneEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_video_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Typed progress events emitted by a generation stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Init(InitEvent),
    Progress(ProgressEvent),
    WritingDone(WritingDoneEvent),
    Scene(SceneEvent),
    Done(DoneEvent),
    Error(ErrorEvent),
}

impl StreamEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init(_) => "init",
            Self::Progress(_) => "progress",
            Self::WritingDone(_) => "writing_done",
            Self::Scene(_) => "scene",
            Self::Done(_) => "done",
            Self::Error(_) => "error",
        }
    }

    pub fn init(remote_task_id: impl Into<String>) -> Self {
        Self::Init(InitEvent {
            remote_task_id: Some(remote_task_id.into()),
            topic: None,
        })
    }

    pub fn progress(value: f64, stage: impl Into<String>) -> Self {
        Self::Progress(ProgressEvent {
            value: Some(value),
            stage: Some(stage.into()),
            message: None,
        })
    }

    pub fn writing_done(scenes_draft: Vec<ScriptDraft>) -> Self {
        Self::WritingDone(WritingDoneEvent {
            scenes_draft: Some(scenes_draft),
        })
    }

    pub fn scene(scene_id: i64, kind: SceneKind, url: impl Into<String>) -> Self {
        Self::Scene(SceneEvent {
            scene_id: Some(scene_id),
            kind: Some(kind),
            url: Some(url.into()),
            text: None,
            emotion: None,
        })
    }

    pub fn done(final_video_url: impl Into<String>) -> Self {
        Self::Done(DoneEvent {
            final_video_url: Some(final_video_url.into()),
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorEvent {
            message: Some(message.into()),
        })
    }
}

/// One item delivered on an event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Event(StreamEvent),
    /// A frame arrived but could not be decoded into an event.
    Malformed(String),
    /// The transport failed; no further items follow.
    TransportFailed(String),
}
