use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{ResultExt, ensure};

use crate::event::{
    DoneEvent, ErrorEvent, InitEvent, ProgressEvent, SceneEvent, StreamEvent, WritingDoneEvent,
};
use crate::source::{MalformedFrameSnafu, ParseFrameLineSnafu, SourceResult};

/// A raw server-sent frame: an event name plus its JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

impl From<&StreamEvent> for Frame {
    fn from(event: &StreamEvent) -> Self {
        let data = match event {
            StreamEvent::Init(payload) => serde_json::to_value(payload),
            StreamEvent::Progress(payload) => serde_json::to_value(payload),
            StreamEvent::WritingDone(payload) => serde_json::to_value(payload),
            StreamEvent::Scene(payload) => serde_json::to_value(payload),
            StreamEvent::Done(payload) => serde_json::to_value(payload),
            StreamEvent::Error(payload) => serde_json::to_value(payload),
        };
        // Payload structs contain only strings, numbers and lists.
        Self::new(event.name(), data.unwrap_or(Value::Null))
    }
}

/// Decodes one frame into a typed event.
///
/// Only the frame shape is checked here: an unknown event name, a non-object
/// payload, or a field of the wrong JSON type. Missing fields stay `None`.
pub fn decode_frame(frame: &Frame) -> SourceResult<StreamEvent> {
    let event = frame.event.trim();
    let data = match &frame.data {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    ensure!(
        data.is_object(),
        MalformedFrameSnafu {
            stage: "decode-frame-payload",
            event: event.to_string(),
            details: "payload is not a JSON object".to_string(),
        }
    );

    match event {
        "init" => decode_payload::<InitEvent>(event, data).map(StreamEvent::Init),
        "progress" => decode_payload::<ProgressEvent>(event, data).map(StreamEvent::Progress),
        "writing_done" => {
            decode_payload::<WritingDoneEvent>(event, data).map(StreamEvent::WritingDone)
        }
        "scene" => decode_payload::<SceneEvent>(event, data).map(StreamEvent::Scene),
        "done" => decode_payload::<DoneEvent>(event, data).map(StreamEvent::Done),
        "error" => decode_payload::<ErrorEvent>(event, data).map(StreamEvent::Error),
        _ => MalformedFrameSnafu {
            stage: "decode-frame-name",
            event: event.to_string(),
            details: "unknown event name".to_string(),
        }
        .fail(),
    }
}

fn decode_payload<T>(event: &str, data: Value) -> SourceResult<T>
where
    T: DeserializeOwned,
{
    serde_json::from_value(data).map_err(|source| {
        MalformedFrameSnafu {
            stage: "decode-frame-fields",
            event: event.to_string(),
            details: source.to_string(),
        }
        .build()
    })
}

/// Parses a JSON Lines replay file. Blank lines and `#` comments are skipped.
pub fn parse_json_lines(text: &str) -> SourceResult<Vec<Frame>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| {
            let trimmed = line.trim();
            !trimmed.is_empty() && !trimmed.starts_with('#')
        })
        .map(|(index, line)| {
            serde_json::from_str::<Frame>(line.trim()).context(ParseFrameLineSnafu {
                stage: "parse-json-lines",
                line: index + 1,
            })
        })
        .collect()
}
