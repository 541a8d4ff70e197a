pub mod event;
pub mod frame;
pub mod scripted;
pub mod source;

pub use event::{
    DoneEvent, ErrorEvent, GenerationRequest, InitEvent, MAX_TOPIC_CHARS, ProgressEvent,
    SceneEvent, SceneKind, ScriptDraft, StreamEvent, StreamItem, Style, WritingDoneEvent,
};
pub use frame::{Frame, decode_frame, parse_json_lines};
pub use scripted::{SCRIPTED_SOURCE_ID, ScriptedSource};
pub use source::{
    CancelHandle, EventSource, EventStream, SourceError, SourceResult, SourceStreamHandle,
    SourceWorker, make_event_stream,
};
