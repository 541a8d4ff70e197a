use std::time::Duration;

use snafu::ensure;
use tokio::sync::{mpsc, oneshot};

use crate::event::{GenerationRequest, MAX_TOPIC_CHARS, StreamEvent, StreamItem};
use crate::frame::{Frame, decode_frame, parse_json_lines};
use crate::source::{
    EventSource, InvalidRequestSnafu, SourceResult, SourceStreamHandle, SourceWorker,
    make_event_stream,
};

pub const SCRIPTED_SOURCE_ID: &str = "scripted";

/// Replays a fixed list of frames as if a remote pipeline produced them.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSource {
    frames: Vec<Frame>,
    frame_delay: Duration,
    transport_failure: Option<String>,
}

impl ScriptedSource {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            frames,
            ..Self::default()
        }
    }

    pub fn from_events(events: &[StreamEvent]) -> Self {
        Self::new(events.iter().map(Frame::from).collect())
    }

    pub fn from_json_lines(text: &str) -> SourceResult<Self> {
        parse_json_lines(text).map(Self::new)
    }

    pub fn with_frame_delay(mut self, frame_delay: Duration) -> Self {
        self.frame_delay = frame_delay;
        self
    }

    /// Ends the replay with a transport failure after the last frame.
    pub fn with_transport_failure(mut self, details: impl Into<String>) -> Self {
        self.transport_failure = Some(details.into());
        self
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    async fn run_replay_worker(
        frames: Vec<Frame>,
        frame_delay: Duration,
        transport_failure: Option<String>,
        event_tx: mpsc::UnboundedSender<StreamItem>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        for frame in frames {
            tokio::select! {
                biased;
                _ = &mut cancel_rx => {
                    tracing::debug!(event = %frame.event, "scripted stream cancelled");
                    return;
                }
                _ = tokio::time::sleep(frame_delay) => {}
            }

            let item = match decode_frame(&frame) {
                Ok(event) => StreamItem::Event(event),
                Err(error) => {
                    tracing::warn!(event = %frame.event, error = %error, "dropping malformed frame");
                    StreamItem::Malformed(error.to_string())
                }
            };
            if event_tx.send(item).is_err() {
                return;
            }
        }

        if let Some(details) = transport_failure {
            let _ = event_tx.send(StreamItem::TransportFailed(details));
        }
    }
}

impl EventSource for ScriptedSource {
    fn id(&self) -> &str {
        SCRIPTED_SOURCE_ID
    }

    fn open(&self, request: GenerationRequest) -> SourceResult<SourceStreamHandle> {
        let topic = request.topic.trim();
        ensure!(
            !topic.is_empty() && topic.chars().count() <= MAX_TOPIC_CHARS,
            InvalidRequestSnafu {
                stage: "scripted-open",
                details: format!("topic must be 1..={MAX_TOPIC_CHARS} characters"),
            }
        );
        tracing::debug!(
            topic = %topic,
            style = %request.style,
            theme = request.theme.as_deref().unwrap_or_default(),
            frame_count = self.frames.len(),
            "opening scripted stream"
        );

        let (event_tx, events, cancel, cancel_rx) = make_event_stream();
        let worker: SourceWorker = Box::pin(Self::run_replay_worker(
            self.frames.clone(),
            self.frame_delay,
            self.transport_failure.clone(),
            event_tx,
            cancel_rx,
        ));

        Ok(SourceStreamHandle {
            events,
            cancel,
            worker,
        })
    }
}
