use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::Stream;
use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use crate::event::{GenerationRequest, StreamItem};

pub type SourceWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type SourceResult<T> = Result<T, SourceError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SourceError {
    #[snafu(display("malformed '{event}' frame: {details}"))]
    MalformedFrame {
        stage: &'static str,
        event: String,
        details: String,
    },
    #[snafu(display("failed to parse replay frame on line {line}"))]
    ParseFrameLine {
        stage: &'static str,
        line: usize,
        source: serde_json::Error,
    },
    #[snafu(display("event transport failed on `{stage}`: {details}"))]
    Transport {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("generation request rejected: {details}"))]
    InvalidRequest {
        stage: &'static str,
        details: String,
    },
}

static NEXT_CANCEL_ID: AtomicU64 = AtomicU64::new(1);

/// Abort signal for one open stream.
///
/// The handle is owned by whoever controls the task; dropping it stops the
/// stream the same way `abort` does.
#[derive(Debug)]
pub struct CancelHandle {
    id: u64,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub(crate) fn new(cancel_tx: oneshot::Sender<()>) -> Self {
        Self {
            id: NEXT_CANCEL_ID.fetch_add(1, Ordering::Relaxed),
            cancel_tx: Some(cancel_tx),
        }
    }

    /// Creates a handle together with the receiving end a worker listens on.
    pub fn pair() -> (Self, oneshot::Receiver<()>) {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        (Self::new(cancel_tx), cancel_rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Signals the worker. Returns `true` only for the call that delivered the signal.
    pub fn abort(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel_tx.is_none()
    }
}

impl PartialEq for CancelHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CancelHandle {}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// Receiving side of an open generation stream.
pub struct EventStream {
    events: mpsc::UnboundedReceiver<StreamItem>,
}

impl EventStream {
    pub(crate) fn new(events: mpsc::UnboundedReceiver<StreamItem>) -> Self {
        Self { events }
    }

    pub async fn recv(&mut self) -> Option<StreamItem> {
        self.events.recv().await
    }
}

impl Stream for EventStream {
    type Item = StreamItem;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.poll_recv(cx)
    }
}

pub struct SourceStreamHandle {
    pub events: EventStream,
    pub cancel: CancelHandle,
    /// Must be spawned by the caller; nothing is delivered until it runs.
    pub worker: SourceWorker,
}

/// External collaborator producing generation events for a request.
pub trait EventSource: Send + Sync {
    fn id(&self) -> &str;
    fn open(&self, request: GenerationRequest) -> SourceResult<SourceStreamHandle>;
}

pub fn make_event_stream() -> (
    mpsc::UnboundedSender<StreamItem>,
    EventStream,
    CancelHandle,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel, cancel_rx) = CancelHandle::pair();
    (event_tx, EventStream::new(event_rx), cancel, cancel_rx)
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::event::StreamEvent;

    #[test]
    fn abort_is_idempotent() {
        let (mut handle, mut cancel_rx) = CancelHandle::pair();

        assert!(handle.abort());
        assert!(!handle.abort());
        assert!(handle.is_aborted());
        assert_eq!(cancel_rx.try_recv(), Ok(()));
    }

    #[test]
    fn dropping_a_handle_signals_the_worker() {
        let (handle, mut cancel_rx) = CancelHandle::pair();
        drop(handle);
        assert_eq!(cancel_rx.try_recv(), Ok(()));
    }

    #[test]
    fn handles_compare_by_identity() {
        let (first, _first_rx) = CancelHandle::pair();
        let (second, _second_rx) = CancelHandle::pair();
        assert_ne!(first, second);
        assert_ne!(first.id(), second.id());
    }

    #[tokio::test]
    async fn event_stream_yields_items_until_sender_drops() {
        let (event_tx, events, _cancel, _cancel_rx) = make_event_stream();
        event_tx
            .send(StreamItem::Event(StreamEvent::init("t1")))
            .unwrap();
        event_tx
            .send(StreamItem::Malformed("bad".to_string()))
            .unwrap();
        drop(event_tx);

        let items = events.collect::<Vec<_>>().await;
        assert_eq!(
            items,
            vec![
                StreamItem::Event(StreamEvent::init("t1")),
                StreamItem::Malformed("bad".to_string()),
            ]
        );
    }
}
