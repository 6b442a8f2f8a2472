//! Kubetail log fetchers: pull records for one (pod, container) endpoint in
//! forward or backward time order, behind a capability-bearing trait with
//! transparent fallback across three transports.

#![forbid(unsafe_code)]

mod agent;
mod clusterapi;
mod kube_api;
mod line;
mod select;

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use kubetail_core::cursor::TailCursor;
use kubetail_core::{Error, FetchCapabilities, FetchOptions, LogRecord, LogSource, Result};

pub use agent::AgentFetcher;
pub use clusterapi::ClusterApiFetcher;
pub use kube_api::KubeApiFetcher;
pub use line::parse_line;
pub use select::{select_fetcher, DISCOVERY_TIMEOUT};

/// Default bound for per-endpoint record channels; the small bound is what
/// propagates back-pressure to the transport.
pub fn queue_cap() -> usize {
    std::env::var("KUBETAIL_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(256)
}

/// Cancellation handle for an in-flight fetch.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Latest-error slot shared between a fetch task and its consumer.
#[derive(Debug, Clone, Default)]
pub struct ErrorSlot(Arc<Mutex<Option<Error>>>);

impl ErrorSlot {
    pub fn set(&self, e: Error) {
        *self.0.lock().expect("error slot poisoned") = Some(e);
    }

    pub fn get(&self) -> Option<Error> {
        self.0.lock().expect("error slot poisoned").clone()
    }
}

/// Replay-state slot a backward fetch fills in once its window is known, so
/// the coordinator can mint the next page's cursor.
#[derive(Debug, Clone, Default)]
pub struct CursorSlot(Arc<Mutex<Option<TailCursor>>>);

impl CursorSlot {
    pub fn set(&self, c: TailCursor) {
        *self.0.lock().expect("cursor slot poisoned") = Some(c);
    }

    pub fn get(&self) -> Option<TailCursor> {
        self.0.lock().expect("cursor slot poisoned").clone()
    }
}

/// One endpoint's record stream. The channel closes on window exhaustion,
/// cancellation or upstream error; `last_error` distinguishes the third.
pub struct RecordStream {
    pub rx: mpsc::Receiver<LogRecord>,
    pub cancel: CancelHandle,
    pub error: ErrorSlot,
    pub tail_cursor: CursorSlot,
}

impl RecordStream {
    pub fn new(
        rx: mpsc::Receiver<LogRecord>,
        cancel: CancelHandle,
        error: ErrorSlot,
        tail_cursor: CursorSlot,
    ) -> Self {
        Self { rx, cancel, error, tail_cursor }
    }

    pub fn last_error(&self) -> Option<Error> {
        self.error.get()
    }
}

/// Pulls records for one (pod, container) endpoint. All implementations
/// respect `opts.grep` semantically; `capabilities` says whether that
/// filtering (and backward/follow support) runs server-side.
#[async_trait::async_trait]
pub trait LogFetcher: Send + Sync {
    fn capabilities(&self) -> FetchCapabilities;

    async fn stream_forward(&self, source: &LogSource, opts: FetchOptions) -> Result<RecordStream>;

    async fn stream_backward(&self, source: &LogSource, opts: FetchOptions)
        -> Result<RecordStream>;
}
