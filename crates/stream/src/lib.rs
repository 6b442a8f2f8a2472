//! Kubetail streaming engine: the stream coordinator plus its parts (source
//! resolver, workload watcher, k-way merger).

#![forbid(unsafe_code)]

pub mod merge;
pub mod resolve;
pub mod watch;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kubetail_core::cursor::TailCursor;
use kubetail_core::{
    Error, FetchCapabilities, FetchDirection, FetchOptions, FetcherTag, LogRecord, LogSource,
    Result, SourceExpr, SourceFilter, SourceKey, StreamMode,
};
use kubetail_fetch::{select_fetcher, CursorSlot, ErrorSlot, LogFetcher, RecordStream};
use kubetail_kubehub::ConnectionManager;

use merge::{spawn_merger, MergeControl, MergerConfig, DEFAULT_IDLE_TIMEOUT};
use resolve::resolve_sources;
use watch::{spawn_watchers, EndpointEvent, NodeMetaCache};

const OUT_CAP: usize = 64;
const EVENT_CAP: usize = 64;

/// Everything a stream needs beyond its source expressions.
#[derive(Debug, Clone)]
pub struct LogStreamOptions {
    pub mode: StreamMode,
    pub follow: bool,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub grep: Option<String>,
    pub filter: SourceFilter,
    pub context: Option<String>,
    pub tail_cursor: Option<TailCursor>,
    pub idle_timeout: Duration,
    pub test_hooks: bool,
}

impl Default for LogStreamOptions {
    fn default() -> Self {
        Self {
            mode: StreamMode::All,
            follow: false,
            since: None,
            until: None,
            grep: None,
            filter: SourceFilter::default(),
            context: None,
            tail_cursor: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            test_hooks: false,
        }
    }
}

/// One log stream: resolve → watch → fetch → merge → deliver. Construct,
/// `start()`, then drain `records()`.
pub struct LogStream {
    cm: Arc<ConnectionManager>,
    exprs: Vec<SourceExpr>,
    opts: LogStreamOptions,
    token: CancellationToken,
    err: ErrorSlot,
    sources: Arc<StdMutex<Vec<LogSource>>>,
    tail_cursors: Arc<StdMutex<Vec<(SourceKey, CursorSlot)>>>,
    records_rx: Option<mpsc::Receiver<LogRecord>>,
    fetcher_tag: Option<FetcherTag>,
    started: bool,
}

impl LogStream {
    pub fn new(cm: Arc<ConnectionManager>, exprs: Vec<SourceExpr>, opts: LogStreamOptions) -> Self {
        Self {
            cm,
            exprs,
            opts,
            token: CancellationToken::new(),
            err: ErrorSlot::default(),
            sources: Arc::new(StdMutex::new(Vec::new())),
            tail_cursors: Arc::new(StdMutex::new(Vec::new())),
            records_rx: None,
            fetcher_tag: None,
            started: false,
        }
    }

    /// Resolves sources, opens watches and the initial fetchers, constructs
    /// the merger and begins delivery. Errors here are fatal for the stream.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::fatal("stream already started"));
        }
        self.started = true;

        let grep_re = match &self.opts.grep {
            Some(pattern) => Some(
                Regex::new(pattern)
                    .map_err(|e| Error::invalid(format!("bad grep pattern {pattern:?}: {e}")))?,
            ),
            None => None,
        };

        let context = self.opts.context.as_deref();
        let client = self.cm.client(context).await?;
        let default_ns = self.cm.default_namespace(context);
        let resolution = resolve_sources(
            &client,
            &self.exprs,
            &default_ns,
            self.cm.allowed_namespaces(),
            &self.opts.filter,
        )
        .await?;
        *self.sources.lock().expect("sources lock") = resolution.sources.clone();

        let need = FetchCapabilities {
            server_side_grep: false,
            backward: self.opts.mode.is_backward(),
            follow: self.opts.follow,
        };
        let (fetcher, tag) = select_fetcher(&client, need).await;
        self.fetcher_tag = Some(tag);

        let (out_tx, out_rx) = mpsc::channel(OUT_CAP);
        self.records_rx = Some(out_rx);

        let (events_tx, events_rx) = mpsc::channel(EVENT_CAP);
        if self.opts.follow {
            spawn_watchers(
                client.clone(),
                resolution.selections.clone(),
                self.opts.filter.clone(),
                &resolution.sources,
                NodeMetaCache::seeded(resolution.node_meta.clone()),
                events_tx,
                self.err.clone(),
                self.token.clone(),
            );
        }

        let delivery = Delivery {
            fetcher,
            opts: self.opts.clone(),
            grep: grep_re,
            initial: resolution.sources,
            out_tx,
            events_rx,
            err: self.err.clone(),
            token: self.token.clone(),
            sources: Arc::clone(&self.sources),
            tail_cursors: Arc::clone(&self.tail_cursors),
        };
        tokio::spawn(delivery.run());
        info!(mode = %self.opts.mode, follow = self.opts.follow, fetcher = %tag, "log stream started");
        Ok(())
    }

    /// The merged record channel; closed at end of window (non-follow) or on
    /// cancellation. May be taken once.
    pub fn records(&mut self) -> Result<mpsc::Receiver<LogRecord>> {
        self.records_rx
            .take()
            .ok_or_else(|| Error::fatal("records() called before start() or taken twice"))
    }

    /// Snapshot of the current endpoint set, kept current by the watcher.
    pub fn sources(&self) -> Vec<LogSource> {
        self.sources.lock().expect("sources lock").clone()
    }

    /// Last error; `Some` after `records()` closes iff the close was
    /// abnormal.
    pub fn err(&self) -> Option<Error> {
        self.err.get()
    }

    pub fn fetcher(&self) -> Option<FetcherTag> {
        self.fetcher_tag
    }

    /// Back-scan replay cursors collected from backward fetches, keyed by
    /// endpoint; the single-endpoint convenience is `tail_cursor()`.
    pub fn tail_cursors(&self) -> Vec<(SourceKey, TailCursor)> {
        self.tail_cursors
            .lock()
            .expect("cursor lock")
            .iter()
            .filter_map(|(k, slot)| slot.get().map(|c| (k.clone(), c)))
            .collect()
    }

    pub fn tail_cursor(&self) -> Option<TailCursor> {
        self.tail_cursors().into_iter().map(|(_, c)| c).next()
    }

    /// Idempotent; cancels every task of this stream and drains.
    pub fn close(&self) {
        self.token.cancel();
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct Delivery {
    fetcher: Arc<dyn LogFetcher>,
    opts: LogStreamOptions,
    grep: Option<Regex>,
    initial: Vec<LogSource>,
    out_tx: mpsc::Sender<LogRecord>,
    events_rx: mpsc::Receiver<EndpointEvent>,
    err: ErrorSlot,
    token: CancellationToken,
    sources: Arc<StdMutex<Vec<LogSource>>>,
    tail_cursors: Arc<StdMutex<Vec<(SourceKey, CursorSlot)>>>,
}

impl Delivery {
    fn merger_config(&self, direction: FetchDirection) -> MergerConfig {
        let client_grep = if self.fetcher.capabilities().server_side_grep {
            None
        } else {
            self.grep.clone()
        };
        MergerConfig {
            direction,
            grep: client_grep,
            idle_timeout: self.opts.idle_timeout,
            out_cap: OUT_CAP,
        }
    }

    fn fetch_options(&self, direction: FetchDirection, follow: bool) -> FetchOptions {
        FetchOptions {
            start_time: self.opts.since,
            stop_time: self.opts.until,
            grep: if self.fetcher.capabilities().server_side_grep {
                self.opts.grep.clone()
            } else {
                None
            },
            // A following endpoint keeps producing past the historical
            // window, so the cap only applies to one-shot reads.
            limit: if follow { None } else { self.opts.mode.limit() },
            direction,
            follow,
            tail_cursor: self.opts.tail_cursor.clone(),
            test_hooks: self.opts.test_hooks,
        }
    }

    async fn run(mut self) {
        match self.opts.mode {
            StreamMode::Head(_) | StreamMode::All => {
                let since = self.opts.since;
                self.run_forward(since).await;
            }
            StreamMode::Tail(limit) => {
                let block = self.run_backward_collect(limit).await;
                // The block is collected newest-first and handed to the
                // caller oldest-first.
                let mut watermark = None;
                for record in block.into_iter().rev() {
                    watermark = Some(record.timestamp);
                    tokio::select! {
                        _ = self.token.cancelled() => return,
                        sent = self.out_tx.send(record) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
                if self.opts.follow {
                    let resume = watermark
                        .map(|t| t + chrono::Duration::nanoseconds(1))
                        .unwrap_or_else(Utc::now);
                    self.run_forward(Some(resume)).await;
                }
            }
        }
        debug!("stream delivery finished");
    }

    /// Head/All/follow phase: forward fetchers into a min-order merger, with
    /// the watcher feeding endpoint churn.
    async fn run_forward(&mut self, since: Option<DateTime<Utc>>) {
        let follow = self.opts.follow;
        // Following streams have no record cap: the head window flows
        // straight into live delivery.
        let limit = match self.opts.mode {
            StreamMode::Head(n) if !follow => Some(n),
            _ => None,
        };
        let (mut merged_rx, control) =
            spawn_merger(self.merger_config(FetchDirection::Forward), self.err.clone(), self.token.clone());

        let mut opts = self.fetch_options(FetchDirection::Forward, follow);
        opts.start_time = since;
        for source in self.initial.clone() {
            let Some(stream) = self.open(&source, &opts, FetchDirection::Forward).await else {
                continue;
            };
            if control.send(MergeControl::Add { source, stream }).await.is_err() {
                return;
            }
        }
        if !follow {
            let _ = control.send(MergeControl::Finish).await;
        }

        let mut emitted: u64 = 0;
        let mut watermark = since;
        let mut watch_open = follow;
        loop {
            tokio::select! {
                record = merged_rx.recv() => {
                    let Some(record) = record else { break };
                    watermark = Some(record.timestamp);
                    tokio::select! {
                        _ = self.token.cancelled() => break,
                        sent = self.out_tx.send(record) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                    emitted += 1;
                    if matches!(limit, Some(n) if emitted >= n) {
                        debug!(emitted, "head window complete");
                        break;
                    }
                }
                event = self.events_rx.recv(), if watch_open => {
                    match event {
                        Some(EndpointEvent::Joined(source)) => {
                            self.sources.lock().expect("sources lock").push(source.clone());
                            // Re-seek at the watermark so the merged stream
                            // never goes backwards.
                            let mut opts = self.fetch_options(FetchDirection::Forward, follow);
                            opts.start_time = watermark.or(since);
                            let Some(stream) = self.open(&source, &opts, FetchDirection::Forward).await else {
                                continue;
                            };
                            if control.send(MergeControl::Add { source, stream }).await.is_err() {
                                break;
                            }
                        }
                        Some(EndpointEvent::Left(source)) => {
                            self.sources
                                .lock()
                                .expect("sources lock")
                                .retain(|s| s.key() != source.key());
                            if control.send(MergeControl::Remove { key: source.key() }).await.is_err() {
                                break;
                            }
                        }
                        None => watch_open = false,
                    }
                }
            }
        }
    }

    /// Tail phase: backward fetchers into a max-order merger; collects the
    /// newest `limit` records and returns them newest-first.
    async fn run_backward_collect(&mut self, limit: u64) -> Vec<LogRecord> {
        if limit == 0 {
            return Vec::new();
        }
        let (mut merged_rx, control) =
            spawn_merger(self.merger_config(FetchDirection::Backward), self.err.clone(), self.token.clone());

        let opts = self.fetch_options(FetchDirection::Backward, false);
        for source in self.initial.clone() {
            let key = source.key();
            let Some(stream) = self.open(&source, &opts, FetchDirection::Backward).await else {
                continue;
            };
            self.tail_cursors
                .lock()
                .expect("cursor lock")
                .push((key, stream.tail_cursor.clone()));
            if control.send(MergeControl::Add { source, stream }).await.is_err() {
                return Vec::new();
            }
        }
        let _ = control.send(MergeControl::Finish).await;

        let mut block = Vec::with_capacity(limit as usize);
        while (block.len() as u64) < limit {
            match merged_rx.recv().await {
                Some(record) => block.push(record),
                None => break,
            }
        }
        block
    }

    /// Opens one endpoint fetch, applying the failure policy: auth errors
    /// are terminal for the stream, anything else only costs the endpoint.
    async fn open(
        &self,
        source: &LogSource,
        opts: &FetchOptions,
        direction: FetchDirection,
    ) -> Option<RecordStream> {
        let result = match direction {
            FetchDirection::Forward => self.fetcher.stream_forward(source, opts.clone()).await,
            FetchDirection::Backward => self.fetcher.stream_backward(source, opts.clone()).await,
        };
        match result {
            Ok(stream) => Some(stream),
            Err(e) if e.is_stream_terminal() => {
                warn!(source = %source, error = %e, "fetch open failed; terminating stream");
                self.err.set(e);
                self.token.cancel();
                None
            }
            Err(e) => {
                warn!(source = %source, error = %e, "fetch open failed; dropping endpoint");
                None
            }
        }
    }
}
