//! Stream merger: interleaves per-endpoint record channels into one channel
//! with a total timestamp order, holding at most one pending record per
//! endpoint and never emitting past a live endpoint that has not produced.

use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use metrics::{counter, gauge};
use regex::Regex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kubetail_core::{FetchDirection, LogRecord, LogSource, SourceKey};
use kubetail_fetch::{CancelHandle, ErrorSlot, RecordStream};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(2);
const CONTROL_CAP: usize = 64;

/// Endpoint churn and lifecycle signals into a running merger.
pub enum MergeControl {
    Add { source: LogSource, stream: RecordStream },
    /// Cancels the endpoint's fetcher; its channel still drains to close.
    Remove { key: SourceKey },
    /// No further adds; close the output once everything drains.
    Finish,
}

pub struct MergerConfig {
    pub direction: FetchDirection,
    /// Compiled client-side grep; `None` when filtering runs server-side.
    pub grep: Option<Regex>,
    pub idle_timeout: Duration,
    pub out_cap: usize,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            direction: FetchDirection::Forward,
            grep: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            out_cap: 64,
        }
    }
}

/// Spawns the merger task. The output channel closes at end of window (after
/// `Finish`) or on cancellation; stream-terminal endpoint errors land in
/// `stream_err` and cancel `token`.
pub fn spawn_merger(
    config: MergerConfig,
    stream_err: ErrorSlot,
    token: CancellationToken,
) -> (mpsc::Receiver<LogRecord>, mpsc::Sender<MergeControl>) {
    let (out_tx, out_rx) = mpsc::channel(config.out_cap);
    let (control_tx, control_rx) = mpsc::channel(CONTROL_CAP);
    tokio::spawn(run_merger(config, control_rx, out_tx, stream_err, token));
    (out_rx, control_tx)
}

struct Endpoint {
    source: LogSource,
    rx: Option<mpsc::Receiver<LogRecord>>,
    pending: Option<LogRecord>,
    cancel: Option<CancelHandle>,
    error: ErrorSlot,
    /// Set while a recv future is in flight; doubles as the idle clock.
    armed_at: Option<Instant>,
    stale: bool,
    closed: bool,
    removing: bool,
}

type RecvDone = (usize, Option<LogRecord>, mpsc::Receiver<LogRecord>);

async fn run_merger(
    config: MergerConfig,
    mut control_rx: mpsc::Receiver<MergeControl>,
    out_tx: mpsc::Sender<LogRecord>,
    stream_err: ErrorSlot,
    token: CancellationToken,
) {
    let mut endpoints: Vec<Option<Endpoint>> = Vec::new();
    let mut index: HashMap<SourceKey, usize> = HashMap::new();
    let mut inflight: FuturesUnordered<BoxFuture<'static, RecvDone>> = FuturesUnordered::new();
    let mut finished = false;

    'merge: loop {
        // Arm every open endpoint that has neither a pending record nor a
        // recv in flight.
        for (idx, slot) in endpoints.iter_mut().enumerate() {
            let Some(ep) = slot else { continue };
            if ep.closed || ep.pending.is_some() || ep.armed_at.is_some() {
                continue;
            }
            if let Some(mut rx) = ep.rx.take() {
                ep.armed_at = Some(Instant::now());
                inflight.push(async move { (idx, rx.recv().await, rx) }.boxed());
            }
        }

        // Drop endpoints that closed and fully drained.
        for slot in endpoints.iter_mut() {
            if matches!(slot, Some(ep) if ep.closed && ep.pending.is_none()) {
                *slot = None;
            }
        }
        let open = endpoints.iter().flatten().count();
        gauge!("merge_endpoints", open as f64);
        if finished && open == 0 {
            debug!("merger drained");
            break;
        }

        // A record may be emitted only when no live endpoint is still owed a
        // read: an endpoint without a pending record blocks emission unless
        // it is closed, stale or being removed.
        let blocked = endpoints.iter().flatten().any(|ep| {
            ep.pending.is_none() && !ep.closed && !ep.stale && !ep.removing
        });
        if !blocked {
            let best = endpoints
                .iter()
                .enumerate()
                .filter_map(|(i, slot)| {
                    slot.as_ref().and_then(|ep| ep.pending.as_ref().map(|r| (i, r)))
                })
                .reduce(|a, b| {
                    let keep_a = match config.direction {
                        FetchDirection::Forward => a.1.cmp_forward(b.1).is_le(),
                        FetchDirection::Backward => a.1.cmp_forward(b.1).is_ge(),
                    };
                    if keep_a { a } else { b }
                })
                .map(|(i, _)| i);
            if let Some(idx) = best {
                let record = endpoints[idx]
                    .as_mut()
                    .and_then(|ep| ep.pending.take())
                    .expect("picked endpoint has a pending record");
                tokio::select! {
                    _ = token.cancelled() => break 'merge,
                    sent = out_tx.send(record) => {
                        if sent.is_err() {
                            debug!("merger output dropped by consumer");
                            break 'merge;
                        }
                        counter!("merge_records_total", 1);
                    }
                }
                continue;
            }
        }

        // Nothing emittable: wait for a record, a control event, or the
        // earliest stale deadline.
        let stale_deadline = endpoints
            .iter()
            .flatten()
            .filter(|ep| !ep.closed && !ep.stale && ep.pending.is_none())
            .filter_map(|ep| ep.armed_at)
            .map(|t| t + config.idle_timeout)
            .min();

        tokio::select! {
            _ = token.cancelled() => break 'merge,
            control = control_rx.recv(), if !finished => match control {
                Some(MergeControl::Add { source, stream }) => {
                    let key = source.key();
                    debug!(source = %source, "merge endpoint added");
                    let ep = Endpoint {
                        source,
                        rx: Some(stream.rx),
                        pending: None,
                        cancel: Some(stream.cancel),
                        error: stream.error,
                        armed_at: None,
                        stale: false,
                        closed: false,
                        removing: false,
                    };
                    let idx = endpoints.iter().position(Option::is_none).unwrap_or(endpoints.len());
                    if idx == endpoints.len() {
                        endpoints.push(Some(ep));
                    } else {
                        endpoints[idx] = Some(ep);
                    }
                    index.insert(key, idx);
                }
                Some(MergeControl::Remove { key }) => {
                    if let Some(idx) = index.remove(&key) {
                        if let Some(ep) = endpoints[idx].as_mut() {
                            debug!(source = %ep.source, "merge endpoint removing");
                            ep.removing = true;
                            if let Some(cancel) = ep.cancel.take() {
                                cancel.cancel();
                            }
                        }
                    }
                }
                Some(MergeControl::Finish) | None => {
                    finished = true;
                }
            },
            Some((idx, received, rx)) = inflight.next(), if !inflight.is_empty() => {
                let Some(ep) = endpoints[idx].as_mut() else { continue };
                ep.armed_at = None;
                match received {
                    Some(record) => {
                        ep.stale = false;
                        ep.rx = Some(rx);
                        let admitted = config
                            .grep
                            .as_ref()
                            .map(|re| re.is_match(&record.message))
                            .unwrap_or(true);
                        if admitted {
                            ep.pending = Some(record);
                        } else {
                            // Rejected records still reset the idle clock;
                            // re-arming happens at the top of the loop.
                            counter!("merge_grep_rejected_total", 1);
                        }
                    }
                    None => {
                        ep.closed = true;
                        if let Some(e) = ep.error.get() {
                            if e.is_stream_terminal() {
                                warn!(source = %ep.source, error = %e, "endpoint error terminates stream");
                                stream_err.set(e);
                                token.cancel();
                            } else {
                                warn!(source = %ep.source, error = %e, "endpoint terminated");
                            }
                        } else {
                            debug!(source = %ep.source, "endpoint drained");
                        }
                    }
                }
            },
            _ = sleep_until_opt(stale_deadline), if stale_deadline.is_some() => {
                let now = Instant::now();
                for ep in endpoints.iter_mut().flatten() {
                    let overdue = ep.armed_at
                        .map(|t| now >= t + config.idle_timeout)
                        .unwrap_or(false);
                    if overdue && ep.pending.is_none() && !ep.closed && !ep.stale {
                        debug!(source = %ep.source, "endpoint declared stale");
                        ep.stale = true;
                    }
                }
            },
        }
    }

    // Shutdown: cancel every upstream; receivers held by in-flight futures
    // drop with them.
    for ep in endpoints.iter_mut().flatten() {
        if let Some(cancel) = ep.cancel.take() {
            cancel.cancel();
        }
    }
    debug!("merger stopped");
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(t) => tokio::time::sleep_until(t).await,
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use kubetail_fetch::CursorSlot;
    use kubetail_core::SourceMeta;

    fn source(pod: &str) -> LogSource {
        LogSource {
            namespace: "default".into(),
            pod_name: pod.into(),
            container_name: "main".into(),
            container_id: format!("containerd://{pod}"),
            meta: SourceMeta::default(),
        }
    }

    fn ts(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + chrono::Duration::milliseconds(millis)
    }

    fn record(pod: &str, millis: i64, message: &str) -> LogRecord {
        LogRecord {
            timestamp: ts(millis),
            message: message.into(),
            source: source(pod),
            approximate: false,
        }
    }

    /// A RecordStream fed from a live sender; drop the sender to close it.
    fn open_stream(cap: usize) -> (RecordStream, mpsc::Sender<LogRecord>) {
        let (tx, rx) = mpsc::channel(cap);
        let (cancel, _cancel_rx) = CancelHandle::new();
        (
            RecordStream::new(rx, cancel, ErrorSlot::default(), CursorSlot::default()),
            tx,
        )
    }

    fn closed_stream(records: Vec<LogRecord>) -> RecordStream {
        let (stream, tx) = open_stream(records.len().max(1));
        for r in records {
            tx.try_send(r).expect("stream fixture overflow");
        }
        stream
    }

    async fn collect(mut rx: mpsc::Receiver<LogRecord>) -> Vec<LogRecord> {
        let mut out = Vec::new();
        while let Some(r) = rx.recv().await {
            out.push(r);
        }
        out
    }

    #[tokio::test]
    async fn merges_two_endpoints_in_timestamp_order() {
        let (rx, control) = spawn_merger(
            MergerConfig::default(),
            ErrorSlot::default(),
            CancellationToken::new(),
        );
        let a = closed_stream(vec![record("a", 0, "a0"), record("a", 1000, "a1"), record("a", 2000, "a2")]);
        let b = closed_stream(vec![record("b", 500, "b0"), record("b", 1500, "b1")]);
        control.send(MergeControl::Add { source: source("a"), stream: a }).await.unwrap();
        control.send(MergeControl::Add { source: source("b"), stream: b }).await.unwrap();
        control.send(MergeControl::Finish).await.unwrap();

        let out = collect(rx).await;
        let messages: Vec<&str> = out.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["a0", "b0", "a1", "b1", "a2"]);
        for pair in out.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[tokio::test]
    async fn backward_direction_emits_newest_first() {
        let config = MergerConfig { direction: FetchDirection::Backward, ..Default::default() };
        let (rx, control) = spawn_merger(config, ErrorSlot::default(), CancellationToken::new());
        let a = closed_stream(vec![record("a", 3000, "a3"), record("a", 1000, "a1")]);
        let b = closed_stream(vec![record("b", 2000, "b2"), record("b", 0, "b0")]);
        control.send(MergeControl::Add { source: source("a"), stream: a }).await.unwrap();
        control.send(MergeControl::Add { source: source("b"), stream: b }).await.unwrap();
        control.send(MergeControl::Finish).await.unwrap();

        let out = collect(rx).await;
        let messages: Vec<&str> = out.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["a3", "b2", "a1", "b0"]);
    }

    #[tokio::test]
    async fn no_records_lost_and_no_duplicates() {
        let (rx, control) = spawn_merger(
            MergerConfig::default(),
            ErrorSlot::default(),
            CancellationToken::new(),
        );
        let mut expected = Vec::new();
        for pod in ["a", "b", "c"] {
            let records: Vec<LogRecord> =
                (0..20).map(|i| record(pod, i * 100, &format!("{pod}{i}"))).collect();
            expected.extend(records.iter().map(|r| r.message.clone()));
            control
                .send(MergeControl::Add { source: source(pod), stream: closed_stream(records) })
                .await
                .unwrap();
        }
        control.send(MergeControl::Finish).await.unwrap();

        let out = collect(rx).await;
        assert_eq!(out.len(), expected.len());
        let mut got: Vec<String> = out.iter().map(|r| r.message.clone()).collect();
        got.sort();
        expected.sort();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn grep_filters_client_side() {
        let config = MergerConfig {
            grep: Some(Regex::new("ERROR").unwrap()),
            ..Default::default()
        };
        let (rx, control) = spawn_merger(config, ErrorSlot::default(), CancellationToken::new());
        let a = closed_stream(vec![
            record("a", 0, "INFO fine"),
            record("a", 100, "ERROR broken"),
            record("a", 200, "WARN meh"),
            record("a", 300, "ERROR again"),
        ]);
        control.send(MergeControl::Add { source: source("a"), stream: a }).await.unwrap();
        control.send(MergeControl::Finish).await.unwrap();

        let out = collect(rx).await;
        let messages: Vec<&str> = out.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["ERROR broken", "ERROR again"]);
    }

    #[tokio::test]
    async fn holds_emission_until_silent_endpoint_produces() {
        let config = MergerConfig { idle_timeout: Duration::from_secs(5), ..Default::default() };
        let (mut rx, control) = spawn_merger(config, ErrorSlot::default(), CancellationToken::new());
        let a = closed_stream(vec![record("a", 10_000, "late")]);
        let (b, b_tx) = open_stream(4);
        control.send(MergeControl::Add { source: source("a"), stream: a }).await.unwrap();
        control.send(MergeControl::Add { source: source("b"), stream: b }).await.unwrap();
        control.send(MergeControl::Finish).await.unwrap();

        // The silent endpoint b blocks a's record.
        let early = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(early.is_err(), "emitted past a live, silent endpoint");

        b_tx.send(record("b", 1000, "early")).await.unwrap();
        drop(b_tx);
        let out = collect(rx).await;
        let messages: Vec<&str> = out.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["early", "late"]);
    }

    #[tokio::test]
    async fn stale_endpoint_stops_blocking() {
        let config = MergerConfig { idle_timeout: Duration::from_millis(100), ..Default::default() };
        let (mut rx, control) = spawn_merger(config, ErrorSlot::default(), CancellationToken::new());
        let a = closed_stream(vec![record("a", 0, "a0")]);
        let (b, _b_tx) = open_stream(4);
        control.send(MergeControl::Add { source: source("a"), stream: a }).await.unwrap();
        control.send(MergeControl::Add { source: source("b"), stream: b }).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("stale endpoint kept blocking")
            .expect("record");
        assert_eq!(got.message, "a0");
    }

    #[tokio::test]
    async fn terminal_endpoint_error_cancels_stream() {
        let stream_err = ErrorSlot::default();
        let token = CancellationToken::new();
        let (rx, control) = spawn_merger(MergerConfig::default(), stream_err.clone(), token.clone());

        let (tx, stream_rx) = mpsc::channel(1);
        let (cancel, _cancel_rx) = CancelHandle::new();
        let ep_err = ErrorSlot::default();
        ep_err.set(kubetail_core::Error::Forbidden("token rejected".into()));
        let stream = RecordStream::new(stream_rx, cancel, ep_err, CursorSlot::default());
        drop(tx); // channel closes immediately with the error set
        control.send(MergeControl::Add { source: source("a"), stream }).await.unwrap();

        let out = collect(rx).await;
        assert!(out.is_empty());
        assert!(matches!(stream_err.get(), Some(kubetail_core::Error::Forbidden(_))));
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancellation_closes_output() {
        let token = CancellationToken::new();
        let (rx, control) =
            spawn_merger(MergerConfig::default(), ErrorSlot::default(), token.clone());
        let (a, _a_tx) = open_stream(4);
        control.send(MergeControl::Add { source: source("a"), stream: a }).await.unwrap();
        token.cancel();
        let out = collect(rx).await;
        assert!(out.is_empty());
    }
}
