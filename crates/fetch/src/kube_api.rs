//! Fallback fetcher over the core pod-logs endpoint. Always available, no
//! server-side grep; backward windows are synthesized with the back-scan
//! strategy since the native API cannot start a backward read at an
//! arbitrary timestamp.

use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{api::LogParams, Api, Client};
use metrics::counter;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use kubetail_core::cursor::TailCursor;
use kubetail_core::{
    Error, FetchCapabilities, FetchOptions, LogRecord, LogSource, Result,
};

use crate::line::parse_line;
use crate::{queue_cap, CancelHandle, CursorSlot, ErrorSlot, LogFetcher, RecordStream};

const DEFAULT_TAIL_BATCH: i64 = 100;
const FIRST_TS_PROBE_BYTES: i64 = 8192;

pub struct KubeApiFetcher {
    client: Client,
    backscan_growth: f64,
    queue_cap: usize,
}

impl KubeApiFetcher {
    pub fn new(client: Client) -> Self {
        Self { client, backscan_growth: 1.5, queue_cap: queue_cap() }
    }

    /// Batch-growth factor for the back-scan loop. Values below 1.1 would
    /// stall the scan and are clamped.
    pub fn with_backscan_growth(mut self, growth: f64) -> Self {
        self.backscan_growth = growth.max(1.1);
        self
    }

    fn api_for(&self, source: &LogSource) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &source.namespace)
    }
}

#[async_trait::async_trait]
impl LogFetcher for KubeApiFetcher {
    fn capabilities(&self) -> FetchCapabilities {
        FetchCapabilities { server_side_grep: false, backward: true, follow: true }
    }

    async fn stream_forward(&self, source: &LogSource, opts: FetchOptions) -> Result<RecordStream> {
        let api = self.api_for(source);
        let mut lp = LogParams {
            container: Some(source.container_name.clone()),
            follow: opts.follow,
            timestamps: true,
            ..Default::default()
        };
        if let Some(start) = opts.start_time {
            // Seconds granularity over-fetches; the exact bound is applied
            // per record below.
            let secs = (Utc::now() - start).num_seconds();
            if secs > 0 {
                lp.since_seconds = Some(secs + 1);
            }
        }

        let (tx, rx) = mpsc::channel::<LogRecord>(self.queue_cap);
        let (cancel, cancel_rx) = CancelHandle::new();
        let error = ErrorSlot::default();
        let task_error = error.clone();
        let source = source.clone();
        tokio::spawn(async move {
            info!(source = %source, follow = lp.follow, "kube log stream starting");
            let reader = match api.log_stream(&source.pod_name, &lp).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(source = %source, error = %e, "log_stream failed to open");
                    task_error.set(Error::transient(format!("opening log stream: {e}")));
                    return;
                }
            };
            pump_lines(reader, tx, cancel_rx, &source, &opts, task_error).await;
        });
        Ok(RecordStream::new(rx, cancel, error, CursorSlot::default()))
    }

    async fn stream_backward(
        &self,
        source: &LogSource,
        opts: FetchOptions,
    ) -> Result<RecordStream> {
        let api = self.api_for(source);
        let (tx, rx) = mpsc::channel::<LogRecord>(self.queue_cap);
        let (cancel, cancel_rx) = CancelHandle::new();
        let error = ErrorSlot::default();
        let cursor = CursorSlot::default();
        let growth = self.backscan_growth;
        let task_error = error.clone();
        let task_cursor = cursor.clone();
        let source = source.clone();
        tokio::spawn(async move {
            if let Err(e) =
                run_backscan(api, &source, &opts, growth, tx, cancel_rx, task_cursor).await
            {
                warn!(source = %source, error = %e, "back-scan failed");
                task_error.set(e);
            }
        });
        Ok(RecordStream::new(rx, cancel, error, cursor))
    }
}

/// Byte stream → timestamped records, bounds applied per record. Adopted
/// from the line pump used for every streaming read in this workspace.
async fn pump_lines<R>(
    reader: R,
    tx: mpsc::Sender<LogRecord>,
    mut cancel_rx: oneshot::Receiver<()>,
    source: &LogSource,
    opts: &FetchOptions,
    error: ErrorSlot,
) where
    R: futures::AsyncRead + Send,
{
    use tokio_util::compat::FuturesAsyncReadCompatExt;
    use tokio_util::io::ReaderStream;

    let stream = ReaderStream::new(reader.compat()).fuse();
    futures::pin_mut!(stream);

    let mut buf = bytes::BytesMut::new();
    let mut sent: u64 = 0;
    'outer: loop {
        tokio::select! {
            _ = &mut cancel_rx => {
                debug!(source = %source, "log pump cancelled");
                break;
            }
            next = stream.next() => {
                match next {
                    Some(Ok(chunk)) => {
                        buf.extend_from_slice(&chunk);
                        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                            let line = buf.split_to(pos);
                            let _ = buf.split_to(1); // drop '\n'
                            let Ok(text) = std::str::from_utf8(&line) else { continue };
                            let Some(record) = parse_line(text, source, opts.test_hooks, Utc::now()) else { continue };
                            if matches!(opts.start_time, Some(start) if record.timestamp < start) {
                                continue;
                            }
                            if matches!(opts.stop_time, Some(stop) if record.timestamp > stop) {
                                break 'outer;
                            }
                            if tx.send(record).await.is_err() {
                                break 'outer;
                            }
                            counter!("fetch_records_total", 1, "transport" => "kube");
                            sent += 1;
                            if matches!(opts.limit, Some(limit) if sent >= limit) {
                                break 'outer;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(source = %source, error = %e, "log stream error");
                        error.set(Error::transient(format!("log stream: {e}")));
                        break;
                    }
                    None => break,
                }
            }
        }
    }
    // Trailing partial line, only meaningful on non-follow reads.
    if !buf.is_empty() {
        if let Ok(text) = std::str::from_utf8(&buf) {
            if let Some(record) = parse_line(text, source, opts.test_hooks, Utc::now()) {
                let in_bounds = !matches!(opts.start_time, Some(s) if record.timestamp < s)
                    && !matches!(opts.stop_time, Some(s) if record.timestamp > s);
                if in_bounds {
                    let _ = tx.send(record).await;
                }
            }
        }
    }
    debug!(source = %source, sent, "log pump ended");
}

/// Incrementally enlarges a native tail request until it satisfies a
/// time-bounded backward read, then emits the block newest-first.
async fn run_backscan(
    api: Api<Pod>,
    source: &LogSource,
    opts: &FetchOptions,
    growth: f64,
    tx: mpsc::Sender<LogRecord>,
    mut cancel_rx: oneshot::Receiver<()>,
    cursor_out: CursorSlot,
) -> Result<()> {
    let first_ts = match &opts.tail_cursor {
        Some(c) => Some(c.first_ts),
        None => read_first_ts(&api, source, opts.test_hooks).await?,
    };
    let Some(first_ts) = first_ts else {
        // Empty log: nothing to scan.
        return Ok(());
    };

    let fetch_tail = |tail_lines: i64| {
        let api = api.clone();
        let pod = source.pod_name.clone();
        let container = source.container_name.clone();
        async move {
            let lp = LogParams {
                container: Some(container),
                timestamps: true,
                tail_lines: Some(tail_lines),
                ..Default::default()
            };
            api.logs(&pod, &lp)
                .await
                .map_err(|e| Error::transient(format!("tail read: {e}")))
        }
    };
    let (block, cursor) = backscan_collect(fetch_tail, source, opts, growth, first_ts).await?;
    if let Some(cursor) = cursor {
        cursor_out.set(cursor);
    }
    for record in block.iter().rev() {
        tokio::select! {
            _ = &mut cancel_rx => {
                debug!(source = %source, "back-scan cancelled mid-emit");
                return Ok(());
            }
            sent = tx.send(record.clone()) => {
                if sent.is_err() {
                    return Ok(());
                }
                counter!("fetch_records_total", 1, "transport" => "kube");
            }
        }
    }
    info!(source = %source, emitted = block.len(), "back-scan complete");
    Ok(())
}

/// The scan loop itself, parameterized over the batch reader: keep the
/// records at or before the window, grow the tail request until the block is
/// full or the beginning is reached, and report the replay cursor for the
/// next backward page.
async fn backscan_collect<F, Fut>(
    mut fetch_tail: F,
    source: &LogSource,
    opts: &FetchOptions,
    growth: f64,
    first_ts: DateTime<Utc>,
) -> Result<(Vec<LogRecord>, Option<TailCursor>)>
where
    F: FnMut(i64) -> Fut,
    Fut: std::future::Future<Output = Result<String>>,
{
    let limit = opts.limit.unwrap_or(DEFAULT_TAIL_BATCH as u64) as usize;
    if limit == 0 {
        return Ok((Vec::new(), None));
    }
    let window_end = opts
        .tail_cursor
        .as_ref()
        .map(|c| c.window_time)
        .or(opts.stop_time)
        .unwrap_or_else(Utc::now);
    let mut tail_lines = opts
        .tail_cursor
        .as_ref()
        .map(|c| c.tail_lines)
        .unwrap_or_else(|| (limit as i64).max(DEFAULT_TAIL_BATCH));
    let mut window = window_end;
    // Ascending accumulation; each round prepends a strictly-older slice.
    let mut collected: Vec<LogRecord> = Vec::new();

    loop {
        let text = fetch_tail(tail_lines).await?;
        let parsed: Vec<LogRecord> = text
            .lines()
            .filter_map(|l| parse_line(l, source, opts.test_hooks, Utc::now()))
            .collect();
        let fetched = parsed.len();
        if fetched == 0 {
            break;
        }

        let oldest_fetched = parsed[0].timestamp;
        let mut kept: Vec<LogRecord> = parsed
            .into_iter()
            .filter(|r| {
                r.timestamp <= window && !matches!(opts.start_time, Some(s) if r.timestamp < s)
            })
            .collect();
        if !kept.is_empty() {
            kept.extend(std::mem::take(&mut collected));
            collected = kept;
        }

        if collected.len() >= limit {
            break;
        }
        // Beginning reached: the fetch covered the whole log, or the lower
        // bound cut the window off.
        let whole_log = (fetched as i64) < tail_lines || oldest_fetched <= first_ts;
        let below_start = matches!(opts.start_time, Some(s) if oldest_fetched <= s);
        if whole_log || below_start {
            break;
        }
        if let Some(oldest_kept) = collected.first() {
            window = oldest_kept.timestamp - Duration::nanoseconds(1);
        }
        let grown = (tail_lines as f64 * growth) as i64;
        tail_lines = grown.max(tail_lines + 1);
        debug!(source = %source, tail_lines, window = %window, have = collected.len(), "back-scan growing window");
    }

    // Final block: the newest `limit` of what was collected.
    let start = collected.len().saturating_sub(limit);
    let block = collected.split_off(start);
    let cursor = block.first().map(|oldest_kept| TailCursor {
        tail_lines,
        window_time: oldest_kept.timestamp - Duration::nanoseconds(1),
        first_ts,
    });
    Ok((block, cursor))
}

/// Earliest timestamp of the container log, from a short limited read.
async fn read_first_ts(
    api: &Api<Pod>,
    source: &LogSource,
    test_hooks: bool,
) -> Result<Option<DateTime<Utc>>> {
    let lp = LogParams {
        container: Some(source.container_name.clone()),
        timestamps: true,
        limit_bytes: Some(FIRST_TS_PROBE_BYTES),
        ..Default::default()
    };
    let text = api
        .logs(&source.pod_name, &lp)
        .await
        .map_err(|e| Error::transient(format!("first-timestamp probe: {e}")))?;
    Ok(text
        .lines()
        .filter_map(|l| parse_line(l, source, test_hooks, Utc::now()))
        .map(|r| r.timestamp)
        .next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use kubetail_core::SourceMeta;

    fn src() -> LogSource {
        LogSource {
            namespace: "default".into(),
            pod_name: "a".into(),
            container_name: "main".into(),
            container_id: "containerd://a".into(),
            meta: SourceMeta::default(),
        }
    }

    fn t0() -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    /// A synthetic log of `n` records at 1s intervals starting at `t0`.
    fn log_lines(n: i64) -> Vec<String> {
        (0..n)
            .map(|i| {
                let ts = t0() + Duration::seconds(i);
                format!("{} line-{i}", ts.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true))
            })
            .collect()
    }

    fn tail_of(lines: &[String], tail_lines: i64) -> String {
        let start = lines.len().saturating_sub(tail_lines as usize);
        lines[start..].join("\n")
    }

    #[tokio::test]
    async fn backscan_bounded_window() {
        // Seven records T..T+6s; the newest 3 at or before T+4s − 1ns are
        // T+1s, T+2s, T+3s, and the next page must reach further back.
        let lines = log_lines(7);
        let opts = FetchOptions {
            limit: Some(3),
            stop_time: Some(t0() + Duration::seconds(4) - Duration::nanoseconds(1)),
            ..Default::default()
        };
        let (block, cursor) = backscan_collect(
            |n| {
                let text = tail_of(&lines, n);
                async move { Ok(text) }
            },
            &src(),
            &opts,
            1.5,
            t0(),
        )
        .await
        .unwrap();
        let offsets: Vec<i64> =
            block.iter().map(|r| (r.timestamp - t0()).num_seconds()).collect();
        assert_eq!(offsets, vec![1, 2, 3]);
        let cursor = cursor.expect("cursor");
        assert!(cursor.tail_lines >= 4, "tail_lines {} too small", cursor.tail_lines);
        assert_eq!(cursor.first_ts, t0());
        assert_eq!(
            cursor.window_time,
            t0() + Duration::seconds(1) - Duration::nanoseconds(1)
        );
    }

    #[tokio::test]
    async fn backscan_grows_until_window_satisfied() {
        // 1000 records and a window ending far in the past force several
        // growth rounds; count the batch requests.
        let lines = log_lines(1000);
        let opts = FetchOptions {
            limit: Some(10),
            stop_time: Some(t0() + Duration::seconds(500)),
            ..Default::default()
        };
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls_in = calls.clone();
        let (block, cursor) = backscan_collect(
            move |n| {
                calls_in.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let text = tail_of(&lines, n);
                async move { Ok(text) }
            },
            &src(),
            &opts,
            1.5,
            t0(),
        )
        .await
        .unwrap();
        assert_eq!(block.len(), 10);
        let offsets: Vec<i64> =
            block.iter().map(|r| (r.timestamp - t0()).num_seconds()).collect();
        assert_eq!(offsets, (491..=500).collect::<Vec<i64>>());
        assert!(calls.load(std::sync::atomic::Ordering::SeqCst) > 1);
        assert!(cursor.is_some());
    }

    #[tokio::test]
    async fn backscan_stops_at_log_beginning() {
        let lines = log_lines(4);
        let opts = FetchOptions { limit: Some(10), ..Default::default() };
        let (block, cursor) = backscan_collect(
            |n| {
                let text = tail_of(&lines, n);
                async move { Ok(text) }
            },
            &src(),
            &opts,
            1.5,
            t0(),
        )
        .await
        .unwrap();
        assert_eq!(block.len(), 4);
        assert!(cursor.is_some());
    }

    #[tokio::test]
    async fn backscan_resumes_from_cursor_without_duplicates() {
        let lines = log_lines(100);
        let first = FetchOptions { limit: Some(10), ..Default::default() };
        let (page1, cursor1) = backscan_collect(
            |n| {
                let text = tail_of(&lines, n);
                async move { Ok(text) }
            },
            &src(),
            &first,
            1.5,
            t0(),
        )
        .await
        .unwrap();
        let second = FetchOptions {
            limit: Some(10),
            tail_cursor: cursor1,
            ..Default::default()
        };
        let (page2, _) = backscan_collect(
            |n| {
                let text = tail_of(&lines, n);
                async move { Ok(text) }
            },
            &src(),
            &second,
            1.5,
            t0(),
        )
        .await
        .unwrap();
        let o1: Vec<i64> = page1.iter().map(|r| (r.timestamp - t0()).num_seconds()).collect();
        let o2: Vec<i64> = page2.iter().map(|r| (r.timestamp - t0()).num_seconds()).collect();
        assert_eq!(o1, (90..=99).collect::<Vec<i64>>());
        assert_eq!(o2, (80..=89).collect::<Vec<i64>>());
    }
}
