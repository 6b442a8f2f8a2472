//! GraphQL schema: the log paging queries, the follow subscription and the
//! health watches, all thin shims over the streaming engine.

use std::sync::Arc;

use async_graphql::{Context, Enum, Object, Schema, SimpleObject, Subscription};
use chrono::{DateTime, Duration, Utc};
use futures::Stream;
use tracing::debug;

use kubetail_core::cursor::{decode_head_cursor, decode_tail_cursor, encode_head_cursor, encode_tail_cursor};
use kubetail_core::timearg::parse_time_arg;
use kubetail_core::{NameSelector, NamespaceSelector, SourceExpr, StreamMode, WorkloadKind};
use kube::ResourceExt;
use kubetail_kubehub::{list_pods_multi, ConnectionManager};
use kubetail_stream::{LogStream, LogStreamOptions};

pub type KubetailSchema = Schema<QueryRoot, async_graphql::EmptyMutation, SubscriptionRoot>;

const DEFAULT_PAGE_SIZE: i32 = 100;
const HEALTH_PERIOD: std::time::Duration = std::time::Duration::from_secs(5);
const HEALTH_PROBE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3);

/// Shared state handed to every resolver.
pub struct ServerState {
    pub cm: Arc<ConnectionManager>,
    /// Enables the mock-cluster hooks; never set in production.
    pub test_hooks: bool,
}

pub fn build_schema(state: ServerState) -> KubetailSchema {
    Schema::build(QueryRoot, async_graphql::EmptyMutation, SubscriptionRoot)
        .data(state)
        .finish()
}

#[derive(Debug, Clone, SimpleObject)]
pub struct LogRecordGql {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Default, SimpleObject)]
pub struct PageInfoGql {
    pub has_next_page: bool,
    pub has_previous_page: bool,
    pub start_cursor: Option<String>,
    pub end_cursor: Option<String>,
}

#[derive(Debug, Clone, SimpleObject)]
pub struct PodLogQueryResponse {
    pub page_info: PageInfoGql,
    pub results: Vec<LogRecordGql>,
}

#[derive(Debug, Clone, SimpleObject)]
pub struct LogRecordsFetchResponse {
    pub records: Vec<LogRecordGql>,
    /// Which fetcher implementation served the request.
    pub fetcher: Option<String>,
}

#[derive(Debug, Clone, SimpleObject)]
pub struct PodItemGql {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, SimpleObject)]
pub struct PodsListResponse {
    pub items: Vec<PodItemGql>,
    pub remaining_item_count: i64,
    #[graphql(name = "continue")]
    pub continue_token: Option<String>,
}

#[derive(Debug, Clone, SimpleObject)]
pub struct HealthCheckResponse {
    pub status: String,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Enum)]
pub enum LogRecordsMode {
    Head,
    Tail,
}

fn pod_expr(
    namespace: &str,
    name: &str,
    container: Option<&str>,
) -> async_graphql::Result<SourceExpr> {
    let container = match container {
        Some("*") | None => None,
        Some(c) => Some(NameSelector::parse(c)?),
    };
    Ok(SourceExpr {
        namespace: Some(NamespaceSelector::Exact(namespace.to_string())),
        kind: WorkloadKind::Pod,
        name: NameSelector::parse(name)?,
        container,
    })
}

async fn drain(stream: &mut LogStream) -> async_graphql::Result<Vec<kubetail_core::LogRecord>> {
    let mut rx = stream.records()?;
    let mut out = Vec::new();
    while let Some(record) = rx.recv().await {
        out.push(record);
    }
    if let Some(e) = stream.err() {
        return Err(e.into());
    }
    Ok(out)
}

pub struct QueryRoot;

#[Object]
impl QueryRoot {
    /// Forward page of one container's log, oldest-first from `since` or the
    /// `after` cursor.
    async fn pod_log_head(
        &self,
        ctx: &Context<'_>,
        namespace: String,
        name: String,
        container: Option<String>,
        after: Option<String>,
        since: Option<String>,
        first: Option<i32>,
    ) -> async_graphql::Result<PodLogQueryResponse> {
        let state = ctx.data::<ServerState>()?;
        let limit = first.unwrap_or(DEFAULT_PAGE_SIZE).max(1) as u64;
        let mut since_ts = match since.as_deref() {
            Some(s) => Some(parse_time_arg(s, Utc::now())?),
            None => None,
        };
        if let Some(after) = after.as_deref() {
            since_ts = Some(decode_head_cursor(after)? + Duration::nanoseconds(1));
        }

        // One sentinel record past the page decides hasNextPage exactly; it
        // is trimmed before the response.
        let opts = LogStreamOptions {
            mode: StreamMode::Head(limit + 1),
            since: since_ts,
            test_hooks: state.test_hooks,
            ..Default::default()
        };
        let expr = pod_expr(&namespace, &name, container.as_deref())?;
        let mut stream = LogStream::new(Arc::clone(&state.cm), vec![expr], opts);
        stream.start().await?;
        let mut records = drain(&mut stream).await?;

        let has_next_page = records.len() as u64 > limit;
        records.truncate(limit as usize);
        let end_cursor = records.last().map(|r| encode_head_cursor(r.timestamp));
        let page_info = PageInfoGql { has_next_page, end_cursor, ..Default::default() };
        debug!(count = records.len(), "podLogHead served");
        Ok(PodLogQueryResponse { page_info, results: to_gql(records) })
    }

    /// Backward page of one container's log: the newest `last` records
    /// before the `before` cursor, oldest-first within the block.
    async fn pod_log_tail(
        &self,
        ctx: &Context<'_>,
        namespace: String,
        name: String,
        container: Option<String>,
        before: Option<String>,
        last: Option<i32>,
    ) -> async_graphql::Result<PodLogQueryResponse> {
        let state = ctx.data::<ServerState>()?;
        let limit = last.unwrap_or(DEFAULT_PAGE_SIZE).max(1) as u64;
        let tail_cursor = match before.as_deref() {
            Some(token) => Some(decode_tail_cursor(token)?),
            None => None,
        };

        let opts = LogStreamOptions {
            mode: StreamMode::Tail(limit),
            tail_cursor,
            test_hooks: state.test_hooks,
            ..Default::default()
        };
        let expr = pod_expr(&namespace, &name, container.as_deref())?;
        let mut stream = LogStream::new(Arc::clone(&state.cm), vec![expr], opts);
        stream.start().await?;
        let records = drain(&mut stream).await?;

        let cursor = stream.tail_cursor();
        let page_info = PageInfoGql {
            // More history exists while the replay window has not reached
            // the first record of the log.
            has_previous_page: cursor
                .as_ref()
                .map(|c| c.window_time >= c.first_ts)
                .unwrap_or(false),
            start_cursor: match cursor {
                Some(c) => Some(encode_tail_cursor(&c)?),
                None => None,
            },
            ..Default::default()
        };
        debug!(count = records.len(), "podLogTail served");
        Ok(PodLogQueryResponse { page_info, results: to_gql(records) })
    }

    /// Multi-source fetch used by the cluster aggregator's clients.
    async fn log_records_fetch(
        &self,
        ctx: &Context<'_>,
        sources: Vec<String>,
        mode: LogRecordsMode,
        grep: Option<String>,
        since: Option<String>,
        until: Option<String>,
        limit: Option<i32>,
    ) -> async_graphql::Result<LogRecordsFetchResponse> {
        let state = ctx.data::<ServerState>()?;
        let exprs = SourceExpr::parse_all(&sources)?;
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).max(1) as u64;
        let opts = LogStreamOptions {
            mode: match mode {
                LogRecordsMode::Head => StreamMode::Head(limit),
                LogRecordsMode::Tail => StreamMode::Tail(limit),
            },
            grep,
            since: match since.as_deref() {
                Some(s) => Some(parse_time_arg(s, Utc::now())?),
                None => None,
            },
            until: match until.as_deref() {
                Some(s) => Some(parse_time_arg(s, Utc::now())?),
                None => None,
            },
            test_hooks: state.test_hooks,
            ..Default::default()
        };
        let mut stream = LogStream::new(Arc::clone(&state.cm), exprs, opts);
        stream.start().await?;
        let fetcher = stream.fetcher().map(|t| t.as_str().to_string());
        let records = drain(&mut stream).await?;
        Ok(LogRecordsFetchResponse { records: to_gql(records), fetcher })
    }

    /// Paged pod listing; `namespace: "*"` fans out over the allowed
    /// namespaces and merges the pages by name.
    async fn pods_list(
        &self,
        ctx: &Context<'_>,
        namespace: String,
        limit: Option<i32>,
        #[graphql(name = "continue")] continue_token: Option<String>,
    ) -> async_graphql::Result<PodsListResponse> {
        let state = ctx.data::<ServerState>()?;
        let client = state.cm.client(None).await?;
        let namespaces = if namespace == "*" {
            let allowed = state.cm.allowed_namespaces();
            if allowed.is_empty() {
                all_namespaces(&client).await?
            } else {
                allowed.to_vec()
            }
        } else {
            vec![namespace]
        };
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).max(1) as usize;
        let merged =
            list_pods_multi(&client, &namespaces, None, limit, continue_token.as_deref()).await?;
        Ok(PodsListResponse {
            items: merged
                .items
                .iter()
                .map(|p| PodItemGql {
                    namespace: p.namespace().unwrap_or_default(),
                    name: p.name_any(),
                })
                .collect(),
            remaining_item_count: merged.remaining_item_count,
            continue_token: merged.continue_token,
        })
    }

    /// Informational: the chart version this instance was deployed from.
    async fn chart_version(&self) -> Option<String> {
        std::env::var("KUBETAIL_CHART_VERSION").ok()
    }
}

async fn all_namespaces(client: &kube::Client) -> async_graphql::Result<Vec<String>> {
    use k8s_openapi::api::core::v1::Namespace;
    let api: kube::Api<Namespace> = kube::Api::all(client.clone());
    let list = api.list(&kube::api::ListParams::default()).await?;
    Ok(list.items.iter().map(|n| n.name_any()).collect())
}

pub struct SubscriptionRoot;

#[Subscription]
impl SubscriptionRoot {
    /// Live follow of one container: the historical window from `since` or
    /// `after`, then new records as they arrive.
    async fn pod_log_follow(
        &self,
        ctx: &Context<'_>,
        namespace: String,
        name: String,
        container: Option<String>,
        after: Option<String>,
        since: Option<String>,
    ) -> async_graphql::Result<impl Stream<Item = LogRecordGql>> {
        let state = ctx.data::<ServerState>()?;
        let mut since_ts = match since.as_deref() {
            Some(s) => Some(parse_time_arg(s, Utc::now())?),
            None => None,
        };
        if let Some(after) = after.as_deref() {
            since_ts = Some(decode_head_cursor(after)? + Duration::nanoseconds(1));
        }

        let opts = LogStreamOptions {
            mode: if since_ts.is_some() { StreamMode::All } else { StreamMode::Tail(0) },
            follow: true,
            since: since_ts,
            test_hooks: state.test_hooks,
            ..Default::default()
        };
        let expr = pod_expr(&namespace, &name, container.as_deref())?;
        let mut stream = LogStream::new(Arc::clone(&state.cm), vec![expr], opts);
        stream.start().await?;
        let rx = stream.records()?;
        // The stream itself rides along so its tasks are cancelled when the
        // subscription drops.
        Ok(futures::stream::unfold((rx, stream), |(mut rx, stream)| async move {
            rx.recv().await.map(|record| {
                (
                    LogRecordGql { timestamp: record.timestamp, message: record.message },
                    (rx, stream),
                )
            })
        }))
    }

    /// Periodic liveness pings.
    async fn livez_watch(&self) -> impl Stream<Item = HealthCheckResponse> {
        health_stream(|| async { ("ok".to_string(), None) })
    }

    /// Periodic readiness pings; readiness means a usable cluster client.
    async fn readyz_watch(
        &self,
        ctx: &Context<'_>,
    ) -> async_graphql::Result<impl Stream<Item = HealthCheckResponse>> {
        let cm = Arc::clone(&ctx.data::<ServerState>()?.cm);
        Ok(health_stream(move || {
            let cm = Arc::clone(&cm);
            async move {
                match tokio::time::timeout(HEALTH_PROBE_TIMEOUT, cm.client(None)).await {
                    Ok(Ok(_)) => ("ok".to_string(), None),
                    Ok(Err(e)) => ("unavailable".to_string(), Some(e.to_string())),
                    Err(_) => ("unavailable".to_string(), Some("probe timed out".to_string())),
                }
            }
        }))
    }
}

fn health_stream<F, Fut>(check: F) -> impl Stream<Item = HealthCheckResponse>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = (String, Option<String>)> + Send,
{
    let interval = tokio::time::interval(HEALTH_PERIOD);
    futures::stream::unfold((interval, check), |(mut interval, check)| async move {
        interval.tick().await;
        let (status, message) = check().await;
        let ping = HealthCheckResponse { status, message, timestamp: Utc::now() };
        Some((ping, (interval, check)))
    })
}

fn to_gql(records: Vec<kubetail_core::LogRecord>) -> Vec<LogRecordGql> {
    records
        .into_iter()
        .map(|r| LogRecordGql { timestamp: r.timestamp, message: r.message })
        .collect()
}
