//! Mid-preference fetcher: the cluster-scoped aggregator reached through the
//! apiserver service proxy, speaking the aggregator's GraphQL query shape.
//! Grep runs server-side; follow does not traverse the proxy.

use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use kube::Client;
use metrics::counter;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use kubetail_core::timearg::parse_log_timestamp;
use kubetail_core::{Error, FetchCapabilities, FetchDirection, FetchOptions, LogRecord, LogSource, Result};

use crate::agent::find_service;
use crate::{queue_cap, CancelHandle, CursorSlot, ErrorSlot, LogFetcher, RecordStream};

const CLUSTER_API_SERVICE_NAME: &str = "kubetail-cluster-api";
/// Union of the historical candidate lists, tried in this order.
const TOKEN_ACCOUNTS: [&str; 3] = ["kubetail-cli", "kubetail-mcp", "default"];
const TOKEN_TTL_SECONDS: i64 = 3600;

const FETCH_QUERY: &str = "\
query LogRecordsFetch($sources: [String!]!, $mode: LogRecordsMode!, $grep: String, \
$since: String, $until: String, $limit: Int) {\
 logRecordsFetch(sources: $sources, mode: $mode, grep: $grep, since: $since, \
until: $until, limit: $limit) { records { timestamp message } } }";

pub struct ClusterApiFetcher {
    client: Client,
    service_namespace: String,
    service_port: i32,
    token: String,
    queue_cap: usize,
}

#[derive(Debug, Deserialize)]
struct FetchResponse {
    data: Option<FetchData>,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct FetchData {
    #[serde(rename = "logRecordsFetch")]
    log_records_fetch: FetchRecords,
}

#[derive(Debug, Deserialize)]
struct FetchRecords {
    records: Vec<WireRecord>,
}

#[derive(Debug, Deserialize)]
struct WireRecord {
    timestamp: String,
    message: String,
}

impl ClusterApiFetcher {
    /// Looks up the aggregator service and mints a service-account token for
    /// it. Any failure falls through to the next fetcher level.
    pub async fn discover(client: &Client, deadline: Duration) -> Result<Self> {
        let discovery = async {
            let (namespace, _, port) = find_service(client, CLUSTER_API_SERVICE_NAME).await?;
            let token = mint_token(client, &namespace).await?;
            Ok::<_, Error>((namespace, port, token))
        };
        let (service_namespace, service_port, token) = tokio::time::timeout(deadline, discovery)
            .await
            .map_err(|_| Error::transient("cluster API discovery timed out"))??;
        info!(namespace = %service_namespace, port = service_port, "cluster API fetcher ready");
        Ok(Self {
            client: client.clone(),
            service_namespace,
            service_port,
            token,
            queue_cap: queue_cap(),
        })
    }

    async fn fetch(
        &self,
        source: &LogSource,
        opts: &FetchOptions,
        mode: &str,
    ) -> Result<Vec<LogRecord>> {
        let variables = serde_json::json!({
            "sources": [format!("{}:{}/{}", source.namespace, source.pod_name, source.container_name)],
            "mode": mode,
            "grep": opts.grep,
            "since": opts.start_time.map(|t| t.to_rfc3339_opts(SecondsFormat::Nanos, true)),
            "until": opts.stop_time.map(|t| t.to_rfc3339_opts(SecondsFormat::Nanos, true)),
            "limit": opts.limit,
        });
        let body = serde_json::json!({ "query": FETCH_QUERY, "variables": variables });
        let uri = format!(
            "/api/v1/namespaces/{}/services/{}:{}/proxy/graphql",
            self.service_namespace, CLUSTER_API_SERVICE_NAME, self.service_port
        );
        let request = http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.token))
            .body(serde_json::to_vec(&body).map_err(|e| Error::fatal(format!("encoding query: {e}")))?)
            .map_err(|e| Error::fatal(format!("building proxy request: {e}")))?;

        let response: FetchResponse = self
            .client
            .request(request)
            .await
            .map_err(map_kube_error)?;
        if let Some(err) = response.errors.first() {
            return Err(Error::transient(format!("aggregator error: {err}")));
        }
        let wire = response
            .data
            .ok_or_else(|| Error::transient("aggregator returned no data"))?
            .log_records_fetch
            .records;
        let mut records: Vec<LogRecord> = wire
            .into_iter()
            .filter_map(|w| {
                let Some(timestamp) = parse_log_timestamp(&w.timestamp) else {
                    debug!(source = %source, "aggregator record without parseable timestamp");
                    return None;
                };
                Some(LogRecord {
                    timestamp,
                    message: w.message,
                    source: source.clone(),
                    approximate: false,
                })
            })
            .collect();
        if mode == "TAIL" {
            // The aggregator answers oldest-first; backward streams emit
            // newest-first.
            records.reverse();
        }
        Ok(records)
    }

    fn deliver(&self, records: Vec<LogRecord>) -> RecordStream {
        let (tx, rx) = mpsc::channel::<LogRecord>(self.queue_cap);
        let (cancel, mut cancel_rx) = CancelHandle::new();
        tokio::spawn(async move {
            for record in records {
                tokio::select! {
                    _ = &mut cancel_rx => break,
                    sent = tx.send(record) => {
                        if sent.is_err() {
                            break;
                        }
                        counter!("fetch_records_total", 1, "transport" => "cluster-api");
                    }
                }
            }
        });
        RecordStream::new(rx, cancel, ErrorSlot::default(), CursorSlot::default())
    }
}

#[async_trait::async_trait]
impl LogFetcher for ClusterApiFetcher {
    fn capabilities(&self) -> FetchCapabilities {
        FetchCapabilities { server_side_grep: true, backward: true, follow: false }
    }

    async fn stream_forward(&self, source: &LogSource, opts: FetchOptions) -> Result<RecordStream> {
        debug_assert_eq!(opts.direction, FetchDirection::Forward);
        let records = self.fetch(source, &opts, "HEAD").await?;
        Ok(self.deliver(records))
    }

    async fn stream_backward(
        &self,
        source: &LogSource,
        opts: FetchOptions,
    ) -> Result<RecordStream> {
        let mut opts = opts;
        if opts.stop_time.is_none() {
            opts.stop_time = Some(opts.tail_cursor.as_ref().map(|c| c.window_time).unwrap_or_else(Utc::now));
        }
        let records = self.fetch(source, &opts, "TAIL").await?;
        Ok(self.deliver(records))
    }
}

/// Mints a short-lived token via the TokenRequest subresource, trying the
/// candidate service accounts in order.
async fn mint_token(client: &Client, namespace: &str) -> Result<String> {
    let body = serde_json::json!({
        "apiVersion": "authentication.k8s.io/v1",
        "kind": "TokenRequest",
        "spec": { "expirationSeconds": TOKEN_TTL_SECONDS },
    });
    let payload = serde_json::to_vec(&body).map_err(|e| Error::fatal(format!("token request: {e}")))?;
    for account in TOKEN_ACCOUNTS {
        let uri = format!("/api/v1/namespaces/{namespace}/serviceaccounts/{account}/token");
        let request = http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(payload.clone())
            .map_err(|e| Error::fatal(format!("building token request: {e}")))?;
        match client.request::<serde_json::Value>(request).await {
            Ok(resp) => {
                if let Some(token) = resp
                    .get("status")
                    .and_then(|s| s.get("token"))
                    .and_then(|t| t.as_str())
                {
                    debug!(account = %account, namespace = %namespace, "service-account token minted");
                    return Ok(token.to_string());
                }
            }
            Err(e) => {
                warn!(account = %account, namespace = %namespace, error = %e, "token mint failed; trying next account");
            }
        }
    }
    Err(Error::Forbidden(format!(
        "no usable service account in {namespace} (tried {})",
        TOKEN_ACCOUNTS.join(", ")
    )))
}

fn map_kube_error(e: kube::Error) -> Error {
    match e {
        kube::Error::Api(ae) if ae.code == 401 || ae.code == 403 => Error::Forbidden(ae.message),
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound(ae.message),
        other => Error::transient(other.to_string()),
    }
}
