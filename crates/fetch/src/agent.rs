//! Highest-preference fetcher: gRPC to the per-node log collector deployed
//! in the cluster. Everything (grep, windowing, ordering) runs server-side.

use std::time::Duration;

use chrono::SecondsFormat;
use k8s_openapi::api::core::v1::Service;
use kube::{Api, Client};
use metrics::counter;
use tokio::sync::mpsc;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use kubetail_core::timearg::parse_log_timestamp;
use kubetail_core::{Error, FetchCapabilities, FetchOptions, LogRecord, LogSource, Result};

use crate::{queue_cap, CancelHandle, CursorSlot, ErrorSlot, LogFetcher, RecordStream};

const AGENT_SERVICE_NAME: &str = "kubetail-agent";
const SYSTEM_NAMESPACE: &str = "kubetail-system";

/// Wire types for the agent service, kept in sync by hand with the agent's
/// schema; no build-time codegen so the workspace builds without protoc.
pub mod proto {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct LogRecordsStreamRequest {
        /// `ns:pod/container` strings.
        #[prost(string, repeated, tag = "1")]
        pub sources: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
        /// RFC-3339 nanosecond bounds; empty means unbounded.
        #[prost(string, tag = "2")]
        pub since: ::prost::alloc::string::String,
        #[prost(string, tag = "3")]
        pub until: ::prost::alloc::string::String,
        #[prost(string, tag = "4")]
        pub grep: ::prost::alloc::string::String,
        #[prost(int64, tag = "5")]
        pub limit: i64,
        #[prost(bool, tag = "6")]
        pub follow: bool,
        #[prost(bool, tag = "7")]
        pub backward: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct LogRecordsStreamResponse {
        #[prost(string, tag = "1")]
        pub timestamp: ::prost::alloc::string::String,
        #[prost(string, tag = "2")]
        pub message: ::prost::alloc::string::String,
    }
}

/// Hand-rolled tonic client for the agent's server-streaming method.
#[derive(Clone)]
pub struct LogRecordsServiceClient {
    inner: tonic::client::Grpc<Channel>,
}

impl LogRecordsServiceClient {
    pub fn new(channel: Channel) -> Self {
        Self { inner: tonic::client::Grpc::new(channel) }
    }

    pub async fn stream_records(
        &mut self,
        request: proto::LogRecordsStreamRequest,
    ) -> std::result::Result<
        tonic::Response<tonic::codec::Streaming<proto::LogRecordsStreamResponse>>,
        tonic::Status,
    > {
        self.inner
            .ready()
            .await
            .map_err(|e| tonic::Status::unknown(format!("service not ready: {e}")))?;
        let codec: tonic::codec::ProstCodec<
            proto::LogRecordsStreamRequest,
            proto::LogRecordsStreamResponse,
        > = tonic::codec::ProstCodec::default();
        let path = http02::uri::PathAndQuery::from_static(
            "/kubetail.agent.v1.LogRecordsService/StreamRecords",
        );
        self.inner
            .server_streaming(tonic::Request::new(request), path, codec)
            .await
    }
}

pub struct AgentFetcher {
    channel: Channel,
    queue_cap: usize,
}

impl AgentFetcher {
    /// Probes for the agent service (system namespace first, then
    /// `default`) and dials it under `deadline`. Any failure falls through
    /// to the next fetcher level.
    pub async fn discover(client: &Client, deadline: Duration) -> Result<Self> {
        let (_, host, port) = find_service(client, AGENT_SERVICE_NAME).await?;
        let endpoint = format!("http://{host}:{port}");
        let channel = tonic::transport::Endpoint::from_shared(endpoint.clone())
            .map_err(|e| Error::transient(format!("bad agent endpoint: {e}")))?
            .connect_timeout(deadline)
            .connect()
            .await
            .map_err(|e| Error::transient(format!("dialing agent {endpoint}: {e}")))?;
        info!(endpoint = %endpoint, "agent fetcher connected");
        Ok(Self { channel, queue_cap: queue_cap() })
    }

    fn spawn_stream(&self, source: &LogSource, opts: FetchOptions, backward: bool) -> RecordStream {
        let request = proto::LogRecordsStreamRequest {
            sources: vec![format!(
                "{}:{}/{}",
                source.namespace, source.pod_name, source.container_name
            )],
            since: opts
                .start_time
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Nanos, true))
                .unwrap_or_default(),
            until: opts
                .stop_time
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Nanos, true))
                .unwrap_or_default(),
            grep: opts.grep.clone().unwrap_or_default(),
            limit: opts.limit.map(|l| l as i64).unwrap_or(0),
            follow: opts.follow && !backward,
            backward,
        };

        let (tx, rx) = mpsc::channel::<LogRecord>(self.queue_cap);
        let (cancel, mut cancel_rx) = CancelHandle::new();
        let error = ErrorSlot::default();
        let task_error = error.clone();
        let mut grpc = LogRecordsServiceClient::new(self.channel.clone());
        let source = source.clone();
        tokio::spawn(async move {
            let mut stream = match grpc.stream_records(request).await {
                Ok(resp) => resp.into_inner(),
                Err(status) => {
                    warn!(source = %source, status = %status, "agent stream failed to open");
                    task_error.set(map_status(status));
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => {
                        debug!(source = %source, "agent stream cancelled");
                        break;
                    }
                    next = stream.message() => {
                        match next {
                            Ok(Some(msg)) => {
                                let Some(timestamp) = parse_log_timestamp(&msg.timestamp) else {
                                    debug!(source = %source, "agent record without parseable timestamp");
                                    continue;
                                };
                                let record = LogRecord {
                                    timestamp,
                                    message: msg.message,
                                    source: source.clone(),
                                    approximate: false,
                                };
                                if tx.send(record).await.is_err() {
                                    break;
                                }
                                counter!("fetch_records_total", 1, "transport" => "agent");
                            }
                            Ok(None) => break,
                            Err(status) => {
                                warn!(source = %source, status = %status, "agent stream error");
                                task_error.set(map_status(status));
                                break;
                            }
                        }
                    }
                }
            }
        });
        RecordStream::new(rx, cancel, error, CursorSlot::default())
    }
}

#[async_trait::async_trait]
impl LogFetcher for AgentFetcher {
    fn capabilities(&self) -> FetchCapabilities {
        FetchCapabilities { server_side_grep: true, backward: true, follow: true }
    }

    async fn stream_forward(&self, source: &LogSource, opts: FetchOptions) -> Result<RecordStream> {
        Ok(self.spawn_stream(source, opts, false))
    }

    async fn stream_backward(
        &self,
        source: &LogSource,
        opts: FetchOptions,
    ) -> Result<RecordStream> {
        Ok(self.spawn_stream(source, opts, true))
    }
}

fn map_status(status: tonic::Status) -> Error {
    match status.code() {
        tonic::Code::Unauthenticated | tonic::Code::PermissionDenied => {
            Error::Forbidden(status.message().to_string())
        }
        tonic::Code::NotFound => Error::NotFound(status.message().to_string()),
        tonic::Code::Cancelled => Error::Cancelled,
        _ => Error::transient(status.message().to_string()),
    }
}

/// Namespace, cluster-IP and port for a named service, checking the
/// kubetail system namespace before `default`.
pub(crate) async fn find_service(client: &Client, name: &str) -> Result<(String, String, i32)> {
    for ns in [SYSTEM_NAMESPACE, "default"] {
        let api: Api<Service> = Api::namespaced(client.clone(), ns);
        let svc = match api.get_opt(name).await {
            Ok(Some(s)) => s,
            Ok(None) => continue,
            Err(e) => return Err(Error::transient(format!("service lookup in {ns}: {e}"))),
        };
        let Some(spec) = svc.spec else { continue };
        let host = match spec.cluster_ip {
            Some(ip) if !ip.is_empty() && ip != "None" => ip,
            _ => format!("{name}.{ns}.svc"),
        };
        let port = spec
            .ports
            .as_ref()
            .and_then(|p| p.first())
            .map(|p| p.port)
            .ok_or_else(|| Error::NotFound(format!("service {ns}/{name} has no ports")))?;
        debug!(service = %format!("{ns}/{name}"), host = %host, port, "service discovered");
        return Ok((ns.to_string(), host, port));
    }
    Err(Error::NotFound(format!("service {name} not found")))
}
