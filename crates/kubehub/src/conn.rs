use std::collections::HashMap;
use std::path::PathBuf;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::sync::Mutex;
use tracing::{debug, info};

use kubetail_core::{Error, Result};

pub const DEFAULT_NAMESPACE: &str = "default";

const IN_CLUSTER_NAMESPACE_PATH: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Where credentials come from, picked once at construction.
#[derive(Debug, Clone)]
pub enum ClientMode {
    /// Kubeconfig-based access; honors `KUBECONFIG` unless an explicit path
    /// is given.
    Desktop { kubeconfig: Option<PathBuf> },
    /// Service-account access from inside a cluster. Context switching is a
    /// desktop-only operation in this mode.
    InCluster,
}

/// Lazy, cached construction of clients keyed by cluster context. The cache
/// is the only process-wide mutable state; reads and insertions are
/// serialized under a single lock, the clients themselves are cheap clones
/// safe for concurrent use.
pub struct ConnectionManager {
    mode: ClientMode,
    clients: Mutex<HashMap<String, Client>>,
    allowed_namespaces: Vec<String>,
}

impl ConnectionManager {
    pub fn desktop(kubeconfig: Option<PathBuf>) -> Self {
        Self::new(ClientMode::Desktop { kubeconfig })
    }

    pub fn in_cluster() -> Self {
        Self::new(ClientMode::InCluster)
    }

    pub fn new(mode: ClientMode) -> Self {
        Self {
            mode,
            clients: Mutex::new(HashMap::new()),
            allowed_namespaces: Vec::new(),
        }
    }

    /// Restricts namespace-wildcard expansion; empty means "any".
    pub fn with_allowed_namespaces(mut self, namespaces: Vec<String>) -> Self {
        self.allowed_namespaces = namespaces;
        self
    }

    pub fn allowed_namespaces(&self) -> &[String] {
        &self.allowed_namespaces
    }

    /// Returns the cached client for `context`, constructing it on first
    /// access. `None` selects the current context (desktop) or the
    /// service account (in-cluster).
    pub async fn client(&self, context: Option<&str>) -> Result<Client> {
        let key = context.unwrap_or("").to_string();
        let mut cache = self.clients.lock().await;
        if let Some(c) = cache.get(&key) {
            debug!(context = %key, "client cache hit");
            return Ok(c.clone());
        }

        let config = match &self.mode {
            ClientMode::InCluster => {
                if context.is_some() {
                    return Err(Error::Forbidden(
                        "context selection is a desktop-only operation".into(),
                    ));
                }
                Config::incluster()
                    .map_err(|e| Error::fatal(format!("in-cluster config: {e}")))?
            }
            ClientMode::Desktop { kubeconfig } => {
                let kc = read_kubeconfig(kubeconfig.as_deref())?;
                let opts = KubeConfigOptions {
                    context: context.map(str::to_string),
                    ..Default::default()
                };
                Config::from_custom_kubeconfig(kc, &opts)
                    .await
                    .map_err(|e| Error::fatal(format!("kubeconfig context {key:?}: {e}")))?
            }
        };
        let client = Client::try_from(config)
            .map_err(|e| Error::fatal(format!("building client for context {key:?}: {e}")))?;
        info!(context = %key, "kube client constructed");
        cache.insert(key, client.clone());
        Ok(client)
    }

    /// Default namespace for `context`: the kubeconfig context namespace in
    /// desktop mode, the mounted service-account namespace in-cluster,
    /// `"default"` otherwise.
    pub fn default_namespace(&self, context: Option<&str>) -> String {
        match &self.mode {
            ClientMode::InCluster => std::fs::read_to_string(IN_CLUSTER_NAMESPACE_PATH)
                .map(|s| s.trim().to_string())
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            ClientMode::Desktop { kubeconfig } => {
                let Ok(kc) = read_kubeconfig(kubeconfig.as_deref()) else {
                    return DEFAULT_NAMESPACE.to_string();
                };
                let wanted = context
                    .map(str::to_string)
                    .or_else(|| kc.current_context.clone());
                kc.contexts
                    .iter()
                    .find(|c| Some(&c.name) == wanted.as_ref())
                    .and_then(|c| c.context.as_ref())
                    .and_then(|c| c.namespace.clone())
                    .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string())
            }
        }
    }

    /// Drops every cached client. In-flight watches end when their tasks are
    /// cancelled; this only releases the pooled connections.
    pub async fn shutdown(&self) {
        self.clients.lock().await.clear();
        debug!("connection cache drained");
    }
}

fn read_kubeconfig(path: Option<&std::path::Path>) -> Result<Kubeconfig> {
    match path {
        Some(p) => Kubeconfig::read_from(p)
            .map_err(|e| Error::fatal(format!("reading kubeconfig {}: {e}", p.display()))),
        None => Kubeconfig::read().map_err(|e| Error::fatal(format!("reading kubeconfig: {e}"))),
    }
}
