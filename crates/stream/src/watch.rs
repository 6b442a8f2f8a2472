//! Workload watcher: keeps the resolved endpoint set current as pods come
//! and go, including owner churn underneath Deployments and CronJobs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client, Resource, ResourceExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kubetail_core::{Error, LogSource, NameSelector, SourceFilter, SourceKey, SourceMeta, WorkloadKind};
use kubetail_fetch::ErrorSlot;
use kubetail_kubehub::source_meta_for_node;

use crate::resolve::{sources_for_pod, Selection};

const MAX_WATCH_RETRIES: u32 = 5;
const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_CAP: Duration = Duration::from_secs(30);

/// Endpoint churn emitted toward the coordinator and merger.
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    Joined(LogSource),
    Left(LogSource),
}

/// Shared node-metadata cache, filled lazily as pods land on unseen nodes.
#[derive(Clone, Default)]
pub struct NodeMetaCache {
    inner: Arc<Mutex<HashMap<String, SourceMeta>>>,
}

impl NodeMetaCache {
    pub fn seeded(map: HashMap<String, SourceMeta>) -> Self {
        Self { inner: Arc::new(Mutex::new(map)) }
    }

    async fn lookup(&self, client: &Client, node: &str) -> HashMap<String, SourceMeta> {
        let mut cache = self.inner.lock().await;
        if !node.is_empty() && !cache.contains_key(node) {
            let api: Api<Node> = Api::all(client.clone());
            if let Ok(Some(n)) = api.get_opt(node).await {
                cache.insert(node.to_string(), source_meta_for_node(&n));
            }
        }
        cache.clone()
    }
}

/// Spawns one watch task per resolved namespace selection. Watcher errors
/// retry with exponential backoff up to a bounded number of attempts, then
/// surface on `err` and cancel the stream.
pub fn spawn_watchers(
    client: Client,
    selections: Vec<Selection>,
    filter: SourceFilter,
    initial: &[LogSource],
    meta_cache: NodeMetaCache,
    events_tx: mpsc::Sender<EndpointEvent>,
    err: ErrorSlot,
    token: CancellationToken,
) {
    for selection in selections {
        let known: HashMap<SourceKey, String> = initial
            .iter()
            .filter(|s| s.namespace == selection.namespace)
            .map(|s| (s.key(), s.container_id.clone()))
            .collect();
        let task = WatchTask {
            client: client.clone(),
            selection,
            filter: filter.clone(),
            known,
            owner_cache: HashMap::new(),
            meta_cache: meta_cache.clone(),
            events_tx: events_tx.clone(),
        };
        let err = err.clone();
        let token = token.clone();
        tokio::spawn(async move { task.run(err, token).await });
    }
}

struct WatchTask {
    client: Client,
    selection: Selection,
    filter: SourceFilter,
    /// Source identity → container id last seen for it.
    known: HashMap<SourceKey, String>,
    /// Intermediate-owner uid → its parent workload uids.
    owner_cache: HashMap<String, Vec<String>>,
    meta_cache: NodeMetaCache,
    events_tx: mpsc::Sender<EndpointEvent>,
}

impl WatchTask {
    async fn run(mut self, err: ErrorSlot, token: CancellationToken) {
        let namespace = self.selection.namespace.clone();
        let mut attempts: u32 = 0;
        loop {
            let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
            let stream = watcher::watcher(api, watcher::Config::default());
            futures::pin_mut!(stream);
            info!(namespace = %namespace, "pod watch started");
            let failure = loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!(namespace = %namespace, "pod watch cancelled");
                        return;
                    }
                    next = stream.try_next() => match next {
                        Ok(Some(event)) => {
                            attempts = 0;
                            self.handle_event(event).await;
                        }
                        Ok(None) => break Error::transient("watch stream ended"),
                        Err(e) => break Error::transient(format!("watch error: {e}")),
                    }
                }
            };
            attempts += 1;
            if attempts > MAX_WATCH_RETRIES {
                warn!(namespace = %namespace, error = %failure, "pod watch exhausted retries");
                err.set(Error::fatal(format!(
                    "pod watch for {namespace} failed after {MAX_WATCH_RETRIES} retries: {failure}"
                )));
                token.cancel();
                return;
            }
            let backoff = RETRY_BASE
                .saturating_mul(2u32.saturating_pow(attempts - 1))
                .min(RETRY_CAP);
            warn!(namespace = %namespace, attempt = attempts, backoff_ms = backoff.as_millis() as u64, error = %failure, "pod watch retrying");
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    async fn handle_event(&mut self, event: Event<Pod>) {
        match event {
            Event::Applied(pod) => self.apply_pod(&pod).await,
            Event::Deleted(pod) => self.delete_pod(&pod).await,
            Event::Restarted(pods) => {
                // Relist: reconcile the full set, emitting joins for new
                // endpoints and leaves for vanished ones.
                let mut seen: HashSet<SourceKey> = HashSet::new();
                for pod in &pods {
                    for source in self.desired_sources(pod).await {
                        seen.insert(source.key());
                    }
                    self.apply_pod(pod).await;
                }
                let gone: Vec<SourceKey> = self
                    .known
                    .keys()
                    .filter(|k| !seen.contains(*k))
                    .cloned()
                    .collect();
                for key in gone {
                    self.emit_left(&key).await;
                }
            }
        }
    }

    async fn apply_pod(&mut self, pod: &Pod) {
        let desired = self.desired_sources(pod).await;
        let pod_name = pod.name_any();
        // Leaves first: containers of this pod we tracked that are gone.
        let desired_keys: HashSet<SourceKey> = desired.iter().map(|s| s.key()).collect();
        let stale: Vec<SourceKey> = self
            .known
            .keys()
            .filter(|k| k.pod_name == pod_name && !desired_keys.contains(*k))
            .cloned()
            .collect();
        for key in stale {
            self.emit_left(&key).await;
        }

        for source in desired {
            if source.container_id.is_empty() {
                // Not started yet; a later Applied event carries the id.
                continue;
            }
            match self.known.get(&source.key()) {
                None => {
                    self.known.insert(source.key(), source.container_id.clone());
                    debug!(source = %source, "endpoint joined");
                    let _ = self.events_tx.send(EndpointEvent::Joined(source)).await;
                }
                Some(old_id) if *old_id != source.container_id => {
                    // Container restarted under a new id: reopen.
                    let key = source.key();
                    self.emit_left(&key).await;
                    self.known.insert(key, source.container_id.clone());
                    debug!(source = %source, "endpoint reopened after restart");
                    let _ = self.events_tx.send(EndpointEvent::Joined(source)).await;
                }
                Some(_) => {}
            }
        }
    }

    async fn delete_pod(&mut self, pod: &Pod) {
        let pod_name = pod.name_any();
        let keys: Vec<SourceKey> = self
            .known
            .keys()
            .filter(|k| k.pod_name == pod_name)
            .cloned()
            .collect();
        for key in keys {
            self.emit_left(&key).await;
        }
    }

    async fn emit_left(&mut self, key: &SourceKey) {
        if let Some(container_id) = self.known.remove(key) {
            let source = LogSource {
                namespace: key.namespace.clone(),
                pod_name: key.pod_name.clone(),
                container_name: key.container_name.clone(),
                container_id,
                meta: SourceMeta::default(),
            };
            debug!(source = %source, "endpoint left");
            let _ = self.events_tx.send(EndpointEvent::Left(source)).await;
        }
    }

    /// The endpoints this pod should currently contribute, consulting the
    /// indirect-owner set for intermediates created after resolution.
    async fn desired_sources(&mut self, pod: &Pod) -> Vec<LogSource> {
        let mut restrictions = self.selection.static_matches(pod);
        restrictions.extend(self.indirect_matches(pod).await);
        if restrictions.is_empty() {
            return Vec::new();
        }
        let node = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .unwrap_or("");
        let node_meta = self.meta_cache.lookup(&self.client, node).await;
        sources_for_pod(pod, &restrictions, &node_meta, &self.filter)
    }

    /// Owner-churn handling: a pod owned by an unseen ReplicaSet/Job may
    /// still roll up to a watched Deployment/CronJob; one lookup per
    /// intermediate decides, and the parent uids are cached.
    async fn indirect_matches(&mut self, pod: &Pod) -> Vec<Option<NameSelector>> {
        if self.selection.indirect.is_empty() {
            return Vec::new();
        }
        let mut matched = Vec::new();
        let owner_refs = pod.metadata.owner_references.clone().unwrap_or_default();
        for owner in owner_refs {
            let parents = match self.owner_cache.get(&owner.uid) {
                Some(p) => p.clone(),
                None => {
                    let p = self.parent_uids(&owner).await;
                    self.owner_cache.insert(owner.uid.clone(), p.clone());
                    p
                }
            };
            for entry in &self.selection.indirect {
                if entry_matches_kind(entry, &owner.kind) && parents.iter().any(|u| u == &entry.uid)
                {
                    matched.push(entry.container.clone());
                }
            }
        }
        matched
    }

    /// Owner uids of the intermediate workload behind `owner`.
    async fn parent_uids(
        &self,
        owner: &k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference,
    ) -> Vec<String> {
        let refs = match owner.kind.as_str() {
            "ReplicaSet" => {
                let api: Api<ReplicaSet> =
                    Api::namespaced(self.client.clone(), &self.selection.namespace);
                match api.get_opt(&owner.name).await {
                    Ok(Some(rs)) => rs.meta().owner_references.clone(),
                    _ => None,
                }
            }
            "Job" => {
                let api: Api<Job> =
                    Api::namespaced(self.client.clone(), &self.selection.namespace);
                match api.get_opt(&owner.name).await {
                    Ok(Some(job)) => job.meta().owner_references.clone(),
                    _ => None,
                }
            }
            _ => None,
        };
        refs.unwrap_or_default().into_iter().map(|o| o.uid).collect()
    }
}

fn entry_matches_kind(entry: &crate::resolve::IndirectOwner, kind: &str) -> bool {
    matches!(
        (entry.via, kind),
        (WorkloadKind::ReplicaSet, "ReplicaSet") | (WorkloadKind::Job, "Job")
    )
}
