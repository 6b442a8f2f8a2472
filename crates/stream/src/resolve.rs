//! Source resolution: expands source expressions into the live set of
//! (pod, container) endpoints and the selection criteria the watcher uses to
//! keep that set current.

use std::collections::{HashMap, HashSet};

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::ListParams;
use kube::{Api, Client, Resource, ResourceExt};
use tracing::{debug, info, warn};

use kubetail_core::{
    Error, LogSource, NameSelector, NamespaceSelector, Result, SourceExpr, SourceFilter,
    SourceMeta, WorkloadKind,
};
use kubetail_kubehub::node_meta_map;

/// A direct pod owner (ReplicaSet, Job, or a workload that owns pods
/// itself) whose pods are selected.
#[derive(Debug, Clone)]
pub struct OwnerSelection {
    pub uid: String,
    pub container: Option<NameSelector>,
}

/// A top-level workload (Deployment, CronJob) whose pods are reached through
/// an intermediate owner; the watcher resolves unseen intermediates against
/// this set when owners churn.
#[derive(Debug, Clone)]
pub struct IndirectOwner {
    pub uid: String,
    /// The intermediate kind: ReplicaSet for Deployments, Job for CronJobs.
    pub via: WorkloadKind,
    pub container: Option<NameSelector>,
}

/// One namespace's resolved selection criteria.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub namespace: String,
    /// Direct pod-name selectors, each with its container restriction.
    pub pods: Vec<(NameSelector, Option<NameSelector>)>,
    pub owners: Vec<OwnerSelection>,
    pub indirect: Vec<IndirectOwner>,
}

impl Selection {
    /// Container restrictions that admit this pod, without touching the API
    /// (indirect owners are the watcher's problem). `None` entries mean
    /// "all containers".
    pub fn static_matches(&self, pod: &Pod) -> Vec<Option<NameSelector>> {
        let name = pod.name_any();
        let mut out = Vec::new();
        for (sel, container) in &self.pods {
            if sel.matches(&name) {
                out.push(container.clone());
            }
        }
        let owner_uids: Vec<&str> = pod
            .metadata
            .owner_references
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .map(|o| o.uid.as_str())
            .collect();
        for owner in &self.owners {
            if owner_uids.contains(&owner.uid.as_str()) {
                out.push(owner.container.clone());
            }
        }
        out
    }
}

/// The resolver's output: the static endpoint set, the per-namespace
/// criteria the watcher keeps live, and the node metadata gathered on the
/// way (seed for the watcher's cache).
#[derive(Debug, Default)]
pub struct Resolution {
    pub sources: Vec<LogSource>,
    pub selections: Vec<Selection>,
    pub node_meta: HashMap<String, SourceMeta>,
}

/// Expands a list of source expressions into endpoints. Results are unioned
/// and de-duplicated by endpoint identity.
pub async fn resolve_sources(
    client: &Client,
    exprs: &[SourceExpr],
    default_namespace: &str,
    allowed_namespaces: &[String],
    filter: &SourceFilter,
) -> Result<Resolution> {
    let mut by_namespace: HashMap<String, Vec<&SourceExpr>> = HashMap::new();
    for expr in exprs {
        for ns in expand_namespaces(client, expr, default_namespace, allowed_namespaces).await? {
            by_namespace.entry(ns).or_default().push(expr);
        }
    }

    let node_meta = node_meta_map(client.clone())
        .await
        .map_err(|e| Error::transient(format!("resolving node metadata: {e}")))?;

    let mut resolution = Resolution::default();
    let mut seen: HashSet<(String, String, String, String)> = HashSet::new();
    for (namespace, ns_exprs) in by_namespace {
        let mut selection = Selection { namespace: namespace.clone(), ..Default::default() };
        for expr in ns_exprs {
            add_expr_to_selection(client, &namespace, expr, &mut selection).await?;
        }

        let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
        let listed = pods
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::transient(format!("listing pods in {namespace}: {e}")))?;
        for pod in &listed.items {
            let restrictions = selection.static_matches(pod);
            if restrictions.is_empty() {
                continue;
            }
            for source in
                sources_for_pod(pod, &restrictions, &node_meta, filter)
            {
                let identity = (
                    source.namespace.clone(),
                    source.pod_name.clone(),
                    source.container_name.clone(),
                    source.container_id.clone(),
                );
                if seen.insert(identity) {
                    resolution.sources.push(source);
                }
            }
        }
        resolution.selections.push(selection);
    }

    info!(
        endpoints = resolution.sources.len(),
        namespaces = resolution.selections.len(),
        "sources resolved"
    );
    resolution.node_meta = node_meta;
    Ok(resolution)
}

/// Endpoints for one pod under the union of container restrictions.
pub fn sources_for_pod(
    pod: &Pod,
    restrictions: &[Option<NameSelector>],
    node_meta: &HashMap<String, SourceMeta>,
    filter: &SourceFilter,
) -> Vec<LogSource> {
    let namespace = pod.namespace().unwrap_or_default();
    let pod_name = pod.name_any();
    let node = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_name.clone())
        .unwrap_or_default();
    let meta = node_meta.get(&node).cloned().unwrap_or_else(|| SourceMeta {
        node: node.clone(),
        ..Default::default()
    });
    if !filter.admits(&meta) {
        return Vec::new();
    }

    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|v| {
            v.iter()
                .map(|cs| (cs.name.clone(), cs.container_id.clone().unwrap_or_default()))
                .collect::<HashMap<_, _>>()
        })
        .unwrap_or_default();

    let mut out = Vec::new();
    let Some(spec) = pod.spec.as_ref() else { return out };
    for container in &spec.containers {
        let admitted = restrictions.iter().any(|r| match r {
            Some(sel) => sel.matches(&container.name),
            None => true,
        });
        if !admitted {
            continue;
        }
        out.push(LogSource {
            namespace: namespace.clone(),
            pod_name: pod_name.clone(),
            container_name: container.name.clone(),
            container_id: statuses.get(&container.name).cloned().unwrap_or_default(),
            meta: meta.clone(),
        });
    }
    out
}

/// Namespace expansion for one expression: the default namespace, a named
/// one (checked against the allowlist), or the wildcard fan-out.
async fn expand_namespaces(
    client: &Client,
    expr: &SourceExpr,
    default_namespace: &str,
    allowed: &[String],
) -> Result<Vec<String>> {
    match &expr.namespace {
        None => Ok(vec![default_namespace.to_string()]),
        Some(NamespaceSelector::Exact(ns)) => {
            if !allowed.is_empty() && !allowed.iter().any(|a| a == ns) {
                return Err(Error::Forbidden(format!("namespace {ns} is not allowed")));
            }
            Ok(vec![ns.clone()])
        }
        Some(NamespaceSelector::Any) => {
            if !allowed.is_empty() {
                return Ok(allowed.to_vec());
            }
            let api: Api<Namespace> = Api::all(client.clone());
            let list = api
                .list(&ListParams::default())
                .await
                .map_err(|e| Error::transient(format!("listing namespaces: {e}")))?;
            Ok(list.items.iter().map(|n| n.name_any()).collect())
        }
    }
}

/// Resolves one expression inside one namespace into selection criteria,
/// walking owner references down to the direct pod owners.
async fn add_expr_to_selection(
    client: &Client,
    namespace: &str,
    expr: &SourceExpr,
    selection: &mut Selection,
) -> Result<()> {
    match expr.kind {
        WorkloadKind::Pod => {
            selection.pods.push((expr.name.clone(), expr.container.clone()));
            Ok(())
        }
        WorkloadKind::Deployment => {
            let uids =
                workload_uids::<Deployment>(client, namespace, &expr.name, "deployments").await?;
            let rs: Api<ReplicaSet> = Api::namespaced(client.clone(), namespace);
            let listed = rs
                .list(&ListParams::default())
                .await
                .map_err(|e| Error::transient(format!("listing replicasets in {namespace}: {e}")))?;
            for set in &listed.items {
                if owned_by_any(set.meta().owner_references.as_deref(), &uids) {
                    selection.owners.push(OwnerSelection {
                        uid: set.meta().uid.clone().unwrap_or_default(),
                        container: expr.container.clone(),
                    });
                }
            }
            for uid in uids {
                selection.indirect.push(IndirectOwner {
                    uid,
                    via: WorkloadKind::ReplicaSet,
                    container: expr.container.clone(),
                });
            }
            Ok(())
        }
        WorkloadKind::CronJob => {
            let uids = workload_uids::<CronJob>(client, namespace, &expr.name, "cronjobs").await?;
            let jobs: Api<Job> = Api::namespaced(client.clone(), namespace);
            let listed = jobs
                .list(&ListParams::default())
                .await
                .map_err(|e| Error::transient(format!("listing jobs in {namespace}: {e}")))?;
            for job in &listed.items {
                if owned_by_any(job.meta().owner_references.as_deref(), &uids) {
                    selection.owners.push(OwnerSelection {
                        uid: job.meta().uid.clone().unwrap_or_default(),
                        container: expr.container.clone(),
                    });
                }
            }
            for uid in uids {
                selection.indirect.push(IndirectOwner {
                    uid,
                    via: WorkloadKind::Job,
                    container: expr.container.clone(),
                });
            }
            Ok(())
        }
        WorkloadKind::ReplicaSet => {
            direct_owners::<ReplicaSet>(client, namespace, expr, "replicasets", selection).await
        }
        WorkloadKind::StatefulSet => {
            direct_owners::<StatefulSet>(client, namespace, expr, "statefulsets", selection).await
        }
        WorkloadKind::DaemonSet => {
            direct_owners::<DaemonSet>(client, namespace, expr, "daemonsets", selection).await
        }
        WorkloadKind::Job => {
            direct_owners::<Job>(client, namespace, expr, "jobs", selection).await
        }
    }
}

async fn direct_owners<K>(
    client: &Client,
    namespace: &str,
    expr: &SourceExpr,
    plural: &str,
    selection: &mut Selection,
) -> Result<()>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + std::fmt::Debug
        + serde::de::DeserializeOwned,
    K::DynamicType: Default,
{
    for uid in workload_uids::<K>(client, namespace, &expr.name, plural).await? {
        selection.owners.push(OwnerSelection { uid, container: expr.container.clone() });
    }
    Ok(())
}

/// Uids of the workloads of kind `K` in `namespace` whose names match.
async fn workload_uids<K>(
    client: &Client,
    namespace: &str,
    name: &NameSelector,
    plural: &str,
) -> Result<Vec<String>>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + std::fmt::Debug
        + serde::de::DeserializeOwned,
    K::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let listed = api
        .list(&ListParams::default())
        .await
        .map_err(|e| Error::transient(format!("listing {plural} in {namespace}: {e}")))?;
    let uids: Vec<String> = listed
        .items
        .iter()
        .filter(|w| name.matches(&w.name_any()))
        .filter_map(|w| w.meta().uid.clone())
        .collect();
    if uids.is_empty() {
        if let Some(exact) = name.as_exact() {
            warn!(namespace = %namespace, workload = %format!("{plural}/{exact}"), "workload not found; continuing with remaining sources");
        }
    } else {
        debug!(namespace = %namespace, plural = %plural, matched = uids.len(), "workloads resolved");
    }
    Ok(uids)
}

fn owned_by_any(
    refs: Option<&[k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference]>,
    uids: &[String],
) -> bool {
    refs.unwrap_or(&[])
        .iter()
        .any(|r| uids.iter().any(|u| u == &r.uid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, ContainerStatus, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    fn pod(name: &str, owner_uid: Option<&str>, containers: &[&str]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                owner_references: owner_uid.map(|uid| {
                    vec![OwnerReference {
                        uid: uid.to_string(),
                        kind: "ReplicaSet".to_string(),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("node-1".to_string()),
                containers: containers
                    .iter()
                    .map(|c| Container { name: c.to_string(), ..Default::default() })
                    .collect(),
                ..Default::default()
            }),
            status: Some(PodStatus {
                container_statuses: Some(
                    containers
                        .iter()
                        .map(|c| ContainerStatus {
                            name: c.to_string(),
                            container_id: Some(format!("containerd://{c}")),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn static_match_by_pod_name_glob() {
        let sel = Selection {
            namespace: "default".into(),
            pods: vec![(NameSelector::parse("web-*").unwrap(), None)],
            ..Default::default()
        };
        assert_eq!(sel.static_matches(&pod("web-1", None, &["c"])).len(), 1);
        assert!(sel.static_matches(&pod("api-1", None, &["c"])).is_empty());
    }

    #[test]
    fn static_match_by_owner_uid() {
        let sel = Selection {
            namespace: "default".into(),
            owners: vec![OwnerSelection { uid: "rs-1".into(), container: None }],
            ..Default::default()
        };
        assert_eq!(sel.static_matches(&pod("web-1", Some("rs-1"), &["c"])).len(), 1);
        assert!(sel.static_matches(&pod("web-2", Some("rs-9"), &["c"])).is_empty());
    }

    #[test]
    fn sources_honor_container_restriction_and_ids() {
        let restrictions: Vec<Option<NameSelector>> =
            vec![Some(NameSelector::parse("nginx").unwrap())];
        let sources = sources_for_pod(
            &pod("web-1", None, &["nginx", "sidecar"]),
            &restrictions,
            &HashMap::new(),
            &SourceFilter::default(),
        );
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].container_name, "nginx");
        assert_eq!(sources[0].container_id, "containerd://nginx");
        assert_eq!(sources[0].meta.node, "node-1");
    }

    #[test]
    fn sources_respect_node_filter() {
        let mut node_meta = HashMap::new();
        node_meta.insert(
            "node-1".to_string(),
            SourceMeta { node: "node-1".into(), region: "eu-west-1".into(), ..Default::default() },
        );
        let filter = SourceFilter { regions: vec!["us-east-1".into()], ..Default::default() };
        let sources = sources_for_pod(&pod("web-1", None, &["c"]), &[None], &node_meta, &filter);
        assert!(sources.is_empty());
    }
}
