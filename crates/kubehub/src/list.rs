//! Multi-namespace pod listing: fan out one list call per namespace, merge
//! the pages into a single name-sorted page with a combined continue token.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use kube::{api::ListParams, Api, Client, ResourceExt};
use tracing::{debug, warn};

use kubetail_core::cursor::{decode_multi_continue, encode_multi_continue, k8s_continue_token};
use kubetail_core::{Error, Result};

/// One namespace's slice of a fan-out list call.
#[derive(Debug, Clone)]
pub struct NsPage {
    pub namespace: String,
    pub items: Vec<Pod>,
    pub resource_version: String,
    pub remaining: i64,
}

/// The merged view handed back to callers.
#[derive(Debug, Clone)]
pub struct MergedPage {
    pub items: Vec<Pod>,
    pub remaining_item_count: i64,
    pub continue_token: Option<String>,
    pub resource_versions: BTreeMap<String, String>,
}

/// Lists pods across `namespaces`, resuming from `continue_token` when
/// given. Each shard is retried once before the call fails.
pub async fn list_pods_multi(
    client: &Client,
    namespaces: &[String],
    label_selector: Option<&str>,
    limit: usize,
    continue_token: Option<&str>,
) -> Result<MergedPage> {
    let cursor = match continue_token {
        Some(t) => Some(decode_multi_continue(t)?),
        None => None,
    };

    let calls = namespaces.iter().map(|ns| {
        let api: Api<Pod> = Api::namespaced(client.clone(), ns);
        let mut lp = ListParams::default().limit(limit as u32);
        if let Some(sel) = label_selector {
            lp = lp.labels(sel);
        }
        if let Some(c) = &cursor {
            // Rebuild the standard "continue at key after start_key as of
            // rv" token for this namespace's shard.
            if let Some(rv) = c.resource_versions.get(ns) {
                lp.continue_token = Some(k8s_continue_token(rv, &c.start_key));
            }
        }
        let ns = ns.clone();
        async move {
            let first = api.list(&lp).await;
            let list = match first {
                Ok(l) => l,
                Err(e) => {
                    warn!(namespace = %ns, error = %e, "list shard failed; retrying once");
                    api.list(&lp)
                        .await
                        .map_err(|e| Error::transient(format!("listing pods in {ns}: {e}")))?
                }
            };
            let remaining = list.metadata.remaining_item_count.unwrap_or(0);
            let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
            Ok::<NsPage, Error>(NsPage {
                namespace: ns,
                items: list.items,
                resource_version,
                remaining,
            })
        }
    });

    let pages = futures::future::try_join_all(calls).await?;
    merge_pages(pages, limit)
}

/// Merge rule: sort the union by name, truncate to `limit`, count truncated
/// items into `remaining_item_count`, and mint a continue token only when
/// something remains.
pub fn merge_pages(pages: Vec<NsPage>, limit: usize) -> Result<MergedPage> {
    let mut resource_versions = BTreeMap::new();
    let mut upstream_remaining = 0i64;
    let mut items: Vec<Pod> = Vec::new();
    for page in pages {
        if !page.resource_version.is_empty() {
            resource_versions.insert(page.namespace.clone(), page.resource_version);
        }
        upstream_remaining += page.remaining;
        items.extend(page.items);
    }
    items.sort_by(|a, b| {
        a.name_any()
            .cmp(&b.name_any())
            .then_with(|| a.namespace().cmp(&b.namespace()))
    });

    let truncated = items.len().saturating_sub(limit) as i64;
    items.truncate(limit);
    let remaining_item_count = upstream_remaining + truncated;

    let continue_token = if remaining_item_count > 0 {
        let start_key = items
            .last()
            .map(|p| p.name_any())
            .ok_or_else(|| Error::fatal("non-empty remainder with an empty page"))?;
        Some(encode_multi_continue(&resource_versions, &start_key)?)
    } else {
        None
    };

    debug!(
        kept = items.len(),
        remaining = remaining_item_count,
        "multi-namespace page merged"
    );
    Ok(MergedPage { items, remaining_item_count, continue_token, resource_versions })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(ns: &str, name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn page(ns: &str, names: &[&str], rv: &str, remaining: i64) -> NsPage {
        NsPage {
            namespace: ns.to_string(),
            items: names.iter().map(|n| pod(ns, n)).collect(),
            resource_version: rv.to_string(),
            remaining,
        }
    }

    #[test]
    fn merge_sorts_truncates_and_counts() {
        // Two namespaces, two pods each, four records per pod upstream: ask
        // for 6 of the 16 total names.
        let pages = vec![
            page("ns1", &["a-1", "c-1", "e-1", "g-1"], "100", 4),
            page("ns2", &["b-1", "d-1", "f-1", "h-1"], "200", 4),
        ];
        let merged = merge_pages(pages, 6).unwrap();
        let names: Vec<String> = merged.items.iter().map(|p| p.name_any()).collect();
        assert_eq!(names, vec!["a-1", "b-1", "c-1", "d-1", "e-1", "f-1"]);
        // 8 upstream + 2 truncated here
        assert_eq!(merged.remaining_item_count, 10);
        let token = merged.continue_token.expect("continue token");
        let cursor = decode_multi_continue(&token).unwrap();
        assert_eq!(cursor.start_key, "f-1");
        assert_eq!(cursor.resource_versions.get("ns1").unwrap(), "100");
        assert_eq!(cursor.resource_versions.get("ns2").unwrap(), "200");
    }

    #[test]
    fn merge_without_remainder_has_no_token() {
        let pages = vec![page("ns1", &["a", "b"], "1", 0), page("ns2", &["c"], "2", 0)];
        let merged = merge_pages(pages, 10).unwrap();
        assert_eq!(merged.items.len(), 3);
        assert_eq!(merged.remaining_item_count, 0);
        assert!(merged.continue_token.is_none());
    }

    #[test]
    fn merge_ties_break_by_namespace() {
        let pages = vec![page("ns2", &["same"], "1", 0), page("ns1", &["same"], "2", 0)];
        let merged = merge_pages(pages, 10).unwrap();
        assert_eq!(merged.items[0].namespace().unwrap(), "ns1");
        assert_eq!(merged.items[1].namespace().unwrap(), "ns2");
    }
}
