use std::collections::HashMap;

use anyhow::Result;
use k8s_openapi::api::core::v1::Node;
use kube::{api::ListParams, Api, Client, ResourceExt};
use tracing::debug;

use kubetail_core::SourceMeta;

const LABEL_REGION: &str = "topology.kubernetes.io/region";
const LABEL_ZONE: &str = "topology.kubernetes.io/zone";
const LABEL_OS: &str = "kubernetes.io/os";
const LABEL_ARCH: &str = "kubernetes.io/arch";

/// Placement metadata for every node in the cluster, keyed by node name.
/// Sources on unknown nodes keep empty metadata.
pub async fn node_meta_map(client: Client) -> Result<HashMap<String, SourceMeta>> {
    let api: Api<Node> = Api::all(client);
    let nodes = api.list(&ListParams::default()).await?;
    let mut out = HashMap::with_capacity(nodes.items.len());
    for node in &nodes.items {
        out.insert(node.name_any(), source_meta_for_node(node));
    }
    debug!(nodes = out.len(), "node metadata resolved");
    Ok(out)
}

pub fn source_meta_for_node(node: &Node) -> SourceMeta {
    let label = |key: &str| {
        node.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(key))
            .cloned()
            .unwrap_or_default()
    };
    SourceMeta {
        node: node.name_any(),
        region: label(LABEL_REGION),
        zone: label(LABEL_ZONE),
        os: label(LABEL_OS),
        arch: label(LABEL_ARCH),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    #[test]
    fn meta_from_labels() {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_REGION.to_string(), "us-east-1".to_string());
        labels.insert(LABEL_ZONE.to_string(), "us-east-1c".to_string());
        labels.insert(LABEL_OS.to_string(), "linux".to_string());
        labels.insert(LABEL_ARCH.to_string(), "arm64".to_string());
        let node = Node {
            metadata: ObjectMeta {
                name: Some("node-1".into()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        };
        let meta = source_meta_for_node(&node);
        assert_eq!(meta.node, "node-1");
        assert_eq!(meta.region, "us-east-1");
        assert_eq!(meta.zone, "us-east-1c");
        assert_eq!(meta.os, "linux");
        assert_eq!(meta.arch, "arm64");
    }

    #[test]
    fn missing_labels_are_empty() {
        let node = Node {
            metadata: ObjectMeta { name: Some("bare".into()), ..Default::default() },
            ..Default::default()
        };
        let meta = source_meta_for_node(&node);
        assert_eq!(meta.node, "bare");
        assert!(meta.region.is_empty());
        assert!(meta.arch.is_empty());
    }
}
