use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Placement metadata for a source, drawn from the Node object that runs the
/// pod. Empty strings when the node has not been resolved (yet).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceMeta {
    pub node: String,
    pub region: String,
    pub zone: String,
    pub os: String,
    pub arch: String,
}

/// A live (namespace, pod, container) endpoint that produces log records.
///
/// `container_id` is the identity key for dot-color assignment and for
/// de-duplication across restarts; the (namespace, pod, container) triple is
/// the identity key for resumption when the container id changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogSource {
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
    pub container_id: String,
    #[serde(default)]
    pub meta: SourceMeta,
}

/// Identity triple for a source, independent of container restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceKey {
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
}

impl LogSource {
    pub fn key(&self) -> SourceKey {
        SourceKey {
            namespace: self.namespace.clone(),
            pod_name: self.pod_name.clone(),
            container_name: self.container_name.clone(),
        }
    }
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.namespace, self.pod_name, self.container_name)
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.namespace, self.pod_name, self.container_name)
    }
}

/// User-supplied restriction over source placement metadata. Empty vectors
/// mean "no restriction"; a non-empty vector admits any listed value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFilter {
    pub regions: Vec<String>,
    pub zones: Vec<String>,
    pub oses: Vec<String>,
    pub arches: Vec<String>,
    pub nodes: Vec<String>,
}

impl SourceFilter {
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
            && self.zones.is_empty()
            && self.oses.is_empty()
            && self.arches.is_empty()
            && self.nodes.is_empty()
    }

    pub fn admits(&self, meta: &SourceMeta) -> bool {
        fn ok(allow: &[String], value: &str) -> bool {
            allow.is_empty() || allow.iter().any(|v| v == value)
        }
        ok(&self.regions, &meta.region)
            && ok(&self.zones, &meta.zone)
            && ok(&self.oses, &meta.os)
            && ok(&self.arches, &meta.arch)
            && ok(&self.nodes, &meta.node)
    }
}

/// One log line with its runtime-assigned timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub source: LogSource,
    /// Set when the upstream omitted a timestamp and the engine stamped "now".
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub approximate: bool,
}

impl LogRecord {
    /// Total order for forward (oldest-first) emission: timestamp at
    /// nanosecond resolution, ties broken by source identity.
    pub fn cmp_forward(&self, other: &LogRecord) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.source.namespace.cmp(&other.source.namespace))
            .then_with(|| self.source.pod_name.cmp(&other.source.pod_name))
            .then_with(|| self.source.container_name.cmp(&other.source.container_name))
    }

    /// Total order for backward (newest-first) emission.
    pub fn cmp_backward(&self, other: &LogRecord) -> Ordering {
        self.cmp_forward(other).reverse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn src(pod: &str) -> LogSource {
        LogSource {
            namespace: "default".into(),
            pod_name: pod.into(),
            container_name: "main".into(),
            container_id: format!("containerd://{pod}"),
            meta: SourceMeta::default(),
        }
    }

    fn rec(pod: &str, nanos: i64) -> LogRecord {
        LogRecord {
            timestamp: Utc.timestamp_opt(0, 0).unwrap() + chrono::Duration::nanoseconds(nanos),
            message: "m".into(),
            source: src(pod),
            approximate: false,
        }
    }

    #[test]
    fn forward_order_is_timestamp_then_identity() {
        let a = rec("a", 10);
        let b = rec("b", 10);
        let c = rec("a", 11);
        assert_eq!(a.cmp_forward(&b), Ordering::Less);
        assert_eq!(b.cmp_forward(&c), Ordering::Less);
        assert_eq!(c.cmp_backward(&a), Ordering::Less);
    }

    #[test]
    fn ties_are_total() {
        let a = rec("a", 10);
        let b = rec("a", 10);
        assert_eq!(a.cmp_forward(&b), Ordering::Equal);
    }
}
