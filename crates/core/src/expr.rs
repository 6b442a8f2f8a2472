//! Source expressions: the user-facing strings that select log endpoints,
//! e.g. `web-5d78f`, `prod:deployments/web`, `*:cronjobs/backup-*/runner`.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Workload kinds a source expression can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    Pod,
    Deployment,
    ReplicaSet,
    StatefulSet,
    DaemonSet,
    Job,
    CronJob,
}

impl WorkloadKind {
    /// Accepts singular, plural and the usual kubectl short names.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pod" | "pods" | "po" => Some(WorkloadKind::Pod),
            "deployment" | "deployments" | "deploy" => Some(WorkloadKind::Deployment),
            "replicaset" | "replicasets" | "rs" => Some(WorkloadKind::ReplicaSet),
            "statefulset" | "statefulsets" | "sts" => Some(WorkloadKind::StatefulSet),
            "daemonset" | "daemonsets" | "ds" => Some(WorkloadKind::DaemonSet),
            "job" | "jobs" => Some(WorkloadKind::Job),
            "cronjob" | "cronjobs" | "cj" => Some(WorkloadKind::CronJob),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Pod => "pods",
            WorkloadKind::Deployment => "deployments",
            WorkloadKind::ReplicaSet => "replicasets",
            WorkloadKind::StatefulSet => "statefulsets",
            WorkloadKind::DaemonSet => "daemonsets",
            WorkloadKind::Job => "jobs",
            WorkloadKind::CronJob => "cronjobs",
        }
    }
}

/// Exact name or a glob (`*`, `?`) over names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameSelector {
    Exact(String),
    Pattern(glob::Pattern),
}

impl NameSelector {
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::invalid("empty name in source expression"));
        }
        if s.contains('*') || s.contains('?') || s.contains('[') {
            let p = glob::Pattern::new(s)
                .map_err(|e| Error::invalid(format!("bad name pattern {s:?}: {e}")))?;
            Ok(NameSelector::Pattern(p))
        } else {
            Ok(NameSelector::Exact(s.to_string()))
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            NameSelector::Exact(n) => n == name,
            NameSelector::Pattern(p) => p.matches(name),
        }
    }

    /// The exact name when this selector can only ever match one.
    pub fn as_exact(&self) -> Option<&str> {
        match self {
            NameSelector::Exact(n) => Some(n),
            NameSelector::Pattern(_) => None,
        }
    }

    pub fn is_match_all(&self) -> bool {
        matches!(self, NameSelector::Pattern(p) if p.as_str() == "*")
    }
}

/// A concrete namespace or the `*` wildcard (expanded against the allowed
/// namespace list at resolution time).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceSelector {
    Exact(String),
    Any,
}

/// A parsed source expression. One expression can expand to many endpoints;
/// a stream accepts a list of expressions and unions the result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceExpr {
    /// `None` means "the connection's default namespace".
    pub namespace: Option<NamespaceSelector>,
    pub kind: WorkloadKind,
    pub name: NameSelector,
    /// `None` means all containers of each matched pod.
    pub container: Option<NameSelector>,
}

impl SourceExpr {
    /// Grammar: `[ns:]name`, `[ns:]name/container`, `[ns:]kind/name` and
    /// `[ns:]kind/name/container`; `ns` may be `*`; `name` and `container`
    /// accept globs; `ns:*` selects every pod in `ns`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::invalid("empty source expression"));
        }
        let (namespace, body) = match s.split_once(':') {
            Some(("", _)) => return Err(Error::invalid(format!("empty namespace in {s:?}"))),
            Some(("*", rest)) => (Some(NamespaceSelector::Any), rest),
            Some((ns, rest)) => (Some(NamespaceSelector::Exact(ns.to_string())), rest),
            None => (None, s),
        };
        if body.is_empty() {
            return Err(Error::invalid(format!("missing name in {s:?}")));
        }

        let segs: Vec<&str> = body.split('/').collect();
        let (kind, name, container) = match segs.as_slice() {
            [name] => (WorkloadKind::Pod, *name, None),
            [first, second] => match WorkloadKind::parse(first) {
                Some(kind) => (kind, *second, None),
                None => (WorkloadKind::Pod, *first, Some(*second)),
            },
            [first, name, container] => {
                let kind = WorkloadKind::parse(first)
                    .ok_or_else(|| Error::invalid(format!("unknown workload kind {first:?}")))?;
                (kind, *name, Some(*container))
            }
            _ => return Err(Error::invalid(format!("malformed source expression {s:?}"))),
        };

        let container = match container {
            Some("*") | None => None,
            Some(c) => Some(NameSelector::parse(c)?),
        };

        Ok(SourceExpr {
            namespace,
            kind,
            name: NameSelector::parse(name)?,
            container,
        })
    }

    /// Parses a list, surfacing the first bad expression.
    pub fn parse_all<I, S>(exprs: I) -> Result<Vec<SourceExpr>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        exprs.into_iter().map(|s| SourceExpr::parse(s.as_ref())).collect()
    }

    /// Whether the matched container set is restricted.
    pub fn selects_container(&self, container: &str) -> bool {
        match &self.container {
            Some(sel) => sel.matches(container),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name_is_pod_in_default_namespace() {
        let e = SourceExpr::parse("web-abc123").unwrap();
        assert_eq!(e.namespace, None);
        assert_eq!(e.kind, WorkloadKind::Pod);
        assert!(e.name.matches("web-abc123"));
        assert!(e.container.is_none());
    }

    #[test]
    fn namespace_and_kind() {
        let e = SourceExpr::parse("prod:deployments/web").unwrap();
        assert_eq!(e.namespace, Some(NamespaceSelector::Exact("prod".into())));
        assert_eq!(e.kind, WorkloadKind::Deployment);
        assert_eq!(e.name.as_exact(), Some("web"));
    }

    #[test]
    fn short_names_parse() {
        assert_eq!(SourceExpr::parse("ns:deploy/web").unwrap().kind, WorkloadKind::Deployment);
        assert_eq!(SourceExpr::parse("ns:sts/db").unwrap().kind, WorkloadKind::StatefulSet);
        assert_eq!(SourceExpr::parse("ns:cj/backup").unwrap().kind, WorkloadKind::CronJob);
    }

    #[test]
    fn container_suffix() {
        let e = SourceExpr::parse("prod:deployments/web/nginx").unwrap();
        assert!(e.selects_container("nginx"));
        assert!(!e.selects_container("sidecar"));

        // `*` container is the same as no restriction
        let e = SourceExpr::parse("prod:deployments/web/*").unwrap();
        assert!(e.container.is_none());
    }

    #[test]
    fn pod_with_container_without_kind() {
        let e = SourceExpr::parse("web-abc/nginx").unwrap();
        assert_eq!(e.kind, WorkloadKind::Pod);
        assert_eq!(e.name.as_exact(), Some("web-abc"));
        assert!(e.selects_container("nginx"));
    }

    #[test]
    fn namespace_wildcards() {
        let e = SourceExpr::parse("*:deployments/web").unwrap();
        assert_eq!(e.namespace, Some(NamespaceSelector::Any));

        let e = SourceExpr::parse("staging:*").unwrap();
        assert_eq!(e.kind, WorkloadKind::Pod);
        assert!(e.name.is_match_all());
    }

    #[test]
    fn name_globs() {
        let e = SourceExpr::parse("ns:deployments/web-*").unwrap();
        assert!(e.name.matches("web-frontend"));
        assert!(!e.name.matches("api"));
    }

    #[test]
    fn kind_wildcard_name() {
        let e = SourceExpr::parse("ns:cronjobs/*").unwrap();
        assert_eq!(e.kind, WorkloadKind::CronJob);
        assert!(e.name.is_match_all());
    }

    #[test]
    fn rejects_malformed() {
        assert!(SourceExpr::parse("").is_err());
        assert!(SourceExpr::parse(":pod").is_err());
        assert!(SourceExpr::parse("ns:").is_err());
        assert!(SourceExpr::parse("ns:widgets/x/y").is_err());
        assert!(SourceExpr::parse("a/b/c/d").is_err());
    }
}
