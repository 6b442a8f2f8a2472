use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cursor::TailCursor;

/// How much history a stream replays before (optionally) following.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamMode {
    /// Oldest-first from `since`, capped at N records.
    Head(u64),
    /// Newest-first from `until`, capped at N records; delivered to the
    /// caller oldest-first within the block.
    Tail(u64),
    /// Head with no cap.
    All,
}

impl StreamMode {
    pub fn is_backward(&self) -> bool {
        matches!(self, StreamMode::Tail(_))
    }

    /// Record cap, `None` for unbounded.
    pub fn limit(&self) -> Option<u64> {
        match self {
            StreamMode::Head(n) | StreamMode::Tail(n) => Some(*n),
            StreamMode::All => None,
        }
    }
}

impl fmt::Display for StreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamMode::Head(n) => write!(f, "head({n})"),
            StreamMode::Tail(n) => write!(f, "tail({n})"),
            StreamMode::All => write!(f, "all"),
        }
    }
}

/// Direction one fetcher call walks through time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchDirection {
    #[default]
    Forward,
    Backward,
}

/// What one fetcher call requests for one endpoint.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub start_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
    /// Raw pattern, forwarded to fetchers that compile it server-side. The
    /// merger holds the compiled form for client-side filtering.
    pub grep: Option<String>,
    pub limit: Option<u64>,
    pub direction: FetchDirection,
    pub follow: bool,
    /// Replay state for resuming a backward page (see the back-scan cursor).
    pub tail_cursor: Option<TailCursor>,
    /// Enables mock-cluster hooks (the `fake logs` sentinel line). Never set
    /// on live traffic.
    pub test_hooks: bool,
}

/// What a fetcher executes server-side; the merger consults this record
/// instead of introspecting the implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchCapabilities {
    pub server_side_grep: bool,
    pub backward: bool,
    pub follow: bool,
}

/// Which fetcher implementation a stream ended up on; surfaced in responses
/// for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetcherTag {
    Agent,
    ClusterApi,
    Kube,
}

impl FetcherTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetcherTag::Agent => "agent",
            FetcherTag::ClusterApi => "cluster-api",
            FetcherTag::Kube => "kube",
        }
    }
}

impl fmt::Display for FetcherTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
