use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tracing::{debug, info};

use kubetail_core::{FetchCapabilities, FetcherTag};

use crate::{AgentFetcher, ClusterApiFetcher, KubeApiFetcher, LogFetcher};

/// How long each discovery probe may take before the selector moves on.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Probes for the most capable fetcher and falls back level by level; the
/// Kube-API fetcher is the guaranteed floor. `need` lists capabilities the
/// stream cannot do without (e.g. follow), skipping candidates that lack
/// them. Selection happens once per stream.
pub async fn select_fetcher(
    client: &Client,
    need: FetchCapabilities,
) -> (Arc<dyn LogFetcher>, FetcherTag) {
    match tokio::time::timeout(DISCOVERY_TIMEOUT, AgentFetcher::discover(client, DISCOVERY_TIMEOUT))
        .await
    {
        Ok(Ok(agent)) if satisfies(agent.capabilities(), need) => {
            info!(fetcher = %FetcherTag::Agent, "fetcher selected");
            return (Arc::new(agent), FetcherTag::Agent);
        }
        Ok(Ok(_)) => debug!("agent found but lacks required capabilities"),
        Ok(Err(e)) => debug!(error = %e, "agent discovery failed"),
        Err(_) => debug!("agent discovery timed out"),
    }

    match ClusterApiFetcher::discover(client, DISCOVERY_TIMEOUT).await {
        Ok(proxy) if satisfies(proxy.capabilities(), need) => {
            info!(fetcher = %FetcherTag::ClusterApi, "fetcher selected");
            return (Arc::new(proxy), FetcherTag::ClusterApi);
        }
        Ok(_) => debug!("cluster API found but lacks required capabilities"),
        Err(e) => debug!(error = %e, "cluster API discovery failed"),
    }

    info!(fetcher = %FetcherTag::Kube, "fetcher selected (fallback)");
    (Arc::new(KubeApiFetcher::new(client.clone())), FetcherTag::Kube)
}

fn satisfies(have: FetchCapabilities, need: FetchCapabilities) -> bool {
    (!need.server_side_grep || have.server_side_grep)
        && (!need.backward || have.backward)
        && (!need.follow || have.follow)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_superset_check() {
        let all = FetchCapabilities { server_side_grep: true, backward: true, follow: true };
        let none = FetchCapabilities::default();
        let follow_only = FetchCapabilities { follow: true, ..Default::default() };
        assert!(satisfies(all, follow_only));
        assert!(satisfies(all, none));
        assert!(!satisfies(none, follow_only));
        assert!(satisfies(none, none));
    }
}
