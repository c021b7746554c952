//! Worker join endpoint discovery.
//!
//! Instances fetch their worker configuration from the machine config
//! server, reachable on the cluster-internal API hostname. The hostname is
//! read once from the cluster infrastructure descriptor and then cached for
//! the life of the process.

use reqwest::Url;
use tokio::sync::OnceCell;
use tracing::info;

use crate::error::BootstrapError;
use crate::store::ClusterStore;

/// Required prefix of the internal API server hostname.
pub const API_INT_PREFIX: &str = "api-int.";

/// Port of the machine config server.
pub const WORKER_JOIN_PORT: u16 = 22623;

/// Path serving the worker configuration.
pub const WORKER_JOIN_PATH: &str = "/config/worker";

/// Hostname of an internal API server URL.
///
/// `https://api-int.abc.devcluster.example.com:6443` yields
/// `api-int.abc.devcluster.example.com`. Any hostname not starting with
/// `api-int.` as written is rejected; `Url` lowercases hosts, so the prefix
/// is checked against the original text.
pub fn cluster_address(api_server_url: &str) -> Result<String, BootstrapError> {
    Url::parse(api_server_url).map_err(|e| {
        BootstrapError::Validation(format!(
            "unable to parse API server URL '{}': {}",
            api_server_url, e
        ))
    })?;

    let host = host_as_written(api_server_url);
    if !host.starts_with(API_INT_PREFIX) {
        return Err(BootstrapError::Validation(format!(
            "invalid API server URL {}: expected hostname to start with `{}`",
            api_server_url, API_INT_PREFIX
        )));
    }

    Ok(host.to_string())
}

/// Host portion of a URL that has already parsed, without normalization.
fn host_as_written(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    host_port.split(':').next().unwrap_or_default()
}

/// Worker join endpoint for a cluster address.
pub fn worker_join_endpoint(cluster_address: &str) -> String {
    format!(
        "https://{}:{}{}",
        cluster_address, WORKER_JOIN_PORT, WORKER_JOIN_PATH
    )
}

/// Write-once cache of the worker join endpoint.
///
/// Share one instance (behind an `Arc`) across every bootstrap worker in the
/// process. Concurrent first callers are serialized: discovery runs once and
/// every caller sees its result. A failed discovery is not cached, so the
/// next caller tries again. Once populated the value never changes.
#[derive(Debug, Default)]
pub struct EndpointCache {
    endpoint: OnceCell<String>,
}

impl EndpointCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached endpoint, if discovery has succeeded.
    pub fn get(&self) -> Option<&str> {
        self.endpoint.get().map(String::as_str)
    }

    /// The cached endpoint, discovering it through `store` on first use.
    pub async fn resolve(&self, store: &dyn ClusterStore) -> Result<&str, BootstrapError> {
        self.endpoint
            .get_or_try_init(|| discover(store))
            .await
            .map(String::as_str)
    }
}

async fn discover(store: &dyn ClusterStore) -> Result<String, BootstrapError> {
    let url = store
        .api_server_internal_url()
        .await
        .map_err(|source| BootstrapError::Store {
            operation: "reading the cluster infrastructure descriptor".to_string(),
            source,
        })?
        .ok_or_else(|| {
            BootstrapError::Discovery(
                "cluster infrastructure descriptor has no internal API server URL".to_string(),
            )
        })?;

    let endpoint = worker_join_endpoint(&cluster_address(&url)?);
    info!(endpoint = %endpoint, "Discovered worker join endpoint");
    Ok(endpoint)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_cluster_address() {
        assert_eq!(
            cluster_address("https://api-int.abc.devcluster.example.com:6443").unwrap(),
            "api-int.abc.devcluster.example.com"
        );
        assert_eq!(
            cluster_address("https://api-int.c1.example.org").unwrap(),
            "api-int.c1.example.org"
        );
        assert_eq!(
            cluster_address("https://admin@api-int.c1.example.org:6443/healthz?x=1").unwrap(),
            "api-int.c1.example.org"
        );
    }

    #[test]
    fn test_cluster_address_rejects_other_hosts() {
        for url in [
            "https://api.abc.devcluster.example.com:6443",
            "https://10.0.0.1:6443",
            "https://my-api-int.example.com:6443",
            "https://API-INT.abc.devcluster.example.com:6443",
            "https://Api-Int.abc.devcluster.example.com:6443",
            "not a url",
        ] {
            let err = cluster_address(url).unwrap_err();
            assert!(err.is_validation(), "{url} should be a validation error");
        }
    }

    #[test]
    fn test_worker_join_endpoint() {
        assert_eq!(
            worker_join_endpoint("api-int.abc.example.com"),
            "https://api-int.abc.example.com:22623/config/worker"
        );
    }

    #[tokio::test]
    async fn test_resolve_caches_first_success() {
        let store = MemoryStore::new().with_internal_url("https://api-int.c1.example.com:6443");
        let cache = EndpointCache::new();
        assert!(cache.get().is_none());

        let first = cache.resolve(&store).await.unwrap().to_string();
        let second = cache.resolve(&store).await.unwrap().to_string();

        assert_eq!(first, "https://api-int.c1.example.com:22623/config/worker");
        assert_eq!(first, second);
        assert_eq!(cache.get(), Some(first.as_str()));
        assert_eq!(store.infrastructure_reads(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_resolution_discovers_once() {
        let store = Arc::new(
            MemoryStore::new().with_internal_url("https://api-int.c1.example.com:6443"),
        );
        let cache = Arc::new(EndpointCache::new());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.resolve(&*store).await.map(str::to_string)
            }));
        }
        for handle in handles {
            assert_eq!(
                handle.await.unwrap().unwrap(),
                "https://api-int.c1.example.com:22623/config/worker"
            );
        }

        assert_eq!(store.infrastructure_reads(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = EndpointCache::new();

        let missing = MemoryStore::new();
        let err = cache.resolve(&missing).await.unwrap_err();
        assert!(matches!(err, BootstrapError::Discovery(_)));

        let bad_host = MemoryStore::new().with_internal_url("https://api.c1.example.com:6443");
        assert!(cache.resolve(&bad_host).await.unwrap_err().is_validation());
        assert!(cache.get().is_none());

        let good = MemoryStore::new().with_internal_url("https://api-int.c1.example.com:6443");
        assert!(cache.resolve(&good).await.is_ok());
    }
}
