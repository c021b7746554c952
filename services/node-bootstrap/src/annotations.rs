//! Well-known node labels and annotations, and the annotation handshake.
//!
//! The network-fabric controller signals progress by writing annotations on
//! the Node object. There is no push channel: we re-fetch the Node until the
//! awaited key shows up.

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use nodecfg_reconcile::{poll_until, CheckError, Poll, PollConfig, PollError};
use tracing::info;

use crate::error::BootstrapError;
use crate::store::{ClusterStore, StoreError};

/// Host subnet assigned to the node by the cluster network operator.
pub const HYBRID_OVERLAY_SUBNET: &str = "k8s.ovn.org/hybrid-overlay-node-subnet";

/// Distributed router gateway MAC, written by the hybrid overlay once it runs.
pub const HYBRID_OVERLAY_MAC: &str = "k8s.ovn.org/hybrid-overlay-distributed-router-gateway-mac";

/// Label selector identifying nodes bootstrapped by this system.
pub const WINDOWS_OS_LABEL: &str = "node.openshift.io/os_id=Windows";

/// Version of the orchestrator that configured the node.
pub const VERSION_ANNOTATION: &str = "windowsmachineconfig.openshift.io/version";

/// Fingerprint of the public key present on the instance.
pub const PUB_KEY_HASH_ANNOTATION: &str = "windowsmachineconfig.openshift.io/pub-key-hash";

/// Poll until node `node_name` carries annotation `key`, returning the fresh
/// copy of the node that has it.
///
/// Fetch failures are transient.
pub async fn wait_for_annotation(
    store: &dyn ClusterStore,
    node_name: &str,
    key: &str,
    poll: PollConfig,
) -> Result<Node, BootstrapError> {
    let awaiting = format!("{} annotation on node {}", key, node_name);

    let result = poll_until(poll, awaiting, || async {
        let node = store
            .get_node(node_name)
            .await
            .map_err(CheckError::Transient)?;

        if node.annotations().contains_key(key) {
            Ok(Poll::Ready(node))
        } else {
            Ok::<_, CheckError<StoreError>>(Poll::Pending)
        }
    })
    .await;

    match result {
        Ok(node) => {
            info!(node = node_name, annotation = key, "Node annotation present");
            Ok(node)
        }
        Err(PollError::Timeout { awaiting, elapsed }) => {
            Err(BootstrapError::Timeout { awaiting, elapsed })
        }
        Err(PollError::Fatal { awaiting, source }) => Err(BootstrapError::Store {
            operation: format!("waiting for {}", awaiting),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::store::MemoryStore;

    fn store_with_node(annotations: &[(&str, &str)]) -> MemoryStore {
        let store = MemoryStore::new();
        store.insert_node(Node {
            metadata: ObjectMeta {
                name: Some("winhost-1".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        });
        store
    }

    fn poll() -> PollConfig {
        PollConfig::new(Duration::from_secs(1), Duration::from_secs(10))
    }

    #[tokio::test(start_paused = true)]
    async fn test_present_on_first_fetch() {
        let store = store_with_node(&[(HYBRID_OVERLAY_SUBNET, "10.132.1.0/24")]);
        let start = tokio::time::Instant::now();

        let node = wait_for_annotation(&store, "winhost-1", HYBRID_OVERLAY_SUBNET, poll())
            .await
            .unwrap();

        assert_eq!(
            node.annotations().get(HYBRID_OVERLAY_SUBNET).map(String::as_str),
            Some("10.132.1.0/24")
        );
        assert_eq!(store.node_reads("winhost-1"), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_appears_after_n_polls() {
        let store = store_with_node(&[]);
        store.schedule_annotation("winhost-1", HYBRID_OVERLAY_MAC, "0a:58:0a:84:01:01", 3);

        let node = wait_for_annotation(&store, "winhost-1", HYBRID_OVERLAY_MAC, poll())
            .await
            .unwrap();

        assert_eq!(store.node_reads("winhost-1"), 4);
        assert_eq!(
            node.metadata.resource_version,
            store.node("winhost-1").unwrap().metadata.resource_version
        );
        assert!(node.annotations().contains_key(HYBRID_OVERLAY_MAC));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_names_key_and_node() {
        let store = store_with_node(&[]);

        let err = wait_for_annotation(&store, "winhost-1", HYBRID_OVERLAY_MAC, poll())
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        let message = err.to_string();
        assert!(message.contains(HYBRID_OVERLAY_MAC));
        assert!(message.contains("winhost-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_node_is_transient() {
        let store = MemoryStore::new();

        let err = wait_for_annotation(&store, "winhost-1", HYBRID_OVERLAY_SUBNET, poll())
            .await
            .unwrap_err();

        assert!(matches!(err, BootstrapError::Timeout { .. }));
    }
}
