//! Instance identity and Node resolution.
//!
//! The kubelet on a freshly configured instance registers a Node object on
//! its own schedule. We find it by polling the Nodes carrying the
//! bootstrap label and matching the instance ID embedded in each Node's
//! cloud provider ID.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use nodecfg_reconcile::{poll_until, CheckError, Poll, PollConfig, PollError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::annotations::WINDOWS_OS_LABEL;
use crate::error::BootstrapError;
use crate::store::{ClusterStore, StoreError};

/// Cloud platform hosting the instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Aws,
    Azure,
    Gcp,
    Vsphere,
    #[default]
    None,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Platform::Aws => "AWS",
            Platform::Azure => "Azure",
            Platform::Gcp => "GCP",
            Platform::Vsphere => "VSphere",
            Platform::None => "None",
        };
        f.write_str(s)
    }
}

/// Identity of a provisioned instance. Read-only to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceIdentity {
    /// Cloud instance ID (e.g., `i-078285fdadccb2eaa`).
    pub instance_id: String,

    /// Address the agent reaches the instance on.
    pub ip_address: IpAddr,

    /// Name of the Machine the instance backs.
    pub machine_name: String,

    /// Hosting platform.
    #[serde(default)]
    pub platform: Platform,

    /// Public key installed on the instance, in authorized_keys format.
    pub public_key: String,
}

/// Instance ID from a cloud provider ID: the last `/`-separated segment.
///
/// `aws:///us-east-1e/i-078285fdadccb2eaa` yields `i-078285fdadccb2eaa`;
/// input without a separator is returned unchanged.
pub fn instance_id_from_provider_id(provider_id: &str) -> &str {
    provider_id
        .rsplit_once('/')
        .map_or(provider_id, |(_, id)| id)
}

/// Instance ID of a Node, if it has a provider ID.
fn node_instance_id(node: &Node) -> Option<&str> {
    node.spec
        .as_ref()
        .and_then(|spec| spec.provider_id.as_deref())
        .map(instance_id_from_provider_id)
}

/// Poll until a bootstrap-labelled Node with the given instance ID exists.
///
/// Listing failures are transient. If several Nodes claim the same
/// instance ID the first listed wins and a warning is logged.
pub async fn find_node(
    store: &dyn ClusterStore,
    instance_id: &str,
    poll: PollConfig,
) -> Result<Node, BootstrapError> {
    let last_candidates = AtomicUsize::new(0);

    let result = poll_until(poll, format!("node for instance {}", instance_id), || async {
        let nodes = store
            .list_nodes(WINDOWS_OS_LABEL)
            .await
            .map_err(CheckError::Transient)?;

        last_candidates.store(nodes.len(), Ordering::Relaxed);
        if nodes.is_empty() {
            debug!(instance_id, "Node listing returned no candidates");
            return Ok(Poll::Pending);
        }

        let mut matching = nodes
            .into_iter()
            .filter(|node| node_instance_id(node) == Some(instance_id));

        let Some(node) = matching.next() else {
            debug!(instance_id, "No candidate node matches instance");
            return Ok(Poll::Pending);
        };

        let duplicates: Vec<String> = matching.map(|n| n.name_any()).collect();
        if !duplicates.is_empty() {
            warn!(
                instance_id,
                node = %node.name_any(),
                ?duplicates,
                "Multiple nodes share an instance ID, using the first"
            );
        }

        Ok::<_, CheckError<StoreError>>(Poll::Ready(node))
    })
    .await;

    match result {
        Ok(node) => {
            info!(instance_id, node = %node.name_any(), "Found node for instance");
            Ok(node)
        }
        Err(PollError::Timeout { elapsed, .. }) => Err(BootstrapError::NodeNotFound {
            instance_id: instance_id.to_string(),
            candidates: last_candidates.load(Ordering::Relaxed),
            elapsed,
        }),
        Err(PollError::Fatal { awaiting, source }) => Err(BootstrapError::Store {
            operation: format!("waiting for {}", awaiting),
            source,
        }),
    }
}
