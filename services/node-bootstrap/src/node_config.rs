//! Turning a provisioned instance into a worker node.
//!
//! [`NodeConfig`] holds everything needed to bootstrap one instance and runs
//! the sequence:
//!
//! 1. the remote agent configures the instance (kubelet and prerequisites)
//! 2. the Node object registered by the kubelet is located
//! 3. node networking is configured (see [`crate::network`])
//! 4. the Node is re-read, stamped with the version and public key
//!    fingerprint annotations, and committed in a single update

use std::path::PathBuf;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use nodecfg_networking::{validate_cidr, OverlayPort};
use nodecfg_reconcile::PollConfig;
use tracing::{info, instrument};

use crate::agent::{AgentConnector, AgentParams, RemoteAgent};
use crate::annotations::{PUB_KEY_HASH_ANNOTATION, VERSION_ANNOTATION};
use crate::cni::DEFAULT_CNI_TEMPLATE_PATH;
use crate::endpoint::EndpointCache;
use crate::error::{BootstrapError, Stage};
use crate::fingerprint::public_key_fingerprint;
use crate::identity::{find_node, InstanceIdentity};
use crate::network::{NetworkConfigurator, NetworkContext};
use crate::store::ClusterStore;

/// Tunables for a bootstrap run.
#[derive(Debug, Clone)]
pub struct NodeConfigOptions {
    /// Interval and timeout for every wait.
    pub poll: PollConfig,

    /// Location of the CNI config template.
    pub cni_template: PathBuf,

    /// Version stamped on the node.
    pub version: String,
}

impl Default for NodeConfigOptions {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            cni_template: PathBuf::from(DEFAULT_CNI_TEMPLATE_PATH),
            version: crate::version().to_string(),
        }
    }
}

/// Bootstrap state for one instance.
pub struct NodeConfig {
    store: Arc<dyn ClusterStore>,
    agent: Arc<dyn RemoteAgent>,
    /// Cached copy of the Node; re-fetched before it is relied on.
    node: Option<Node>,
    network: NetworkContext,
    public_key_hash: String,
    options: NodeConfigOptions,
}

impl NodeConfig {
    /// Validate prerequisites and derive the agent handle for an instance.
    ///
    /// Resolves the worker join endpoint through `endpoints`, which is shared
    /// by all workers in the process and only discovers once.
    pub async fn new(
        store: Arc<dyn ClusterStore>,
        connector: &dyn AgentConnector,
        endpoints: &EndpointCache,
        identity: InstanceIdentity,
        service_cidr: &str,
        overlay_port: OverlayPort,
        options: NodeConfigOptions,
    ) -> Result<Self, BootstrapError> {
        let service_cidr =
            validate_cidr(service_cidr).map_err(|source| BootstrapError::InvalidCidr {
                cidr: service_cidr.to_string(),
                source,
            })?;

        let public_key_hash = public_key_fingerprint(&identity.public_key)?;

        let join_endpoint = endpoints.resolve(store.as_ref()).await?.to_string();
        let instance_id = identity.instance_id.clone();

        let agent = connector
            .connect(AgentParams {
                identity,
                join_endpoint,
                overlay_port,
            })
            .map_err(|source| BootstrapError::RemoteAgent {
                operation: "connect",
                instance_id,
                source,
            })?;

        Ok(Self {
            store,
            agent,
            node: None,
            network: NetworkContext::new(service_cidr, overlay_port),
            public_key_hash,
            options,
        })
    }

    /// Instance ID of the instance being bootstrapped.
    pub fn instance_id(&self) -> &str {
        self.agent.id()
    }

    /// Cached Node, once resolved.
    pub fn node(&self) -> Option<&Node> {
        self.node.as_ref()
    }

    /// Network parameters.
    pub fn network(&self) -> &NetworkContext {
        &self.network
    }

    /// Fingerprint of the instance's public key.
    pub fn public_key_hash(&self) -> &str {
        &self.public_key_hash
    }

    /// Run the full bootstrap sequence.
    #[instrument(name = "nodecfg", skip(self), fields(instance_id = %self.agent.id()))]
    pub async fn configure(&mut self) -> Result<(), BootstrapError> {
        let instance_id = self.instance_id().to_string();

        self.agent
            .configure()
            .await
            .map_err(|source| BootstrapError::RemoteAgent {
                operation: "configure the instance",
                instance_id: instance_id.clone(),
                source,
            })
            .map_err(|e| e.in_stage(Stage::ConfigureInstance, &instance_id))?;

        let node = find_node(self.store.as_ref(), &instance_id, self.options.poll)
            .await
            .map_err(|e| e.in_stage(Stage::ResolveNode, &instance_id))?;
        let node = self.node.insert(node);

        NetworkConfigurator::new(
            self.store.as_ref(),
            self.agent.as_ref(),
            node,
            &mut self.network,
            &self.options.cni_template,
            self.options.poll,
        )
        .run()
        .await
        .map_err(|e| e.in_stage(Stage::ConfigureNetwork, &instance_id))?;

        self.finalize()
            .await
            .map_err(|e| e.in_stage(Stage::Finalize, &instance_id))?;

        info!("Instance configured as a worker node");
        Ok(())
    }

    /// Re-read the node, stamp both annotations and commit them together.
    async fn finalize(&mut self) -> Result<(), BootstrapError> {
        let mut node = find_node(self.store.as_ref(), self.agent.id(), self.options.poll).await?;

        let annotations = node.annotations_mut();
        annotations.insert(VERSION_ANNOTATION.to_string(), self.options.version.clone());
        annotations.insert(
            PUB_KEY_HASH_ANNOTATION.to_string(),
            self.public_key_hash.clone(),
        );

        let name = node.name_any();
        let committed = self.store.replace_node(&node).await.map_err(|source| {
            if source.is_conflict() {
                BootstrapError::UpdateConflict {
                    node: name.clone(),
                    source,
                }
            } else {
                BootstrapError::Store {
                    operation: format!("updating annotations on node {}", name),
                    source,
                }
            }
        })?;

        info!(
            node = %name,
            version = %self.options.version,
            "Node annotated"
        );
        self.node = Some(committed);
        Ok(())
    }
}
