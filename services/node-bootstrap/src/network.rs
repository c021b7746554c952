//! Node network configuration.
//!
//! Networking is brought up as a strictly ordered sequence of steps, gated
//! on annotations written by the network-fabric controller:
//!
//! ```text
//! AwaitSubnet ─▶ ConfigureOverlay ─▶ AwaitMac ─▶ ConfigureCni ─▶ ConfigureProxy
//! ```
//!
//! Each step has its own transition function. The first failure aborts the
//! sequence and is returned wrapped with the step and node name; retrying
//! the whole bootstrap is the caller's decision.

use std::fmt;
use std::path::Path;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use nodecfg_networking::{Cidr, NetworkError, OverlayPort};
use nodecfg_reconcile::PollConfig;
use tracing::{debug, info};

use crate::agent::RemoteAgent;
use crate::annotations::{wait_for_annotation, HYBRID_OVERLAY_MAC, HYBRID_OVERLAY_SUBNET};
use crate::cni;
use crate::error::BootstrapError;
use crate::store::ClusterStore;

/// A step of network configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStep {
    /// Wait for the host subnet annotation.
    AwaitSubnet,
    /// Configure the hybrid overlay on the instance.
    ConfigureOverlay,
    /// Wait for the overlay MAC annotation.
    AwaitMac,
    /// Render the CNI config and apply it on the instance.
    ConfigureCni,
    /// Start kube-proxy on the instance.
    ConfigureProxy,
}

impl NetworkStep {
    /// First step of the sequence.
    pub const FIRST: NetworkStep = NetworkStep::AwaitSubnet;

    /// The step that follows this one, or `None` after the last.
    pub fn next(self) -> Option<NetworkStep> {
        match self {
            NetworkStep::AwaitSubnet => Some(NetworkStep::ConfigureOverlay),
            NetworkStep::ConfigureOverlay => Some(NetworkStep::AwaitMac),
            NetworkStep::AwaitMac => Some(NetworkStep::ConfigureCni),
            NetworkStep::ConfigureCni => Some(NetworkStep::ConfigureProxy),
            NetworkStep::ConfigureProxy => None,
        }
    }
}

impl fmt::Display for NetworkStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkStep::AwaitSubnet => "waiting for hybrid overlay subnet",
            NetworkStep::ConfigureOverlay => "configuring hybrid overlay",
            NetworkStep::AwaitMac => "waiting for hybrid overlay MAC",
            NetworkStep::ConfigureCni => "configuring CNI",
            NetworkStep::ConfigureProxy => "starting kube-proxy",
        };
        f.write_str(s)
    }
}

/// Network parameters of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkContext {
    host_subnet: Option<Cidr>,
    service_cidr: Cidr,
    overlay_port: OverlayPort,
}

impl NetworkContext {
    /// Create a context; the host subnet is learned later.
    pub fn new(service_cidr: Cidr, overlay_port: OverlayPort) -> Self {
        Self {
            host_subnet: None,
            service_cidr,
            overlay_port,
        }
    }

    /// Record the host subnet read from the node.
    pub fn set_host_subnet(&mut self, subnet: &str) -> Result<Cidr, NetworkError> {
        let cidr = Cidr::from_cidr(subnet)?;
        self.host_subnet = Some(cidr);
        Ok(cidr)
    }

    /// Host subnet, once the subnet handshake has completed.
    pub fn host_subnet(&self) -> Option<&Cidr> {
        self.host_subnet.as_ref()
    }

    /// Cluster service CIDR.
    pub fn service_cidr(&self) -> &Cidr {
        &self.service_cidr
    }

    /// Overlay transport port.
    pub fn overlay_port(&self) -> OverlayPort {
        self.overlay_port
    }
}

/// Drives the network steps for one node.
///
/// Borrows the caller's cached node so that every handshake leaves it
/// holding the freshest copy seen.
pub struct NetworkConfigurator<'a> {
    store: &'a dyn ClusterStore,
    agent: &'a dyn RemoteAgent,
    node: &'a mut Node,
    network: &'a mut NetworkContext,
    cni_template: &'a Path,
    poll: PollConfig,
}

impl<'a> NetworkConfigurator<'a> {
    /// Create a configurator.
    pub fn new(
        store: &'a dyn ClusterStore,
        agent: &'a dyn RemoteAgent,
        node: &'a mut Node,
        network: &'a mut NetworkContext,
        cni_template: &'a Path,
        poll: PollConfig,
    ) -> Self {
        Self {
            store,
            agent,
            node,
            network,
            cni_template,
            poll,
        }
    }

    /// Run every step in order, stopping at the first failure.
    pub async fn run(mut self) -> Result<(), BootstrapError> {
        let node_name = self.node.name_any();
        let mut step = Some(NetworkStep::FIRST);

        while let Some(current) = step {
            debug!(node = %node_name, step = %current, "Running network step");
            self.transition(current)
                .await
                .map_err(|e| e.in_step(current, &node_name))?;
            step = current.next();
        }

        info!(node = %node_name, "Node network configured");
        Ok(())
    }

    async fn transition(&mut self, step: NetworkStep) -> Result<(), BootstrapError> {
        match step {
            NetworkStep::AwaitSubnet => self.await_annotation(HYBRID_OVERLAY_SUBNET).await,
            NetworkStep::ConfigureOverlay => self.configure_overlay().await,
            NetworkStep::AwaitMac => self.await_annotation(HYBRID_OVERLAY_MAC).await,
            NetworkStep::ConfigureCni => self.configure_cni().await,
            NetworkStep::ConfigureProxy => self.configure_proxy().await,
        }
    }

    async fn await_annotation(&mut self, key: &str) -> Result<(), BootstrapError> {
        let name = self.node.name_any();
        *self.node = wait_for_annotation(self.store, &name, key, self.poll).await?;
        Ok(())
    }

    async fn configure_overlay(&mut self) -> Result<(), BootstrapError> {
        let name = self.node.name_any();
        self.agent
            .configure_hybrid_overlay(&name)
            .await
            .map_err(|source| self.agent_error("configure the hybrid overlay", source))
    }

    async fn configure_cni(&mut self) -> Result<(), BootstrapError> {
        let name = self.node.name_any();
        let subnet = self.subnet_annotation();
        let host_subnet = self.network.set_host_subnet(&subnet).map_err(|source| {
            BootstrapError::InvalidHostSubnet {
                node: name.clone(),
                subnet: subnet.clone(),
                source,
            }
        })?;

        let path = cni::materialize(self.network.service_cidr(), &host_subnet, self.cni_template)?;
        let result = self.agent.configure_cni(&path).await;
        cni::cleanup(&path);

        result.map_err(|source| self.agent_error("configure CNI", source))
    }

    async fn configure_proxy(&mut self) -> Result<(), BootstrapError> {
        let name = self.node.name_any();
        let subnet = self.subnet_annotation();
        self.agent
            .configure_kube_proxy(&name, &subnet)
            .await
            .map_err(|source| self.agent_error("start kube-proxy", source))
    }

    /// Host subnet annotation on the cached node. Present once the subnet
    /// handshake has passed.
    fn subnet_annotation(&self) -> String {
        self.node
            .annotations()
            .get(HYBRID_OVERLAY_SUBNET)
            .cloned()
            .unwrap_or_default()
    }

    fn agent_error(&self, operation: &'static str, source: anyhow::Error) -> BootstrapError {
        BootstrapError::RemoteAgent {
            operation,
            instance_id: self.agent.id().to_string(),
            source,
        }
    }
}
