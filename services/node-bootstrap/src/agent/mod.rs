//! Remote configuration agent interface.
//!
//! The agent runs against the instance itself and performs the host-level
//! work the orchestrator cannot: installing and starting the kubelet,
//! configuring the hybrid overlay, laying down CNI config, and starting
//! kube-proxy. It is opaque to the orchestrator; its errors are passed
//! through with context added.
//!
//! Implementations:
//! - [`CommandAgent`]: delegates each capability to a helper executable
//! - [`MockAgent`]: records calls and injects faults, for tests

mod command;
mod mock;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use nodecfg_networking::OverlayPort;

use crate::identity::InstanceIdentity;

pub use command::{CommandAgent, CommandConnector};
pub use mock::{AgentCall, AgentOp, MockAgent, MockConnector};

/// Capabilities of the agent configuring one instance.
#[async_trait]
pub trait RemoteAgent: Send + Sync {
    /// Cloud instance ID of the instance this agent configures.
    fn id(&self) -> &str;

    /// Configure the instance as a node (kubelet and its prerequisites).
    async fn configure(&self) -> Result<()>;

    /// Configure the hybrid overlay for the given node.
    async fn configure_hybrid_overlay(&self, node_name: &str) -> Result<()>;

    /// Apply the CNI config at `config_path` (a local file).
    async fn configure_cni(&self, config_path: &Path) -> Result<()>;

    /// Start kube-proxy for the given node and host subnet.
    async fn configure_kube_proxy(&self, node_name: &str, host_subnet: &str) -> Result<()>;
}

/// Everything needed to derive an agent handle for an instance.
#[derive(Debug, Clone)]
pub struct AgentParams {
    /// Instance being configured.
    pub identity: InstanceIdentity,

    /// Endpoint the instance fetches its worker configuration from.
    pub join_endpoint: String,

    /// Overlay transport port.
    pub overlay_port: OverlayPort,
}

/// Derives agent handles.
pub trait AgentConnector: Send + Sync {
    /// Build the agent for one instance.
    fn connect(&self, params: AgentParams) -> Result<Arc<dyn RemoteAgent>>;
}
