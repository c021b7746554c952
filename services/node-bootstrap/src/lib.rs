//! nodecfg Node Bootstrap Library
//!
//! Turns a freshly provisioned instance into a Ready worker node. Three
//! independently operated systems are involved and none of them share a
//! transaction:
//!
//! - the cluster API server, which owns the Node objects
//! - a remote configuration agent acting on the instance
//! - the network-fabric controller, which annotates Nodes on its own schedule
//!
//! The orchestrator coordinates them with bounded polling and idempotent
//! updates.
//!
//! ## Flow
//!
//! ```text
//! NodeConfig::new       validate service CIDR, resolve join endpoint (once
//!                       per process), connect agent, fingerprint public key
//! NodeConfig::configure agent.configure
//!                       ─▶ find_node (poll Node list by instance ID)
//!                       ─▶ NetworkConfigurator (subnet ▸ overlay ▸ MAC ▸ CNI ▸ proxy)
//!                       ─▶ finalize (re-read, annotate, single replace)
//! ```
//!
//! ## Modules
//!
//! - `agent`: remote agent capabilities and implementations
//! - `store`: cluster API access (kube-rs and in-memory)
//! - `network`: the ordered network configuration steps
//! - `endpoint`: worker join endpoint discovery and cache

pub mod agent;
pub mod annotations;
pub mod cni;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod fingerprint;
pub mod identity;
pub mod network;
pub mod node_config;
pub mod store;

// Re-export commonly used types
pub use agent::{AgentConnector, RemoteAgent};
pub use endpoint::EndpointCache;
pub use error::BootstrapError;
pub use fingerprint::public_key_fingerprint;
pub use identity::{instance_id_from_provider_id, InstanceIdentity, Platform};
pub use node_config::{NodeConfig, NodeConfigOptions};
pub use store::ClusterStore;

/// Version of this build, stamped on configured nodes.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
