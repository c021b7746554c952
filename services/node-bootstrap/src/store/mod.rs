//! Cluster state store interface.
//!
//! The store abstracts the cluster API calls the orchestrator needs:
//! - Listing and fetching Node objects
//! - Replacing a Node under optimistic concurrency
//! - Reading the cluster infrastructure descriptor
//!
//! An in-memory implementation is provided for testing and development.

pub mod kubernetes;
pub mod memory;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use thiserror::Error;

pub use self::kubernetes::KubeStore;
pub use self::memory::MemoryStore;

/// Cluster store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested object does not exist.
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// The object changed since it was read.
    #[error("conflict on {kind} {name}: {message}")]
    Conflict {
        kind: &'static str,
        name: String,
        message: String,
    },

    /// Any other API failure.
    #[error("cluster API error: {0}")]
    Api(String),
}

impl StoreError {
    /// Returns true if the write lost an optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns true if the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Cluster API operations used during bootstrap.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// List Nodes matching a label selector (e.g., `key=value`).
    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<Node>, StoreError>;

    /// Fetch a Node by name.
    async fn get_node(&self, name: &str) -> Result<Node, StoreError>;

    /// Replace a Node. Fails with [`StoreError::Conflict`] if its
    /// resourceVersion is no longer current.
    async fn replace_node(&self, node: &Node) -> Result<Node, StoreError>;

    /// The API server's cluster-internal URL from the infrastructure
    /// descriptor, or `None` if the descriptor does not carry one.
    async fn api_server_internal_url(&self) -> Result<Option<String>, StoreError>;
}
