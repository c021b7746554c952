//! Error types for node bootstrap.
//!
//! Every failure is wrapped with the operation and the node or instance it
//! concerns at each propagation boundary, so `Display` plus the `source()`
//! chain reads as a causal story from "what the caller asked for" down to
//! "what actually broke".

use std::fmt;
use std::time::Duration;

use nodecfg_networking::NetworkError;
use thiserror::Error;

use crate::cni::CniError;
use crate::network::NetworkStep;
use crate::store::StoreError;

/// Top-level phases of [`NodeConfig::configure`](crate::NodeConfig::configure).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// The remote agent configures the instance as a node.
    ConfigureInstance,
    /// The Node object for the instance is located.
    ResolveNode,
    /// Overlay, CNI and proxy configuration.
    ConfigureNetwork,
    /// Re-fetch, annotate and commit the Node.
    Finalize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::ConfigureInstance => "configuring the instance",
            Stage::ResolveNode => "resolving the node object",
            Stage::ConfigureNetwork => "configuring node network",
            Stage::Finalize => "finalizing the node",
        };
        f.write_str(s)
    }
}

/// Node bootstrap errors.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// The service CIDR handed to the constructor is malformed.
    #[error("invalid service CIDR '{cidr}'")]
    InvalidCidr {
        cidr: String,
        #[source]
        source: NetworkError,
    },

    /// The host subnet annotation on a node is malformed.
    #[error("invalid host subnet '{subnet}' on node {node}")]
    InvalidHostSubnet {
        node: String,
        subnet: String,
        #[source]
        source: NetworkError,
    },

    /// Malformed input that must not be retried (e.g., an API server URL
    /// with an unexpected hostname).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The cluster did not describe itself the way we need.
    #[error("cluster discovery failed: {0}")]
    Discovery(String),

    /// A poll exhausted its time budget.
    #[error("timeout after {elapsed:?} waiting for {awaiting}")]
    Timeout { awaiting: String, elapsed: Duration },

    /// No Node object matched the instance within the time budget.
    #[error(
        "unable to find node for instance {instance_id} after {elapsed:?} \
         ({candidates} candidate nodes in last listing)"
    )]
    NodeNotFound {
        instance_id: String,
        candidates: usize,
        elapsed: Duration,
    },

    /// The remote configuration agent failed.
    #[error("remote agent failed to {operation} on instance {instance_id}")]
    RemoteAgent {
        operation: &'static str,
        instance_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// The cluster rejected a Node update because the object changed.
    #[error("update of node {node} was rejected")]
    UpdateConflict {
        node: String,
        #[source]
        source: StoreError,
    },

    /// Any other cluster API failure.
    #[error("cluster request failed while {operation}")]
    Store {
        operation: String,
        #[source]
        source: StoreError,
    },

    /// CNI config artifact could not be produced.
    #[error(transparent)]
    Cni(#[from] CniError),

    /// A network configuration step failed.
    #[error("{step} failed for node {node}")]
    Step {
        step: NetworkStep,
        node: String,
        #[source]
        source: Box<BootstrapError>,
    },

    /// A bootstrap stage failed.
    #[error("{stage} failed for instance {instance_id}")]
    Stage {
        stage: Stage,
        instance_id: String,
        #[source]
        source: Box<BootstrapError>,
    },
}

impl BootstrapError {
    /// Wrap `self` as the failure of a network step.
    pub(crate) fn in_step(self, step: NetworkStep, node: &str) -> Self {
        Self::Step {
            step,
            node: node.to_string(),
            source: Box::new(self),
        }
    }

    /// Wrap `self` as the failure of a bootstrap stage.
    pub(crate) fn in_stage(self, stage: Stage, instance_id: &str) -> Self {
        Self::Stage {
            stage,
            instance_id: instance_id.to_string(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through step and stage wrappers.
    pub fn root(&self) -> &BootstrapError {
        match self {
            Self::Step { source, .. } | Self::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// The network step that failed, if any.
    pub fn failed_step(&self) -> Option<NetworkStep> {
        match self {
            Self::Step { step, .. } => Some(*step),
            Self::Stage { source, .. } => source.failed_step(),
            _ => None,
        }
    }

    /// The bootstrap stage that failed, if any.
    pub fn failed_stage(&self) -> Option<Stage> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Returns true if the root cause is a poll running out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.root(),
            Self::Timeout { .. } | Self::NodeNotFound { .. }
        )
    }

    /// Returns true if the root cause is a validation failure.
    pub fn is_validation(&self) -> bool {
        matches!(
            self.root(),
            Self::Validation(_) | Self::InvalidCidr { .. } | Self::InvalidHostSubnet { .. }
        )
    }
}
