//! Mock agent for testing and development.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::info;

use super::{AgentConnector, AgentParams, RemoteAgent};

/// Agent capability, used to select where a fault is injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentOp {
    Configure,
    ConfigureHybridOverlay,
    ConfigureCni,
    ConfigureKubeProxy,
}

/// A recorded agent call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCall {
    Configure,
    ConfigureHybridOverlay {
        node_name: String,
    },
    ConfigureCni {
        path: PathBuf,
        /// File contents at call time, if the file was readable.
        contents: Option<String>,
    },
    ConfigureKubeProxy {
        node_name: String,
        host_subnet: String,
    },
}

impl AgentCall {
    /// The capability this call exercised.
    pub fn op(&self) -> AgentOp {
        match self {
            AgentCall::Configure => AgentOp::Configure,
            AgentCall::ConfigureHybridOverlay { .. } => AgentOp::ConfigureHybridOverlay,
            AgentCall::ConfigureCni { .. } => AgentOp::ConfigureCni,
            AgentCall::ConfigureKubeProxy { .. } => AgentOp::ConfigureKubeProxy,
        }
    }
}

/// Agent that records every call and optionally fails one capability.
#[derive(Debug)]
pub struct MockAgent {
    instance_id: String,
    fail_on: Option<AgentOp>,
    calls: Mutex<Vec<AgentCall>>,
}

impl MockAgent {
    /// Create a mock agent for `instance_id`.
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            fail_on: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Create a mock agent whose `op` capability always fails.
    pub fn failing_on(instance_id: impl Into<String>, op: AgentOp) -> Self {
        Self {
            fail_on: Some(op),
            ..Self::new(instance_id)
        }
    }

    /// Calls recorded so far, in order.
    pub fn calls(&self) -> Vec<AgentCall> {
        self.lock().clone()
    }

    /// Capabilities exercised so far, in order.
    pub fn ops(&self) -> Vec<AgentOp> {
        self.lock().iter().map(AgentCall::op).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<AgentCall>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: AgentCall) -> Result<()> {
        let op = call.op();
        info!(instance_id = %self.instance_id, ?call, "[MOCK] Agent call");
        self.lock().push(call);
        if self.fail_on == Some(op) {
            bail!("mock agent configured to fail {:?}", op);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteAgent for MockAgent {
    fn id(&self) -> &str {
        &self.instance_id
    }

    async fn configure(&self) -> Result<()> {
        self.record(AgentCall::Configure)
    }

    async fn configure_hybrid_overlay(&self, node_name: &str) -> Result<()> {
        self.record(AgentCall::ConfigureHybridOverlay {
            node_name: node_name.to_string(),
        })
    }

    async fn configure_cni(&self, config_path: &Path) -> Result<()> {
        let contents = tokio::fs::read_to_string(config_path).await.ok();
        self.record(AgentCall::ConfigureCni {
            path: config_path.to_path_buf(),
            contents,
        })
    }

    async fn configure_kube_proxy(&self, node_name: &str, host_subnet: &str) -> Result<()> {
        self.record(AgentCall::ConfigureKubeProxy {
            node_name: node_name.to_string(),
            host_subnet: host_subnet.to_string(),
        })
    }
}

/// Connector that hands out one shared [`MockAgent`] and remembers the
/// parameters it was asked to connect with.
#[derive(Debug)]
pub struct MockConnector {
    agent: Arc<MockAgent>,
    params: Mutex<Vec<AgentParams>>,
}

impl MockConnector {
    /// Create a connector handing out `agent`.
    pub fn new(agent: Arc<MockAgent>) -> Self {
        Self {
            agent,
            params: Mutex::new(Vec::new()),
        }
    }

    /// Parameters of every connect call.
    pub fn params(&self) -> Vec<AgentParams> {
        self.params
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl AgentConnector for MockConnector {
    fn connect(&self, params: AgentParams) -> Result<Arc<dyn RemoteAgent>> {
        self.params
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(params);
        Ok(self.agent.clone())
    }
}
