//! Agent that delegates to a helper executable.
//!
//! Each capability maps to one invocation of the helper:
//!
//! ```text
//! <helper> configure
//! <helper> configure-hybrid-overlay <node-name>
//! <helper> configure-cni <config-path>
//! <helper> configure-kube-proxy <node-name> <host-subnet>
//! ```
//!
//! Instance parameters are passed in the environment (`NODECFG_INSTANCE_ID`,
//! `NODECFG_IP_ADDRESS`, `NODECFG_MACHINE_NAME`, `NODECFG_PLATFORM`,
//! `NODECFG_JOIN_ENDPOINT`, `NODECFG_OVERLAY_PORT`). The helper owns the
//! transport to the instance (SSH, WinRM, ...).

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{AgentConnector, AgentParams, RemoteAgent};

/// Agent backed by a helper executable.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    program: PathBuf,
    params: AgentParams,
}

impl CommandAgent {
    /// Create an agent that runs `program` for `params`.
    pub fn new(program: impl Into<PathBuf>, params: AgentParams) -> Self {
        Self {
            program: program.into(),
            params,
        }
    }

    fn command(&self) -> Command {
        let identity = &self.params.identity;
        let mut cmd = Command::new(&self.program);
        cmd.env("NODECFG_INSTANCE_ID", &identity.instance_id)
            .env("NODECFG_IP_ADDRESS", identity.ip_address.to_string())
            .env("NODECFG_MACHINE_NAME", &identity.machine_name)
            .env("NODECFG_PLATFORM", identity.platform.to_string())
            .env("NODECFG_JOIN_ENDPOINT", &self.params.join_endpoint)
            .env("NODECFG_OVERLAY_PORT", self.params.overlay_port.to_string())
            .kill_on_drop(true);
        cmd
    }

    async fn run<I, S>(&self, subcommand: &str, args: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        debug!(
            instance_id = %self.params.identity.instance_id,
            program = %self.program.display(),
            subcommand,
            "Invoking agent helper"
        );

        let output = self
            .command()
            .arg(subcommand)
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.program.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "`{} {}` exited with {}: {}",
                self.program.display(),
                subcommand,
                output.status,
                stderr.trim()
            );
        }

        Ok(())
    }
}

#[async_trait]
impl RemoteAgent for CommandAgent {
    fn id(&self) -> &str {
        &self.params.identity.instance_id
    }

    async fn configure(&self) -> Result<()> {
        info!(instance_id = %self.id(), "Configuring instance");
        self.run("configure", std::iter::empty::<&str>()).await
    }

    async fn configure_hybrid_overlay(&self, node_name: &str) -> Result<()> {
        self.run("configure-hybrid-overlay", [node_name]).await
    }

    async fn configure_cni(&self, config_path: &Path) -> Result<()> {
        self.run("configure-cni", [config_path.as_os_str()]).await
    }

    async fn configure_kube_proxy(&self, node_name: &str, host_subnet: &str) -> Result<()> {
        self.run("configure-kube-proxy", [node_name, host_subnet])
            .await
    }
}

/// Connector producing [`CommandAgent`]s for a fixed helper.
#[derive(Debug, Clone)]
pub struct CommandConnector {
    program: PathBuf,
}

impl CommandConnector {
    /// Create a connector for `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl AgentConnector for CommandConnector {
    fn connect(&self, params: AgentParams) -> Result<Arc<dyn RemoteAgent>> {
        if self.program.as_os_str().is_empty() {
            bail!("agent helper path is empty");
        }
        Ok(Arc::new(CommandAgent::new(self.program.clone(), params)))
    }
}
