//! Configuration for the bootstrap service.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nodecfg_networking::OverlayPort;
use nodecfg_reconcile::{PollConfig, DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT};

use crate::cni::DEFAULT_CNI_TEMPLATE_PATH;
use crate::identity::InstanceIdentity;

/// Bootstrap service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Kubeconfig path; inferred from the environment when unset.
    pub kubeconfig: Option<PathBuf>,

    /// JSON file listing the instances to bootstrap.
    pub instances_file: PathBuf,

    /// Cluster service network CIDR.
    pub service_cidr: String,

    /// Overlay (VXLAN) transport port.
    pub overlay_port: OverlayPort,

    /// CNI config template.
    pub cni_template: PathBuf,

    /// Helper executable implementing the remote agent.
    pub agent_command: PathBuf,

    /// Interval and timeout for every wait.
    pub poll: PollConfig,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let kubeconfig = std::env::var_os("NODECFG_KUBECONFIG").map(PathBuf::from);

        let instances_file = std::env::var("NODECFG_INSTANCES_FILE")
            .unwrap_or_else(|_| "/etc/nodecfg/instances.json".to_string())
            .into();

        let service_cidr = std::env::var("NODECFG_SERVICE_CIDR")
            .context("NODECFG_SERVICE_CIDR must be set")?;

        let overlay_port = std::env::var("NODECFG_OVERLAY_PORT")
            .unwrap_or_default()
            .parse()
            .context("invalid NODECFG_OVERLAY_PORT")?;

        let cni_template = std::env::var("NODECFG_CNI_TEMPLATE")
            .unwrap_or_else(|_| DEFAULT_CNI_TEMPLATE_PATH.to_string())
            .into();

        let agent_command = std::env::var("NODECFG_AGENT_COMMAND")
            .unwrap_or_else(|_| "/usr/libexec/nodecfg/agent".to_string())
            .into();

        let poll = poll_config(
            secs_from_env("NODECFG_POLL_INTERVAL")?,
            secs_from_env("NODECFG_POLL_TIMEOUT")?,
        )?;

        let log_level = std::env::var("NODECFG_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            kubeconfig,
            instances_file,
            service_cidr,
            overlay_port,
            cni_template,
            agent_command,
            poll,
            log_level,
        })
    }
}

fn secs_from_env(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(value) => parse_secs(name, &value).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_secs(name: &str, value: &str) -> Result<Duration> {
    let secs: u64 = value
        .trim()
        .parse()
        .with_context(|| format!("{} must be a whole number of seconds", name))?;
    Ok(Duration::from_secs(secs))
}

/// Poll settings, with defaults for anything unset. A zero interval would
/// hammer the API server and is rejected.
fn poll_config(interval: Option<Duration>, timeout: Option<Duration>) -> Result<PollConfig> {
    let interval = interval.unwrap_or(DEFAULT_POLL_INTERVAL);
    if interval.is_zero() {
        bail!("NODECFG_POLL_INTERVAL must be at least one second");
    }
    Ok(PollConfig::new(
        interval,
        timeout.unwrap_or(DEFAULT_POLL_TIMEOUT),
    ))
}

/// Read the instances to bootstrap from a JSON array.
pub fn load_instances(path: &Path) -> Result<Vec<InstanceIdentity>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read instances file {}", path.display()))?;
    parse_instances(&raw).with_context(|| format!("invalid instances file {}", path.display()))
}

fn parse_instances(raw: &str) -> Result<Vec<InstanceIdentity>> {
    Ok(serde_json::from_str(raw)?)
}
