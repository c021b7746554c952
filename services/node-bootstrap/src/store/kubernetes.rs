//! Cluster store backed by the Kubernetes API via kube-rs.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, DynamicObject, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::{Client, Config, ResourceExt};
use tracing::debug;

use super::{ClusterStore, StoreError};

/// Name of the cluster-scoped infrastructure descriptor.
const INFRASTRUCTURE_NAME: &str = "cluster";

/// Connection timeout for the API server.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Read timeout for API requests.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Cluster store talking to a live API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Wrap an existing client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from a kubeconfig path, or infer one (in-cluster
    /// service account, `KUBECONFIG`, `~/.kube/config`) when no path is given.
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self> {
        let mut config = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .context("failed to load kubeconfig")?
            }
            None => Config::infer().await.context("failed to infer kube config")?,
        };
        config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
        config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

        let client = Client::try_from(config).context("failed to create kube client")?;
        Ok(Self::new(client))
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn infrastructures(&self) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk("config.openshift.io", "v1", "Infrastructure");
        let ar = ApiResource::from_gvk_with_plural(&gvk, "infrastructures");
        Api::all_with(self.client.clone(), &ar)
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<Node>, StoreError> {
        let params = ListParams::default().labels(label_selector);
        let list = self
            .nodes()
            .list(&params)
            .await
            .map_err(|e| map_kube_error(e, "Node", label_selector))?;
        debug!(selector = label_selector, count = list.items.len(), "Listed nodes");
        Ok(list.items)
    }

    async fn get_node(&self, name: &str) -> Result<Node, StoreError> {
        self.nodes()
            .get(name)
            .await
            .map_err(|e| map_kube_error(e, "Node", name))
    }

    async fn replace_node(&self, node: &Node) -> Result<Node, StoreError> {
        let name = node.name_any();
        self.nodes()
            .replace(&name, &PostParams::default(), node)
            .await
            .map_err(|e| map_kube_error(e, "Node", &name))
    }

    async fn api_server_internal_url(&self) -> Result<Option<String>, StoreError> {
        let infra = self
            .infrastructures()
            .get(INFRASTRUCTURE_NAME)
            .await
            .map_err(|e| map_kube_error(e, "Infrastructure", INFRASTRUCTURE_NAME))?;
        Ok(internal_url_from_status(&infra.data))
    }
}

/// Extract `status.apiServerInternalURL`, treating empty as absent.
fn internal_url_from_status(data: &serde_json::Value) -> Option<String> {
    data.get("status")
        .and_then(|s| s.get("apiServerInternalURL"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn map_kube_error(err: kube::Error, kind: &'static str, name: &str) -> StoreError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound {
            kind,
            name: name.to_string(),
        },
        kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict {
            kind,
            name: name.to_string(),
            message: resp.message,
        },
        other => StoreError::Api(other.to_string()),
    }
}
