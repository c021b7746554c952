//! nodecfg Node Bootstrap
//!
//! Bootstraps every instance listed in the instances file into a worker
//! node, one concurrent worker per instance.
//!
//! ## Architecture
//!
//! - **Cluster store**: kube-rs client shared by all workers
//! - **Endpoint cache**: worker join endpoint, discovered once per process
//! - **Agent**: helper executable performing host-level configuration
//! - **Workers**: one `NodeConfig::configure` run per instance

use std::future::Future;
use std::sync::Arc;

use anyhow::{bail, Result};
use nodecfg_bootstrap::agent::CommandConnector;
use nodecfg_bootstrap::config::{load_instances, Config};
use nodecfg_bootstrap::store::KubeStore;
use nodecfg_bootstrap::{
    BootstrapError, ClusterStore, EndpointCache, NodeConfig, NodeConfigOptions,
};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        version = nodecfg_bootstrap::version(),
        instances_file = %config.instances_file.display(),
        service_cidr = %config.service_cidr,
        "Starting nodecfg node bootstrap"
    );

    let instances = load_instances(&config.instances_file)?;
    if instances.is_empty() {
        warn!("No instances to bootstrap");
        return Ok(());
    }

    let store: Arc<dyn ClusterStore> =
        Arc::new(KubeStore::connect(config.kubeconfig.as_deref()).await?);
    let endpoints = Arc::new(EndpointCache::new());
    let connector = Arc::new(CommandConnector::new(config.agent_command.clone()));
    let options = NodeConfigOptions {
        poll: config.poll,
        cni_template: config.cni_template.clone(),
        ..NodeConfigOptions::default()
    };

    let mut workers = JoinSet::new();
    for identity in instances {
        let store = Arc::clone(&store);
        let endpoints = Arc::clone(&endpoints);
        let connector = Arc::clone(&connector);
        let options = options.clone();
        let service_cidr = config.service_cidr.clone();
        let overlay_port = config.overlay_port;

        workers.spawn(async move {
            let instance_id = identity.instance_id.clone();
            let result = async {
                let mut node_config = NodeConfig::new(
                    store,
                    connector.as_ref(),
                    &endpoints,
                    identity,
                    &service_cidr,
                    overlay_port,
                    options,
                )
                .await?;
                node_config.configure().await
            }
            .await;
            (instance_id, result)
        });
    }

    supervise(workers, tokio::signal::ctrl_c()).await
}

type WorkerResult = (String, Result<(), BootstrapError>);

/// Wait for every worker, aborting all of them once `shutdown` completes.
///
/// `shutdown` is polled across the whole wait, so a signal arriving while
/// one worker result is being handled is still seen.
async fn supervise<S>(mut workers: JoinSet<WorkerResult>, shutdown: S) -> Result<()>
where
    S: Future,
{
    let total = workers.len();
    let mut failed = 0usize;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                warn!(remaining = workers.len(), "Received shutdown signal, aborting workers");
                workers.abort_all();
                bail!("bootstrap interrupted");
            }
            joined = workers.join_next() => {
                let Some(joined) = joined else { break };
                match joined {
                    Ok((instance_id, Ok(()))) => {
                        info!(instance_id = %instance_id, "Instance bootstrapped");
                    }
                    Ok((instance_id, Err(e))) => {
                        failed += 1;
                        error!(instance_id = %instance_id, error = ?anyhow::Error::from(e), "Instance bootstrap failed");
                    }
                    Err(e) => {
                        failed += 1;
                        error!(error = %e, "Bootstrap worker panicked");
                    }
                }
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} instances failed to bootstrap", failed, total);
    }

    info!(total, "All instances bootstrapped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;
    use tokio::time::Instant;

    use super::*;

    fn worker(workers: &mut JoinSet<WorkerResult>, id: &str, after: Duration, ok: bool) {
        let id = id.to_string();
        workers.spawn(async move {
            tokio::time::sleep(after).await;
            let result = if ok {
                Ok(())
            } else {
                Err(BootstrapError::Validation("bad instance".to_string()))
            };
            (id, result)
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_workers_succeed() {
        let mut workers = JoinSet::new();
        worker(&mut workers, "i-1", Duration::from_secs(1), true);
        worker(&mut workers, "i-2", Duration::from_secs(2), true);

        supervise(workers, std::future::pending::<()>()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_any_failure_fails_the_run() {
        let mut workers = JoinSet::new();
        worker(&mut workers, "i-1", Duration::from_secs(1), true);
        worker(&mut workers, "i-2", Duration::from_secs(2), false);

        let err = supervise(workers, std::future::pending::<()>())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("1 of 2 instances"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_after_first_completion_aborts_the_rest() {
        let start = Instant::now();
        let mut workers = JoinSet::new();
        worker(&mut workers, "i-fast", Duration::from_secs(1), true);
        worker(&mut workers, "i-slow", Duration::from_secs(600), true);

        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let _ = tx.send(());
        });

        let err = supervise(workers, rx).await.unwrap_err();
        assert!(err.to_string().contains("interrupted"));
        assert!(start.elapsed() < Duration::from_secs(600));
    }
}
