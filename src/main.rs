//! Warden controller entrypoint

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config as KubeConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use warden::alerting::Alerter;
use warden::autoscale::Autoscaler;
use warden::cloud::{AzureCloud, CloudProvider, DisabledCloud};
use warden::cluster::{ClusterApi, KubeClusterApi};
use warden::config::Config;
use warden::controller::{Controller, ControllerOptions};
use warden::drain::Drainer;
use warden::health::HealthEvaluator;
use warden::metrics::{self, Metrics};
use warden::state::NodeStateStore;

/// Warden - Kubernetes node lifecycle controller
#[derive(Parser, Debug)]
#[command(name = "warden", version, about, long_about = None)]
struct Cli {
    /// Path to kubeconfig file, leave empty for in-cluster discovery
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Path to configuration file
    #[arg(long, default_value = "/etc/node-lifecycle/config.yaml")]
    config: PathBuf,

    /// Bind address for the metrics server
    #[arg(long = "metrics-addr", default_value = ":8080")]
    metrics_addr: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = Arc::new(Config::load(&cli.config)?);
    let client = create_client(cli.kubeconfig.as_deref()).await?;

    let metrics = Arc::new(Metrics::new()?);
    let alerter = Arc::new(Alerter::new(config.alerting.clone()));
    let evaluator = Arc::new(HealthEvaluator::from_config(&config.health_checks)?);
    let store = Arc::new(NodeStateStore::new());

    let cloud: Arc<dyn CloudProvider> = if config.azure.enabled() {
        Arc::new(AzureCloud::new(config.azure.clone())?)
    } else {
        info!("azure subscription not configured, cloud features disabled");
        Arc::new(DisabledCloud)
    };

    let cluster: Arc<dyn ClusterApi> = Arc::new(KubeClusterApi::new(client.clone()));
    let drainer = Arc::new(Drainer::new(cluster, &config.controller));
    let autoscaler = Arc::new(Autoscaler::new(
        cloud.clone(),
        alerter.clone(),
        metrics.clone(),
        config.autoscaling.clone(),
    ));

    let shutdown = CancellationToken::new();
    {
        let token = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("received shutdown signal");
            token.cancel();
        });
    }

    let metrics_addr = normalize_addr(&cli.metrics_addr);
    {
        let metrics = metrics.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(&metrics_addr, metrics, token).await {
                error!(error = %e, "metrics server error");
            }
        });
    }

    let controller = Controller::new(ControllerOptions {
        evaluator,
        drainer,
        autoscaler,
        alerter,
        metrics,
        store,
        cloud,
        config,
        shutdown: shutdown.clone(),
    });

    info!("starting node lifecycle controller");
    controller.run(client).await?;

    // The reconciliation loop only returns once the token is cancelled;
    // make sure the metrics server sees it too.
    shutdown.cancel();
    info!("node lifecycle controller stopped");
    Ok(())
}

/// Build a kube client from an explicit kubeconfig path, or infer one
/// (in-cluster service account first, then the local kubeconfig)
async fn create_client(kubeconfig: Option<&Path>) -> anyhow::Result<Client> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)?;
            let config =
                KubeConfig::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await?;
            Ok(Client::try_from(config)?)
        }
        None => Ok(Client::try_default().await?),
    }
}

/// Resolve until SIGINT or SIGTERM arrives
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Accept Go-style `:8080` bind addresses alongside full host:port pairs
fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}
