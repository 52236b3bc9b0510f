use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use kuyala_api::{build_router, AppContext};
use kuyala_core::ClusterBackend;
use kuyala_hub::{run_delayed_stats, run_stats_poller, StatsTrigger, WatchLoop};
use kuyala_kubehub::{CredentialSources, KubeCluster};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kuyala", version, about = "Live view and scale toggle for annotated deployments")]
struct Cli {
    /// HTTP listen address
    #[arg(long, env = "KUYALA_BIND", default_value = "0.0.0.0:5000")]
    bind: SocketAddr,
    /// Kubeconfig file, tried after in-cluster and ~/.kube/config
    #[arg(long, env = "KUYALA_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,
    /// Raw kubeconfig YAML, tried last
    #[arg(long, env = "KUYALA_KUBECONFIG_CONTENT", hide_env_values = true)]
    kubeconfig_content: Option<String>,
    /// Skip in-cluster service account credentials
    #[arg(long, env = "KUYALA_NO_IN_CLUSTER")]
    no_in_cluster: bool,
    /// Prometheus exporter listen address (host:port)
    #[arg(long, env = "KUYALA_METRICS_ADDR")]
    metrics_addr: Option<String>,
}

fn init_tracing() {
    let env = std::env::var("KUYALA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr else { return };
    match addr.parse::<SocketAddr>() {
        Ok(sock) => match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
            Ok(()) => info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        },
        Err(_) => warn!(addr = %addr, "invalid KUYALA_METRICS_ADDR; expected host:port"),
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c");
        cancel.cancelled().await;
        return;
    }
    info!("shutdown requested");
    cancel.cancel();
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    init_metrics(cli.metrics_addr.as_deref());

    let mut sources = CredentialSources::standard().with_path(cli.kubeconfig).with_content(cli.kubeconfig_content);
    if cli.no_in_cluster {
        sources = sources.without_in_cluster();
    }
    let backend: Arc<dyn ClusterBackend> = Arc::new(KubeCluster::new(sources));

    let shutdown = CancellationToken::new();
    let (trigger, signals) = StatsTrigger::channel();
    let ctx = AppContext::new(backend.clone(), trigger, shutdown.clone());

    let tasks = [
        tokio::spawn(WatchLoop::new(backend.clone(), ctx.broadcaster.clone(), ctx.timings, shutdown.clone()).run()),
        tokio::spawn(run_stats_poller(backend.clone(), ctx.broadcaster.clone(), ctx.timings, shutdown.clone())),
        tokio::spawn(run_delayed_stats(signals, backend, ctx.broadcaster.clone(), ctx.timings, shutdown.clone())),
    ];

    let listener = tokio::net::TcpListener::bind(cli.bind).await.with_context(|| format!("binding {}", cli.bind))?;
    info!(addr = %cli.bind, "kuyala listening");
    axum::serve(listener, build_router(ctx))
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("serving http")?;

    shutdown.cancel();
    for t in tasks {
        if let Err(e) = t.await {
            warn!(error = %e, "background task failed");
        }
    }
    info!("kuyala stopped");
    Ok(())
}
