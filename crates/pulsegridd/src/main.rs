//! pulsegridd — the PulseGrid daemon.
//!
//! Runs a cluster of PulseGrid nodes inside one process, connected through
//! an in-memory broker:
//! - Cluster coordinator per node (heartbeats, registry, surveys)
//! - Hub per node (connections, channel index)
//! - Metrics collector per node, optionally written as Prometheus text
//!
//! # Usage
//!
//! ```text
//! pulsegridd run --config pulsegrid.toml --nodes 3
//! pulsegridd check-config --config pulsegrid.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use pulse_core::PulseConfig;
use pulsegrid_cluster::{LocalNode, MemoryBus, SurveyEvent, SurveyReply};
use pulsegrid_hub::Node;
use pulsegrid_metrics::{MetricsCollector, render_prometheus};

#[derive(Parser)]
#[command(name = "pulsegridd", about = "PulseGrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an in-process cluster until Ctrl-C.
    Run {
        /// Path to the TOML config; defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of nodes to start.
        #[arg(long, default_value = "1")]
        nodes: usize,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,

        /// Write the first node's metrics in Prometheus text format here.
        #[arg(long)]
        metrics_file: Option<PathBuf>,

        /// Seconds between cluster stats surveys and metrics writes.
        #[arg(long, default_value = "30")]
        stats_interval: u64,
    },
    /// Parse and validate a config file, then print it with defaults filled in.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            nodes,
            log_json,
            metrics_file,
            stats_interval,
        } => {
            init_tracing(log_json);
            let config = load_config(config.as_deref())?;
            run_cluster(config, nodes, metrics_file, Duration::from_secs(stats_interval)).await
        }
        Command::CheckConfig { config } => {
            init_tracing(false);
            let config = load_config(Some(&config))?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,pulsegridd=debug,pulsegrid=debug".parse().unwrap());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PulseConfig> {
    match path {
        Some(path) => PulseConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => {
            let config = PulseConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

async fn run_cluster(
    config: PulseConfig,
    count: usize,
    metrics_file: Option<PathBuf>,
    stats_interval: Duration,
) -> anyhow::Result<()> {
    anyhow::ensure!(count > 0, "--nodes must be at least 1");
    anyhow::ensure!(!stats_interval.is_zero(), "--stats-interval must be at least 1 second");
    info!(nodes = count, "PulseGrid daemon starting");

    // ── Assemble nodes ─────────────────────────────────────────

    let bus = MemoryBus::new();
    let mut nodes = Vec::with_capacity(count);
    let mut collectors = Vec::with_capacity(count);
    for _ in 0..count {
        let metrics = Arc::new(MetricsCollector::new(&config.node.name).with_version(env!("CARGO_PKG_VERSION")));
        let node = Arc::new(Node::new(&config, Arc::new(bus.broker()), metrics.clone())?);
        install_stats_handler(&node);
        node.start()?;
        info!(node_id = %node.node_id(), "node ready");
        nodes.push(node);
        collectors.push(metrics);
    }

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let mut handles = Vec::with_capacity(count + 1);
    for node in &nodes {
        let node = Arc::clone(node);
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { node.run(shutdown).await }));
    }

    let first = Arc::clone(&nodes[0]);
    let metrics = Arc::clone(&collectors[0]);
    let stats_shutdown = shutdown_rx.clone();
    handles.push(tokio::spawn(async move {
        stats_loop(first, metrics, metrics_file, stats_interval, stats_shutdown).await;
    }));

    tokio::signal::ctrl_c()
        .await
        .context("failed to install CTRL+C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }

    info!("PulseGrid daemon stopped");
    Ok(())
}

/// Answer "stats" surveys with this node's gauges as JSON.
fn install_stats_handler(node: &Arc<Node>) {
    let hub = Arc::clone(node.hub());
    node.on_survey(Arc::new(move |event: SurveyEvent| {
        let hub = Arc::clone(&hub);
        Box::pin(async move {
            if event.op != "stats" {
                return SurveyReply {
                    code: 1,
                    data: Vec::new(),
                };
            }
            let gauges = hub.gauges();
            let body = serde_json::json!({
                "node_id": hub.node_id(),
                "clients": gauges.clients,
                "users": gauges.users,
                "channels": gauges.channels,
                "subscriptions": gauges.subscriptions,
            });
            SurveyReply::ok(body.to_string().into_bytes())
        })
    }));
}

async fn stats_loop(
    node: Arc<Node>,
    metrics: Arc<MetricsCollector>,
    metrics_file: Option<PathBuf>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately, before peers have heartbeated.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match node.survey("stats", Vec::new()).await {
                    Ok(replies) => {
                        let mut clients = 0;
                        for reply in replies.values().filter(|r| r.code == 0) {
                            if let Ok(stats) = serde_json::from_slice::<serde_json::Value>(&reply.data) {
                                clients += stats["clients"].as_u64().unwrap_or(0);
                            }
                        }
                        info!(nodes = replies.len(), clients, "cluster stats");
                    }
                    Err(e) => warn!(error = %e, "stats survey failed"),
                }
                if let Some(path) = &metrics_file {
                    let text = render_prometheus(&metrics.snapshot());
                    if let Err(e) = tokio::fs::write(path, text).await {
                        warn!(path = ?path, error = %e, "failed to write metrics file");
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_nodes_is_rejected() {
        let err = run_cluster(PulseConfig::default(), 0, None, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("--nodes"));
    }

    #[tokio::test]
    async fn zero_stats_interval_is_rejected() {
        let err = run_cluster(PulseConfig::default(), 1, None, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("--stats-interval"));
    }
}
