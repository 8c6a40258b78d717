//! hier-pubsub: hierarchical pub/sub fan-out in the kernel data path.
//!
//! A publisher sends one datagram per message. The TC classifier on the
//! publisher's node replicates it to every node hosting subscribers of the
//! topic (tier 1); on each of those nodes the classifier replicates it again
//! to the local subscribers (tier 2). This daemon loads and attaches the
//! classifier and keeps its routing tables in step with the cluster:
//!   - static:     node and subscriber lists from the YAML config
//!   - kubernetes: subscriber pods and node InternalIPs from the API server
//!
//! Table updates go to the inactive generation and become visible in one
//! config write, so packets never see a partially updated table.

mod config;
mod controller;
mod ebpf_manager;
mod kubernetes;
mod metrics;
mod tables;
mod topology;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use clap::Parser;
use tokio::signal;
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn};

use config::{Config, TopologyConfig};
use controller::{Controller, NodeParams, PlanSummary, TopologySource};
use ebpf_manager::{interface_index, EbpfManager};
use kubernetes::KubeDiscovery;
use metrics::MetricsState;
use tables::{MemoryTables, SharedTables, TableWriter};
use topology::Topology;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "hier-pubsub",
    about = "Hierarchical pub/sub fan-out with a TC eBPF data path",
    version
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Path to the compiled eBPF program ELF binary.
    #[arg(long, default_value = "hier-pubsub-ebpf")]
    ebpf_program: PathBuf,

    /// Run the controller against in-process tables instead of loading the
    /// eBPF program. Nothing is attached to any interface.
    #[arg(long)]
    dry_run: bool,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        dry_run = cli.dry_run,
        "starting hier-pubsub"
    );

    let config = Config::load(&cli.config).context("loading configuration")?;
    let dp = &config.dataplane;

    let node_name = dp
        .node_name
        .clone()
        .or_else(|| std::env::var("NODE_NAME").ok().filter(|s| !s.is_empty()));
    if node_name.is_none() {
        warn!("no node name configured (dataplane.node_name or $NODE_NAME); tier-2 delivery disabled");
    }

    let params = NodeParams {
        egress_ifindex: resolve_ifindex(dp.egress_interface(), cli.dry_run)?,
        local_route_ifindex: resolve_ifindex(dp.local_route_interface(), cli.dry_run)?,
        node_name,
        node_port: dp.node_port,
    };
    info!(
        interface = %dp.interface,
        egress_ifindex = params.egress_ifindex,
        local_route_ifindex = params.local_route_ifindex,
        node = params.node_name.as_deref().unwrap_or("-"),
        node_port = params.node_port,
        "dataplane parameters resolved"
    );

    // --- Routing tables ---
    let tables: SharedTables = if cli.dry_run {
        info!("dry run: routing tables are kept in process");
        let mem: Box<dyn TableWriter + Send> = Box::new(MemoryTables::new());
        Arc::new(Mutex::new(mem))
    } else {
        let ebpf_bytes = std::fs::read(&cli.ebpf_program).with_context(|| {
            format!(
                "reading eBPF program from {}. Build it with: cargo xtask build-ebpf",
                cli.ebpf_program.display()
            )
        })?;

        let mut mgr = EbpfManager::load(&ebpf_bytes).context("loading eBPF program")?;
        mgr.attach(&dp.interface)
            .with_context(|| format!("attaching TC to {}", dp.interface))?;

        let mgr: Box<dyn TableWriter + Send> = Box::new(mgr);
        Arc::new(Mutex::new(mgr))
    };

    // --- Topology source ---
    let changed = Arc::new(Notify::new());
    let mut watch_handle = None;

    let source = match &config.topology {
        TopologyConfig::Static(st) => {
            let topo = Topology::from_static(st).context("building static topology")?;
            info!(
                nodes = topo.nodes.len(),
                subscribers = topo.subscribers.len(),
                "static topology loaded"
            );
            TopologySource::Static(topo)
        }
        TopologyConfig::Kubernetes(k8s) => {
            let discovery = KubeDiscovery::connect(k8s.clone()).await?;
            watch_handle = Some(discovery.spawn_pod_watcher(changed.clone()));
            TopologySource::Kubernetes(discovery)
        }
    };

    // --- Controller ---
    let summary = Arc::new(ArcSwap::from_pointee(PlanSummary::default()));
    let controller = Controller::new(params, summary.clone());
    let controller_handle = tokio::spawn(controller.run(
        source,
        tables.clone(),
        config.controller.interval(),
        changed,
    ));

    // --- Metrics server ---
    let metrics_handle = if config.metrics.enabled {
        let state = MetricsState {
            tables: tables.clone(),
            summary,
        };

        let metrics_config = config.metrics.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = metrics::serve_metrics(&metrics_config, state).await {
                error!(error = %e, "metrics server error");
            }
        }))
    } else {
        None
    };

    info!("hier-pubsub is running. Press Ctrl+C to stop.");

    shutdown_signal().await;

    info!("shutdown signal received, cleaning up...");

    if let Some(handle) = metrics_handle {
        handle.abort();
    }
    if let Some(handle) = watch_handle {
        handle.abort();
    }
    controller_handle.abort();

    if let Err(e) = tables.lock().await.detach() {
        warn!(error = %e, "error detaching eBPF program");
    }

    info!("hier-pubsub stopped");
    Ok(())
}

/// In a dry run a missing interface is reported and recorded as ifindex 0.
fn resolve_ifindex(iface: &str, dry_run: bool) -> Result<u32> {
    match interface_index(iface) {
        Ok(idx) => Ok(idx),
        Err(e) if dry_run => {
            warn!(interface = iface, error = %e, "interface not found, using ifindex 0");
            Ok(0)
        }
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Signal Handling
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
