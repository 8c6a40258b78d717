//! Prometheus metrics endpoint.
//!
//! Exposes the data path's per-CPU counters (summed) and the applied routing
//! plan in Prometheus exposition format via a lightweight HTTP server.

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use axum::{extract::State, response::IntoResponse, routing::get, Router};
use tracing::info;

use hier_pubsub_common::{DropReason, Metrics, Tier};

use crate::config::MetricsConfig;
use crate::controller::PlanSummary;
use crate::tables::SharedTables;

// ---------------------------------------------------------------------------
// Metrics State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MetricsState {
    pub tables: SharedTables,
    pub summary: Arc<ArcSwap<PlanSummary>>,
}

// ---------------------------------------------------------------------------
// HTTP Server
// ---------------------------------------------------------------------------

/// Start the Prometheus metrics HTTP server.
pub async fn serve_metrics(config: &MetricsConfig, state: MetricsState) -> Result<()> {
    let app = Router::new()
        .route(&config.path, get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding metrics server to {}", config.bind))?;

    info!(bind = %config.bind, path = %config.path, "metrics server started");

    axum::serve(listener, app)
        .await
        .context("metrics server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Metrics Handler
// ---------------------------------------------------------------------------

async fn metrics_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    let counters = state.tables.lock().await.read_metrics();
    let summary = state.summary.load();

    let output = match counters {
        Ok(m) => render(&m, &summary),
        Err(e) => {
            let mut out = render_plan(&summary);
            out.push_str(&format!("# ERROR reading data path counters: {}\n", e));
            out
        }
    };

    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        output,
    )
}

pub fn render(m: &Metrics, summary: &PlanSummary) -> String {
    let mut out = String::with_capacity(2048);

    out.push_str("# HELP hier_pubsub_clones_total Replicas emitted by clone-redirect\n");
    out.push_str("# TYPE hier_pubsub_clones_total counter\n");
    for (tier, label) in [(Tier::One, "1"), (Tier::Two, "2")] {
        let _ = writeln!(
            out,
            "hier_pubsub_clones_total{{tier=\"{}\"}} {}",
            label,
            m.clones(tier)
        );
    }

    out.push_str("# HELP hier_pubsub_drops_total Packets or replicas that left the fan-out path early\n");
    out.push_str("# TYPE hier_pubsub_drops_total counter\n");
    for reason in DropReason::ALL {
        if reason == DropReason::Ok {
            continue;
        }
        let _ = writeln!(
            out,
            "hier_pubsub_drops_total{{reason=\"{}\"}} {}",
            reason.as_str(),
            m.drops(reason)
        );
    }

    out.push_str(&render_plan(summary));
    out
}

fn render_plan(summary: &PlanSummary) -> String {
    let mut out = String::new();

    // -1 until the first plan is applied.
    let gen = summary.active_gen.map_or(-1, |g| g as i64);
    out.push_str("# HELP hier_pubsub_active_generation Table generation the data path reads\n");
    out.push_str("# TYPE hier_pubsub_active_generation gauge\n");
    let _ = writeln!(out, "hier_pubsub_active_generation {}", gen);

    out.push_str("# HELP hier_pubsub_topics Topics with at least one subscribed node\n");
    out.push_str("# TYPE hier_pubsub_topics gauge\n");
    let _ = writeln!(out, "hier_pubsub_topics {}", summary.topics);

    out.push_str("# HELP hier_pubsub_local_subscribers Subscribers served by this node\n");
    out.push_str("# TYPE hier_pubsub_local_subscribers gauge\n");
    let _ = writeln!(out, "hier_pubsub_local_subscribers {}", summary.local_subscribers);

    out
}
