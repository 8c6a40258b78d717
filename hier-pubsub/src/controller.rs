//! Reconcile loop.
//!
//! Each pass fetches the topology, derives a routing plan and, when the plan
//! changed, writes it into the inactive table generation and flips the config
//! record over to it. The data path never sees a half-written generation.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use hier_pubsub_common::*;

use crate::kubernetes::KubeDiscovery;
use crate::tables::{SharedTables, TableWriter};
use crate::topology::{RoutingPlan, Topology};

/// Where the topology comes from.
pub enum TopologySource {
    Static(Topology),
    Kubernetes(KubeDiscovery),
}

impl TopologySource {
    pub async fn fetch(&self) -> Result<Topology> {
        match self {
            TopologySource::Static(t) => Ok(t.clone()),
            TopologySource::Kubernetes(k) => k.fetch().await,
        }
    }
}

/// Per-node values that go into every config record.
#[derive(Debug, Clone)]
pub struct NodeParams {
    pub egress_ifindex: u32,
    pub local_route_ifindex: u32,
    pub node_name: Option<String>,
    pub node_port: u16,
}

/// What is currently live, for the metrics endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub active_gen: Option<Generation>,
    pub nodes: usize,
    pub topics: usize,
    pub local_node_id: Option<u32>,
    pub local_subscribers: usize,
}

#[derive(Debug, Default, Clone)]
struct WrittenKeys {
    topics: BTreeSet<u32>,
    nodes: BTreeSet<u32>,
}

impl WrittenKeys {
    fn of(plan: &RoutingPlan) -> Self {
        Self {
            topics: plan.topics.keys().copied().collect(),
            nodes: plan.locals.keys().copied().collect(),
        }
    }

    fn union(&self, other: &WrittenKeys) -> Self {
        Self {
            topics: self.topics.union(&other.topics).copied().collect(),
            nodes: self.nodes.union(&other.nodes).copied().collect(),
        }
    }
}

pub struct Controller {
    params: NodeParams,
    last_plan: Option<RoutingPlan>,
    /// Keys with a non-zero count, per generation.
    written: [WrittenKeys; 2],
    summary: Arc<ArcSwap<PlanSummary>>,
}

impl Controller {
    pub fn new(params: NodeParams, summary: Arc<ArcSwap<PlanSummary>>) -> Self {
        Self {
            params,
            last_plan: None,
            written: Default::default(),
            summary,
        }
    }

    /// Write `plan` into the inactive generation and make it active.
    ///
    /// Returns the newly active generation, or `None` if `plan` is what is
    /// already live.
    pub fn apply(
        &mut self,
        tables: &mut dyn TableWriter,
        plan: RoutingPlan,
    ) -> Result<Option<Generation>> {
        if self.last_plan.as_ref() == Some(&plan) {
            debug!("routing plan unchanged");
            return Ok(None);
        }

        let current = tables.read_config()?;
        let target = current
            .map(|c| c.generation().other())
            .unwrap_or(Generation::Zero);

        let new_keys = WrittenKeys::of(&plan);
        let old_keys = self.written[target.index()].clone();
        // Until the flip lands, anything either plan touched may be non-zero.
        self.written[target.index()] = old_keys.union(&new_keys);

        for (&topic, nodes) in &plan.topics {
            tables
                .write_node_set(target, topic, nodes)
                .with_context(|| format!("writing node set for topic {}", topic))?;
        }
        for (&node_id, subs) in &plan.locals {
            tables
                .write_local_set(target, node_id, subs)
                .with_context(|| format!("writing local set for node {}", node_id))?;
        }

        for &topic in old_keys.topics.difference(&new_keys.topics) {
            tables.write_node_set(target, topic, &[])?;
        }
        for &node_id in old_keys.nodes.difference(&new_keys.nodes) {
            tables.write_local_set(target, node_id, &[])?;
        }

        // The node id may change with the plan, so it lands in the same write
        // that activates the generation built for it.
        let local_node_id = self.local_node_id(&plan);
        let active = tables
            .flip(ConfigRecord {
                egress_ifindex: self.params.egress_ifindex,
                local_route_ifindex: self.params.local_route_ifindex,
                local_node_id: local_node_id.unwrap_or(MAX_NODES),
                active_gen: target as u32,
            })
            .context("flipping active generation")?;
        if active != target {
            bail!("active generation moved to {:?} while writing {:?}", active, target);
        }

        self.written[target.index()] = new_keys;

        let summary = PlanSummary {
            active_gen: Some(target),
            nodes: plan.nodes.len(),
            topics: plan.topics.len(),
            local_node_id,
            local_subscribers: local_node_id.map_or(0, |id| plan.local_subscribers(id)),
        };
        info!(
            active_gen = target as u32,
            nodes = summary.nodes,
            topics = summary.topics,
            local_node_id = ?summary.local_node_id,
            local_subscribers = summary.local_subscribers,
            "applied routing plan"
        );
        self.summary.store(Arc::new(summary));
        self.last_plan = Some(plan);

        Ok(Some(target))
    }

    /// Without a known local node the tier-2 lookup key is out of range and
    /// hop-1 arrivals count as `no_localset`.
    fn local_node_id(&self, plan: &RoutingPlan) -> Option<u32> {
        let name = self.params.node_name.as_deref()?;
        let id = plan.node_id(name);
        if id.is_none() {
            warn!(node = name, "local node not in topology; tier-2 delivery disabled");
        }
        id
    }

    async fn reconcile(&mut self, source: &TopologySource, tables: &SharedTables) -> Result<()> {
        let topology = source.fetch().await.context("fetching topology")?;
        let plan = RoutingPlan::build(&topology, self.params.node_port)
            .context("building routing plan")?;

        let mut guard = tables.lock().await;
        self.apply(&mut **guard, plan)?;
        Ok(())
    }

    /// Reconcile every `interval`, and whenever `changed` fires.
    pub async fn run(
        mut self,
        source: TopologySource,
        tables: SharedTables,
        interval: Duration,
        changed: Arc<Notify>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = changed.notified() => debug!("topology change notified"),
            }

            if let Err(e) = self.reconcile(&source, &tables).await {
                warn!(error = %format!("{:#}", e), "reconcile failed; retrying next tick");
            }
        }
    }
}
