//! Routing table writes.
//!
//! `TableWriter` is what the controller programs against. `EbpfManager`
//! implements it over the kernel maps; `MemoryTables` keeps the
//! same layout in process for `--dry-run` and for tests, and also serves as a
//! `RoutingTables` so the data path can run against it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::Mutex;

use hier_pubsub_common::*;

/// Table writer shared between the controller and the metrics endpoint.
pub type SharedTables = Arc<Mutex<Box<dyn TableWriter + Send>>>;

pub trait TableWriter {
    /// Current config record, `None` before the first flip.
    fn read_config(&self) -> Result<Option<ConfigRecord>>;

    fn write_config(&mut self, cfg: ConfigRecord) -> Result<()>;

    /// Write a topic's tier-1 destinations, entries first, then the count.
    fn write_node_set(&mut self, gen: Generation, topic_id: u32, nodes: &[NodeDest])
        -> Result<()>;

    /// Write a node's tier-2 destinations, entries first, then the count.
    fn write_local_set(&mut self, gen: Generation, node_id: u32, subs: &[SubDest]) -> Result<()>;

    /// Data path counters summed over all CPUs.
    fn read_metrics(&self) -> Result<Metrics>;

    /// Release whatever the writer holds in the kernel. No-op by default.
    fn detach(&mut self) -> Result<()> {
        Ok(())
    }

    /// Make the inactive generation active, installing the other fields of
    /// `next` in the same write. The first flip activates generation 0.
    /// Returns the generation now active.
    fn flip(&mut self, mut next: ConfigRecord) -> Result<Generation> {
        let gen = match self.read_config()? {
            Some(current) => current.generation().other(),
            None => Generation::Zero,
        };
        next.active_gen = gen as u32;
        self.write_config(next)?;
        Ok(gen)
    }
}

pub(crate) fn check_node_set(topic_id: u32, len: usize) -> Result<()> {
    if topic_id >= MAX_TOPICS {
        bail!("topic {} out of range (max {})", topic_id, MAX_TOPICS - 1);
    }
    if len > MAX_FANOUT as usize {
        bail!(
            "topic {}: {} nodes exceeds MAX_FANOUT ({})",
            topic_id,
            len,
            MAX_FANOUT
        );
    }
    Ok(())
}

pub(crate) fn check_local_set(node_id: u32, len: usize) -> Result<()> {
    if node_id >= MAX_NODES {
        bail!("node {} out of range (max {})", node_id, MAX_NODES - 1);
    }
    if len > MAX_LOCAL_SUB as usize {
        bail!(
            "node {}: {} subscribers exceeds MAX_LOCAL_SUB ({})",
            node_id,
            len,
            MAX_LOCAL_SUB
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// In-process tables
// ---------------------------------------------------------------------------

#[derive(Default)]
struct GenTables {
    topic_nodes: HashMap<u32, Vec<NodeDest>>,
    topic_fanout: HashMap<u32, u32>,
    local_subs: HashMap<u32, Vec<SubDest>>,
    local_fanout: HashMap<u32, u32>,
}

/// Process-local stand-in for the eBPF maps.
#[derive(Default)]
pub struct MemoryTables {
    config: Option<ConfigRecord>,
    gens: [GenTables; 2],
    tier1_clones: AtomicU64,
    tier2_clones: AtomicU64,
    drops: [AtomicU64; DropReason::COUNT],
}

impl MemoryTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self, gen: Generation, topic_id: u32) -> u32 {
        self.gens[gen.index()]
            .topic_fanout
            .get(&topic_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn local_count(&self, gen: Generation, node_id: u32) -> u32 {
        self.gens[gen.index()]
            .local_fanout
            .get(&node_id)
            .copied()
            .unwrap_or(0)
    }

    /// Live tier-1 destinations (up to the count).
    #[cfg(test)]
    pub fn node_entries(&self, gen: Generation, topic_id: u32) -> Vec<NodeDest> {
        let n = self.node_count(gen, topic_id) as usize;
        self.gens[gen.index()]
            .topic_nodes
            .get(&topic_id)
            .map(|v| v.iter().take(n).copied().collect())
            .unwrap_or_default()
    }

    /// Live tier-2 destinations (up to the count).
    #[cfg(test)]
    pub fn local_entries(&self, gen: Generation, node_id: u32) -> Vec<SubDest> {
        let n = self.local_count(gen, node_id) as usize;
        self.gens[gen.index()]
            .local_subs
            .get(&node_id)
            .map(|v| v.iter().take(n).copied().collect())
            .unwrap_or_default()
    }
}

impl TableWriter for MemoryTables {
    fn read_config(&self) -> Result<Option<ConfigRecord>> {
        Ok(self.config)
    }

    fn write_config(&mut self, cfg: ConfigRecord) -> Result<()> {
        self.config = Some(cfg);
        Ok(())
    }

    fn write_node_set(
        &mut self,
        gen: Generation,
        topic_id: u32,
        nodes: &[NodeDest],
    ) -> Result<()> {
        check_node_set(topic_id, nodes.len())?;
        let t = &mut self.gens[gen.index()];
        let slots = t.topic_nodes.entry(topic_id).or_default();
        if slots.len() < nodes.len() {
            slots.resize(nodes.len(), NodeDest::default());
        }
        slots[..nodes.len()].copy_from_slice(nodes);
        t.topic_fanout.insert(topic_id, nodes.len() as u32);
        Ok(())
    }

    fn write_local_set(&mut self, gen: Generation, node_id: u32, subs: &[SubDest]) -> Result<()> {
        check_local_set(node_id, subs.len())?;
        let t = &mut self.gens[gen.index()];
        let slots = t.local_subs.entry(node_id).or_default();
        if slots.len() < subs.len() {
            slots.resize(subs.len(), SubDest::default());
        }
        slots[..subs.len()].copy_from_slice(subs);
        t.local_fanout.insert(node_id, subs.len() as u32);
        Ok(())
    }

    fn read_metrics(&self) -> Result<Metrics> {
        let mut m = Metrics {
            tier1_clones: self.tier1_clones.load(Ordering::Relaxed),
            tier2_clones: self.tier2_clones.load(Ordering::Relaxed),
            ..Default::default()
        };
        for (dst, src) in m.drops.iter_mut().zip(&self.drops) {
            *dst = src.load(Ordering::Relaxed);
        }
        Ok(m)
    }
}

impl RoutingTables for MemoryTables {
    type Set = (Generation, u32);

    fn config(&self) -> Option<ConfigRecord> {
        self.config
    }

    fn node_set(&self, gen: Generation, topic_id: u32) -> Option<Self::Set> {
        (topic_id < MAX_TOPICS).then_some((gen, topic_id))
    }

    fn topic_fanout(&self, gen: Generation, topic_id: u32) -> u32 {
        self.node_count(gen, topic_id)
    }

    fn node_dest(&self, (gen, topic_id): Self::Set, slot: u32) -> Option<NodeDest> {
        self.gens[gen.index()]
            .topic_nodes
            .get(&topic_id)?
            .get(slot as usize)
            .copied()
    }

    fn local_set(&self, gen: Generation, node_id: u32) -> Option<Self::Set> {
        (node_id < MAX_NODES).then_some((gen, node_id))
    }

    fn local_fanout(&self, gen: Generation, node_id: u32) -> u32 {
        self.local_count(gen, node_id)
    }

    fn sub_dest(&self, (gen, node_id): Self::Set, slot: u32) -> Option<SubDest> {
        self.gens[gen.index()]
            .local_subs
            .get(&node_id)?
            .get(slot as usize)
            .copied()
    }
}

impl Counters for MemoryTables {
    fn count_drop(&self, reason: DropReason) {
        self.drops[reason as usize].fetch_add(1, Ordering::Relaxed);
    }

    fn count_clone(&self, tier: Tier) {
        match tier {
            Tier::One => self.tier1_clones.fetch_add(1, Ordering::Relaxed),
            Tier::Two => self.tier2_clones.fetch_add(1, Ordering::Relaxed),
        };
    }
}
