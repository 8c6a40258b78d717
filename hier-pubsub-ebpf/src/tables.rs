//! `RoutingTables` and `Counters` over the eBPF maps.

use aya_ebpf::maps::Array;
use hier_pubsub_common::{
    ConfigRecord, Counters, DropReason, Generation, NodeDest, RoutingTables, SubDest, Tier,
    MAX_FANOUT, MAX_LOCAL_SUB, MAX_NODES, MAX_TOPICS,
};

use crate::{
    CONFIG, LOCAL_FANOUT_GEN0, LOCAL_FANOUT_GEN1, LOCAL_SUBS_GEN0, LOCAL_SUBS_GEN1, METRICS,
    TOPIC_FANOUT_GEN0, TOPIC_FANOUT_GEN1, TOPIC_NODES_GEN0, TOPIC_NODES_GEN1,
};

/// A destination set is a run of `MAX_FANOUT` / `MAX_LOCAL_SUB` slots in a
/// flat array of one generation.
#[derive(Clone, Copy)]
pub struct FlatSet {
    gen: Generation,
    base: u32,
}

pub struct MapTables;

#[inline(always)]
fn topic_nodes(gen: Generation) -> &'static Array<NodeDest> {
    match gen {
        Generation::Zero => &TOPIC_NODES_GEN0,
        Generation::One => &TOPIC_NODES_GEN1,
    }
}

#[inline(always)]
fn topic_fanout(gen: Generation) -> &'static Array<u32> {
    match gen {
        Generation::Zero => &TOPIC_FANOUT_GEN0,
        Generation::One => &TOPIC_FANOUT_GEN1,
    }
}

#[inline(always)]
fn local_subs(gen: Generation) -> &'static Array<SubDest> {
    match gen {
        Generation::Zero => &LOCAL_SUBS_GEN0,
        Generation::One => &LOCAL_SUBS_GEN1,
    }
}

#[inline(always)]
fn local_fanout(gen: Generation) -> &'static Array<u32> {
    match gen {
        Generation::Zero => &LOCAL_FANOUT_GEN0,
        Generation::One => &LOCAL_FANOUT_GEN1,
    }
}

impl RoutingTables for MapTables {
    type Set = FlatSet;

    #[inline(always)]
    fn config(&self) -> Option<ConfigRecord> {
        unsafe { CONFIG.get(&0) }.copied()
    }

    #[inline(always)]
    fn node_set(&self, gen: Generation, topic_id: u32) -> Option<FlatSet> {
        if topic_id >= MAX_TOPICS {
            return None;
        }
        Some(FlatSet {
            gen,
            base: topic_id * MAX_FANOUT,
        })
    }

    #[inline(always)]
    fn topic_fanout(&self, gen: Generation, topic_id: u32) -> u32 {
        topic_fanout(gen).get(topic_id).copied().unwrap_or(0)
    }

    #[inline(always)]
    fn node_dest(&self, set: FlatSet, slot: u32) -> Option<NodeDest> {
        topic_nodes(set.gen).get(set.base + slot).copied()
    }

    #[inline(always)]
    fn local_set(&self, gen: Generation, node_id: u32) -> Option<FlatSet> {
        if node_id >= MAX_NODES {
            return None;
        }
        Some(FlatSet {
            gen,
            base: node_id * MAX_LOCAL_SUB,
        })
    }

    #[inline(always)]
    fn local_fanout(&self, gen: Generation, node_id: u32) -> u32 {
        local_fanout(gen).get(node_id).copied().unwrap_or(0)
    }

    #[inline(always)]
    fn sub_dest(&self, set: FlatSet, slot: u32) -> Option<SubDest> {
        local_subs(set.gen).get(set.base + slot).copied()
    }
}

pub struct PerCpuCounters;

impl Counters for PerCpuCounters {
    #[inline(always)]
    fn count_drop(&self, reason: DropReason) {
        if let Some(m) = METRICS.get_ptr_mut(0) {
            unsafe { (*m).drops[reason as usize] += 1 };
        }
    }

    #[inline(always)]
    fn count_clone(&self, tier: Tier) {
        if let Some(m) = METRICS.get_ptr_mut(0) {
            unsafe {
                match tier {
                    Tier::One => (*m).tier1_clones += 1,
                    Tier::Two => (*m).tier2_clones += 1,
                }
            }
        }
    }
}
