//! TC eBPF program for hierarchical pub/sub fan-out.
//!
//! Attached to TC ingress. Packets carrying a Topic Header after their UDP
//! header are replicated to every node subscribed to the topic (hop 0), or
//! to every local subscriber of this node (hop 1). The original buffer is
//! passed on carrying the last destination.
//!
//! All per-packet logic lives in `hier_pubsub_common::engine`; this crate
//! only binds it to the skb and the maps below.

#![no_std]
#![no_main]

use aya_ebpf::{
    macros::{classifier, map},
    maps::{Array, HashMap, PerCpuArray, RingBuf},
    programs::TcContext,
};

use hier_pubsub_common::*;

mod skb;
mod tables;

use skb::SkbPacket;
use tables::{MapTables, PerCpuCounters};

// ---------------------------------------------------------------------------
// eBPF Maps
// ---------------------------------------------------------------------------

/// Runtime config, key 0. Absent until the loader writes it.
#[map]
static CONFIG: HashMap<u32, ConfigRecord> = HashMap::with_max_entries(1, 0);

/// Tier 1 destinations. Index = topic_id * MAX_FANOUT + slot.
#[map]
static TOPIC_NODES_GEN0: Array<NodeDest> = Array::with_max_entries(MAX_TOPICS * MAX_FANOUT, 0);

#[map]
static TOPIC_NODES_GEN1: Array<NodeDest> = Array::with_max_entries(MAX_TOPICS * MAX_FANOUT, 0);

/// Tier 1 fan-out count. Index = topic_id.
#[map]
static TOPIC_FANOUT_GEN0: Array<u32> = Array::with_max_entries(MAX_TOPICS, 0);

#[map]
static TOPIC_FANOUT_GEN1: Array<u32> = Array::with_max_entries(MAX_TOPICS, 0);

/// Tier 2 destinations. Index = node_id * MAX_LOCAL_SUB + slot.
#[map]
static LOCAL_SUBS_GEN0: Array<SubDest> = Array::with_max_entries(MAX_NODES * MAX_LOCAL_SUB, 0);

#[map]
static LOCAL_SUBS_GEN1: Array<SubDest> = Array::with_max_entries(MAX_NODES * MAX_LOCAL_SUB, 0);

/// Tier 2 fan-out count. Index = node_id.
#[map]
static LOCAL_FANOUT_GEN0: Array<u32> = Array::with_max_entries(MAX_NODES, 0);

#[map]
static LOCAL_FANOUT_GEN1: Array<u32> = Array::with_max_entries(MAX_NODES, 0);

/// Per-CPU counters, key 0. Lock-free via per-CPU.
#[map]
static METRICS: PerCpuArray<Metrics> = PerCpuArray::with_max_entries(1, 0);

/// Reserved for structured diagnostic events.
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(RINGBUF_SIZE, 0);

// ---------------------------------------------------------------------------
// TC Classifier Entry Point
// ---------------------------------------------------------------------------

/// TC ingress classifier.
///
/// Replicas leave through `bpf_clone_redirect` and the original continues
/// with the last destination written into it. `TC_ACT_SHOT` only when a
/// helper failed after the buffer was already rewritten.
#[classifier]
pub fn tc_hier_pubsub(mut ctx: TcContext) -> i32 {
    let mut pkt = SkbPacket::new(&mut ctx);
    engine::process(&mut pkt, &MapTables, &PerCpuCounters).tc_action()
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";
