//! Shared types between the hier-pubsub control plane and the TC eBPF program.
//!
//! This crate is `no_std` so the eBPF program can link it. All map key/value
//! types are `repr(C)` for a stable ABI across eBPF and userspace.
//!
//! Besides the map layout, the crate carries the whole per-packet data path
//! (header extraction, incremental checksums, the hop state machine) written
//! against small traits, so the same code runs inside the classifier and in
//! host tests.

#![cfg_attr(not(test), no_std)]

use core::net::Ipv4Addr;

pub mod csum;
pub mod engine;
pub mod message;
pub mod parse;

#[cfg(test)]
mod testutil;

pub use engine::{process, Counters, HopState, RoutingTables};
pub use parse::{BufError, HeaderOffsets, PacketBuf};

// ---------------------------------------------------------------------------
// Capacities (eBPF map sizing, verifier loop bounds)
// ---------------------------------------------------------------------------

/// Maximum distinct topic ids. Valid ids are `0..MAX_TOPICS`.
pub const MAX_TOPICS: u32 = 4096;

/// Maximum node ids. Valid ids are `0..MAX_NODES`.
pub const MAX_NODES: u32 = 256;

/// Maximum node destinations per topic (tier 1 loop bound).
pub const MAX_FANOUT: u32 = 256;

/// Maximum local subscribers per node (tier 2 loop bound).
pub const MAX_LOCAL_SUB: u32 = 512;

/// Diagnostic ring buffer size in bytes.
pub const RINGBUF_SIZE: u32 = 1 << 20;

// ---------------------------------------------------------------------------
// Topic Header
// ---------------------------------------------------------------------------

/// Fixed 8-byte header carried right after the UDP header.
///
/// All three fields are in host byte order on the wire. Publishers and
/// subscribers sharing a cluster must agree on endianness.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TopicHeader {
    pub topic_id: u32,
    /// Reserved, never interpreted by the data path.
    pub flags: u16,
    /// 0 = from the publisher, 1 = arrived at a node, >= 2 = delivered.
    pub hop: u16,
}

impl TopicHeader {
    pub const LEN: usize = 8;

    pub fn from_bytes(b: [u8; Self::LEN]) -> Self {
        Self {
            topic_id: u32::from_ne_bytes([b[0], b[1], b[2], b[3]]),
            flags: u16::from_ne_bytes([b[4], b[5]]),
            hop: u16::from_ne_bytes([b[6], b[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let t = self.topic_id.to_ne_bytes();
        let f = self.flags.to_ne_bytes();
        let h = self.hop.to_ne_bytes();
        [t[0], t[1], t[2], t[3], f[0], f[1], h[0], h[1]]
    }
}

// ---------------------------------------------------------------------------
// eBPF Map Key/Value Types
// ---------------------------------------------------------------------------

/// Tier 1 entry: a node that hosts subscribers for a topic.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeDest {
    pub node_id: u32,
    /// Node IPv4 address (network byte order).
    pub daddr: u32,
    /// Node UDP port (network byte order).
    pub dport: u16,
    pub _pad: u16,
}

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for NodeDest {}

impl NodeDest {
    pub fn new(node_id: u32, addr: Ipv4Addr, port: u16) -> Self {
        Self {
            node_id,
            daddr: u32::from(addr).to_be(),
            dport: port.to_be(),
            _pad: 0,
        }
    }

    pub fn addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from_be(self.daddr))
    }

    pub fn port(&self) -> u16 {
        u16::from_be(self.dport)
    }
}

/// Tier 2 entry: a subscriber local to a node.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubDest {
    /// Egress ifindex for this subscriber; 0 selects the node's
    /// `local_route_ifindex`.
    pub ifindex: u32,
    /// Subscriber IPv4 address (network byte order).
    pub daddr: u32,
    /// Subscriber UDP port (network byte order).
    pub dport: u16,
    pub _pad: u16,
}

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for SubDest {}

impl SubDest {
    pub fn new(ifindex: u32, addr: Ipv4Addr, port: u16) -> Self {
        Self {
            ifindex,
            daddr: u32::from(addr).to_be(),
            dport: port.to_be(),
            _pad: 0,
        }
    }

    pub fn addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from_be(self.daddr))
    }

    pub fn port(&self) -> u16 {
        u16::from_be(self.dport)
    }
}

/// Runtime configuration, single entry at key 0.
///
/// The record is absent until the control plane writes it; the classifier is
/// fully transparent until then.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConfigRecord {
    /// Redirect target for tier 1 clones.
    pub egress_ifindex: u32,
    /// Default redirect target for tier 2 clones.
    pub local_route_ifindex: u32,
    /// Key into the tier 2 tables for this node.
    pub local_node_id: u32,
    /// Generation the data path reads. Anything non-zero selects generation 1.
    pub active_gen: u32,
}

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for ConfigRecord {}

impl ConfigRecord {
    pub fn generation(&self) -> Generation {
        Generation::from_active_gen(self.active_gen)
    }
}

/// Per-CPU counters, single entry at key 0.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Metrics {
    pub tier1_clones: u64,
    pub tier2_clones: u64,
    /// Indexed by `DropReason as usize`.
    pub drops: [u64; DropReason::COUNT],
}

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for Metrics {}

impl Metrics {
    /// Adds another CPU's counters into this one.
    pub fn merge(&mut self, other: &Metrics) {
        self.tier1_clones += other.tier1_clones;
        self.tier2_clones += other.tier2_clones;
        for (acc, v) in self.drops.iter_mut().zip(other.drops.iter()) {
            *acc += *v;
        }
    }

    pub fn clones(&self, tier: Tier) -> u64 {
        match tier {
            Tier::One => self.tier1_clones,
            Tier::Two => self.tier2_clones,
        }
    }

    pub fn drops(&self, reason: DropReason) -> u64 {
        self.drops[reason as usize]
    }
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Why a packet left the pub/sub path early, or a per-replica failure.
///
/// The numbering is part of the metrics map ABI.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    Ok = 0,
    NotUdp = 1,
    TooShort = 2,
    NoTopic = 3,
    NoNodeSet = 4,
    NoLocalSet = 5,
    CloneFail = 6,
    HelperErr = 7,
}

impl DropReason {
    pub const COUNT: usize = 8;

    pub const ALL: [DropReason; Self::COUNT] = [
        DropReason::Ok,
        DropReason::NotUdp,
        DropReason::TooShort,
        DropReason::NoTopic,
        DropReason::NoNodeSet,
        DropReason::NoLocalSet,
        DropReason::CloneFail,
        DropReason::HelperErr,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Ok => "ok",
            DropReason::NotUdp => "not_udp",
            DropReason::TooShort => "too_short",
            DropReason::NoTopic => "no_topic",
            DropReason::NoNodeSet => "no_nodeset",
            DropReason::NoLocalSet => "no_localset",
            DropReason::CloneFail => "clone_fail",
            DropReason::HelperErr => "helper_err",
        }
    }
}

impl From<BufError> for DropReason {
    fn from(_: BufError) -> Self {
        DropReason::HelperErr
    }
}

/// One of the two complete copies of the routing tables.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Generation {
    Zero = 0,
    One = 1,
}

impl Generation {
    pub fn from_active_gen(v: u32) -> Self {
        if v == 0 {
            Generation::Zero
        } else {
            Generation::One
        }
    }

    pub fn other(self) -> Self {
        match self {
            Generation::Zero => Generation::One,
            Generation::One => Generation::Zero,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Replication stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tier {
    /// topic -> node set
    One,
    /// node -> local subscriber set
    Two,
}

/// What the hosting stack should do with the buffer after processing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Transmit the buffer as it now stands.
    Continue,
    Drop,
}

impl Verdict {
    pub fn tc_action(self) -> i32 {
        match self {
            Verdict::Continue => TC_ACT_OK,
            Verdict::Drop => TC_ACT_SHOT,
        }
    }
}

// ---------------------------------------------------------------------------
// eBPF Map and Program Names (must match between eBPF program and loader)
// ---------------------------------------------------------------------------

/// Program name of the TC classifier.
pub const PROGRAM_NAME: &str = "tc_hier_pubsub";

/// Map name: HashMap<u32, ConfigRecord>, single key 0.
pub const MAP_CONFIG: &str = "CONFIG";

/// Map names: Array<NodeDest> per generation, flat, indexed by
/// `topic_id * MAX_FANOUT + slot`.
pub const MAP_TOPIC_NODES: [&str; 2] = ["TOPIC_NODES_GEN0", "TOPIC_NODES_GEN1"];

/// Map names: Array<u32> per generation, indexed by topic id.
pub const MAP_TOPIC_FANOUT: [&str; 2] = ["TOPIC_FANOUT_GEN0", "TOPIC_FANOUT_GEN1"];

/// Map names: Array<SubDest> per generation, flat, indexed by
/// `node_id * MAX_LOCAL_SUB + slot`.
pub const MAP_LOCAL_SUBS: [&str; 2] = ["LOCAL_SUBS_GEN0", "LOCAL_SUBS_GEN1"];

/// Map names: Array<u32> per generation, indexed by node id.
pub const MAP_LOCAL_FANOUT: [&str; 2] = ["LOCAL_FANOUT_GEN0", "LOCAL_FANOUT_GEN1"];

/// Map name: PerCpuArray<Metrics>, single key 0.
pub const MAP_METRICS: &str = "METRICS";

/// Map name: RingBuf reserved for diagnostic events.
pub const MAP_EVENTS: &str = "EVENTS";

// ---------------------------------------------------------------------------
// Protocol Constants
// ---------------------------------------------------------------------------

/// Ethernet header size.
pub const ETH_HLEN: usize = 14;

/// Minimum IPv4 header size (no options).
pub const IP_HLEN: usize = 20;

/// UDP header size.
pub const UDP_HLEN: usize = 8;

/// EtherType for IPv4.
pub const ETH_P_IP: u16 = 0x0800;

/// IP protocol number for UDP.
pub const IPPROTO_UDP: u8 = 17;

pub const TC_ACT_OK: i32 = 0;
pub const TC_ACT_SHOT: i32 = 2;
