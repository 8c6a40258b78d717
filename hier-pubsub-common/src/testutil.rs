//! Host-side packet, tables and counters for data path tests.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::vec::Vec;

use crate::engine::{Counters, RoutingTables};
use crate::parse::{BufError, PacketBuf};
use crate::{
    ConfigRecord, DropReason, Generation, Metrics, NodeDest, SubDest, Tier, TopicHeader,
    IPPROTO_UDP,
};

// ---------------------------------------------------------------------------
// Checksums (full recomputation, reference only)
// ---------------------------------------------------------------------------

/// Internet checksum over `bytes` plus an initial partial sum.
pub fn ones_complement(bytes: &[u8], initial: u64) -> u16 {
    let mut sum = initial;
    for chunk in bytes.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += word as u64;
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn ip_header(pkt: &[u8]) -> &[u8] {
    let ihl = ((pkt[14] & 0x0F) as usize) * 4;
    &pkt[14..14 + ihl]
}

fn ipv4_checksum(pkt: &[u8]) -> u16 {
    let mut hdr = ip_header(pkt).to_vec();
    hdr[10] = 0;
    hdr[11] = 0;
    ones_complement(&hdr, 0)
}

fn udp_checksum(pkt: &[u8]) -> u16 {
    let ip = ip_header(pkt);
    let l4 = 14 + ip.len();
    let udp_len = u16::from_be_bytes([pkt[l4 + 4], pkt[l4 + 5]]) as usize;
    let mut seg = pkt[l4..l4 + udp_len].to_vec();
    seg[6] = 0;
    seg[7] = 0;

    let mut pseudo = 0u64;
    for i in (12..20).step_by(2) {
        pseudo += u16::from_be_bytes([ip[i], ip[i + 1]]) as u64;
    }
    pseudo += IPPROTO_UDP as u64;
    pseudo += udp_len as u64;

    let check = ones_complement(&seg, pseudo);
    if check == 0 {
        0xFFFF
    } else {
        check
    }
}

/// Stored IPv4 header checksum equals a full recomputation.
pub fn ipv4_checksum_ok(pkt: &[u8]) -> bool {
    let ip = ip_header(pkt);
    u16::from_be_bytes([ip[10], ip[11]]) == ipv4_checksum(pkt)
}

/// Stored UDP checksum equals a full recomputation (or is unused).
pub fn udp_checksum_ok(pkt: &[u8]) -> bool {
    let l4 = 14 + ip_header(pkt).len();
    let stored = u16::from_be_bytes([pkt[l4 + 6], pkt[l4 + 7]]);
    stored == 0 || stored == udp_checksum(pkt)
}

// ---------------------------------------------------------------------------
// Packet builder
// ---------------------------------------------------------------------------

pub struct PacketSpec {
    pub topic_id: u32,
    pub hop: u16,
    pub saddr: [u8; 4],
    pub daddr: [u8; 4],
    pub sport: u16,
    pub dport: u16,
    pub ip_options: usize,
    pub udp_checksum: bool,
    pub payload: Vec<u8>,
}

impl PacketSpec {
    pub fn new(topic_id: u32, hop: u16) -> Self {
        Self {
            topic_id,
            hop,
            saddr: [10, 0, 0, 1],
            daddr: [10, 0, 0, 255],
            sport: 40000,
            dport: 32000,
            ip_options: 0,
            udp_checksum: true,
            payload: (0u8..16).collect(),
        }
    }

    /// Ethernet + IPv4 + UDP + Topic Header + payload with valid checksums.
    pub fn build(&self) -> Vec<u8> {
        let ihl = 20 + self.ip_options;
        let udp_len = 8 + TopicHeader::LEN + self.payload.len();
        let total = ihl + udp_len;

        let mut pkt = Vec::with_capacity(14 + total);
        pkt.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
        pkt.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
        pkt.extend_from_slice(&0x0800u16.to_be_bytes());

        pkt.push(0x40 | (ihl / 4) as u8);
        pkt.push(0);
        pkt.extend_from_slice(&(total as u16).to_be_bytes());
        pkt.extend_from_slice(&0x1c46u16.to_be_bytes());
        pkt.extend_from_slice(&0x4000u16.to_be_bytes());
        pkt.push(64);
        pkt.push(IPPROTO_UDP);
        pkt.extend_from_slice(&[0, 0]);
        pkt.extend_from_slice(&self.saddr);
        pkt.extend_from_slice(&self.daddr);
        pkt.extend(std::iter::repeat(1u8).take(self.ip_options));

        pkt.extend_from_slice(&self.sport.to_be_bytes());
        pkt.extend_from_slice(&self.dport.to_be_bytes());
        pkt.extend_from_slice(&(udp_len as u16).to_be_bytes());
        pkt.extend_from_slice(&[0, 0]);

        let hdr = TopicHeader {
            topic_id: self.topic_id,
            flags: 0,
            hop: self.hop,
        };
        pkt.extend_from_slice(&hdr.to_bytes());
        pkt.extend_from_slice(&self.payload);

        let check = ipv4_checksum(&pkt);
        pkt[24..26].copy_from_slice(&check.to_be_bytes());
        if self.udp_checksum {
            let l4 = 14 + ihl;
            let check = udp_checksum(&pkt);
            pkt[l4 + 6..l4 + 8].copy_from_slice(&check.to_be_bytes());
        }
        pkt
    }
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

/// A `Vec`-backed packet with a configurable linear area.
pub struct TestPacket {
    pub data: Vec<u8>,
    pub linear: usize,
    pub pulls: usize,
    /// A pull never linearizes more than this.
    pub pull_limit: Option<usize>,
    /// Zero-based clone attempt that fails.
    pub fail_clone_at: Option<usize>,
    /// Zero-based store attempt from which every store fails.
    pub fail_stores_from: Option<usize>,
    store_attempts: usize,
    clone_attempts: usize,
    pub clones: Vec<(u32, Vec<u8>)>,
}

impl TestPacket {
    pub fn new(data: Vec<u8>) -> Self {
        let linear = data.len();
        Self::with_linear(data, linear)
    }

    pub fn with_linear(data: Vec<u8>, linear: usize) -> Self {
        Self {
            data,
            linear,
            pulls: 0,
            pull_limit: None,
            fail_clone_at: None,
            fail_stores_from: None,
            store_attempts: 0,
            clone_attempts: 0,
            clones: Vec::new(),
        }
    }
}

impl PacketBuf for TestPacket {
    fn linear_len(&self) -> usize {
        self.linear
    }

    fn pull(&mut self, len: usize) -> Result<(), BufError> {
        self.pulls += 1;
        let mut linear = len.min(self.data.len());
        if let Some(limit) = self.pull_limit {
            linear = linear.min(limit);
        }
        self.linear = self.linear.max(linear);
        Ok(())
    }

    fn load<const N: usize>(&self, offset: usize) -> Result<[u8; N], BufError> {
        let bytes = self.data.get(offset..offset + N).ok_or(BufError)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn store<const N: usize>(&mut self, offset: usize, bytes: &[u8; N]) -> Result<(), BufError> {
        let attempt = self.store_attempts;
        self.store_attempts += 1;
        if self.fail_stores_from.is_some_and(|from| attempt >= from) {
            return Err(BufError);
        }
        let dst = self.data.get_mut(offset..offset + N).ok_or(BufError)?;
        dst.copy_from_slice(bytes);
        Ok(())
    }

    fn clone_redirect(&mut self, ifindex: u32) -> Result<(), BufError> {
        let attempt = self.clone_attempts;
        self.clone_attempts += 1;
        if self.fail_clone_at == Some(attempt) {
            return Err(BufError);
        }
        self.clones.push((ifindex, self.data.clone()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct TestTables {
    config: Cell<Option<ConfigRecord>>,
    /// Flip `active_gen` right after the next config read, as a concurrent
    /// control plane would.
    pub flip_after_config_read: Cell<bool>,
    nodes: [HashMap<u32, Vec<NodeDest>>; 2],
    topic_counts: [HashMap<u32, u32>; 2],
    subs: [HashMap<u32, Vec<SubDest>>; 2],
    local_counts: [HashMap<u32, u32>; 2],
    seen: RefCell<Vec<Generation>>,
}

impl TestTables {
    pub fn new(config: ConfigRecord) -> Self {
        let tables = Self::default();
        tables.config.set(Some(config));
        tables
    }

    pub fn set_nodes(&mut self, gen: Generation, topic_id: u32, dests: Vec<NodeDest>) {
        self.topic_counts[gen.index()].insert(topic_id, dests.len() as u32);
        self.nodes[gen.index()].insert(topic_id, dests);
    }

    pub fn override_topic_fanout(&mut self, gen: Generation, topic_id: u32, count: u32) {
        self.topic_counts[gen.index()].insert(topic_id, count);
    }

    pub fn set_subs(&mut self, gen: Generation, node_id: u32, dests: Vec<SubDest>) {
        self.local_counts[gen.index()].insert(node_id, dests.len() as u32);
        self.subs[gen.index()].insert(node_id, dests);
    }

    pub fn generations_seen(&self) -> Vec<Generation> {
        self.seen.borrow().clone()
    }

    pub fn lookups(&self) -> usize {
        self.seen.borrow().len()
    }

    fn saw(&self, gen: Generation) {
        self.seen.borrow_mut().push(gen);
    }
}

impl RoutingTables for TestTables {
    type Set = (Generation, u32);

    fn config(&self) -> Option<ConfigRecord> {
        let cfg = self.config.get();
        if self.flip_after_config_read.replace(false) {
            if let Some(mut next) = cfg {
                next.active_gen = next.generation().other() as u32;
                self.config.set(Some(next));
            }
        }
        cfg
    }

    fn node_set(&self, gen: Generation, topic_id: u32) -> Option<Self::Set> {
        self.saw(gen);
        self.nodes[gen.index()]
            .contains_key(&topic_id)
            .then_some((gen, topic_id))
    }

    fn topic_fanout(&self, gen: Generation, topic_id: u32) -> u32 {
        self.saw(gen);
        self.topic_counts[gen.index()]
            .get(&topic_id)
            .copied()
            .unwrap_or(0)
    }

    fn node_dest(&self, (gen, topic_id): Self::Set, slot: u32) -> Option<NodeDest> {
        self.saw(gen);
        self.nodes[gen.index()]
            .get(&topic_id)?
            .get(slot as usize)
            .copied()
    }

    fn local_set(&self, gen: Generation, node_id: u32) -> Option<Self::Set> {
        self.saw(gen);
        self.subs[gen.index()]
            .contains_key(&node_id)
            .then_some((gen, node_id))
    }

    fn local_fanout(&self, gen: Generation, node_id: u32) -> u32 {
        self.saw(gen);
        self.local_counts[gen.index()]
            .get(&node_id)
            .copied()
            .unwrap_or(0)
    }

    fn sub_dest(&self, (gen, node_id): Self::Set, slot: u32) -> Option<SubDest> {
        self.saw(gen);
        self.subs[gen.index()]
            .get(&node_id)?
            .get(slot as usize)
            .copied()
    }
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct TestCounters {
    metrics: Cell<Metrics>,
}

impl TestCounters {
    pub fn snapshot(&self) -> Metrics {
        self.metrics.get()
    }
}

impl Counters for TestCounters {
    fn count_drop(&self, reason: DropReason) {
        let mut m = self.metrics.get();
        m.drops[reason as usize] += 1;
        self.metrics.set(m);
    }

    fn count_clone(&self, tier: Tier) {
        let mut m = self.metrics.get();
        match tier {
            Tier::One => m.tier1_clones += 1,
            Tier::Two => m.tier2_clones += 1,
        }
        self.metrics.set(m);
    }
}
