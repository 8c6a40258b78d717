//! Hop state machine and fan-out loop.
//!
//! One call to [`process`] handles one packet: read the config record, parse
//! headers, snapshot the active generation, then replicate over the tier 1 or
//! tier 2 set selected by the packet's hop. Every destination but the last
//! gets a clone; the last one keeps the original buffer.
//!
//! Loops run to a fixed capacity with an early exit on the fan-out count so
//! the eBPF verifier can bound them.

use crate::csum;
use crate::parse::{self, BufError, HeaderOffsets, PacketBuf};
use crate::{
    ConfigRecord, DropReason, Generation, NodeDest, SubDest, Tier, Verdict, MAX_FANOUT,
    MAX_LOCAL_SUB,
};

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Read-only view of the config record and both table generations.
pub trait RoutingTables {
    /// Opaque handle to one destination set of one generation.
    type Set: Copy;

    fn config(&self) -> Option<ConfigRecord>;

    fn node_set(&self, gen: Generation, topic_id: u32) -> Option<Self::Set>;
    fn topic_fanout(&self, gen: Generation, topic_id: u32) -> u32;
    fn node_dest(&self, set: Self::Set, slot: u32) -> Option<NodeDest>;

    fn local_set(&self, gen: Generation, node_id: u32) -> Option<Self::Set>;
    fn local_fanout(&self, gen: Generation, node_id: u32) -> u32;
    fn sub_dest(&self, set: Self::Set, slot: u32) -> Option<SubDest>;
}

/// Record-and-continue accounting. Implementations must not fail.
pub trait Counters {
    fn count_drop(&self, reason: DropReason);
    fn count_clone(&self, tier: Tier);
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HopState {
    /// hop = 0, sent by a publisher.
    Origin,
    /// hop = 1, arrived at a node.
    Arrived,
    /// hop >= 2, already fanned out at both tiers.
    Terminal,
}

impl HopState {
    pub fn from_hop(hop: u16) -> Self {
        match hop {
            0 => HopState::Origin,
            1 => HopState::Arrived,
            _ => HopState::Terminal,
        }
    }
}

/// Where one replica goes.
#[derive(Clone, Copy)]
struct Replica {
    daddr: u32,
    dport: u16,
    ifindex: u32,
}

/// Tracks whether any store reached the buffer during this invocation.
struct Tracked<'a, P> {
    inner: &'a mut P,
    dirty: bool,
}

impl<P: PacketBuf> PacketBuf for Tracked<'_, P> {
    #[inline(always)]
    fn linear_len(&self) -> usize {
        self.inner.linear_len()
    }

    #[inline(always)]
    fn pull(&mut self, len: usize) -> Result<(), BufError> {
        self.inner.pull(len)
    }

    #[inline(always)]
    fn load<const N: usize>(&self, offset: usize) -> Result<[u8; N], BufError> {
        self.inner.load(offset)
    }

    #[inline(always)]
    fn store<const N: usize>(&mut self, offset: usize, bytes: &[u8; N]) -> Result<(), BufError> {
        self.inner.store(offset, bytes)?;
        self.dirty = true;
        Ok(())
    }

    #[inline(always)]
    fn clone_redirect(&mut self, ifindex: u32) -> Result<(), BufError> {
        self.inner.clone_redirect(ifindex)
    }
}

/// Process one packet.
///
/// Unrelated or unroutable traffic is left alone rather than discarded. The
/// only [`Verdict::Drop`] is a helper failure after the buffer was already
/// modified: at that point its headers may disagree with its checksums, or
/// it may address a destination that already received a replica.
#[inline(always)]
pub fn process<P, T, M>(pkt: &mut P, tables: &T, metrics: &M) -> Verdict
where
    P: PacketBuf,
    T: RoutingTables,
    M: Counters,
{
    // Read once; the generation in this copy is used for the whole packet.
    let cfg = match tables.config() {
        Some(cfg) => cfg,
        None => return Verdict::Continue,
    };

    let mut pkt = Tracked {
        inner: pkt,
        dirty: false,
    };
    match try_process(&mut pkt, tables, metrics, &cfg) {
        Ok(()) => Verdict::Continue,
        Err(reason) => {
            metrics.count_drop(reason);
            if pkt.dirty {
                Verdict::Drop
            } else {
                Verdict::Continue
            }
        }
    }
}

#[inline(always)]
fn try_process<P, T, M>(
    pkt: &mut P,
    tables: &T,
    metrics: &M,
    cfg: &ConfigRecord,
) -> Result<(), DropReason>
where
    P: PacketBuf,
    T: RoutingTables,
    M: Counters,
{
    let (off, hdr) = parse::extract(pkt)?;
    let gen = cfg.generation();

    match HopState::from_hop(hdr.hop) {
        HopState::Origin => {
            let set = tables
                .node_set(gen, hdr.topic_id)
                .ok_or(DropReason::NoNodeSet)?;
            let fanout = tables.topic_fanout(gen, hdr.topic_id);
            if fanout == 0 {
                return Err(DropReason::NoNodeSet);
            }

            advance_hop(pkt, &off, hdr.hop)?;

            let egress = cfg.egress_ifindex;
            fan_out(pkt, metrics, &off, Tier::One, fanout, MAX_FANOUT, |slot| {
                tables.node_dest(set, slot).map(|nd| Replica {
                    daddr: nd.daddr,
                    dport: nd.dport,
                    ifindex: egress,
                })
            })
        }
        HopState::Arrived => {
            let node_id = cfg.local_node_id;
            let set = tables
                .local_set(gen, node_id)
                .ok_or(DropReason::NoLocalSet)?;
            let fanout = tables.local_fanout(gen, node_id);
            if fanout == 0 {
                return Err(DropReason::NoLocalSet);
            }

            advance_hop(pkt, &off, hdr.hop)?;

            let default_ifindex = cfg.local_route_ifindex;
            fan_out(pkt, metrics, &off, Tier::Two, fanout, MAX_LOCAL_SUB, |slot| {
                tables.sub_dest(set, slot).map(|sd| Replica {
                    daddr: sd.daddr,
                    dport: sd.dport,
                    ifindex: if sd.ifindex != 0 {
                        sd.ifindex
                    } else {
                        default_ifindex
                    },
                })
            })
        }
        HopState::Terminal => Ok(()),
    }
}

/// Rewrite and clone for slots `0..fanout`. Clone failures are counted and
/// the loop moves on; buffer helper failures abort with `HelperErr`.
#[inline(always)]
fn fan_out<P, M, F>(
    pkt: &mut P,
    metrics: &M,
    off: &HeaderOffsets,
    tier: Tier,
    fanout: u32,
    bound: u32,
    resolve: F,
) -> Result<(), DropReason>
where
    P: PacketBuf,
    M: Counters,
    F: Fn(u32) -> Option<Replica>,
{
    for i in 0..bound {
        if i >= fanout {
            break;
        }
        let replica = match resolve(i) {
            Some(r) => r,
            None => continue,
        };

        rewrite_destination(pkt, off, replica.daddr, replica.dport)?;

        // The last destination keeps the original buffer.
        if i + 1 < fanout {
            match pkt.clone_redirect(replica.ifindex) {
                Ok(()) => metrics.count_clone(tier),
                Err(_) => metrics.count_drop(DropReason::CloneFail),
            }
        }
    }
    Ok(())
}

/// Write `hop + 1` so every replica carries the next stage's value.
///
/// Each field is stored before its checksum, so a refused first store leaves
/// the packet as it arrived.
#[inline(always)]
fn advance_hop<P: PacketBuf>(pkt: &mut P, off: &HeaderOffsets, hop: u16) -> Result<(), DropReason> {
    let old = pkt.load::<2>(off.hop())?;
    let new = (hop + 1).to_ne_bytes();
    let udp_check = u16::from_be_bytes(pkt.load(off.udp_check())?);

    pkt.store(off.hop(), &new)?;
    if udp_check != 0 {
        let check = csum::replace2(
            udp_check,
            u16::from_be_bytes(old),
            u16::from_be_bytes(new),
        );
        pkt.store(off.udp_check(), &csum::udp_mangle(check).to_be_bytes())?;
    }
    Ok(())
}

/// Point the packet at `daddr:dport` (both network byte order), updating
/// checksums from the values currently in the buffer.
#[inline(always)]
fn rewrite_destination<P: PacketBuf>(
    pkt: &mut P,
    off: &HeaderOffsets,
    daddr: u32,
    dport: u16,
) -> Result<(), DropReason> {
    let new_addr = daddr.to_ne_bytes();
    let new_port = dport.to_ne_bytes();

    // --- IPv4 destination address ---
    let old_addr = pkt.load::<4>(off.ip_daddr())?;
    let ip_check = u16::from_be_bytes(pkt.load(off.ip_check())?);
    pkt.store(off.ip_daddr(), &new_addr)?;
    let ip_check = csum::replace4(
        ip_check,
        u32::from_be_bytes(old_addr),
        u32::from_be_bytes(new_addr),
    );
    pkt.store(off.ip_check(), &ip_check.to_be_bytes())?;

    // Zero means the sender did not compute a UDP checksum; leave it so.
    let udp_check = u16::from_be_bytes(pkt.load(off.udp_check())?);
    if udp_check != 0 {
        // The pseudo-header covers the destination address.
        let check = csum::replace4(
            udp_check,
            u32::from_be_bytes(old_addr),
            u32::from_be_bytes(new_addr),
        );
        pkt.store(off.udp_check(), &csum::udp_mangle(check).to_be_bytes())?;
    }

    // --- UDP destination port ---
    let old_port = pkt.load::<2>(off.udp_dport())?;
    let udp_check = u16::from_be_bytes(pkt.load(off.udp_check())?);
    pkt.store(off.udp_dport(), &new_port)?;
    if udp_check != 0 {
        let check = csum::replace2(
            udp_check,
            u16::from_be_bytes(old_port),
            u16::from_be_bytes(new_port),
        );
        pkt.store(off.udp_check(), &csum::udp_mangle(check).to_be_bytes())?;
    }

    Ok(())
}
