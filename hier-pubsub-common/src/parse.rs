//! Header extraction: Ethernet / IPv4 / UDP / Topic Header.
//!
//! The packet may be non-linear. Before reading a header the extractor makes
//! sure the linear area covers it, pulling when needed, and re-checks the
//! length after every pull because a pull can move and resize the buffer.

use crate::{DropReason, TopicHeader, ETH_HLEN, ETH_P_IP, IPPROTO_UDP, IP_HLEN, UDP_HLEN};

/// A buffer helper (load, store, pull, clone) reported failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufError;

/// The packet owned by the current invocation.
///
/// Offsets are relative to the start of the Ethernet header. `load` and
/// `store` copy raw bytes; the caller decides the byte order.
pub trait PacketBuf {
    /// Bytes directly addressable without a pull.
    fn linear_len(&self) -> usize;

    /// Make at least `len` bytes linear. May change `linear_len`.
    fn pull(&mut self, len: usize) -> Result<(), BufError>;

    fn load<const N: usize>(&self, offset: usize) -> Result<[u8; N], BufError>;

    fn store<const N: usize>(&mut self, offset: usize, bytes: &[u8; N]) -> Result<(), BufError>;

    /// Duplicate the packet as it stands and send the copy out of `ifindex`.
    fn clone_redirect(&mut self, ifindex: u32) -> Result<(), BufError>;
}

/// Header boundaries of a validated pub/sub packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderOffsets {
    pub l3: usize,
    pub l4: usize,
    pub topic: usize,
}

impl HeaderOffsets {
    pub fn ip_check(&self) -> usize {
        self.l3 + 10
    }

    pub fn ip_daddr(&self) -> usize {
        self.l3 + 16
    }

    pub fn udp_dport(&self) -> usize {
        self.l4 + 2
    }

    pub fn udp_check(&self) -> usize {
        self.l4 + 6
    }

    /// The hop field sits at an even offset from the UDP header, so it is
    /// one aligned word of the UDP checksum.
    pub fn hop(&self) -> usize {
        self.topic + 6
    }
}

/// Ensure `need` bytes are linear, pulling once if they are not.
#[inline(always)]
fn ensure_linear<P: PacketBuf>(pkt: &mut P, need: usize) -> bool {
    if pkt.linear_len() >= need {
        return true;
    }
    if pkt.pull(need).is_err() {
        return false;
    }
    pkt.linear_len() >= need
}

/// Locate the headers and read the Topic Header. Never mutates the packet.
#[inline(always)]
pub fn extract<P: PacketBuf>(pkt: &mut P) -> Result<(HeaderOffsets, TopicHeader), DropReason> {
    // --- Ethernet ---
    if !ensure_linear(pkt, ETH_HLEN) {
        return Err(DropReason::TooShort);
    }
    let ether_type = u16::from_be_bytes(pkt.load(12)?);
    if ether_type != ETH_P_IP {
        return Err(DropReason::NotUdp);
    }

    // --- IPv4 ---
    let l3 = ETH_HLEN;
    if !ensure_linear(pkt, l3 + IP_HLEN) {
        return Err(DropReason::TooShort);
    }
    let [ver_ihl] = pkt.load::<1>(l3)?;
    let [protocol] = pkt.load::<1>(l3 + 9)?;
    if ver_ihl >> 4 != 4 || protocol != IPPROTO_UDP {
        return Err(DropReason::NotUdp);
    }
    let ihl = ((ver_ihl & 0x0F) as usize) * 4;
    if ihl < IP_HLEN {
        return Err(DropReason::NotUdp);
    }

    // --- UDP ---
    let l4 = l3 + ihl;
    if !ensure_linear(pkt, l4 + UDP_HLEN) {
        return Err(DropReason::TooShort);
    }

    // --- Topic Header ---
    let topic = l4 + UDP_HLEN;
    if !ensure_linear(pkt, topic + TopicHeader::LEN) {
        return Err(DropReason::NoTopic);
    }
    let hdr = TopicHeader::from_bytes(pkt.load(topic)?);

    Ok((HeaderOffsets { l3, l4, topic }, hdr))
}
