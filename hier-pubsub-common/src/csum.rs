//! Incremental Internet checksum updates (RFC 1624).
//!
//! All values are the numeric big-endian reading of the bytes in the packet
//! (`u16::from_be_bytes` / `u32::from_be_bytes`). The returned checksum is
//! stored back with `to_be_bytes`.

/// Folds a one's complement accumulator into 16 bits.
///
/// Two folds are enough for every sum produced in this module and keep the
/// eBPF verifier away from an unbounded loop.
#[inline(always)]
pub fn fold(sum: u32) -> u16 {
    let sum = (sum & 0xFFFF) + (sum >> 16);
    let sum = (sum & 0xFFFF) + (sum >> 16);
    sum as u16
}

/// Checksum update for a changed 16-bit word: `HC' = ~(~HC + ~m + m')`.
#[inline(always)]
pub fn replace2(check: u16, old: u16, new: u16) -> u16 {
    let sum = (!check) as u32 + (!old) as u32 + new as u32;
    !fold(sum)
}

/// Checksum update for a changed 32-bit field (two words).
#[inline(always)]
pub fn replace4(check: u16, old: u32, new: u32) -> u16 {
    let sum = (!check) as u32
        + (!((old >> 16) as u16)) as u32
        + (!(old as u16)) as u32
        + (new >> 16)
        + (new & 0xFFFF);
    !fold(sum)
}

/// A computed UDP checksum of zero is transmitted as all ones; zero on the
/// wire means "no checksum".
#[inline(always)]
pub fn udp_mangle(check: u16) -> u16 {
    if check == 0 {
        0xFFFF
    } else {
        check
    }
}
