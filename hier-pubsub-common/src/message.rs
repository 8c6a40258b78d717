//! Datagram layout used by the load generator and the subscriber sink.
//!
//! ```text
//! | Topic Header (8, host order) | send time, ns since epoch (8, BE) | filler |
//! ```
//!
//! The Topic Header is written with [`TopicHeader::to_bytes`] so it reads back
//! the same way the data path reads it.

use crate::TopicHeader;

/// Length of the send timestamp that follows the Topic Header.
pub const STAMP_LEN: usize = 8;

/// Smallest UDP payload that carries a header and a timestamp.
pub const MIN_MESSAGE_LEN: usize = TopicHeader::LEN + STAMP_LEN;

/// Write a hop-0 header for `topic_id` and the send time into `buf`.
/// Bytes past the timestamp are left as they are.
pub fn encode(buf: &mut [u8], topic_id: u32, sent_ns: u64) -> Option<()> {
    if buf.len() < MIN_MESSAGE_LEN {
        return None;
    }
    let hdr = TopicHeader {
        topic_id,
        flags: 0,
        hop: 0,
    };
    buf[..TopicHeader::LEN].copy_from_slice(&hdr.to_bytes());
    stamp(buf, sent_ns)
}

/// Overwrite only the send time of an already encoded message.
pub fn stamp(buf: &mut [u8], sent_ns: u64) -> Option<()> {
    let field = buf.get_mut(TopicHeader::LEN..MIN_MESSAGE_LEN)?;
    field.copy_from_slice(&sent_ns.to_be_bytes());
    Some(())
}

/// Read the header and the send time of a received message.
pub fn decode(buf: &[u8]) -> Option<(TopicHeader, u64)> {
    let hdr: [u8; TopicHeader::LEN] = buf.get(..TopicHeader::LEN)?.try_into().ok()?;
    let sent: [u8; STAMP_LEN] = buf.get(TopicHeader::LEN..MIN_MESSAGE_LEN)?.try_into().ok()?;
    Some((TopicHeader::from_bytes(hdr), u64::from_be_bytes(sent)))
}
