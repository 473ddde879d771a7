//! Additive frame checksum.
//!
//! The sum covers both topic id bytes, both length bytes and every payload
//! byte, truncated to 8 bits at each addition. The trailing checksum is
//! `255 - sum`, so summing a valid frame including its checksum yields 0xFF.

use crate::TopicId;

fn header_sum(topic_id: TopicId, len: u16) -> u8 {
    let [topic_lo, topic_hi] = topic_id.to_le_bytes();
    let [len_lo, len_hi] = len.to_le_bytes();
    topic_hi
        .wrapping_add(topic_lo)
        .wrapping_add(len_hi)
        .wrapping_add(len_lo)
}

fn byte_sum(seed: u8, bytes: &[u8]) -> u8 {
    bytes.iter().fold(seed, |acc, b| acc.wrapping_add(*b))
}

/// Checksum byte for an outbound frame carrying `payload` on `topic_id`.
pub fn compute(topic_id: TopicId, payload: &[u8]) -> u8 {
    let sum = byte_sum(header_sum(topic_id, payload.len() as u16), payload);
    255 - sum
}

/// Validate a received body: the payload followed by its trailing checksum.
///
/// The declared length is the body length minus the checksum byte.
pub fn verify(topic_id: TopicId, body: &[u8]) -> bool {
    let Some(declared) = body.len().checked_sub(1) else {
        return false;
    };
    byte_sum(header_sum(topic_id, declared as u16), body) == 0xff
}

/// VER2 header checksum over the two length bytes.
pub fn length_checksum(len: u16) -> u8 {
    let [lo, hi] = len.to_le_bytes();
    255 - lo.wrapping_add(hi)
}
