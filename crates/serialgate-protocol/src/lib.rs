//! Serialgate Protocol -- wire types, frame codec, control messages.
//!
//! Framed binary protocol spoken with a lightweight device over a serial
//! line or TCP socket. Two header generations (VER1, VER2) share one
//! additive checksum. All multi-byte integers are little-endian.

pub mod checksum;
pub mod codec;
pub mod messages;
pub mod version;

pub use codec::{encode_frame, Frame, FrameCodec, OutboundFrame, ReaderStats};
pub use messages::{Direction, LogLevel, LogRecord, Time, TopicInfo};
pub use version::{HeaderShape, ProtocolVersion, SYNC_FLAG, VER1, VER2};

/// Topic identifier carried in every frame header.
pub type TopicId = u16;

/// Largest payload a frame may declare. Guards against runaway allocation
/// from a corrupted header.
pub const MAX_PAYLOAD_LEN: usize = 0x7fff;

/// Ids below this value are reserved for protocol control frames.
pub const FIRST_USER_TOPIC: TopicId = 100;

/// Reserved control topic ids. Shared with device firmware; must not change.
pub mod topic_ids {
    use super::TopicId;

    pub const PUBLISHER: TopicId = 0;
    pub const SUBSCRIBER: TopicId = 1;
    pub const SERVICE_SERVER: TopicId = 2;
    pub const SERVICE_CLIENT: TopicId = 4;
    pub const PARAMETER_REQUEST: TopicId = 6;
    pub const LOG: TopicId = 7;
    pub const TIME: TopicId = 10;
    pub const TX_STOP: TopicId = 11;
}

/// Whether `topic_id` falls in the reserved control range.
pub fn is_control_topic(topic_id: TopicId) -> bool {
    topic_id < FIRST_USER_TOPIC
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("protocol version unknown: device dialect not yet detected")]
    VersionUnknown,
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("truncated {field}: need {needed} bytes, {remaining} remaining")]
    Truncated {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },
    #[error("invalid utf-8 in {field}")]
    InvalidUtf8 { field: &'static str },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
