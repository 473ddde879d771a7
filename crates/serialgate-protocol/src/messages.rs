//! Control message payloads.
//!
//! ROS serialization: little-endian integers, strings as a u32 length
//! followed by UTF-8 bytes. User topic payloads are never interpreted here.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{ProtocolError, TopicId};

// ============================================================================
// Reader helpers
// ============================================================================

fn ensure(buf: &impl Buf, field: &'static str, needed: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < needed {
        return Err(ProtocolError::Truncated {
            field,
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn read_u8(buf: &mut impl Buf, field: &'static str) -> Result<u8, ProtocolError> {
    ensure(&*buf, field, 1)?;
    Ok(buf.get_u8())
}

fn read_u16(buf: &mut impl Buf, field: &'static str) -> Result<u16, ProtocolError> {
    ensure(&*buf, field, 2)?;
    Ok(buf.get_u16_le())
}

fn read_u32(buf: &mut impl Buf, field: &'static str) -> Result<u32, ProtocolError> {
    ensure(&*buf, field, 4)?;
    Ok(buf.get_u32_le())
}

fn read_string(buf: &mut impl Buf, field: &'static str) -> Result<String, ProtocolError> {
    let len = read_u32(buf, field)? as usize;
    ensure(&*buf, field, len)?;
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8 { field })
}

fn put_string(dst: &mut BytesMut, value: &str) {
    dst.put_u32_le(value.len() as u32);
    dst.extend_from_slice(value.as_bytes());
}

// ============================================================================
// Topic advertisement
// ============================================================================

/// Which way data flows for an advertised topic, from the device's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device publishes; the gateway forwards into the middleware.
    Publish,
    /// Device subscribes; the gateway forwards middleware data to the device.
    Subscribe,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Publish => "publish",
            Direction::Subscribe => "subscribe",
        }
    }
}

/// A topic advertisement sent by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    pub topic_id: TopicId,
    pub topic_name: String,
    pub message_type: String,
    pub md5sum: String,
    /// Device-side buffer size. Legacy VER1 firmware omits it.
    pub buffer_size: Option<i32>,
}

impl TopicInfo {
    pub fn decode(mut buf: &[u8]) -> Result<Self, ProtocolError> {
        let topic_id = read_u16(&mut buf, "topic_id")?;
        let topic_name = read_string(&mut buf, "topic_name")?;
        let message_type = read_string(&mut buf, "message_type")?;
        let md5sum = read_string(&mut buf, "md5sum")?;
        let buffer_size = if buf.has_remaining() {
            Some(read_u32(&mut buf, "buffer_size")? as i32)
        } else {
            None
        };
        Ok(Self {
            topic_id,
            topic_name,
            message_type,
            md5sum,
            buffer_size,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(
            2 + 16 + self.topic_name.len() + self.message_type.len() + self.md5sum.len(),
        );
        dst.put_u16_le(self.topic_id);
        put_string(&mut dst, &self.topic_name);
        put_string(&mut dst, &self.message_type);
        put_string(&mut dst, &self.md5sum);
        if let Some(size) = self.buffer_size {
            dst.put_i32_le(size);
        }
        dst.freeze()
    }
}

// ============================================================================
// Time sync
// ============================================================================

/// Wall-clock time as sent to the device (std_msgs/Time).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Time {
    pub secs: u32,
    pub nsecs: u32,
}

impl Time {
    pub const ENCODED_LEN: usize = 8;

    pub fn now() -> Self {
        Self::from_datetime(chrono::Utc::now())
    }

    pub fn from_datetime(at: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            secs: at.timestamp() as u32,
            nsecs: at.timestamp_subsec_nanos(),
        }
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, ProtocolError> {
        let secs = read_u32(&mut buf, "secs")?;
        let nsecs = read_u32(&mut buf, "nsecs")?;
        Ok(Self { secs, nsecs })
    }

    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(Self::ENCODED_LEN);
        dst.put_u32_le(self.secs);
        dst.put_u32_le(self.nsecs);
        dst.freeze()
    }
}

// ============================================================================
// Device log
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn from_wire(level: u8) -> Option<Self> {
        match level {
            0 => Some(LogLevel::Debug),
            1 => Some(LogLevel::Info),
            2 => Some(LogLevel::Warn),
            3 => Some(LogLevel::Error),
            4 => Some(LogLevel::Fatal),
            _ => None,
        }
    }
}

/// A log line emitted by the device firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub msg: String,
}

impl LogRecord {
    pub fn decode(mut buf: &[u8]) -> Result<Self, ProtocolError> {
        let raw_level = read_u8(&mut buf, "level")?;
        // Unknown levels are kept rather than dropping the line.
        let level = LogLevel::from_wire(raw_level).unwrap_or(LogLevel::Info);
        let msg = read_string(&mut buf, "msg")?;
        Ok(Self { level, msg })
    }
}
