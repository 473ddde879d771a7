//! Frame codec for the device byte stream.
//!
//! Decoding is a sync-seeking state machine: it scans for the sync pair,
//! detects the device's protocol version from the first accepted pair, reads
//! the version-specific header, then the body plus trailing checksum. Any
//! structural corruption drops the frame and scanning resumes byte by byte.
//! A body with a bad checksum is dropped without disturbing the framing.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::checksum;
use crate::version::{ProtocolVersion, SYNC_FLAG};
use crate::{ProtocolError, TopicId, MAX_PAYLOAD_LEN};

/// Default receive capacity: the largest body a frame may declare plus its
/// checksum byte.
pub const DEFAULT_RX_CAPACITY: usize = MAX_PAYLOAD_LEN + 1;

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub topic_id: TopicId,
    pub payload: Bytes,
}

/// An outbound frame, encoded under an explicit protocol version.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub topic_id: TopicId,
    pub payload: Bytes,
    pub version: ProtocolVersion,
}

/// Counters for everything the reader discarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub frames: u64,
    pub bad_length_checksum: u64,
    pub bad_checksum: u64,
    pub oversize: u64,
    pub overruns: u64,
    pub skipped_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    SeekSync1,
    SeekSync2,
    Header,
    Body { topic_id: TopicId, length: u16 },
}

/// Codec turning the device byte stream into [`Frame`]s and back.
#[derive(Debug)]
pub struct FrameCodec {
    state: ReadState,
    version: ProtocolVersion,
    rx_capacity: usize,
    stats: ReaderStats,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_rx_capacity(DEFAULT_RX_CAPACITY)
    }

    /// Codec whose body reads are bounded by `rx_capacity` bytes. A frame
    /// needing more is treated as a receive-buffer overrun.
    pub fn with_rx_capacity(rx_capacity: usize) -> Self {
        Self {
            state: ReadState::SeekSync1,
            version: ProtocolVersion::Unknown,
            rx_capacity,
            stats: ReaderStats::default(),
        }
    }

    /// Protocol version detected from the device, once known.
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn stats(&self) -> ReaderStats {
        self.stats
    }

    /// Abandon any partial frame and resume scanning for sync.
    pub fn resync(&mut self) {
        self.state = ReadState::SeekSync1;
    }

    fn accept_second_sync(&mut self, byte: u8) -> bool {
        if !self.version.is_known() {
            let Some(detected) = ProtocolVersion::from_second_sync(byte) else {
                return false;
            };
            match detected {
                ProtocolVersion::V1 => {
                    tracing::warn!("attached device is using legacy protocol ver1")
                }
                _ => tracing::info!(version = %detected, "attached device protocol detected"),
            }
            self.version = detected;
            return true;
        }
        self.version
            .shape()
            .is_some_and(|shape| shape.sync_bytes[1] == byte)
    }

    /// Parse the header once enough bytes are buffered. Returns the next
    /// state, or `None` when more input is needed.
    fn read_header(&mut self, src: &mut BytesMut) -> Option<ReadState> {
        let shape = self.version.shape()?;
        if src.len() < shape.header_len {
            src.reserve(shape.header_len - src.len());
            return None;
        }

        let topic_id = src.get_u16_le();
        let length = src.get_u16_le();

        if shape.has_length_checksum {
            let received = src.get_u8();
            let expected = checksum::length_checksum(length);
            if received != expected {
                tracing::warn!(
                    topic_id,
                    length,
                    received,
                    expected,
                    "bad message header length checksum, dropping message from device"
                );
                self.stats.bad_length_checksum += 1;
                return Some(ReadState::SeekSync1);
            }
        }

        tracing::debug!(topic_id, length, "received message header");

        if length as usize > MAX_PAYLOAD_LEN {
            tracing::warn!(
                topic_id,
                length,
                max = MAX_PAYLOAD_LEN,
                "declared length exceeds maximum, dropping message from device"
            );
            self.stats.oversize += 1;
            return Some(ReadState::SeekSync1);
        }

        if length as usize + 1 > self.rx_capacity {
            tracing::warn!(
                topic_id,
                length,
                capacity = self.rx_capacity,
                "overrun on receive buffer, attempting to regain rx sync"
            );
            self.stats.overruns += 1;
            return Some(ReadState::SeekSync1);
        }

        Some(ReadState::Body { topic_id, length })
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                ReadState::SeekSync1 => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    if src.get_u8() == SYNC_FLAG {
                        self.state = ReadState::SeekSync2;
                    } else {
                        self.stats.skipped_bytes += 1;
                    }
                }
                ReadState::SeekSync2 => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let byte = src.get_u8();
                    if self.accept_second_sync(byte) {
                        self.state = ReadState::Header;
                    } else {
                        self.stats.skipped_bytes += 2;
                        self.state = ReadState::SeekSync1;
                    }
                }
                ReadState::Header => match self.read_header(src) {
                    Some(next) => self.state = next,
                    None => return Ok(None),
                },
                ReadState::Body { topic_id, length } => {
                    let needed = length as usize + 1;
                    if src.len() < needed {
                        src.reserve(needed - src.len());
                        return Ok(None);
                    }

                    let body = src.split_to(needed).freeze();
                    self.state = ReadState::SeekSync1;

                    tracing::debug!(topic_id, len = body.len(), "received message body");
                    tracing::trace!(topic_id, bytes = %hex::encode(&body), "raw body");

                    if !checksum::verify(topic_id, &body) {
                        tracing::warn!(
                            topic_id,
                            length,
                            "received message with bad checksum, dropping"
                        );
                        self.stats.bad_checksum += 1;
                        continue;
                    }

                    self.stats.frames += 1;
                    return Ok(Some(Frame {
                        topic_id,
                        payload: body.slice(..length as usize),
                    }));
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if !buf.is_empty() || self.state != ReadState::SeekSync1 {
            tracing::debug!(pending = buf.len(), "discarding partial frame at end of stream");
            buf.clear();
            self.state = ReadState::SeekSync1;
        }
        Ok(None)
    }
}

/// Encode one frame under `version` into `dst`.
///
/// Fails without touching `dst` when the version is unknown or the payload
/// exceeds [`MAX_PAYLOAD_LEN`].
pub fn encode_frame(
    topic_id: TopicId,
    payload: &[u8],
    version: ProtocolVersion,
    dst: &mut BytesMut,
) -> Result<(), ProtocolError> {
    let shape = version.shape().ok_or(ProtocolError::VersionUnknown)?;
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }
    let length = payload.len() as u16;

    dst.reserve(shape.overhead_bytes + payload.len());
    dst.extend_from_slice(&shape.sync_bytes);
    dst.put_u16_le(topic_id);
    dst.put_u16_le(length);
    if shape.has_length_checksum {
        dst.put_u8(checksum::length_checksum(length));
    }
    dst.extend_from_slice(payload);
    dst.put_u8(checksum::compute(topic_id, payload));
    Ok(())
}

impl Encoder<OutboundFrame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: OutboundFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(item.topic_id, &item.payload, item.version, dst)
    }
}
