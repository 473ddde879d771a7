//! Protocol versions -- header shape per wire generation.
//!
//! Both the frame reader and the frame writer consume the same table, so the
//! layout difference between VER1 and VER2 lives in one place.
//!
//! ```text
//! VER1: FF FF <topic:u16> <len:u16>                  <payload> <chk>
//! VER2: FF FE <topic:u16> <len:u16> <len_chk:u8>     <payload> <chk>
//! ```

use std::fmt;

/// First sync byte, common to every version.
pub const SYNC_FLAG: u8 = 0xff;

/// Header layout of one protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderShape {
    /// Sync marker pair that opens a frame.
    pub sync_bytes: [u8; 2],
    /// Header bytes following the sync pair (topic id, length, and the
    /// length checksum when present).
    pub header_len: usize,
    /// Whether a checksum over the length field follows it.
    pub has_length_checksum: bool,
    /// Total framing bytes added to a payload, trailing checksum included.
    pub overhead_bytes: usize,
}

/// VER1 (legacy firmware): no length checksum.
pub const VER1: HeaderShape = HeaderShape {
    sync_bytes: [SYNC_FLAG, 0xff],
    header_len: 4,
    has_length_checksum: false,
    overhead_bytes: 7,
};

/// VER2: adds a checksum byte over the length field.
pub const VER2: HeaderShape = HeaderShape {
    sync_bytes: [SYNC_FLAG, 0xfe],
    header_len: 5,
    has_length_checksum: true,
    overhead_bytes: 8,
};

/// Wire generation spoken by the attached device.
///
/// Starts as `Unknown` and is fixed by the first accepted sync pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    #[default]
    Unknown,
    V1,
    V2,
}

impl ProtocolVersion {
    /// Header shape for this version; `None` while the dialect is unknown.
    pub fn shape(self) -> Option<&'static HeaderShape> {
        match self {
            ProtocolVersion::Unknown => None,
            ProtocolVersion::V1 => Some(&VER1),
            ProtocolVersion::V2 => Some(&VER2),
        }
    }

    /// Version announced by the second sync byte, if any.
    pub fn from_second_sync(byte: u8) -> Option<Self> {
        if byte == VER1.sync_bytes[1] {
            Some(ProtocolVersion::V1)
        } else if byte == VER2.sync_bytes[1] {
            Some(ProtocolVersion::V2)
        } else {
            None
        }
    }

    pub fn is_known(self) -> bool {
        self != ProtocolVersion::Unknown
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolVersion::Unknown => "unknown",
            ProtocolVersion::V1 => "ver1",
            ProtocolVersion::V2 => "ver2",
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
