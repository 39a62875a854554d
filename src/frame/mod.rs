// Native protocol framing
//
// The frame layer packs and unpacks the binary envelope every request and
// response travels in: a fixed header (version, flags, stream id, opcode,
// body length) followed by an opcode-specific body. Bodies themselves are
// written with the primitive wire notation in `notation` and assembled by
// the request/response builders.

pub mod codec;
pub mod header;
pub mod notation;
pub mod request;
pub mod response;

pub use codec::{Frame, FrameCodec, FrameCompressor};
pub use header::{Direction, FrameFlags, FrameHeader, Opcode};
pub use request::{BatchChild, BatchKind, QueryParameters, Request};
pub use response::{Response, ResultKind, ResultResponse};

use serde::{Deserialize, Serialize};

use crate::error::{DriverError, Result};

/// Protocol versions the framing layer understands. The generic request
/// framing is parameterized by this; per-version body differences outside
/// the header (stream-id width, unset support) hang off these methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ProtocolVersion {
    V1 = 1,
    V2 = 2,
    V3 = 3,
    V4 = 4,
    V5 = 5,
}

impl ProtocolVersion {
    /// Highest version the driver will offer during negotiation.
    pub const MAX: ProtocolVersion = ProtocolVersion::V4;
    /// Lowest version negotiation may downgrade to.
    pub const MIN: ProtocolVersion = ProtocolVersion::V1;

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte & 0x7f {
            1 => Ok(ProtocolVersion::V1),
            2 => Ok(ProtocolVersion::V2),
            3 => Ok(ProtocolVersion::V3),
            4 => Ok(ProtocolVersion::V4),
            5 => Ok(ProtocolVersion::V5),
            other => Err(DriverError::Protocol(format!(
                "unsupported protocol version {other}"
            ))),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Header length: 8 bytes for v1-v2 (1-byte stream id), 9 for v3+.
    pub fn header_len(self) -> usize {
        if self.uses_wide_stream_ids() {
            9
        } else {
            8
        }
    }

    /// v3+ carries stream ids as 2-byte signed big-endian integers.
    pub fn uses_wide_stream_ids(self) -> bool {
        self >= ProtocolVersion::V3
    }

    /// Highest stream id usable on a connection of this version.
    pub fn max_stream_id(self) -> i16 {
        if self.uses_wide_stream_ids() {
            32767
        } else {
            127
        }
    }

    /// The "unset" value marker (length -2) exists from v4 on.
    pub fn supports_unset(self) -> bool {
        self >= ProtocolVersion::V4
    }

    /// Per-query server-side timestamps exist from v3 on.
    pub fn supports_timestamps(self) -> bool {
        self >= ProtocolVersion::V3
    }

    /// The next version to try when the server rejects this one, if any.
    pub fn downgrade(self) -> Option<ProtocolVersion> {
        match self {
            ProtocolVersion::V5 => Some(ProtocolVersion::V4),
            ProtocolVersion::V4 => Some(ProtocolVersion::V3),
            ProtocolVersion::V3 => Some(ProtocolVersion::V2),
            ProtocolVersion::V2 => Some(ProtocolVersion::V1),
            ProtocolVersion::V1 => None,
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.as_byte())
    }
}

/// Consistency levels, encoded on the wire as an unsigned short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum Consistency {
    Any = 0x00,
    One = 0x01,
    Two = 0x02,
    Three = 0x03,
    Quorum = 0x04,
    All = 0x05,
    LocalQuorum = 0x06,
    EachQuorum = 0x07,
    Serial = 0x08,
    LocalSerial = 0x09,
    LocalOne = 0x0a,
}

impl Consistency {
    pub fn from_wire(value: u16) -> Result<Self> {
        match value {
            0x00 => Ok(Consistency::Any),
            0x01 => Ok(Consistency::One),
            0x02 => Ok(Consistency::Two),
            0x03 => Ok(Consistency::Three),
            0x04 => Ok(Consistency::Quorum),
            0x05 => Ok(Consistency::All),
            0x06 => Ok(Consistency::LocalQuorum),
            0x07 => Ok(Consistency::EachQuorum),
            0x08 => Ok(Consistency::Serial),
            0x09 => Ok(Consistency::LocalSerial),
            0x0a => Ok(Consistency::LocalOne),
            other => Err(DriverError::Protocol(format!(
                "unknown consistency level 0x{other:02x}"
            ))),
        }
    }

    pub fn as_wire(self) -> u16 {
        self as u16
    }

    /// Serial consistencies are only valid in the serial-consistency slot.
    pub fn is_serial(self) -> bool {
        matches!(self, Consistency::Serial | Consistency::LocalSerial)
    }
}

impl std::fmt::Display for Consistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Consistency::Any => "ANY",
            Consistency::One => "ONE",
            Consistency::Two => "TWO",
            Consistency::Three => "THREE",
            Consistency::Quorum => "QUORUM",
            Consistency::All => "ALL",
            Consistency::LocalQuorum => "LOCAL_QUORUM",
            Consistency::EachQuorum => "EACH_QUORUM",
            Consistency::Serial => "SERIAL",
            Consistency::LocalSerial => "LOCAL_SERIAL",
            Consistency::LocalOne => "LOCAL_ONE",
        };
        write!(f, "{name}")
    }
}
