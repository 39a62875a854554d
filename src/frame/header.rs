// Frame header pack/unpack
//
// Header layout: byte 0 is (direction << 7) | version,
// byte 1 is flags, then the stream id (1 byte in v1-v2, 2 bytes signed
// big-endian in v3+), the opcode byte and a 4-byte big-endian unsigned body
// length. The codec operates on already-sliced byte ranges and reports
// incomplete input explicitly instead of buffering.

use bytes::{Buf, BufMut, BytesMut};

use super::ProtocolVersion;
use crate::error::{DriverError, Result};

/// Direction bit of the version byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

/// Frame-level flags (byte 1 of the header).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const COMPRESSION: u8 = 0x01;
    pub const TRACING: u8 = 0x02;
    pub const CUSTOM_PAYLOAD: u8 = 0x04;
    pub const WARNING: u8 = 0x08;

    pub fn new(bits: u8) -> Self {
        FrameFlags(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn compression(self) -> bool {
        self.0 & Self::COMPRESSION != 0
    }

    pub fn tracing(self) -> bool {
        self.0 & Self::TRACING != 0
    }

    pub fn custom_payload(self) -> bool {
        self.0 & Self::CUSTOM_PAYLOAD != 0
    }

    pub fn warning(self) -> bool {
        self.0 & Self::WARNING != 0
    }

    pub fn with_compression(mut self, value: bool) -> Self {
        if value {
            self.0 |= Self::COMPRESSION;
        } else {
            self.0 &= !Self::COMPRESSION;
        }
        self
    }

    pub fn with_tracing(mut self, value: bool) -> Self {
        if value {
            self.0 |= Self::TRACING;
        } else {
            self.0 &= !Self::TRACING;
        }
        self
    }
}

/// Request and response opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Error = 0x00,
    Startup = 0x01,
    Ready = 0x02,
    Authenticate = 0x03,
    Credentials = 0x04,
    Options = 0x05,
    Supported = 0x06,
    Query = 0x07,
    Result = 0x08,
    Prepare = 0x09,
    Execute = 0x0a,
    Register = 0x0b,
    Event = 0x0c,
    Batch = 0x0d,
    AuthChallenge = 0x0e,
    AuthResponse = 0x0f,
    AuthSuccess = 0x10,
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x00 => Ok(Opcode::Error),
            0x01 => Ok(Opcode::Startup),
            0x02 => Ok(Opcode::Ready),
            0x03 => Ok(Opcode::Authenticate),
            0x04 => Ok(Opcode::Credentials),
            0x05 => Ok(Opcode::Options),
            0x06 => Ok(Opcode::Supported),
            0x07 => Ok(Opcode::Query),
            0x08 => Ok(Opcode::Result),
            0x09 => Ok(Opcode::Prepare),
            0x0a => Ok(Opcode::Execute),
            0x0b => Ok(Opcode::Register),
            0x0c => Ok(Opcode::Event),
            0x0d => Ok(Opcode::Batch),
            0x0e => Ok(Opcode::AuthChallenge),
            0x0f => Ok(Opcode::AuthResponse),
            0x10 => Ok(Opcode::AuthSuccess),
            other => Err(DriverError::Protocol(format!("unknown opcode 0x{other:02x}"))),
        }
    }

    /// All opcodes, for exhaustive round-trip checks.
    pub fn all() -> [Opcode; 17] {
        [
            Opcode::Error,
            Opcode::Startup,
            Opcode::Ready,
            Opcode::Authenticate,
            Opcode::Credentials,
            Opcode::Options,
            Opcode::Supported,
            Opcode::Query,
            Opcode::Result,
            Opcode::Prepare,
            Opcode::Execute,
            Opcode::Register,
            Opcode::Event,
            Opcode::Batch,
            Opcode::AuthChallenge,
            Opcode::AuthResponse,
            Opcode::AuthSuccess,
        ]
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: ProtocolVersion,
    pub direction: Direction,
    pub flags: FrameFlags,
    pub stream: i16,
    pub opcode: Opcode,
    pub body_length: u32,
}

/// Outcome of a header decode attempt over a byte slice that may not yet
/// hold a complete header.
#[derive(Debug)]
pub enum HeaderDecode {
    /// Header decoded; the value is the header itself.
    Complete(FrameHeader),
    /// Not enough bytes; the value is how many bytes a full header needs.
    ShortRead(usize),
}

impl FrameHeader {
    pub fn request(
        version: ProtocolVersion,
        flags: FrameFlags,
        stream: i16,
        opcode: Opcode,
        body_length: u32,
    ) -> Self {
        FrameHeader {
            version,
            direction: Direction::Request,
            flags,
            stream,
            opcode,
            body_length,
        }
    }

    /// Pack the header into `out`. Stream-id width follows the version.
    pub fn encode(&self, out: &mut BytesMut) {
        let direction_bit = match self.direction {
            Direction::Request => 0x00,
            Direction::Response => 0x80,
        };
        out.put_u8(direction_bit | self.version.as_byte());
        out.put_u8(self.flags.bits());
        if self.version.uses_wide_stream_ids() {
            out.put_i16(self.stream);
        } else {
            out.put_u8(self.stream as u8);
        }
        out.put_u8(self.opcode as u8);
        out.put_u32(self.body_length);
    }

    /// Decode a header from the start of `bytes`. The version byte is read
    /// from the input itself; `ShortRead` reports how many bytes a complete
    /// header for that version takes.
    pub fn decode(bytes: &[u8]) -> Result<HeaderDecode> {
        if bytes.is_empty() {
            return Ok(HeaderDecode::ShortRead(ProtocolVersion::V3.header_len()));
        }
        let version = ProtocolVersion::from_byte(bytes[0])?;
        let header_len = version.header_len();
        if bytes.len() < header_len {
            return Ok(HeaderDecode::ShortRead(header_len));
        }

        let direction = if bytes[0] & 0x80 != 0 {
            Direction::Response
        } else {
            Direction::Request
        };
        let flags = FrameFlags::new(bytes[1]);
        let mut rest = &bytes[2..];
        let stream = if version.uses_wide_stream_ids() {
            rest.get_i16()
        } else {
            rest.get_u8() as i8 as i16
        };
        let opcode = Opcode::from_byte(rest.get_u8())?;
        let body_length = rest.get_u32();

        Ok(HeaderDecode::Complete(FrameHeader {
            version,
            direction,
            flags,
            stream,
            opcode,
            body_length,
        }))
    }
}
