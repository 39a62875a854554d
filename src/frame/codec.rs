// Frame assembly and parsing
//
// `FrameCodec` turns (stream, opcode, body) triples into wire bytes and
// carves complete frames back out of a receive buffer. It performs no
// buffering of its own: `decode` inspects the caller's buffer and either
// consumes one whole frame or leaves it untouched. Body compression is a
// pluggable hook negotiated at STARTUP; STARTUP and OPTIONS themselves are
// never compressed.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use super::header::{FrameFlags, FrameHeader, HeaderDecode, Opcode};
use super::ProtocolVersion;
use crate::error::{DriverError, Result};

/// Body compression codec. Implementations are supplied by the caller; the
/// advertised name is sent in the STARTUP options map.
pub trait FrameCompressor: Send + Sync {
    /// Algorithm name as advertised to the server ("lz4", "snappy", ...).
    fn name(&self) -> &str;
    fn compress(&self, body: &[u8]) -> Result<Vec<u8>>;
    fn decompress(&self, body: &[u8]) -> Result<Vec<u8>>;
}

/// A complete frame: decoded header plus (decompressed) body.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: Bytes,
}

impl Frame {
    pub fn opcode(&self) -> Opcode {
        self.header.opcode
    }

    pub fn stream(&self) -> i16 {
        self.header.stream
    }
}

/// Per-connection frame codec, parameterized by the negotiated protocol
/// version and optional compressor.
#[derive(Clone)]
pub struct FrameCodec {
    version: ProtocolVersion,
    compressor: Option<Arc<dyn FrameCompressor>>,
}

impl FrameCodec {
    pub fn new(version: ProtocolVersion) -> Self {
        FrameCodec {
            version,
            compressor: None,
        }
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn FrameCompressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn compressor_name(&self) -> Option<&str> {
        self.compressor.as_deref().map(|c| c.name())
    }

    /// Encode a request frame. The compression flag is set only when a
    /// compressor is configured and the opcode allows a compressed body.
    pub fn encode(
        &self,
        stream: i16,
        opcode: Opcode,
        flags: FrameFlags,
        body: &[u8],
    ) -> Result<BytesMut> {
        let compressible =
            !matches!(opcode, Opcode::Startup | Opcode::Options) && !body.is_empty();
        let (flags, body_out) = match (&self.compressor, compressible) {
            (Some(compressor), true) => {
                let compressed = compressor.compress(body)?;
                (flags.with_compression(true), compressed)
            }
            _ => (flags.with_compression(false), body.to_vec()),
        };

        let header = FrameHeader::request(
            self.version,
            flags,
            stream,
            opcode,
            body_out.len() as u32,
        );
        let mut out = BytesMut::with_capacity(self.version.header_len() + body_out.len());
        header.encode(&mut out);
        out.extend_from_slice(&body_out);
        Ok(out)
    }

    /// Try to carve one complete frame off the front of `buf`. Returns
    /// `Ok(None)` when the buffer does not yet hold a full frame.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        let header = match FrameHeader::decode(buf)? {
            HeaderDecode::Complete(header) => header,
            HeaderDecode::ShortRead(_) => return Ok(None),
        };
        let header_len = header.version.header_len();
        let total = header_len + header.body_length as usize;
        if buf.len() < total {
            return Ok(None);
        }

        let mut frame_bytes = buf.split_to(total);
        let body_bytes = frame_bytes.split_off(header_len).freeze();

        let body = if header.flags.compression() {
            let compressor = self.compressor.as_ref().ok_or_else(|| {
                DriverError::Protocol(
                    "received compressed frame but no compressor is configured".to_string(),
                )
            })?;
            Bytes::from(compressor.decompress(&body_bytes)?)
        } else {
            body_bytes
        };

        Ok(Some(Frame { header, body }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reverses the body; enough to prove the hook is applied both ways.
    struct ReverseCompressor;

    impl FrameCompressor for ReverseCompressor {
        fn name(&self) -> &str {
            "reverse"
        }

        fn compress(&self, body: &[u8]) -> Result<Vec<u8>> {
            Ok(body.iter().rev().copied().collect())
        }

        fn decompress(&self, body: &[u8]) -> Result<Vec<u8>> {
            Ok(body.iter().rev().copied().collect())
        }
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let codec = FrameCodec::new(ProtocolVersion::V4);
        let body = b"some body bytes";
        let encoded = codec
            .encode(7, Opcode::Query, FrameFlags::default(), body)
            .unwrap();

        let mut buf = BytesMut::from(&encoded[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.stream(), 7);
        assert_eq!(frame.opcode(), Opcode::Query);
        assert_eq!(&frame.body[..], body);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial_frame_returns_none() {
        let codec = FrameCodec::new(ProtocolVersion::V4);
        let encoded = codec
            .encode(1, Opcode::Query, FrameFlags::default(), b"0123456789")
            .unwrap();

        for cut in 0..encoded.len() {
            let mut buf = BytesMut::from(&encoded[..cut]);
            assert!(codec.decode(&mut buf).unwrap().is_none(), "cut {cut}");
            // The buffer must be left untouched on a short read
            assert_eq!(buf.len(), cut);
        }
    }

    #[test]
    fn test_decode_consumes_exactly_one_frame() {
        let codec = FrameCodec::new(ProtocolVersion::V4);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(
            &codec
                .encode(1, Opcode::Query, FrameFlags::default(), b"first")
                .unwrap(),
        );
        buf.extend_from_slice(
            &codec
                .encode(2, Opcode::Execute, FrameFlags::default(), b"second")
                .unwrap(),
        );

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.stream(), 1);
        assert_eq!(&first.body[..], b"first");

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.stream(), 2);
        assert_eq!(&second.body[..], b"second");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_compression_hook_round_trip() {
        let codec =
            FrameCodec::new(ProtocolVersion::V4).with_compressor(Arc::new(ReverseCompressor));
        let body = b"compress me please";
        let encoded = codec
            .encode(3, Opcode::Query, FrameFlags::default(), body)
            .unwrap();

        // On the wire the body must not be the plaintext
        assert_ne!(&encoded[9..], &body[..]);

        let mut buf = BytesMut::from(&encoded[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(frame.header.flags.compression());
        assert_eq!(&frame.body[..], body);
    }

    #[test]
    fn test_startup_is_never_compressed() {
        let codec =
            FrameCodec::new(ProtocolVersion::V4).with_compressor(Arc::new(ReverseCompressor));
        let encoded = codec
            .encode(0, Opcode::Startup, FrameFlags::default(), b"options")
            .unwrap();
        let mut buf = BytesMut::from(&encoded[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(!frame.header.flags.compression());
        assert_eq!(&frame.body[..], b"options");
    }

    #[test]
    fn test_compressed_frame_without_compressor_is_corruption() {
        let sender =
            FrameCodec::new(ProtocolVersion::V4).with_compressor(Arc::new(ReverseCompressor));
        let receiver = FrameCodec::new(ProtocolVersion::V4);
        let encoded = sender
            .encode(0, Opcode::Query, FrameFlags::default(), b"body")
            .unwrap();
        let mut buf = BytesMut::from(&encoded[..]);
        assert!(receiver.decode(&mut buf).is_err());
    }

    #[test]
    fn test_large_body_round_trip() {
        let codec = FrameCodec::new(ProtocolVersion::V4);
        // Bodies over 1 MiB must survive verbatim
        let body: Vec<u8> = (0..(1 << 20) + 4096).map(|i| (i * 31 % 251) as u8).collect();
        let encoded = codec
            .encode(5, Opcode::Result, FrameFlags::default(), &body)
            .unwrap();
        let mut buf = BytesMut::from(&encoded[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.body.len(), body.len());
        assert_eq!(&frame.body[..], &body[..]);
    }
}
