// Primitive wire notation
//
// The protocol composes bodies from a small vocabulary: [int], [long],
// [short], [string] (short-prefixed UTF-8), [long string], [bytes]
// (int-prefixed, -1 for null, -2 for unset), [short bytes], [string list],
// [string map], [string multimap], [inet] and unsigned/zigzag vints.
// Writers append to a `BytesMut`; the `Reader` walks an already-sliced body
// and reports truncation explicitly rather than panicking.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};

use crate::error::{DriverError, Result};

// ---------------------------------------------------------------------------
// Writers
// ---------------------------------------------------------------------------

pub fn write_int(out: &mut BytesMut, value: i32) {
    out.put_i32(value);
}

pub fn write_long(out: &mut BytesMut, value: i64) {
    out.put_i64(value);
}

pub fn write_short(out: &mut BytesMut, value: u16) {
    out.put_u16(value);
}

pub fn write_byte(out: &mut BytesMut, value: u8) {
    out.put_u8(value);
}

pub fn write_string(out: &mut BytesMut, value: &str) {
    out.put_u16(value.len() as u16);
    out.put_slice(value.as_bytes());
}

pub fn write_long_string(out: &mut BytesMut, value: &str) {
    out.put_i32(value.len() as i32);
    out.put_slice(value.as_bytes());
}

pub fn write_string_list(out: &mut BytesMut, values: &[String]) {
    out.put_u16(values.len() as u16);
    for value in values {
        write_string(out, value);
    }
}

pub fn write_string_map(out: &mut BytesMut, map: &HashMap<String, String>) {
    out.put_u16(map.len() as u16);
    // Deterministic order keeps encoded frames reproducible in tests.
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    for key in keys {
        write_string(out, key);
        write_string(out, &map[key]);
    }
}

/// [bytes]: int length followed by the payload, or -1 for null.
pub fn write_bytes(out: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        Some(bytes) => {
            out.put_i32(bytes.len() as i32);
            out.put_slice(bytes);
        }
        None => out.put_i32(-1),
    }
}

/// The length marker -2, the "unset" value (v4+ only).
pub fn write_unset(out: &mut BytesMut) {
    out.put_i32(-2);
}

pub fn write_short_bytes(out: &mut BytesMut, value: &[u8]) {
    out.put_u16(value.len() as u16);
    out.put_slice(value);
}

// ---------------------------------------------------------------------------
// Vints (unsigned MSB-prefixed, signed via zigzag)
// ---------------------------------------------------------------------------

/// Extra bytes needed beyond the first for an unsigned vint.
fn unsigned_vint_extra(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    let extra = bits.saturating_sub(7).div_ceil(7);
    extra.min(8)
}

pub fn write_unsigned_vint(out: &mut BytesMut, value: u64) {
    let extra = unsigned_vint_extra(value);
    match extra {
        0 => out.put_u8(value as u8),
        8 => {
            out.put_u8(0xff);
            out.put_u64(value);
        }
        _ => {
            let ones_mask = 0xffu8 << (8 - extra);
            out.put_u8(ones_mask | (value >> (8 * extra)) as u8);
            for i in (0..extra).rev() {
                out.put_u8((value >> (8 * i)) as u8);
            }
        }
    }
}

pub fn write_vint(out: &mut BytesMut, value: i64) {
    let zigzag = ((value >> 63) ^ (value << 1)) as u64;
    write_unsigned_vint(out, zigzag);
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Bounds-checked cursor over a frame body.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(DriverError::Protocol(format!(
                "truncated frame body: needed {n} bytes, {} left",
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_raw(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_short(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_int(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_long(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        Ok(i64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_short()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| DriverError::Protocol(format!("invalid UTF-8 in [string]: {e}")))
    }

    pub fn read_long_string(&mut self) -> Result<String> {
        let len = self.read_int()?;
        if len < 0 {
            return Err(DriverError::Protocol("negative [long string] length".into()));
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| DriverError::Protocol(format!("invalid UTF-8 in [long string]: {e}")))
    }

    /// [bytes]: returns None for the null marker (-1). The unset marker is
    /// never valid in responses and is reported as corruption.
    pub fn read_bytes(&mut self) -> Result<Option<&'a [u8]>> {
        let len = self.read_int()?;
        if len == -1 {
            return Ok(None);
        }
        if len < 0 {
            return Err(DriverError::Protocol(format!(
                "invalid [bytes] length {len}"
            )));
        }
        Ok(Some(self.take(len as usize)?))
    }

    pub fn read_short_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_short()? as usize;
        self.take(len)
    }

    pub fn read_string_list(&mut self) -> Result<Vec<String>> {
        let count = self.read_short()? as usize;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.read_string()?);
        }
        Ok(out)
    }

    pub fn read_string_map(&mut self) -> Result<HashMap<String, String>> {
        let count = self.read_short()? as usize;
        let mut out = HashMap::with_capacity(count);
        for _ in 0..count {
            let key = self.read_string()?;
            let value = self.read_string()?;
            out.insert(key, value);
        }
        Ok(out)
    }

    pub fn read_string_multimap(&mut self) -> Result<HashMap<String, Vec<String>>> {
        let count = self.read_short()? as usize;
        let mut out = HashMap::with_capacity(count);
        for _ in 0..count {
            let key = self.read_string()?;
            let values = self.read_string_list()?;
            out.insert(key, values);
        }
        Ok(out)
    }

    /// [bytes map]: the custom-payload shape, string keys to [bytes].
    pub fn read_bytes_map(&mut self) -> Result<HashMap<String, Option<Vec<u8>>>> {
        let count = self.read_short()? as usize;
        let mut out = HashMap::with_capacity(count);
        for _ in 0..count {
            let key = self.read_string()?;
            let value = self.read_bytes()?.map(|b| b.to_vec());
            out.insert(key, value);
        }
        Ok(out)
    }

    /// [inetaddr]: a 4- or 16-byte address with a one-byte size prefix.
    pub fn read_inetaddr(&mut self) -> Result<IpAddr> {
        let size = self.read_byte()? as usize;
        let bytes = self.take(size)?;
        match size {
            4 => Ok(IpAddr::V4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))),
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(bytes);
                Ok(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            other => Err(DriverError::Protocol(format!(
                "invalid inet address length {other}"
            ))),
        }
    }

    /// [inet]: an [inetaddr] followed by an [int] port.
    pub fn read_inet(&mut self) -> Result<SocketAddr> {
        let addr = self.read_inetaddr()?;
        let port = self.read_int()?;
        Ok(SocketAddr::new(addr, port as u16))
    }

    pub fn read_unsigned_vint(&mut self) -> Result<u64> {
        let first = self.read_byte()?;
        let extra = (!first).leading_zeros() as usize;
        match extra {
            0 => Ok(first as u64),
            8 => self.read_long().map(|v| v as u64),
            _ => {
                let mut value = (first & ((1u8 << (7 - extra)) - 1)) as u64;
                for _ in 0..extra {
                    value = (value << 8) | self.read_byte()? as u64;
                }
                Ok(value)
            }
        }
    }

    pub fn read_vint(&mut self) -> Result<i64> {
        let zigzag = self.read_unsigned_vint()?;
        Ok(((zigzag >> 1) as i64) ^ -((zigzag & 1) as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_round_trip() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "system.local");
        write_long_string(&mut buf, "SELECT * FROM system.local");
        let mut reader = Reader::new(&buf);
        assert_eq!(reader.read_string().unwrap(), "system.local");
        assert_eq!(reader.read_long_string().unwrap(), "SELECT * FROM system.local");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_bytes_null_marker() {
        let mut buf = BytesMut::new();
        write_bytes(&mut buf, Some(b"abc"));
        write_bytes(&mut buf, None);
        let mut reader = Reader::new(&buf);
        assert_eq!(reader.read_bytes().unwrap(), Some(&b"abc"[..]));
        assert_eq!(reader.read_bytes().unwrap(), None);
    }

    #[test]
    fn test_string_map_round_trip() {
        let mut map = HashMap::new();
        map.insert("CQL_VERSION".to_string(), "3.0.0".to_string());
        map.insert("COMPRESSION".to_string(), "lz4".to_string());
        let mut buf = BytesMut::new();
        write_string_map(&mut buf, &map);
        let mut reader = Reader::new(&buf);
        assert_eq!(reader.read_string_map().unwrap(), map);
    }

    #[test]
    fn test_truncated_input_is_explicit() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "abcdef");
        let mut reader = Reader::new(&buf[..4]);
        let err = reader.read_string().unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_inet_round_trip() {
        // [inetaddr] has a one-byte size prefix, then the address bytes
        let mut buf = BytesMut::new();
        buf.put_u8(4);
        buf.put_slice(&[127, 0, 0, 1]);
        buf.put_i32(9042);
        let mut reader = Reader::new(&buf);
        let addr = reader.read_inet().unwrap();
        assert_eq!(addr, "127.0.0.1:9042".parse().unwrap());
    }

    #[test]
    fn test_unsigned_vint_boundaries() {
        let cases: &[u64] = &[
            0,
            1,
            127,
            128,
            255,
            16383,
            16384,
            u32::MAX as u64,
            u64::MAX / 2,
            u64::MAX,
        ];
        for &value in cases {
            let mut buf = BytesMut::new();
            write_unsigned_vint(&mut buf, value);
            let mut reader = Reader::new(&buf);
            assert_eq!(reader.read_unsigned_vint().unwrap(), value, "value {value}");
            assert_eq!(reader.remaining(), 0);
        }
    }

    #[test]
    fn test_signed_vint_zigzag() {
        for &value in &[0i64, -1, 1, -2, 2, 300, -300, i64::MIN, i64::MAX] {
            let mut buf = BytesMut::new();
            write_vint(&mut buf, value);
            let mut reader = Reader::new(&buf);
            assert_eq!(reader.read_vint().unwrap(), value, "value {value}");
        }
    }

    #[test]
    fn test_small_vint_is_single_byte() {
        let mut buf = BytesMut::new();
        write_unsigned_vint(&mut buf, 100);
        assert_eq!(buf.len(), 1);
        buf.clear();
        write_unsigned_vint(&mut buf, 128);
        assert_eq!(buf.len(), 2);
    }
}
