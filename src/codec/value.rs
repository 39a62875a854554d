// Language-native value model
//
// `CqlValue` is the decoded form of every CQL value the driver can move
// across the wire. Variants mirror the type enumeration; a handful of
// helpers cover the representations that need arithmetic (varint two's
// complement, the date epoch offset, time-UUID layout).

use std::net::IpAddr;

use uuid::Uuid;

use super::types::CqlType;

/// Days between 0001-01-01 and 1970-01-01 in the proleptic Gregorian
/// calendar; the `date` type stores days since epoch offset by 2^31.
pub const DATE_EPOCH_OFFSET: u32 = 1 << 31;

/// 100-ns intervals between the Gregorian epoch (1582-10-15) and the Unix
/// epoch, used by the time-UUID timestamp field.
pub const GREGORIAN_UNIX_OFFSET_100NS: u64 = 0x01B2_1DD2_1381_4000;

/// A CQL duration: months, days and nanoseconds, each independently signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqlDuration {
    pub months: i32,
    pub days: i32,
    pub nanoseconds: i64,
}

impl CqlDuration {
    pub fn new(months: i32, days: i32, nanoseconds: i64) -> Self {
        CqlDuration {
            months,
            days,
            nanoseconds,
        }
    }
}

/// A decimal: unscaled arbitrary-precision integer plus a base-10 scale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CqlDecimal {
    pub scale: i32,
    /// Two's-complement big-endian unscaled value.
    pub unscaled: Vec<u8>,
}

impl CqlDecimal {
    pub fn from_i128(scale: i32, unscaled: i128) -> Self {
        CqlDecimal {
            scale,
            unscaled: varint_bytes_from_i128(unscaled),
        }
    }
}

/// A decoded CQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum CqlValue {
    Ascii(String),
    Bigint(i64),
    Blob(Vec<u8>),
    Boolean(bool),
    Counter(i64),
    Decimal(CqlDecimal),
    Double(f64),
    Float(f32),
    Int(i32),
    Text(String),
    /// Milliseconds since the Unix epoch, signed.
    Timestamp(i64),
    Uuid(Uuid),
    /// Arbitrary-precision two's-complement big-endian integer.
    Varint(Vec<u8>),
    Timeuuid(Uuid),
    Inet(IpAddr),
    /// Days since the Unix epoch, signed (wire form is offset by 2^31).
    Date(i32),
    /// Nanoseconds of day, in [0, 86_400_000_000_000).
    Time(i64),
    Smallint(i16),
    Tinyint(i8),
    Duration(CqlDuration),
    List(Vec<CqlValue>),
    Map(Vec<(CqlValue, CqlValue)>),
    Set(Vec<CqlValue>),
    Udt {
        keyspace: String,
        name: String,
        fields: Vec<(String, Option<CqlValue>)>,
    },
    Tuple(Vec<Option<CqlValue>>),
}

impl CqlValue {
    /// Build a varint value out of an `i128`.
    pub fn varint_from_i128(value: i128) -> CqlValue {
        CqlValue::Varint(varint_bytes_from_i128(value))
    }

    /// A time-UUID whose timestamp field encodes `unix_ms`, with zero clock
    /// sequence and node bytes. The variant bits are set per RFC 4122.
    pub fn timeuuid_from_unix_ms(unix_ms: i64) -> CqlValue {
        let greg_100ns = (unix_ms as i128 * 10_000 + GREGORIAN_UNIX_OFFSET_100NS as i128) as u64;
        let time_low = (greg_100ns & 0xffff_ffff) as u32;
        let time_mid = ((greg_100ns >> 32) & 0xffff) as u16;
        let time_hi_and_version = (((greg_100ns >> 48) & 0x0fff) as u16) | 0x1000;
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&time_low.to_be_bytes());
        bytes[4..6].copy_from_slice(&time_mid.to_be_bytes());
        bytes[6..8].copy_from_slice(&time_hi_and_version.to_be_bytes());
        bytes[8] = 0x80;
        CqlValue::Timeuuid(Uuid::from_bytes(bytes))
    }

    /// The most specific type for this value, used when no hint is given
    /// and for error messages.
    pub fn cql_type(&self) -> CqlType {
        match self {
            CqlValue::Ascii(_) => CqlType::Ascii,
            CqlValue::Bigint(_) => CqlType::Bigint,
            CqlValue::Blob(_) => CqlType::Blob,
            CqlValue::Boolean(_) => CqlType::Boolean,
            CqlValue::Counter(_) => CqlType::Counter,
            CqlValue::Decimal(_) => CqlType::Decimal,
            CqlValue::Double(_) => CqlType::Double,
            CqlValue::Float(_) => CqlType::Float,
            CqlValue::Int(_) => CqlType::Int,
            CqlValue::Text(_) => CqlType::Text,
            CqlValue::Timestamp(_) => CqlType::Timestamp,
            CqlValue::Uuid(_) => CqlType::Uuid,
            CqlValue::Varint(_) => CqlType::Varint,
            CqlValue::Timeuuid(_) => CqlType::Timeuuid,
            CqlValue::Inet(_) => CqlType::Inet,
            CqlValue::Date(_) => CqlType::Date,
            CqlValue::Time(_) => CqlType::Time,
            CqlValue::Smallint(_) => CqlType::Smallint,
            CqlValue::Tinyint(_) => CqlType::Tinyint,
            CqlValue::Duration(_) => CqlType::Duration,
            CqlValue::List(items) => CqlType::List(Box::new(
                items
                    .first()
                    .map(CqlValue::cql_type)
                    .unwrap_or(CqlType::Blob),
            )),
            CqlValue::Map(entries) => match entries.first() {
                Some((key, value)) => {
                    CqlType::Map(Box::new(key.cql_type()), Box::new(value.cql_type()))
                }
                None => CqlType::Map(Box::new(CqlType::Blob), Box::new(CqlType::Blob)),
            },
            CqlValue::Set(items) => CqlType::Set(Box::new(
                items
                    .first()
                    .map(CqlValue::cql_type)
                    .unwrap_or(CqlType::Blob),
            )),
            CqlValue::Udt {
                keyspace,
                name,
                fields,
            } => CqlType::Udt(super::types::UdtType {
                keyspace: keyspace.clone(),
                name: name.clone(),
                fields: fields
                    .iter()
                    .map(|(field_name, value)| {
                        (
                            field_name.clone(),
                            value.as_ref().map(CqlValue::cql_type).unwrap_or(CqlType::Blob),
                        )
                    })
                    .collect(),
            }),
            CqlValue::Tuple(parts) => CqlType::Tuple(
                parts
                    .iter()
                    .map(|part| part.as_ref().map(CqlValue::cql_type).unwrap_or(CqlType::Blob))
                    .collect(),
            ),
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            CqlValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bigint(&self) -> Option<i64> {
        match self {
            CqlValue::Bigint(v) | CqlValue::Counter(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CqlValue::Text(s) | CqlValue::Ascii(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            CqlValue::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            CqlValue::Uuid(u) | CqlValue::Timeuuid(u) => Some(*u),
            _ => None,
        }
    }
}

/// A bound query parameter: a concrete value, an explicit null, or the
/// v4+ "unset" marker that leaves the column untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Value(CqlValue),
    Null,
    Unset,
}

impl From<CqlValue> for QueryValue {
    fn from(value: CqlValue) -> Self {
        QueryValue::Value(value)
    }
}

impl<T: Into<CqlValue>> From<Option<T>> for QueryValue {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(inner) => QueryValue::Value(inner.into()),
            None => QueryValue::Null,
        }
    }
}

/// Minimal two's-complement big-endian encoding of an `i128`.
pub fn varint_bytes_from_i128(value: i128) -> Vec<u8> {
    let all = value.to_be_bytes();
    // Strip redundant sign bytes, keeping the sign bit of the first kept
    // byte intact.
    let mut start = 0;
    while start < 15 {
        let byte = all[start];
        let next = all[start + 1];
        let redundant = (byte == 0x00 && next & 0x80 == 0) || (byte == 0xff && next & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    all[start..].to_vec()
}

/// Sign-extending decode of two's-complement big-endian bytes. Values wider
/// than 128 bits are out of range.
pub fn varint_bytes_to_i128(bytes: &[u8]) -> Option<i128> {
    if bytes.is_empty() || bytes.len() > 16 {
        return None;
    }
    let negative = bytes[0] & 0x80 != 0;
    let mut all = if negative { [0xffu8; 16] } else { [0u8; 16] };
    all[16 - bytes.len()..].copy_from_slice(bytes);
    Some(i128::from_be_bytes(all))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_minimal_encoding() {
        assert_eq!(varint_bytes_from_i128(0), vec![0x00]);
        assert_eq!(varint_bytes_from_i128(-1), vec![0xff]);
        assert_eq!(varint_bytes_from_i128(127), vec![0x7f]);
        assert_eq!(varint_bytes_from_i128(128), vec![0x00, 0x80]);
        assert_eq!(varint_bytes_from_i128(-128), vec![0x80]);
        assert_eq!(varint_bytes_from_i128(-129), vec![0xff, 0x7f]);
    }

    #[test]
    fn test_varint_reference_vector() {
        // -988229782938247303441911118 <-> fcce8e341f053d299a4872b2
        let expected: Vec<u8> = vec![
            0xfc, 0xce, 0x8e, 0x34, 0x1f, 0x05, 0x3d, 0x29, 0x9a, 0x48, 0x72, 0xb2,
        ];
        let value: i128 = -988229782938247303441911118;
        assert_eq!(varint_bytes_from_i128(value), expected);
        assert_eq!(varint_bytes_to_i128(&expected), Some(value));
    }

    #[test]
    fn test_varint_round_trip_sweep() {
        for value in [
            0i128,
            1,
            -1,
            i64::MAX as i128,
            i64::MIN as i128,
            i128::MAX,
            i128::MIN,
            255,
            -256,
            65535,
        ] {
            let bytes = varint_bytes_from_i128(value);
            assert_eq!(varint_bytes_to_i128(&bytes), Some(value), "value {value}");
        }
    }

    #[test]
    fn test_timeuuid_epoch_fixture() {
        // Unix epoch in time-UUID form
        let value = CqlValue::timeuuid_from_unix_ms(0);
        match value {
            CqlValue::Timeuuid(uuid) => {
                assert_eq!(
                    uuid.to_string(),
                    "13814000-1dd2-11b2-8000-000000000000"
                );
            }
            other => panic!("expected timeuuid, got {other:?}"),
        }
    }

    #[test]
    fn test_guessed_collection_types() {
        let list = CqlValue::List(vec![CqlValue::Int(1), CqlValue::Int(2)]);
        assert_eq!(list.cql_type().to_string(), "list<int>");
        let map = CqlValue::Map(vec![(CqlValue::Text("k".into()), CqlValue::Bigint(1))]);
        assert_eq!(map.cql_type().to_string(), "map<text, bigint>");
    }
}
