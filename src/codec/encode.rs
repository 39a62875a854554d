// Value serialization
//
// Encodes `CqlValue`s into their wire representation, driven by an optional
// type hint. A hint that cannot hold the value fails with TypeMismatch;
// widening conversions (tinyint -> int, int -> bigint, float -> double,
// any integer -> varint) are applied silently, narrowing ones only when the
// value fits. Null is length -1 on the wire; "unset" is length -2 and only
// exists from protocol v4 on.

use bytes::{BufMut, BytesMut};

use super::types::CqlType;
use super::value::{varint_bytes_from_i128, CqlValue, QueryValue, DATE_EPOCH_OFFSET};
use crate::error::{DriverError, Result};
use crate::frame::notation;
use crate::frame::ProtocolVersion;

pub const NANOS_PER_DAY: i64 = 86_400_000_000_000;

fn mismatch(expected: &CqlType, value: &CqlValue) -> DriverError {
    DriverError::TypeMismatch {
        expected: expected.to_string(),
        actual: value.cql_type().to_string(),
    }
}

/// Serialize a value to its raw body bytes (no length prefix).
pub fn serialize(
    value: &CqlValue,
    hint: Option<&CqlType>,
    version: ProtocolVersion,
) -> Result<Vec<u8>> {
    match hint {
        Some(cql_type) => serialize_hinted(value, cql_type, version),
        None => serialize_hinted(value, &value.cql_type(), version),
    }
}

fn serialize_hinted(
    value: &CqlValue,
    cql_type: &CqlType,
    version: ProtocolVersion,
) -> Result<Vec<u8>> {
    match cql_type {
        CqlType::Ascii => {
            let text = value.as_text().ok_or_else(|| mismatch(cql_type, value))?;
            if !text.is_ascii() {
                return Err(mismatch(cql_type, value));
            }
            Ok(text.as_bytes().to_vec())
        }
        CqlType::Text | CqlType::Varchar => {
            let text = value.as_text().ok_or_else(|| mismatch(cql_type, value))?;
            Ok(text.as_bytes().to_vec())
        }
        CqlType::Blob | CqlType::Custom(_) => match value {
            CqlValue::Blob(bytes) => Ok(bytes.clone()),
            _ => Err(mismatch(cql_type, value)),
        },
        CqlType::Boolean => match value {
            CqlValue::Boolean(b) => Ok(vec![u8::from(*b)]),
            _ => Err(mismatch(cql_type, value)),
        },
        CqlType::Tinyint => {
            let wide = integer_value(value).ok_or_else(|| mismatch(cql_type, value))?;
            let narrow =
                i8::try_from(wide).map_err(|_| mismatch(cql_type, value))?;
            Ok(narrow.to_be_bytes().to_vec())
        }
        CqlType::Smallint => {
            let wide = integer_value(value).ok_or_else(|| mismatch(cql_type, value))?;
            let narrow =
                i16::try_from(wide).map_err(|_| mismatch(cql_type, value))?;
            Ok(narrow.to_be_bytes().to_vec())
        }
        CqlType::Int => {
            let wide = integer_value(value).ok_or_else(|| mismatch(cql_type, value))?;
            let narrow =
                i32::try_from(wide).map_err(|_| mismatch(cql_type, value))?;
            Ok(narrow.to_be_bytes().to_vec())
        }
        CqlType::Bigint | CqlType::Counter => {
            let wide = integer_value(value).ok_or_else(|| mismatch(cql_type, value))?;
            Ok(wide.to_be_bytes().to_vec())
        }
        CqlType::Varint => match value {
            CqlValue::Varint(bytes) => Ok(bytes.clone()),
            _ => {
                let wide = integer_value(value).ok_or_else(|| mismatch(cql_type, value))?;
                Ok(varint_bytes_from_i128(wide as i128))
            }
        },
        CqlType::Decimal => match value {
            CqlValue::Decimal(decimal) => {
                let mut out = BytesMut::with_capacity(4 + decimal.unscaled.len());
                out.put_i32(decimal.scale);
                out.put_slice(&decimal.unscaled);
                Ok(out.to_vec())
            }
            _ => Err(mismatch(cql_type, value)),
        },
        CqlType::Float => match value {
            CqlValue::Float(f) => Ok(f.to_be_bytes().to_vec()),
            _ => Err(mismatch(cql_type, value)),
        },
        CqlType::Double => match value {
            CqlValue::Double(d) => Ok(d.to_be_bytes().to_vec()),
            CqlValue::Float(f) => Ok((*f as f64).to_be_bytes().to_vec()),
            _ => Err(mismatch(cql_type, value)),
        },
        CqlType::Timestamp => match value {
            CqlValue::Timestamp(ms) => Ok(ms.to_be_bytes().to_vec()),
            _ => {
                let wide = integer_value(value).ok_or_else(|| mismatch(cql_type, value))?;
                Ok(wide.to_be_bytes().to_vec())
            }
        },
        CqlType::Date => {
            let days = match value {
                CqlValue::Date(days) => *days,
                CqlValue::Int(days) => *days,
                _ => return Err(mismatch(cql_type, value)),
            };
            let wire = (days as i64 + DATE_EPOCH_OFFSET as i64) as u32;
            Ok(wire.to_be_bytes().to_vec())
        }
        CqlType::Time => {
            let nanos = match value {
                CqlValue::Time(nanos) => *nanos,
                CqlValue::Bigint(nanos) => *nanos,
                _ => return Err(mismatch(cql_type, value)),
            };
            if !(0..NANOS_PER_DAY).contains(&nanos) {
                return Err(mismatch(cql_type, value));
            }
            Ok(nanos.to_be_bytes().to_vec())
        }
        CqlType::Uuid => match value {
            CqlValue::Uuid(uuid) | CqlValue::Timeuuid(uuid) => {
                Ok(uuid.as_bytes().to_vec())
            }
            _ => Err(mismatch(cql_type, value)),
        },
        CqlType::Timeuuid => match value {
            CqlValue::Timeuuid(uuid) => Ok(uuid.as_bytes().to_vec()),
            _ => Err(mismatch(cql_type, value)),
        },
        CqlType::Inet => match value {
            CqlValue::Inet(addr) => Ok(match addr {
                std::net::IpAddr::V4(v4) => v4.octets().to_vec(),
                std::net::IpAddr::V6(v6) => v6.octets().to_vec(),
            }),
            _ => Err(mismatch(cql_type, value)),
        },
        CqlType::Duration => match value {
            CqlValue::Duration(duration) => {
                let mut out = BytesMut::new();
                notation::write_vint(&mut out, duration.months as i64);
                notation::write_vint(&mut out, duration.days as i64);
                notation::write_vint(&mut out, duration.nanoseconds);
                Ok(out.to_vec())
            }
            _ => Err(mismatch(cql_type, value)),
        },
        CqlType::List(element_type) => match value {
            CqlValue::List(items) | CqlValue::Set(items) => {
                serialize_collection(items, element_type, version)
            }
            _ => Err(mismatch(cql_type, value)),
        },
        CqlType::Set(element_type) => match value {
            CqlValue::Set(items) | CqlValue::List(items) => {
                serialize_collection(items, element_type, version)
            }
            _ => Err(mismatch(cql_type, value)),
        },
        CqlType::Map(key_type, value_type) => match value {
            CqlValue::Map(entries) => {
                let mut out = BytesMut::new();
                out.put_i32(entries.len() as i32);
                for (key, entry_value) in entries {
                    let key_bytes = serialize_hinted(key, key_type, version)?;
                    notation::write_bytes(&mut out, Some(&key_bytes));
                    let value_bytes = serialize_hinted(entry_value, value_type, version)?;
                    notation::write_bytes(&mut out, Some(&value_bytes));
                }
                Ok(out.to_vec())
            }
            _ => Err(mismatch(cql_type, value)),
        },
        CqlType::Tuple(component_types) => match value {
            CqlValue::Tuple(parts) => {
                if parts.len() > component_types.len() {
                    return Err(mismatch(cql_type, value));
                }
                let mut out = BytesMut::new();
                for (part, part_type) in parts.iter().zip(component_types) {
                    match part {
                        Some(part_value) => {
                            let bytes = serialize_hinted(part_value, part_type, version)?;
                            notation::write_bytes(&mut out, Some(&bytes));
                        }
                        None => notation::write_bytes(&mut out, None),
                    }
                }
                Ok(out.to_vec())
            }
            _ => Err(mismatch(cql_type, value)),
        },
        CqlType::Udt(udt_type) => match value {
            CqlValue::Udt { fields, .. } => {
                let mut out = BytesMut::new();
                for (field_name, field_type) in &udt_type.fields {
                    let field_value = fields
                        .iter()
                        .find(|(name, _)| name == field_name)
                        .and_then(|(_, v)| v.as_ref());
                    match field_value {
                        Some(inner) => {
                            let bytes = serialize_hinted(inner, field_type, version)?;
                            notation::write_bytes(&mut out, Some(&bytes));
                        }
                        None => notation::write_bytes(&mut out, None),
                    }
                }
                Ok(out.to_vec())
            }
            _ => Err(mismatch(cql_type, value)),
        },
    }
}

fn serialize_collection(
    items: &[CqlValue],
    element_type: &CqlType,
    version: ProtocolVersion,
) -> Result<Vec<u8>> {
    let mut out = BytesMut::new();
    out.put_i32(items.len() as i32);
    for item in items {
        let bytes = serialize_hinted(item, element_type, version)?;
        notation::write_bytes(&mut out, Some(&bytes));
    }
    Ok(out.to_vec())
}

/// The integer content of a value, for widening/narrowing conversions.
fn integer_value(value: &CqlValue) -> Option<i64> {
    match value {
        CqlValue::Tinyint(v) => Some(*v as i64),
        CqlValue::Smallint(v) => Some(*v as i64),
        CqlValue::Int(v) => Some(*v as i64),
        CqlValue::Bigint(v) | CqlValue::Counter(v) | CqlValue::Timestamp(v) => Some(*v),
        _ => None,
    }
}

/// Write a query parameter as a length-prefixed [value].
pub fn write_query_value(
    out: &mut BytesMut,
    value: &QueryValue,
    hint: Option<&CqlType>,
    version: ProtocolVersion,
) -> Result<()> {
    match value {
        QueryValue::Null => {
            notation::write_bytes(out, None);
            Ok(())
        }
        QueryValue::Unset => {
            if !version.supports_unset() {
                return Err(DriverError::Argument(format!(
                    "unset values require protocol v4+, connection is {version}"
                )));
            }
            notation::write_unset(out);
            Ok(())
        }
        QueryValue::Value(inner) => {
            let bytes = serialize(inner, hint, version)?;
            notation::write_bytes(out, Some(&bytes));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::value::CqlDuration;

    const V4: ProtocolVersion = ProtocolVersion::V4;

    #[test]
    fn test_bigint_full_range() {
        for value in [i64::MIN, -1, 0, 1, i64::MAX] {
            let bytes = serialize(&CqlValue::Bigint(value), Some(&CqlType::Bigint), V4).unwrap();
            assert_eq!(bytes, value.to_be_bytes().to_vec());
        }
    }

    #[test]
    fn test_int_widening_and_narrowing() {
        // int value into bigint hint widens
        let bytes = serialize(&CqlValue::Int(7), Some(&CqlType::Bigint), V4).unwrap();
        assert_eq!(bytes.len(), 8);
        // in-range bigint narrows into int
        let bytes = serialize(&CqlValue::Bigint(300), Some(&CqlType::Int), V4).unwrap();
        assert_eq!(bytes, 300i32.to_be_bytes().to_vec());
        // out-of-range narrowing is a mismatch
        let err = serialize(&CqlValue::Bigint(i64::MAX), Some(&CqlType::Int), V4).unwrap_err();
        assert!(matches!(err, DriverError::TypeMismatch { .. }));
    }

    #[test]
    fn test_ascii_hint_rejects_non_ascii() {
        let err = serialize(
            &CqlValue::Text("żółw".to_string()),
            Some(&CqlType::Ascii),
            V4,
        )
        .unwrap_err();
        assert!(matches!(err, DriverError::TypeMismatch { .. }));
    }

    #[test]
    fn test_date_wire_offset() {
        // 1970-01-01 is epoch day 0, wire value 2^31
        let bytes = serialize(&CqlValue::Date(0), Some(&CqlType::Date), V4).unwrap();
        assert_eq!(bytes, 0x8000_0000u32.to_be_bytes().to_vec());
        // 0001-01-01 is epoch day -719162
        let bytes = serialize(&CqlValue::Date(-719162), Some(&CqlType::Date), V4).unwrap();
        let wire = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(wire as i64, (1i64 << 31) - 719162);
    }

    #[test]
    fn test_time_range_check() {
        // "14:29:31.8" in nanoseconds of day
        let nanos = 52_171_800_000_000i64;
        let bytes = serialize(&CqlValue::Time(nanos), Some(&CqlType::Time), V4).unwrap();
        assert_eq!(bytes, nanos.to_be_bytes().to_vec());
        assert!(serialize(&CqlValue::Time(NANOS_PER_DAY), Some(&CqlType::Time), V4).is_err());
        assert!(serialize(&CqlValue::Time(-1), Some(&CqlType::Time), V4).is_err());
    }

    #[test]
    fn test_duration_vint_triple() {
        // 1 year 3 months, 2h10m: months=15, days=0, nanos=7800s
        let duration = CqlDuration::new(15, 0, 7_800_000_000_000);
        let bytes = serialize(&CqlValue::Duration(duration), Some(&CqlType::Duration), V4).unwrap();
        let mut reader = crate::frame::notation::Reader::new(&bytes);
        assert_eq!(reader.read_vint().unwrap(), 15);
        assert_eq!(reader.read_vint().unwrap(), 0);
        assert_eq!(reader.read_vint().unwrap(), 7_800_000_000_000);
    }

    #[test]
    fn test_collection_with_element_hint() {
        let list = CqlValue::List(vec![CqlValue::Int(1), CqlValue::Int(2)]);
        let bytes = serialize(&list, Some(&CqlType::List(Box::new(CqlType::Bigint))), V4).unwrap();
        // count + 2 * (length prefix + 8 bytes)
        assert_eq!(bytes.len(), 4 + 2 * (4 + 8));
    }

    #[test]
    fn test_unset_requires_v4() {
        let mut out = BytesMut::new();
        assert!(write_query_value(&mut out, &QueryValue::Unset, None, ProtocolVersion::V3).is_err());
        write_query_value(&mut out, &QueryValue::Unset, None, V4).unwrap();
        assert_eq!(&out[..], &(-2i32).to_be_bytes()[..]);
    }

    #[test]
    fn test_null_is_minus_one() {
        let mut out = BytesMut::new();
        write_query_value(&mut out, &QueryValue::Null, None, V4).unwrap();
        assert_eq!(&out[..], &(-1i32).to_be_bytes()[..]);
    }
}
