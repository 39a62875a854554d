// Value deserialization
//
// Decodes raw column bytes into `CqlValue`s, driven by the column type from
// result metadata. Lengths were already resolved by the row reader; these
// functions receive exactly the value's bytes.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use uuid::Uuid;

use super::types::CqlType;
use super::value::{CqlDecimal, CqlDuration, CqlValue, DATE_EPOCH_OFFSET};
use crate::error::{DriverError, Result};
use crate::frame::notation::Reader;
use crate::frame::ProtocolVersion;

fn expect_len(cql_type: &CqlType, bytes: &[u8], expected: usize) -> Result<()> {
    if bytes.len() != expected {
        return Err(DriverError::Protocol(format!(
            "invalid {cql_type} value: expected {expected} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(())
}

/// Decode one value of the given type.
pub fn deserialize(
    bytes: &[u8],
    cql_type: &CqlType,
    version: ProtocolVersion,
) -> Result<CqlValue> {
    match cql_type {
        CqlType::Ascii => Ok(CqlValue::Ascii(utf8(cql_type, bytes)?)),
        CqlType::Text | CqlType::Varchar => Ok(CqlValue::Text(utf8(cql_type, bytes)?)),
        CqlType::Blob | CqlType::Custom(_) => Ok(CqlValue::Blob(bytes.to_vec())),
        CqlType::Boolean => {
            expect_len(cql_type, bytes, 1)?;
            Ok(CqlValue::Boolean(bytes[0] != 0))
        }
        CqlType::Tinyint => {
            expect_len(cql_type, bytes, 1)?;
            Ok(CqlValue::Tinyint(bytes[0] as i8))
        }
        CqlType::Smallint => {
            expect_len(cql_type, bytes, 2)?;
            Ok(CqlValue::Smallint(i16::from_be_bytes([bytes[0], bytes[1]])))
        }
        CqlType::Int => {
            expect_len(cql_type, bytes, 4)?;
            Ok(CqlValue::Int(i32::from_be_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3],
            ])))
        }
        CqlType::Bigint => {
            expect_len(cql_type, bytes, 8)?;
            Ok(CqlValue::Bigint(long(bytes)))
        }
        CqlType::Counter => {
            expect_len(cql_type, bytes, 8)?;
            Ok(CqlValue::Counter(long(bytes)))
        }
        CqlType::Timestamp => {
            expect_len(cql_type, bytes, 8)?;
            Ok(CqlValue::Timestamp(long(bytes)))
        }
        CqlType::Time => {
            expect_len(cql_type, bytes, 8)?;
            Ok(CqlValue::Time(long(bytes)))
        }
        CqlType::Float => {
            expect_len(cql_type, bytes, 4)?;
            Ok(CqlValue::Float(f32::from_be_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3],
            ])))
        }
        CqlType::Double => {
            expect_len(cql_type, bytes, 8)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            Ok(CqlValue::Double(f64::from_be_bytes(raw)))
        }
        CqlType::Varint => {
            if bytes.is_empty() {
                return Err(DriverError::Protocol("empty varint value".to_string()));
            }
            Ok(CqlValue::Varint(bytes.to_vec()))
        }
        CqlType::Decimal => {
            if bytes.len() < 5 {
                return Err(DriverError::Protocol(format!(
                    "invalid decimal value: {} bytes",
                    bytes.len()
                )));
            }
            let scale = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            Ok(CqlValue::Decimal(CqlDecimal {
                scale,
                unscaled: bytes[4..].to_vec(),
            }))
        }
        CqlType::Uuid => {
            expect_len(cql_type, bytes, 16)?;
            Ok(CqlValue::Uuid(uuid(bytes)))
        }
        CqlType::Timeuuid => {
            expect_len(cql_type, bytes, 16)?;
            Ok(CqlValue::Timeuuid(uuid(bytes)))
        }
        CqlType::Inet => match bytes.len() {
            4 => Ok(CqlValue::Inet(IpAddr::V4(Ipv4Addr::new(
                bytes[0], bytes[1], bytes[2], bytes[3],
            )))),
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(bytes);
                Ok(CqlValue::Inet(IpAddr::V6(Ipv6Addr::from(octets))))
            }
            other => Err(DriverError::Protocol(format!(
                "invalid inet value length {other}"
            ))),
        },
        CqlType::Date => {
            expect_len(cql_type, bytes, 4)?;
            let wire = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            Ok(CqlValue::Date(
                (wire as i64 - DATE_EPOCH_OFFSET as i64) as i32,
            ))
        }
        CqlType::Duration => {
            let mut reader = Reader::new(bytes);
            let months = reader.read_vint()?;
            let days = reader.read_vint()?;
            let nanoseconds = reader.read_vint()?;
            Ok(CqlValue::Duration(CqlDuration {
                months: months as i32,
                days: days as i32,
                nanoseconds,
            }))
        }
        CqlType::List(element_type) => {
            Ok(CqlValue::List(collection(bytes, element_type, version)?))
        }
        CqlType::Set(element_type) => {
            Ok(CqlValue::Set(collection(bytes, element_type, version)?))
        }
        CqlType::Map(key_type, value_type) => {
            let mut reader = Reader::new(bytes);
            let count = reader.read_int()?;
            if count < 0 {
                return Err(DriverError::Protocol("negative map length".to_string()));
            }
            let mut entries = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let key_bytes = reader.read_bytes()?.ok_or_else(|| {
                    DriverError::Protocol("null key inside map value".to_string())
                })?;
                let key = deserialize(key_bytes, key_type, version)?;
                let value_bytes = reader.read_bytes()?.ok_or_else(|| {
                    DriverError::Protocol("null value inside map value".to_string())
                })?;
                let value = deserialize(value_bytes, value_type, version)?;
                entries.push((key, value));
            }
            Ok(CqlValue::Map(entries))
        }
        CqlType::Tuple(component_types) => {
            let mut reader = Reader::new(bytes);
            let mut parts = Vec::with_capacity(component_types.len());
            for component_type in component_types {
                // Trailing components may be absent entirely
                if reader.remaining() == 0 {
                    parts.push(None);
                    continue;
                }
                let part = match reader.read_bytes()? {
                    Some(part_bytes) => Some(deserialize(part_bytes, component_type, version)?),
                    None => None,
                };
                parts.push(part);
            }
            Ok(CqlValue::Tuple(parts))
        }
        CqlType::Udt(udt_type) => {
            let mut reader = Reader::new(bytes);
            let mut fields = Vec::with_capacity(udt_type.fields.len());
            for (field_name, field_type) in &udt_type.fields {
                if reader.remaining() == 0 {
                    fields.push((field_name.clone(), None));
                    continue;
                }
                let value = match reader.read_bytes()? {
                    Some(field_bytes) => Some(deserialize(field_bytes, field_type, version)?),
                    None => None,
                };
                fields.push((field_name.clone(), value));
            }
            Ok(CqlValue::Udt {
                keyspace: udt_type.keyspace.clone(),
                name: udt_type.name.clone(),
                fields,
            })
        }
    }
}

fn utf8(cql_type: &CqlType, bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| DriverError::Protocol(format!("invalid UTF-8 in {cql_type} value: {e}")))
}

fn long(bytes: &[u8]) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    i64::from_be_bytes(raw)
}

fn uuid(bytes: &[u8]) -> Uuid {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(bytes);
    Uuid::from_bytes(raw)
}

fn collection(
    bytes: &[u8],
    element_type: &CqlType,
    version: ProtocolVersion,
) -> Result<Vec<CqlValue>> {
    let mut reader = Reader::new(bytes);
    let count = reader.read_int()?;
    if count < 0 {
        return Err(DriverError::Protocol("negative collection length".to_string()));
    }
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let item_bytes = reader.read_bytes()?.ok_or_else(|| {
            DriverError::Protocol("null element inside collection value".to_string())
        })?;
        items.push(deserialize(item_bytes, element_type, version)?);
    }
    Ok(items)
}
