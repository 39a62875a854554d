// Hint-free type guessing
//
// When a statement is not prepared the driver has no column metadata, so
// parameter types are derived from the native value deterministically:
// integers map to int or bigint based on range, floats to double, byte
// arrays to blob, dates to timestamp, strings to text.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::value::CqlValue;

impl From<bool> for CqlValue {
    fn from(value: bool) -> Self {
        CqlValue::Boolean(value)
    }
}

impl From<i32> for CqlValue {
    fn from(value: i32) -> Self {
        CqlValue::Int(value)
    }
}

/// Range-based guess: values that fit a 32-bit int become int, wider ones
/// become bigint.
impl From<i64> for CqlValue {
    fn from(value: i64) -> Self {
        match i32::try_from(value) {
            Ok(narrow) => CqlValue::Int(narrow),
            Err(_) => CqlValue::Bigint(value),
        }
    }
}

impl From<f32> for CqlValue {
    fn from(value: f32) -> Self {
        CqlValue::Double(value as f64)
    }
}

impl From<f64> for CqlValue {
    fn from(value: f64) -> Self {
        CqlValue::Double(value)
    }
}

impl From<&str> for CqlValue {
    fn from(value: &str) -> Self {
        CqlValue::Text(value.to_string())
    }
}

impl From<String> for CqlValue {
    fn from(value: String) -> Self {
        CqlValue::Text(value)
    }
}

impl From<Vec<u8>> for CqlValue {
    fn from(value: Vec<u8>) -> Self {
        CqlValue::Blob(value)
    }
}

impl From<&[u8]> for CqlValue {
    fn from(value: &[u8]) -> Self {
        CqlValue::Blob(value.to_vec())
    }
}

impl From<Uuid> for CqlValue {
    fn from(value: Uuid) -> Self {
        CqlValue::Uuid(value)
    }
}

impl From<IpAddr> for CqlValue {
    fn from(value: IpAddr) -> Self {
        CqlValue::Inet(value)
    }
}

impl From<DateTime<Utc>> for CqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        CqlValue::Timestamp(value.timestamp_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::types::CqlType;

    #[test]
    fn test_integer_guess_by_range() {
        assert_eq!(CqlValue::from(7i64), CqlValue::Int(7));
        assert_eq!(CqlValue::from(i32::MAX as i64), CqlValue::Int(i32::MAX));
        assert_eq!(
            CqlValue::from(i32::MAX as i64 + 1),
            CqlValue::Bigint(i32::MAX as i64 + 1)
        );
        assert_eq!(CqlValue::from(i64::MIN), CqlValue::Bigint(i64::MIN));
    }

    #[test]
    fn test_float_guesses_double() {
        assert_eq!(CqlValue::from(1.5f32).cql_type(), CqlType::Double);
        assert_eq!(CqlValue::from(1.5f64).cql_type(), CqlType::Double);
    }

    #[test]
    fn test_other_guesses() {
        assert_eq!(CqlValue::from("hi").cql_type(), CqlType::Text);
        assert_eq!(CqlValue::from(vec![1u8, 2]).cql_type(), CqlType::Blob);
        let when = DateTime::<Utc>::from_timestamp_millis(86_400_000).unwrap();
        assert_eq!(CqlValue::from(when), CqlValue::Timestamp(86_400_000));
    }
}
