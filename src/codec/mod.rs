// CQL value codec
//
// Type-driven encode/decode between language-native values and the wire
// format. The type system is a closed enumeration (`CqlType`); values are
// modeled by `CqlValue`, parameters by `QueryValue` (value / null / unset).

pub mod decode;
pub mod encode;
pub mod guess;
pub mod types;
pub mod value;

pub use decode::deserialize;
pub use encode::{serialize, write_query_value};
pub use types::{CqlType, UdtType};
pub use value::{CqlDecimal, CqlDuration, CqlValue, QueryValue};
