// CQL data type identifiers
//
// The type system is a closed enumeration. Scalar types map 1:1 to a wire
// code; parameterized types (list/set/map/tuple/udt/custom) carry their
// element descriptors, which arrive inline in result metadata.

use crate::error::{DriverError, Result};
use crate::frame::notation::Reader;

/// Wire codes for the type [option] in result metadata.
pub mod type_codes {
    pub const CUSTOM: u16 = 0x0000;
    pub const ASCII: u16 = 0x0001;
    pub const BIGINT: u16 = 0x0002;
    pub const BLOB: u16 = 0x0003;
    pub const BOOLEAN: u16 = 0x0004;
    pub const COUNTER: u16 = 0x0005;
    pub const DECIMAL: u16 = 0x0006;
    pub const DOUBLE: u16 = 0x0007;
    pub const FLOAT: u16 = 0x0008;
    pub const INT: u16 = 0x0009;
    pub const TEXT: u16 = 0x000A;
    pub const TIMESTAMP: u16 = 0x000B;
    pub const UUID: u16 = 0x000C;
    pub const VARCHAR: u16 = 0x000D;
    pub const VARINT: u16 = 0x000E;
    pub const TIMEUUID: u16 = 0x000F;
    pub const INET: u16 = 0x0010;
    pub const DATE: u16 = 0x0011;
    pub const TIME: u16 = 0x0012;
    pub const SMALLINT: u16 = 0x0013;
    pub const TINYINT: u16 = 0x0014;
    pub const DURATION: u16 = 0x0015;
    pub const LIST: u16 = 0x0020;
    pub const MAP: u16 = 0x0021;
    pub const SET: u16 = 0x0022;
    pub const UDT: u16 = 0x0030;
    pub const TUPLE: u16 = 0x0031;
}

/// A user-defined type descriptor: (keyspace, name, ordered fields).
#[derive(Debug, Clone, PartialEq)]
pub struct UdtType {
    pub keyspace: String,
    pub name: String,
    pub fields: Vec<(String, CqlType)>,
}

/// The CQL data types the codec understands.
#[derive(Debug, Clone, PartialEq)]
pub enum CqlType {
    /// Server-side custom type, identified by its Java class name.
    Custom(String),
    Ascii,
    Bigint,
    Blob,
    Boolean,
    Counter,
    Decimal,
    Double,
    Float,
    Int,
    Text,
    Timestamp,
    Uuid,
    Varchar,
    Varint,
    Timeuuid,
    Inet,
    Date,
    Time,
    Smallint,
    Tinyint,
    Duration,
    List(Box<CqlType>),
    Map(Box<CqlType>, Box<CqlType>),
    Set(Box<CqlType>),
    Udt(UdtType),
    Tuple(Vec<CqlType>),
}

impl CqlType {
    /// Parse a type [option] out of result metadata.
    pub fn parse(reader: &mut Reader<'_>) -> Result<CqlType> {
        let code = reader.read_short()?;
        match code {
            type_codes::CUSTOM => Ok(CqlType::Custom(reader.read_string()?)),
            type_codes::ASCII => Ok(CqlType::Ascii),
            type_codes::BIGINT => Ok(CqlType::Bigint),
            type_codes::BLOB => Ok(CqlType::Blob),
            type_codes::BOOLEAN => Ok(CqlType::Boolean),
            type_codes::COUNTER => Ok(CqlType::Counter),
            type_codes::DECIMAL => Ok(CqlType::Decimal),
            type_codes::DOUBLE => Ok(CqlType::Double),
            type_codes::FLOAT => Ok(CqlType::Float),
            type_codes::INT => Ok(CqlType::Int),
            type_codes::TEXT => Ok(CqlType::Text),
            type_codes::TIMESTAMP => Ok(CqlType::Timestamp),
            type_codes::UUID => Ok(CqlType::Uuid),
            type_codes::VARCHAR => Ok(CqlType::Varchar),
            type_codes::VARINT => Ok(CqlType::Varint),
            type_codes::TIMEUUID => Ok(CqlType::Timeuuid),
            type_codes::INET => Ok(CqlType::Inet),
            type_codes::DATE => Ok(CqlType::Date),
            type_codes::TIME => Ok(CqlType::Time),
            type_codes::SMALLINT => Ok(CqlType::Smallint),
            type_codes::TINYINT => Ok(CqlType::Tinyint),
            type_codes::DURATION => Ok(CqlType::Duration),
            type_codes::LIST => Ok(CqlType::List(Box::new(CqlType::parse(reader)?))),
            type_codes::MAP => {
                let key = CqlType::parse(reader)?;
                let value = CqlType::parse(reader)?;
                Ok(CqlType::Map(Box::new(key), Box::new(value)))
            }
            type_codes::SET => Ok(CqlType::Set(Box::new(CqlType::parse(reader)?))),
            type_codes::UDT => {
                let keyspace = reader.read_string()?;
                let name = reader.read_string()?;
                let field_count = reader.read_short()? as usize;
                let mut fields = Vec::with_capacity(field_count);
                for _ in 0..field_count {
                    let field_name = reader.read_string()?;
                    let field_type = CqlType::parse(reader)?;
                    fields.push((field_name, field_type));
                }
                Ok(CqlType::Udt(UdtType {
                    keyspace,
                    name,
                    fields,
                }))
            }
            type_codes::TUPLE => {
                let count = reader.read_short()? as usize;
                let mut components = Vec::with_capacity(count);
                for _ in 0..count {
                    components.push(CqlType::parse(reader)?);
                }
                Ok(CqlType::Tuple(components))
            }
            other => Err(DriverError::Protocol(format!(
                "unknown CQL type code 0x{other:04x}"
            ))),
        }
    }

    /// The wire code for this type (the outer code for parameterized types).
    pub fn type_code(&self) -> u16 {
        match self {
            CqlType::Custom(_) => type_codes::CUSTOM,
            CqlType::Ascii => type_codes::ASCII,
            CqlType::Bigint => type_codes::BIGINT,
            CqlType::Blob => type_codes::BLOB,
            CqlType::Boolean => type_codes::BOOLEAN,
            CqlType::Counter => type_codes::COUNTER,
            CqlType::Decimal => type_codes::DECIMAL,
            CqlType::Double => type_codes::DOUBLE,
            CqlType::Float => type_codes::FLOAT,
            CqlType::Int => type_codes::INT,
            CqlType::Text => type_codes::TEXT,
            CqlType::Timestamp => type_codes::TIMESTAMP,
            CqlType::Uuid => type_codes::UUID,
            CqlType::Varchar => type_codes::VARCHAR,
            CqlType::Varint => type_codes::VARINT,
            CqlType::Timeuuid => type_codes::TIMEUUID,
            CqlType::Inet => type_codes::INET,
            CqlType::Date => type_codes::DATE,
            CqlType::Time => type_codes::TIME,
            CqlType::Smallint => type_codes::SMALLINT,
            CqlType::Tinyint => type_codes::TINYINT,
            CqlType::Duration => type_codes::DURATION,
            CqlType::List(_) => type_codes::LIST,
            CqlType::Map(_, _) => type_codes::MAP,
            CqlType::Set(_) => type_codes::SET,
            CqlType::Udt(_) => type_codes::UDT,
            CqlType::Tuple(_) => type_codes::TUPLE,
        }
    }

    /// Text-family types share a representation.
    pub fn is_text_kind(&self) -> bool {
        matches!(self, CqlType::Ascii | CqlType::Text | CqlType::Varchar)
    }
}

impl std::fmt::Display for CqlType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CqlType::Custom(class) => write!(f, "custom({class})"),
            CqlType::Ascii => write!(f, "ascii"),
            CqlType::Bigint => write!(f, "bigint"),
            CqlType::Blob => write!(f, "blob"),
            CqlType::Boolean => write!(f, "boolean"),
            CqlType::Counter => write!(f, "counter"),
            CqlType::Decimal => write!(f, "decimal"),
            CqlType::Double => write!(f, "double"),
            CqlType::Float => write!(f, "float"),
            CqlType::Int => write!(f, "int"),
            CqlType::Text => write!(f, "text"),
            CqlType::Timestamp => write!(f, "timestamp"),
            CqlType::Uuid => write!(f, "uuid"),
            CqlType::Varchar => write!(f, "varchar"),
            CqlType::Varint => write!(f, "varint"),
            CqlType::Timeuuid => write!(f, "timeuuid"),
            CqlType::Inet => write!(f, "inet"),
            CqlType::Date => write!(f, "date"),
            CqlType::Time => write!(f, "time"),
            CqlType::Smallint => write!(f, "smallint"),
            CqlType::Tinyint => write!(f, "tinyint"),
            CqlType::Duration => write!(f, "duration"),
            CqlType::List(inner) => write!(f, "list<{inner}>"),
            CqlType::Map(key, value) => write!(f, "map<{key}, {value}>"),
            CqlType::Set(inner) => write!(f, "set<{inner}>"),
            CqlType::Udt(udt) => write!(f, "{}.{}", udt.keyspace, udt.name),
            CqlType::Tuple(parts) => {
                write!(f, "tuple<")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{part}")?;
                }
                write!(f, ">")
            }
        }
    }
}
