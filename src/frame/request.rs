// Request body builders
//
// Each request opcode has a fixed body layout assembled here from the
// primitive notation. Query parameters share one layout between QUERY and
// EXECUTE; BATCH repeats a reduced form per child statement.

use bytes::BytesMut;

use super::header::Opcode;
use super::notation;
use super::{Consistency, ProtocolVersion};
use crate::codec::{write_query_value, CqlType, QueryValue};
use crate::error::{DriverError, Result};

/// Query-parameter flag bits.
mod query_flags {
    pub const VALUES: u8 = 0x01;
    pub const SKIP_METADATA: u8 = 0x02;
    pub const PAGE_SIZE: u8 = 0x04;
    pub const PAGING_STATE: u8 = 0x08;
    pub const SERIAL_CONSISTENCY: u8 = 0x10;
    pub const DEFAULT_TIMESTAMP: u8 = 0x20;
    pub const NAMED_VALUES: u8 = 0x40;
}

/// The parameter block shared by QUERY and EXECUTE.
#[derive(Debug, Clone, Default)]
pub struct QueryParameters {
    pub consistency: Option<Consistency>,
    /// Positional values. Ignored when `named_values` is set.
    pub values: Vec<QueryValue>,
    /// Named values ([string] name per value), mutually exclusive with
    /// positional ones.
    pub named_values: Option<Vec<(String, QueryValue)>>,
    /// Type hints per positional value, from prepared metadata.
    pub value_types: Option<Vec<CqlType>>,
    pub skip_metadata: bool,
    pub page_size: Option<i32>,
    pub paging_state: Option<Vec<u8>>,
    pub serial_consistency: Option<Consistency>,
    /// Client-side timestamp in microseconds, v3+.
    pub default_timestamp: Option<i64>,
}

impl QueryParameters {
    pub fn encode(&self, out: &mut BytesMut, version: ProtocolVersion) -> Result<()> {
        let consistency = self.consistency.unwrap_or(Consistency::LocalOne);
        notation::write_short(out, consistency.as_wire());

        let mut flags = 0u8;
        let has_positional = !self.values.is_empty() && self.named_values.is_none();
        let has_named = self.named_values.as_ref().is_some_and(|v| !v.is_empty());
        if has_positional || has_named {
            flags |= query_flags::VALUES;
        }
        if has_named {
            flags |= query_flags::NAMED_VALUES;
        }
        if self.skip_metadata {
            flags |= query_flags::SKIP_METADATA;
        }
        if self.page_size.is_some() {
            flags |= query_flags::PAGE_SIZE;
        }
        if self.paging_state.is_some() {
            flags |= query_flags::PAGING_STATE;
        }
        if self.serial_consistency.is_some() {
            flags |= query_flags::SERIAL_CONSISTENCY;
        }
        if self.default_timestamp.is_some() {
            if !version.supports_timestamps() {
                return Err(DriverError::Argument(format!(
                    "per-query timestamps require protocol v3+, connection is {version}"
                )));
            }
            flags |= query_flags::DEFAULT_TIMESTAMP;
        }
        notation::write_byte(out, flags);

        if has_named {
            let named = self.named_values.as_ref().unwrap();
            notation::write_short(out, named.len() as u16);
            for (name, value) in named {
                notation::write_string(out, name);
                write_query_value(out, value, None, version)?;
            }
        } else if has_positional {
            notation::write_short(out, self.values.len() as u16);
            for (index, value) in self.values.iter().enumerate() {
                let hint = self
                    .value_types
                    .as_ref()
                    .and_then(|types| types.get(index));
                write_query_value(out, value, hint, version)?;
            }
        }

        if let Some(page_size) = self.page_size {
            notation::write_int(out, page_size);
        }
        if let Some(paging_state) = &self.paging_state {
            notation::write_bytes(out, Some(paging_state));
        }
        if let Some(serial) = self.serial_consistency {
            if !serial.is_serial() {
                return Err(DriverError::Argument(format!(
                    "serial consistency must be SERIAL or LOCAL_SERIAL, got {serial}"
                )));
            }
            notation::write_short(out, serial.as_wire());
        }
        if let Some(timestamp) = self.default_timestamp {
            notation::write_long(out, timestamp);
        }
        Ok(())
    }
}

/// Batch kinds (byte 0 of the BATCH body).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BatchKind {
    Logged = 0,
    Unlogged = 1,
    Counter = 2,
}

/// One statement inside a BATCH.
#[derive(Debug, Clone)]
pub enum BatchChild {
    Simple {
        query: String,
        values: Vec<QueryValue>,
    },
    Prepared {
        id: Vec<u8>,
        values: Vec<QueryValue>,
        value_types: Option<Vec<CqlType>>,
    },
}

/// A request ready for body encoding.
#[derive(Debug, Clone)]
pub enum Request {
    Startup {
        cql_version: String,
        compression: Option<String>,
    },
    Options,
    AuthResponse {
        token: Option<Vec<u8>>,
    },
    Register {
        events: Vec<String>,
    },
    Query {
        query: String,
        parameters: QueryParameters,
    },
    Prepare {
        query: String,
    },
    Execute {
        id: Vec<u8>,
        parameters: QueryParameters,
    },
    Batch {
        kind: BatchKind,
        children: Vec<BatchChild>,
        consistency: Consistency,
        serial_consistency: Option<Consistency>,
        default_timestamp: Option<i64>,
    },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Startup { .. } => Opcode::Startup,
            Request::Options => Opcode::Options,
            Request::AuthResponse { .. } => Opcode::AuthResponse,
            Request::Register { .. } => Opcode::Register,
            Request::Query { .. } => Opcode::Query,
            Request::Prepare { .. } => Opcode::Prepare,
            Request::Execute { .. } => Opcode::Execute,
            Request::Batch { .. } => Opcode::Batch,
        }
    }

    pub fn encode_body(&self, version: ProtocolVersion) -> Result<BytesMut> {
        let mut out = BytesMut::new();
        match self {
            Request::Startup {
                cql_version,
                compression,
            } => {
                let mut options = std::collections::HashMap::new();
                options.insert("CQL_VERSION".to_string(), cql_version.clone());
                if let Some(algorithm) = compression {
                    options.insert("COMPRESSION".to_string(), algorithm.clone());
                }
                notation::write_string_map(&mut out, &options);
            }
            Request::Options => {}
            Request::AuthResponse { token } => {
                notation::write_bytes(&mut out, token.as_deref());
            }
            Request::Register { events } => {
                notation::write_string_list(&mut out, events);
            }
            Request::Query { query, parameters } => {
                notation::write_long_string(&mut out, query);
                parameters.encode(&mut out, version)?;
            }
            Request::Prepare { query } => {
                notation::write_long_string(&mut out, query);
            }
            Request::Execute { id, parameters } => {
                notation::write_short_bytes(&mut out, id);
                parameters.encode(&mut out, version)?;
            }
            Request::Batch {
                kind,
                children,
                consistency,
                serial_consistency,
                default_timestamp,
            } => {
                notation::write_byte(&mut out, *kind as u8);
                notation::write_short(&mut out, children.len() as u16);
                for child in children {
                    match child {
                        BatchChild::Simple { query, values } => {
                            notation::write_byte(&mut out, 0);
                            notation::write_long_string(&mut out, query);
                            notation::write_short(&mut out, values.len() as u16);
                            for value in values {
                                write_query_value(&mut out, value, None, version)?;
                            }
                        }
                        BatchChild::Prepared {
                            id,
                            values,
                            value_types,
                        } => {
                            notation::write_byte(&mut out, 1);
                            notation::write_short_bytes(&mut out, id);
                            notation::write_short(&mut out, values.len() as u16);
                            for (index, value) in values.iter().enumerate() {
                                let hint =
                                    value_types.as_ref().and_then(|types| types.get(index));
                                write_query_value(&mut out, value, hint, version)?;
                            }
                        }
                    }
                }
                notation::write_short(&mut out, consistency.as_wire());
                let mut flags = 0u8;
                if serial_consistency.is_some() {
                    flags |= query_flags::SERIAL_CONSISTENCY;
                }
                if default_timestamp.is_some() {
                    flags |= query_flags::DEFAULT_TIMESTAMP;
                }
                notation::write_byte(&mut out, flags);
                if let Some(serial) = serial_consistency {
                    notation::write_short(&mut out, serial.as_wire());
                }
                if let Some(timestamp) = default_timestamp {
                    notation::write_long(&mut out, *timestamp);
                }
            }
        }
        Ok(out)
    }
}
