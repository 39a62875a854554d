// Response body parsing
//
// Parses the opcode-specific response bodies into typed values. Frame-level
// extras (tracing id, warnings, custom payload) sit at the front of every
// response body when their flag bits are set and are peeled off before the
// opcode payload.

use std::collections::HashMap;
use std::net::SocketAddr;

use uuid::Uuid;

use super::codec::Frame;
use super::header::Opcode;
use super::notation::Reader;
use super::{Consistency, ProtocolVersion};
use crate::codec::{deserialize, CqlType, CqlValue};
use crate::error::{DriverError, ErrorCode, ResponseError, Result};

/// RESULT kinds (first [int] of a RESULT body).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ResultKind {
    Void = 0x0001,
    Rows = 0x0002,
    SetKeyspace = 0x0003,
    Prepared = 0x0004,
    SchemaChange = 0x0005,
}

impl ResultKind {
    pub fn from_wire(kind: i32) -> Result<ResultKind> {
        match kind {
            0x0001 => Ok(ResultKind::Void),
            0x0002 => Ok(ResultKind::Rows),
            0x0003 => Ok(ResultKind::SetKeyspace),
            0x0004 => Ok(ResultKind::Prepared),
            0x0005 => Ok(ResultKind::SchemaChange),
            other => Err(DriverError::Protocol(format!(
                "unknown result kind 0x{other:04x}"
            ))),
        }
    }
}

/// One column descriptor from result metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub keyspace: String,
    pub table: String,
    pub name: String,
    pub cql_type: CqlType,
}

/// Decoded rows payload.
#[derive(Debug, Clone)]
pub struct RowsResult {
    pub columns: Vec<ColumnSpec>,
    pub rows: Vec<Vec<Option<CqlValue>>>,
    pub paging_state: Option<Vec<u8>>,
}

/// Decoded PREPARED payload: the query id plus parameter and result
/// metadata. Partition-key indexes exist from v4 on.
#[derive(Debug, Clone)]
pub struct PreparedResult {
    pub id: Vec<u8>,
    pub pk_indexes: Vec<u16>,
    pub parameters: Vec<ColumnSpec>,
    pub result_columns: Vec<ColumnSpec>,
}

/// Decoded SCHEMA_CHANGE payload (also the EVENT shape).
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaChange {
    pub change_type: String,
    pub target: String,
    pub keyspace: String,
    pub name: Option<String>,
}

/// RESULT bodies by kind.
#[derive(Debug, Clone)]
pub enum ResultResponse {
    Void,
    Rows(RowsResult),
    SetKeyspace(String),
    Prepared(PreparedResult),
    SchemaChange(SchemaChange),
}

/// Push events delivered on stream -1 by the control connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    TopologyChange { change: String, address: SocketAddr },
    StatusChange { change: String, address: SocketAddr },
    SchemaChange(SchemaChange),
}

/// A parsed response body.
#[derive(Debug, Clone)]
pub enum Response {
    Ready,
    Authenticate { authenticator: String },
    AuthChallenge { token: Option<Vec<u8>> },
    AuthSuccess { token: Option<Vec<u8>> },
    Supported { options: HashMap<String, Vec<String>> },
    Result(ResultResponse),
    Error(ResponseError),
    Event(ServerEvent),
}

/// A response plus its frame-level extras.
#[derive(Debug, Clone)]
pub struct ParsedResponse {
    pub response: Response,
    pub tracing_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub custom_payload: Option<HashMap<String, Option<Vec<u8>>>>,
}

impl ParsedResponse {
    /// Parse a response frame.
    pub fn parse(frame: &Frame, version: ProtocolVersion) -> Result<ParsedResponse> {
        let mut reader = Reader::new(&frame.body);

        let tracing_id = if frame.header.flags.tracing() {
            let raw = reader.read_raw(16)?;
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(raw);
            Some(Uuid::from_bytes(bytes))
        } else {
            None
        };
        let warnings = if frame.header.flags.warning() {
            reader.read_string_list()?
        } else {
            Vec::new()
        };
        let custom_payload = if frame.header.flags.custom_payload() {
            Some(reader.read_bytes_map()?)
        } else {
            None
        };

        let response = match frame.opcode() {
            Opcode::Ready => Response::Ready,
            Opcode::Authenticate => Response::Authenticate {
                authenticator: reader.read_string()?,
            },
            Opcode::AuthChallenge => Response::AuthChallenge {
                token: reader.read_bytes()?.map(|b| b.to_vec()),
            },
            Opcode::AuthSuccess => Response::AuthSuccess {
                token: reader.read_bytes()?.map(|b| b.to_vec()),
            },
            Opcode::Supported => Response::Supported {
                options: reader.read_string_multimap()?,
            },
            Opcode::Error => Response::Error(parse_error(&mut reader)?),
            Opcode::Result => Response::Result(parse_result(&mut reader, version)?),
            Opcode::Event => Response::Event(parse_event(&mut reader)?),
            other => {
                return Err(DriverError::Protocol(format!(
                    "unexpected response opcode {other:?}"
                )))
            }
        };

        Ok(ParsedResponse {
            response,
            tracing_id,
            warnings,
            custom_payload,
        })
    }
}

fn parse_error(reader: &mut Reader<'_>) -> Result<ResponseError> {
    let code = reader.read_int()? as u32;
    let message = reader.read_string()?;
    let mut error = ResponseError::new(code, message);

    match error.error_code() {
        ErrorCode::Unavailable => {
            error.consistency = Some(Consistency::from_wire(reader.read_short()?)?);
            error.block_for = Some(reader.read_int()?);
            error.alive = Some(reader.read_int()?);
        }
        ErrorCode::WriteTimeout => {
            error.consistency = Some(Consistency::from_wire(reader.read_short()?)?);
            error.received = Some(reader.read_int()?);
            error.block_for = Some(reader.read_int()?);
            error.write_type = Some(reader.read_string()?);
        }
        ErrorCode::ReadTimeout => {
            error.consistency = Some(Consistency::from_wire(reader.read_short()?)?);
            error.received = Some(reader.read_int()?);
            error.block_for = Some(reader.read_int()?);
            error.data_present = Some(reader.read_byte()? != 0);
        }
        ErrorCode::ReadFailure => {
            error.consistency = Some(Consistency::from_wire(reader.read_short()?)?);
            error.received = Some(reader.read_int()?);
            error.block_for = Some(reader.read_int()?);
            error.num_failures = Some(reader.read_int()?);
            error.data_present = Some(reader.read_byte()? != 0);
        }
        ErrorCode::WriteFailure => {
            error.consistency = Some(Consistency::from_wire(reader.read_short()?)?);
            error.received = Some(reader.read_int()?);
            error.block_for = Some(reader.read_int()?);
            error.num_failures = Some(reader.read_int()?);
            error.write_type = Some(reader.read_string()?);
        }
        ErrorCode::FunctionFailure => {
            error.keyspace = Some(reader.read_string()?);
            error.function_name = Some(reader.read_string()?);
            error.arg_types = Some(reader.read_string_list()?);
        }
        ErrorCode::AlreadyExists => {
            error.keyspace = Some(reader.read_string()?);
            error.table = Some(reader.read_string()?);
        }
        ErrorCode::Unprepared => {
            error.unprepared_id = Some(reader.read_short_bytes()?.to_vec());
        }
        _ => {}
    }
    Ok(error)
}

mod rows_flags {
    pub const GLOBAL_TABLES_SPEC: i32 = 0x0001;
    pub const HAS_MORE_PAGES: i32 = 0x0002;
    pub const NO_METADATA: i32 = 0x0004;
}

struct RowsMetadata {
    columns: Vec<ColumnSpec>,
    column_count: usize,
    paging_state: Option<Vec<u8>>,
}

fn parse_rows_metadata(reader: &mut Reader<'_>) -> Result<RowsMetadata> {
    let flags = reader.read_int()?;
    let column_count = reader.read_int()?;
    if column_count < 0 {
        return Err(DriverError::Protocol("negative column count".to_string()));
    }
    let column_count = column_count as usize;

    let paging_state = if flags & rows_flags::HAS_MORE_PAGES != 0 {
        reader.read_bytes()?.map(|b| b.to_vec())
    } else {
        None
    };

    if flags & rows_flags::NO_METADATA != 0 {
        return Ok(RowsMetadata {
            columns: Vec::new(),
            column_count,
            paging_state,
        });
    }

    let global_spec = if flags & rows_flags::GLOBAL_TABLES_SPEC != 0 {
        let keyspace = reader.read_string()?;
        let table = reader.read_string()?;
        Some((keyspace, table))
    } else {
        None
    };

    let mut columns = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        let (keyspace, table) = match &global_spec {
            Some((keyspace, table)) => (keyspace.clone(), table.clone()),
            None => (reader.read_string()?, reader.read_string()?),
        };
        let name = reader.read_string()?;
        let cql_type = CqlType::parse(reader)?;
        columns.push(ColumnSpec {
            keyspace,
            table,
            name,
            cql_type,
        });
    }

    Ok(RowsMetadata {
        columns,
        column_count,
        paging_state,
    })
}

fn parse_result(reader: &mut Reader<'_>, version: ProtocolVersion) -> Result<ResultResponse> {
    let kind = ResultKind::from_wire(reader.read_int()?)?;
    match kind {
        ResultKind::Void => Ok(ResultResponse::Void),
        ResultKind::Rows => {
            let metadata = parse_rows_metadata(reader)?;
            if metadata.columns.is_empty() && metadata.column_count > 0 {
                // The driver never sets skip_metadata, so a NO_METADATA rows
                // result cannot be decoded here.
                return Err(DriverError::Protocol(
                    "rows result without column metadata".to_string(),
                ));
            }
            let row_count = reader.read_int()?;
            if row_count < 0 {
                return Err(DriverError::Protocol("negative row count".to_string()));
            }
            let mut rows = Vec::with_capacity(row_count as usize);
            for _ in 0..row_count {
                let mut row = Vec::with_capacity(metadata.column_count);
                for column in &metadata.columns {
                    let cell = match reader.read_bytes()? {
                        Some(bytes) => Some(deserialize(bytes, &column.cql_type, version)?),
                        None => None,
                    };
                    row.push(cell);
                }
                rows.push(row);
            }
            Ok(ResultResponse::Rows(RowsResult {
                columns: metadata.columns,
                rows,
                paging_state: metadata.paging_state,
            }))
        }
        ResultKind::SetKeyspace => Ok(ResultResponse::SetKeyspace(reader.read_string()?)),
        ResultKind::Prepared => {
            let id = reader.read_short_bytes()?.to_vec();
            // Parameter metadata, with pk indexes from v4 on
            let flags = reader.read_int()?;
            let column_count = reader.read_int()?.max(0) as usize;
            let pk_indexes = if version >= ProtocolVersion::V4 {
                let pk_count = reader.read_int()?.max(0) as usize;
                let mut indexes = Vec::with_capacity(pk_count);
                for _ in 0..pk_count {
                    indexes.push(reader.read_short()?);
                }
                indexes
            } else {
                Vec::new()
            };
            let parameters =
                parse_prepared_columns(reader, flags, column_count)?;
            let result_metadata = parse_rows_metadata(reader)?;
            Ok(ResultResponse::Prepared(PreparedResult {
                id,
                pk_indexes,
                parameters,
                result_columns: result_metadata.columns,
            }))
        }
        ResultKind::SchemaChange => {
            Ok(ResultResponse::SchemaChange(parse_schema_change(reader)?))
        }
    }
}

fn parse_prepared_columns(
    reader: &mut Reader<'_>,
    flags: i32,
    column_count: usize,
) -> Result<Vec<ColumnSpec>> {
    let global_spec = if flags & rows_flags::GLOBAL_TABLES_SPEC != 0 {
        let keyspace = reader.read_string()?;
        let table = reader.read_string()?;
        Some((keyspace, table))
    } else {
        None
    };
    let mut columns = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        let (keyspace, table) = match &global_spec {
            Some((keyspace, table)) => (keyspace.clone(), table.clone()),
            None => (reader.read_string()?, reader.read_string()?),
        };
        let name = reader.read_string()?;
        let cql_type = CqlType::parse(reader)?;
        columns.push(ColumnSpec {
            keyspace,
            table,
            name,
            cql_type,
        });
    }
    Ok(columns)
}

fn parse_schema_change(reader: &mut Reader<'_>) -> Result<SchemaChange> {
    let change_type = reader.read_string()?;
    let target = reader.read_string()?;
    let keyspace = reader.read_string()?;
    let name = if target == "KEYSPACE" {
        None
    } else {
        Some(reader.read_string()?)
    };
    Ok(SchemaChange {
        change_type,
        target,
        keyspace,
        name,
    })
}

fn parse_event(reader: &mut Reader<'_>) -> Result<ServerEvent> {
    let event_type = reader.read_string()?;
    match event_type.as_str() {
        "TOPOLOGY_CHANGE" => {
            let change = reader.read_string()?;
            let address = reader.read_inet()?;
            Ok(ServerEvent::TopologyChange { change, address })
        }
        "STATUS_CHANGE" => {
            let change = reader.read_string()?;
            let address = reader.read_inet()?;
            Ok(ServerEvent::StatusChange { change, address })
        }
        "SCHEMA_CHANGE" => Ok(ServerEvent::SchemaChange(parse_schema_change(reader)?)),
        other => Err(DriverError::Protocol(format!(
            "unknown event type '{other}'"
        ))),
    }
}
