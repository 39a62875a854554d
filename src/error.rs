// Driver-wide error types
//
// Every fallible path in the crate returns `Result<T, DriverError>`. Server
// errors arrive as ERROR frames and are carried verbatim in
// `ResponseError`; socket-level errors are wrapped as transparent causes so
// the executor can record them per host without losing the original text.

use std::collections::HashMap;
use std::net::SocketAddr;

use thiserror::Error;

use crate::frame::Consistency;

/// Server-side error codes carried in ERROR frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    ServerError = 0x0000,
    ProtocolError = 0x000A,
    BadCredentials = 0x0100,
    Unavailable = 0x1000,
    Overloaded = 0x1001,
    IsBootstrapping = 0x1002,
    TruncateError = 0x1003,
    WriteTimeout = 0x1100,
    ReadTimeout = 0x1200,
    ReadFailure = 0x1300,
    FunctionFailure = 0x1400,
    WriteFailure = 0x1500,
    SyntaxError = 0x2000,
    Unauthorized = 0x2100,
    Invalid = 0x2200,
    ConfigError = 0x2300,
    AlreadyExists = 0x2400,
    Unprepared = 0x2500,
}

impl ErrorCode {
    /// Decode a wire error code. Unknown codes map to `ServerError` so a
    /// newer server cannot wedge the classification logic.
    pub fn from_wire(code: u32) -> Self {
        match code {
            0x000A => ErrorCode::ProtocolError,
            0x0100 => ErrorCode::BadCredentials,
            0x1000 => ErrorCode::Unavailable,
            0x1001 => ErrorCode::Overloaded,
            0x1002 => ErrorCode::IsBootstrapping,
            0x1003 => ErrorCode::TruncateError,
            0x1100 => ErrorCode::WriteTimeout,
            0x1200 => ErrorCode::ReadTimeout,
            0x1300 => ErrorCode::ReadFailure,
            0x1400 => ErrorCode::FunctionFailure,
            0x1500 => ErrorCode::WriteFailure,
            0x2000 => ErrorCode::SyntaxError,
            0x2100 => ErrorCode::Unauthorized,
            0x2200 => ErrorCode::Invalid,
            0x2300 => ErrorCode::ConfigError,
            0x2400 => ErrorCode::AlreadyExists,
            0x2500 => ErrorCode::Unprepared,
            _ => ErrorCode::ServerError,
        }
    }
}

/// A typed server-side error decoded from an ERROR frame.
///
/// Only the fields relevant to the reported code are populated; the rest
/// stay `None`.
#[derive(Debug, Clone, Default)]
pub struct ResponseError {
    pub code: u32,
    pub kind: Option<ErrorCode>,
    pub message: String,
    /// Consistency level the operation ran at (timeout / unavailable).
    pub consistency: Option<Consistency>,
    /// Replicas that acknowledged before the error fired.
    pub received: Option<i32>,
    /// Replicas required to satisfy the consistency level.
    pub block_for: Option<i32>,
    /// Replicas known alive (unavailable errors).
    pub alive: Option<i32>,
    /// Whether the data replica responded (read timeouts).
    pub data_present: Option<bool>,
    /// Kind of write that timed out (SIMPLE, BATCH, BATCH_LOG, ...).
    pub write_type: Option<String>,
    pub keyspace: Option<String>,
    pub table: Option<String>,
    pub function_name: Option<String>,
    pub arg_types: Option<Vec<String>>,
    /// Per-replica failure reasons (read/write failure, v5 shape).
    pub reasons: HashMap<std::net::IpAddr, u16>,
    pub num_failures: Option<i32>,
    /// Prepared-statement id the server no longer knows (unprepared).
    pub unprepared_id: Option<Vec<u8>>,
}

impl ResponseError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        ResponseError {
            code,
            kind: Some(ErrorCode::from_wire(code)),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        self.kind.unwrap_or(ErrorCode::ServerError)
    }
}

impl std::fmt::Display for ResponseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "server error 0x{:04x}: {}", self.code, self.message)
    }
}

/// Errors surfaced by the driver.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error: {0}")]
    IoMessage(String),

    #[error("Invalid argument: {0}")]
    Argument(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("No host available: {}", format_inner_errors(.0))]
    NoHostAvailable(HashMap<SocketAddr, DriverError>),

    #[error("Operation timed out for {endpoint}: no response after {elapsed_ms} ms")]
    OperationTimedOut { endpoint: SocketAddr, elapsed_ms: u64 },

    #[error("{0}")]
    Response(ResponseError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Cannot encode value: expected CQL type {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection is busy: all stream ids in use")]
    Saturated,

    #[error("Connection is closed: {0}")]
    ConnectionClosed(String),

    #[error("Client was shut down")]
    Shutdown,

    #[error("Internal driver error: {0}")]
    Internal(String),
}

impl DriverError {
    /// The server error payload, when this is a `Response` error.
    pub fn as_response(&self) -> Option<&ResponseError> {
        match self {
            DriverError::Response(e) => Some(e),
            _ => None,
        }
    }

    /// True for errors that mean "this host could not serve the attempt at
    /// all" and never carry a server verdict: connect/socket failures,
    /// saturation, per-attempt timeouts.
    pub fn is_host_level(&self) -> bool {
        matches!(
            self,
            DriverError::Io(_)
                | DriverError::IoMessage(_)
                | DriverError::Saturated
                | DriverError::ConnectionClosed(_)
                | DriverError::OperationTimedOut { .. }
        )
    }
}

fn format_inner_errors(inner: &HashMap<SocketAddr, DriverError>) -> String {
    if inner.is_empty() {
        return "no contact points".to_string();
    }
    let mut parts: Vec<String> = inner
        .iter()
        .map(|(addr, err)| format!("{addr}: {err}"))
        .collect();
    parts.sort();
    parts.join("; ")
}

// Io errors are not Clone; they degrade to their message so errors can be
// recorded in per-host maps and replayed to waiters.
impl Clone for DriverError {
    fn clone(&self) -> Self {
        match self {
            DriverError::Io(e) => DriverError::IoMessage(e.to_string()),
            DriverError::IoMessage(s) => DriverError::IoMessage(s.clone()),
            DriverError::Argument(s) => DriverError::Argument(s.clone()),
            DriverError::Authentication(s) => DriverError::Authentication(s.clone()),
            DriverError::NoHostAvailable(m) => DriverError::NoHostAvailable(m.clone()),
            DriverError::OperationTimedOut { endpoint, elapsed_ms } => {
                DriverError::OperationTimedOut { endpoint: *endpoint, elapsed_ms: *elapsed_ms }
            }
            DriverError::Response(e) => DriverError::Response(e.clone()),
            DriverError::Protocol(s) => DriverError::Protocol(s.clone()),
            DriverError::TypeMismatch { expected, actual } => DriverError::TypeMismatch {
                expected: expected.clone(),
                actual: actual.clone(),
            },
            DriverError::Serialization(s) => DriverError::Serialization(s.clone()),
            DriverError::Saturated => DriverError::Saturated,
            DriverError::ConnectionClosed(s) => DriverError::ConnectionClosed(s.clone()),
            DriverError::Shutdown => DriverError::Shutdown,
            DriverError::Internal(s) => DriverError::Internal(s.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_from_wire() {
        assert_eq!(ErrorCode::from_wire(0x1002), ErrorCode::IsBootstrapping);
        assert_eq!(ErrorCode::from_wire(0x2500), ErrorCode::Unprepared);
        // Unknown codes degrade instead of failing
        assert_eq!(ErrorCode::from_wire(0x9999), ErrorCode::ServerError);
    }

    #[test]
    fn test_clone_degrades_io_error() {
        let err = DriverError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        ));
        let cloned = err.clone();
        match cloned {
            DriverError::IoMessage(msg) => assert!(msg.contains("connection reset")),
            other => panic!("expected IoMessage, got {other:?}"),
        }
    }

    #[test]
    fn test_no_host_available_display() {
        let mut inner = HashMap::new();
        inner.insert(
            "127.0.0.1:9042".parse::<SocketAddr>().unwrap(),
            DriverError::Saturated,
        );
        let err = DriverError::NoHostAvailable(inner);
        let text = err.to_string();
        assert!(text.contains("127.0.0.1:9042"));
        assert!(text.contains("stream ids"));
    }

    #[test]
    fn test_host_level_classification() {
        assert!(DriverError::Saturated.is_host_level());
        assert!(!DriverError::Response(ResponseError::new(0x2000, "syntax")).is_host_level());
    }
}
