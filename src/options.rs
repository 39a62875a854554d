// Client configuration
//
// Options are validated once, at session construction; a bad combination
// surfaces as an ArgumentError before any socket is opened. Policies are
// trait objects so applications can swap any of them; everything else is
// plain data with conservative defaults.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cluster::Token;
use crate::connection::auth::AuthProvider;
use crate::frame::{Consistency, FrameCompressor, ProtocolVersion};
use crate::policy::{
    AddressTranslator, ConstantReconnectionPolicy, DefaultRetryPolicy, IdentityTranslator,
    LoadBalancingPolicy, NoSpeculativeExecutionPolicy, ReconnectionPolicy, RetryPolicy,
    SpeculativeExecutionPolicy, TimestampGenerator,
};
use crate::tracker::RequestTracker;
use crate::error::{DriverError, Result};

/// TCP-level and per-request deadline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketOptions {
    pub connect_timeout_ms: u64,
    /// Default per-attempt deadline.
    pub read_timeout_ms: u64,
    /// Consecutive timed-out requests before a connection is defuncted.
    pub defunct_read_timeout_threshold: usize,
    pub tcp_nodelay: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        SocketOptions {
            connect_timeout_ms: 5_000,
            read_timeout_ms: 12_000,
            defunct_read_timeout_threshold: 64,
            tcp_nodelay: true,
        }
    }
}

/// Pool sizing and keep-alive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolingOptions {
    pub warmup: bool,
    pub core_connections_local: usize,
    pub max_connections_local: usize,
    pub core_connections_remote: usize,
    pub max_connections_remote: usize,
    pub max_requests_per_connection: usize,
    pub heart_beat_interval_ms: u64,
}

impl Default for PoolingOptions {
    fn default() -> Self {
        PoolingOptions {
            warmup: true,
            core_connections_local: 2,
            max_connections_local: 8,
            core_connections_remote: 1,
            max_connections_remote: 2,
            max_requests_per_connection: 1024,
            heart_beat_interval_ms: 30_000,
        }
    }
}

/// Defaults applied to every request unless overridden per call or by an
/// execution profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOptions {
    pub consistency: Consistency,
    pub serial_consistency: Consistency,
    pub fetch_size: i32,
    /// Prepare statements transparently on first use.
    pub prepare: bool,
    pub is_idempotent: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions {
            consistency: Consistency::LocalOne,
            serial_consistency: Consistency::LocalSerial,
            fetch_size: 5000,
            prepare: false,
            is_idempotent: false,
        }
    }
}

/// The pluggable policy set.
#[derive(Clone)]
pub struct Policies {
    /// None selects the default (local-dc token-aware) policy at connect.
    pub load_balancing: Option<Arc<dyn LoadBalancingPolicy>>,
    pub retry: Arc<dyn RetryPolicy>,
    pub reconnection: Arc<dyn ReconnectionPolicy>,
    pub speculative_execution: Arc<dyn SpeculativeExecutionPolicy>,
    /// None defers timestamps to the server.
    pub timestamp_generation: Option<Arc<dyn TimestampGenerator>>,
    pub address_translator: Arc<dyn AddressTranslator>,
}

impl Default for Policies {
    fn default() -> Self {
        Policies {
            load_balancing: None,
            retry: Arc::new(DefaultRetryPolicy),
            reconnection: Arc::new(ConstantReconnectionPolicy::new(2_000)),
            speculative_execution: Arc::new(NoSpeculativeExecutionPolicy),
            timestamp_generation: None,
            address_translator: Arc::new(IdentityTranslator),
        }
    }
}

/// A named bundle of request settings, resolvable per request.
#[derive(Clone, Default)]
pub struct ExecutionProfile {
    pub consistency: Option<Consistency>,
    pub serial_consistency: Option<Consistency>,
    pub read_timeout_ms: Option<u64>,
    pub retry: Option<Arc<dyn RetryPolicy>>,
    pub speculative_execution: Option<Arc<dyn SpeculativeExecutionPolicy>>,
    pub load_balancing: Option<Arc<dyn LoadBalancingPolicy>>,
}

/// Per-request overrides, the typed equivalent of the source's loose
/// option bags.
#[derive(Clone, Default)]
pub struct ExecutionOptions {
    pub consistency: Option<Consistency>,
    pub serial_consistency: Option<Consistency>,
    /// Microsecond timestamp; wins over the timestamp generator.
    pub timestamp: Option<i64>,
    /// Explicit routing key bytes.
    pub routing_key: Option<Vec<u8>>,
    /// Explicit routing token; wins over `routing_key`.
    pub routing_token: Option<Token>,
    /// Parameter indexes forming the partition key of an unprepared query.
    pub routing_indexes: Option<Vec<usize>>,
    pub keyspace: Option<String>,
    pub prepare: Option<bool>,
    pub is_idempotent: Option<bool>,
    pub read_timeout_ms: Option<u64>,
    pub retry_policy: Option<Arc<dyn RetryPolicy>>,
    pub execution_profile: Option<String>,
    pub fetch_size: Option<i32>,
    pub paging_state: Option<Vec<u8>>,
    /// Logged (atomic) batch or unlogged.
    pub logged: Option<bool>,
}

/// Everything a session needs to come up.
#[derive(Clone)]
pub struct ClientOptions {
    /// Seed endpoints, as host or host:port.
    pub contact_points: Vec<String>,
    /// Port assumed for contact points and discovered peers without one.
    pub default_port: u16,
    pub local_data_center: Option<String>,
    pub protocol_max_version: ProtocolVersion,
    pub socket: SocketOptions,
    pub pooling: PoolingOptions,
    pub query: QueryOptions,
    pub policies: Policies,
    pub auth_provider: Option<Arc<dyn AuthProvider>>,
    pub compressor: Option<Arc<dyn FrameCompressor>>,
    pub prepare_on_all_hosts: bool,
    pub re_prepare_on_up: bool,
    pub profiles: HashMap<String, ExecutionProfile>,
    pub request_tracker: Option<Arc<dyn RequestTracker>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            contact_points: Vec::new(),
            default_port: 9042,
            local_data_center: None,
            protocol_max_version: ProtocolVersion::MAX,
            socket: SocketOptions::default(),
            pooling: PoolingOptions::default(),
            query: QueryOptions::default(),
            policies: Policies::default(),
            auth_provider: None,
            compressor: None,
            prepare_on_all_hosts: true,
            re_prepare_on_up: true,
            profiles: HashMap::new(),
            request_tracker: None,
        }
    }
}

impl ClientOptions {
    pub fn with_contact_points(points: &[&str]) -> ClientOptions {
        ClientOptions {
            contact_points: points.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.contact_points.is_empty() {
            return Err(DriverError::Argument(
                "at least one contact point is required".to_string(),
            ));
        }
        for point in &self.contact_points {
            if point.trim().is_empty() {
                return Err(DriverError::Argument(
                    "contact points must not be empty strings".to_string(),
                ));
            }
        }
        if self.protocol_max_version > ProtocolVersion::MAX {
            return Err(DriverError::Argument(format!(
                "protocol version {} is not supported (maximum {})",
                self.protocol_max_version,
                ProtocolVersion::MAX
            )));
        }
        if self.socket.read_timeout_ms == 0 {
            return Err(DriverError::Argument(
                "socket read timeout must be positive".to_string(),
            ));
        }
        if self.query.fetch_size <= 0 {
            return Err(DriverError::Argument(
                "fetch size must be positive".to_string(),
            ));
        }
        if self.query.serial_consistency != Consistency::Serial
            && self.query.serial_consistency != Consistency::LocalSerial
        {
            return Err(DriverError::Argument(format!(
                "serial consistency must be SERIAL or LOCAL_SERIAL, got {}",
                self.query.serial_consistency
            )));
        }
        if self.pooling.core_connections_local > self.pooling.max_connections_local
            || self.pooling.core_connections_remote > self.pooling.max_connections_remote
        {
            return Err(DriverError::Argument(
                "core connections must not exceed max connections".to_string(),
            ));
        }
        for (name, profile) in &self.profiles {
            if let Some(serial) = profile.serial_consistency {
                if !serial.is_serial() {
                    return Err(DriverError::Argument(format!(
                        "profile '{name}': serial consistency must be SERIAL or LOCAL_SERIAL"
                    )));
                }
            }
            if profile.read_timeout_ms == Some(0) {
                return Err(DriverError::Argument(format!(
                    "profile '{name}': read timeout must be positive"
                )));
            }
        }
        Ok(())
    }
}

/// Keyspace names are interpolated into `USE` statements, so they are
/// validated first: up to 48 alphanumeric or underscore characters.
pub fn verify_keyspace_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 48 {
        return Err(DriverError::Argument(format!(
            "invalid keyspace name '{name}': must be 1-48 characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(DriverError::Argument(format!(
            "invalid keyspace name '{name}': only alphanumerics and underscores are allowed"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_validate() {
        let options = ClientOptions::with_contact_points(&["127.0.0.1"]);
        options.validate().unwrap();
    }

    #[test]
    fn test_empty_contact_points_rejected() {
        let options = ClientOptions::default();
        assert!(matches!(
            options.validate(),
            Err(DriverError::Argument(_))
        ));
    }

    #[test]
    fn test_bad_serial_consistency_rejected() {
        let mut options = ClientOptions::with_contact_points(&["127.0.0.1"]);
        options.query.serial_consistency = Consistency::Quorum;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_core_above_max_rejected() {
        let mut options = ClientOptions::with_contact_points(&["127.0.0.1"]);
        options.pooling.core_connections_local = 9;
        options.pooling.max_connections_local = 4;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_profile_validation() {
        let mut options = ClientOptions::with_contact_points(&["127.0.0.1"]);
        options.profiles.insert(
            "oltp".to_string(),
            ExecutionProfile {
                serial_consistency: Some(Consistency::Two),
                ..Default::default()
            },
        );
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_keyspace_name_rules() {
        verify_keyspace_name("ks1").unwrap();
        verify_keyspace_name("a_b_c_123").unwrap();
        assert!(verify_keyspace_name("").is_err());
        assert!(verify_keyspace_name("bad-name").is_err());
        assert!(verify_keyspace_name("x".repeat(49).as_str()).is_err());
        assert!(verify_keyspace_name("drop table; --").is_err());
    }
}
