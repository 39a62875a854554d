// RustyCQL - client driver core for wide-column databases
//
// From a list of seed endpoints the driver discovers the cluster topology,
// keeps authenticated connection pools to every reachable node, multiplexes
// concurrent requests per connection over the framed binary protocol, and
// dispatches each query to a well-chosen replica under the configured
// consistency, retry, speculative-execution and failover policies.

pub mod cluster;
pub mod codec;
pub mod connection;
pub mod control;
pub mod error;
pub mod executor;
pub mod frame;
pub mod options;
pub mod policy;
pub mod pool;
pub mod prepared;
pub mod session;
pub mod tracker;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{DriverError, ErrorCode, ResponseError, Result};

// Re-export the surface a typical application touches
pub use cluster::{Host, HostDistance, HostState, Token, TokenRange};
pub use codec::{CqlDecimal, CqlDuration, CqlType, CqlValue, QueryValue};
pub use connection::auth::{AuthProvider, Authenticator, PlainTextAuthProvider};
pub use executor::{ResultSet, Statement};
pub use frame::{Consistency, ProtocolVersion};
pub use options::{ClientOptions, ExecutionOptions, ExecutionProfile};
pub use prepared::PreparedStatement;
pub use session::Session;

// Policy implementations, for configuration
pub use policy::{
    AllowListPolicy, ConstantReconnectionPolicy, ConstantSpeculativeExecutionPolicy,
    DcAwareRoundRobinPolicy, DefaultLoadBalancingPolicy, DefaultRetryPolicy,
    Ec2MultiRegionTranslator, ExponentialReconnectionPolicy, FallthroughRetryPolicy,
    IdempotenceAwareRetryPolicy, IdentityTranslator, MonotonicTimestampGenerator,
    NoSpeculativeExecutionPolicy, RoundRobinPolicy, TokenAwarePolicy,
};
pub use tracker::{RequestLogger, RequestTracker};
