// Pluggable policies
//
// Everything tunable about request routing and failure handling hangs off
// a trait in this module: load balancing, retry, reconnection, speculative
// execution, timestamp generation and address translation. Each has the
// stock implementations the driver ships plus room for user variants.

pub mod address;
pub mod load_balancing;
pub mod reconnection;
pub mod retry;
pub mod speculative;
pub mod timestamp;

pub use address::{AddressTranslator, Ec2MultiRegionTranslator, IdentityTranslator};
pub use load_balancing::{
    AllowListPolicy, DcAwareRoundRobinPolicy, DefaultLoadBalancingPolicy, LoadBalancingPolicy,
    QueryPlan, RequestInfo, RoundRobinPolicy, TokenAwarePolicy,
};
pub use reconnection::{
    ConstantReconnectionPolicy, ExponentialReconnectionPolicy, ReconnectionPolicy,
    ReconnectionSchedule,
};
pub use retry::{
    DefaultRetryPolicy, FallthroughRetryPolicy, IdempotenceAwareRetryPolicy, RetryContext,
    RetryDecision, RetryPolicy,
};
pub use speculative::{
    ConstantSpeculativeExecutionPolicy, NoSpeculativeExecutionPolicy, SpeculativeExecutionPlan,
    SpeculativeExecutionPolicy,
};
pub use timestamp::{
    Clock, MonotonicTimestampGenerator, ServerSideTimestampGenerator, SystemClock,
    TimestampGenerator,
};
