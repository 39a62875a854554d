// Request tracking
//
// An optional observer notified after every request terminates, with byte
// counts and latency. The stock implementation logs requests that are slow
// or oversized on dedicated tracing targets so they can be routed
// independently of the driver's other output.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::warn;

use crate::error::DriverError;

pub trait RequestTracker: Send + Sync {
    fn on_success(
        &self,
        host: SocketAddr,
        query: &str,
        request_len: usize,
        response_len: usize,
        latency: Duration,
    );

    fn on_error(
        &self,
        host: SocketAddr,
        query: &str,
        request_len: usize,
        error: &DriverError,
        latency: Duration,
    );

    fn shutdown(&self) {}
}

/// Logs slow requests on `rusty_cql::tracker::slow` and oversized ones on
/// `rusty_cql::tracker::large`.
pub struct RequestLogger {
    slow_threshold: Duration,
    request_size_threshold: usize,
    slow_count: AtomicU64,
    large_count: AtomicU64,
}

impl RequestLogger {
    pub fn new(slow_threshold: Duration, request_size_threshold: usize) -> Self {
        RequestLogger {
            slow_threshold,
            request_size_threshold,
            slow_count: AtomicU64::new(0),
            large_count: AtomicU64::new(0),
        }
    }

    pub fn slow_count(&self) -> u64 {
        self.slow_count.load(Ordering::Relaxed)
    }

    pub fn large_count(&self) -> u64 {
        self.large_count.load(Ordering::Relaxed)
    }

    fn check(&self, host: SocketAddr, query: &str, request_len: usize, latency: Duration) {
        if latency >= self.slow_threshold {
            self.slow_count.fetch_add(1, Ordering::Relaxed);
            warn!(
                target: "rusty_cql::tracker::slow",
                %host,
                query,
                latency_ms = latency.as_millis() as u64,
                "slow request"
            );
        }
        if request_len >= self.request_size_threshold {
            self.large_count.fetch_add(1, Ordering::Relaxed);
            warn!(
                target: "rusty_cql::tracker::large",
                %host,
                query,
                request_len,
                "large request"
            );
        }
    }
}

impl Default for RequestLogger {
    fn default() -> Self {
        RequestLogger::new(Duration::from_millis(1000), 128 * 1024)
    }
}

impl RequestTracker for RequestLogger {
    fn on_success(
        &self,
        host: SocketAddr,
        query: &str,
        request_len: usize,
        _response_len: usize,
        latency: Duration,
    ) {
        self.check(host, query, request_len, latency);
    }

    fn on_error(
        &self,
        host: SocketAddr,
        query: &str,
        request_len: usize,
        _error: &DriverError,
        latency: Duration,
    ) {
        self.check(host, query, request_len, latency);
    }
}
