// Client-side timestamp generation
//
// Generators produce microsecond timestamps attached to requests when the
// protocol supports them; returning `None` defers to the server clock. The
// monotonic generator guarantees strictly increasing values within the
// process by spreading up to 1000 microsecond sub-ticks over each wall
// clock millisecond and artificially advancing when the clock stalls.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

/// Millisecond wall clock, injectable for tests.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

pub trait TimestampGenerator: Send + Sync {
    /// Next timestamp in microseconds since the Unix epoch, or `None` to
    /// let the server assign one.
    fn next(&self) -> Option<i64>;
}

/// Always defers to the server.
pub struct ServerSideTimestampGenerator;

impl TimestampGenerator for ServerSideTimestampGenerator {
    fn next(&self) -> Option<i64> {
        None
    }
}

struct MonotonicState {
    last_ms: i64,
    micros: i64,
    last_warn_ms: Option<i64>,
}

/// Strictly increasing microsecond timestamps.
pub struct MonotonicTimestampGenerator {
    clock: Arc<dyn Clock>,
    state: Mutex<MonotonicState>,
    /// Artificial clock advancement (ms) above which a warning is logged.
    warning_threshold_ms: i64,
    /// Minimum spacing between two drift warnings.
    min_log_interval_ms: i64,
    warnings_emitted: AtomicU64,
}

impl MonotonicTimestampGenerator {
    pub fn new() -> Self {
        MonotonicTimestampGenerator::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        MonotonicTimestampGenerator {
            clock,
            state: Mutex::new(MonotonicState {
                last_ms: i64::MIN,
                micros: 0,
                last_warn_ms: None,
            }),
            warning_threshold_ms: 0,
            min_log_interval_ms: 1000,
            warnings_emitted: AtomicU64::new(0),
        }
    }

    /// The drift thresholds are deliberately configuration, not inferred.
    pub fn with_thresholds(mut self, warning_threshold_ms: i64, min_log_interval_ms: i64) -> Self {
        self.warning_threshold_ms = warning_threshold_ms;
        self.min_log_interval_ms = min_log_interval_ms;
        self
    }

    /// Number of drift warnings logged so far.
    pub fn drift_warnings(&self) -> u64 {
        self.warnings_emitted.load(Ordering::Relaxed)
    }
}

impl Default for MonotonicTimestampGenerator {
    fn default() -> Self {
        MonotonicTimestampGenerator::new()
    }
}

impl TimestampGenerator for MonotonicTimestampGenerator {
    fn next(&self) -> Option<i64> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();

        if now > state.last_ms {
            state.last_ms = now;
            state.micros = 0;
        } else if state.micros < 999 {
            state.micros += 1;
        } else {
            // Sub-ticks exhausted: advance the millisecond artificially
            state.micros = 0;
            state.last_ms += 1;
            let drift = state.last_ms - now;
            if drift > self.warning_threshold_ms {
                let due = match state.last_warn_ms {
                    None => true,
                    Some(last) => now - last >= self.min_log_interval_ms,
                };
                if due {
                    state.last_warn_ms = Some(now);
                    self.warnings_emitted.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        drift_ms = drift,
                        "timestamps generated ahead of the wall clock; clock is stalled or \
                         generating over 1000 timestamps per millisecond"
                    );
                }
            }
        }

        Some(state.last_ms * 1000 + state.micros)
    }
}
