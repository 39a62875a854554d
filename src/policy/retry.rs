// Retry policies
//
// A retry policy observes read/write timeouts, unavailable errors and
// request-level failures, and answers with rethrow, retry (optionally at a
// downgraded consistency, on the same or the next host) or ignore (complete
// the request with an empty result).

use crate::error::DriverError;
use crate::frame::Consistency;

/// Facts about the failing attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryContext<'a> {
    pub consistency: Consistency,
    pub is_idempotent: bool,
    /// Retries already performed for this request.
    pub retry_count: usize,
    pub error: &'a DriverError,
}

/// What to do with the failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Surface the error to the caller.
    Rethrow,
    /// Try again, optionally at another consistency; `use_current_host`
    /// resubmits on the same coordinator instead of the next one.
    Retry {
        consistency: Option<Consistency>,
        use_current_host: bool,
    },
    /// Swallow the error and complete with an empty result.
    Ignore,
}

impl RetryDecision {
    pub fn retry_same_host() -> RetryDecision {
        RetryDecision::Retry {
            consistency: None,
            use_current_host: true,
        }
    }

    pub fn retry_next_host() -> RetryDecision {
        RetryDecision::Retry {
            consistency: None,
            use_current_host: false,
        }
    }
}

pub trait RetryPolicy: Send + Sync {
    fn on_read_timeout(
        &self,
        ctx: &RetryContext<'_>,
        received: i32,
        block_for: i32,
        data_present: bool,
    ) -> RetryDecision;

    fn on_write_timeout(
        &self,
        ctx: &RetryContext<'_>,
        received: i32,
        block_for: i32,
        write_type: &str,
    ) -> RetryDecision;

    fn on_unavailable(&self, ctx: &RetryContext<'_>, alive: i32, required: i32) -> RetryDecision;

    /// Socket errors, overload responses and other request-level failures.
    fn on_request_error(&self, ctx: &RetryContext<'_>) -> RetryDecision;
}

/// The stock policy.
///
/// Re-reads on the same host when enough replicas answered but the data
/// replica did not; retries writes only for batch-log writes and, when the
/// request is idempotent, simple and batch writes; tries the next host once
/// on unavailable; never retries non-idempotent requests on request errors.
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn on_read_timeout(
        &self,
        ctx: &RetryContext<'_>,
        received: i32,
        block_for: i32,
        data_present: bool,
    ) -> RetryDecision {
        if ctx.retry_count == 0 && received >= block_for && !data_present {
            RetryDecision::retry_same_host()
        } else {
            RetryDecision::Rethrow
        }
    }

    fn on_write_timeout(
        &self,
        ctx: &RetryContext<'_>,
        _received: i32,
        _block_for: i32,
        write_type: &str,
    ) -> RetryDecision {
        if ctx.retry_count != 0 {
            return RetryDecision::Rethrow;
        }
        let retriable = write_type == "BATCH_LOG"
            || (ctx.is_idempotent && matches!(write_type, "SIMPLE" | "BATCH"));
        if retriable {
            RetryDecision::retry_same_host()
        } else {
            RetryDecision::Rethrow
        }
    }

    fn on_unavailable(&self, ctx: &RetryContext<'_>, _alive: i32, _required: i32) -> RetryDecision {
        if ctx.retry_count == 0 {
            RetryDecision::retry_next_host()
        } else {
            RetryDecision::Rethrow
        }
    }

    fn on_request_error(&self, ctx: &RetryContext<'_>) -> RetryDecision {
        if ctx.is_idempotent {
            RetryDecision::retry_next_host()
        } else {
            RetryDecision::Rethrow
        }
    }
}

/// Wraps another policy and refuses to retry writes and request errors for
/// requests that are not marked idempotent, regardless of what the wrapped
/// policy would decide.
pub struct IdempotenceAwareRetryPolicy<P: RetryPolicy> {
    inner: P,
}

impl<P: RetryPolicy> IdempotenceAwareRetryPolicy<P> {
    pub fn new(inner: P) -> Self {
        IdempotenceAwareRetryPolicy { inner }
    }
}

impl<P: RetryPolicy> RetryPolicy for IdempotenceAwareRetryPolicy<P> {
    fn on_read_timeout(
        &self,
        ctx: &RetryContext<'_>,
        received: i32,
        block_for: i32,
        data_present: bool,
    ) -> RetryDecision {
        self.inner.on_read_timeout(ctx, received, block_for, data_present)
    }

    fn on_write_timeout(
        &self,
        ctx: &RetryContext<'_>,
        received: i32,
        block_for: i32,
        write_type: &str,
    ) -> RetryDecision {
        if !ctx.is_idempotent {
            return RetryDecision::Rethrow;
        }
        self.inner.on_write_timeout(ctx, received, block_for, write_type)
    }

    fn on_unavailable(&self, ctx: &RetryContext<'_>, alive: i32, required: i32) -> RetryDecision {
        self.inner.on_unavailable(ctx, alive, required)
    }

    fn on_request_error(&self, ctx: &RetryContext<'_>) -> RetryDecision {
        if !ctx.is_idempotent {
            return RetryDecision::Rethrow;
        }
        self.inner.on_request_error(ctx)
    }
}

/// Rethrows everything; useful when the application wants full control.
pub struct FallthroughRetryPolicy;

impl RetryPolicy for FallthroughRetryPolicy {
    fn on_read_timeout(
        &self,
        _ctx: &RetryContext<'_>,
        _received: i32,
        _block_for: i32,
        _data_present: bool,
    ) -> RetryDecision {
        RetryDecision::Rethrow
    }

    fn on_write_timeout(
        &self,
        _ctx: &RetryContext<'_>,
        _received: i32,
        _block_for: i32,
        _write_type: &str,
    ) -> RetryDecision {
        RetryDecision::Rethrow
    }

    fn on_unavailable(&self, _ctx: &RetryContext<'_>, _alive: i32, _required: i32) -> RetryDecision {
        RetryDecision::Rethrow
    }

    fn on_request_error(&self, _ctx: &RetryContext<'_>) -> RetryDecision {
        RetryDecision::Rethrow
    }
}
