// Reconnection scheduling
//
// A reconnection policy hands out an infinite, lazy sequence of delays in
// milliseconds. The pool pulls the next delay after every failed attempt
// to bring a host's connections back.

use rand::Rng;

/// An infinite sequence of reconnection delays.
pub type ReconnectionSchedule = Box<dyn Iterator<Item = u64> + Send>;

pub trait ReconnectionPolicy: Send + Sync {
    fn new_schedule(&self) -> ReconnectionSchedule;
}

/// The same delay forever.
pub struct ConstantReconnectionPolicy {
    delay_ms: u64,
}

impl ConstantReconnectionPolicy {
    pub fn new(delay_ms: u64) -> Self {
        ConstantReconnectionPolicy { delay_ms }
    }
}

impl ReconnectionPolicy for ConstantReconnectionPolicy {
    fn new_schedule(&self) -> ReconnectionSchedule {
        Box::new(std::iter::repeat(self.delay_ms))
    }
}

/// Exponential backoff with jitter.
///
/// Index i starts at 0, or -1 with `start_with_no_delay` (the -1 element is
/// an immediate attempt). The raw delay is min(base * 2^i, max), saturating
/// to max from i = 64 on. Jitter bands: a zero delay stays zero; the first
/// base-sized delay (without no-delay start) lands in [100%, 115%]; a
/// capped delay lands in [85%, 100%]; everything else in [85%, 115%].
pub struct ExponentialReconnectionPolicy {
    base_ms: u64,
    max_ms: u64,
    start_with_no_delay: bool,
}

impl ExponentialReconnectionPolicy {
    pub fn new(base_ms: u64, max_ms: u64, start_with_no_delay: bool) -> Self {
        ExponentialReconnectionPolicy {
            base_ms,
            max_ms,
            start_with_no_delay,
        }
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn new_schedule(&self) -> ReconnectionSchedule {
        Box::new(ExponentialSchedule {
            base_ms: self.base_ms,
            max_ms: self.max_ms,
            start_with_no_delay: self.start_with_no_delay,
            index: if self.start_with_no_delay { -1 } else { 0 },
        })
    }
}

struct ExponentialSchedule {
    base_ms: u64,
    max_ms: u64,
    start_with_no_delay: bool,
    index: i64,
}

impl Iterator for ExponentialSchedule {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let delay = if self.index < 0 {
            0
        } else if self.index >= 64 {
            self.max_ms
        } else {
            1u64.checked_shl(self.index as u32)
                .and_then(|power| self.base_ms.checked_mul(power))
                .map(|d| d.min(self.max_ms))
                .unwrap_or(self.max_ms)
        };
        self.index += 1;

        Some(apply_jitter(
            delay,
            self.base_ms,
            self.max_ms,
            self.start_with_no_delay,
        ))
    }
}

fn apply_jitter(delay: u64, base: u64, max: u64, start_with_no_delay: bool) -> u64 {
    if delay == 0 {
        return 0;
    }
    let (low_pct, high_pct) = if delay == base && !start_with_no_delay {
        (100, 115)
    } else if delay == max {
        (85, 100)
    } else {
        (85, 115)
    };
    let low = delay * low_pct / 100;
    let high = delay * high_pct / 100;
    if low >= high {
        return low;
    }
    rand::thread_rng().gen_range(low..=high)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_schedule() {
        let policy = ConstantReconnectionPolicy::new(500);
        let delays: Vec<u64> = policy.new_schedule().take(5).collect();
        assert_eq!(delays, vec![500; 5]);
    }

    #[test]
    fn test_exponential_first_delay_band() {
        let policy = ExponentialReconnectionPolicy::new(1000, 60000, false);
        for _ in 0..50 {
            let first = policy.new_schedule().next().unwrap();
            assert!((1000..=1150).contains(&first), "first delay {first}");
        }
    }

    #[test]
    fn test_exponential_growth_until_cap() {
        let policy = ExponentialReconnectionPolicy::new(1000, 60000, false);
        for _ in 0..20 {
            let delays: Vec<u64> = policy.new_schedule().take(12).collect();
            // Strictly non-decreasing until the cap is reached (index 6:
            // 1000 * 2^6 = 64000 > 60000)
            for window in delays[..7].windows(2) {
                assert!(
                    window[1] >= window[0],
                    "delays must not decrease before the cap: {delays:?}"
                );
            }
            // From the cap on, every delay sits in [85%, 100%] of max
            for &capped in &delays[6..] {
                assert!(
                    (51000..=60000).contains(&capped),
                    "capped delay {capped} out of band"
                );
            }
        }
    }

    #[test]
    fn test_start_with_no_delay() {
        let policy = ExponentialReconnectionPolicy::new(1000, 60000, true);
        let delays: Vec<u64> = policy.new_schedule().take(3).collect();
        assert_eq!(delays[0], 0);
        // With a no-delay start the base element jitters in [85%, 115%]
        assert!((850..=1150).contains(&delays[1]), "delay {}", delays[1]);
        assert!(delays[2] >= delays[1]);
    }

    #[test]
    fn test_no_overflow_at_high_indexes() {
        let policy = ExponentialReconnectionPolicy::new(1000, 60000, false);
        let schedule: Vec<u64> = policy.new_schedule().take(80).collect();
        for &delay in &schedule[70..] {
            assert!((51000..=60000).contains(&delay));
        }
    }
}
