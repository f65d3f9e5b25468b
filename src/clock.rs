//! Injectable time source.
//!
//! The core never reads the wall clock (spec §9's design note on
//! default-argument time evaluation: every `now` must be captured at
//! call time, not frozen at function-definition time). The concurrency
//! wrapper owns a `Clock` and samples it immediately before delegating
//! into the core, so tests can swap in a fixed or scripted clock.

use std::time::{SystemTime, UNIX_EPOCH};

/// A source of "seconds since the Unix epoch".
pub trait Clock: Send + Sync {
    /// The current time, sampled fresh on every call.
    fn now(&self) -> i64;
}

/// The real wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_plausible() {
        let now = SystemClock.now();
        assert!(now > 1_600_000_000);
    }
}
