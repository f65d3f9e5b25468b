//! A single learned endpoint and its bookkeeping.

use crate::endpoint::Endpoint;
use crate::tables::{HORIZON_DAYS, MAX_FAILURES, MAX_RETRIES, MIN_FAIL_DAYS};

const DAY_SECS: i64 = 24 * 60 * 60;

/// One entry per learned endpoint. Lives in the manager's dense arena,
/// addressed everywhere else (bucket matrices, `random_order`) by id.
#[derive(Debug, Clone)]
pub struct ExtendedEntry {
    /// The endpoint itself.
    pub peer: Endpoint,
    /// The endpoint that told us about `peer` (equal to `peer` if
    /// self-announced or added with no explicit source).
    pub src: Endpoint,
    /// Index of this entry's id within the manager's `random_order`.
    pub random_pos: usize,
    /// Whether this entry currently lives in the TRIED table.
    pub is_tried: bool,
    /// Number of NEW slots currently referencing this entry.
    pub ref_count: u8,
    /// Timestamp of the last successful connection.
    pub last_success: i64,
    /// Timestamp of the last connection attempt (successful or not).
    pub last_try: i64,
    /// Timestamp of the last attempt that was counted against `attempts`.
    pub last_count_attempt: i64,
    /// Number of attempts counted since the last manager-wide "good" event.
    pub attempts: u32,
    /// Internal, possibly penalty-adjusted copy of `peer.timestamp`.
    pub time: i64,
}

impl ExtendedEntry {
    /// Create a fresh entry for `peer`, learned via `src`.
    pub fn new(peer: Endpoint, src: Endpoint) -> Self {
        ExtendedEntry {
            time: peer.timestamp,
            peer,
            src,
            random_pos: 0,
            is_tried: false,
            ref_count: 0,
            last_success: 0,
            last_try: 0,
            last_count_attempt: 0,
            attempts: 0,
        }
    }

    /// Whether this entry is old, never-successful, or too-failed, and
    /// thus eligible for eviction from NEW or suppression from gossip.
    ///
    /// An entry tried within the last minute is never terrible,
    /// regardless of its other attributes — this protects an in-flight
    /// connection attempt from being evicted out from under itself.
    pub fn is_terrible(&self, now: i64) -> bool {
        if self.last_try > 0 && self.last_try >= now - 60 {
            return false;
        }

        // Arrived in a flying DeLorean: the timestamp is implausibly far
        // in the future.
        if self.time > now + 10 * 60 {
            return true;
        }

        // Never seen, or not seen in recent history.
        if self.time == 0 || now - self.time > HORIZON_DAYS * DAY_SECS {
            return true;
        }

        // Tried several times and never once succeeded.
        if self.last_success == 0 && self.attempts >= MAX_RETRIES {
            return true;
        }

        // Repeated failures within the last week.
        if now - self.last_success > MIN_FAIL_DAYS * DAY_SECS && self.attempts >= MAX_FAILURES {
            return true;
        }

        false
    }

    /// Relative weight this entry should carry during `select_peer`'s
    /// rejection sampling: 1.0 for a healthy entry, pulled down by
    /// recent attempts and by accumulated failures (capped so a long
    /// outage cannot zero an entry out forever).
    pub fn selection_chance(&self, now: i64) -> f64 {
        let mut chance = 1.0;

        let since_last_try = (now - self.last_try).max(0);
        if since_last_try < 10 * 60 {
            chance *= 0.01;
        }

        chance *= 0.66_f64.powi(self.attempts.min(8) as i32);
        chance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn ep(ts: i64) -> Endpoint {
        Endpoint::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 9000, ts)
    }

    #[test]
    fn recently_tried_is_never_terrible() {
        let mut e = ExtendedEntry::new(ep(0), ep(0));
        e.last_try = 1000;
        assert!(!e.is_terrible(1030));
    }

    #[test]
    fn zero_time_is_terrible() {
        let e = ExtendedEntry::new(ep(0), ep(0));
        assert!(e.is_terrible(1_000_000));
    }

    #[test]
    fn stale_but_never_attempted_is_not_terrible_yet() {
        let mut e = ExtendedEntry::new(ep(500), ep(500));
        e.time = 500;
        assert!(!e.is_terrible(500 + 10 * 24 * 60 * 60));
    }

    #[test]
    fn three_failed_attempts_with_no_success_is_terrible() {
        let mut e = ExtendedEntry::new(ep(100), ep(100));
        e.attempts = 3;
        assert!(e.is_terrible(200));
    }

    #[test]
    fn selection_chance_decays_with_attempts() {
        let mut e = ExtendedEntry::new(ep(0), ep(0));
        e.last_try = -1_000_000;
        let base = e.selection_chance(0);
        e.attempts = 4;
        let decayed = e.selection_chance(0);
        assert!(decayed < base);
        e.attempts = 100;
        let capped = e.selection_chance(0);
        assert!((capped - e.selection_chance(0)).abs() < f64::EPSILON);
        assert_eq!(capped, 0.66_f64.powi(8));
    }
}
