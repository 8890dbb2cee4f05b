//! Budget based packet pacing
//!
//! The budget refills at the pacing rate and is capped at a burst of
//! [`MAX_BURST_PACKETS`] datagrams (or the bytes the rate allows within
//! [`MIN_PACING_DELAY`] plus the timer granularity, whichever is larger).

use crate::rtt::TIMER_GRANULARITY;
use std::time::{Duration, Instant};

/// Largest burst the pacer allows, in datagrams
pub const MAX_BURST_PACKETS: u64 = 10;

/// Shortest delay the pacer asks the caller to wait
pub const MIN_PACING_DELAY: Duration = Duration::from_millis(1);

const NANOS_PER_SEC: u128 = 1_000_000_000;

#[derive(Debug, Clone)]
pub struct Pacer {
    budget_at_last_sent: u64,
    max_datagram_size: u64,
    last_sent_time: Option<Instant>,
}

impl Pacer {
    pub fn new(max_datagram_size: u64) -> Self {
        Pacer {
            budget_at_last_sent: MAX_BURST_PACKETS * max_datagram_size,
            max_datagram_size,
            last_sent_time: None,
        }
    }

    /// Charge a sent packet against the budget. `rate` is in bytes per second.
    pub fn on_packet_sent(&mut self, now: Instant, size: u64, rate: u64) {
        let budget = self.budget(now, rate);
        self.budget_at_last_sent = budget.saturating_sub(size);
        self.last_sent_time = Some(now);
    }

    /// Bytes that may be sent at `now`
    pub fn budget(&self, now: Instant, rate: u64) -> u64 {
        let Some(last) = self.last_sent_time else {
            return self.max_burst_size(rate);
        };
        let elapsed = now.saturating_duration_since(last).as_nanos();
        let refill = (u128::from(rate) * elapsed / NANOS_PER_SEC).min(u128::from(u64::MAX)) as u64;
        self.budget_at_last_sent
            .saturating_add(refill)
            .min(self.max_burst_size(rate))
    }

    /// Earliest time a full-size packet fits the budget; `None` if it fits now
    pub fn next_send_time(&self, rate: u64) -> Option<Instant> {
        if self.budget_at_last_sent >= self.max_datagram_size || rate == 0 {
            return None;
        }
        let last = self.last_sent_time?;
        let missing = u128::from(self.max_datagram_size - self.budget_at_last_sent) * NANOS_PER_SEC;
        let rate = u128::from(rate);
        // round up so the budget is not a few bytes short when the timer fires
        let nanos = ((missing + rate - 1) / rate).min(u128::from(u64::MAX)) as u64;
        Some(last + Duration::from_nanos(nanos).max(MIN_PACING_DELAY))
    }

    pub fn set_max_datagram_size(&mut self, size: u64) {
        self.max_datagram_size = size;
    }

    fn max_burst_size(&self, rate: u64) -> u64 {
        let window = (MIN_PACING_DELAY + TIMER_GRANULARITY).as_nanos();
        let rate_burst = (u128::from(rate) * window / NANOS_PER_SEC).min(u128::from(u64::MAX)) as u64;
        rate_burst.max(MAX_BURST_PACKETS * self.max_datagram_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MDS: u64 = 1200;

    #[test]
    fn test_initial_burst() {
        let pacer = Pacer::new(MDS);
        let now = Instant::now();
        assert_eq!(pacer.budget(now, 1_000_000), MAX_BURST_PACKETS * MDS);
        assert!(pacer.next_send_time(1_000_000).is_none());
    }

    #[test]
    fn test_budget_exhausted_and_refilled() {
        let mut pacer = Pacer::new(MDS);
        let start = Instant::now();
        // 1.2 MB/s refills one datagram per millisecond
        let rate = 1_200_000;

        for _ in 0..MAX_BURST_PACKETS {
            assert!(pacer.budget(start, rate) >= MDS);
            pacer.on_packet_sent(start, MDS, rate);
        }
        assert!(pacer.budget(start, rate) < MDS);

        let next = pacer.next_send_time(rate).unwrap();
        assert_eq!(next, start + Duration::from_millis(1));
        assert!(pacer.budget(next, rate) >= MDS);
    }

    #[test]
    fn test_budget_capped_at_burst() {
        let mut pacer = Pacer::new(MDS);
        let start = Instant::now();
        pacer.on_packet_sent(start, MDS, 1_000);

        let later = start + Duration::from_secs(3600);
        assert_eq!(pacer.budget(later, 1_000), MAX_BURST_PACKETS * MDS);
    }

    #[test]
    fn test_min_pacing_delay() {
        let mut pacer = Pacer::new(MDS);
        let start = Instant::now();
        let rate = u64::MAX / 2;
        pacer.budget_at_last_sent = 0;
        pacer.last_sent_time = Some(start);

        assert_eq!(pacer.next_send_time(rate), Some(start + MIN_PACING_DELAY));
    }
}
