//! NewReno congestion avoidance (RFC 9002 §7.3.3)

use super::classic::WindowAdjustment;
use std::fmt;
use std::time::{Duration, Instant};

/// Additive increase of one datagram per window, halving on congestion
#[derive(Debug, Default, Clone, Copy)]
pub struct NewReno;

impl WindowAdjustment for NewReno {
    fn bytes_for_cwnd_increase(
        &mut self,
        cwnd: u64,
        _new_acked: u64,
        _min_rtt: Duration,
        _max_datagram_size: u64,
        _now: Instant,
    ) -> u64 {
        cwnd
    }

    fn reduce_cwnd(&mut self, cwnd: u64, acked_bytes: u64, _max_datagram_size: u64) -> (u64, u64) {
        (cwnd / 2, acked_bytes / 2)
    }

    fn on_app_limited(&mut self) {}

    fn name(&self) -> &'static str {
        "newreno"
    }
}

impl fmt::Display for NewReno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_datagram_per_window() {
        let mut reno = NewReno;
        let now = Instant::now();
        assert_eq!(reno.bytes_for_cwnd_increase(24_000, 1200, Duration::ZERO, 1200, now), 24_000);
    }

    #[test]
    fn test_halves() {
        let mut reno = NewReno;
        assert_eq!(reno.reduce_cwnd(24_000, 1000, 1200), (12_000, 500));
    }
}
