//! CUBIC congestion avoidance (RFC 9438)
//!
//! The window follows W_cubic(t) = C * (t - K)^3 + W_max, measured in
//! datagrams, with a Reno-friendly estimate as a floor.

use super::classic::WindowAdjustment;
use std::fmt;
use std::time::{Duration, Instant};

/// Scaling constant C
pub const CUBIC_C: f64 = 0.4;

/// Multiplicative decrease factor beta, as a fraction
pub const CUBIC_BETA_DIVIDEND: u64 = 7;
pub const CUBIC_BETA_DIVISOR: u64 = 10;

const CUBIC_BETA: f64 = 0.7;

/// Reno-friendly additive increase factor: 3 * (1 - beta) / (1 + beta)
const CUBIC_ALPHA: f64 = 3.0 * (1.0 - CUBIC_BETA) / (1.0 + CUBIC_BETA);

/// W_max reduction when a congestion event happens below the previous maximum
const CUBIC_FAST_CONVERGENCE: f64 = (1.0 + CUBIC_BETA) / 2.0;

/// Growth is capped at one datagram per this many datagrams acknowledged
const MAX_GROWTH_ACKED_DATAGRAMS: f64 = 2.0;

#[derive(Debug, Default, Clone)]
pub struct Cubic {
    /// Window before the last reduction
    last_max_cwnd: f64,
    /// Reno-friendly window estimate
    estimated_tcp_cwnd: f64,
    /// Time for W_cubic to return to W_max, in seconds
    k: f64,
    w_max: f64,
    epoch_start: Option<Instant>,
    tcp_acked_bytes: f64,
}

impl Cubic {
    fn start_epoch(&mut self, cwnd: f64, new_acked: f64, mds: f64, now: Instant) {
        self.epoch_start = Some(now);
        self.tcp_acked_bytes = new_acked;
        self.estimated_tcp_cwnd = cwnd;
        if self.last_max_cwnd <= cwnd {
            self.w_max = cwnd;
            self.k = 0.0;
        } else {
            self.w_max = self.last_max_cwnd;
            self.k = ((self.w_max - cwnd) / CUBIC_C / mds).cbrt();
        }
    }

    fn w_cubic(&self, t: f64, mds: f64) -> f64 {
        CUBIC_C * (t - self.k).powi(3) * mds + self.w_max
    }
}

impl WindowAdjustment for Cubic {
    fn bytes_for_cwnd_increase(
        &mut self,
        cwnd: u64,
        new_acked: u64,
        min_rtt: Duration,
        max_datagram_size: u64,
        now: Instant,
    ) -> u64 {
        let cwnd = cwnd as f64;
        let new_acked = new_acked as f64;
        let mds = max_datagram_size as f64;

        match self.epoch_start {
            None => self.start_epoch(cwnd, new_acked, mds, now),
            Some(_) => self.tcp_acked_bytes += new_acked,
        }

        let elapsed = self.epoch_start.map_or(min_rtt, |start| {
            (now + min_rtt).checked_duration_since(start).unwrap_or(min_rtt)
        });
        let target_cubic = self.w_cubic(elapsed.as_secs_f64(), mds);

        let tcp_count = self.estimated_tcp_cwnd / CUBIC_ALPHA;
        while tcp_count > 0.0 && self.tcp_acked_bytes > tcp_count {
            self.tcp_acked_bytes -= tcp_count;
            self.estimated_tcp_cwnd += mds;
        }

        let target = target_cubic.max(self.estimated_tcp_cwnd);
        // (target - cwnd) / cwnd datagrams per acknowledged datagram
        let acked_to_increase = (mds * cwnd / (target - cwnd).max(1.0)).max(MAX_GROWTH_ACKED_DATAGRAMS * mds);
        acked_to_increase as u64
    }

    fn reduce_cwnd(&mut self, cwnd: u64, acked_bytes: u64, max_datagram_size: u64) -> (u64, u64) {
        let cwnd_f = cwnd as f64;
        self.last_max_cwnd = if cwnd_f + (max_datagram_size as f64) < self.last_max_cwnd {
            cwnd_f * CUBIC_FAST_CONVERGENCE
        } else {
            cwnd_f
        };
        self.epoch_start = None;
        (
            cwnd * CUBIC_BETA_DIVIDEND / CUBIC_BETA_DIVISOR,
            acked_bytes * CUBIC_BETA_DIVIDEND / CUBIC_BETA_DIVISOR,
        )
    }

    fn on_app_limited(&mut self) {
        // restart the epoch once the sender uses its window again
        self.epoch_start = None;
    }

    fn name(&self) -> &'static str {
        "cubic"
    }
}

impl fmt::Display for Cubic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cubic w_max={:.0} k={:.3}", self.w_max, self.k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MDS: u64 = 1200;

    #[test]
    fn test_reduce_by_beta() {
        let mut cubic = Cubic::default();
        assert_eq!(cubic.reduce_cwnd(100_000, 1000, MDS), (70_000, 700));
        assert_eq!(cubic.last_max_cwnd, 100_000.0);
    }

    #[test]
    fn test_fast_convergence() {
        let mut cubic = Cubic::default();
        cubic.reduce_cwnd(100_000, 0, MDS);
        cubic.reduce_cwnd(70_000, 0, MDS);
        assert_eq!(cubic.last_max_cwnd, 70_000.0 * CUBIC_FAST_CONVERGENCE);
    }

    #[test]
    fn test_concave_then_convex() {
        let start = Instant::now();
        let rtt = Duration::from_millis(100);
        let mut cubic = Cubic::default();
        cubic.reduce_cwnd(100_000, 0, MDS);

        // right after the reduction the window is far below W_max: fast growth
        let early = cubic.bytes_for_cwnd_increase(70_000, MDS, rtt, MDS, start);
        assert!(cubic.k > 0.0);

        // near K the target is close to W_max: slow growth
        let plateau = start + Duration::from_secs_f64(cubic.k) - rtt;
        let near_k = cubic.bytes_for_cwnd_increase(99_000, MDS, rtt, MDS, plateau);
        assert!(near_k > early);
    }

    #[test]
    fn test_growth_capped() {
        let start = Instant::now();
        let mut cubic = Cubic::default();
        let bytes = cubic.bytes_for_cwnd_increase(12_000, MDS, Duration::from_secs(100), MDS, start);
        assert!(bytes >= 2 * MDS);
    }
}
