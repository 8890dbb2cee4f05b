//! Round-trip time estimation (RFC 9002 §5)
//!
//! Tracks the latest, minimum and smoothed RTT along with the RTT variance.
//! One estimator exists per connection; the sent-packet handler is the only
//! writer, congestion control and flow-control auto-tuning read it through
//! [`SharedRttStats`].

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// RTT assumed before the first sample is taken
pub const DEFAULT_INITIAL_RTT: Duration = Duration::from_millis(333);

/// Timer granularity (kGranularity)
pub const TIMER_GRANULARITY: Duration = Duration::from_millis(1);

/// Default maximum ack delay advertised by a peer
pub const DEFAULT_MAX_ACK_DELAY: Duration = Duration::from_millis(25);

/// RTT estimator shared between loss recovery and flow control
pub type SharedRttStats = Arc<RwLock<RttStats>>;

/// RTT estimator
#[derive(Debug, Clone)]
pub struct RttStats {
    /// Most recent raw sample
    latest_rtt: Duration,
    /// Exponentially weighted moving average
    smoothed_rtt: Duration,
    /// Mean deviation
    rtt_variance: Duration,
    /// Minimum raw sample seen
    min_rtt: Duration,
    /// RTT used until the first sample
    initial_rtt: Duration,
    /// Peer's max_ack_delay transport parameter
    max_ack_delay: Duration,
    /// Number of samples taken
    sample_count: u64,
}

impl RttStats {
    /// Create an estimator that assumes `initial_rtt` until the first sample
    pub fn new(initial_rtt: Duration) -> Self {
        RttStats {
            latest_rtt: Duration::ZERO,
            smoothed_rtt: Duration::ZERO,
            rtt_variance: Duration::ZERO,
            min_rtt: Duration::ZERO,
            initial_rtt,
            max_ack_delay: DEFAULT_MAX_ACK_DELAY,
            sample_count: 0,
        }
    }

    /// Wrap the estimator for sharing across the connection
    pub fn into_shared(self) -> SharedRttStats {
        Arc::new(RwLock::new(self))
    }

    /// Add a sample for a packet sent at `send_time` and acknowledged at `ack_time`.
    ///
    /// `ack_delay` is the delay reported by the peer; it is only subtracted when
    /// the result stays at or above `min_rtt`. A send time after the ack time
    /// yields a zero sample. Returns the raw sample.
    pub fn update_rtt(&mut self, send_time: Instant, ack_time: Instant, ack_delay: Duration) -> Duration {
        let sample = ack_time.saturating_duration_since(send_time);

        if self.sample_count == 0 || sample < self.min_rtt {
            self.min_rtt = sample;
        }
        self.latest_rtt = sample;

        let adjusted = if sample >= self.min_rtt + ack_delay {
            sample - ack_delay
        } else {
            sample
        };

        if self.sample_count == 0 {
            self.smoothed_rtt = adjusted;
            self.rtt_variance = adjusted / 2;
        } else {
            let deviation = abs_diff(self.smoothed_rtt, adjusted);
            self.rtt_variance = (self.rtt_variance * 3 + deviation) / 4;
            self.smoothed_rtt = (self.smoothed_rtt * 7 + adjusted) / 8;
        }

        self.sample_count += 1;
        sample
    }

    /// Whether at least one sample was taken
    pub fn has_measurement(&self) -> bool {
        self.sample_count > 0
    }

    /// Number of samples taken
    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// Latest raw sample, zero before the first sample
    pub fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    /// Smoothed RTT, the initial RTT before the first sample
    pub fn smoothed_rtt(&self) -> Duration {
        if self.has_measurement() {
            self.smoothed_rtt
        } else {
            self.initial_rtt
        }
    }

    /// RTT variance, half the initial RTT before the first sample
    pub fn rtt_variance(&self) -> Duration {
        if self.has_measurement() {
            self.rtt_variance
        } else {
            self.initial_rtt / 2
        }
    }

    /// Minimum RTT, zero before the first sample
    pub fn min_rtt(&self) -> Duration {
        self.min_rtt
    }

    /// Peer's maximum ack delay
    pub fn max_ack_delay(&self) -> Duration {
        self.max_ack_delay
    }

    /// Set the peer's max_ack_delay transport parameter
    pub fn set_max_ack_delay(&mut self, max_ack_delay: Duration) {
        self.max_ack_delay = max_ack_delay;
    }

    /// Override the initial RTT. Ignored once a sample was taken.
    pub fn set_initial_rtt(&mut self, initial_rtt: Duration) {
        if self.has_measurement() {
            return;
        }
        self.initial_rtt = initial_rtt;
    }

    /// Probe timeout before backoff
    ///
    /// PTO = smoothed_rtt + max(4 * rttvar, granularity) [+ max_ack_delay]
    pub fn pto(&self, include_max_ack_delay: bool) -> Duration {
        let mut pto = self.smoothed_rtt() + (self.rtt_variance() * 4).max(TIMER_GRANULARITY);
        if include_max_ack_delay {
            pto += self.max_ack_delay;
        }
        pto
    }
}

impl Default for RttStats {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_RTT)
    }
}

fn abs_diff(a: Duration, b: Duration) -> Duration {
    if a > b {
        a - b
    } else {
        b - a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_defaults_before_sample() {
        let rtt = RttStats::default();
        assert!(!rtt.has_measurement());
        assert_eq!(rtt.smoothed_rtt(), ms(333));
        assert_eq!(rtt.rtt_variance(), Duration::from_micros(166_500));
        assert_eq!(rtt.pto(false), ms(333) + Duration::from_micros(666_000));
    }

    #[test]
    fn test_first_sample() {
        let start = Instant::now();
        let mut rtt = RttStats::default();

        let sample = rtt.update_rtt(start, start + ms(100), Duration::ZERO);

        assert_eq!(sample, ms(100));
        assert_eq!(rtt.latest_rtt(), ms(100));
        assert_eq!(rtt.smoothed_rtt(), ms(100));
        assert_eq!(rtt.rtt_variance(), ms(50));
        assert_eq!(rtt.min_rtt(), ms(100));
    }

    #[test]
    fn test_ewma() {
        let start = Instant::now();
        let mut rtt = RttStats::default();

        rtt.update_rtt(start, start + ms(100), Duration::ZERO);
        rtt.update_rtt(start, start + ms(200), Duration::ZERO);

        // rttvar = 3/4 * 50 + 1/4 * 100 = 62.5
        assert_eq!(rtt.rtt_variance(), Duration::from_micros(62_500));
        // srtt = 7/8 * 100 + 1/8 * 200 = 112.5
        assert_eq!(rtt.smoothed_rtt(), Duration::from_micros(112_500));
        assert_eq!(rtt.min_rtt(), ms(100));
    }

    #[test]
    fn test_ack_delay_subtracted() {
        let start = Instant::now();
        let mut rtt = RttStats::default();

        rtt.update_rtt(start, start + ms(50), Duration::ZERO);
        rtt.update_rtt(start, start + ms(100), ms(20));

        // adjusted sample is 80ms
        assert_eq!(rtt.latest_rtt(), ms(100));
        assert_eq!(rtt.smoothed_rtt(), (ms(50) * 7 + ms(80)) / 8);
    }

    #[test]
    fn test_ack_delay_not_below_min_rtt() {
        let start = Instant::now();
        let mut rtt = RttStats::default();

        rtt.update_rtt(start, start + ms(50), Duration::ZERO);
        // 60 - 20 would be below min_rtt, so the delay is ignored
        rtt.update_rtt(start, start + ms(60), ms(20));

        assert_eq!(rtt.smoothed_rtt(), (ms(50) * 7 + ms(60)) / 8);
    }

    #[test]
    fn test_negative_sample_clamped() {
        let start = Instant::now();
        let mut rtt = RttStats::default();

        let sample = rtt.update_rtt(start + ms(10), start, Duration::ZERO);

        assert_eq!(sample, Duration::ZERO);
        assert_eq!(rtt.min_rtt(), Duration::ZERO);
    }

    #[test]
    fn test_min_rtt_tracks_raw_samples() {
        let start = Instant::now();
        let mut rtt = RttStats::default();

        rtt.update_rtt(start, start + ms(80), Duration::ZERO);
        rtt.update_rtt(start, start + ms(40), Duration::ZERO);
        rtt.update_rtt(start, start + ms(90), ms(5));

        assert_eq!(rtt.min_rtt(), ms(40));
    }

    #[test]
    fn test_pto_with_max_ack_delay() {
        let start = Instant::now();
        let mut rtt = RttStats::default();
        rtt.set_max_ack_delay(ms(25));
        rtt.update_rtt(start, start + ms(100), Duration::ZERO);

        assert_eq!(rtt.pto(false), ms(100) + ms(200));
        assert_eq!(rtt.pto(true), ms(100) + ms(200) + ms(25));
    }

    #[test]
    fn test_initial_rtt_locked_after_sample() {
        let start = Instant::now();
        let mut rtt = RttStats::default();
        rtt.set_initial_rtt(ms(10));
        assert_eq!(rtt.smoothed_rtt(), ms(10));

        rtt.update_rtt(start, start + ms(30), Duration::ZERO);
        rtt.set_initial_rtt(ms(500));
        assert_eq!(rtt.smoothed_rtt(), ms(30));
    }
}
