//! Tunables for loss recovery, acknowledgment and flow control
//!
//! Defaults follow the values recommended by RFC 9002 and RFC 9000. All of
//! them are policy knobs rather than protocol invariants and can be overridden,
//! which tests use to pin down timing.

use crate::rtt::{DEFAULT_INITIAL_RTT, DEFAULT_MAX_ACK_DELAY, TIMER_GRANULARITY};
use std::time::Duration;

/// Reordering threshold in packets (kPacketThreshold)
pub const DEFAULT_PACKET_THRESHOLD: u64 = 3;

/// Time threshold as a multiple of the RTT (kTimeThreshold)
pub const DEFAULT_TIME_THRESHOLD: f64 = 9.0 / 8.0;

/// Ack-eliciting packets received before an ACK is sent immediately
pub const DEFAULT_ACK_ELICITING_THRESHOLD: u32 = 2;

/// Maximum number of ACK ranges kept in the receive history
pub const DEFAULT_MAX_ACK_RANGES: usize = 32;

/// Anti-amplification limit before address validation
pub const DEFAULT_AMPLIFICATION_FACTOR: u64 = 3;

/// Smallest maximum datagram size a QUIC path must support
pub const DEFAULT_MAX_DATAGRAM_SIZE: u64 = 1200;

/// Upper bound for packets in flight counted by the congestion window
pub const MAX_CONGESTION_WINDOW_PACKETS: usize = 10_000;

/// Outstanding packets beyond which only ACKs may be sent
pub const MAX_OUTSTANDING_SENT_PACKETS: usize = 2 * MAX_CONGESTION_WINDOW_PACKETS;

/// Tracked packets beyond which nothing may be sent
pub const MAX_TRACKED_SENT_PACKETS: usize = MAX_OUTSTANDING_SENT_PACKETS * 5 / 4;

/// Pluggable congestion control algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CongestionAlgorithm {
    /// RFC 9002 §7 NewReno
    #[default]
    NewReno,
    /// RFC 9438 CUBIC
    Cubic,
}

/// Loss recovery and acknowledgment configuration
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Packets a packet may trail the largest acknowledged before it is lost
    pub packet_threshold: u64,
    /// Multiple of max(latest RTT, smoothed RTT) after which a packet is lost
    pub time_threshold: f64,
    /// Minimum timer resolution
    pub timer_granularity: Duration,
    /// RTT assumed before the first sample
    pub initial_rtt: Duration,
    /// Longest the local endpoint delays acknowledging an ack-eliciting packet
    pub max_ack_delay: Duration,
    /// Ack-eliciting packets received before an immediate ACK
    pub ack_eliciting_threshold: u32,
    /// Maximum ranges kept in the receive history
    pub max_ack_ranges: usize,
    /// Anti-amplification factor before address validation
    pub amplification_factor: u64,
    /// Maximum datagram size, for congestion window arithmetic
    pub max_datagram_size: u64,
    /// Whether to attempt ECN on the path
    pub enable_ecn: bool,
    /// Whether to skip application-data packet numbers
    pub skip_packet_numbers: bool,
    /// Congestion control algorithm
    pub congestion: CongestionAlgorithm,
    /// Whether the congestion controller paces packets
    pub pacing: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            packet_threshold: DEFAULT_PACKET_THRESHOLD,
            time_threshold: DEFAULT_TIME_THRESHOLD,
            timer_granularity: TIMER_GRANULARITY,
            initial_rtt: DEFAULT_INITIAL_RTT,
            max_ack_delay: DEFAULT_MAX_ACK_DELAY,
            ack_eliciting_threshold: DEFAULT_ACK_ELICITING_THRESHOLD,
            max_ack_ranges: DEFAULT_MAX_ACK_RANGES,
            amplification_factor: DEFAULT_AMPLIFICATION_FACTOR,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            enable_ecn: true,
            skip_packet_numbers: true,
            congestion: CongestionAlgorithm::NewReno,
            pacing: true,
        }
    }
}

impl RecoveryConfig {
    pub fn with_packet_threshold(mut self, threshold: u64) -> Self {
        self.packet_threshold = threshold;
        self
    }

    pub fn with_time_threshold(mut self, threshold: f64) -> Self {
        self.time_threshold = threshold;
        self
    }

    pub fn with_initial_rtt(mut self, rtt: Duration) -> Self {
        self.initial_rtt = rtt;
        self
    }

    pub fn with_max_ack_delay(mut self, delay: Duration) -> Self {
        self.max_ack_delay = delay;
        self
    }

    pub fn with_ack_eliciting_threshold(mut self, threshold: u32) -> Self {
        self.ack_eliciting_threshold = threshold.max(1);
        self
    }

    pub fn with_max_ack_ranges(mut self, ranges: usize) -> Self {
        self.max_ack_ranges = ranges.max(1);
        self
    }

    pub fn with_ecn(mut self, enable: bool) -> Self {
        self.enable_ecn = enable;
        self
    }

    pub fn with_skip_packet_numbers(mut self, skip: bool) -> Self {
        self.skip_packet_numbers = skip;
        self
    }

    pub fn with_congestion(mut self, algorithm: CongestionAlgorithm) -> Self {
        self.congestion = algorithm;
        self
    }

    pub fn with_pacing(mut self, pacing: bool) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_max_datagram_size(mut self, size: u64) -> Self {
        self.max_datagram_size = size;
        self
    }
}

/// Flow control windows and auto-tuning parameters
#[derive(Debug, Clone)]
pub struct FlowControlConfig {
    /// Initial stream receive window
    pub initial_stream_receive_window: u64,
    /// Ceiling for auto-tuned stream receive windows
    pub max_stream_receive_window: u64,
    /// Initial connection receive window
    pub initial_connection_receive_window: u64,
    /// Ceiling for the auto-tuned connection receive window
    pub max_connection_receive_window: u64,
    /// Connection window kept at least this multiple of any stream window
    pub connection_window_multiplier: f64,
    /// Fraction of the window consumed before a window update is due
    pub window_update_threshold: f64,
    /// A window consumed within this many smoothed RTTs is grown
    pub auto_tune_rtt_multiplier: f64,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        FlowControlConfig {
            initial_stream_receive_window: 512 * 1024,
            max_stream_receive_window: 6 * 1024 * 1024,
            initial_connection_receive_window: 768 * 1024,
            max_connection_receive_window: 15 * 1024 * 1024,
            connection_window_multiplier: 1.5,
            window_update_threshold: 0.5,
            auto_tune_rtt_multiplier: 4.0,
        }
    }
}

impl FlowControlConfig {
    pub fn with_stream_window(mut self, initial: u64, max: u64) -> Self {
        self.initial_stream_receive_window = initial;
        self.max_stream_receive_window = max.max(initial);
        self
    }

    pub fn with_connection_window(mut self, initial: u64, max: u64) -> Self {
        self.initial_connection_receive_window = initial;
        self.max_connection_receive_window = max.max(initial);
        self
    }

    pub fn with_connection_window_multiplier(mut self, multiplier: f64) -> Self {
        self.connection_window_multiplier = multiplier;
        self
    }

    pub fn with_window_update_threshold(mut self, threshold: f64) -> Self {
        self.window_update_threshold = threshold.clamp(0.0, 1.0);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_defaults() {
        let config = RecoveryConfig::default();
        assert_eq!(config.packet_threshold, 3);
        assert_eq!(config.time_threshold, 1.125);
        assert_eq!(config.max_ack_delay, Duration::from_millis(25));
        assert_eq!(config.initial_rtt, Duration::from_millis(333));
        assert_eq!(config.congestion, CongestionAlgorithm::NewReno);
    }

    #[test]
    fn test_flow_control_defaults() {
        let config = FlowControlConfig::default();
        assert!(config.connection_window_multiplier > 1.0);
        assert!(config.initial_connection_receive_window > config.initial_stream_receive_window);
        assert_eq!(config.window_update_threshold, 0.5);
    }

    #[test]
    fn test_builders_clamp() {
        let config = RecoveryConfig::default()
            .with_ack_eliciting_threshold(0)
            .with_max_ack_ranges(0);
        assert_eq!(config.ack_eliciting_threshold, 1);
        assert_eq!(config.max_ack_ranges, 1);

        let fc = FlowControlConfig::default()
            .with_stream_window(100, 50)
            .with_window_update_threshold(3.0);
        assert_eq!(fc.max_stream_receive_window, 100);
        assert_eq!(fc.window_update_threshold, 1.0);
    }
}
