//! Congestion control
//!
//! Loss recovery drives congestion control through the [`CongestionController`]
//! trait and never looks at how the window is computed. Two window growth
//! strategies are provided on top of a shared slow start / recovery core
//! ([`ClassicController`]): [`NewReno`] and [`Cubic`].

mod classic;
mod cubic;
mod new_reno;
mod pacer;

pub use classic::{ClassicController, WindowAdjustment};
pub use cubic::Cubic;
pub use new_reno::NewReno;
pub use pacer::Pacer;

use crate::config::{CongestionAlgorithm, RecoveryConfig};
use crate::packet_number::PacketNumber;
use crate::rtt::SharedRttStats;
use std::time::{Duration, Instant};

/// Packets in the initial congestion window
pub const INITIAL_WINDOW_PACKETS: u64 = 10;

/// Packets in the minimum congestion window
pub const MIN_WINDOW_PACKETS: u64 = 2;

/// Multiple of the PTO after which a run of losses is persistent congestion
pub const PERSISTENT_CONGESTION_THRESHOLD: u32 = 3;

/// Initial congestion window (RFC 9002 §7.2)
pub fn initial_window(max_datagram_size: u64) -> u64 {
    (INITIAL_WINDOW_PACKETS * max_datagram_size).min((2 * max_datagram_size).max(14_720))
}

/// Minimum congestion window (RFC 9002 §7.2)
pub fn minimum_window(max_datagram_size: u64) -> u64 {
    MIN_WINDOW_PACKETS * max_datagram_size
}

/// A newly acknowledged in-flight packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckedPacket {
    pub pn: PacketNumber,
    pub bytes: u64,
    pub sent_time: Instant,
}

/// An in-flight packet declared lost
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LostPacket {
    pub pn: PacketNumber,
    pub bytes: u64,
    pub sent_time: Instant,
}

/// Congestion state snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CongestionStats {
    pub congestion_window: u64,
    pub bytes_in_flight: u64,
    pub slow_start_threshold: u64,
    pub in_slow_start: bool,
    pub in_recovery: bool,
}

/// Interface between loss recovery and a congestion control algorithm
pub trait CongestionController: Send {
    /// A packet was sent. Only `in_flight` packets count against the window.
    fn on_packet_sent(&mut self, sent_time: Instant, pn: PacketNumber, bytes: u64, in_flight: bool);

    /// In-flight packets were newly acknowledged.
    fn on_packets_acked(&mut self, acked: &[AckedPacket], rtt_sample: Option<Duration>, now: Instant);

    /// In-flight packets were declared lost.
    fn on_packets_lost(&mut self, lost: &[LostPacket], now: Instant);

    /// The lost packets span more than the persistent congestion period.
    fn on_persistent_congestion(&mut self, now: Instant);

    /// The peer reported new CE marks for a packet sent at `sent_time`.
    fn on_ecn_congestion(&mut self, sent_time: Instant, now: Instant);

    /// A probe timeout fired.
    fn on_pto_expired(&mut self, _now: Instant) {}

    /// In-flight bytes were released without being acknowledged or lost.
    fn on_packets_discarded(&mut self, bytes: u64);

    /// When the next packet may be sent; `None` while the window is full.
    fn time_until_send(&self, now: Instant) -> Option<Instant>;

    /// Whether the pacer allows a full-size packet at `now`
    fn has_pacing_budget(&self, now: Instant) -> bool;

    fn congestion_window_remaining(&self) -> u64 {
        self.congestion_window().saturating_sub(self.bytes_in_flight())
    }

    fn congestion_window(&self) -> u64;

    fn bytes_in_flight(&self) -> u64;

    fn in_slow_start(&self) -> bool;

    fn in_recovery(&self) -> bool;

    fn set_max_datagram_size(&mut self, size: u64);

    fn stats(&self) -> CongestionStats;
}

/// Build the controller selected by `config`
pub fn new_controller(config: &RecoveryConfig, rtt: SharedRttStats) -> Box<dyn CongestionController> {
    match config.congestion {
        CongestionAlgorithm::NewReno => Box::new(ClassicController::new(
            NewReno::default(),
            config.max_datagram_size,
            config.pacing,
            rtt,
        )),
        CongestionAlgorithm::Cubic => Box::new(ClassicController::new(
            Cubic::default(),
            config.max_datagram_size,
            config.pacing,
            rtt,
        )),
    }
}
