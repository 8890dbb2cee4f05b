//! Shared fixtures for the loss recovery and flow control integration tests

use parking_lot::Mutex;
use quic_recovery::ack::{AckFrame, AckRange};
use quic_recovery::config::{FlowControlConfig, RecoveryConfig};
use quic_recovery::frame::{Frame, FrameHandler, SentFrame};
use quic_recovery::packet_number::{EncryptionLevel, PacketNumber, Perspective};
use quic_recovery::received_handler::ReceivedPacketHandler;
use quic_recovery::rtt::{RttStats, SharedRttStats};
use quic_recovery::sent_handler::SentPacketHandler;
use quic_recovery::sent_history::SentPacket;
use quic_recovery::new_ack_handler;
use std::time::{Duration, Instant};

/// Size of every test packet
pub const SIZE: u64 = 1000;

pub fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

pub fn pn(v: u64) -> PacketNumber {
    PacketNumber::new(v)
}

pub fn pns(values: impl IntoIterator<Item = u64>) -> Vec<PacketNumber> {
    values.into_iter().map(PacketNumber::new).collect()
}

/// Deterministic packet numbers, no ECN and no pacing
pub fn recovery_config() -> RecoveryConfig {
    RecoveryConfig::default()
        .with_skip_packet_numbers(false)
        .with_ecn(false)
        .with_pacing(false)
}

/// Shared RTT estimator with a first sample of `rtt` already taken
pub fn rtt_with_sample(rtt: Duration) -> SharedRttStats {
    let mut stats = RttStats::default();
    let now = Instant::now();
    stats.update_rtt(now, now + rtt, Duration::ZERO);
    stats.into_shared()
}

/// Sent and received handlers of an endpoint whose handshake is confirmed
pub fn endpoint(config: RecoveryConfig, perspective: Perspective, now: Instant) -> (SentPacketHandler, ReceivedPacketHandler) {
    let rtt = RttStats::new(config.initial_rtt).into_shared();
    let (mut sent, mut received) = new_ack_handler(config, rtt, perspective, true, None);
    sent.set_handshake_confirmed(now);
    received.drop_packets(EncryptionLevel::Initial);
    received.drop_packets(EncryptionLevel::Handshake);
    (sent, received)
}

/// Sent packet handler of a server whose handshake is confirmed
pub fn confirmed_sender(now: Instant) -> SentPacketHandler {
    endpoint(recovery_config(), Perspective::Server, now).0
}

/// Send a 1-RTT packet carrying `frames`
pub fn send_frames(handler: &mut SentPacketHandler, at: Instant, frames: Vec<SentFrame>) -> PacketNumber {
    let pn = handler
        .pop_packet_number(EncryptionLevel::OneRtt)
        .expect("application data space is never dropped");
    let packet = SentPacket::new(pn, EncryptionLevel::OneRtt, at, SIZE).with_frames(frames);
    handler.on_packet_sent(packet).expect("packet numbers increase");
    pn
}

/// Send a 1-RTT packet carrying a PING
pub fn send_ping(handler: &mut SentPacketHandler, at: Instant) -> PacketNumber {
    send_frames(handler, at, vec![Frame::Ping.into()])
}

/// ACK frame from `(smallest, largest)` pairs in descending order
pub fn ack(ranges: &[(u64, u64)]) -> AckFrame {
    AckFrame::new(
        ranges
            .iter()
            .map(|&(smallest, largest)| AckRange::new(smallest, largest))
            .collect(),
        Duration::ZERO,
    )
}

/// Small windows so tests hit the limits quickly
pub fn flow_control_config(stream_window: u64, connection_window: u64) -> FlowControlConfig {
    FlowControlConfig::default()
        .with_stream_window(stream_window, stream_window * 16)
        .with_connection_window(connection_window, connection_window * 16)
}

/// Frame handler remembering every notification
#[derive(Debug, Default)]
pub struct Recorder {
    pub acked: Mutex<Vec<Frame>>,
    pub lost: Mutex<Vec<Frame>>,
}

impl FrameHandler for Recorder {
    fn on_acked(&self, frame: &Frame) {
        self.acked.lock().push(frame.clone());
    }

    fn on_lost(&self, frame: &Frame) {
        self.lost.lock().push(frame.clone());
    }
}
