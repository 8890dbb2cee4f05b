//! QUIC Loss Recovery and Flow Control
//!
//! This crate implements the reliability machinery of a QUIC connection:
//! sent packet tracking with loss detection and probe timeouts (RFC 9002),
//! received packet tracking and ACK generation, RTT estimation, ECN
//! validation, congestion control, and stream / connection flow control
//! (RFC 9000 §4).
//!
//! Nothing here owns a socket, a thread or a timer. Every operation takes the
//! current time, and deadlines are returned for the caller's event loop.

pub mod ack;
pub mod config;
pub mod congestion;
pub mod ecn;
pub mod error;
pub mod flow_control;
pub mod frame;
pub mod packet_number;
pub mod received_handler;
pub mod received_history;
pub mod rtt;
pub mod sent_handler;
pub mod sent_history;
pub mod tracer;

pub use ack::{AckFrame, AckRange, EcnCounts, GapEncodedRanges};
pub use config::{CongestionAlgorithm, FlowControlConfig, RecoveryConfig};
pub use congestion::{CongestionController, CongestionStats};
pub use ecn::{Ecn, EcnState};
pub use error::TransportError;
pub use flow_control::{
    ConnectionFlowControl, ConnectionFlowController, StreamFlowController, WindowAccounting, WindowUpdates,
};
pub use frame::{Frame, FrameHandler, SentFrame, StreamId};
pub use packet_number::{EncryptionLevel, PacketNumber, PacketNumberSpace, Perspective};
pub use received_handler::ReceivedPacketHandler;
pub use received_history::ReceivedPacketHistory;
pub use rtt::{RttStats, SharedRttStats};
pub use sent_handler::{AckOutcome, AckWatermark, LossTimer, RecoveryStats, SendMode, SentPacketHandler};
pub use sent_history::SentPacket;
pub use tracer::{LogTracer, LossReason, RecoveryTracer, TimerKind};

use std::sync::Arc;

/// Create the sent and received packet handlers of one connection.
///
/// The received packet handler reads the sent handler's ack-of-ack watermark
/// to prune its history; the two must belong to the same connection.
pub fn new_ack_handler(
    config: RecoveryConfig,
    rtt: SharedRttStats,
    perspective: Perspective,
    client_address_validated: bool,
    tracer: Option<Arc<dyn RecoveryTracer>>,
) -> (SentPacketHandler, ReceivedPacketHandler) {
    let received_config = config.clone();
    let sent = SentPacketHandler::new(config, rtt, perspective, client_address_validated, tracer);
    let received = ReceivedPacketHandler::new(&received_config, sent.ack_watermark());
    (sent, received)
}
