//! Observability hooks for loss recovery
//!
//! A [`RecoveryTracer`] is a passive side channel: every method has an empty
//! default and nothing it does influences recovery. [`LogTracer`] forwards the
//! hooks to `tracing` events.

use crate::ecn::{EcnState, EcnStateTrigger};
use crate::packet_number::{EncryptionLevel, PacketNumber, PacketNumberSpace};
use crate::rtt::RttStats;
use std::time::Instant;

/// Why a packet was declared lost
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossReason {
    /// Trailed the largest acknowledged packet by more than the packet threshold
    ReorderingThreshold,
    /// Sent longer ago than the time threshold
    TimeThreshold,
    /// Declared lost to make room for a probe packet
    Probe,
}

/// Which timer the loss detection alarm is armed for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Time-threshold loss detection
    LossDetection,
    /// Probe timeout
    Pto,
}

/// Receiver of recovery events
#[allow(unused_variables)]
pub trait RecoveryTracer: Send + Sync {
    fn on_packet_sent(&self, level: EncryptionLevel, pn: PacketNumber, size: u64, ack_eliciting: bool) {}

    fn on_packet_acked(&self, space: PacketNumberSpace, pn: PacketNumber) {}

    fn on_packet_lost(&self, space: PacketNumberSpace, pn: PacketNumber, reason: LossReason) {}

    fn on_spurious_loss(&self, space: PacketNumberSpace, pn: PacketNumber) {}

    fn on_rtt_updated(&self, rtt: &RttStats) {}

    fn on_metrics_updated(&self, congestion_window: u64, bytes_in_flight: u64) {}

    fn on_ecn_state_changed(&self, state: EcnState, trigger: EcnStateTrigger) {}

    fn on_pto_count_updated(&self, pto_count: u32) {}

    fn on_loss_timer_set(&self, kind: TimerKind, space: PacketNumberSpace, deadline: Instant) {}

    fn on_loss_timer_expired(&self, kind: TimerKind, space: PacketNumberSpace) {}

    fn on_loss_timer_canceled(&self) {}

    fn on_space_dropped(&self, space: PacketNumberSpace) {}
}

/// Tracer that emits `tracing` events
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTracer;

impl RecoveryTracer for LogTracer {
    fn on_packet_sent(&self, level: EncryptionLevel, pn: PacketNumber, size: u64, ack_eliciting: bool) {
        tracing::trace!(%level, %pn, size, ack_eliciting, "packet sent");
    }

    fn on_packet_acked(&self, space: PacketNumberSpace, pn: PacketNumber) {
        tracing::trace!(?space, %pn, "packet acked");
    }

    fn on_packet_lost(&self, space: PacketNumberSpace, pn: PacketNumber, reason: LossReason) {
        tracing::debug!(?space, %pn, ?reason, "packet lost");
    }

    fn on_spurious_loss(&self, space: PacketNumberSpace, pn: PacketNumber) {
        tracing::debug!(?space, %pn, "spurious loss detected");
    }

    fn on_rtt_updated(&self, rtt: &RttStats) {
        tracing::trace!(
            latest = ?rtt.latest_rtt(),
            smoothed = ?rtt.smoothed_rtt(),
            variance = ?rtt.rtt_variance(),
            min = ?rtt.min_rtt(),
            "rtt updated"
        );
    }

    fn on_metrics_updated(&self, congestion_window: u64, bytes_in_flight: u64) {
        tracing::trace!(congestion_window, bytes_in_flight, "metrics updated");
    }

    fn on_ecn_state_changed(&self, state: EcnState, trigger: EcnStateTrigger) {
        tracing::debug!(?state, ?trigger, "ecn state changed");
    }

    fn on_pto_count_updated(&self, pto_count: u32) {
        tracing::debug!(pto_count, "pto count updated");
    }

    fn on_loss_timer_set(&self, kind: TimerKind, space: PacketNumberSpace, deadline: Instant) {
        tracing::trace!(?kind, ?space, ?deadline, "loss timer set");
    }

    fn on_loss_timer_expired(&self, kind: TimerKind, space: PacketNumberSpace) {
        tracing::debug!(?kind, ?space, "loss timer expired");
    }

    fn on_loss_timer_canceled(&self) {
        tracing::trace!("loss timer canceled");
    }

    fn on_space_dropped(&self, space: PacketNumberSpace) {
        tracing::debug!(?space, "packet number space dropped");
    }
}
