//! Received packet handling: duplicate detection and ACK generation
//!
//! One tracker exists per packet number space. Initial and Handshake packets
//! are acknowledged immediately. In the application-data space ACKs are
//! delayed by up to `max_ack_delay` unless RFC 9000 §13.2 asks for an
//! immediate one.

use crate::ack::{AckFrame, EcnCounts};
use crate::config::RecoveryConfig;
use crate::ecn::Ecn;
use crate::error::TransportError;
use crate::packet_number::{EncryptionLevel, PacketNumber, PacketNumberSpace};
use crate::received_history::ReceivedPacketHistory;
use crate::sent_handler::AckWatermark;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

#[derive(Debug)]
struct ReceivedPacketTracker {
    history: ReceivedPacketHistory,
    /// Whether ACKs may be delayed
    delay_acks: bool,
    largest_observed: Option<PacketNumber>,
    largest_observed_time: Option<Instant>,
    ecn_counts: EcnCounts,
    /// An ack-eliciting packet arrived since the last ACK
    has_new_ack: bool,
    ack_queued: bool,
    ack_eliciting_since_last_ack: u32,
    ack_alarm: Option<Instant>,
    last_ack: Option<AckFrame>,
    ack_eliciting_threshold: u32,
    max_ack_delay: Duration,
}

impl ReceivedPacketTracker {
    fn new(config: &RecoveryConfig, delay_acks: bool) -> Self {
        ReceivedPacketTracker {
            history: ReceivedPacketHistory::new(config.max_ack_ranges),
            delay_acks,
            largest_observed: None,
            largest_observed_time: None,
            ecn_counts: EcnCounts::default(),
            has_new_ack: false,
            ack_queued: false,
            ack_eliciting_since_last_ack: 0,
            ack_alarm: None,
            last_ack: None,
            ack_eliciting_threshold: config.ack_eliciting_threshold,
            max_ack_delay: config.max_ack_delay,
        }
    }

    fn received_packet(&mut self, pn: PacketNumber, ecn: Ecn, rcv_time: Instant, ack_eliciting: bool) -> bool {
        let was_missing = self.is_missing(pn);
        if !self.history.received_packet(pn) {
            return false;
        }

        if self.largest_observed.map_or(true, |largest| pn > largest) {
            self.largest_observed = Some(pn);
            self.largest_observed_time = Some(rcv_time);
        }
        match ecn {
            Ecn::NotEct => {}
            Ecn::Ect0 => self.ecn_counts.ect0 += 1,
            Ecn::Ect1 => self.ecn_counts.ect1 += 1,
            Ecn::Ce => self.ecn_counts.ce += 1,
        }

        if !ack_eliciting {
            return true;
        }
        self.has_new_ack = true;
        self.ack_eliciting_since_last_ack += 1;

        if !self.delay_acks {
            self.ack_queued = true;
            return true;
        }
        if !self.ack_queued && self.should_queue_ack(pn, ecn, was_missing) {
            self.ack_queued = true;
            self.ack_alarm = None;
        }
        if !self.ack_queued {
            let deadline = rcv_time + self.max_ack_delay;
            self.ack_alarm = Some(self.ack_alarm.map_or(deadline, |alarm| alarm.min(deadline)));
        }
        true
    }

    fn should_queue_ack(&self, pn: PacketNumber, ecn: Ecn, was_missing: bool) -> bool {
        // the first ack-eliciting packet is acknowledged right away
        if self.last_ack.is_none() {
            trace!(%pn, "queueing ACK for the first ack-eliciting packet");
            return true;
        }
        if was_missing {
            trace!(%pn, "queueing ACK for a packet reported missing");
            return true;
        }
        if self.ack_eliciting_since_last_ack >= self.ack_eliciting_threshold {
            trace!(%pn, count = self.ack_eliciting_since_last_ack, "queueing ACK after ack-eliciting threshold");
            return true;
        }
        if self.has_new_missing_packets() {
            trace!(%pn, "queueing ACK for newly missing packets");
            return true;
        }
        if ecn == Ecn::Ce {
            trace!(%pn, "queueing ACK for a CE marked packet");
            return true;
        }
        false
    }

    /// Below the largest acknowledged in the last ACK but not covered by it
    fn is_missing(&self, pn: PacketNumber) -> bool {
        self.last_ack.as_ref().map_or(false, |ack| {
            ack.largest_acked().map_or(false, |largest| pn < largest) && !ack.acks_packet(pn)
        })
    }

    /// The highest range is a single packet separated from what the last ACK reported
    fn has_new_missing_packets(&self) -> bool {
        let Some(last_largest) = self.last_ack.as_ref().and_then(AckFrame::largest_acked) else {
            return false;
        };
        self.history.highest_range().map_or(false, |highest| {
            highest.smallest.as_u64() > last_largest.as_u64() + 1 && highest.len() == 1
        })
    }

    fn ack_frame(&mut self, now: Instant, only_if_queued: bool) -> Option<AckFrame> {
        if only_if_queued && !self.ack_queued {
            match self.ack_alarm {
                Some(alarm) if alarm <= now => {}
                _ => return None,
            }
        }
        if !self.has_new_ack || self.history.is_empty() {
            return None;
        }

        let ack_delay = self
            .largest_observed_time
            .map_or(Duration::ZERO, |t| now.saturating_duration_since(t));
        let mut ack = AckFrame::new(self.history.ack_ranges(), ack_delay);
        let counts = self.ecn_counts;
        if counts.ect0 > 0 || counts.ect1 > 0 || counts.ce > 0 {
            ack = ack.with_ecn(counts);
        }

        self.has_new_ack = false;
        self.ack_queued = false;
        self.ack_alarm = None;
        self.ack_eliciting_since_last_ack = 0;
        self.last_ack = Some(ack.clone());
        Some(ack)
    }
}

/// Tracks received packets of all spaces and decides when to send ACKs
#[derive(Debug)]
pub struct ReceivedPacketHandler {
    initial: Option<ReceivedPacketTracker>,
    handshake: Option<ReceivedPacketTracker>,
    app_data: ReceivedPacketTracker,
    lowest_1rtt_packet: Option<PacketNumber>,
    ack_watermark: AckWatermark,
}

impl ReceivedPacketHandler {
    /// `ack_watermark` is shared with the sent-packet handler, which raises it as
    /// the peer acknowledges our ACKs.
    pub fn new(config: &RecoveryConfig, ack_watermark: AckWatermark) -> Self {
        ReceivedPacketHandler {
            initial: Some(ReceivedPacketTracker::new(config, false)),
            handshake: Some(ReceivedPacketTracker::new(config, false)),
            app_data: ReceivedPacketTracker::new(config, true),
            lowest_1rtt_packet: None,
            ack_watermark,
        }
    }

    fn tracker(&self, space: PacketNumberSpace) -> Option<&ReceivedPacketTracker> {
        match space {
            PacketNumberSpace::Initial => self.initial.as_ref(),
            PacketNumberSpace::Handshake => self.handshake.as_ref(),
            PacketNumberSpace::ApplicationData => Some(&self.app_data),
        }
    }

    fn tracker_mut(&mut self, space: PacketNumberSpace) -> Option<&mut ReceivedPacketTracker> {
        match space {
            PacketNumberSpace::Initial => self.initial.as_mut(),
            PacketNumberSpace::Handshake => self.handshake.as_mut(),
            PacketNumberSpace::ApplicationData => Some(&mut self.app_data),
        }
    }

    /// Record a received packet.
    ///
    /// Returns `Ok(false)` for duplicates, which are otherwise ignored.
    pub fn received_packet(
        &mut self,
        pn: PacketNumber,
        ecn: Ecn,
        level: EncryptionLevel,
        rcv_time: Instant,
        ack_eliciting: bool,
    ) -> Result<bool, TransportError> {
        match level {
            EncryptionLevel::ZeroRtt => {
                if let Some(lowest) = self.lowest_1rtt_packet {
                    if pn > lowest {
                        return Err(TransportError::ProtocolViolation(format!(
                            "received packet number {pn} on a 0-RTT packet after receiving {lowest} on a 1-RTT packet"
                        )));
                    }
                }
            }
            EncryptionLevel::OneRtt => {
                self.lowest_1rtt_packet = Some(self.lowest_1rtt_packet.map_or(pn, |lowest| lowest.min(pn)));
            }
            EncryptionLevel::Initial | EncryptionLevel::Handshake => {}
        }

        self.prune_acknowledged();
        let Some(tracker) = self.tracker_mut(level.space()) else {
            return Err(TransportError::Internal(format!(
                "received packet {pn} at {level} after its keys were dropped"
            )));
        };
        let is_new = tracker.received_packet(pn, ecn, rcv_time, ack_eliciting);
        if !is_new {
            trace!(%pn, %level, "duplicate packet");
        }
        Ok(is_new)
    }

    /// ACK frame to send at `level`, if one is owed.
    ///
    /// With `only_if_queued` an ACK is only returned if it must be sent now;
    /// otherwise any new acknowledgment information is returned, for bundling
    /// with other frames.
    pub fn ack_frame(&mut self, level: EncryptionLevel, now: Instant, only_if_queued: bool) -> Option<AckFrame> {
        let space = level.space();
        if space == PacketNumberSpace::ApplicationData {
            self.prune_acknowledged();
        }
        let ack = self.tracker_mut(space)?.ack_frame(now, only_if_queued)?;
        trace!(
            %level,
            largest = ?ack.largest_acked(),
            ranges = ack.ranges.len(),
            delay = ?ack.ack_delay,
            "generated ACK"
        );
        Some(ack)
    }

    /// Deadline of the delayed ACK alarm
    pub fn ack_alarm(&self) -> Option<Instant> {
        [&self.initial, &self.handshake]
            .into_iter()
            .flatten()
            .chain(std::iter::once(&self.app_data))
            .filter_map(|tracker| tracker.ack_alarm)
            .min()
    }

    /// Discard the receive state of a space whose keys were dropped
    pub fn drop_packets(&mut self, level: EncryptionLevel) {
        match level {
            EncryptionLevel::Initial => self.initial = None,
            EncryptionLevel::Handshake => self.handshake = None,
            // 0-RTT and 1-RTT share the application-data space
            EncryptionLevel::ZeroRtt => return,
            EncryptionLevel::OneRtt => {
                debug!("1-RTT receive state is never dropped");
                return;
            }
        }
        debug!(%level, "dropped receive state");
    }

    /// Whether `pn` was received before or is too old to be tracked
    pub fn is_potentially_duplicate(&self, pn: PacketNumber, level: EncryptionLevel) -> bool {
        self.tracker(level.space())
            .map_or(false, |tracker| tracker.history.is_potentially_duplicate(pn))
    }

    /// Apply the peer's ACK_FREQUENCY request
    pub fn update_ack_frequency(&mut self, ack_eliciting_threshold: u32, max_ack_delay: Duration) {
        self.app_data.ack_eliciting_threshold = ack_eliciting_threshold.max(1);
        self.app_data.max_ack_delay = max_ack_delay;
        debug!(threshold = ack_eliciting_threshold, ?max_ack_delay, "updated ack frequency");
    }

    pub fn largest_observed(&self, level: EncryptionLevel) -> Option<PacketNumber> {
        self.tracker(level.space()).and_then(|tracker| tracker.largest_observed)
    }

    /// ECN codepoints counted in a space
    pub fn ecn_counts(&self, level: EncryptionLevel) -> Option<EcnCounts> {
        self.tracker(level.space()).map(|tracker| tracker.ecn_counts)
    }

    /// Forget application-data packets whose acknowledgment the peer confirmed
    fn prune_acknowledged(&mut self) {
        let watermark = self.ack_watermark.get();
        if watermark > self.app_data.history.deleted_below() {
            trace!(below = %watermark, "pruning received history");
            self.app_data.history.delete_below(watermark);
        }
    }
}
