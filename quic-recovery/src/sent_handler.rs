//! Sent packet handling: loss detection and probe timeouts (RFC 9002 §6)
//!
//! The [`SentPacketHandler`] owns the sent packet records of all three packet
//! number spaces, the RTT estimator writes and the congestion controller.
//! It is driven entirely by the connection: packets are reported as they are
//! sent, ACK frames as they arrive, and [`SentPacketHandler::loss_detection_timeout`]
//! tells the owner when to call [`SentPacketHandler::on_loss_detection_timeout`].

use crate::ack::AckFrame;
use crate::config::{RecoveryConfig, MAX_OUTSTANDING_SENT_PACKETS, MAX_TRACKED_SENT_PACKETS};
use crate::congestion::{
    new_controller, AckedPacket, CongestionController, LostPacket, PERSISTENT_CONGESTION_THRESHOLD,
};
use crate::ecn::{Ecn, EcnState, EcnTracker};
use crate::error::TransportError;
use crate::packet_number::{
    EncryptionLevel, PacketNumber, PacketNumberGenerator, PacketNumberSpace, Perspective,
    SKIP_PACKET_INITIAL_PERIOD, SKIP_PACKET_MAX_PERIOD,
};
use crate::rtt::SharedRttStats;
use crate::sent_history::{HistoryEntry, SentPacket, SentPacketHistory};
use crate::tracer::{LossReason, RecoveryTracer, TimerKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Smallest RTT sample taken from the Initial packet acknowledged by a Retry
const MIN_RTT_AFTER_RETRY: Duration = Duration::from_millis(5);

/// What the connection may send next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendMode {
    /// Nothing, not even ACKs
    None,
    /// ACK-only packets
    Ack,
    /// Congestion window allows sending, the pacer does not
    PacingLimited,
    /// Any packet
    #[default]
    Any,
    /// Probe packets in the Initial space
    PtoInitial,
    /// Probe packets in the Handshake space
    PtoHandshake,
    /// Probe packets in the application-data space
    PtoAppData,
}

impl SendMode {
    pub fn is_probe(self) -> bool {
        matches!(self, SendMode::PtoInitial | SendMode::PtoHandshake | SendMode::PtoAppData)
    }
}

/// Armed loss detection alarm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossTimer {
    pub deadline: Instant,
    pub kind: TimerKind,
    pub space: PacketNumberSpace,
}

/// Result of processing an ACK frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckOutcome {
    /// Newly acknowledged packets, ascending
    pub acked: Vec<PacketNumber>,
    /// Packets declared lost while processing the ACK
    pub lost: Vec<PacketNumber>,
    /// Packets previously declared lost that the ACK covers
    pub spuriously_lost: Vec<PacketNumber>,
    /// RTT sample taken from the ACK, if any
    pub rtt_sample: Option<Duration>,
    /// At least one newly acknowledged packet was sent at 1-RTT
    pub acked_1rtt: bool,
    /// The ACK's ECN counts signalled congestion
    pub ecn_congestion: bool,
}

/// Loss recovery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub packets_sent: u64,
    pub packets_acked: u64,
    pub packets_lost: u64,
    pub spurious_losses: u64,
    pub pto_count: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub bytes_lost: u64,
}

/// Lowest 1-RTT packet number whose acknowledgment the peer has not yet confirmed
///
/// Raised by the sent-packet handler whenever a packet carrying an ACK frame is
/// itself acknowledged; the received-packet handler prunes its history below it.
#[derive(Debug, Clone, Default)]
pub struct AckWatermark(Arc<AtomicU64>);

impl AckWatermark {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> PacketNumber {
        PacketNumber::new(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn raise(&self, pn: PacketNumber) {
        self.0.fetch_max(pn.as_u64(), Ordering::AcqRel);
    }
}

#[derive(Debug)]
struct SpaceState {
    history: SentPacketHistory,
    pns: PacketNumberGenerator,
    largest_acked: Option<PacketNumber>,
    loss_time: Option<Instant>,
    last_ack_eliciting_sent: Option<Instant>,
}

impl SpaceState {
    fn new(initial: PacketNumber, skip: bool) -> Self {
        let pns = if skip {
            PacketNumberGenerator::skipping(initial, SKIP_PACKET_INITIAL_PERIOD, SKIP_PACKET_MAX_PERIOD)
        } else {
            PacketNumberGenerator::sequential(initial)
        };
        SpaceState {
            history: SentPacketHistory::new(),
            pns,
            largest_acked: None,
            loss_time: None,
            last_ack_eliciting_sent: None,
        }
    }

    fn pop_packet_number(&mut self) -> PacketNumber {
        let (skipped, pn) = self.pns.pop();
        if skipped {
            self.history.skipped_packet(pn - 1);
        }
        pn
    }
}

#[derive(Debug)]
struct Spaces {
    initial: Option<SpaceState>,
    handshake: Option<SpaceState>,
    app_data: SpaceState,
}

impl Spaces {
    fn get(&self, space: PacketNumberSpace) -> Option<&SpaceState> {
        match space {
            PacketNumberSpace::Initial => self.initial.as_ref(),
            PacketNumberSpace::Handshake => self.handshake.as_ref(),
            PacketNumberSpace::ApplicationData => Some(&self.app_data),
        }
    }

    fn get_mut(&mut self, space: PacketNumberSpace) -> Option<&mut SpaceState> {
        match space {
            PacketNumberSpace::Initial => self.initial.as_mut(),
            PacketNumberSpace::Handshake => self.handshake.as_mut(),
            PacketNumberSpace::ApplicationData => Some(&mut self.app_data),
        }
    }

    fn iter(&self) -> impl Iterator<Item = (PacketNumberSpace, &SpaceState)> {
        PacketNumberSpace::ALL
            .into_iter()
            .filter_map(move |space| self.get(space).map(|state| (space, state)))
    }
}

/// Loss detection and congestion control for the packets a connection sends
pub struct SentPacketHandler {
    config: RecoveryConfig,
    perspective: Perspective,
    spaces: Spaces,
    rtt: SharedRttStats,
    congestion: Box<dyn CongestionController>,
    ecn: Option<EcnTracker>,
    tracer: Option<Arc<dyn RecoveryTracer>>,

    /// Bytes of ack-eliciting packets neither acknowledged nor declared lost
    bytes_in_flight: u64,
    /// Totals for the anti-amplification limit
    bytes_sent: u64,
    bytes_received: u64,

    pto_count: u32,
    num_probes_to_send: u32,
    pto_mode: SendMode,

    handshake_confirmed: bool,
    /// The peer has validated our address: always true for a server
    peer_completed_address_validation: bool,
    /// We have validated the peer's address: always true for a client
    peer_address_validated: bool,

    alarm: Option<LossTimer>,
    first_rtt_sample_time: Option<Instant>,
    ack_watermark: AckWatermark,
    stats: RecoveryStats,
}

impl SentPacketHandler {
    pub fn new(
        config: RecoveryConfig,
        rtt: SharedRttStats,
        perspective: Perspective,
        client_address_validated: bool,
        tracer: Option<Arc<dyn RecoveryTracer>>,
    ) -> Self {
        let congestion = new_controller(&config, rtt.clone());
        let ecn = config.enable_ecn.then(|| EcnTracker::new(tracer.clone()));
        let spaces = Spaces {
            initial: Some(SpaceState::new(PacketNumber::new(0), false)),
            handshake: Some(SpaceState::new(PacketNumber::new(0), false)),
            app_data: SpaceState::new(PacketNumber::new(0), config.skip_packet_numbers),
        };
        SentPacketHandler {
            config,
            perspective,
            spaces,
            rtt,
            congestion,
            ecn,
            tracer,
            bytes_in_flight: 0,
            bytes_sent: 0,
            bytes_received: 0,
            pto_count: 0,
            num_probes_to_send: 0,
            pto_mode: SendMode::None,
            handshake_confirmed: false,
            peer_completed_address_validation: perspective == Perspective::Server,
            peer_address_validated: perspective == Perspective::Client || client_address_validated,
            alarm: None,
            first_rtt_sample_time: None,
            ack_watermark: AckWatermark::new(),
            stats: RecoveryStats::default(),
        }
    }

    /// Record a sent packet.
    ///
    /// Packet numbers must be taken from [`pop_packet_number`](Self::pop_packet_number)
    /// (or at least be strictly increasing within the space).
    pub fn on_packet_sent(&mut self, packet: SentPacket) -> Result<(), TransportError> {
        let level = packet.level;
        let space = level.space();
        let now = packet.sent_time;

        if self.perspective == Perspective::Client
            && level == EncryptionLevel::Handshake
            && self.spaces.initial.is_some()
        {
            self.drop_packets(EncryptionLevel::Initial, now);
        }

        let Some(state) = self.spaces.get_mut(space) else {
            return Err(TransportError::Internal(format!(
                "packet {} sent at {level} after its keys were dropped",
                packet.pn
            )));
        };
        if let Some(highest) = state.history.highest_sent() {
            if packet.pn <= highest {
                return Err(TransportError::Internal(format!(
                    "packet number {} not above {highest} in {space:?}",
                    packet.pn
                )));
            }
        }

        let (pn, size, ack_eliciting, ecn) = (packet.pn, packet.size, packet.ack_eliciting, packet.ecn);
        self.bytes_sent += size;
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += size;

        if ack_eliciting {
            state.last_ack_eliciting_sent = Some(now);
            self.bytes_in_flight += size;
            self.num_probes_to_send = self.num_probes_to_send.saturating_sub(1);
        }
        state.history.sent_packet(packet);

        self.congestion.on_packet_sent(now, pn, size, ack_eliciting);
        if space == PacketNumberSpace::ApplicationData {
            if let Some(tracker) = self.ecn.as_mut() {
                tracker.on_packet_sent(pn, ecn);
            }
        }
        if let Some(tracer) = &self.tracer {
            tracer.on_packet_sent(level, pn, size, ack_eliciting);
        }

        if ack_eliciting || !self.peer_completed_address_validation {
            self.set_loss_detection_timer(now);
        }
        Ok(())
    }

    /// Process an ACK frame received at `level`
    pub fn on_ack_received(
        &mut self,
        ack: &AckFrame,
        level: EncryptionLevel,
        now: Instant,
    ) -> Result<AckOutcome, TransportError> {
        let space = level.space();
        let largest = match ack.largest_acked() {
            Some(pn) if ack.is_valid() => pn,
            _ => {
                return Err(TransportError::ProtocolViolation(format!(
                    "malformed ACK ranges at {level}"
                )))
            }
        };

        let Some(state) = self.spaces.get_mut(space) else {
            debug!(%level, %largest, "ignoring ACK for dropped packet number space");
            return Ok(AckOutcome::default());
        };
        if state.history.highest_sent().map_or(true, |highest| largest > highest) {
            return Err(TransportError::ProtocolViolation(format!(
                "received ACK for unsent packet {largest} in {space:?}"
            )));
        }

        let mut acked_pns = Vec::new();
        let mut spurious = Vec::new();
        for range in ack.ranges.iter().rev() {
            for (&pn, entry) in state.history.range(range.smallest..=range.largest) {
                match entry {
                    HistoryEntry::Outstanding(_) => acked_pns.push(pn),
                    HistoryEntry::Lost { .. } => spurious.push(pn),
                    HistoryEntry::Skipped { .. } => {
                        return Err(TransportError::ProtocolViolation(format!(
                            "received ACK for skipped packet number {pn}"
                        )))
                    }
                }
            }
        }

        let increases_largest = state.largest_acked.map_or(true, |prior| largest > prior);
        state.largest_acked = state.largest_acked.max(Some(largest));

        let acked: Vec<SentPacket> = acked_pns
            .iter()
            .filter_map(|&pn| match state.history.remove(pn) {
                Some(HistoryEntry::Outstanding(packet)) => Some(packet),
                _ => None,
            })
            .collect();
        for &pn in &spurious {
            state.history.remove(pn);
        }

        if self.perspective == Perspective::Client
            && !self.peer_completed_address_validation
            && matches!(level, EncryptionLevel::Handshake | EncryptionLevel::OneRtt)
        {
            self.peer_completed_address_validation = true;
        }

        let mut outcome = AckOutcome {
            acked: acked_pns,
            spuriously_lost: spurious,
            acked_1rtt: acked.iter().any(|p| p.level == EncryptionLevel::OneRtt),
            ..AckOutcome::default()
        };

        if increases_largest {
            if let Some(packet) = acked.last().filter(|p| p.pn == largest) {
                let ack_delay = if space == PacketNumberSpace::ApplicationData {
                    ack.ack_delay.min(self.rtt.read().max_ack_delay())
                } else {
                    Duration::ZERO
                };
                let sample = self.rtt.write().update_rtt(packet.sent_time, now, ack_delay);
                self.first_rtt_sample_time.get_or_insert(now);
                outcome.rtt_sample = Some(sample);
                if let Some(tracer) = &self.tracer {
                    tracer.on_rtt_updated(&self.rtt.read());
                }
            }

            if space == PacketNumberSpace::ApplicationData {
                if let (Some(tracker), Some(newest)) = (self.ecn.as_mut(), acked.last()) {
                    let marks: Vec<(PacketNumber, Ecn)> = acked.iter().map(|p| (p.pn, p.ecn)).collect();
                    let counts = ack.ecn.unwrap_or_default();
                    if tracker.on_packets_acked(&marks, counts.ect0, counts.ect1, counts.ce) {
                        self.congestion.on_ecn_congestion(newest.sent_time, now);
                        outcome.ecn_congestion = true;
                    }
                }
            }
        }

        for packet in &acked {
            if packet.level == EncryptionLevel::OneRtt {
                if let Some(acked_in_packet) = packet.largest_acked {
                    self.ack_watermark.raise(acked_in_packet.next());
                }
            }
            for frame in &packet.frames {
                frame.notify_acked();
            }
            if let Some(tracer) = &self.tracer {
                tracer.on_packet_acked(space, packet.pn);
            }
        }
        if let Some(tracer) = &self.tracer {
            for &pn in &outcome.spuriously_lost {
                tracer.on_spurious_loss(space, pn);
            }
        }
        self.stats.packets_acked += acked.len() as u64;
        self.stats.spurious_losses += outcome.spuriously_lost.len() as u64;

        outcome.lost = self.detect_lost_packets(now, space);

        let acked_bytes: u64 = acked.iter().map(|p| p.size).sum();
        self.bytes_in_flight -= acked_bytes;
        if !acked.is_empty() {
            let for_cc: Vec<AckedPacket> = acked
                .iter()
                .map(|p| AckedPacket {
                    pn: p.pn,
                    bytes: p.size,
                    sent_time: p.sent_time,
                })
                .collect();
            self.congestion.on_packets_acked(&for_cc, outcome.rtt_sample, now);
        }

        if self.peer_completed_address_validation {
            self.set_pto_count(0);
        }
        self.num_probes_to_send = 0;

        let expiry = self.rtt.read().pto(true) * PERSISTENT_CONGESTION_THRESHOLD;
        if let (Some(cutoff), Some(state)) = (now.checked_sub(expiry), self.spaces.get_mut(space)) {
            state.history.delete_old_entries(cutoff);
        }

        if let Some(tracer) = &self.tracer {
            tracer.on_metrics_updated(self.congestion.congestion_window(), self.bytes_in_flight);
        }
        trace!(
            %level,
            %largest,
            acked = outcome.acked.len(),
            lost = outcome.lost.len(),
            in_flight = self.bytes_in_flight,
            "ack processed"
        );
        self.set_loss_detection_timer(now);
        Ok(outcome)
    }

    /// Declare packets lost by the time and reordering thresholds; returns the lost packet numbers
    fn detect_lost_packets(&mut self, now: Instant, space: PacketNumberSpace) -> Vec<PacketNumber> {
        let loss_delay = {
            let rtt = self.rtt.read();
            rtt.latest_rtt()
                .max(rtt.smoothed_rtt())
                .mul_f64(self.config.time_threshold)
                .max(self.config.timer_granularity)
        };
        let packet_threshold = self.config.packet_threshold;

        let Some(state) = self.spaces.get_mut(space) else {
            return Vec::new();
        };
        state.loss_time = None;
        let Some(largest_acked) = state.largest_acked else {
            return Vec::new();
        };
        let lost_send_time = now.checked_sub(loss_delay);

        let mut lost_pns = Vec::new();
        for packet in state.history.outstanding() {
            if packet.pn > largest_acked {
                break;
            }
            if lost_send_time.map_or(false, |t| packet.sent_time <= t) {
                lost_pns.push((packet.pn, LossReason::TimeThreshold));
            } else if packet.pn.as_u64() + packet_threshold < largest_acked.as_u64() {
                lost_pns.push((packet.pn, LossReason::ReorderingThreshold));
            } else if state.loss_time.is_none() {
                state.loss_time = Some(packet.sent_time + loss_delay);
            }
        }

        let mut lost = Vec::with_capacity(lost_pns.len());
        for (pn, reason) in lost_pns {
            let Some((size, sent_time, _, frames)) = state.history.declare_lost(pn) else {
                continue;
            };
            self.bytes_in_flight -= size;
            for frame in &frames {
                frame.notify_lost();
            }
            if space == PacketNumberSpace::ApplicationData {
                if let Some(tracker) = self.ecn.as_mut() {
                    tracker.on_packet_lost(pn);
                }
            }
            self.stats.packets_lost += 1;
            self.stats.bytes_lost += size;
            if let Some(tracer) = &self.tracer {
                tracer.on_packet_lost(space, pn, reason);
            }
            debug!(%pn, ?space, ?reason, "packet lost");
            lost.push(LostPacket {
                pn,
                bytes: size,
                sent_time,
            });
        }

        if lost.is_empty() {
            return Vec::new();
        }

        let period = self.rtt.read().pto(true) * PERSISTENT_CONGESTION_THRESHOLD;
        let persistent = is_persistent_congestion(&lost, period, self.first_rtt_sample_time, |pn| {
            state.history.is_skipped(pn)
        });
        self.congestion.on_packets_lost(&lost, now);
        if persistent {
            debug!(?space, period = ?period, "persistent congestion");
            self.congestion.on_persistent_congestion(now);
        }
        lost.into_iter().map(|p| p.pn).collect()
    }

    /// Handle expiry of the loss detection alarm; returns packets declared lost
    pub fn on_loss_detection_timeout(&mut self, now: Instant) -> Result<Vec<PacketNumber>, TransportError> {
        let Some(alarm) = self.alarm else {
            return Ok(Vec::new());
        };
        if now < alarm.deadline {
            return Ok(Vec::new());
        }
        if let Some(tracer) = &self.tracer {
            tracer.on_loss_timer_expired(alarm.kind, alarm.space);
        }

        if let Some((_, space)) = self.earliest_loss_time() {
            let lost = self.detect_lost_packets(now, space);
            self.set_loss_detection_timer(now);
            return Ok(lost);
        }

        if self.bytes_in_flight == 0 && !self.peer_completed_address_validation {
            // client anti-deadlock: the server may be blocked by its amplification limit
            self.pto_mode = if self.spaces.initial.is_some() {
                SendMode::PtoInitial
            } else if self.spaces.handshake.is_some() {
                SendMode::PtoHandshake
            } else {
                return Err(TransportError::Internal(
                    "probe timeout with no handshake keys and nothing in flight".to_string(),
                ));
            };
            self.set_pto_count(self.pto_count + 1);
            self.num_probes_to_send += 1;
        } else {
            let Some((_, space)) = self.pto_time_and_space(now) else {
                self.set_loss_detection_timer(now);
                return Ok(Vec::new());
            };
            self.pto_mode = match space {
                PacketNumberSpace::Initial => SendMode::PtoInitial,
                PacketNumberSpace::Handshake => SendMode::PtoHandshake,
                PacketNumberSpace::ApplicationData => {
                    // an ACK of the skipped number exposes a peer acknowledging unseen packets
                    let app_data = &mut self.spaces.app_data;
                    let pn = app_data.pop_packet_number();
                    app_data.history.skipped_packet(pn);
                    SendMode::PtoAppData
                }
            };
            self.set_pto_count(self.pto_count + 1);
            self.num_probes_to_send += 2;
        }
        self.stats.pto_count += 1;
        debug!(pto_count = self.pto_count, mode = ?self.pto_mode, "probe timeout");

        self.congestion.on_pto_expired(now);
        self.set_loss_detection_timer(now);
        Ok(Vec::new())
    }

    /// Deadline of the loss detection alarm, if armed
    pub fn loss_detection_timeout(&self) -> Option<Instant> {
        self.alarm.map(|alarm| alarm.deadline)
    }

    pub fn loss_timer(&self) -> Option<LossTimer> {
        self.alarm
    }

    pub fn send_mode(&self, now: Instant) -> SendMode {
        let tracked: usize = self.spaces.iter().map(|(_, state)| state.history.len()).sum();

        if self.is_amplification_limited() {
            trace!(sent = self.bytes_sent, received = self.bytes_received, "amplification limited");
            return SendMode::None;
        }
        if tracked >= MAX_TRACKED_SENT_PACKETS {
            debug!(tracked, "limited by the number of tracked packets");
            return SendMode::None;
        }
        if self.num_probes_to_send > 0 {
            return self.pto_mode;
        }
        if self.bytes_in_flight >= self.congestion.congestion_window() {
            return SendMode::Ack;
        }
        if tracked >= MAX_OUTSTANDING_SENT_PACKETS {
            debug!(tracked, "limited by the number of outstanding packets");
            return SendMode::Ack;
        }
        if !self.congestion.has_pacing_budget(now) {
            return SendMode::PacingLimited;
        }
        SendMode::Any
    }

    /// Earliest time the next packet may be sent; `None` while the congestion window is full
    pub fn time_until_send(&self, now: Instant) -> Option<Instant> {
        self.congestion.time_until_send(now)
    }

    /// Declare the oldest outstanding packet at `level` lost so its frames go into a probe.
    ///
    /// Returns false if nothing is outstanding; the probe should then carry a PING.
    pub fn queue_probe_packet(&mut self, level: EncryptionLevel) -> bool {
        let space = level.space();
        let Some(state) = self.spaces.get_mut(space) else {
            return false;
        };
        let Some(pn) = state.history.first_outstanding().map(|p| p.pn) else {
            return false;
        };
        let Some((size, _, _, frames)) = state.history.declare_lost(pn) else {
            return false;
        };
        for frame in &frames {
            frame.notify_lost();
        }
        self.bytes_in_flight -= size;
        self.congestion.on_packets_discarded(size);
        self.stats.packets_lost += 1;
        self.stats.bytes_lost += size;
        if let Some(tracer) = &self.tracer {
            tracer.on_packet_lost(space, pn, LossReason::Probe);
        }
        true
    }

    /// Abandon all packets sent at `level` after its keys were discarded
    pub fn drop_packets(&mut self, level: EncryptionLevel, now: Instant) {
        if self.perspective == Perspective::Client && level == EncryptionLevel::Handshake {
            self.peer_completed_address_validation = true;
        }

        let released = match level {
            EncryptionLevel::Initial | EncryptionLevel::Handshake => {
                let slot = if level == EncryptionLevel::Initial {
                    &mut self.spaces.initial
                } else {
                    &mut self.spaces.handshake
                };
                let Some(state) = slot.take() else {
                    return;
                };
                if level == EncryptionLevel::Handshake {
                    self.handshake_confirmed = true;
                }
                if let Some(tracer) = &self.tracer {
                    tracer.on_space_dropped(level.space());
                }
                state.history.outstanding().map(|p| p.size).sum()
            }
            EncryptionLevel::ZeroRtt => self.spaces.app_data.history.remove_level(EncryptionLevel::ZeroRtt),
            EncryptionLevel::OneRtt => {
                debug!("1-RTT packets are never dropped");
                return;
            }
        };
        debug!(%level, released, "dropped packets");

        self.bytes_in_flight -= released;
        self.congestion.on_packets_discarded(released);
        self.set_pto_count(0);
        self.num_probes_to_send = 0;
        self.pto_mode = SendMode::None;
        self.set_loss_detection_timer(now);
    }

    /// Handshake confirmed: Initial and Handshake keys are gone, application-data PTO may be armed
    pub fn set_handshake_confirmed(&mut self, now: Instant) {
        self.drop_packets(EncryptionLevel::Initial, now);
        self.drop_packets(EncryptionLevel::Handshake, now);
        self.handshake_confirmed = true;
        self.set_loss_detection_timer(now);
    }

    /// Note a packet received at `level`
    pub fn received_packet(&mut self, level: EncryptionLevel, now: Instant) {
        if self.perspective != Perspective::Server || level != EncryptionLevel::Handshake {
            return;
        }
        // a Handshake packet proves the client owns its address
        if !self.peer_address_validated {
            self.peer_address_validated = true;
            self.set_loss_detection_timer(now);
        }
        if self.spaces.initial.is_some() {
            self.drop_packets(EncryptionLevel::Initial, now);
        }
    }

    /// Account received datagram bytes towards the anti-amplification limit
    pub fn received_bytes(&mut self, bytes: u64, now: Instant) {
        let was_limited = self.is_amplification_limited();
        self.bytes_received += bytes;
        self.stats.bytes_received += bytes;
        if was_limited && !self.is_amplification_limited() {
            self.set_loss_detection_timer(now);
        }
    }

    /// Reset after the server answered the first Initial with a Retry
    pub fn reset_for_retry(&mut self, now: Instant) {
        let mut first_initial_sent = None;
        let released = self.bytes_in_flight;

        if let Some(initial) = self.spaces.initial.as_mut() {
            for entry in initial.history.drain() {
                let packet = match entry {
                    HistoryEntry::Outstanding(packet) | HistoryEntry::Lost { packet } => packet,
                    HistoryEntry::Skipped { .. } => continue,
                };
                first_initial_sent.get_or_insert(packet.sent_time);
                for frame in &packet.frames {
                    frame.notify_lost();
                }
            }
        }
        for entry in self.spaces.app_data.history.drain() {
            if let HistoryEntry::Outstanding(packet) = entry {
                for frame in &packet.frames {
                    frame.notify_lost();
                }
            }
        }

        // the Retry arrived one round trip after the first Initial left, unless that was retransmitted
        if self.pto_count == 0 {
            if let Some(first) = first_initial_sent {
                let ack_time = now.max(first + MIN_RTT_AFTER_RETRY);
                let sample = self.rtt.write().update_rtt(first, ack_time, Duration::ZERO);
                self.first_rtt_sample_time.get_or_insert(now);
                debug!(?sample, "rtt sample from retry");
                if let Some(tracer) = &self.tracer {
                    tracer.on_rtt_updated(&self.rtt.read());
                }
            }
        }

        if let Some(initial) = self.spaces.initial.as_mut() {
            *initial = SpaceState::new(initial.pns.peek(), false);
        }
        let app_data = &mut self.spaces.app_data;
        *app_data = SpaceState::new(app_data.pns.peek(), self.config.skip_packet_numbers);

        self.bytes_in_flight = 0;
        self.congestion.on_packets_discarded(released);
        self.num_probes_to_send = 0;
        self.pto_mode = SendMode::None;
        self.set_pto_count(0);
        if self.alarm.take().is_some() {
            if let Some(tracer) = &self.tracer {
                tracer.on_loss_timer_canceled();
            }
        }
    }

    /// Next packet number to use at `level`, without consuming it
    pub fn peek_packet_number(&self, level: EncryptionLevel) -> Option<PacketNumber> {
        self.spaces.get(level.space()).map(|state| state.pns.peek())
    }

    /// Consume the next packet number at `level`; `None` once the space was dropped
    pub fn pop_packet_number(&mut self, level: EncryptionLevel) -> Option<PacketNumber> {
        self.spaces.get_mut(level.space()).map(SpaceState::pop_packet_number)
    }

    /// ECN codepoint for the next packet sent at `level`
    pub fn ecn_mode(&self, level: EncryptionLevel) -> Ecn {
        if level != EncryptionLevel::OneRtt {
            return Ecn::NotEct;
        }
        self.ecn.as_ref().map_or(Ecn::NotEct, EcnTracker::mode)
    }

    pub fn ecn_state(&self) -> Option<EcnState> {
        self.ecn.as_ref().map(EcnTracker::state)
    }

    /// Handle for the received-packet handler to prune acknowledged history
    pub fn ack_watermark(&self) -> AckWatermark {
        self.ack_watermark.clone()
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    pub fn congestion_window(&self) -> u64 {
        self.congestion.congestion_window()
    }

    pub fn congestion(&self) -> &dyn CongestionController {
        self.congestion.as_ref()
    }

    pub fn rtt(&self) -> &SharedRttStats {
        &self.rtt
    }

    pub fn largest_acked(&self, space: PacketNumberSpace) -> Option<PacketNumber> {
        self.spaces.get(space).and_then(|state| state.largest_acked)
    }

    pub fn num_outstanding(&self, space: PacketNumberSpace) -> usize {
        self.spaces.get(space).map_or(0, |state| state.history.num_outstanding())
    }

    pub fn pto_count(&self) -> u32 {
        self.pto_count
    }

    pub fn handshake_confirmed(&self) -> bool {
        self.handshake_confirmed
    }

    pub fn stats(&self) -> RecoveryStats {
        self.stats
    }

    /// A server may not send more than the amplification factor times what it received
    pub fn is_amplification_limited(&self) -> bool {
        !self.peer_address_validated
            && self.bytes_sent >= self.config.amplification_factor * self.bytes_received
    }

    fn has_outstanding_crypto_packets(&self) -> bool {
        [&self.spaces.initial, &self.spaces.handshake]
            .into_iter()
            .flatten()
            .any(|state| state.history.has_outstanding_packets())
    }

    fn earliest_loss_time(&self) -> Option<(Instant, PacketNumberSpace)> {
        self.spaces
            .iter()
            .filter_map(|(space, state)| state.loss_time.map(|t| (t, space)))
            .min_by_key(|(t, _)| *t)
    }

    fn pto_time_and_space(&self, now: Instant) -> Option<(Instant, PacketNumberSpace)> {
        let rtt = self.rtt.read();
        let backoff = 1u32 << self.pto_count.min(30);

        if !self.handshake_confirmed && !self.has_outstanding_crypto_packets() {
            if self.peer_completed_address_validation {
                return None;
            }
            let space = if self.spaces.initial.is_some() {
                PacketNumberSpace::Initial
            } else {
                PacketNumberSpace::Handshake
            };
            return Some((now + rtt.pto(false).saturating_mul(backoff), space));
        }

        let mut earliest: Option<(Instant, PacketNumberSpace)> = None;
        for (space, state) in self.spaces.iter() {
            if !state.history.has_outstanding_packets() {
                continue;
            }
            let app_data = space == PacketNumberSpace::ApplicationData;
            if app_data && !self.handshake_confirmed {
                continue;
            }
            let Some(sent) = state.last_ack_eliciting_sent else {
                continue;
            };
            let deadline = sent + rtt.pto(app_data).saturating_mul(backoff);
            if earliest.map_or(true, |(t, _)| deadline < t) {
                earliest = Some((deadline, space));
            }
        }
        earliest
    }

    fn set_pto_count(&mut self, count: u32) {
        if self.pto_count == count {
            return;
        }
        self.pto_count = count;
        if let Some(tracer) = &self.tracer {
            tracer.on_pto_count_updated(count);
        }
    }

    fn set_loss_detection_timer(&mut self, now: Instant) {
        let previous = self.alarm;
        self.alarm = self.compute_loss_timer(now);
        let Some(tracer) = &self.tracer else {
            return;
        };
        match (previous, self.alarm) {
            (_, Some(alarm)) if previous != Some(alarm) => {
                tracer.on_loss_timer_set(alarm.kind, alarm.space, alarm.deadline)
            }
            (Some(_), None) => tracer.on_loss_timer_canceled(),
            _ => {}
        }
    }

    fn compute_loss_timer(&self, now: Instant) -> Option<LossTimer> {
        // a server blocked by the amplification limit waits for the client
        if self.is_amplification_limited() {
            return None;
        }
        if let Some((deadline, space)) = self.earliest_loss_time() {
            return Some(LossTimer {
                deadline,
                kind: TimerKind::LossDetection,
                space,
            });
        }
        let (deadline, space) = self.pto_time_and_space(now)?;
        Some(LossTimer {
            deadline,
            kind: TimerKind::Pto,
            space,
        })
    }
}

impl std::fmt::Debug for SentPacketHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SentPacketHandler")
            .field("perspective", &self.perspective)
            .field("bytes_in_flight", &self.bytes_in_flight)
            .field("pto_count", &self.pto_count)
            .field("alarm", &self.alarm)
            .field("stats", &self.stats)
            .finish()
    }
}

/// Whether the lost packets include a contiguous run spanning more than `period`.
///
/// Only packets sent after the first RTT sample count. Skipped packet numbers
/// do not break a run.
fn is_persistent_congestion(
    lost: &[LostPacket],
    period: Duration,
    first_rtt_sample: Option<Instant>,
    is_skipped: impl Fn(PacketNumber) -> bool,
) -> bool {
    let Some(cutoff) = first_rtt_sample else {
        return false;
    };

    let mut start: Option<Instant> = None;
    let mut previous: Option<PacketNumber> = None;
    for packet in lost.iter().filter(|p| p.sent_time >= cutoff) {
        let contiguous = previous.map_or(false, |prev| {
            packet.pn == prev.next() || (packet.pn == prev + 2 && is_skipped(prev.next()))
        });
        if !contiguous {
            start = None;
        }
        previous = Some(packet.pn);
        match start {
            Some(first) if packet.sent_time.saturating_duration_since(first) > period => return true,
            Some(_) => {}
            None => start = Some(packet.sent_time),
        }
    }
    false
}
