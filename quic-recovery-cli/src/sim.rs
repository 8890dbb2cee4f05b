//! Bulk transfer between two recovery engines over a simulated path
//!
//! The sender writes one stream of `transfer_size` bytes; the receiver reads
//! it in order and hands out credit with MAX_STREAM_DATA and MAX_DATA. Both
//! endpoints run the full sent/received packet handlers in the
//! application-data space, and every ACK frame crosses the link in its wire
//! encoding. Time is virtual and jumps from one event to the next.

use crate::codec::{varint_len, AckCodec, CodecError};
use crate::config::{ConfigError, SimConfig};
use crate::link::{Link, LinkStats};
use bytes::Bytes;
use parking_lot::Mutex;
use quic_recovery::ecn::{Ecn, EcnState};
use quic_recovery::flow_control::{ConnectionFlowController, StreamFlowController};
use quic_recovery::frame::{Frame, FrameHandler, SentFrame, StreamId};
use quic_recovery::packet_number::{EncryptionLevel, PacketNumber, Perspective};
use quic_recovery::received_handler::ReceivedPacketHandler;
use quic_recovery::rtt::RttStats;
use quic_recovery::sent_handler::{RecoveryStats, SendMode, SentPacketHandler};
use quic_recovery::sent_history::SentPacket;
use quic_recovery::tracer::RecoveryTracer;
use quic_recovery::{new_ack_handler, TransportError};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace};

/// Short header and AEAD tag
pub const PACKET_OVERHEAD: u64 = 30;

/// The transferred stream
pub const STREAM_ID: StreamId = 0;

const LEVEL: EncryptionLevel = EncryptionLevel::OneRtt;

/// Smallest step of the virtual clock
const MIN_STEP: Duration = Duration::from_micros(50);

/// A packet on the simulated link
#[derive(Debug, Clone)]
pub struct Datagram {
    pub pn: PacketNumber,
    pub size: u64,
    pub ecn: Ecn,
    /// Encoded ACK frame
    pub ack: Option<Bytes>,
    pub frames: Vec<Frame>,
}

/// Encoded size of the frames the simulator sends besides ACK
pub fn frame_size(frame: &Frame) -> u64 {
    let fields = match *frame {
        Frame::Stream {
            stream_id, offset, len, ..
        } => varint_len(stream_id) + varint_len(offset) + varint_len(len) + len as usize,
        Frame::MaxData { maximum } => varint_len(maximum),
        Frame::MaxStreamData { stream_id, maximum } => varint_len(stream_id) + varint_len(maximum),
        Frame::DataBlocked { limit } => varint_len(limit),
        Frame::StreamDataBlocked { stream_id, limit } => varint_len(stream_id) + varint_len(limit),
        _ => 0,
    };
    1 + fields as u64
}

/// Frames waiting to be sent; frames of lost packets are queued again
#[derive(Debug, Default)]
struct FrameQueue {
    frames: Mutex<VecDeque<Frame>>,
    retransmitted_bytes: AtomicU64,
    acked_stream_bytes: AtomicU64,
}

impl FrameQueue {
    fn push(&self, frame: Frame) {
        self.frames.lock().push_back(frame);
    }

    fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Next frame fitting in `budget` bytes; STREAM frames are split to fit
    fn pop(&self, budget: u64) -> Option<Frame> {
        let mut frames = self.frames.lock();
        let front = frames.front_mut()?;
        if frame_size(front) <= budget {
            return frames.pop_front();
        }
        let Frame::Stream {
            stream_id,
            offset,
            len,
            fin,
        } = front
        else {
            return None;
        };
        let header = frame_size(&Frame::Stream {
            stream_id: *stream_id,
            offset: *offset,
            len: *len,
            fin: *fin,
        }) - *len;
        if budget <= header {
            return None;
        }
        let part = budget - header;
        let split = Frame::Stream {
            stream_id: *stream_id,
            offset: *offset,
            len: part,
            fin: false,
        };
        *offset += part;
        *len -= part;
        Some(split)
    }
}

impl FrameHandler for FrameQueue {
    fn on_acked(&self, frame: &Frame) {
        if let Frame::Stream { len, .. } = frame {
            self.acked_stream_bytes.fetch_add(*len, Ordering::Relaxed);
        }
    }

    fn on_lost(&self, frame: &Frame) {
        match frame {
            Frame::Stream { len, .. } => {
                self.retransmitted_bytes.fetch_add(*len, Ordering::Relaxed);
                self.push(frame.clone());
            }
            Frame::MaxData { .. }
            | Frame::MaxStreamData { .. }
            | Frame::DataBlocked { .. }
            | Frame::StreamDataBlocked { .. } => self.push(frame.clone()),
            _ => {}
        }
    }
}

/// Received stream data not yet read, as disjoint `start -> end` ranges
#[derive(Debug, Default)]
struct Reassembly {
    ranges: BTreeMap<u64, u64>,
}

impl Reassembly {
    fn insert(&mut self, mut start: u64, mut end: u64) {
        let overlapping: Vec<(u64, u64)> = self
            .ranges
            .range(..=end)
            .filter(|(_, &e)| e >= start)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in overlapping {
            self.ranges.remove(&s);
            start = start.min(s);
            end = end.max(e);
        }
        self.ranges.insert(start, end);
    }

    /// Remove the data contiguous from `from`, returning its length
    fn read_from(&mut self, from: u64) -> u64 {
        let mut to = from;
        while let Some((&start, &end)) = self.ranges.iter().next() {
            if start > to {
                break;
            }
            self.ranges.remove(&start);
            to = to.max(end);
        }
        to - from
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Sender,
    Receiver,
}

struct Endpoint {
    role: Role,
    sent: SentPacketHandler,
    received: ReceivedPacketHandler,
    connection: Arc<ConnectionFlowController>,
    stream: StreamFlowController,
    queue: Arc<FrameQueue>,
    codec: AckCodec,
    max_datagram_size: u64,

    transfer_size: u64,
    next_offset: u64,

    reassembly: Reassembly,
    read_offset: u64,
    final_size: Option<u64>,
    finished_at: Option<Instant>,
}

impl Endpoint {
    fn new(role: Role, config: &SimConfig, tracer: Option<Arc<dyn RecoveryTracer>>, now: Instant) -> Self {
        let recovery = config.recovery_config();
        let flow_control = config.flow_control_config();

        let mut rtt = RttStats::new(recovery.initial_rtt);
        rtt.set_max_ack_delay(recovery.max_ack_delay);
        let rtt = rtt.into_shared();

        let perspective = match role {
            Role::Sender => Perspective::Client,
            Role::Receiver => Perspective::Server,
        };
        let max_datagram_size = recovery.max_datagram_size;
        let (mut sent, mut received) = new_ack_handler(recovery, rtt.clone(), perspective, true, tracer);
        sent.set_handshake_confirmed(now);
        received.drop_packets(EncryptionLevel::Initial);
        received.drop_packets(EncryptionLevel::Handshake);

        // both endpoints announce the same windows
        let connection = Arc::new(ConnectionFlowController::new(
            &flow_control,
            flow_control.initial_connection_receive_window,
            rtt.clone(),
        ));
        let stream = StreamFlowController::new(
            STREAM_ID,
            connection.clone(),
            &flow_control,
            flow_control.initial_stream_receive_window,
            rtt,
        );

        Endpoint {
            role,
            sent,
            received,
            connection,
            stream,
            queue: Arc::new(FrameQueue::default()),
            codec: AckCodec::default(),
            max_datagram_size,
            transfer_size: config.transfer_size,
            next_offset: 0,
            reassembly: Reassembly::default(),
            read_offset: 0,
            final_size: None,
            finished_at: None,
        }
    }

    fn has_new_data(&self) -> bool {
        self.role == Role::Sender && self.next_offset < self.transfer_size && self.stream.send_window_size() > 0
    }

    fn on_datagram(&mut self, datagram: Datagram, now: Instant) -> Result<(), SimError> {
        self.sent.received_bytes(datagram.size, now);
        let ack_eliciting = datagram.frames.iter().any(Frame::is_ack_eliciting);
        if !self
            .received
            .received_packet(datagram.pn, datagram.ecn, LEVEL, now, ack_eliciting)?
        {
            return Ok(());
        }

        if let Some(mut encoded) = datagram.ack {
            let ack = self.codec.decode(&mut encoded)?;
            let outcome = self.sent.on_ack_received(&ack, LEVEL, now)?;
            if !outcome.lost.is_empty() {
                debug!(role = ?self.role, lost = outcome.lost.len(), "packets lost");
            }
        }
        for frame in datagram.frames {
            self.on_frame(frame, now)?;
        }
        Ok(())
    }

    fn on_frame(&mut self, frame: Frame, now: Instant) -> Result<(), SimError> {
        match frame {
            Frame::Stream { offset, len, fin, .. } => {
                let end = offset + len;
                self.stream.update_highest_received(end, fin, now)?;
                if fin {
                    self.final_size = Some(end);
                }
                self.reassembly.insert(offset, end);
                let readable = self.reassembly.read_from(self.read_offset);
                if readable > 0 {
                    self.read_offset += readable;
                    self.stream.add_bytes_read(readable);
                    self.queue_window_updates(now);
                }
                if self.finished_at.is_none() && self.final_size == Some(self.read_offset) {
                    info!(bytes = self.read_offset, "transfer complete");
                    self.finished_at = Some(now);
                }
            }
            Frame::MaxData { maximum } => {
                self.connection.update_send_window(maximum);
            }
            Frame::MaxStreamData { maximum, .. } => {
                self.stream.update_send_window(maximum);
            }
            Frame::StreamDataBlocked { limit, .. } => {
                debug!(limit, "peer blocked on stream");
                self.stream.on_stream_data_blocked(limit);
                self.queue_window_updates(now);
            }
            Frame::DataBlocked { limit } => {
                debug!(limit, "peer blocked on connection");
            }
            _ => {}
        }
        Ok(())
    }

    fn queue_window_updates(&mut self, now: Instant) {
        if let Some(maximum) = self.stream.window_update(now) {
            trace!(maximum, "queueing MAX_STREAM_DATA");
            self.queue.push(Frame::MaxStreamData {
                stream_id: STREAM_ID,
                maximum,
            });
        }
        if let Some(maximum) = self.connection.window_update(now) {
            trace!(maximum, "queueing MAX_DATA");
            self.queue.push(Frame::MaxData { maximum });
        }
    }

    fn on_timeout(&mut self, now: Instant) -> Result<(), SimError> {
        if self.sent.loss_detection_timeout().is_some_and(|deadline| deadline <= now) {
            let lost = self.sent.on_loss_detection_timeout(now)?;
            debug!(role = ?self.role, lost = lost.len(), pto_count = self.sent.pto_count(), "loss detection timeout");
        }
        Ok(())
    }

    fn next_timeout(&self, now: Instant) -> Option<Instant> {
        let pacing = match self.sent.send_mode(now) {
            SendMode::PacingLimited if self.has_new_data() || !self.queue.is_empty() => self.sent.time_until_send(now),
            _ => None,
        };
        [self.sent.loss_detection_timeout(), self.received.ack_alarm(), pacing]
            .into_iter()
            .flatten()
            .min()
    }

    fn send(&mut self, now: Instant, link: &mut Link<Datagram>) -> Result<(), SimError> {
        loop {
            let datagram = match self.sent.send_mode(now) {
                SendMode::None => None,
                SendMode::Ack | SendMode::PacingLimited => {
                    let datagram = self.build_ack_only(now)?;
                    if let Some(datagram) = datagram {
                        link.send(now, datagram.size, datagram);
                    }
                    return Ok(());
                }
                SendMode::Any => self.build_packet(now, false)?,
                SendMode::PtoInitial | SendMode::PtoHandshake | SendMode::PtoAppData => {
                    if self.queue.is_empty() && !self.has_new_data() {
                        self.sent.queue_probe_packet(LEVEL);
                    }
                    self.build_packet(now, true)?
                }
            };
            let Some(datagram) = datagram else {
                return Ok(());
            };
            link.send(now, datagram.size, datagram);
        }
    }

    fn build_ack_only(&mut self, now: Instant) -> Result<Option<Datagram>, SimError> {
        let Some(ack) = self.received.ack_frame(LEVEL, now, true) else {
            return Ok(None);
        };
        let encoded = self.codec.encode(&ack)?;
        let mut frames = Vec::new();
        if let Some(largest) = ack.largest_acked() {
            frames.push(SentFrame::new(Frame::Ack {
                largest_acked: largest.as_u64(),
            }));
        }
        self.finish_packet(now, Some(encoded), frames, Vec::new()).map(Some)
    }

    fn build_packet(&mut self, now: Instant, probe: bool) -> Result<Option<Datagram>, SimError> {
        let has_data = probe || !self.queue.is_empty() || self.has_new_data();
        let ack = self.received.ack_frame(LEVEL, now, !has_data);
        let mut budget = self.max_datagram_size - PACKET_OVERHEAD;

        let mut sent_frames = Vec::new();
        let encoded_ack = match ack {
            Some(ack) => {
                let encoded = self.codec.encode(&ack)?;
                budget = budget.saturating_sub(encoded.len() as u64);
                if let Some(largest) = ack.largest_acked() {
                    sent_frames.push(SentFrame::new(Frame::Ack {
                        largest_acked: largest.as_u64(),
                    }));
                }
                Some(encoded)
            }
            None => None,
        };

        let mut frames = Vec::new();
        while let Some(frame) = self.queue.pop(budget) {
            budget -= frame_size(&frame);
            frames.push(frame);
        }
        if self.role == Role::Sender {
            self.add_stream_data(&mut frames, &mut budget);
        }
        if probe && !frames.iter().any(Frame::is_ack_eliciting) {
            frames.push(Frame::Ping);
        }
        if frames.is_empty() && encoded_ack.is_none() {
            return Ok(None);
        }
        self.finish_packet(now, encoded_ack, sent_frames, frames).map(Some)
    }

    fn add_stream_data(&mut self, frames: &mut Vec<Frame>, budget: &mut u64) {
        if self.next_offset >= self.transfer_size {
            return;
        }
        let window = self.stream.send_window_size();
        if window == 0 {
            if let Some(limit) = self.stream.is_newly_blocked() {
                frames.push(Frame::StreamDataBlocked {
                    stream_id: STREAM_ID,
                    limit,
                });
            }
            if let Some(limit) = self.connection.is_newly_blocked() {
                frames.push(Frame::DataBlocked { limit });
            }
            return;
        }

        let remaining = self.transfer_size - self.next_offset;
        let header = frame_size(&Frame::Stream {
            stream_id: STREAM_ID,
            offset: self.next_offset,
            len: remaining.min(self.max_datagram_size),
            fin: false,
        }) - remaining.min(self.max_datagram_size);
        if *budget <= header {
            return;
        }
        let len = (*budget - header).min(window).min(remaining);
        let frame = Frame::Stream {
            stream_id: STREAM_ID,
            offset: self.next_offset,
            len,
            fin: self.next_offset + len == self.transfer_size,
        };
        *budget -= frame_size(&frame);
        self.stream.add_bytes_sent(len);
        self.next_offset += len;
        frames.push(frame);
    }

    fn finish_packet(
        &mut self,
        now: Instant,
        ack: Option<Bytes>,
        mut sent_frames: Vec<SentFrame>,
        frames: Vec<Frame>,
    ) -> Result<Datagram, SimError> {
        let pn = self
            .sent
            .pop_packet_number(LEVEL)
            .ok_or_else(|| TransportError::Internal("application data space dropped".to_string()))?;
        let ecn = self.sent.ecn_mode(LEVEL);
        let size = PACKET_OVERHEAD
            + ack.as_ref().map_or(0, |ack| ack.len() as u64)
            + frames.iter().map(frame_size).sum::<u64>();

        let handler: Arc<dyn FrameHandler> = self.queue.clone();
        sent_frames.extend(
            frames
                .iter()
                .map(|frame| SentFrame::with_handler(frame.clone(), handler.clone())),
        );
        let packet = SentPacket::new(pn, LEVEL, now, size)
            .with_frames(sent_frames)
            .with_ecn(ecn);
        self.sent.on_packet_sent(packet)?;
        trace!(role = ?self.role, %pn, size, frames = frames.len(), "packet sent");

        Ok(Datagram {
            pn,
            size,
            ecn,
            ack,
            frames,
        })
    }
}

/// Outcome of a completed transfer
#[derive(Debug, Clone)]
pub struct SimReport {
    /// Simulated time until the receiver read the last byte
    pub elapsed: Duration,
    pub transfer_size: u64,
    pub sender: RecoveryStats,
    pub receiver: RecoveryStats,
    /// Stream bytes queued again after their packet was lost
    pub retransmitted_bytes: u64,
    pub forward: LinkStats,
    pub backward: LinkStats,
    pub smoothed_rtt: Duration,
    pub min_rtt: Duration,
    pub congestion_window: u64,
    /// Receiver's stream window size after auto-tuning
    pub stream_window: u64,
    /// Receiver's connection window size after auto-tuning
    pub connection_window: u64,
    pub ecn_state: Option<EcnState>,
}

impl SimReport {
    /// Application bytes per second of simulated time, in bits
    pub fn goodput_bps(&self) -> u64 {
        let micros = self.elapsed.as_micros().max(1);
        (u128::from(self.transfer_size) * 8 * 1_000_000 / micros) as u64
    }
}

/// Simulation failures
#[derive(Debug, Error)]
pub enum SimError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no pending events after {0:?}")]
    Stalled(Duration),

    #[error("time limit reached after {delivered} of {total} bytes")]
    TimeLimit { delivered: u64, total: u64 },
}

/// A configured transfer, ready to run
pub struct Simulation {
    config: SimConfig,
    tracer: Option<Arc<dyn RecoveryTracer>>,
}

impl Simulation {
    pub fn new(config: SimConfig) -> Result<Self, SimError> {
        config.validate()?;
        Ok(Simulation { config, tracer: None })
    }

    /// Attach a tracer to the sending endpoint
    pub fn with_tracer(mut self, tracer: Arc<dyn RecoveryTracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn run(&self) -> Result<SimReport, SimError> {
        let start = Instant::now();
        let deadline = start + self.config.time_limit();
        let mut now = start;

        let mut sender = Endpoint::new(Role::Sender, &self.config, self.tracer.clone(), now);
        let mut receiver = Endpoint::new(Role::Receiver, &self.config, None, now);
        let mut forward: Link<Datagram> = Link::new(&self.config.link, 0);
        let mut backward: Link<Datagram> = Link::new(&self.config.link, 1);

        info!(
            bytes = self.config.transfer_size,
            delay_ms = self.config.link.delay_ms,
            loss_rate = self.config.link.loss_rate,
            "starting transfer"
        );

        let finished_at = loop {
            while let Some(datagram) = forward.poll(now) {
                receiver.on_datagram(datagram, now)?;
            }
            while let Some(datagram) = backward.poll(now) {
                sender.on_datagram(datagram, now)?;
            }
            if let Some(finished_at) = receiver.finished_at {
                break finished_at;
            }

            sender.on_timeout(now)?;
            receiver.on_timeout(now)?;
            sender.send(now, &mut forward)?;
            receiver.send(now, &mut backward)?;

            let next = [
                forward.next_arrival(),
                backward.next_arrival(),
                sender.next_timeout(now),
                receiver.next_timeout(now),
            ]
            .into_iter()
            .flatten()
            .min();
            let Some(next) = next else {
                return Err(SimError::Stalled(now - start));
            };
            if next > deadline {
                return Err(SimError::TimeLimit {
                    delivered: receiver.read_offset,
                    total: self.config.transfer_size,
                });
            }
            now = next.max(now + MIN_STEP);
        };

        let (smoothed_rtt, min_rtt) = {
            let rtt = sender.sent.rtt().read();
            (rtt.smoothed_rtt(), rtt.min_rtt())
        };
        Ok(SimReport {
            elapsed: finished_at - start,
            transfer_size: self.config.transfer_size,
            sender: sender.sent.stats(),
            receiver: receiver.sent.stats(),
            retransmitted_bytes: sender.queue.retransmitted_bytes.load(Ordering::Relaxed),
            forward: forward.stats(),
            backward: backward.stats(),
            smoothed_rtt,
            min_rtt,
            congestion_window: sender.sent.congestion_window(),
            stream_window: receiver.stream.receive_window_size(),
            connection_window: receiver.connection.receive_window_size(),
            ecn_state: sender.sent.ecn_state(),
        })
    }
}
