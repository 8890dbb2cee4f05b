//! Sent packet records of one packet number space

use crate::ecn::Ecn;
use crate::frame::{Frame, SentFrame};
use crate::packet_number::{EncryptionLevel, PacketNumber};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::time::Instant;

/// A packet handed to loss recovery after it was sent
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub pn: PacketNumber,
    pub level: EncryptionLevel,
    pub sent_time: Instant,
    /// Size on the wire in bytes
    pub size: u64,
    /// Contains a frame other than ACK or PADDING; such packets count as in flight
    pub ack_eliciting: bool,
    pub frames: Vec<SentFrame>,
    /// Largest packet number acknowledged by an ACK frame in this packet
    pub largest_acked: Option<PacketNumber>,
    pub ecn: Ecn,
}

impl SentPacket {
    pub fn new(pn: PacketNumber, level: EncryptionLevel, sent_time: Instant, size: u64) -> Self {
        SentPacket {
            pn,
            level,
            sent_time,
            size,
            ack_eliciting: false,
            frames: Vec::new(),
            largest_acked: None,
            ecn: Ecn::NotEct,
        }
    }

    /// Attach the packet's frames; ack-elicitation and the carried ACK follow from them
    pub fn with_frames(mut self, frames: Vec<SentFrame>) -> Self {
        self.ack_eliciting = frames.iter().any(|f| f.frame.is_ack_eliciting());
        self.largest_acked = frames
            .iter()
            .filter_map(|f| match f.frame {
                Frame::Ack { largest_acked } => Some(PacketNumber::new(largest_acked)),
                _ => None,
            })
            .max();
        self.frames = frames;
        self
    }

    pub fn with_ecn(mut self, ecn: Ecn) -> Self {
        self.ecn = ecn;
        self
    }
}

#[derive(Debug)]
pub(crate) enum HistoryEntry {
    /// Sent and neither acknowledged nor lost
    Outstanding(SentPacket),
    /// Declared lost; kept so a late acknowledgment is recognized as spurious
    Lost { packet: SentPacket },
    /// Packet number that was never used; time of the next send, once known
    Skipped { since: Option<Instant> },
}

/// Ordered record of the packets of one packet number space
#[derive(Debug, Default)]
pub(crate) struct SentPacketHistory {
    entries: BTreeMap<PacketNumber, HistoryEntry>,
    num_outstanding: usize,
    highest_sent: Option<PacketNumber>,
}

impl SentPacketHistory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn skipped_packet(&mut self, pn: PacketNumber) {
        self.entries.insert(pn, HistoryEntry::Skipped { since: None });
        self.highest_sent = self.highest_sent.max(Some(pn));
    }

    /// Record a sent packet. Only ack-eliciting packets are kept.
    pub(crate) fn sent_packet(&mut self, packet: SentPacket) {
        self.highest_sent = self.highest_sent.max(Some(packet.pn));
        let sent_time = packet.sent_time;
        for entry in self.entries.values_mut().rev() {
            match entry {
                HistoryEntry::Skipped { since } if since.is_none() => *since = Some(sent_time),
                HistoryEntry::Skipped { .. } => {}
                _ => break,
            }
        }
        if !packet.ack_eliciting {
            return;
        }
        self.num_outstanding += 1;
        self.entries.insert(packet.pn, HistoryEntry::Outstanding(packet));
    }

    pub(crate) fn highest_sent(&self) -> Option<PacketNumber> {
        self.highest_sent
    }

    pub(crate) fn get(&self, pn: PacketNumber) -> Option<&HistoryEntry> {
        self.entries.get(&pn)
    }

    pub(crate) fn range(
        &self,
        range: RangeInclusive<PacketNumber>,
    ) -> impl Iterator<Item = (&PacketNumber, &HistoryEntry)> {
        self.entries.range(range)
    }

    /// Outstanding packets in packet number order
    pub(crate) fn outstanding(&self) -> impl Iterator<Item = &SentPacket> {
        self.entries.values().filter_map(|entry| match entry {
            HistoryEntry::Outstanding(packet) => Some(packet),
            _ => None,
        })
    }

    pub(crate) fn first_outstanding(&self) -> Option<&SentPacket> {
        self.outstanding().next()
    }

    pub(crate) fn has_outstanding_packets(&self) -> bool {
        self.num_outstanding > 0
    }

    pub(crate) fn num_outstanding(&self) -> usize {
        self.num_outstanding
    }

    /// Tracked entries, including lost and skipped ones
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_skipped(&self, pn: PacketNumber) -> bool {
        matches!(self.entries.get(&pn), Some(HistoryEntry::Skipped { .. }))
    }

    /// Remove an entry, returning the packet if it was outstanding or lost
    pub(crate) fn remove(&mut self, pn: PacketNumber) -> Option<HistoryEntry> {
        let entry = self.entries.remove(&pn)?;
        if matches!(entry, HistoryEntry::Outstanding(_)) {
            self.num_outstanding -= 1;
        }
        Some(entry)
    }

    /// Turn an outstanding packet into a tombstone, handing back its frames
    pub(crate) fn declare_lost(&mut self, pn: PacketNumber) -> Option<(u64, Instant, Ecn, Vec<SentFrame>)> {
        let entry = self.entries.get_mut(&pn)?;
        if !matches!(entry, HistoryEntry::Outstanding(_)) {
            return None;
        }
        let HistoryEntry::Outstanding(mut packet) = std::mem::replace(entry, HistoryEntry::Skipped { since: None }) else {
            return None;
        };
        let frames = std::mem::take(&mut packet.frames);
        let result = (packet.size, packet.sent_time, packet.ecn, frames);
        *entry = HistoryEntry::Lost { packet };
        self.num_outstanding -= 1;
        Some(result)
    }

    /// Forget tombstones and skipped numbers older than `cutoff`
    pub(crate) fn delete_old_entries(&mut self, cutoff: Instant) {
        self.entries.retain(|_, entry| match entry {
            HistoryEntry::Outstanding(_) => true,
            HistoryEntry::Lost { packet, .. } => packet.sent_time >= cutoff,
            HistoryEntry::Skipped { since } => since.map_or(true, |t| t >= cutoff),
        });
    }

    /// Remove all entries sent at `level`, returning the outstanding bytes released
    pub(crate) fn remove_level(&mut self, level: EncryptionLevel) -> u64 {
        let mut released = 0;
        let mut num_outstanding = self.num_outstanding;
        self.entries.retain(|_, entry| match entry {
            HistoryEntry::Outstanding(packet) if packet.level == level => {
                released += packet.size;
                num_outstanding -= 1;
                false
            }
            HistoryEntry::Lost { packet, .. } => packet.level != level,
            _ => true,
        });
        self.num_outstanding = num_outstanding;
        released
    }

    /// Drain every entry
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = HistoryEntry> {
        self.num_outstanding = 0;
        std::mem::take(&mut self.entries).into_values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn packet(pn: u64, at: Instant) -> SentPacket {
        SentPacket::new(PacketNumber::new(pn), EncryptionLevel::OneRtt, at, 1000)
            .with_frames(vec![SentFrame::new(Frame::Ping)])
    }

    #[test]
    fn test_builder_derives_flags() {
        let now = Instant::now();
        let ack_only = SentPacket::new(PacketNumber::new(1), EncryptionLevel::OneRtt, now, 50)
            .with_frames(vec![Frame::Ack { largest_acked: 7 }.into(), Frame::Padding { len: 10 }.into()]);
        assert!(!ack_only.ack_eliciting);
        assert_eq!(ack_only.largest_acked, Some(PacketNumber::new(7)));

        assert!(packet(2, now).ack_eliciting);
    }

    #[test]
    fn test_non_ack_eliciting_not_stored() {
        let now = Instant::now();
        let mut history = SentPacketHistory::new();
        history.sent_packet(SentPacket::new(PacketNumber::new(0), EncryptionLevel::OneRtt, now, 40));

        assert_eq!(history.len(), 0);
        assert_eq!(history.highest_sent(), Some(PacketNumber::new(0)));
    }

    #[test]
    fn test_declare_lost_keeps_tombstone() {
        let now = Instant::now();
        let mut history = SentPacketHistory::new();
        history.sent_packet(packet(0, now));
        history.sent_packet(packet(1, now));

        let (size, _, _, frames) = history.declare_lost(PacketNumber::new(0)).unwrap();
        assert_eq!(size, 1000);
        assert_eq!(frames.len(), 1);
        assert_eq!(history.num_outstanding(), 1);
        assert!(matches!(history.get(PacketNumber::new(0)), Some(HistoryEntry::Lost { .. })));
        assert_eq!(history.first_outstanding().map(|p| p.pn), Some(PacketNumber::new(1)));

        // a tombstone cannot be lost twice
        assert!(history.declare_lost(PacketNumber::new(0)).is_none());
    }

    #[test]
    fn test_skipped_entries_expire() {
        let start = Instant::now();
        let mut history = SentPacketHistory::new();
        history.sent_packet(packet(0, start));
        history.skipped_packet(PacketNumber::new(1));
        assert!(history.is_skipped(PacketNumber::new(1)));

        // not timestamped until the next packet is sent
        history.delete_old_entries(start + Duration::from_secs(10));
        assert!(history.is_skipped(PacketNumber::new(1)));

        history.sent_packet(packet(2, start + Duration::from_millis(5)));
        history.delete_old_entries(start + Duration::from_secs(10));
        assert!(!history.is_skipped(PacketNumber::new(1)));
        assert_eq!(history.num_outstanding(), 2);
    }

    #[test]
    fn test_remove_level() {
        let now = Instant::now();
        let mut history = SentPacketHistory::new();
        let mut early = packet(0, now);
        early.level = EncryptionLevel::ZeroRtt;
        history.sent_packet(early);
        history.sent_packet(packet(1, now));

        assert_eq!(history.remove_level(EncryptionLevel::ZeroRtt), 1000);
        assert_eq!(history.num_outstanding(), 1);
        assert!(history.get(PacketNumber::new(0)).is_none());
    }
}
