//! Received packet numbers of one packet number space
//!
//! Stored as ascending, non-adjacent intervals. Packet numbers below the
//! deletion bound are treated as already received.

use crate::ack::AckRange;
use crate::packet_number::PacketNumber;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Interval {
    start: u64,
    end: u64,
}

/// Set of received packet numbers used for duplicate detection and ACK ranges
#[derive(Debug, Clone)]
pub struct ReceivedPacketHistory {
    ranges: VecDeque<Interval>,
    deleted_below: u64,
    max_ranges: usize,
}

impl ReceivedPacketHistory {
    /// History keeping at most `max_ranges` intervals; the oldest are dropped first
    pub fn new(max_ranges: usize) -> Self {
        ReceivedPacketHistory {
            ranges: VecDeque::new(),
            deleted_below: 0,
            max_ranges: max_ranges.max(1),
        }
    }

    /// Record a packet number. Returns false if it was already received or is below the deletion bound.
    pub fn received_packet(&mut self, pn: PacketNumber) -> bool {
        let pn = pn.as_u64();
        if pn < self.deleted_below {
            return false;
        }

        let is_new = self.insert(pn);
        if is_new {
            while self.ranges.len() > self.max_ranges {
                if let Some(oldest) = self.ranges.pop_front() {
                    self.deleted_below = oldest.end + 1;
                }
            }
        }
        is_new
    }

    fn insert(&mut self, pn: u64) -> bool {
        // packets mostly arrive in order, so search from the back
        let mut idx = self.ranges.len();
        while idx > 0 {
            let range = self.ranges[idx - 1];
            if pn >= range.start && pn <= range.end {
                return false;
            }
            if pn == range.end + 1 {
                self.ranges[idx - 1].end = pn;
                self.merge_with_next(idx - 1);
                return true;
            }
            if pn > range.end {
                break;
            }
            if pn + 1 == range.start {
                self.ranges[idx - 1].start = pn;
                if idx >= 2 {
                    self.merge_with_next(idx - 2);
                }
                return true;
            }
            idx -= 1;
        }
        self.ranges.insert(idx, Interval { start: pn, end: pn });
        true
    }

    fn merge_with_next(&mut self, idx: usize) {
        let Some(&next) = self.ranges.get(idx + 1) else {
            return;
        };
        if self.ranges[idx].end + 1 == next.start {
            self.ranges[idx].end = next.end;
            self.ranges.remove(idx + 1);
        }
    }

    /// Forget all packet numbers below `pn`
    pub fn delete_below(&mut self, pn: PacketNumber) {
        let pn = pn.as_u64();
        if pn <= self.deleted_below {
            return;
        }
        self.deleted_below = pn;
        while let Some(first) = self.ranges.front_mut() {
            if first.end < pn {
                self.ranges.pop_front();
            } else {
                first.start = first.start.max(pn);
                break;
            }
        }
    }

    /// Received or below the deletion bound
    pub fn is_potentially_duplicate(&self, pn: PacketNumber) -> bool {
        let pn = pn.as_u64();
        if pn < self.deleted_below {
            return true;
        }
        self.ranges
            .iter()
            .rev()
            .take_while(|r| r.end >= pn)
            .any(|r| r.start <= pn)
    }

    /// ACK ranges in descending order
    pub fn ack_ranges(&self) -> Vec<AckRange> {
        self.ranges
            .iter()
            .rev()
            .map(|r| AckRange::new(r.start, r.end))
            .collect()
    }

    /// Highest received range
    pub fn highest_range(&self) -> Option<AckRange> {
        self.ranges.back().map(|r| AckRange::new(r.start, r.end))
    }

    pub fn deleted_below(&self) -> PacketNumber {
        PacketNumber::new(self.deleted_below)
    }

    pub fn num_ranges(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pn(v: u64) -> PacketNumber {
        PacketNumber::new(v)
    }

    fn history_of(pns: &[u64]) -> ReceivedPacketHistory {
        let mut history = ReceivedPacketHistory::new(32);
        for &v in pns {
            history.received_packet(pn(v));
        }
        history
    }

    #[test]
    fn test_in_order_single_range() {
        let history = history_of(&[0, 1, 2, 3]);
        assert_eq!(history.ack_ranges(), vec![AckRange::new(0u64, 3u64)]);
    }

    #[test]
    fn test_gaps_and_fill() {
        let mut history = history_of(&[1, 2, 5, 9, 7]);
        assert_eq!(
            history.ack_ranges(),
            vec![
                AckRange::single(9u64),
                AckRange::single(7u64),
                AckRange::single(5u64),
                AckRange::new(1u64, 2u64),
            ]
        );

        assert!(history.received_packet(pn(8)));
        assert!(history.received_packet(pn(6)));
        assert_eq!(
            history.ack_ranges(),
            vec![AckRange::new(5u64, 9u64), AckRange::new(1u64, 2u64)]
        );

        // filling the last gap merges from below
        assert!(history.received_packet(pn(4)));
        assert!(history.received_packet(pn(3)));
        assert_eq!(history.ack_ranges(), vec![AckRange::new(1u64, 9u64)]);
    }

    #[test]
    fn test_duplicates() {
        let mut history = history_of(&[3, 4, 10]);
        assert!(!history.received_packet(pn(4)));
        assert!(!history.received_packet(pn(10)));
        assert!(history.is_potentially_duplicate(pn(3)));
        assert!(!history.is_potentially_duplicate(pn(5)));
        assert!(!history.is_potentially_duplicate(pn(11)));
    }

    #[test]
    fn test_insert_before_all() {
        let history = history_of(&[10, 5]);
        assert_eq!(
            history.ack_ranges(),
            vec![AckRange::single(10u64), AckRange::single(5u64)]
        );
    }

    #[test]
    fn test_delete_below() {
        let mut history = history_of(&[1, 2, 3, 6, 7, 10]);
        history.delete_below(pn(7));
        assert_eq!(
            history.ack_ranges(),
            vec![AckRange::single(10u64), AckRange::single(7u64)]
        );
        assert!(history.is_potentially_duplicate(pn(2)));
        assert!(!history.received_packet(pn(4)));

        // lowering the bound is ignored
        history.delete_below(pn(2));
        assert_eq!(history.deleted_below(), pn(7));
    }

    #[test]
    fn test_range_cap_drops_oldest() {
        let mut history = ReceivedPacketHistory::new(2);
        for v in [0, 2, 4] {
            history.received_packet(pn(v));
        }
        assert_eq!(history.num_ranges(), 2);
        assert_eq!(
            history.ack_ranges(),
            vec![AckRange::single(4u64), AckRange::single(2u64)]
        );
        // dropped packets count as duplicates
        assert!(history.is_potentially_duplicate(pn(0)));
        assert!(!history.received_packet(pn(1)));
    }
}
