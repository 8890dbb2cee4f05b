//! ACK frame contents
//!
//! An [`AckFrame`] is the parsed form of a QUIC ACK frame (RFC 9000 §19.3):
//! strictly descending, non-overlapping packet number ranges, the peer's ack
//! delay and optional ECN counts. Bit-level encoding is left to the frame
//! codec; [`GapEncodedRanges`] provides the gap/length form the codec writes.

use crate::packet_number::PacketNumber;
use std::time::Duration;

/// Inclusive packet number interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckRange {
    /// Smallest packet number in the range
    pub smallest: PacketNumber,
    /// Largest packet number in the range (inclusive)
    pub largest: PacketNumber,
}

impl AckRange {
    /// Create a new range
    ///
    /// # Panics
    /// Panics if `smallest > largest`
    pub fn new(smallest: impl Into<PacketNumber>, largest: impl Into<PacketNumber>) -> Self {
        let smallest = smallest.into();
        let largest = largest.into();
        assert!(smallest <= largest, "invalid ack range [{smallest}, {largest}]");
        AckRange { smallest, largest }
    }

    /// Create a single-packet range
    pub fn single(pn: impl Into<PacketNumber>) -> Self {
        let pn = pn.into();
        AckRange {
            smallest: pn,
            largest: pn,
        }
    }

    /// Check if this range contains a packet number
    pub fn contains(&self, pn: PacketNumber) -> bool {
        pn >= self.smallest && pn <= self.largest
    }

    /// Number of packet numbers in the range
    pub fn len(&self) -> u64 {
        self.largest.distance_from(self.smallest) + 1
    }

    /// Ranges are never empty
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// ECN counts carried in an ACK frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ce: u64,
}

/// Parsed ACK frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    /// Ranges in descending order, separated by at least one missing packet
    pub ranges: Vec<AckRange>,
    /// Time the peer held the largest acknowledged packet before acknowledging it
    pub ack_delay: Duration,
    /// ECN counts, if the peer reports them
    pub ecn: Option<EcnCounts>,
}

impl AckFrame {
    /// Create an ACK frame from descending ranges
    pub fn new(ranges: Vec<AckRange>, ack_delay: Duration) -> Self {
        AckFrame {
            ranges,
            ack_delay,
            ecn: None,
        }
    }

    /// Attach ECN counts
    pub fn with_ecn(mut self, ecn: EcnCounts) -> Self {
        self.ecn = Some(ecn);
        self
    }

    /// Build a frame acknowledging an arbitrary set of packet numbers.
    ///
    /// Duplicates are ignored and adjacent numbers are coalesced.
    pub fn from_packet_numbers<I>(pns: I, ack_delay: Duration) -> Self
    where
        I: IntoIterator<Item = PacketNumber>,
    {
        let mut pns: Vec<PacketNumber> = pns.into_iter().collect();
        pns.sort_unstable_by(|a, b| b.cmp(a));
        pns.dedup();

        let mut ranges: Vec<AckRange> = Vec::new();
        for pn in pns {
            match ranges.last_mut() {
                Some(last) if last.smallest.as_u64() == pn.as_u64() + 1 => last.smallest = pn,
                _ => ranges.push(AckRange::single(pn)),
            }
        }

        AckFrame::new(ranges, ack_delay)
    }

    /// Largest acknowledged packet number
    pub fn largest_acked(&self) -> Option<PacketNumber> {
        self.ranges.first().map(|r| r.largest)
    }

    /// Smallest acknowledged packet number
    pub fn lowest_acked(&self) -> Option<PacketNumber> {
        self.ranges.last().map(|r| r.smallest)
    }

    /// Check whether the frame acknowledges a packet number
    pub fn acks_packet(&self, pn: PacketNumber) -> bool {
        match (self.lowest_acked(), self.largest_acked()) {
            (Some(lowest), Some(largest)) if pn >= lowest && pn <= largest => {}
            _ => return false,
        }
        // ranges are descending: find the first range whose smallest is <= pn
        let idx = self.ranges.partition_point(|r| r.smallest > pn);
        self.ranges.get(idx).is_some_and(|r| r.contains(pn))
    }

    /// Check the range invariants: non-empty, descending, not overlapping or adjacent
    pub fn is_valid(&self) -> bool {
        if self.ranges.is_empty() {
            return false;
        }
        self.ranges.iter().all(|r| r.smallest <= r.largest)
            && self
                .ranges
                .windows(2)
                .all(|w| w[1].largest.as_u64() + 1 < w[0].smallest.as_u64())
    }

    /// Whether the frame carries more than one range
    pub fn has_missing_ranges(&self) -> bool {
        self.ranges.len() > 1
    }

    /// Convert to the gap/length form written on the wire
    pub fn to_gap_encoding(&self) -> Option<GapEncodedRanges> {
        if !self.is_valid() {
            return None;
        }
        let first = self.ranges[0];
        let mut ranges = Vec::with_capacity(self.ranges.len() - 1);
        let mut prev_smallest = first.smallest.as_u64();
        for range in &self.ranges[1..] {
            let largest = range.largest.as_u64();
            ranges.push((
                prev_smallest - largest - 2,
                largest - range.smallest.as_u64(),
            ));
            prev_smallest = range.smallest.as_u64();
        }
        Some(GapEncodedRanges {
            largest: first.largest.as_u64(),
            first_range: first.len() - 1,
            ranges,
        })
    }

    /// Rebuild the ranges from the gap/length form
    ///
    /// Returns `None` if the encoding would underflow packet number zero.
    pub fn from_gap_encoding(encoded: &GapEncodedRanges, ack_delay: Duration) -> Option<Self> {
        let mut smallest = encoded.largest.checked_sub(encoded.first_range)?;
        let mut ranges = Vec::with_capacity(encoded.ranges.len() + 1);
        ranges.push(AckRange::new(smallest, encoded.largest));

        for &(gap, len) in &encoded.ranges {
            let largest = smallest.checked_sub(gap)?.checked_sub(2)?;
            smallest = largest.checked_sub(len)?;
            ranges.push(AckRange::new(smallest, largest));
        }

        Some(AckFrame::new(ranges, ack_delay))
    }
}

/// ACK ranges in the RFC 9000 §19.3.1 gap/length representation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapEncodedRanges {
    /// Largest Acknowledged
    pub largest: u64,
    /// First ACK Range: packets below `largest` in the first range
    pub first_range: u64,
    /// (Gap, ACK Range Length) pairs
    pub ranges: Vec<(u64, u64)>,
}
