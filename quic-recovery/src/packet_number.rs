//! Packet numbers, encryption levels and packet number spaces
//!
//! QUIC packet numbers are 62-bit integers that never wrap within a
//! connection. Each packet number space (Initial, Handshake, application data)
//! numbers its packets independently, strictly increasing from zero.

use rand::Rng;
use std::fmt;
use std::ops::{Add, Sub};

/// Largest valid packet number (2^62 - 1)
pub const MAX_PACKET_NUMBER: u64 = (1 << 62) - 1;

/// Initial period between two skipped packet numbers
pub const SKIP_PACKET_INITIAL_PERIOD: u64 = 256;

/// Maximum period between two skipped packet numbers
pub const SKIP_PACKET_MAX_PERIOD: u64 = 128 * 1024;

/// A QUIC packet number
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct PacketNumber(u64);

impl PacketNumber {
    /// Create a new packet number
    ///
    /// # Panics
    /// Panics if value exceeds MAX_PACKET_NUMBER
    pub fn new(value: u64) -> Self {
        assert!(
            value <= MAX_PACKET_NUMBER,
            "Packet number {} exceeds maximum {}",
            value,
            MAX_PACKET_NUMBER
        );
        PacketNumber(value)
    }

    /// Get the raw packet number value
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Get the next packet number
    #[inline]
    pub fn next(self) -> Self {
        PacketNumber(self.0 + 1)
    }

    /// Number of packets between `self` and a smaller packet number.
    #[inline]
    pub fn distance_from(self, lower: PacketNumber) -> u64 {
        self.0.saturating_sub(lower.0)
    }
}

impl fmt::Debug for PacketNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketNumber({})", self.0)
    }
}

impl fmt::Display for PacketNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PacketNumber {
    fn from(value: u64) -> Self {
        PacketNumber::new(value)
    }
}

impl From<PacketNumber> for u64 {
    fn from(pn: PacketNumber) -> u64 {
        pn.0
    }
}

impl Add<u64> for PacketNumber {
    type Output = PacketNumber;

    fn add(self, rhs: u64) -> PacketNumber {
        PacketNumber(self.0 + rhs)
    }
}

impl Sub<u64> for PacketNumber {
    type Output = PacketNumber;

    fn sub(self, rhs: u64) -> PacketNumber {
        PacketNumber(self.0.saturating_sub(rhs))
    }
}

/// Encryption level a packet was sent or received at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionLevel {
    Initial,
    Handshake,
    ZeroRtt,
    OneRtt,
}

impl EncryptionLevel {
    /// The packet number space packets at this level are numbered in.
    pub fn space(self) -> PacketNumberSpace {
        match self {
            EncryptionLevel::Initial => PacketNumberSpace::Initial,
            EncryptionLevel::Handshake => PacketNumberSpace::Handshake,
            EncryptionLevel::ZeroRtt | EncryptionLevel::OneRtt => PacketNumberSpace::ApplicationData,
        }
    }
}

impl fmt::Display for EncryptionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EncryptionLevel::Initial => "Initial",
            EncryptionLevel::Handshake => "Handshake",
            EncryptionLevel::ZeroRtt => "0-RTT",
            EncryptionLevel::OneRtt => "1-RTT",
        };
        f.write_str(name)
    }
}

/// Independent packet numbering and acknowledgment domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketNumberSpace {
    Initial,
    Handshake,
    ApplicationData,
}

impl PacketNumberSpace {
    /// All spaces, in handshake order.
    pub const ALL: [PacketNumberSpace; 3] = [
        PacketNumberSpace::Initial,
        PacketNumberSpace::Handshake,
        PacketNumberSpace::ApplicationData,
    ];
}

/// Role of the local endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perspective {
    Client,
    Server,
}

/// Packet number generator for one packet number space
///
/// The sequential variant hands out consecutive numbers. The skipping variant
/// leaves out one packet number at a random position within a period that
/// doubles up to [`SKIP_PACKET_MAX_PERIOD`]; an ACK for a skipped number
/// proves the peer is acknowledging packets it never received.
#[derive(Debug, Clone)]
pub struct PacketNumberGenerator {
    next: u64,
    skip: Option<SkipState>,
}

#[derive(Debug, Clone)]
struct SkipState {
    period: u64,
    max_period: u64,
    next_to_skip: u64,
}

impl PacketNumberGenerator {
    /// Generator handing out consecutive numbers starting at `initial`
    pub fn sequential(initial: PacketNumber) -> Self {
        PacketNumberGenerator {
            next: initial.as_u64(),
            skip: None,
        }
    }

    /// Generator that occasionally skips a packet number
    pub fn skipping(initial: PacketNumber, initial_period: u64, max_period: u64) -> Self {
        let mut skip = SkipState {
            period: initial_period.max(1),
            max_period: max_period.max(1),
            next_to_skip: 0,
        };
        skip.generate_new_skip(initial.as_u64());
        PacketNumberGenerator {
            next: initial.as_u64(),
            skip: Some(skip),
        }
    }

    /// Packet number the next call to [`pop`](Self::pop) will return
    pub fn peek(&self) -> PacketNumber {
        match &self.skip {
            Some(skip) if skip.next_to_skip == self.next => PacketNumber(self.next + 1),
            _ => PacketNumber(self.next),
        }
    }

    /// Take the next packet number. The flag is true if a number was skipped.
    pub fn pop(&mut self) -> (bool, PacketNumber) {
        let current = self.next;
        if let Some(skip) = self.skip.as_mut() {
            if skip.next_to_skip == current {
                self.next += 2;
                skip.generate_new_skip(self.next);
                return (true, PacketNumber(current + 1));
            }
        }
        self.next += 1;
        (false, PacketNumber(current))
    }
}

impl SkipState {
    fn generate_new_skip(&mut self, next: u64) {
        // never skip two consecutive packet numbers
        let offset = rand::thread_rng().gen_range(0..2 * self.period);
        self.next_to_skip = next + 3 + offset;
        self.period = (2 * self.period).min(self.max_period);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new() {
        let pn = PacketNumber::new(100);
        assert_eq!(pn.as_u64(), 100);
        assert_eq!(pn.next().as_u64(), 101);
    }

    #[test]
    #[should_panic]
    fn test_new_overflow() {
        PacketNumber::new(MAX_PACKET_NUMBER + 1);
    }

    #[test]
    fn test_arithmetic() {
        let pn = PacketNumber::new(10);
        assert_eq!((pn + 5).as_u64(), 15);
        assert_eq!((pn - 3).as_u64(), 7);
        assert_eq!((pn - 30).as_u64(), 0);
        assert_eq!(pn.distance_from(PacketNumber::new(4)), 6);
        assert_eq!(PacketNumber::new(4).distance_from(pn), 0);
    }

    #[test]
    fn test_level_spaces() {
        assert_eq!(EncryptionLevel::Initial.space(), PacketNumberSpace::Initial);
        assert_eq!(EncryptionLevel::Handshake.space(), PacketNumberSpace::Handshake);
        assert_eq!(EncryptionLevel::ZeroRtt.space(), PacketNumberSpace::ApplicationData);
        assert_eq!(EncryptionLevel::OneRtt.space(), PacketNumberSpace::ApplicationData);
    }

    #[test]
    fn test_sequential_generator() {
        let mut gen = PacketNumberGenerator::sequential(PacketNumber::new(5));
        assert_eq!(gen.peek(), PacketNumber::new(5));
        assert_eq!(gen.pop(), (false, PacketNumber::new(5)));
        assert_eq!(gen.pop(), (false, PacketNumber::new(6)));
        assert_eq!(gen.peek(), PacketNumber::new(7));
    }

    #[test]
    fn test_skipping_generator_skips() {
        let mut gen = PacketNumberGenerator::skipping(PacketNumber::new(0), 4, 16);
        let mut last = None;
        let mut skipped = 0;

        for _ in 0..1000 {
            let peeked = gen.peek();
            let (did_skip, pn) = gen.pop();
            assert_eq!(peeked, pn);
            if let Some(prev) = last {
                let gap = pn.distance_from(prev);
                if did_skip {
                    assert_eq!(gap, 2);
                    skipped += 1;
                } else {
                    assert_eq!(gap, 1);
                }
            }
            last = Some(pn);
        }

        assert!(skipped > 0);
    }
}
