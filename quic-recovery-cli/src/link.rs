//! One direction of a simulated network path
//!
//! Datagrams are serialized at the bottleneck rate, then delayed by the
//! propagation delay plus uniform jitter. Jitter larger than the serialization
//! time reorders datagrams. Drops are independent with a fixed probability.

use crate::config::LinkConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// Counters of one link direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub datagrams_sent: u64,
    pub datagrams_dropped: u64,
    pub datagrams_delivered: u64,
    pub bytes_sent: u64,
}

struct InTransit<T> {
    arrival: Instant,
    /// Send order, to break ties between equal arrival times
    seq: u64,
    payload: T,
}

impl<T> PartialEq for InTransit<T> {
    fn eq(&self, other: &Self) -> bool {
        self.arrival == other.arrival && self.seq == other.seq
    }
}

impl<T> Eq for InTransit<T> {}

impl<T> PartialOrd for InTransit<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for InTransit<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.arrival, self.seq).cmp(&(other.arrival, other.seq))
    }
}

/// Lossy, delaying, reordering link carrying values of type `T`
pub struct Link<T> {
    delay: Duration,
    jitter: Duration,
    loss_rate: f64,
    bandwidth_bps: u64,
    rng: StdRng,
    /// The bottleneck is busy serializing until then
    busy_until: Option<Instant>,
    queue: BinaryHeap<Reverse<InTransit<T>>>,
    next_seq: u64,
    stats: LinkStats,
}

impl<T> Link<T> {
    /// Link seeded with `seed_offset` added to the configured seed, so both directions differ
    pub fn new(config: &LinkConfig, seed_offset: u64) -> Self {
        Link {
            delay: config.delay(),
            jitter: config.jitter(),
            loss_rate: config.loss_rate,
            bandwidth_bps: config.bandwidth_kbps.saturating_mul(1000),
            rng: StdRng::seed_from_u64(config.seed.wrapping_add(seed_offset)),
            busy_until: None,
            queue: BinaryHeap::new(),
            next_seq: 0,
            stats: LinkStats::default(),
        }
    }

    /// Put a datagram of `size` bytes on the link at `now`
    pub fn send(&mut self, now: Instant, size: u64, payload: T) {
        self.stats.datagrams_sent += 1;
        self.stats.bytes_sent += size;

        let start = self.busy_until.map_or(now, |busy| busy.max(now));
        let departure = start + self.serialization_time(size);
        self.busy_until = Some(departure);

        if self.loss_rate > 0.0 && self.rng.gen_bool(self.loss_rate) {
            self.stats.datagrams_dropped += 1;
            return;
        }

        let jitter = if self.jitter.is_zero() {
            Duration::ZERO
        } else {
            self.jitter.mul_f64(self.rng.gen::<f64>())
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Reverse(InTransit {
            arrival: departure + self.delay + jitter,
            seq,
            payload,
        }));
    }

    /// Take the next datagram that has arrived by `now`
    pub fn poll(&mut self, now: Instant) -> Option<T> {
        match self.queue.peek() {
            Some(Reverse(next)) if next.arrival <= now => {}
            _ => return None,
        }
        let Reverse(datagram) = self.queue.pop()?;
        self.stats.datagrams_delivered += 1;
        Some(datagram.payload)
    }

    /// Arrival time of the next datagram in transit
    pub fn next_arrival(&self) -> Option<Instant> {
        self.queue.peek().map(|Reverse(next)| next.arrival)
    }

    pub fn in_transit(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    fn serialization_time(&self, size: u64) -> Duration {
        if self.bandwidth_bps == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(size * 8 * 1_000_000_000 / self.bandwidth_bps)
    }
}
