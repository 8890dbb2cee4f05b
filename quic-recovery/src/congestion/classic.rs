//! Window based congestion control shared by NewReno and CUBIC
//!
//! Slow start, recovery periods and persistent congestion are common to both
//! algorithms; only the congestion avoidance growth rate and the
//! multiplicative decrease differ, supplied by a [`WindowAdjustment`].

use super::pacer::{Pacer, MAX_BURST_PACKETS};
use super::{
    initial_window, minimum_window, AckedPacket, CongestionController, CongestionStats, LostPacket,
};
use crate::packet_number::PacketNumber;
use crate::rtt::SharedRttStats;
use std::fmt;
use std::time::{Duration, Instant};

/// Growth and decrease policy of a congestion avoidance algorithm
pub trait WindowAdjustment: fmt::Debug + Send {
    /// Acknowledged bytes needed before the window grows by one datagram
    fn bytes_for_cwnd_increase(
        &mut self,
        cwnd: u64,
        new_acked: u64,
        min_rtt: Duration,
        max_datagram_size: u64,
        now: Instant,
    ) -> u64;

    /// Reduced window and acked-bytes credit after a congestion event.
    /// The caller enforces the minimum window.
    fn reduce_cwnd(&mut self, cwnd: u64, acked_bytes: u64, max_datagram_size: u64) -> (u64, u64);

    /// The sender did not use the window it had
    fn on_app_limited(&mut self);

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SlowStart,
    CongestionAvoidance,
    /// Recovery entered, no packet sent since
    RecoveryStart,
    Recovery,
    /// Persistent congestion declared, no packet sent since
    PersistentCongestion,
}

impl State {
    fn in_recovery(self) -> bool {
        matches!(self, State::RecoveryStart | State::Recovery)
    }

    fn transient(self) -> bool {
        matches!(self, State::RecoveryStart | State::PersistentCongestion)
    }
}

pub struct ClassicController<W> {
    algorithm: W,
    state: State,
    congestion_window: u64,
    bytes_in_flight: u64,
    acked_bytes: u64,
    ssthresh: u64,
    recovery_start: Option<Instant>,
    max_datagram_size: u64,
    pacer: Option<Pacer>,
    rtt: SharedRttStats,
}

impl<W: WindowAdjustment> ClassicController<W> {
    pub fn new(algorithm: W, max_datagram_size: u64, pacing: bool, rtt: SharedRttStats) -> Self {
        ClassicController {
            algorithm,
            state: State::SlowStart,
            congestion_window: initial_window(max_datagram_size),
            bytes_in_flight: 0,
            acked_bytes: 0,
            ssthresh: u64::MAX,
            recovery_start: None,
            max_datagram_size,
            pacer: pacing.then(|| Pacer::new(max_datagram_size)),
            rtt,
        }
    }

    pub fn slow_start_threshold(&self) -> u64 {
        self.ssthresh
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            tracing::debug!(algorithm = self.algorithm.name(), from = ?self.state, to = ?state, "congestion state");
            self.state = state;
        }
    }

    fn after_recovery_start(&self, sent_time: Instant) -> bool {
        !self.state.transient() && self.recovery_start.map_or(true, |start| sent_time >= start)
    }

    /// Enter recovery unless the packet was sent before the current recovery period
    fn on_congestion_event(&mut self, sent_time: Instant) -> bool {
        if !self.after_recovery_start(sent_time) {
            return false;
        }

        let (cwnd, acked_bytes) =
            self.algorithm
                .reduce_cwnd(self.congestion_window, self.acked_bytes, self.max_datagram_size);
        self.congestion_window = cwnd.max(minimum_window(self.max_datagram_size));
        self.acked_bytes = acked_bytes;
        self.ssthresh = self.congestion_window;
        tracing::debug!(
            algorithm = self.algorithm.name(),
            cwnd = self.congestion_window,
            ssthresh = self.ssthresh,
            "congestion event"
        );
        self.set_state(State::RecoveryStart);
        true
    }

    fn app_limited(&self) -> bool {
        if self.bytes_in_flight >= self.congestion_window {
            false
        } else if self.state == State::SlowStart {
            // leave room for the window to double
            self.bytes_in_flight < self.congestion_window / 2
        } else {
            self.bytes_in_flight + self.max_datagram_size * MAX_BURST_PACKETS < self.congestion_window
        }
    }

    /// Pacing rate in bytes per second: 1.25 * cwnd / smoothed RTT
    fn pacing_rate(&self) -> u64 {
        let srtt = self.rtt.read().smoothed_rtt().as_nanos();
        if srtt == 0 {
            return u64::MAX;
        }
        let rate = u128::from(self.congestion_window) * 1_000_000_000 / srtt;
        (rate * 5 / 4).min(u128::from(u64::MAX)) as u64
    }
}

impl<W: WindowAdjustment> CongestionController for ClassicController<W> {
    fn on_packet_sent(&mut self, sent_time: Instant, pn: PacketNumber, bytes: u64, in_flight: bool) {
        if self.state.transient() {
            self.recovery_start = Some(sent_time);
            let next = match self.state {
                State::RecoveryStart => State::Recovery,
                _ => State::SlowStart,
            };
            self.set_state(next);
        }

        if !in_flight {
            return;
        }

        self.bytes_in_flight += bytes;
        let rate = self.pacing_rate();
        if let Some(pacer) = self.pacer.as_mut() {
            pacer.on_packet_sent(sent_time, bytes, rate);
        }
        tracing::trace!(%pn, bytes, in_flight = self.bytes_in_flight, cwnd = self.congestion_window, "cc packet sent");
    }

    fn on_packets_acked(&mut self, acked: &[AckedPacket], _rtt_sample: Option<Duration>, now: Instant) {
        let is_app_limited = self.app_limited();

        let mut new_acked = 0;
        for packet in acked {
            self.bytes_in_flight = self.bytes_in_flight.saturating_sub(packet.bytes);

            // packets sent before recovery started do not grow the window
            if !self.after_recovery_start(packet.sent_time) {
                continue;
            }
            if self.state.in_recovery() {
                self.set_state(State::CongestionAvoidance);
            }
            new_acked += packet.bytes;
        }

        if is_app_limited {
            self.algorithm.on_app_limited();
            return;
        }

        if self.congestion_window < self.ssthresh {
            self.acked_bytes += new_acked;
            let increase = (self.ssthresh - self.congestion_window).min(self.acked_bytes);
            self.congestion_window += increase;
            self.acked_bytes -= increase;
            if self.congestion_window == self.ssthresh {
                self.set_state(State::CongestionAvoidance);
            }
        }

        if self.congestion_window >= self.ssthresh {
            let min_rtt = self.rtt.read().min_rtt();
            let bytes_for_increase = self
                .algorithm
                .bytes_for_cwnd_increase(
                    self.congestion_window,
                    new_acked,
                    min_rtt,
                    self.max_datagram_size,
                    now,
                )
                .max(1);
            if self.acked_bytes >= bytes_for_increase {
                self.acked_bytes = 0;
                self.congestion_window += self.max_datagram_size;
            }
            self.acked_bytes += new_acked;
            if self.acked_bytes >= bytes_for_increase {
                self.acked_bytes -= bytes_for_increase;
                self.congestion_window += self.max_datagram_size;
            }
            // bound unused credit so a shrinking requirement cannot cause a burst of growth
            self.acked_bytes = self.acked_bytes.min(bytes_for_increase);
        }
    }

    fn on_packets_lost(&mut self, lost: &[LostPacket], _now: Instant) {
        let Some(last) = lost.iter().max_by_key(|p| p.sent_time) else {
            return;
        };
        let last_sent = last.sent_time;
        for packet in lost {
            self.bytes_in_flight = self.bytes_in_flight.saturating_sub(packet.bytes);
        }
        tracing::debug!(lost = lost.len(), in_flight = self.bytes_in_flight, "cc packets lost");
        self.on_congestion_event(last_sent);
    }

    fn on_persistent_congestion(&mut self, _now: Instant) {
        tracing::debug!(algorithm = self.algorithm.name(), "persistent congestion");
        self.congestion_window = minimum_window(self.max_datagram_size);
        self.acked_bytes = 0;
        self.set_state(State::PersistentCongestion);
    }

    fn on_ecn_congestion(&mut self, sent_time: Instant, _now: Instant) {
        self.on_congestion_event(sent_time);
    }

    fn on_pto_expired(&mut self, _now: Instant) {
        tracing::trace!(cwnd = self.congestion_window, "cc pto expired");
    }

    fn on_packets_discarded(&mut self, bytes: u64) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
    }

    fn time_until_send(&self, now: Instant) -> Option<Instant> {
        if self.congestion_window_remaining() == 0 {
            return None;
        }
        let next = self
            .pacer
            .as_ref()
            .and_then(|pacer| pacer.next_send_time(self.pacing_rate()));
        Some(next.map_or(now, |t| t.max(now)))
    }

    fn has_pacing_budget(&self, now: Instant) -> bool {
        match &self.pacer {
            Some(pacer) => pacer.budget(now, self.pacing_rate()) >= self.max_datagram_size,
            None => true,
        }
    }

    fn congestion_window(&self) -> u64 {
        self.congestion_window
    }

    fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    fn in_slow_start(&self) -> bool {
        self.state == State::SlowStart
    }

    fn in_recovery(&self) -> bool {
        self.state.in_recovery()
    }

    fn set_max_datagram_size(&mut self, size: u64) {
        if size < self.max_datagram_size {
            return;
        }
        let grow_window = self.congestion_window == initial_window(self.max_datagram_size);
        self.max_datagram_size = size;
        if grow_window {
            self.congestion_window = initial_window(size);
        }
        self.congestion_window = self.congestion_window.max(minimum_window(size));
        if let Some(pacer) = self.pacer.as_mut() {
            pacer.set_max_datagram_size(size);
        }
    }

    fn stats(&self) -> CongestionStats {
        CongestionStats {
            congestion_window: self.congestion_window,
            bytes_in_flight: self.bytes_in_flight,
            slow_start_threshold: self.ssthresh,
            in_slow_start: self.in_slow_start(),
            in_recovery: self.in_recovery(),
        }
    }
}

impl<W: WindowAdjustment> fmt::Debug for ClassicController<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassicController")
            .field("algorithm", &self.algorithm)
            .field("state", &self.state)
            .field("congestion_window", &self.congestion_window)
            .field("bytes_in_flight", &self.bytes_in_flight)
            .field("ssthresh", &self.ssthresh)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion::{Cubic, NewReno};
    use crate::rtt::RttStats;

    const MDS: u64 = 1200;

    fn new_reno() -> ClassicController<NewReno> {
        ClassicController::new(NewReno::default(), MDS, false, RttStats::default().into_shared())
    }

    fn send(cc: &mut impl CongestionController, pn: u64, at: Instant) {
        cc.on_packet_sent(at, PacketNumber::new(pn), MDS, true);
    }

    fn acked(pn: u64, sent_time: Instant) -> AckedPacket {
        AckedPacket {
            pn: PacketNumber::new(pn),
            bytes: MDS,
            sent_time,
        }
    }

    fn lost(pn: u64, sent_time: Instant) -> LostPacket {
        LostPacket {
            pn: PacketNumber::new(pn),
            bytes: MDS,
            sent_time,
        }
    }

    /// Fill the window so acknowledgments are not treated as app limited
    fn fill_window(cc: &mut impl CongestionController, first_pn: u64, at: Instant) -> u64 {
        let mut pn = first_pn;
        while cc.congestion_window_remaining() > 0 {
            send(cc, pn, at);
            pn += 1;
        }
        pn
    }

    #[test]
    fn test_slow_start_growth() {
        let start = Instant::now();
        let mut cc = new_reno();
        let initial = cc.congestion_window();

        let next = fill_window(&mut cc, 0, start);
        let acks: Vec<_> = (0..next).map(|pn| acked(pn, start)).collect();
        cc.on_packets_acked(&acks, None, start + Duration::from_millis(50));

        assert_eq!(cc.congestion_window(), initial + next * MDS);
        assert_eq!(cc.bytes_in_flight(), 0);
        assert!(cc.in_slow_start());
    }

    #[test]
    fn test_app_limited_does_not_grow() {
        let start = Instant::now();
        let mut cc = new_reno();
        let initial = cc.congestion_window();

        send(&mut cc, 0, start);
        cc.on_packets_acked(&[acked(0, start)], None, start + Duration::from_millis(50));

        assert_eq!(cc.congestion_window(), initial);
    }

    #[test]
    fn test_loss_halves_window_once_per_period() {
        let start = Instant::now();
        let mut cc = new_reno();
        let initial = cc.congestion_window();

        let next = fill_window(&mut cc, 0, start);
        let later = start + Duration::from_millis(100);
        cc.on_packets_lost(&[lost(0, start)], later);
        assert_eq!(cc.congestion_window(), initial / 2);
        assert!(cc.in_recovery());

        // more losses from before the recovery period do not reduce again
        send(&mut cc, next, later);
        cc.on_packets_lost(&[lost(1, start)], later);
        assert_eq!(cc.congestion_window(), initial / 2);
        assert_eq!(cc.slow_start_threshold(), initial / 2);
    }

    #[test]
    fn test_recovery_exit_on_ack_of_new_packet() {
        let start = Instant::now();
        let mut cc = new_reno();

        let next = fill_window(&mut cc, 0, start);
        let later = start + Duration::from_millis(100);
        cc.on_packets_lost(&[lost(0, start)], later);
        send(&mut cc, next, later);

        cc.on_packets_acked(&[acked(next, later)], None, later + Duration::from_millis(50));
        assert!(!cc.in_recovery());
    }

    #[test]
    fn test_window_never_below_minimum() {
        let start = Instant::now();
        let mut cc = new_reno();

        for i in 0..10u64 {
            let at = start + Duration::from_millis(i * 100);
            send(&mut cc, i, at);
            cc.on_packets_lost(&[lost(i, at)], at);
        }
        assert_eq!(cc.congestion_window(), minimum_window(MDS));
    }

    #[test]
    fn test_persistent_congestion() {
        let start = Instant::now();
        let mut cc = new_reno();
        cc.on_persistent_congestion(start);

        assert_eq!(cc.congestion_window(), minimum_window(MDS));
        send(&mut cc, 0, start);
        assert!(cc.in_slow_start());
    }

    #[test]
    fn test_cwnd_blocked() {
        let start = Instant::now();
        let mut cc = new_reno();
        assert_eq!(cc.time_until_send(start), Some(start));

        fill_window(&mut cc, 0, start);
        assert_eq!(cc.time_until_send(start), None);
        assert_eq!(cc.congestion_window_remaining(), 0);
    }

    #[test]
    fn test_discarded_bytes() {
        let start = Instant::now();
        let mut cc = new_reno();
        send(&mut cc, 0, start);
        send(&mut cc, 1, start);

        cc.on_packets_discarded(MDS);
        assert_eq!(cc.bytes_in_flight(), MDS);
    }

    #[test]
    fn test_pacing_limits_burst() {
        let start = Instant::now();
        let mut cc = ClassicController::new(NewReno::default(), MDS, true, RttStats::default().into_shared());

        for pn in 0..MAX_BURST_PACKETS {
            assert!(cc.has_pacing_budget(start));
            send(&mut cc, pn, start);
        }
        assert!(!cc.has_pacing_budget(start));
        // 1.25 * 12000 bytes per 333ms refills a datagram in under 30ms
        assert!(cc.has_pacing_budget(start + Duration::from_millis(50)));
    }

    #[test]
    fn test_cubic_reduces_less_than_reno() {
        let start = Instant::now();
        let mut cc = ClassicController::new(Cubic::default(), MDS, false, RttStats::default().into_shared());
        let initial = cc.congestion_window();

        fill_window(&mut cc, 0, start);
        cc.on_packets_lost(&[lost(0, start)], start + Duration::from_millis(10));

        assert_eq!(cc.congestion_window(), initial * 7 / 10);
    }

    #[test]
    fn test_ecn_congestion_event() {
        let start = Instant::now();
        let mut cc = new_reno();
        let initial = cc.congestion_window();

        cc.on_ecn_congestion(start, start);
        assert_eq!(cc.congestion_window(), initial / 2);
    }
}
