//! ECN codepoints and path validation (RFC 9000 §13.4)
//!
//! The first [`ECN_TESTING_PACKETS`] application-data packets are sent with
//! ECT(0). The path is declared capable once an ACK reflects one of them in
//! its ECN counts; any inconsistency in the reported counts disables ECN for
//! the rest of the connection. Failure is never a connection error.

use crate::packet_number::PacketNumber;
use crate::tracer::RecoveryTracer;
use std::sync::Arc;

/// Packets sent with ECT(0) while the path is being tested
pub const ECN_TESTING_PACKETS: u32 = 10;

/// IP ECN codepoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum Ecn {
    #[default]
    NotEct,
    Ect1,
    Ect0,
    Ce,
}

impl Ecn {
    /// Decode the two ECN bits of the IP TOS / traffic class byte
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b01 => Ecn::Ect1,
            0b10 => Ecn::Ect0,
            0b11 => Ecn::Ce,
            _ => Ecn::NotEct,
        }
    }

    pub fn to_bits(self) -> u8 {
        match self {
            Ecn::NotEct => 0b00,
            Ecn::Ect1 => 0b01,
            Ecn::Ect0 => 0b10,
            Ecn::Ce => 0b11,
        }
    }
}

/// Validation state of the path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcnState {
    /// Sending ECT(0) testing packets
    Testing,
    /// All testing packets sent, waiting for their acknowledgment
    Unknown,
    /// Peer reflected ECN marks
    Capable,
    /// Validation failed, ECN is off for the connection
    Failed,
}

/// What caused a state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcnStateTrigger {
    /// All testing packets were sent
    TestingComplete,
    /// An ACK reflected ECT marks for a testing packet
    Validated,
    /// Every testing packet was declared lost
    AllTestingPacketsLost,
    /// Reported counts exceed the packets sent with that codepoint
    TooManyMarks,
    /// ECT packets were acknowledged by an ACK without ECN counts
    MissingCounts,
    /// A reported count went down
    DecreasedCounts,
    /// Newly acknowledged ECT packets are not reflected in the counts
    LostMarkings,
    /// Every ECT packet came back as CE
    Mangled,
}

/// Per-connection ECN validation
pub struct EcnTracker {
    state: EcnState,
    num_sent_testing: u32,
    num_lost_testing: u32,
    first_testing_pn: Option<PacketNumber>,
    last_testing_pn: Option<PacketNumber>,
    num_sent_ect0: u64,
    num_sent_ect1: u64,
    num_acked_ect0: u64,
    num_acked_ect1: u64,
    num_acked_ce: u64,
    tracer: Option<Arc<dyn RecoveryTracer>>,
}

impl EcnTracker {
    pub fn new(tracer: Option<Arc<dyn RecoveryTracer>>) -> Self {
        EcnTracker {
            state: EcnState::Testing,
            num_sent_testing: 0,
            num_lost_testing: 0,
            first_testing_pn: None,
            last_testing_pn: None,
            num_sent_ect0: 0,
            num_sent_ect1: 0,
            num_acked_ect0: 0,
            num_acked_ect1: 0,
            num_acked_ce: 0,
            tracer,
        }
    }

    pub fn state(&self) -> EcnState {
        self.state
    }

    /// Codepoint to set on the next application-data packet
    pub fn mode(&self) -> Ecn {
        match self.state {
            EcnState::Testing | EcnState::Capable => Ecn::Ect0,
            EcnState::Unknown | EcnState::Failed => Ecn::NotEct,
        }
    }

    pub fn on_packet_sent(&mut self, pn: PacketNumber, ecn: Ecn) {
        match ecn {
            Ecn::NotEct => return,
            Ecn::Ect0 => self.num_sent_ect0 += 1,
            Ecn::Ect1 => self.num_sent_ect1 += 1,
            Ecn::Ce => {}
        }

        if self.state != EcnState::Testing {
            return;
        }
        if self.first_testing_pn.is_none() {
            self.first_testing_pn = Some(pn);
        }
        self.num_sent_testing += 1;
        if self.num_sent_testing >= ECN_TESTING_PACKETS {
            self.last_testing_pn = Some(pn);
            self.transition(EcnState::Unknown, EcnStateTrigger::TestingComplete);
        }
    }

    pub fn on_packet_lost(&mut self, pn: PacketNumber) {
        if !matches!(self.state, EcnState::Testing | EcnState::Unknown) {
            return;
        }
        if !self.is_testing_packet(pn) {
            return;
        }
        self.num_lost_testing += 1;
        // only decide once every testing packet went out
        if self.state == EcnState::Unknown && self.num_lost_testing >= self.num_sent_testing {
            self.fail(EcnStateTrigger::AllTestingPacketsLost);
        }
    }

    /// Process the ECN counts of an ACK that increased the largest acknowledged.
    ///
    /// `acked` lists the newly acknowledged packets with the codepoint each was
    /// sent with. Returns true if the ACK signals congestion (CE increase on a
    /// validated path).
    pub fn on_packets_acked(&mut self, acked: &[(PacketNumber, Ecn)], ect0: u64, ect1: u64, ce: u64) -> bool {
        if self.state == EcnState::Failed {
            return false;
        }

        // CE marks can only land on packets sent with ECT
        if ect0 > self.num_sent_ect0
            || ect1 > self.num_sent_ect1
            || ect0 + ect1 + ce > self.num_sent_ect0 + self.num_sent_ect1
        {
            self.fail(EcnStateTrigger::TooManyMarks);
            return false;
        }

        let acked_ect0 = acked.iter().filter(|(_, ecn)| *ecn == Ecn::Ect0).count() as u64;
        let acked_ect1 = acked.iter().filter(|(_, ecn)| *ecn == Ecn::Ect1).count() as u64;

        // bleaching paths and peers that never report counts
        if (acked_ect0 > 0 || acked_ect1 > 0) && ect0 == 0 && ect1 == 0 && ce == 0 {
            self.fail(EcnStateTrigger::MissingCounts);
            return false;
        }

        // only ACKs increasing the largest acked are processed, so counts never go down
        if ect0 < self.num_acked_ect0 || ect1 < self.num_acked_ect1 || ce < self.num_acked_ce {
            self.fail(EcnStateTrigger::DecreasedCounts);
            return false;
        }
        let new_ect0 = ect0 - self.num_acked_ect0;
        let new_ect1 = ect1 - self.num_acked_ect1;
        let new_ce = ce - self.num_acked_ce;

        if new_ect0 + new_ce < acked_ect0 || new_ect1 + new_ce < acked_ect1 {
            self.fail(EcnStateTrigger::LostMarkings);
            return false;
        }

        self.num_acked_ect0 = ect0;
        self.num_acked_ect1 = ect1;
        self.num_acked_ce = ce;

        if self.state == EcnState::Unknown && self.is_mangled() {
            self.fail(EcnStateTrigger::Mangled);
            return false;
        }

        if matches!(self.state, EcnState::Testing | EcnState::Unknown) {
            let acked_testing = acked.iter().any(|(pn, _)| self.is_testing_packet(*pn));
            if acked_testing && (new_ect0 > 0 || new_ect1 > 0) {
                self.transition(EcnState::Capable, EcnStateTrigger::Validated);
            }
        }

        // CE marks before validation could be mangling rather than congestion
        self.state == EcnState::Capable && new_ce > 0
    }

    fn is_mangled(&self) -> bool {
        let ce_or_lost = self.num_acked_ce + u64::from(self.num_lost_testing);
        self.num_sent_ect0 + self.num_sent_ect1 <= ce_or_lost
    }

    fn is_testing_packet(&self, pn: PacketNumber) -> bool {
        let Some(first) = self.first_testing_pn else {
            return false;
        };
        pn >= first && self.last_testing_pn.map_or(true, |last| pn <= last)
    }

    fn fail(&mut self, trigger: EcnStateTrigger) {
        self.transition(EcnState::Failed, trigger);
    }

    fn transition(&mut self, state: EcnState, trigger: EcnStateTrigger) {
        self.state = state;
        tracing::debug!(?state, ?trigger, "ecn state changed");
        if let Some(tracer) = &self.tracer {
            tracer.on_ecn_state_changed(state, trigger);
        }
    }
}

impl std::fmt::Debug for EcnTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcnTracker")
            .field("state", &self.state)
            .field("num_sent_testing", &self.num_sent_testing)
            .field("num_lost_testing", &self.num_lost_testing)
            .field("num_sent_ect0", &self.num_sent_ect0)
            .field("num_acked_ect0", &self.num_acked_ect0)
            .field("num_acked_ce", &self.num_acked_ce)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pn(v: u64) -> PacketNumber {
        PacketNumber::new(v)
    }

    fn send_testing(tracker: &mut EcnTracker, count: u64) {
        for i in 0..count {
            assert_eq!(tracker.mode(), Ecn::Ect0);
            tracker.on_packet_sent(pn(i), Ecn::Ect0);
        }
    }

    #[test]
    fn test_codepoint_bits() {
        for ecn in [Ecn::NotEct, Ecn::Ect0, Ecn::Ect1, Ecn::Ce] {
            assert_eq!(Ecn::from_bits(ecn.to_bits()), ecn);
        }
        assert_eq!(Ecn::from_bits(0xff), Ecn::Ce);
    }

    #[test]
    fn test_testing_then_unknown() {
        let mut tracker = EcnTracker::new(None);
        send_testing(&mut tracker, 9);
        assert_eq!(tracker.state(), EcnState::Testing);

        tracker.on_packet_sent(pn(9), Ecn::Ect0);
        assert_eq!(tracker.state(), EcnState::Unknown);
        assert_eq!(tracker.mode(), Ecn::NotEct);
    }

    #[test]
    fn test_validated_by_reflected_marks() {
        let mut tracker = EcnTracker::new(None);
        send_testing(&mut tracker, 10);

        let congestion = tracker.on_packets_acked(&[(pn(0), Ecn::Ect0), (pn(1), Ecn::Ect0)], 2, 0, 0);

        assert!(!congestion);
        assert_eq!(tracker.state(), EcnState::Capable);
        assert_eq!(tracker.mode(), Ecn::Ect0);
    }

    #[test]
    fn test_ce_on_capable_path_is_congestion() {
        let mut tracker = EcnTracker::new(None);
        send_testing(&mut tracker, 10);
        tracker.on_packets_acked(&[(pn(0), Ecn::Ect0)], 1, 0, 0);

        assert!(tracker.on_packets_acked(&[(pn(1), Ecn::Ect0)], 1, 0, 1));
    }

    #[test]
    fn test_missing_counts_fail() {
        let mut tracker = EcnTracker::new(None);
        send_testing(&mut tracker, 3);

        tracker.on_packets_acked(&[(pn(0), Ecn::Ect0)], 0, 0, 0);
        assert_eq!(tracker.state(), EcnState::Failed);
        assert_eq!(tracker.mode(), Ecn::NotEct);
    }

    #[test]
    fn test_decreasing_counts_fail() {
        let mut tracker = EcnTracker::new(None);
        send_testing(&mut tracker, 5);
        tracker.on_packets_acked(&[(pn(0), Ecn::Ect0), (pn(1), Ecn::Ect0)], 2, 0, 0);

        tracker.on_packets_acked(&[(pn(2), Ecn::Ect0)], 1, 0, 0);
        assert_eq!(tracker.state(), EcnState::Failed);
    }

    #[test]
    fn test_too_many_marks_fail() {
        let mut tracker = EcnTracker::new(None);
        send_testing(&mut tracker, 2);

        tracker.on_packets_acked(&[(pn(0), Ecn::Ect0)], 5, 0, 0);
        assert_eq!(tracker.state(), EcnState::Failed);
    }

    #[test]
    fn test_excess_ce_on_capable_path_fails() {
        let mut tracker = EcnTracker::new(None);
        send_testing(&mut tracker, 10);
        tracker.on_packets_acked(&[(pn(0), Ecn::Ect0)], 1, 0, 0);
        assert_eq!(tracker.state(), EcnState::Capable);

        assert!(!tracker.on_packets_acked(&[(pn(1), Ecn::Ect0)], 1, 0, 100));
        assert_eq!(tracker.state(), EcnState::Failed);
        assert_eq!(tracker.mode(), Ecn::NotEct);
    }

    #[test]
    fn test_all_testing_packets_lost() {
        let mut tracker = EcnTracker::new(None);
        send_testing(&mut tracker, 10);

        for i in 0..9 {
            tracker.on_packet_lost(pn(i));
            assert_eq!(tracker.state(), EcnState::Unknown);
        }
        tracker.on_packet_lost(pn(9));
        assert_eq!(tracker.state(), EcnState::Failed);
    }

    #[test]
    fn test_mangling_detected() {
        let mut tracker = EcnTracker::new(None);
        send_testing(&mut tracker, 10);

        let acked: Vec<_> = (0..10).map(|i| (pn(i), Ecn::Ect0)).collect();
        tracker.on_packets_acked(&acked, 0, 0, 10);
        assert_eq!(tracker.state(), EcnState::Failed);
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut tracker = EcnTracker::new(None);
        send_testing(&mut tracker, 1);
        tracker.on_packets_acked(&[(pn(0), Ecn::Ect0)], 0, 0, 0);

        assert!(!tracker.on_packets_acked(&[(pn(0), Ecn::Ect0)], 1, 0, 1));
        assert_eq!(tracker.state(), EcnState::Failed);
    }
}
