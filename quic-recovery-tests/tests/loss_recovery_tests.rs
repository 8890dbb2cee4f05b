//! Integration tests for loss recovery between a sending and a receiving endpoint
//!
//! ACK frames are produced by a real received-packet handler and fed to the
//! peer's sent-packet handler, so both halves of the acknowledgment loop are
//! exercised together.

use quic_recovery::ack::AckRange;
use quic_recovery::congestion::CongestionController;
use quic_recovery::ecn::Ecn;
use quic_recovery::frame::{Frame, SentFrame};
use quic_recovery::packet_number::{EncryptionLevel, PacketNumberSpace, Perspective};
use quic_recovery::received_handler::ReceivedPacketHandler;
use quic_recovery::sent_handler::SendMode;
use quic_recovery::tracer::TimerKind;
use quic_recovery::TransportError;
use quic_recovery_tests::{
    ack, confirmed_sender, endpoint, ms, pn, pns, recovery_config, send_frames, send_ping, Recorder, SIZE,
};
use std::sync::Arc;
use std::time::Instant;

const LEVEL: EncryptionLevel = EncryptionLevel::OneRtt;

fn receive(handler: &mut ReceivedPacketHandler, values: impl IntoIterator<Item = u64>, at: Instant) {
    for v in values {
        assert!(handler.received_packet(pn(v), Ecn::NotEct, LEVEL, at, true).unwrap());
    }
}

fn stream_frame(offset: u64, recorder: &Arc<Recorder>) -> SentFrame {
    SentFrame::with_handler(
        Frame::Stream {
            stream_id: 0,
            offset,
            len: 100,
            fin: false,
        },
        recorder.clone(),
    )
}

#[test]
fn test_reordered_acks_from_receiver() {
    let start = Instant::now();
    let (mut sender, _) = endpoint(recovery_config(), Perspective::Client, start);
    let (_, mut receiver) = endpoint(recovery_config(), Perspective::Server, start);
    for _ in 0..10 {
        send_ping(&mut sender, start);
    }

    // the tail of the flight overtakes the head
    let arrival = start + ms(20);
    receive(&mut receiver, 7..10, arrival);
    let first = receiver.ack_frame(LEVEL, arrival, false).unwrap();
    assert_eq!(first.ranges, vec![AckRange::new(7u64, 9u64)]);

    receive(&mut receiver, 0..7, arrival + ms(1));
    let second = receiver.ack_frame(LEVEL, arrival + ms(1), false).unwrap();
    assert_eq!(second.ranges, vec![AckRange::new(0u64, 9u64)]);

    let outcome = sender.on_ack_received(&first, LEVEL, start + ms(40)).unwrap();
    assert_eq!(outcome.acked, pns(7..10));
    assert!(outcome.rtt_sample.is_some());

    let outcome = sender.on_ack_received(&second, LEVEL, start + ms(41)).unwrap();
    assert_eq!(outcome.rtt_sample, None);
    assert_eq!(outcome.acked, pns([6]));
    assert_eq!(outcome.spuriously_lost, pns(0..6));

    assert_eq!(sender.rtt().read().sample_count(), 1);
    assert_eq!(sender.bytes_in_flight(), 0);
    assert_eq!(sender.num_outstanding(PacketNumberSpace::ApplicationData), 0);
    assert_eq!(sender.largest_acked(PacketNumberSpace::ApplicationData), Some(pn(9)));
}

#[test]
fn test_reordering_threshold_from_receiver() {
    let start = Instant::now();
    let (mut sender, _) = endpoint(recovery_config(), Perspective::Client, start);
    let (_, mut receiver) = endpoint(recovery_config(), Perspective::Server, start);
    for _ in 0..5 {
        send_ping(&mut sender, start);
    }

    receive(&mut receiver, [3, 4], start + ms(10));
    let ack = receiver.ack_frame(LEVEL, start + ms(10), false).unwrap();
    let outcome = sender.on_ack_received(&ack, LEVEL, start + ms(20)).unwrap();
    assert_eq!(outcome.lost, pns([0]));
    assert_eq!(sender.num_outstanding(PacketNumberSpace::ApplicationData), 2);
    assert_eq!(sender.bytes_in_flight(), 2 * SIZE);
    assert_eq!(sender.loss_timer().map(|timer| timer.kind), Some(TimerKind::LossDetection));

    // the stragglers arrive before the time threshold
    receive(&mut receiver, [1, 2], start + ms(12));
    let ack = receiver.ack_frame(LEVEL, start + ms(12), false).unwrap();
    assert_eq!(ack.ranges, vec![AckRange::new(1u64, 4u64)]);
    let outcome = sender.on_ack_received(&ack, LEVEL, start + ms(22)).unwrap();
    assert_eq!(outcome.acked, pns([1, 2]));
    assert!(outcome.lost.is_empty());
    assert_eq!(sender.bytes_in_flight(), 0);
    assert_eq!(sender.stats().packets_lost, 1);
}

#[test]
fn test_lossy_flight_accounting() {
    let start = Instant::now();
    let (mut sender, _) = endpoint(recovery_config(), Perspective::Client, start);
    let (_, mut receiver) = endpoint(recovery_config(), Perspective::Server, start);
    let recorder = Arc::new(Recorder::default());

    for i in 0..100 {
        send_frames(&mut sender, start + ms(i), vec![stream_frame(i * 100, &recorder)]);
    }

    let dropped = |v: u64| v % 7 == 3;
    for batch in 0..10 {
        let arrival = start + ms(10 * batch + 9 + 20);
        receive(&mut receiver, (10 * batch..10 * batch + 10).filter(|&v| !dropped(v)), arrival);
        let ack = receiver.ack_frame(LEVEL, arrival, false).unwrap();
        sender.on_ack_received(&ack, LEVEL, arrival + ms(20)).unwrap();
    }

    let expected_lost = (0..100).filter(|&v| dropped(v)).count() as u64;
    let stats = sender.stats();
    assert_eq!(stats.packets_lost, expected_lost);
    assert_eq!(stats.packets_acked, 100 - expected_lost);
    assert_eq!(stats.spurious_losses, 0);
    assert_eq!(sender.bytes_in_flight(), 0);
    assert_eq!(sender.congestion().bytes_in_flight(), 0);

    let lost = recorder.lost.lock();
    assert_eq!(lost.len() as u64, expected_lost);
    assert!(lost
        .iter()
        .all(|frame| matches!(frame, Frame::Stream { offset, .. } if dropped(offset / 100))));
    assert_eq!(recorder.acked.lock().len() as u64, 100 - expected_lost);
}

#[test]
fn test_probe_timeout_recovers_tail() {
    let start = Instant::now();
    let mut sender = confirmed_sender(start);
    let recorder = Arc::new(Recorder::default());
    send_frames(&mut sender, start, vec![stream_frame(0, &recorder)]);
    send_frames(&mut sender, start, vec![stream_frame(100, &recorder)]);

    let deadline = sender.loss_detection_timeout().unwrap();
    assert_eq!(sender.loss_timer().map(|timer| timer.kind), Some(TimerKind::Pto));
    assert!(sender.on_loss_detection_timeout(deadline).unwrap().is_empty());
    assert_eq!(sender.pto_count(), 1);
    assert_eq!(sender.send_mode(deadline), SendMode::PtoAppData);

    // the oldest packet's data goes into the first probe
    assert!(sender.queue_probe_packet(LEVEL));
    let retransmit = recorder.lost.lock().pop().unwrap();
    assert!(matches!(retransmit, Frame::Stream { offset: 0, .. }));
    let first_probe = send_frames(
        &mut sender,
        deadline,
        vec![SentFrame::with_handler(retransmit, recorder.clone())],
    );
    let second_probe = send_ping(&mut sender, deadline);
    assert_eq!(sender.send_mode(deadline), SendMode::Any);

    // the timeout consumed packet number 2 without sending it
    assert_eq!((first_probe, second_probe), (pn(3), pn(4)));
    let err = sender
        .on_ack_received(&ack(&[(2, 4)]), LEVEL, deadline + ms(50))
        .unwrap_err();
    assert!(matches!(err, TransportError::ProtocolViolation(_)));

    let outcome = sender
        .on_ack_received(&ack(&[(3, 4)]), LEVEL, deadline + ms(50))
        .unwrap();
    assert_eq!(outcome.acked, pns([3, 4]));
    assert_eq!(outcome.lost, pns([1]));
    assert_eq!(sender.pto_count(), 0);
    assert_eq!(sender.bytes_in_flight(), 0);
    assert_eq!(recorder.acked.lock().len(), 1);
    assert!(matches!(recorder.lost.lock()[..], [Frame::Stream { offset: 100, .. }]));
}

#[test]
fn test_acknowledged_acks_prune_receive_history() {
    let start = Instant::now();
    let (mut sent_a, mut received_a) = endpoint(recovery_config(), Perspective::Client, start);
    let (mut sent_b, mut received_b) = endpoint(recovery_config(), Perspective::Server, start);

    for _ in 0..5 {
        send_ping(&mut sent_a, start);
    }
    receive(&mut received_b, 0..5, start + ms(10));
    let ack_b = received_b.ack_frame(LEVEL, start + ms(10), false).unwrap();
    let largest = ack_b.largest_acked().unwrap().as_u64();
    let pn_b = send_frames(
        &mut sent_b,
        start + ms(10),
        vec![Frame::Ack { largest_acked: largest }.into(), Frame::Ping.into()],
    );

    sent_a.on_ack_received(&ack_b, LEVEL, start + ms(20)).unwrap();
    assert!(received_a
        .received_packet(pn_b, Ecn::NotEct, LEVEL, start + ms(20), true)
        .unwrap());
    let ack_a = received_a.ack_frame(LEVEL, start + ms(20), false).unwrap();
    sent_b.on_ack_received(&ack_a, LEVEL, start + ms(30)).unwrap();

    // B learned that A saw its ACK of 0..=4, so those need not be reported again
    for _ in 0..3 {
        send_ping(&mut sent_a, start + ms(30));
    }
    receive(&mut received_b, 5..8, start + ms(40));
    let ack = received_b.ack_frame(LEVEL, start + ms(40), false).unwrap();
    assert_eq!(ack.ranges, vec![AckRange::new(5u64, 7u64)]);
    assert!(received_b.is_potentially_duplicate(pn(2), LEVEL));

    let outcome = sent_a.on_ack_received(&ack, LEVEL, start + ms(50)).unwrap();
    assert_eq!(outcome.acked, pns(5..8));
    assert_eq!(sent_a.bytes_in_flight(), 0);
}

#[test]
fn test_loss_reduces_congestion_window() {
    let start = Instant::now();
    let mut sender = confirmed_sender(start);
    let initial = sender.congestion_window();
    let packets = initial / SIZE;
    for _ in 0..packets {
        send_ping(&mut sender, start);
    }
    assert_eq!(sender.send_mode(start), SendMode::Ack);

    let outcome = sender
        .on_ack_received(&ack(&[(4, packets - 1)]), LEVEL, start + ms(30))
        .unwrap();
    assert_eq!(outcome.lost, pns(0..4));
    assert_eq!(sender.congestion_window(), initial / 2);
    assert!(sender.congestion().in_recovery());
    assert_eq!(sender.send_mode(start + ms(30)), SendMode::Any);

    // a packet sent after the loss ends the recovery period once acknowledged
    let after = send_ping(&mut sender, start + ms(31));
    sender
        .on_ack_received(&ack(&[(after.as_u64(), after.as_u64())]), LEVEL, start + ms(61))
        .unwrap();
    assert!(!sender.congestion().in_recovery());
    assert_eq!(sender.bytes_in_flight(), 0);
}

#[test]
fn test_ack_in_dropped_space_is_ignored() {
    let start = Instant::now();
    let mut sender = confirmed_sender(start);
    send_ping(&mut sender, start);

    let outcome = sender
        .on_ack_received(&ack(&[(0, 0)]), EncryptionLevel::Handshake, start + ms(10))
        .unwrap();
    assert!(outcome.acked.is_empty());
    assert_eq!(sender.bytes_in_flight(), SIZE);
}
