//! Recovery behavior over the wired-together pair: probe timeouts,
//! amplification limiting, and congestion-window discipline under loss.

use quictide::connection::{ApiOp, Event};
use quictide::testing::Pair;
use quictide::types::{Dir, Side};
use quictide::Settings;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::time::Duration;
use tokio::sync::oneshot;

/// While the server's path is unvalidated it never sends more than three
/// times what it heard from the client.
#[test]
fn amplification_limit_holds() {
    let mut pair = Pair::with_defaults();
    // Black-hole everything toward the client: the server can never be
    // acked and never sees a Handshake packet, so it stays unvalidated.
    pair.deliver = Box::new(|to, _| to == Side::Server);
    pair.drive();
    for _ in 0..8 {
        pair.advance(Duration::from_millis(500));
    }
    let stats = &pair.server.stats;
    assert!(stats.bytes_received > 0);
    assert!(
        stats.bytes_sent <= 3 * stats.bytes_received,
        "sent {} with only {} received",
        stats.bytes_sent,
        stats.bytes_received,
    );
}

/// A fully black-holed client handshake gives up after the PTO budget
/// instead of probing forever.
#[test]
fn handshake_abandoned_after_pto_budget() {
    // Idle is pushed out so the PTO budget, not the idle timer, decides.
    let mut settings = Settings::default();
    settings.idle_timeout = Duration::from_secs(300);
    let mut pair = Pair::new(settings.clone(), settings);
    pair.deliver = Box::new(|_, _| false);
    pair.drive();
    for _ in 0..40 {
        pair.advance(Duration::from_secs(2));
    }
    let events = pair.events(Side::Client);
    assert!(
        events.iter().any(|e| matches!(
            e,
            Event::ShutdownComplete { reason: quictide::CloseReason::HandshakeTimeout }
        )),
        "client kept probing: {events:?}"
    );
}

/// Drop a mid-transfer flight: the loss must be repaired without closing
/// the connection, and retransmissions stay bounded.
#[test]
fn burst_loss_repaired() {
    let mut pair = Pair::with_defaults();
    pair.handshake();
    pair.events(Side::Client);
    pair.events(Side::Server);

    let (reply, mut rx) = oneshot::channel();
    pair.api(Side::Server, ApiOp::StreamOpen { dir: Dir::Uni, reply });
    let id = rx.try_recv().unwrap().unwrap();

    let payload = vec![0x5a; 64 * 1024];
    pair.api(Side::Server, ApiOp::StreamSend { id, data: payload.clone(), fin: true });

    // Drop a window of datagrams mid-flight.
    let mut dropped = 0u32;
    pair.deliver = Box::new(move |to, _| {
        if to == Side::Client && dropped < 8 {
            dropped += 1;
            return false;
        }
        true
    });

    let mut received = Vec::new();
    let mut finished = false;
    for _ in 0..400 {
        pair.drive();
        for event in pair.events(Side::Client) {
            if let Event::StreamData { id: sid, data, fin } = event {
                assert_eq!(sid, id);
                received.extend_from_slice(&data);
                let consumed = data.len();
                pair.api(Side::Client, ApiOp::ReceiveComplete { id: sid, consumed });
                finished |= fin;
            }
        }
        if finished {
            break;
        }
        pair.advance(Duration::from_millis(40));
    }
    assert!(finished, "transfer stalled after loss");
    assert_eq!(received, payload);
    assert!(pair.server.stats.lost_bytes > 0, "no loss was detected");
    // The repair effort stays proportionate to what was dropped.
    assert!(pair.server.stats.lost_bytes < 32 * 1024);
}

/// Under sustained random loss, bytes in flight stay governed by the
/// congestion window.
#[test]
fn cwnd_disciplines_flight_under_loss() {
    let mut settings = Settings::default();
    settings.idle_timeout = Duration::from_secs(120);
    let mut pair = Pair::new(settings.clone(), settings);
    pair.handshake();

    let (reply, mut rx) = oneshot::channel();
    pair.api(Side::Server, ApiOp::StreamOpen { dir: Dir::Uni, reply });
    let id = rx.try_recv().unwrap().unwrap();

    let total = 256 * 1024;
    pair.api(Side::Server, ApiOp::StreamSend { id, data: vec![1; total], fin: true });

    let mut rng = ChaCha8Rng::seed_from_u64(0x10ad);
    pair.deliver = Box::new(move |_, _| rng.gen_bool(0.98));

    let mut received = 0usize;
    let mut finished = false;
    let mut last_in_flight = 0u64;
    for _ in 0..2_000 {
        pair.drive();
        let in_flight = pair.server.bytes_in_flight();
        let window = pair.server.congestion_window();
        // New sends never push past the window by more than a datagram
        // plus the two probe exemptions; shrinking windows may leave old
        // flight above the new ceiling.
        if in_flight > last_in_flight {
            assert!(
                in_flight <= window + 3 * 1280,
                "flight {in_flight} far beyond window {window}"
            );
        }
        last_in_flight = in_flight;

        for event in pair.events(Side::Client) {
            if let Event::StreamData { id: sid, data, fin } = event {
                received += data.len();
                let consumed = data.len();
                pair.api(Side::Client, ApiOp::ReceiveComplete { id: sid, consumed });
                finished |= fin;
            }
        }
        if finished {
            break;
        }
        pair.advance(Duration::from_millis(25));
    }
    assert!(finished, "lossy transfer incomplete: {received}/{total}");
    assert_eq!(received, total);
}

/// BBR carries the same transfer machinery as Cubic.
#[test]
fn bbr_transfers_data() {
    let mut settings = Settings::default();
    settings.congestion = quictide::CongestionAlgorithm::Bbr;
    let mut pair = Pair::new(settings.clone(), settings);
    pair.handshake();

    let (reply, mut rx) = oneshot::channel();
    pair.api(Side::Client, ApiOp::StreamOpen { dir: Dir::Uni, reply });
    let id = rx.try_recv().unwrap().unwrap();
    pair.api(Side::Client, ApiOp::StreamSend { id, data: vec![9; 100_000], fin: true });

    let mut received = 0usize;
    let mut finished = false;
    for _ in 0..400 {
        pair.drive();
        for event in pair.events(Side::Server) {
            if let Event::StreamData { id: sid, data, fin } = event {
                received += data.len();
                let consumed = data.len();
                pair.api(Side::Server, ApiOp::ReceiveComplete { id: sid, consumed });
                finished |= fin;
            }
        }
        if finished {
            break;
        }
        pair.advance(Duration::from_millis(20));
    }
    assert!(finished);
    assert_eq!(received, 100_000);
    assert_eq!(pair.client.stats.congestion_algorithm, "bbr");
}
