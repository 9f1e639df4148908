//! Stream-level properties: reassembly under arbitrary fragmentation,
//! flow-control ceilings, and send-queue ack/loss bookkeeping.

use quictide::error::TransportError;
use quictide::send_buffer::SendQueue;
use quictide::stream::{StreamLimits, StreamNotice, StreamTable};
use quictide::types::{Dir, Side, StreamId};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn limits(stream_window: u64, conn_window: u64) -> StreamLimits {
    StreamLimits {
        local_max_data: conn_window,
        peer_max_data: conn_window,
        local_max_streams: [16, 16],
        peer_max_streams: [16, 16],
        peer_stream_data_bidi_local: stream_window,
        peer_stream_data_bidi_remote: stream_window,
        peer_stream_data_uni: stream_window,
        local_stream_data_bidi_local: stream_window,
        local_stream_data_bidi_remote: stream_window,
        local_stream_data_uni: stream_window,
    }
}

/// Arbitrary overlapping fragment orders whose union covers [0, N) must
/// deliver exactly the source bytes, in order, regardless of arrival
/// order.
#[test]
fn fragments_deliver_exact_bytes() {
    let mut rng = ChaCha8Rng::seed_from_u64(0xbeef);
    for round in 0..40 {
        let total: usize = rng.gen_range(256..4096);
        let source: Vec<u8> = (0..total).map(|_| rng.r#gen()).collect();

        // Cut into fragments, some stretched backwards for overlap.
        let mut fragments = Vec::new();
        let mut at = 0;
        while at < total {
            let len = rng.gen_range(1..256).min(total - at);
            let back = rng.gen_range(0..=at.min(64));
            fragments.push((at - back, source[at - back..at + len].to_vec(), false));
            at += len;
        }
        // The closing fragment carries FIN at the exact final size.
        fragments.push((total, Vec::new(), true));
        fragments.shuffle(&mut rng);

        let mut table = StreamTable::new(Side::Server, limits(1 << 20, 1 << 22));
        let id = StreamId::new(Side::Client, Dir::Uni, 0);
        let mut notices = Vec::new();
        let stream = table.get_or_create(id, &mut notices).unwrap();

        for (offset, data, fin) in fragments {
            stream.on_stream_frame(offset as u64, &data, fin).unwrap();
        }
        let (delivered, at_end) = stream.read(total + 1);
        assert_eq!(delivered, source, "round {round}");
        assert!(at_end);
    }
}

#[test]
fn overlapping_mismatch_is_protocol_violation() {
    let mut table = StreamTable::new(Side::Server, limits(1 << 16, 1 << 20));
    let id = StreamId::new(Side::Client, Dir::Uni, 0);
    let mut notices = Vec::new();
    let stream = table.get_or_create(id, &mut notices).unwrap();
    stream.on_stream_frame(0, b"consistent", false).unwrap();
    assert_eq!(
        stream.on_stream_frame(4, b"XXtent", false),
        Err(TransportError::ProtocolViolation("stream data mismatch"))
    );
}

/// Stream and connection receive ceilings hold for any frame sequence:
/// a frame past either limit errors instead of buffering.
#[test]
fn flow_control_ceilings() {
    let mut rng = ChaCha8Rng::seed_from_u64(0xf10);
    let stream_window = 4096u64;
    let conn_window = 10_000u64;
    let mut table = StreamTable::new(Side::Server, limits(stream_window, conn_window));

    let mut total_accounted = 0u64;
    for index in 0..4 {
        let id = StreamId::new(Side::Client, Dir::Uni, index);
        let mut notices = Vec::new();
        let len = rng.gen_range(1..stream_window);
        let (old, new) = {
            let stream = table.get_or_create(id, &mut notices).unwrap();
            let old = stream.recv.buffer.highest_offset();
            let data = vec![0u8; len as usize];
            // Within the stream window this must succeed...
            stream.on_stream_frame(0, &data, false).unwrap();
            // ...and past it must not.
            assert!(
                stream.on_stream_frame(stream_window, &[0], false).is_err(),
                "byte at stream limit accepted"
            );
            (old, stream.recv.buffer.highest_offset())
        };
        // ...unless the connection ceiling is hit first.
        match table.account_rx(old, new) {
            Ok(()) => total_accounted += new - old,
            Err(_) => {
                assert!(total_accounted + (new - old) > conn_window);
                return;
            }
        }
        assert!(total_accounted <= conn_window);
    }
}

/// Random interleavings of ack and loss over a sent stream leave the
/// queue consistent: every byte is eventually acked exactly once and the
/// buffered prefix is released.
#[test]
fn send_queue_ack_loss_interleaving() {
    let mut rng = ChaCha8Rng::seed_from_u64(77);
    for _ in 0..50 {
        let total = rng.gen_range(1_000..20_000u64);
        let mut queue = SendQueue::new();
        queue.write(&vec![0xab; total as usize], true, false);

        // Dequeue everything in random chunk sizes, then randomly lose and
        // re-send until all ranges ack.
        let mut sent: Vec<(u64, u64, bool)> = Vec::new();
        for _ in 0..500 {
            // Pull whatever is pending.
            while let Some((offset, data, fin)) =
                queue.dequeue(rng.gen_range(100..2000), u64::MAX)
            {
                sent.push((offset, data.len() as u64, fin));
            }
            if let Some(offset) = queue.dequeue_fin() {
                sent.push((offset, 0, true));
            }
            if sent.is_empty() {
                break;
            }
            // Ack or lose each outstanding range.
            sent.shuffle(&mut rng);
            for (offset, len, fin) in sent.drain(..) {
                if rng.gen_bool(0.2) {
                    queue.on_loss(offset, len, fin);
                } else {
                    queue.on_ack(offset, len, fin);
                }
            }
            if queue.all_acked() {
                break;
            }
        }
        assert!(queue.all_acked());
        assert_eq!(queue.buffered_bytes(), 0);
        assert_eq!(queue.base(), total);
    }
}

#[test]
fn peer_opening_streams_in_any_order() {
    let mut table = StreamTable::new(Side::Client, limits(1 << 16, 1 << 20));
    let mut notices = Vec::new();
    // Peer references stream 5 first: 0..=5 come into being.
    let id5 = StreamId::new(Side::Server, Dir::Bi, 5);
    table.get_or_create(id5, &mut notices).unwrap();
    let opened = notices
        .iter()
        .filter(|n| matches!(n, StreamNotice::Opened(_)))
        .count();
    assert_eq!(opened, 6);
    // Then stream 2 resolves without another notice.
    let mut notices = Vec::new();
    let id2 = StreamId::new(Side::Server, Dir::Bi, 2);
    table.get_or_create(id2, &mut notices).unwrap();
    assert!(notices.is_empty());
}
