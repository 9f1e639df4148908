//! Wire codec properties: varints, frames, packet protection, transport
//! parameters. Randomized cases use a fixed seed so failures reproduce.

use quictide::cid::Cid;
use quictide::crypto::EpochKeys;
use quictide::frame::{AckFrame, EcnCounts, Frame};
use quictide::packet::{self, HeaderForm, PartialPacket};
use quictide::types::{Dir, QUIC_VERSION_1, Side, StreamId, VARINT_MAX};
use quictide::varint;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

#[test]
fn varint_roundtrip_random() {
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    for _ in 0..10_000 {
        // Spread across all four encodings.
        let bits = rng.gen_range(0..62);
        let value = rng.gen_range(0..=VARINT_MAX) >> bits;
        let mut buf = Vec::new();
        varint::write(&mut buf, value);
        assert_eq!(buf.len(), varint::size(value));
        let mut reader = varint::Reader::new(&buf);
        assert_eq!(reader.varint().unwrap(), value);
        assert!(reader.is_empty());
    }
}

#[test]
fn varint_decode_all_wire_lengths() {
    // Every valid wire form decodes back to itself when re-encoded
    // minimally, and non-minimal forms still decode.
    let mut buf = vec![0x40, 0x25]; // 2-byte encoding of 37
    let mut reader = varint::Reader::new(&buf);
    assert_eq!(reader.varint().unwrap(), 37);
    buf = vec![0x80, 0, 0, 37];
    let mut reader = varint::Reader::new(&buf);
    assert_eq!(reader.varint().unwrap(), 37);
}

fn random_frame(rng: &mut ChaCha8Rng) -> Frame {
    let id = StreamId::new(
        if rng.r#gen() { Side::Client } else { Side::Server },
        if rng.r#gen() { Dir::Bi } else { Dir::Uni },
        rng.gen_range(0..1000),
    );
    match rng.gen_range(0..15) {
        0 => Frame::Ping,
        1 => {
            let largest = rng.gen_range(100..100_000);
            let mut ranges = Vec::new();
            for _ in 0..rng.gen_range(0..8) {
                ranges.push((rng.gen_range(0..5), rng.gen_range(0..5)));
            }
            // Keep gaps representable below the smallest range.
            let needed: u64 = ranges.iter().map(|(g, l)| g + l + 2).sum();
            Frame::Ack(AckFrame {
                largest,
                delay: rng.gen_range(0..10_000),
                first_range: rng.gen_range(0..(largest - needed).max(1)),
                ranges,
                ecn: rng.r#gen::<bool>().then(|| EcnCounts {
                    ect0: rng.gen_range(0..100),
                    ect1: 0,
                    ce: rng.gen_range(0..10),
                }),
            })
        }
        2 => Frame::ResetStream {
            stream_id: id,
            error_code: rng.gen_range(0..u32::MAX as u64),
            final_size: rng.gen_range(0..u32::MAX as u64),
        },
        3 => Frame::StopSending { stream_id: id, error_code: rng.gen_range(0..1000) },
        4 => Frame::Crypto {
            offset: rng.gen_range(0..100_000),
            data: (0..rng.gen_range(1..200)).map(|_| rng.r#gen()).collect(),
        },
        5 => Frame::NewToken { token: (0..rng.gen_range(1..64)).map(|_| rng.r#gen()).collect() },
        6 => Frame::Stream {
            stream_id: id,
            offset: rng.gen_range(0..1_000_000),
            data: (0..rng.gen_range(0..500)).map(|_| rng.r#gen()).collect(),
            fin: rng.r#gen(),
        },
        7 => Frame::MaxData(rng.gen_range(0..VARINT_MAX)),
        8 => Frame::MaxStreamData { stream_id: id, limit: rng.gen_range(0..VARINT_MAX) },
        9 => Frame::MaxStreams {
            dir: if rng.r#gen() { Dir::Bi } else { Dir::Uni },
            limit: rng.gen_range(0..1 << 60),
        },
        10 => Frame::NewConnectionId {
            sequence: rng.gen_range(1..100),
            retire_prior_to: rng.gen_range(0..2),
            cid: (0..rng.gen_range(1..21)).map(|_| rng.r#gen()).collect(),
            reset_token: rng.r#gen(),
        },
        11 => Frame::RetireConnectionId { sequence: rng.gen_range(0..100) },
        12 => Frame::PathChallenge(rng.r#gen()),
        13 => Frame::ConnectionClose {
            error_code: rng.gen_range(0..0x200),
            frame_type: rng.r#gen::<bool>().then(|| rng.gen_range(0..0x30)),
            reason: b"reason".to_vec(),
        },
        _ => Frame::Datagram {
            data: (0..rng.gen_range(0..300)).map(|_| rng.r#gen()).collect(),
        },
    }
}

#[test]
fn frame_roundtrip_random() {
    let mut rng = ChaCha8Rng::seed_from_u64(2);
    for _ in 0..2_000 {
        let frame = random_frame(&mut rng);
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        assert_eq!(buf.len(), frame.wire_size(), "{frame:?}");
        let mut reader = varint::Reader::new(&buf);
        let decoded = Frame::decode(&mut reader).expect("decode");
        assert!(reader.is_empty());
        assert_eq!(decoded, frame);
    }
}

#[test]
fn frames_concatenated_in_one_payload() {
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    for _ in 0..200 {
        let frames: Vec<Frame> = (0..rng.gen_range(1..10))
            .map(|_| random_frame(&mut rng))
            // PADDING runs merge on decode, so keep them out of the
            // equality check.
            .filter(|f| !matches!(f, Frame::Padding(_)))
            .collect();
        let mut buf = Vec::new();
        for frame in &frames {
            frame.encode(&mut buf);
        }
        let mut reader = varint::Reader::new(&buf);
        let mut decoded = Vec::new();
        while !reader.is_empty() {
            decoded.push(Frame::decode(&mut reader).unwrap());
        }
        assert_eq!(decoded, frames);
    }
}

#[test]
fn packet_protection_sweep() {
    let mut rng = ChaCha8Rng::seed_from_u64(4);
    let tx = EpochKeys::from_secrets(b"a", b"b");
    let rx = EpochKeys::from_secrets(b"b", b"a");
    let dcid = Cid::from_slice(&[7; 8]);
    let scid = Cid::from_slice(&[8; 8]);

    let mut largest: Option<u64> = None;
    for pn in [0u64, 1, 255, 256, 65_535, 65_536, 1 << 24, (1 << 30) + 17] {
        let payload: Vec<u8> = (0..rng.gen_range(8..800)).map(|_| rng.r#gen()).collect();
        let pn_len = packet::packet_number_len(pn, largest);
        let mut wire = Vec::new();
        let form = if pn % 2 == 0 {
            HeaderForm::Handshake { version: QUIC_VERSION_1, dcid: &dcid, scid: &scid }
        } else {
            HeaderForm::Short { dcid: &dcid, spin: false, key_phase: false }
        };
        let pn_offset = form.encode(&mut wire, pn, pn_len, pn_len + payload.len() + 16);
        let header_len = wire.len();
        let mut body = payload.clone();
        tx.local.packet.seal(pn, &wire[..header_len], &mut body).unwrap();
        wire.extend_from_slice(&body);
        packet::protect(&mut wire, 0, pn_offset, pn_len, tx.local.header.as_ref());

        let (partial, consumed) = PartialPacket::decode(&wire, 0, dcid.len()).unwrap();
        assert_eq!(consumed, wire.len());
        let un = partial.unprotect(rx.remote.header.as_ref(), largest).unwrap();
        assert_eq!(un.pn, pn);
        assert_eq!(un.open(rx.remote.packet.as_ref()).unwrap(), payload);
        largest = Some(pn);
    }
}

#[test]
fn corrupted_packet_fails_closed() {
    let tx = EpochKeys::from_secrets(b"x", b"y");
    let rx = EpochKeys::from_secrets(b"y", b"x");
    let dcid = Cid::from_slice(&[1; 8]);

    let mut wire = Vec::new();
    let form = HeaderForm::Short { dcid: &dcid, spin: false, key_phase: false };
    let pn_offset = form.encode(&mut wire, 9, 1, 0);
    let header_len = wire.len();
    let mut body = vec![0x01; 64];
    tx.local.packet.seal(9, &wire[..header_len], &mut body).unwrap();
    wire.extend_from_slice(&body);
    packet::protect(&mut wire, 0, pn_offset, 1, tx.local.header.as_ref());

    // Flip one ciphertext byte: AEAD must reject.
    let last = wire.len() - 1;
    wire[last] ^= 0xff;
    let (partial, _) = PartialPacket::decode(&wire, 0, dcid.len()).unwrap();
    let un = partial.unprotect(rx.remote.header.as_ref(), None).unwrap();
    assert!(un.open(rx.remote.packet.as_ref()).is_err());
}

#[test]
fn transport_params_roundtrip_random() {
    use quictide::{Settings, TransportParams};
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    for _ in 0..200 {
        let mut settings = Settings::default();
        settings.max_data = rng.gen_range(0..VARINT_MAX);
        settings.max_streams_bidi = rng.gen_range(0..1 << 50);
        settings.ack_delay_exponent = rng.gen_range(0..=20);
        settings.active_cid_limit = rng.gen_range(2..64);
        let scid = Cid::random(rng.gen_range(1..21));
        let params = TransportParams::from_settings(&settings, scid, None, None, None);
        let decoded = TransportParams::decode(&params.encode()).unwrap();
        assert_eq!(decoded, params);
    }
}
