//! End-to-end scenarios over the full decode chain: CADU stream in,
//! decoded HRDL records out.

mod common;

use std::sync::Arc;

use common::{caduize, encode_stream, make_body, make_cadu, make_packet};
use hrdl::framing::{CADU_BODY_LEN, CADU_TRAILER_INDEX};
use hrdl::hrdl::{stuff_bytes, Assembler, Decoder, HRDL_TRAILER_LEN, SYNC};
use hrdl::pipeline::{spawn_reassemble, spawn_validate, Stats};
use hrdl::sum::sum_hrdl;
use hrdl::Error;

/// Single-CADU HRDL with channel 3 and payload "HELLO": declared
/// length, trailer checksum and default UPI all come out right.
#[test]
fn single_cadu_science_packet() {
    let body = make_body(3, 1, 1, b"HELLO");
    let wire = encode_stream(&[make_packet(&body)], 42);

    let mut decoder = Decoder::new(&wire[..], false);
    let (packet, defect) = decoder.decode().unwrap();
    assert!(defect.is_none(), "unexpected defect: {defect:?}");
    assert_eq!(packet.header.size as usize, 5 + 16 + 24 + 32);
    assert_eq!(packet.checksum(), sum_hrdl(&body));
    assert_eq!(packet.header.upi, "SCIENCE");
    assert_eq!(packet.payload(), b"HELLO");

    assert!(matches!(decoder.decode(), Err(err) if err.is_eof()));
}

/// A body carrying the sync word at offset 40 travels with the escape
/// byte and is restored intact across a two-CADU span.
#[test]
fn stuffed_body_round_trips() {
    let payload = vec![0x33u8; 1400];
    let mut body = make_body(9, 1, 1, &payload);
    // Sync word at offset 40 of the BODY.
    body[40..44].copy_from_slice(&SYNC);
    let packet = make_packet(&body);
    let stuffed = stuff_bytes(&packet);
    assert_eq!(stuffed.len(), packet.len() + 1);
    assert!(stuffed.windows(5).any(|w| w == [0xf8, 0x2e, 0x35, 0xaa, 0x53]));
    let wire = caduize(&stuffed, 10);

    let mut decoder = Decoder::new(&wire[..], false);
    let (decoded, defect) = decoder.decode().unwrap();
    assert!(defect.is_none(), "unexpected defect: {defect:?}");
    assert_eq!(&decoded.body()[40..44], &SYNC);
    assert_eq!(decoded.data, packet);
}

/// Frames 100..=104 with 102 dropped: the packet spanning 101-103 is
/// abandoned with a gap record, neighbours decode intact.
#[test]
fn gap_mid_packet_abandons_only_that_packet() {
    // Packet 0 fits in frame 100 with room to spare; packet 1 spans
    // frames 100..103; packet 2 follows in frames 103..104.
    let packets = vec![
        make_packet(&make_body(3, 1, 1, &vec![0xA0u8; 416])), // 500 bytes
        make_packet(&make_body(3, 1, 1, &vec![0xB0u8; 2500])), // 2584 bytes
        make_packet(&make_body(3, 1, 1, &vec![0xC0u8; 1000])), // 1084 bytes
    ];
    let stream: Vec<u8> = packets.concat();
    let mut frames: Vec<Vec<u8>> = stream
        .chunks(CADU_BODY_LEN)
        .enumerate()
        .map(|(i, chunk)| make_cadu(100 + i as u32, chunk))
        .collect();
    assert_eq!(frames.len(), 5);
    // Frame 102 holds bytes [2016, 3024), all interior to packet 1
    // which spans [500, 3084).
    frames.remove(2);
    let wire: Vec<u8> = frames.concat();

    let mut asm = Assembler::new(&wire[..], false);
    assert_eq!(asm.read_packet().unwrap(), &packets[0][..]);
    assert!(matches!(
        asm.read_packet(),
        Err(Error::Gap { from: 101, to: 103 }),
    ));
    assert_eq!(asm.read_packet().unwrap(), &packets[2][..]);
    assert!(asm.read_packet().unwrap_err().is_eof());
}

/// Declared length 5000 with two whole filler bodies appended: the
/// emitted buffer is exactly declared + 12 and the checksum verifies.
#[test]
fn filler_padding_is_trimmed() {
    let body = make_body(3, 1, 1, &vec![0x55u8; 5000 - 72]);
    assert_eq!(body.len(), 5000);
    let packet = make_packet(&body);
    let mut stream = packet.clone();
    stream.extend_from_slice(&vec![0u8; 2 * CADU_BODY_LEN]);
    let wire = caduize(&stream, 7);

    let mut decoder = Decoder::new(&wire[..], false);
    let (decoded, defect) = decoder.decode().unwrap();
    assert!(defect.is_none());
    assert_eq!(decoded.data.len(), 5012);
    assert_eq!(decoded.checksum(), sum_hrdl(&body));
}

/// A corrupted trailer yields the decoded record plus a checksum error;
/// the validator drops it unless asked to keep corrupt packets.
#[test]
fn corrupted_trailer_detected_and_dropped() {
    let body = make_body(3, 1, 1, b"HELLO");
    let mut packet = make_packet(&body);
    let at = packet.len() - HRDL_TRAILER_LEN - 1;
    packet[at] ^= 0x01;
    let wire = encode_stream(&[packet.clone()], 1);

    let mut decoder = Decoder::new(&wire[..], false);
    let (decoded, defect) = decoder.decode().unwrap();
    assert_eq!(decoded.header.upi, "SCIENCE");
    assert!(matches!(defect, Some(Error::Checksum { want, got }) if want != got));

    for (keep, expect) in [(false, 0usize), (true, 1usize)] {
        let stats = Arc::new(Stats::default());
        let packets = spawn_reassemble(
            std::io::Cursor::new(wire.clone()),
            0,
            8,
            Arc::clone(&stats),
        );
        let validated = spawn_validate(packets, 8, keep, Arc::clone(&stats));
        let got: Vec<Vec<u8>> = validated.iter().collect();
        assert_eq!(got.len(), expect, "keep={keep}");
    }
}

/// A burst of packets goes through reassembly and validation untouched,
/// in order.
#[test]
fn pipeline_preserves_order_and_content() {
    let packets: Vec<Vec<u8>> = (0u8..10)
        .map(|i| make_packet(&make_body(3, 1, 1, &vec![i; 64 + usize::from(i) * 401])))
        .collect();
    let wire = encode_stream(&packets, 5_000);

    let stats = Arc::new(Stats::default());
    let queue = spawn_reassemble(std::io::Cursor::new(wire), 0, 32, Arc::clone(&stats));
    let validated = spawn_validate(queue, 32, false, Arc::clone(&stats));
    let got: Vec<Vec<u8>> = validated.iter().collect();
    assert_eq!(got, packets);

    let snap = stats.snapshot();
    assert_eq!(snap.packets, 10);
    assert_eq!(snap.valid, 10);
    assert_eq!(snap.dropped, 0);
    assert_eq!(snap.missing, 0);
}

/// CRC damage to a frame body is caught by the HRDL trailer: the packet
/// decodes with a checksum defect rather than being lost.
#[test]
fn crc_damaged_frame_resolved_by_trailer() {
    let body = make_body(3, 1, 1, &vec![0x11u8; 1800]);
    let packet = make_packet(&body);
    let mut frames: Vec<Vec<u8>> = packet
        .chunks(CADU_BODY_LEN)
        .enumerate()
        .map(|(i, chunk)| make_cadu(60 + i as u32, chunk))
        .collect();
    // Flip one body byte in the middle frame; its CRC no longer matches
    // and the HRDL checksum must flag the packet.
    frames[1][20] ^= 0x04;
    let crc_region_start = 4;
    assert!(20 > crc_region_start);
    let wire: Vec<u8> = frames.concat();

    let mut asm = Assembler::new(&wire[..], false);
    let emitted = asm.read_packet().unwrap().to_vec();
    assert_eq!(asm.stats().crc_errors.load(std::sync::atomic::Ordering::Relaxed), 1);
    let (_, defect) = hrdl::hrdl::Packet::decode(&emitted).unwrap();
    assert!(matches!(defect, Some(Error::Checksum { .. })));
}

/// The reception prefix is skipped frame by frame when hrdfe is set.
#[test]
fn hrdfe_stream_decodes() {
    let packet = make_packet(&make_body(2, 4, 4, b"tagged"));
    let stream = stuff_bytes(&packet);
    let mut wire = Vec::new();
    for (i, chunk) in stream.chunks(CADU_BODY_LEN).enumerate() {
        wire.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        wire.extend_from_slice(&make_cadu(i as u32, chunk));
    }

    let mut decoder = Decoder::new(&wire[..], true);
    let (decoded, defect) = decoder.decode().unwrap();
    assert!(defect.is_none());
    assert_eq!(decoded.header.upi, "IMAGE");
    assert_eq!(decoded.payload(), b"tagged");
}

/// Corrupting a frame's CRC trailer only (body intact) is counted but
/// harmless.
#[test]
fn crc_trailer_damage_is_counted_only() {
    let packet = make_packet(&make_body(3, 1, 1, &vec![0x77u8; 1500]));
    let mut frames: Vec<Vec<u8>> = packet
        .chunks(CADU_BODY_LEN)
        .enumerate()
        .map(|(i, chunk)| make_cadu(i as u32, chunk))
        .collect();
    frames[0][CADU_TRAILER_INDEX + 1] ^= 0xff;
    let wire: Vec<u8> = frames.concat();

    let mut decoder = Decoder::new(&wire[..], false);
    let (decoded, defect) = decoder.decode().unwrap();
    assert!(defect.is_none());
    assert_eq!(decoded.data, packet);
}
