//! Synthetic downlink stream builders shared by the integration tests.

use hrdl::framing::{CADU_BODY_LEN, CADU_HEADER_LEN, CADU_LEN, CADU_TRAILER_INDEX, MAGIC};
use hrdl::hrdl::{stuff_bytes, upi_len, HRDL_META_LEN, SYNC};
use hrdl::sum::{ccitt, sum_hrdl};

/// Encode a packet body: VMU header, HRD common header, UPI slot,
/// payload.
pub fn make_body(channel: u8, source: u8, origin: u8, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(channel);
    body.push(source);
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&1u32.to_le_bytes()); // VMU sequence
    body.extend_from_slice(&5_000u32.to_le_bytes()); // coarse
    body.extend_from_slice(&0u16.to_le_bytes()); // fine
    body.extend_from_slice(&0u16.to_le_bytes());
    body.push(0x10); // property
    body.extend_from_slice(&1u16.to_le_bytes()); // stream
    body.extend_from_slice(&1u32.to_le_bytes()); // counter
    body.extend_from_slice(&3_600_000_000_000i64.to_le_bytes()); // acqtime
    body.extend_from_slice(&60_000_000_000i64.to_le_bytes()); // auxtime
    body.push(origin);
    body.extend_from_slice(&vec![0u8; upi_len(channel)]);
    body.extend_from_slice(payload);
    body
}

/// Frame a body into a full HRDL packet.
pub fn make_packet(body: &[u8]) -> Vec<u8> {
    let mut bs = Vec::with_capacity(body.len() + HRDL_META_LEN);
    bs.extend_from_slice(&SYNC);
    bs.extend_from_slice(&(body.len() as u32).to_le_bytes());
    bs.extend_from_slice(body);
    bs.extend_from_slice(&sum_hrdl(body).to_le_bytes());
    bs
}

/// One well-formed CADU around up to 1008 body bytes.
pub fn make_cadu(seq: u32, body: &[u8]) -> Vec<u8> {
    assert!(body.len() <= CADU_BODY_LEN);
    let mut frame = vec![0u8; CADU_LEN];
    frame[..4].copy_from_slice(&MAGIC);
    let pid: u16 = (1 << 14) | (0x2b << 6) | 5;
    frame[4..6].copy_from_slice(&pid.to_be_bytes());
    frame[6..10].copy_from_slice(&(seq << 8).to_be_bytes());
    frame[CADU_HEADER_LEN..CADU_HEADER_LEN + body.len()].copy_from_slice(body);
    let crc = ccitt(&frame[4..CADU_TRAILER_INDEX]);
    frame[CADU_TRAILER_INDEX..].copy_from_slice(&crc.to_be_bytes());
    frame
}

/// Stuff each packet, concatenate, and wrap the result into CADUs.
pub fn encode_stream(packets: &[Vec<u8>], first_seq: u32) -> Vec<u8> {
    let mut stream = Vec::new();
    for p in packets {
        stream.extend_from_slice(&stuff_bytes(p));
    }
    caduize(&stream, first_seq)
}

/// Wrap raw bytes into CADUs, zero-padding the last frame.
pub fn caduize(stream: &[u8], first_seq: u32) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, chunk) in stream.chunks(CADU_BODY_LEN).enumerate() {
        out.extend_from_slice(&make_cadu(first_seq + i as u32, chunk));
    }
    out
}
