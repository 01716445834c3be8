//! HRDL packet layer: reassembly and decoding.
//!
//! An HRDL packet is `SYNC(4) | LENGTH(4 LE) | BODY | CKSUM(4 LE)` where
//! LENGTH counts the body only. The body starts with a 16-byte VMU header
//! and a 24-byte HRD common header, followed by a channel-dependent UPI
//! slot and the payload proper.

mod assembler;
mod stuff;

pub use assembler::Assembler;
pub use stuff::{stuff_bytes, unstuff, unstuff_bytes};

use std::io::Read;

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::framing::GPS_UNIX_DELTA;
use crate::sum::sum_hrdl;
use crate::{Error, Result};

/// HRDL sync word delimiting packets in the reassembled byte stream.
pub const SYNC: [u8; 4] = [0xf8, 0x2e, 0x35, 0x53];

/// Escape marker emitted for a sync word inside a packet body.
pub const STUFF: [u8; 4] = [0xf8, 0x2e, 0x35, 0xaa];

/// Sync word plus length field.
pub const HRDL_HEADER_LEN: usize = 8;
pub const HRDL_TRAILER_LEN: usize = 4;
/// Bytes of framing around the body: header plus trailer.
pub const HRDL_META_LEN: usize = HRDL_HEADER_LEN + HRDL_TRAILER_LEN;

pub const VMU_LEN: usize = 16;
pub const HRD_LEN: usize = 24;

/// GPS epoch, 1980-01-06 00:00:00 UTC.
#[must_use]
pub fn gps_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1980, 1, 6, 0, 0, 0).unwrap()
}

/// Join a coarse/fine VMU timestamp into UTC. `coarse` counts seconds
/// since the GPS epoch, `fine` is a 1/65536 s fraction kept at
/// millisecond resolution.
#[must_use]
pub fn join_time(coarse: u32, fine: u16) -> DateTime<Utc> {
    let millis = (f64::from(fine) / 65536.0 * 1000.0) as i64;
    Utc.timestamp_opt(i64::from(coarse) + GPS_UNIX_DELTA, 0)
        .single()
        .unwrap_or_default()
        + Duration::milliseconds(millis)
}

/// Width of the UPI slot for a VMU channel.
#[must_use]
pub fn upi_len(channel: u8) -> usize {
    match channel {
        3 => 32,
        1 | 2 => 52,
        _ => 0,
    }
}

fn default_upi(channel: u8) -> &'static str {
    match channel {
        3 => "SCIENCE",
        1 | 2 => "IMAGE",
        _ => "UNKNOWN",
    }
}

/// The fixed HRDL + VMU + HRD headers of one packet.
#[derive(Debug, Clone, PartialEq)]
pub struct HrdlHeader {
    pub sync: u32,
    /// Declared body length.
    pub size: u32,

    // VMU header
    pub channel: u8,
    pub source: u8,
    pub sequence: u32,
    pub when: DateTime<Utc>,

    // HRD common header
    pub property: u8,
    pub stream: u16,
    pub counter: u32,
    pub acqtime: Duration,
    pub auxtime: Duration,
    pub origin: u8,

    /// Printable payload identifier, defaulted by channel when the slot
    /// is empty or absent.
    pub upi: String,
}

impl HrdlHeader {
    /// Bytes covered by the fixed headers.
    pub const LEN: usize = HRDL_HEADER_LEN + VMU_LEN + HRD_LEN;

    /// Decode the fixed headers and the UPI slot from the start of a
    /// packet, or `None` if there are not enough bytes for the fixed
    /// part.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::LEN {
            return None;
        }
        let le32 = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let le64 = |at: usize| {
            i64::from_le_bytes([
                buf[at],
                buf[at + 1],
                buf[at + 2],
                buf[at + 3],
                buf[at + 4],
                buf[at + 5],
                buf[at + 6],
                buf[at + 7],
            ])
        };

        let channel = buf[8];
        let coarse = le32(16);
        let fine = u16::from_le_bytes([buf[20], buf[21]]);

        let slot = upi_len(channel);
        let upi = buf
            .get(Self::LEN..Self::LEN + slot)
            .map(|bs| {
                // channels with the wide slot carry the identifier in the
                // last 32 bytes
                let printable = &bs[slot - 32.min(slot)..];
                String::from_utf8_lossy(printable)
                    .trim_matches('\0')
                    .to_string()
            })
            .unwrap_or_default();

        Some(HrdlHeader {
            sync: le32(0),
            size: le32(4),
            channel,
            source: buf[9],
            sequence: le32(12),
            when: join_time(coarse, fine),
            property: buf[24],
            stream: u16::from_le_bytes([buf[25], buf[26]]),
            counter: le32(27),
            acqtime: Duration::nanoseconds(le64(31)),
            auxtime: Duration::nanoseconds(le64(39)),
            origin: buf[47],
            upi: if upi.is_empty() {
                default_upi(channel).to_string()
            } else {
                upi
            },
        })
    }

    /// Acquisition time: GPS epoch plus the stored duration.
    #[must_use]
    pub fn acquired(&self) -> DateTime<Utc> {
        gps_epoch() + self.acqtime
    }

    /// Auxiliary time: GPS epoch plus the stored duration.
    #[must_use]
    pub fn auxiliary(&self) -> DateTime<Utc> {
        gps_epoch() + self.auxtime
    }

    /// Realtime when the packet was produced by the unit it originates
    /// from, playback otherwise.
    #[must_use]
    pub fn is_realtime(&self) -> bool {
        self.source == self.origin
    }

    #[must_use]
    pub fn mode(&self) -> &'static str {
        if self.is_realtime() {
            "realtime"
        } else {
            "playback"
        }
    }
}

/// One reassembled HRDL packet: decoded headers plus the full packet
/// bytes (sync word through trailer checksum).
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: HrdlHeader,
    pub data: Vec<u8>,
}

impl Packet {
    /// Decode `buf` into a [Packet], validating the declared length and
    /// the trailer checksum.
    ///
    /// Validation failures do not suppress the decode: the packet is
    /// returned together with the first failed condition so callers can
    /// still log headers for corrupted packets. The length check wins
    /// over the checksum check.
    ///
    /// # Errors
    /// [Error::Length] when `buf` is too short to hold the fixed headers
    /// and trailer at all.
    pub fn decode(buf: &[u8]) -> Result<(Packet, Option<Error>)> {
        let min = HrdlHeader::LEN + HRDL_TRAILER_LEN;
        if buf.len() < min {
            return Err(Error::Length {
                want: min,
                got: buf.len(),
            });
        }
        let header = HrdlHeader::decode(buf).ok_or(Error::Length {
            want: min,
            got: buf.len(),
        })?;

        let mut defect = None;
        let want_len = header.size as usize + HRDL_META_LEN;
        if want_len != buf.len() {
            defect = Some(Error::Length {
                want: want_len,
                got: buf.len(),
            });
        }

        let body = &buf[HRDL_HEADER_LEN..buf.len() - HRDL_TRAILER_LEN];
        let want = u32::from_le_bytes([
            buf[buf.len() - 4],
            buf[buf.len() - 3],
            buf[buf.len() - 2],
            buf[buf.len() - 1],
        ]);
        let got = sum_hrdl(body);
        if want != got && defect.is_none() {
            defect = Some(Error::Checksum { want, got });
        }

        Ok((
            Packet {
                header,
                data: buf.to_vec(),
            },
            defect,
        ))
    }

    /// The checksummed region: everything between the length field and
    /// the trailer.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.data[HRDL_HEADER_LEN..self.data.len() - HRDL_TRAILER_LEN]
    }

    /// The payload past the fixed headers and the UPI slot.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        let start = (HrdlHeader::LEN + upi_len(self.header.channel)).min(self.data.len() - HRDL_TRAILER_LEN);
        &self.data[start..self.data.len() - HRDL_TRAILER_LEN]
    }

    /// Trailer checksum as stored on the wire.
    #[must_use]
    pub fn checksum(&self) -> u32 {
        u32::from_le_bytes([
            self.data[self.data.len() - 4],
            self.data[self.data.len() - 3],
            self.data[self.data.len() - 2],
            self.data[self.data.len() - 1],
        ])
    }
}

/// Couples an [Assembler] with [Packet::decode] for file-oriented use.
pub struct Decoder<R> {
    inner: Assembler<R>,
}

impl<R: Read> Decoder<R> {
    pub fn new(reader: R, hrdfe: bool) -> Self {
        Decoder {
            inner: Assembler::new(reader, hrdfe),
        }
    }

    pub fn from_assembler(inner: Assembler<R>) -> Self {
        Decoder { inner }
    }

    /// Decode the next packet from the stream.
    ///
    /// # Errors
    /// [Error::Gap] when a sequence gap abandoned an in-flight packet
    /// (call again to continue), [Error::Eof] at end of stream.
    pub fn decode(&mut self) -> Result<(Packet, Option<Error>)> {
        let buf = self.inner.read_packet()?;
        Packet::decode(buf)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Encode a packet body: VMU + HRD headers, UPI slot, payload.
    pub(crate) fn make_body(channel: u8, source: u8, origin: u8, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        // VMU header
        body.push(channel);
        body.push(source);
        body.extend_from_slice(&0u16.to_le_bytes()); // spare
        body.extend_from_slice(&9u32.to_le_bytes()); // sequence
        body.extend_from_slice(&1000u32.to_le_bytes()); // coarse
        body.extend_from_slice(&32768u16.to_le_bytes()); // fine: half a second
        body.extend_from_slice(&0u16.to_le_bytes()); // spare
        // HRD common header
        body.push(1); // property
        body.extend_from_slice(&2u16.to_le_bytes()); // stream
        body.extend_from_slice(&7u32.to_le_bytes()); // counter
        body.extend_from_slice(&1_000_000_000i64.to_le_bytes()); // acqtime
        body.extend_from_slice(&2_000_000_000i64.to_le_bytes()); // auxtime
        body.push(origin);
        body.extend_from_slice(&vec![0u8; upi_len(channel)]);
        body.extend_from_slice(payload);
        body
    }

    pub(crate) fn make_packet(body: &[u8]) -> Vec<u8> {
        let mut bs = Vec::with_capacity(body.len() + HRDL_META_LEN);
        bs.extend_from_slice(&SYNC);
        bs.extend_from_slice(&(body.len() as u32).to_le_bytes());
        bs.extend_from_slice(body);
        bs.extend_from_slice(&sum_hrdl(body).to_le_bytes());
        bs
    }

    #[test]
    fn decode_science_packet() {
        let body = make_body(3, 1, 1, b"HELLO");
        assert_eq!(body.len(), 5 + VMU_LEN + HRD_LEN + 32);
        let (packet, defect) = Packet::decode(&make_packet(&body)).unwrap();

        assert!(defect.is_none());
        assert_eq!(packet.header.size, 77);
        assert_eq!(packet.header.channel, 3);
        assert_eq!(packet.header.upi, "SCIENCE");
        assert_eq!(packet.header.sequence, 9);
        assert_eq!(packet.header.counter, 7);
        assert!(packet.header.is_realtime());
        assert_eq!(packet.payload(), b"HELLO");
        assert_eq!(packet.checksum(), sum_hrdl(&body));
    }

    #[test]
    fn decode_image_channel_upi() {
        let mut body = make_body(2, 1, 1, b"img");
        // identifier lives in the last 32 bytes of the 52-byte slot
        let at = VMU_LEN + HRD_LEN + 20;
        body[at..at + 4].copy_from_slice(b"OSMO");
        let (packet, defect) = Packet::decode(&make_packet(&body)).unwrap();
        assert!(defect.is_none());
        assert_eq!(packet.header.upi, "OSMO");
    }

    #[test]
    fn decode_unknown_channel_has_empty_slot() {
        let body = make_body(9, 2, 4, b"raw");
        let (packet, defect) = Packet::decode(&make_packet(&body)).unwrap();
        assert!(defect.is_none());
        assert_eq!(packet.header.upi, "UNKNOWN");
        assert_eq!(packet.payload(), b"raw");
        assert_eq!(packet.header.mode(), "playback");
    }

    #[test]
    fn decode_flags_checksum_error_with_record() {
        let body = make_body(3, 1, 1, b"HELLO");
        let mut bs = make_packet(&body);
        let at = bs.len() - HRDL_TRAILER_LEN - 1;
        bs[at] ^= 0x01;
        let (packet, defect) = Packet::decode(&bs).unwrap();
        // Partial success: the headers still decode.
        assert_eq!(packet.header.channel, 3);
        match defect {
            Some(Error::Checksum { want, got }) => assert_ne!(want, got),
            other => panic!("expected checksum defect, got {other:?}"),
        }
    }

    #[test]
    fn decode_flags_length_error_first() {
        let body = make_body(3, 1, 1, b"HELLO");
        let mut bs = make_packet(&body);
        // Declare one byte more than the body carries.
        bs[4..8].copy_from_slice(&(body.len() as u32 + 1).to_le_bytes());
        let (_, defect) = Packet::decode(&bs).unwrap();
        assert!(matches!(defect, Some(Error::Length { want, got })
            if want == body.len() + HRDL_META_LEN + 1 && got == bs.len()));
    }

    #[test]
    fn decode_too_short_is_error() {
        assert!(Packet::decode(&SYNC).is_err());
    }

    #[test]
    fn single_bit_flip_always_detected() {
        let body = make_body(3, 1, 1, b"sensitive");
        for at in 0..body.len() {
            let mut corrupt = body.clone();
            corrupt[at] ^= 0x01;
            let mut bs = make_packet(&body);
            bs[HRDL_HEADER_LEN..HRDL_HEADER_LEN + body.len()].copy_from_slice(&corrupt);
            let (_, defect) = Packet::decode(&bs).unwrap();
            assert!(
                matches!(defect, Some(Error::Checksum { .. })),
                "flip at {at} went undetected",
            );
        }
    }

    #[test]
    fn join_time_applies_gps_delta() {
        let t = join_time(0, 0);
        assert_eq!(t, gps_epoch() + Duration::seconds(crate::framing::LEAP_SECONDS));
        let t = join_time(10, 32768);
        assert_eq!(
            t,
            gps_epoch()
                + Duration::seconds(10 + crate::framing::LEAP_SECONDS)
                + Duration::milliseconds(500),
        );
    }

    #[test]
    fn acquisition_time_counts_from_gps_epoch() {
        let body = make_body(3, 1, 1, b"t");
        let (packet, _) = Packet::decode(&make_packet(&body)).unwrap();
        assert_eq!(packet.header.acquired(), gps_epoch() + Duration::seconds(1));
        assert_eq!(packet.header.auxiliary(), gps_epoch() + Duration::seconds(2));
    }
}
