//! CADU/VCDU transport framing.
//!
//! A CADU is a fixed 1024-byte frame: a 4-byte magic word, a 10-byte VCDU
//! header, a 1008-byte body and a 2-byte CRC trailer. Frames travel
//! back-to-back with no delimiter, optionally prefixed by an 8-byte
//! reception timetag when the stream carries the hrdfe prefix.

use std::io::Read;

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::sum::{ccitt, CcittCrc, FILLER_CRC};
use crate::{Error, Result};

/// CADU magic word marking the start of every frame.
pub const MAGIC: [u8; 4] = [0x1a, 0xcf, 0xfc, 0x1d];

pub const CADU_LEN: usize = 1024;
pub const CADU_HEADER_LEN: usize = 14;
pub const CADU_TRAILER_LEN: usize = 2;
pub const CADU_BODY_LEN: usize = CADU_LEN - CADU_HEADER_LEN - CADU_TRAILER_LEN;
pub const CADU_TRAILER_INDEX: usize = CADU_HEADER_LEN + CADU_BODY_LEN;

/// Mask for the 24-bit CADU sequence counter.
pub const COUNTER_MASK: u32 = 0xff_ffff;

/// Length of the optional hrdfe reception prefix (coarse u32 + fine u32).
pub const TIMETAG_LEN: usize = 8;

/// Forward distance of a sequence gap: the number of frames missing
/// between counter `from` and counter `to`, modulo 2^24.
#[must_use]
pub fn missing_count(from: u32, to: u32) -> u32 {
    (to.wrapping_sub(from) & COUNTER_MASK).wrapping_sub(1) & COUNTER_MASK
}

/// Contents of a decoded VCDU header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcduHeader {
    pub version: u8,
    pub spacecraft: u8,
    pub channel: u8,
    /// 24-bit frame counter.
    pub sequence: u32,
    /// Replay flag from the signaling field. Preserved in decoded
    /// records, never consulted by reassembly.
    pub replay: bool,
    pub control: u16,
    /// Data field status word.
    pub data: u16,
}

impl VcduHeader {
    /// Construct from the first [CADU_HEADER_LEN] bytes of a frame, or
    /// `None` if there are not enough bytes.
    #[must_use]
    pub fn decode(dat: &[u8]) -> Option<Self> {
        if dat.len() < CADU_HEADER_LEN {
            return None;
        }
        let pid = u16::from_be_bytes([dat[4], dat[5]]);
        let seq = u32::from_be_bytes([dat[6], dat[7], dat[8], dat[9]]);
        Some(VcduHeader {
            version: ((pid & 0xc000) >> 14) as u8,
            spacecraft: ((pid & 0x3fc0) >> 6) as u8,
            channel: (pid & 0x003f) as u8,
            sequence: seq >> 8,
            replay: (seq >> 7) & 1 == 1,
            control: u16::from_be_bytes([dat[10], dat[11]]),
            data: u16::from_be_bytes([dat[12], dat[13]]),
        })
    }
}

/// A single decoded CADU, used by the file-oriented commands. The
/// streaming path goes through [CaduReader] instead and never builds
/// these.
#[derive(Debug)]
pub struct Cadu {
    pub header: VcduHeader,
    /// Reception time decoded from the hrdfe prefix, when present.
    pub reception: Option<DateTime<Utc>>,
    /// The full 1024 frame bytes.
    pub data: Vec<u8>,
    /// CRC disposition; `Some` when the trailer did not match.
    pub error: Option<Error>,
}

impl Cadu {
    /// Decode one frame from `dat`, which must hold at least [CADU_LEN]
    /// bytes past `skip` prefix bytes. When `skip` is [TIMETAG_LEN] the
    /// prefix is decoded into [Cadu::reception].
    pub fn decode(dat: &[u8], skip: usize) -> Result<Cadu> {
        if dat.len() < skip + CADU_LEN {
            return Err(Error::Eof);
        }
        let reception = if skip == TIMETAG_LEN {
            let coarse = u32::from_le_bytes([dat[0], dat[1], dat[2], dat[3]]);
            let fine = u32::from_le_bytes([dat[4], dat[5], dat[6], dat[7]]);
            Some(
                Utc.timestamp_opt(i64::from(coarse) + GPS_UNIX_DELTA, 0)
                    .single()
                    .unwrap_or_default()
                    + Duration::microseconds(i64::from(fine)),
            )
        } else {
            None
        };
        let frame = &dat[skip..skip + CADU_LEN];
        let header = VcduHeader::decode(frame).ok_or(Error::Eof)?;
        let want = u16::from_be_bytes([frame[CADU_TRAILER_INDEX], frame[CADU_TRAILER_INDEX + 1]]);
        let got = ccitt(&frame[4..CADU_TRAILER_INDEX]);
        let error = (want != got).then_some(Error::Crc { want, got });
        Ok(Cadu {
            header,
            reception,
            data: frame.to_vec(),
            error,
        })
    }

    /// The 1008 payload bytes.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.data[CADU_HEADER_LEN..CADU_TRAILER_INDEX]
    }

    /// Trailer CRC as stored on the wire.
    #[must_use]
    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([
            self.data[CADU_TRAILER_INDEX],
            self.data[CADU_TRAILER_INDEX + 1],
        ])
    }

    /// True when the body is the all-zero filler pattern.
    #[must_use]
    pub fn is_fill(&self) -> bool {
        ccitt(self.body()) == FILLER_CRC
    }

    /// Frames missing between `prev` and this one, zero when contiguous.
    #[must_use]
    pub fn missing_from(&self, prev: &Cadu) -> u32 {
        let delta = self.header.sequence.wrapping_sub(prev.header.sequence) & COUNTER_MASK;
        if delta > 1 {
            missing_count(prev.header.sequence, self.header.sequence)
        } else {
            0
        }
    }
}

/// Seconds between the unix epoch and the GPS epoch (1980-01-06 UTC),
/// plus the current leap-second offset applied to reception timestamps.
pub const GPS_UNIX_DELTA: i64 = 315_964_800 + LEAP_SECONDS;

/// Leap-second offset at time of writing.
pub const LEAP_SECONDS: i64 = 18;

/// Streaming CADU reader.
///
/// Each call to [CaduReader::read] consumes exactly one frame's worth of
/// upstream bytes (`skip` prefix bytes plus [CADU_LEN]), verifies the
/// magic word and the trailer CRC, and tracks the 24-bit sequence
/// counter. In body mode only the 1008 payload bytes are copied out; in
/// full mode the whole 1024-byte frame is.
///
/// CRC mismatches and sequence gaps are reported through the error but
/// do not abort iteration: the frame is consumed and its bytes are still
/// written to the destination, so callers can keep the payload while
/// recording the condition.
pub struct CaduReader<R> {
    inner: R,
    skip: usize,
    body: bool,
    prev: Option<u32>,
    crc: CcittCrc,
    frame: Vec<u8>,
}

impl<R: Read> CaduReader<R> {
    /// Body-mode reader: yields the 1008 payload bytes per frame.
    pub fn new(inner: R, skip: usize) -> Self {
        CaduReader {
            inner,
            skip,
            body: true,
            prev: None,
            crc: CcittCrc::new(),
            frame: vec![0u8; skip + CADU_LEN],
        }
    }

    /// Full-frame reader: yields all 1024 frame bytes per frame, prefix
    /// excluded.
    pub fn full(inner: R, skip: usize) -> Self {
        CaduReader {
            body: false,
            ..Self::new(inner, skip)
        }
    }

    /// Bytes written to the destination per frame in the current mode.
    #[must_use]
    pub fn frame_len(&self) -> usize {
        if self.body {
            CADU_BODY_LEN
        } else {
            CADU_LEN
        }
    }

    /// Last sequence counter observed.
    #[must_use]
    pub fn last_sequence(&self) -> Option<u32> {
        self.prev
    }

    /// Read the next frame into `dst`, returning the number of bytes
    /// written ([CaduReader::frame_len]).
    ///
    /// # Errors
    /// - [Error::Eof] when the upstream ends (also mid-frame);
    /// - [Error::BadMagic] when the frame does not start with [MAGIC];
    ///   the frame is consumed but nothing is copied;
    /// - [Error::Crc] and [Error::Gap] report frame-level conditions;
    ///   the frame was consumed and `frame_len()` bytes were written to
    ///   `dst`. When both occur the CRC error wins.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        read_full(&mut self.inner, &mut self.frame)?;
        let frame = &self.frame[self.skip..];
        if frame[..MAGIC.len()] != MAGIC {
            return Err(Error::BadMagic);
        }

        self.crc.reset();
        self.crc.write(&frame[4..CADU_TRAILER_INDEX]);
        let want = u16::from_be_bytes([frame[CADU_TRAILER_INDEX], frame[CADU_TRAILER_INDEX + 1]]);
        let got = self.crc.sum16();
        let mut err = None;
        if want != got {
            err = Some(Error::Crc { want, got });
        }

        let curr = u32::from_be_bytes([frame[6], frame[7], frame[8], frame[9]]) >> 8;
        if let Some(prev) = self.prev {
            let delta = curr.wrapping_sub(prev) & COUNTER_MASK;
            if (curr < prev || (delta > 1 && delta != curr)) && err.is_none() {
                err = Some(Error::Gap {
                    from: prev,
                    to: curr,
                });
            }
        }
        self.prev = Some(curr);

        let n = self.frame_len();
        if self.body {
            dst[..n].copy_from_slice(&frame[CADU_HEADER_LEN..CADU_TRAILER_INDEX]);
        } else {
            dst[..n].copy_from_slice(frame);
        }
        match err {
            Some(err) => Err(err),
            None => Ok(n),
        }
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::Eof),
        Err(err) => Err(Error::Io(err)),
    }
}
