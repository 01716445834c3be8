//! HRDL reassembly across CADU boundaries.

use std::io::Read;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::framing::{missing_count, CaduReader, CADU_BODY_LEN, TIMETAG_LEN};
use crate::hrdl::stuff::{find, unstuff_bytes};
use crate::hrdl::{HRDL_HEADER_LEN, HRDL_META_LEN, STUFF, SYNC};
use crate::pipeline::Stats;
use crate::{Error, Result};

/// Upper bound on one reassembled packet; buffers never grow past this.
const MAX_PACKET_LEN: usize = 8 << 20;

/// Reassembles HRDL packets from the concatenated CADU payload stream.
///
/// The machine walks SEARCH_SYNC, READ_HEADER, FILL_BODY and EMIT:
/// discover a sync word, read the declared length, accumulate payload
/// until the declared length is exhausted or the next sync word appears,
/// then unstuff and emit. The bytes from the next sync onward are carried
/// into the following packet.
///
/// A sequence gap while a packet is in flight abandons that packet and
/// only that packet; CRC-bad frames contribute their payload and are
/// counted, since the HRDL trailer checksum is the final arbiter of
/// validity.
pub struct Assembler<R> {
    inner: CaduReader<R>,
    /// Raw (still stuffed) accumulation; the packet starts at offset 0
    /// once a sync word has been found.
    buffer: Vec<u8>,
    /// Unstuffed emission buffer, reused across packets.
    out: Vec<u8>,
    /// Carry: tail bytes past the end of the previous packet.
    rest: Vec<u8>,
    stats: Arc<Stats>,
}

impl<R: Read> Assembler<R> {
    /// Assemble from a raw CADU byte stream. `hrdfe` skips the 8-byte
    /// reception prefix ahead of every frame.
    pub fn new(inner: R, hrdfe: bool) -> Self {
        let skip = if hrdfe { TIMETAG_LEN } else { 0 };
        Self::from_reader(CaduReader::new(inner, skip))
    }

    /// Assemble from an existing body-mode [CaduReader].
    pub fn from_reader(inner: CaduReader<R>) -> Self {
        Assembler {
            inner,
            buffer: Vec::with_capacity(256 << 10),
            out: Vec::with_capacity(256 << 10),
            rest: Vec::new(),
            stats: Arc::new(Stats::default()),
        }
    }

    /// Share `stats` with the pipeline instead of the private default.
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<Stats>) -> Self {
        self.stats = stats;
        self
    }

    #[must_use]
    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    /// Read the next complete HRDL packet, unstuffed, borrowed from the
    /// internal buffer until the next call.
    ///
    /// # Errors
    /// - [Error::Gap] when a missing CADU abandoned the in-flight packet;
    ///   reassembly continues on the next call;
    /// - [Error::Eof] at end of stream;
    /// - [Error::Io] on upstream failures.
    pub fn read_packet(&mut self) -> Result<&[u8]> {
        'packet: loop {
            debug_assert!(self.buffer.is_empty());
            self.buffer.append(&mut self.rest);

            // SEARCH_SYNC: drop everything ahead of the first sync word.
            loop {
                if let Some(ix) = find(&self.buffer, &SYNC) {
                    self.discard(ix);
                    self.buffer.drain(..ix);
                    break;
                }
                // A sync word may straddle the block boundary.
                let keep = self.buffer.len().min(SYNC.len() - 1);
                self.discard(self.buffer.len() - keep);
                self.buffer.drain(..self.buffer.len() - keep);
                if let Err(err) = self.next_body() {
                    match err {
                        // Nothing in flight yet: fold the post-gap block
                        // back in and keep scanning.
                        Error::Gap { .. } => self.buffer.append(&mut self.rest),
                        _ => return Err(err),
                    }
                }
            }

            // READ_HEADER: sync plus little-endian length.
            while self.buffer.len() < HRDL_HEADER_LEN {
                if let Err(err) = self.next_body() {
                    self.abandon();
                    return Err(err);
                }
            }
            let declared = u32::from_le_bytes([
                self.buffer[4],
                self.buffer[5],
                self.buffer[6],
                self.buffer[7],
            ]) as usize;
            let total = declared.saturating_add(HRDL_META_LEN);
            if total > MAX_PACKET_LEN {
                trace!(declared, "implausible declared length, resyncing");
                self.discard(SYNC.len());
                let tail = self.buffer.split_off(SYNC.len());
                self.buffer.clear();
                self.rest = tail;
                continue 'packet;
            }

            // FILL_BODY: accumulate until the next sync word or the
            // declared length, whichever fires first.
            let mut scan = HRDL_HEADER_LEN;
            loop {
                let start = scan.min(self.buffer.len());
                if let Some(ix) = find(&self.buffer[start..], &SYNC) {
                    let k = start + ix;
                    self.rest.extend_from_slice(&self.buffer[k..]);
                    self.buffer.truncate(k);
                    return self.emit();
                }
                scan = self
                    .buffer
                    .len()
                    .saturating_sub(SYNC.len() - 1)
                    .max(HRDL_HEADER_LEN);

                match self.next_body() {
                    Ok(()) => {}
                    Err(err @ Error::Gap { .. }) => {
                        self.abandon();
                        return Err(err);
                    }
                    Err(err) if err.is_eof() => {
                        if self.buffer.len() >= total {
                            // Complete apart from trailing padding, which
                            // the truncation and the unstuff trim drop.
                            let target = self.raw_target(total).min(self.buffer.len());
                            self.buffer.truncate(target);
                            return self.emit();
                        }
                        self.abandon();
                        return Err(err);
                    }
                    Err(err) => return Err(err),
                }

                let target = self.raw_target(total);
                if self.buffer.len() >= target {
                    self.rest.extend_from_slice(&self.buffer[target..]);
                    self.buffer.truncate(target);
                    return self.emit();
                }
            }
        }
    }

    /// On-wire length needed for `total` logical bytes: every escape
    /// marker inside the packet region stretches it by one byte.
    fn raw_target(&self, total: usize) -> usize {
        let mut raw = total;
        loop {
            let end = raw.min(self.buffer.len());
            let mut markers = 0;
            let mut at = HRDL_HEADER_LEN;
            // A marker counts when it starts inside the packet region,
            // even if it straddles the current boundary.
            while at < end {
                match find(&self.buffer[at..], &STUFF) {
                    Some(ix) if at + ix < end => {
                        markers += 1;
                        at += ix + STUFF.len();
                    }
                    _ => break,
                }
            }
            let next = total + markers;
            if next <= raw {
                return raw;
            }
            raw = next;
        }
    }

    /// Pull one CADU body into the accumulation buffer. On a sequence
    /// gap the buffer is left untouched and the post-gap body seeds the
    /// carry instead, so the caller can abandon cleanly.
    fn next_body(&mut self) -> Result<()> {
        let mut block = [0u8; CADU_BODY_LEN];
        loop {
            match self.inner.read(&mut block) {
                Ok(n) => {
                    self.buffer.extend_from_slice(&block[..n]);
                    return Ok(());
                }
                Err(Error::Crc { want, got }) => {
                    self.stats.crc_errors.fetch_add(1, Relaxed);
                    trace!(want, got, "cadu crc mismatch, keeping body");
                    self.buffer.extend_from_slice(&block);
                    return Ok(());
                }
                Err(Error::Gap { from, to }) => {
                    self.stats
                        .missing
                        .fetch_add(u64::from(missing_count(from, to)), Relaxed);
                    self.rest.clear();
                    self.rest.extend_from_slice(&block);
                    return Err(Error::Gap { from, to });
                }
                Err(Error::BadMagic) => {
                    warn!("frame without magic word skipped");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Unstuff the accumulated packet and hand it out.
    fn emit(&mut self) -> Result<&[u8]> {
        self.out.resize(self.buffer.len(), 0);
        let n = unstuff_bytes(&self.buffer, &mut self.out);
        self.out.truncate(n);
        self.buffer.clear();
        self.stats.packets.fetch_add(1, Relaxed);
        self.stats.bytes.fetch_add(n as u64, Relaxed);
        Ok(&self.out)
    }

    /// Drop the in-flight packet.
    fn abandon(&mut self) {
        self.discard(self.buffer.len());
        self.buffer.clear();
    }

    fn discard(&mut self, n: usize) {
        if n > 0 {
            self.stats.discarded.fetch_add(n as u64, Relaxed);
        }
    }
}
