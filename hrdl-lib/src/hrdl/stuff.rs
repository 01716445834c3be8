//! Byte stuffing.
//!
//! Inside a packet body any occurrence of the sync word would be
//! indistinguishable from the start of the next packet, so the producer
//! inserts `0xAA` before the final `0x53`: `F8 2E 35 53` travels as
//! `F8 2E 35 AA 53`. The first 8 bytes of a packet (sync and length) are
//! never subject to the escape.

use crate::framing::CADU_BODY_LEN;
use crate::hrdl::{HRDL_HEADER_LEN, HRDL_META_LEN, STUFF, SYNC};

/// First occurrence of `word` in `buf`.
pub(crate) fn find(buf: &[u8], word: &[u8; 4]) -> Option<usize> {
    buf.windows(word.len()).position(|w| w == word)
}

/// Escape every sync word at offset >= 8 of `bs`.
#[must_use]
pub fn stuff_bytes(bs: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bs.len() + 8);
    let mut offset = HRDL_HEADER_LEN.min(bs.len());
    out.extend_from_slice(&bs[..offset]);
    while let Some(ix) = find(&bs[offset..], &SYNC) {
        out.extend_from_slice(&bs[offset..offset + ix]);
        out.extend_from_slice(&STUFF);
        // resume at the trailing 0x53 so it is emitted after the marker
        offset += ix + SYNC.len() - 1;
    }
    out.extend_from_slice(&bs[offset..]);
    out
}

/// Reverse of [stuff_bytes], writing the logical packet into `dst` and
/// returning its length.
///
/// Trailing filler beyond the declared length is trimmed first when it is
/// a whole number of CADU bodies. Stuff markers are only removed while
/// the remaining length still exceeds the declared length: a packet whose
/// raw length already matches its declaration cannot contain an escape,
/// which keeps the operation a left-inverse of [stuff_bytes] even for
/// bodies that happen to contain the marker pattern.
///
/// `dst` must hold at least `src.len()` bytes.
pub fn unstuff_bytes(src: &[u8], dst: &mut [u8]) -> usize {
    if src.len() < HRDL_HEADER_LEN {
        return 0;
    }
    assert!(dst.len() >= src.len(), "unstuff destination too short");

    let declared = u32::from_le_bytes([src[4], src[5], src[6], src[7]]) as usize + HRDL_META_LEN;
    let mut n = src.len();
    if n > declared && (n - declared) % CADU_BODY_LEN == 0 {
        n = declared;
    }
    let src = &src[..n];

    let mut written = 0;
    let mut offset = 0;
    if n > declared {
        let mut scan = HRDL_HEADER_LEN;
        while let Some(ix) = find(&src[scan..], &STUFF) {
            let marker = scan + ix;
            let keep = marker + STUFF.len() - 1;
            dst[written..written + keep - offset].copy_from_slice(&src[offset..keep]);
            written += keep - offset;
            // drop the inserted 0xAA
            offset = marker + STUFF.len();
            scan = offset;
        }
    }
    dst[written..written + n - offset].copy_from_slice(&src[offset..]);
    written + n - offset
}

/// Convenience wrapper around [unstuff_bytes] allocating the output.
#[must_use]
pub fn unstuff(src: &[u8]) -> Vec<u8> {
    let mut dst = vec![0u8; src.len()];
    let n = unstuff_bytes(src, &mut dst);
    dst.truncate(n);
    dst
}
