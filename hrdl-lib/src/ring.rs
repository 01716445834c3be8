//! Lossy single-producer single-consumer byte ring.
//!
//! Decouples bursty socket arrival from CPU-bound reassembly. The writer
//! never blocks and never allocates once constructed: datagrams are
//! copied into recycled slots and pushed onto a fixed-capacity queue.
//! When the reader lags, the oldest slot is displaced and its bytes are
//! silently lost; the CADU reader downstream reports the discontinuity
//! as a sequence gap, so no explicit error is raised here.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::Backoff;

/// Default slot size: comfortably holds one network datagram.
pub const DEFAULT_SLOT_LEN: usize = 8 << 10;

struct Shared {
    slots: ArrayQueue<Vec<u8>>,
    free: ArrayQueue<Vec<u8>>,
    slot_len: usize,
    closed: AtomicBool,
    overruns: AtomicU64,
}

/// Create a ring of roughly `capacity` bytes split into `slot_len`-sized
/// slots. Each write fills one slot, so `slot_len` bounds the largest
/// datagram carried intact.
#[must_use]
pub fn ring(capacity: usize, slot_len: usize) -> (RingWriter, RingReader) {
    let count = (capacity / slot_len).max(2);
    // One spare beyond the queue depth for the slot in reader transit.
    let free = ArrayQueue::new(count + 1);
    for _ in 0..count + 1 {
        let _ = free.push(Vec::with_capacity(slot_len));
    }
    let shared = Arc::new(Shared {
        slots: ArrayQueue::new(count),
        free,
        slot_len,
        closed: AtomicBool::new(false),
        overruns: AtomicU64::new(0),
    });
    (
        RingWriter {
            shared: Arc::clone(&shared),
        },
        RingReader {
            shared,
            current: Vec::new(),
            pos: 0,
        },
    )
}

/// Producer half of the ring. Dropping it signals end of stream to the
/// reader once the queued slots drain.
pub struct RingWriter {
    shared: Arc<Shared>,
}

impl RingWriter {
    /// Writes that displaced an unread slot.
    #[must_use]
    pub fn overruns(&self) -> u64 {
        self.shared.overruns.load(Relaxed)
    }
}

impl Write for RingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut slot = self
            .shared
            .free
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.shared.slot_len));
        slot.clear();
        let n = buf.len().min(self.shared.slot_len);
        slot.extend_from_slice(&buf[..n]);
        if let Some(displaced) = self.shared.slots.force_push(slot) {
            self.shared.overruns.fetch_add(1, Relaxed);
            let _ = self.shared.free.push(displaced);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for RingWriter {
    fn drop(&mut self) {
        self.shared.closed.store(true, Relaxed);
    }
}

/// Consumer half of the ring.
pub struct RingReader {
    shared: Arc<Shared>,
    current: Vec<u8>,
    pos: usize,
}

impl Read for RingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let backoff = Backoff::new();
        loop {
            if self.pos < self.current.len() {
                let n = buf.len().min(self.current.len() - self.pos);
                buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            match self.shared.slots.pop() {
                Some(slot) => {
                    let spent = std::mem::replace(&mut self.current, slot);
                    let _ = self.shared.free.push(spent);
                    self.pos = 0;
                    backoff.reset();
                }
                None => {
                    if self.shared.closed.load(Relaxed) && self.shared.slots.is_empty() {
                        return Ok(0);
                    }
                    if backoff.is_completed() {
                        std::thread::sleep(std::time::Duration::from_millis(1));
                    } else {
                        backoff.snooze();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn bytes_round_trip_across_threads() {
        let (mut writer, mut reader) = ring(64 << 10, 1 << 10);
        let handle = thread::spawn(move || {
            for i in 0..32u8 {
                writer.write_all(&[i; 100]).unwrap();
            }
        });
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        handle.join().unwrap();
        assert_eq!(out.len(), 3200);
        for (i, chunk) in out.chunks(100).enumerate() {
            assert!(chunk.iter().all(|&b| b == i as u8));
        }
    }

    #[test]
    fn writer_never_blocks_and_displaces_oldest() {
        let (mut writer, mut reader) = ring(4 << 10, 1 << 10);
        // Capacity is 4 slots; write 10 datagrams with no reader active.
        for i in 0..10u8 {
            writer.write_all(&[i; 8]).unwrap();
        }
        assert_eq!(writer.overruns(), 6);
        drop(writer);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        // The four newest datagrams survive.
        assert_eq!(out, [[6u8; 8], [7u8; 8], [8u8; 8], [9u8; 8]].concat());
    }

    #[test]
    fn oversize_datagram_is_clamped_to_slot() {
        let (mut writer, mut reader) = ring(8 << 10, 16);
        writer.write_all(&[0xAB; 64]).unwrap();
        drop(writer);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![0xAB; 16]);
    }

    #[test]
    fn reader_sees_eof_only_after_drain() {
        let (mut writer, mut reader) = ring(4 << 10, 64);
        writer.write_all(b"tail").unwrap();
        drop(writer);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"tail");
    }
}
