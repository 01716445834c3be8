//! Pipeline stages: reassembly and validation tasks wired over bounded
//! channels, plus the shared statistics they report.
//!
//! The topology for a single ingress is
//! `socket -> ring -> assemble -> validate -> { pool | archive }` with
//! one thread per stage. Stages never block the assembler: when a queue
//! is full the packet is dropped and counted.

use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, TrySendError};
use tracing::{info, warn};

use crate::framing::CaduReader;
use crate::hrdl::{Assembler, HRDL_HEADER_LEN, HRDL_META_LEN, HRDL_TRAILER_LEN};
use crate::sum::sum_hrdl;
use crate::Error;

/// Monotonic pipeline counters. Updated with relaxed ordering; readers
/// take loosely-consistent snapshots.
#[derive(Debug, Default)]
pub struct Stats {
    /// Packets emitted by the assembler.
    pub packets: AtomicU64,
    /// Packets dropped on a full queue.
    pub dropped: AtomicU64,
    /// Bytes emitted by the assembler.
    pub bytes: AtomicU64,
    /// Packets that passed validation.
    pub valid: AtomicU64,
    /// Packets dropped for a length mismatch.
    pub err_length: AtomicU64,
    /// Packets with a trailer checksum mismatch.
    pub err_checksum: AtomicU64,
    /// CADUs lost to sequence gaps.
    pub missing: AtomicU64,
    /// CADUs with a CRC mismatch.
    pub crc_errors: AtomicU64,
    /// Bytes discarded while searching for a sync word or abandoning
    /// packets.
    pub discarded: AtomicU64,
}

/// A loosely-consistent copy of [Stats].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub packets: u64,
    pub dropped: u64,
    pub bytes: u64,
    pub valid: u64,
    pub err_length: u64,
    pub err_checksum: u64,
    pub missing: u64,
    pub crc_errors: u64,
    pub discarded: u64,
}

impl Stats {
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            packets: self.packets.load(Relaxed),
            dropped: self.dropped.load(Relaxed),
            bytes: self.bytes.load(Relaxed),
            valid: self.valid.load(Relaxed),
            err_length: self.err_length.load(Relaxed),
            err_checksum: self.err_checksum.load(Relaxed),
            missing: self.missing.load(Relaxed),
            crc_errors: self.crc_errors.load(Relaxed),
            discarded: self.discarded.load(Relaxed),
        }
    }
}

impl Snapshot {
    fn delta(self, earlier: Snapshot) -> Snapshot {
        Snapshot {
            packets: self.packets - earlier.packets,
            dropped: self.dropped - earlier.dropped,
            bytes: self.bytes - earlier.bytes,
            valid: self.valid - earlier.valid,
            err_length: self.err_length - earlier.err_length,
            err_checksum: self.err_checksum - earlier.err_checksum,
            missing: self.missing - earlier.missing,
            crc_errors: self.crc_errors - earlier.crc_errors,
            discarded: self.discarded - earlier.discarded,
        }
    }

    fn is_quiet(self) -> bool {
        self == Snapshot::default()
    }
}

/// Periodically log a per-period summary of `stats`. The thread exits
/// once the pipeline holding the other references is gone.
pub fn spawn_reporter(stats: &Arc<Stats>, period: Duration) -> thread::JoinHandle<()> {
    let stats: Weak<Stats> = Arc::downgrade(stats);
    thread::Builder::new()
        .name("report".into())
        .spawn(move || {
            let mut last = Snapshot::default();
            loop {
                thread::sleep(period);
                let Some(stats) = stats.upgrade() else { break };
                let now = stats.snapshot();
                let d = now.delta(last);
                last = now;
                if d.is_quiet() {
                    continue;
                }
                info!(
                    "{} packets, {} dropped, {}KB, {} valid, {} length error, {} checksum error, {} missing cadus, {} crc error, {} bytes discarded",
                    d.packets,
                    d.dropped,
                    d.bytes >> 10,
                    d.valid,
                    d.err_length,
                    d.err_checksum,
                    d.missing,
                    d.crc_errors,
                    d.discarded,
                );
            }
        })
        .expect("failed to spawn reporter thread")
}

/// Spawn the reassembly stage: reads CADUs from `reader` and queues
/// complete HRDL packets. The task ends at EOF or on a terminal error;
/// a full queue drops the packet rather than blocking.
pub fn spawn_reassemble<R>(reader: R, skip: usize, queue: usize, stats: Arc<Stats>) -> Receiver<Vec<u8>>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = bounded(queue.max(1));
    thread::Builder::new()
        .name("assemble".into())
        .spawn(move || {
            let mut asm = Assembler::from_reader(CaduReader::new(reader, skip))
                .with_stats(Arc::clone(&stats));
            loop {
                match asm.read_packet() {
                    Ok(packet) => match tx.try_send(packet.to_vec()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            stats.dropped.fetch_add(1, Relaxed);
                        }
                        Err(TrySendError::Disconnected(_)) => break,
                    },
                    // Gaps were already counted; the stream continues.
                    Err(Error::Gap { .. }) => {}
                    Err(err) if err.is_eof() => break,
                    Err(err) => {
                        warn!("reassembly stopped: {err}");
                        break;
                    }
                }
            }
        })
        .expect("failed to spawn assemble thread");
    rx
}

/// Spawn the validation stage. Buffers longer than their declared length
/// are truncated; length errors are dropped unconditionally; checksum
/// errors are dropped unless `keep` is set. Valid or kept packets are
/// forwarded whole.
pub fn spawn_validate(
    input: Receiver<Vec<u8>>,
    queue: usize,
    keep: bool,
    stats: Arc<Stats>,
) -> Receiver<Vec<u8>> {
    let (tx, rx) = bounded(queue.max(1));
    thread::Builder::new()
        .name("validate".into())
        .spawn(move || {
            for mut packet in input {
                if packet.len() < HRDL_META_LEN {
                    stats.err_length.fetch_add(1, Relaxed);
                    continue;
                }
                let declared =
                    u32::from_le_bytes([packet[4], packet[5], packet[6], packet[7]]) as usize;
                let total = declared.saturating_add(HRDL_META_LEN);
                if total < packet.len() {
                    packet.truncate(total);
                } else if total > packet.len() {
                    stats.err_length.fetch_add(1, Relaxed);
                    continue;
                }

                let body = &packet[HRDL_HEADER_LEN..packet.len() - HRDL_TRAILER_LEN];
                let want = u32::from_le_bytes([
                    packet[packet.len() - 4],
                    packet[packet.len() - 3],
                    packet[packet.len() - 2],
                    packet[packet.len() - 1],
                ]);
                if sum_hrdl(body) != want {
                    stats.err_checksum.fetch_add(1, Relaxed);
                    if !keep {
                        continue;
                    }
                } else {
                    stats.valid.fetch_add(1, Relaxed);
                }

                match tx.try_send(packet) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        stats.dropped.fetch_add(1, Relaxed);
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
        })
        .expect("failed to spawn validate thread");
    rx
}
