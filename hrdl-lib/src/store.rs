//! Rotating HRDP archive writer.
//!
//! Validated packets are persisted under `YYYY/DDD/HH/` with a 14-byte
//! HRDP header ahead of each packet carrying the payload id, the packet
//! channel and two 5-byte GPS timestamps (acquisition and reception).

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, Timelike, Utc};
use tracing::{debug, info};

use crate::framing::LEAP_SECONDS;
use crate::hrdl::gps_epoch;
use crate::Result;

/// HRDP per-packet header length.
pub const HRDP_HEADER_LEN: usize = 14;

/// Rotation policy: a zero duration or count disables that trigger. Any
/// satisfied trigger rotates the current file.
#[derive(Debug, Clone, Copy)]
pub struct Rotation {
    /// Elapsed time since the file was opened.
    pub interval: Duration,
    /// Time since the last write.
    pub idle: Duration,
    /// Bytes written to the file.
    pub max_bytes: u64,
    /// Packets written to the file.
    pub max_packets: u64,
}

impl Default for Rotation {
    fn default() -> Self {
        Rotation {
            interval: Duration::from_secs(300),
            idle: Duration::ZERO,
            max_bytes: 0,
            max_packets: 0,
        }
    }
}

/// Encode GPS-epoch-relative seconds plus milliseconds as the 5-byte
/// stamp used by HRDP headers: big-endian seconds followed by a 1/256 s
/// fraction, rounded up.
#[must_use]
pub fn stamp(secs: u32, millis: u32) -> [u8; 5] {
    let fine = ((millis * 256).div_ceil(1000)).min(255) as u8;
    let mut out = [0u8; 5];
    out[..4].copy_from_slice(&secs.to_be_bytes());
    out[4] = fine;
    out
}

/// Encode a wall-clock UTC instant as a 5-byte GPS stamp. The current
/// leap-second offset is applied to land on the GPS second count; VMU
/// times are already GPS-relative on the wire and go through [stamp]
/// directly instead.
#[must_use]
pub fn gps_stamp(t: DateTime<Utc>) -> [u8; 5] {
    let since = t.signed_duration_since(gps_epoch());
    let secs = (since.num_seconds() + LEAP_SECONDS).max(0) as u32;
    let millis = u32::try_from(since.subsec_nanos().max(0) / 1_000_000).unwrap_or(0);
    stamp(secs, millis)
}

/// Rotating archive writer.
pub struct Archive {
    dir: PathBuf,
    payload: u8,
    rotation: Rotation,
    writer: Option<BufWriter<File>>,
    path: PathBuf,
    opened: Instant,
    last_write: Instant,
    bytes: u64,
    packets: u64,
    seq: u32,
}

impl Archive {
    /// Create the archive root and open the first file.
    ///
    /// # Errors
    /// [crate::Error::Io] on filesystem failures.
    pub fn create(dir: impl Into<PathBuf>, payload: u8, rotation: Rotation) -> Result<Archive> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let mut archive = Archive {
            dir,
            payload,
            rotation,
            writer: None,
            path: PathBuf::new(),
            opened: Instant::now(),
            last_write: Instant::now(),
            bytes: 0,
            packets: 0,
            seq: 0,
        };
        archive.open_next()?;
        Ok(archive)
    }

    /// Path of the file currently being written.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one packet, rotating first when the policy says so.
    ///
    /// # Errors
    /// [crate::Error::Io] on write or rotation failures.
    pub fn write_packet(&mut self, packet: &[u8]) -> Result<()> {
        if self.should_rotate() {
            self.rotate()?;
        }

        // Acquisition comes straight off the packet's VMU coarse/fine
        // pair, which already counts GPS seconds; reception is the wall
        // clock.
        let acquisition = if packet.len() >= 22 {
            let coarse = u32::from_le_bytes([packet[16], packet[17], packet[18], packet[19]]);
            let fine = u16::from_le_bytes([packet[20], packet[21]]);
            stamp(coarse, u32::from(fine) * 1000 / 65536)
        } else {
            gps_stamp(Utc::now())
        };
        let channel = packet.get(8).copied().unwrap_or_default();

        let writer = self.writer.as_mut().expect("archive file open");
        let size = (packet.len() + HRDP_HEADER_LEN) as u32;
        writer.write_all(&size.to_le_bytes())?;
        writer.write_all(&0u16.to_be_bytes())?;
        writer.write_all(&[self.payload, channel])?;
        writer.write_all(&acquisition)?;
        writer.write_all(&gps_stamp(Utc::now()))?;
        writer.write_all(packet)?;

        self.bytes += u64::from(size);
        self.packets += 1;
        self.last_write = Instant::now();
        Ok(())
    }

    fn should_rotate(&self) -> bool {
        let r = &self.rotation;
        if self.packets == 0 {
            // Never rotate an empty file on time alone.
            return false;
        }
        (!r.interval.is_zero() && self.opened.elapsed() >= r.interval)
            || (!r.idle.is_zero() && self.last_write.elapsed() >= r.idle)
            || (r.max_bytes > 0 && self.bytes >= r.max_bytes)
            || (r.max_packets > 0 && self.packets >= r.max_packets)
    }

    /// Close the current file and open the next one.
    ///
    /// # Errors
    /// [crate::Error::Io] on flush or create failures.
    pub fn rotate(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            info!(
                "rotated {} ({} packets, {} bytes)",
                self.path.display(),
                self.packets,
                self.bytes,
            );
        }
        self.open_next()
    }

    fn open_next(&mut self) -> Result<()> {
        let now = Utc::now();
        let dir = self
            .dir
            .join(format!("{:04}", now.year()))
            .join(format!("{:03}", now.ordinal()))
            .join(format!("{:02}", now.hour()));
        fs::create_dir_all(&dir)?;
        self.seq += 1;
        let name = format!(
            "rt_{:06}_{:02}{:02}{:02}.dat",
            self.seq,
            now.hour(),
            now.minute(),
            now.second(),
        );
        self.path = dir.join(name);
        debug!("archive file {}", self.path.display());
        self.writer = Some(BufWriter::new(File::create(&self.path)?));
        self.opened = Instant::now();
        self.last_write = Instant::now();
        self.bytes = 0;
        self.packets = 0;
        Ok(())
    }

    /// Flush buffered bytes to disk.
    ///
    /// # Errors
    /// [crate::Error::Io] on flush failures.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for Archive {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
