//! Replay archived CADU files to a remote socket at a capped rate.

use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use hrdl::framing::{CaduReader, CADU_LEN, TIMETAG_LEN};
use hrdl::net::{dial, Addr, RateLimited};
use tracing::info;

use crate::report::MultiReader;

pub fn run(remote: &str, files: &[PathBuf], rate: Option<u64>, hrdfe: bool) -> Result<()> {
    let addr: Addr = remote
        .parse()
        .with_context(|| format!("remote address {remote}"))?;
    let conn = dial(&addr).with_context(|| format!("dialing {addr}"))?;
    let mut writer = RateLimited::new(conn, rate);

    let skip = if hrdfe { TIMETAG_LEN } else { 0 };
    let mut reader = CaduReader::full(MultiReader::open(files)?, skip);

    let mut frame = [0u8; CADU_LEN];
    let mut count = 0u64;
    let mut size = 0u64;
    let mut total = 0u64;
    let mut tick = Instant::now();
    loop {
        match reader.read(&mut frame) {
            // Gaps and CRC errors in an archive are replayed as-is.
            Ok(_) | Err(hrdl::Error::Crc { .. }) | Err(hrdl::Error::Gap { .. }) => {}
            Err(hrdl::Error::BadMagic) => continue,
            Err(err) if err.is_eof() => break,
            Err(err) => return Err(err.into()),
        }
        writer.write_all(&frame)?;
        count += 1;
        size += CADU_LEN as u64;
        if tick.elapsed() >= Duration::from_secs(1) {
            info!("{} packets, {}KB", count, size >> 10);
            total += count;
            count = 0;
            size = 0;
            tick = Instant::now();
        }
    }
    writer.flush()?;
    info!("replay done ({} cadus)", total + count);
    Ok(())
}
