//! File-oriented reporting commands: list, count, index, inspect, dump.

use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use hrdl::framing::{
    missing_count, Cadu, CaduReader, CADU_BODY_LEN, CADU_LEN, TIMETAG_LEN,
};
use hrdl::hrdl::{join_time, Decoder, HRDL_HEADER_LEN, SYNC, VMU_LEN};
use hrdl::sum::{ccitt, FILLER_CRC};
use hrdl::Error;

/// Reads a sorted list of files back to back.
pub struct MultiReader {
    current: Option<File>,
    files: VecDeque<PathBuf>,
}

impl MultiReader {
    pub fn open(paths: &[PathBuf]) -> Result<MultiReader> {
        if paths.is_empty() {
            bail!("no files given");
        }
        let mut paths = paths.to_vec();
        paths.sort();
        let mut files: VecDeque<PathBuf> = paths.into();
        let first = files.pop_front().expect("at least one file");
        let current = File::open(&first).with_context(|| format!("opening {}", first.display()))?;
        Ok(MultiReader {
            current: Some(current),
            files,
        })
    }
}

impl Read for MultiReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let Some(file) = self.current.as_mut() else {
                return Ok(0);
            };
            match file.read(buf)? {
                0 => {
                    self.current = match self.files.pop_front() {
                        Some(next) => Some(File::open(next)?),
                        None => None,
                    };
                }
                n => return Ok(n),
            }
        }
    }
}

fn skip_len(hrdfe: bool) -> usize {
    if hrdfe {
        TIMETAG_LEN
    } else {
        0
    }
}

/// One row per decoded HRDL packet, then a summary.
pub fn list(files: &[PathBuf], hrdfe: bool) -> Result<()> {
    let reader = MultiReader::open(files)?;
    let mut decoder = Decoder::new(reader, hrdfe);

    let mut total = 0u64;
    let mut err_length = 0u64;
    let mut err_sum = 0u64;
    let mut missing = 0u64;
    loop {
        match decoder.decode() {
            Ok((packet, defect)) => {
                total += 1;
                let kind = match defect {
                    None => "-",
                    Some(Error::Length { .. }) => {
                        err_length += 1;
                        "bad length"
                    }
                    Some(Error::Checksum { .. }) => {
                        err_sum += 1;
                        "bad sum"
                    }
                    Some(_) => "?",
                };
                let h = &packet.header;
                println!(
                    "{:6} | {:7} | {:02x} | {} | {:9} | {} | {} | {:02x} | {:8} | {} | {:16} | {:x} | {}",
                    total,
                    h.size,
                    h.channel,
                    h.when.format("%Y-%m-%d %H:%M:%S%.3f"),
                    h.sequence,
                    h.acquired().format("%Y-%m-%d %H:%M:%S%.3f"),
                    h.auxiliary().format("%H:%M:%S%.3f"),
                    h.origin,
                    h.counter,
                    h.mode(),
                    h.upi,
                    md5::compute(&packet.data),
                    kind,
                );
            }
            Err(Error::Gap { from, to }) => missing += u64::from(missing_count(from, to)),
            Err(err) if err.is_eof() => break,
            Err(err) => return Err(err.into()),
        }
    }
    eprintln!(
        "{total} HRDL packets, {err_sum} invalid cks, {err_length} invalid len, {missing} missing cadus",
    );
    Ok(())
}

#[derive(Debug, Default)]
struct Coze {
    count: u64,
    size: u64,
    missing: u64,
    first: u32,
    last: u32,
}

/// Per-channel or per-origin packet accounting.
pub fn count(files: &[PathBuf], hrdfe: bool, by: &str) -> Result<()> {
    type KeyFn = fn(&hrdl::hrdl::HrdlHeader) -> (u16, u32);
    let key: KeyFn = match by {
        "channel" | "" => |h| (u16::from(h.channel), h.sequence),
        "origin" => |h| ((u16::from(h.source) << 8) | u16::from(h.origin), h.counter),
        other => bail!("unrecognized grouping {other}"),
    };

    let reader = MultiReader::open(files)?;
    let mut decoder = Decoder::new(reader, hrdfe);
    let mut zs: BTreeMap<u16, Coze> = BTreeMap::new();
    let mut err_length = 0u64;
    let mut err_sum = 0u64;
    let mut err_missing = 0u64;
    loop {
        match decoder.decode() {
            Ok((packet, defect)) => {
                match defect {
                    Some(Error::Length { .. }) => {
                        err_length += 1;
                        continue;
                    }
                    Some(Error::Checksum { .. }) => {
                        err_sum += 1;
                        continue;
                    }
                    _ => {}
                }
                let (id, seq) = key(&packet.header);
                let z = zs.entry(id).or_insert_with(|| Coze {
                    first: seq,
                    last: seq,
                    ..Coze::default()
                });
                if z.count > 0 {
                    z.missing += u64::from(seq.saturating_sub(z.last).saturating_sub(1));
                }
                z.count += 1;
                z.size += u64::from(packet.header.size);
                z.last = seq;
            }
            Err(Error::Gap { from, to }) => err_missing += u64::from(missing_count(from, to)),
            Err(err) if err.is_eof() => break,
            Err(err) => return Err(err.into()),
        }
    }

    let mut total = Coze::default();
    for (id, z) in &zs {
        total.count += z.count;
        total.size += z.size;
        println!(
            "{by} {:02x}: total: {:7} - first: {:8} - last: {:8} - missing: {:8} - size: {}MB",
            id,
            z.count,
            z.first,
            z.last,
            z.missing,
            z.size >> 20,
        );
    }
    println!(
        "{} VMU packets ({} cadus missing, {} bad sum, {} bad length, {}KB)",
        total.count,
        err_missing,
        err_sum,
        err_length,
        total.size >> 10,
    );
    Ok(())
}

/// One row per HRDL packet located inside the raw CADU stream, without
/// reassembling: useful to find where packets sit.
pub fn index(files: &[PathBuf], hrdfe: bool) -> Result<()> {
    let reader = MultiReader::open(files)?;
    let mut reader = CaduReader::new(reader, skip_len(hrdfe));

    let header_len = HRDL_HEADER_LEN + VMU_LEN;
    let mut block = [0u8; CADU_BODY_LEN];
    let mut buffer: Vec<u8> = Vec::new();
    let mut frame = 0u64;
    let mut pid = 0u64;
    let mut cadu_seq = 0u32;
    let mut missing = 0u64;
    loop {
        match reader.read(&mut block) {
            Ok(_) | Err(Error::Crc { .. }) => {}
            Err(Error::Gap { from, to }) => {
                missing += u64::from(missing_count(from, to));
                buffer.clear();
            }
            Err(err) if err.is_eof() => break,
            Err(Error::BadMagic) => continue,
            Err(err) => return Err(err.into()),
        }
        frame += 1;
        cadu_seq = reader.last_sequence().unwrap_or(cadu_seq);
        buffer.extend_from_slice(&block);

        let mut offset = 0;
        while let Some(ix) = find(&buffer[offset..]) {
            let cut = offset + ix;
            if buffer.len() - cut < header_len {
                break;
            }
            pid += 1;
            let bs = &buffer[cut..];
            let size = u32::from_le_bytes([bs[4], bs[5], bs[6], bs[7]]);
            let channel = bs[8];
            let seq = u32::from_le_bytes([bs[12], bs[13], bs[14], bs[15]]);
            let coarse = u32::from_le_bytes([bs[16], bs[17], bs[18], bs[19]]);
            let fine = u16::from_le_bytes([bs[20], bs[21]]);
            println!(
                "{:9} | {:9} | {:9} | {:9} | {:8} | {:02x} | {:8} | {}",
                pid,
                frame,
                cadu_seq,
                missing,
                size,
                channel,
                seq,
                join_time(coarse, fine).format("%Y-%m-%d %H:%M:%S%.3f"),
            );
            offset = cut + header_len;
        }
        // Keep a tail in case a sync word straddles the boundary.
        let keep = buffer.len().min(header_len);
        buffer.drain(..buffer.len() - keep);
    }
    Ok(())
}

/// CADU-level audit with filler classification.
pub fn inspect(files: &[PathBuf], hrdfe: bool) -> Result<()> {
    let reader = MultiReader::open(files)?;
    let mut reader = CaduReader::new(reader, skip_len(hrdfe));

    let mut block = [0u8; CADU_BODY_LEN];
    let mut total = 0u64;
    let mut size = 0u64;
    let mut missing = 0u64;
    let mut invalid = 0u64;
    let mut fillers = 0u64;
    let mut packets = 0u64;
    let mut declared = 0u64;
    loop {
        let mut skip_body = false;
        match reader.read(&mut block) {
            Ok(_) => {}
            Err(Error::Crc { .. }) => {
                invalid += 1;
                skip_body = true;
            }
            Err(Error::Gap { from, to }) => {
                missing += u64::from(missing_count(from, to));
                skip_body = true;
            }
            Err(Error::BadMagic) => continue,
            Err(err) if err.is_eof() => break,
            Err(err) => return Err(err.into()),
        }
        total += 1;
        size += CADU_BODY_LEN as u64;
        if skip_body {
            continue;
        }
        if ccitt(&block) == FILLER_CRC {
            fillers += 1;
            size -= CADU_BODY_LEN as u64;
            continue;
        }
        let mut offset = 0;
        while let Some(ix) = find(&block[offset..]) {
            let cut = offset + ix;
            packets += 1;
            if block.len() - cut >= HRDL_HEADER_LEN {
                declared += u64::from(u32::from_le_bytes([
                    block[cut + 4],
                    block[cut + 5],
                    block[cut + 6],
                    block[cut + 7],
                ]));
            }
            offset = cut + SYNC.len();
        }
    }
    let avg = if packets > 0 { (declared / packets) >> 10 } else { 0 };
    println!(
        "{} cadus ({}KB), {} missing, {} invalid, {} filler, {} packets (avg: {}KB, sum: {}KB)",
        total,
        size >> 10,
        missing,
        invalid,
        fillers,
        packets,
        avg,
        declared >> 10,
    );
    Ok(())
}

/// One row per CADU.
pub fn dump(files: &[PathBuf], hrdfe: bool) -> Result<()> {
    let mut reader = MultiReader::open(files)?;
    let skip = skip_len(hrdfe);
    let mut raw = vec![0u8; skip + CADU_LEN];

    let mut count = 0u64;
    let mut corrupted = 0u64;
    let mut missing = 0u64;
    let mut prev: Option<Cadu> = None;
    loop {
        match reader.read_exact(&mut raw) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let cadu = Cadu::decode(&raw, skip)?;
        count += 1;
        let delta = prev.as_ref().map(|p| cadu.missing_from(p)).unwrap_or(0);
        missing += u64::from(delta);
        let err = match &cadu.error {
            Some(err) => {
                corrupted += 1;
                err.to_string()
            }
            None => "-".to_string(),
        };
        let h = &cadu.header;
        let reception = cadu
            .reception
            .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:8} | {} | {:3} | {:3} | {:3} | {:12} | {:6} | {:04x} | {:04x} | {:04x} | {:4} | {}",
            count,
            reception,
            h.version,
            h.spacecraft,
            h.channel,
            h.sequence,
            h.replay,
            h.control,
            h.data,
            cadu.checksum(),
            delta,
            err,
        );
        prev = Some(cadu);
    }
    eprintln!("{count} cadus found ({missing} missing, {corrupted} corrupted)");
    Ok(())
}

fn find(buf: &[u8]) -> Option<usize> {
    buf.windows(SYNC.len()).position(|w| w == SYNC)
}
