//! Split the HRDL packets of a CADU stream into one file per channel.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use hrdl::hrdl::Decoder;
use hrdl::Error;
use tracing::info;

use crate::report::MultiReader;

pub fn run(files: &[PathBuf], dir: &Path, hrdfe: bool) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let reader = MultiReader::open(files)?;
    let mut decoder = Decoder::new(reader, hrdfe);

    let mut outputs: HashMap<u8, BufWriter<File>> = HashMap::new();
    let mut counts: HashMap<u8, u64> = HashMap::new();
    let mut skipped = 0u64;
    loop {
        match decoder.decode() {
            Ok((packet, defect)) => {
                if defect.is_some() {
                    skipped += 1;
                    continue;
                }
                let channel = packet.header.channel;
                let writer = match outputs.entry(channel) {
                    std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                    std::collections::hash_map::Entry::Vacant(e) => {
                        let path = dir.join(format!("channel_{channel:02x}.dat"));
                        let file = File::create(&path)
                            .with_context(|| format!("creating {}", path.display()))?;
                        e.insert(BufWriter::new(file))
                    }
                };
                writer.write_all(&packet.data)?;
                *counts.entry(channel).or_default() += 1;
            }
            Err(Error::Gap { .. }) => continue,
            Err(err) if err.is_eof() => break,
            Err(err) => return Err(err.into()),
        }
    }
    for (channel, writer) in &mut outputs {
        writer.flush()?;
        info!(
            "channel {:02x}: {} packets",
            channel,
            counts.get(channel).copied().unwrap_or_default(),
        );
    }
    if skipped > 0 {
        info!("{skipped} corrupt packets skipped");
    }
    Ok(())
}
