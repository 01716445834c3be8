use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hrdl::pipeline::{spawn_reporter, Stats};
use hrdl::store::{Archive, Rotation};
use tracing::{info, warn};

use crate::ingest;

pub struct Options {
    pub local: String,
    pub dir: PathBuf,
    pub queue: usize,
    pub buffer: usize,
    pub keep: bool,
    pub skip: usize,
    pub proxy: Option<String>,
    pub payload: u8,
    pub interval: u64,
    pub idle: u64,
    pub max_bytes: u64,
    pub max_count: u64,
}

pub fn run(opts: Options) -> Result<()> {
    let rotation = Rotation {
        interval: Duration::from_secs(opts.interval),
        idle: Duration::from_secs(opts.idle),
        max_bytes: opts.max_bytes,
        max_packets: opts.max_count,
    };
    let mut archive = Archive::create(&opts.dir, opts.payload, rotation)
        .with_context(|| format!("creating archive under {}", opts.dir.display()))?;

    let stats = Arc::new(Stats::default());
    spawn_reporter(&stats, Duration::from_secs(5));
    let packets = ingest::open(
        &opts.local,
        &ingest::Options {
            queue: opts.queue,
            buffer: opts.buffer,
            keep: opts.keep,
            skip: opts.skip,
            proxy: opts.proxy.clone(),
        },
        Arc::clone(&stats),
    )?;

    info!("storing {} under {}", opts.local, opts.dir.display());
    for packet in packets {
        if let Err(err) = archive.write_packet(&packet) {
            warn!("packet not stored: {err}");
        }
    }
    archive.flush()?;
    info!("ingress closed, store done");
    Ok(())
}
