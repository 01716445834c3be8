use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hrdl::pipeline::{spawn_reporter, Stats};
use hrdl::relay::{Instance, Pool};
use tracing::{info, warn};

use crate::ingest;

pub struct Options {
    pub local: String,
    pub remote: String,
    pub queue: usize,
    pub buffer: usize,
    pub instance: i32,
    pub keep: bool,
    pub rate: Option<u64>,
    pub skip: usize,
    pub proxy: Option<String>,
    pub connections: usize,
}

pub fn run(opts: Options) -> Result<()> {
    let instance = Instance::parse(opts.instance).context("instance flag")?;
    let remote = opts
        .remote
        .parse()
        .with_context(|| format!("remote address {}", opts.remote))?;
    let pool = Pool::new(remote, opts.connections, instance, opts.rate)
        .context("dialing downstream pool")?;

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

    info!("relaying {} to {} ({})", opts.local, opts.remote, instance.label());
    for packet in packets {
        if let Err(err) = pool.write(&packet) {
            warn!("packet not relayed: {err}");
        }
    }
    info!("ingress closed, relay done");
    Ok(())
}
