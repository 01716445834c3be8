//! Shared socket ingress for the relay and store daemons.
//!
//! Every ingress stream runs the same topology: socket reader feeding a
//! lossy ring buffer, a reassembly task and a validation task. UDP opens
//! one stream; TCP accepts any number of connections, each with an
//! independent pipeline merged into a single validated-packet queue.

use std::io::{Read, Write};
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use hrdl::net::{dial, listen_tcp, listen_udp, Addr, Conn, Scheme, Tee};
use hrdl::pipeline::{spawn_reassemble, spawn_validate, Stats};
use hrdl::ring::{ring, DEFAULT_SLOT_LEN};
use tracing::{info, warn};

pub struct Options {
    pub queue: usize,
    pub buffer: usize,
    pub keep: bool,
    pub skip: usize,
    pub proxy: Option<String>,
}

/// Open `local` and return the stream of validated HRDL packets.
pub fn open(local: &str, opts: &Options, stats: Arc<Stats>) -> Result<Receiver<Vec<u8>>> {
    let addr: Addr = local.parse().with_context(|| format!("ingress address {local}"))?;
    let proxy = match &opts.proxy {
        Some(target) => {
            let addr: Addr = target.parse().with_context(|| format!("proxy address {target}"))?;
            Some(addr)
        }
        None => None,
    };
    match addr.scheme {
        Scheme::Udp => {
            let socket = listen_udp(&addr)?;
            info!("listening on {addr}");
            Ok(spawn_stream(Conn::Udp(socket), opts, proxy.as_ref(), stats))
        }
        Scheme::Tcp => {
            let listener = listen_tcp(&addr)?;
            info!("listening on {addr}");
            let (tx, rx) = bounded(opts.queue.max(1));
            let forward = ForwardOpts {
                queue: opts.queue,
                buffer: opts.buffer,
                keep: opts.keep,
                skip: opts.skip,
                proxy,
            };
            thread::Builder::new()
                .name("accept".into())
                .spawn(move || {
                    for conn in listener.incoming() {
                        match conn {
                            Ok(conn) => {
                                let peer = conn
                                    .peer_addr()
                                    .map(|a| a.to_string())
                                    .unwrap_or_else(|_| "?".into());
                                info!("connection from {peer}");
                                spawn_forward(Conn::Tcp(conn), &forward, tx.clone(), Arc::clone(&stats));
                            }
                            Err(err) => {
                                warn!("accept failed: {err}");
                                break;
                            }
                        }
                    }
                })
                .context("spawning accept loop")?;
            Ok(rx)
        }
    }
}

struct ForwardOpts {
    queue: usize,
    buffer: usize,
    keep: bool,
    skip: usize,
    proxy: Option<Addr>,
}

/// Wire one connection into its own pipeline.
fn spawn_stream(
    conn: Conn,
    opts: &Options,
    proxy: Option<&Addr>,
    stats: Arc<Stats>,
) -> Receiver<Vec<u8>> {
    let (ring_writer, ring_reader) = ring(opts.buffer, DEFAULT_SLOT_LEN);
    spawn_pump(conn, ring_writer, proxy);
    let packets = spawn_reassemble(ring_reader, opts.skip, opts.queue, Arc::clone(&stats));
    spawn_validate(packets, opts.queue, opts.keep, stats)
}

/// Per-connection pipeline whose validated packets merge into `tx`.
fn spawn_forward(conn: Conn, opts: &ForwardOpts, tx: Sender<Vec<u8>>, stats: Arc<Stats>) {
    let stream_opts = Options {
        queue: opts.queue,
        buffer: opts.buffer,
        keep: opts.keep,
        skip: opts.skip,
        proxy: None,
    };
    let validated = spawn_stream(conn, &stream_opts, opts.proxy.as_ref(), Arc::clone(&stats));
    thread::Builder::new()
        .name("forward".into())
        .spawn(move || {
            for packet in validated {
                match tx.try_send(packet) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        stats.dropped.fetch_add(1, Relaxed);
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
        })
        .expect("failed to spawn forward thread");
}

/// Copy socket bytes into the ring, teeing the raw stream to the proxy
/// when one is configured.
fn spawn_pump(mut conn: Conn, ring_writer: hrdl::ring::RingWriter, proxy: Option<&Addr>) {
    let tee = proxy.and_then(|addr| match dial(addr) {
        Ok(conn) => {
            info!("proxying raw cadus to {addr}");
            Some(conn)
        }
        Err(err) => {
            warn!("proxy dial {addr} failed: {err}");
            None
        }
    });
    thread::Builder::new()
        .name("ingest".into())
        .spawn(move || {
            let mut writer = Tee::new(ring_writer, tee);
            let mut block = vec![0u8; DEFAULT_SLOT_LEN];
            loop {
                match conn.read(&mut block) {
                    Ok(0) => break,
                    Ok(n) => {
                        if writer.write_all(&block[..n]).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!("socket read failed: {err}");
                        break;
                    }
                }
            }
        })
        .expect("failed to spawn ingest thread");
}
