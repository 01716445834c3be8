//! Downstream debugging: decode re-framed HRDL packets from a listener,
//! or watch raw CADU arrival statistics on a UDP port.

use std::io::Read;
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use crossbeam::channel::{bounded, Sender};
use hrdl::framing::{CADU_LEN, COUNTER_MASK, MAGIC};
use hrdl::hrdl::{HRDL_TRAILER_LEN, SYNC};
use hrdl::net::{listen_tcp, listen_udp, Addr, Scheme};
use hrdl::relay::Instance;
use hrdl::sum::sum_hrdl;
use tracing::{info, warn};

/// Accept re-framed HRDL streams and print one row per packet.
pub fn listen(local: &str, queue: usize, instance: i32) -> Result<()> {
    let instance = Instance::parse(instance).context("instance flag")?;
    let addr: Addr = local
        .parse()
        .with_context(|| format!("listen address {local}"))?;
    if addr.scheme != Scheme::Tcp {
        bail!("debug requires a tcp listen address");
    }
    let listener = listen_tcp(&addr)?;
    info!("listening on {addr}");

    let (tx, rx) = bounded::<Vec<u8>>(queue.max(1));
    thread::Builder::new()
        .name("accept".into())
        .spawn(move || {
            for conn in listener.incoming() {
                match conn {
                    Ok(conn) => {
                        let tx = tx.clone();
                        thread::spawn(move || read_packets(conn, &tx));
                    }
                    Err(err) => {
                        warn!("accept failed: {err}");
                        break;
                    }
                }
            }
        })
        .context("spawning accept loop")?;

    let kind = match instance {
        Instance::Raw => "HRDL",
        Instance::Hadock(_) => "HDK",
    };
    let mut last: std::collections::HashMap<u8, u32> = std::collections::HashMap::new();
    for (i, bs) in rx.iter().enumerate() {
        // bs holds BODY plus trailer checksum.
        if bs.len() < 8 + HRDL_TRAILER_LEN {
            continue;
        }
        let channel = bs[0];
        let curr = u32::from_le_bytes([bs[4], bs[5], bs[6], bs[7]]);
        let prev = last.insert(channel, curr).unwrap_or(curr);
        let missing = match curr.wrapping_sub(prev) {
            delta if delta > 1 && delta < curr => delta - 1,
            _ => 0,
        };
        let body = &bs[..bs.len() - HRDL_TRAILER_LEN];
        let want = u32::from_le_bytes([
            bs[bs.len() - 4],
            bs[bs.len() - 3],
            bs[bs.len() - 2],
            bs[bs.len() - 1],
        ]);
        println!(
            "{:5} | {:5} | {:7} | {:8} | {:7} | {:12} | {:x} | {:08x} | {:08x}",
            kind,
            instance.label(),
            i + 1,
            body.len(),
            curr,
            missing,
            md5::compute(bs.as_slice()),
            want,
            sum_hrdl(body),
        );
    }
    Ok(())
}

/// Parse `SYNC | size u32 LE | size bytes | cksum` records off one
/// connection.
fn read_packets(mut conn: TcpStream, tx: &Sender<Vec<u8>>) {
    let mut header = [0u8; 8];
    loop {
        if conn.read_exact(&mut header).is_err() {
            return;
        }
        let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if header[..4] != SYNC || size > (8 << 20) {
            // Out of sync; drop the connection rather than guessing.
            warn!("stream out of sync, closing connection");
            return;
        }
        let mut bs = vec![0u8; size + HRDL_TRAILER_LEN];
        if conn.read_exact(&mut bs).is_err() {
            return;
        }
        // Lossy on a full queue, like every other stage.
        let _ = tx.try_send(bs);
    }
}

/// Print per-second statistics about raw CADU arrival on a UDP port.
pub fn trace(local: &str) -> Result<()> {
    let addr: Addr = local
        .parse()
        .with_context(|| format!("listen address {local}"))?;
    if addr.scheme != Scheme::Udp {
        bail!("trace requires a udp listen address");
    }
    let socket = listen_udp(&addr)?;
    info!("tracing {addr}");

    let mut body = [0u8; CADU_LEN];
    let mut count = 0u64;
    let mut size = 0u64;
    let mut err_size = 0u64;
    let mut err_magic = 0u64;
    let mut missing = 0u64;
    let mut prev = 0u32;
    let mut tick = Instant::now();
    loop {
        let n = socket.recv(&mut body)?;
        match n {
            n if n < body.len() => err_size += 1,
            _ if body[..4] != MAGIC => err_magic += 1,
            _ => {}
        }
        let curr = u32::from_be_bytes([body[6], body[7], body[8], body[9]]) >> 8;
        let delta = curr.wrapping_sub(prev) & COUNTER_MASK;
        if delta != curr && delta > 1 {
            missing += u64::from(delta);
        }
        prev = curr;

        count += 1;
        size += n as u64;
        if tick.elapsed() >= Duration::from_secs(1) {
            info!(
                "{:6} packets, {:8} missing, {:8} size error, {:8} magic error, {:6}KB",
                count,
                missing,
                err_size,
                err_magic,
                size >> 10,
            );
            count = 0;
            size = 0;
            err_size = 0;
            err_magic = 0;
            missing = 0;
            tick = Instant::now();
        }
    }
}
