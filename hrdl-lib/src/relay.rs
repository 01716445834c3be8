//! Outbound relay: a fixed pool of persistent connections to a
//! downstream hadock server, writing HRDL packets either verbatim or
//! wrapped in the Hadock envelope.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

use crossbeam_queue::ArrayQueue;
use tracing::{debug, warn};

use crate::hrdl::{HRDL_HEADER_LEN, HRDL_TRAILER_LEN, SYNC};
use crate::net::{dial, Addr, Conn, RateLimited};
use crate::sum::inet_sum;
use crate::{Error, Result};

pub const HDK_VERSION: u16 = 0;
pub const VMU_VERSION: u16 = 2;

/// Downstream framing mode, selected by the `-i` instance flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instance {
    /// `-1`: forward packets verbatim.
    Raw,
    /// Hadock envelope for instance 0, 1, 2 or 255.
    Hadock(u8),
}

impl Instance {
    /// Map the flag value onto an instance.
    ///
    /// # Errors
    /// [Error::Addr] never; an unsupported number yields [Error::Io]
    /// with [std::io::ErrorKind::InvalidInput].
    pub fn parse(value: i32) -> Result<Instance> {
        match value {
            -1 => Ok(Instance::Raw),
            0 | 1 | 2 | 255 => Ok(Instance::Hadock(value as u8)),
            _ => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid instance ({value})"),
            ))),
        }
    }

    /// Envelope preamble, `None` in raw mode.
    #[must_use]
    pub fn preamble(&self) -> Option<u16> {
        match self {
            Instance::Raw => None,
            Instance::Hadock(i) => Some((HDK_VERSION << 12) | (VMU_VERSION << 8) | u16::from(*i)),
        }
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Instance::Raw => "-",
            Instance::Hadock(0) => "TEST",
            Instance::Hadock(1) => "SIM1",
            Instance::Hadock(2) => "SIM2",
            Instance::Hadock(255) => "OPS",
            Instance::Hadock(_) => "?",
        }
    }
}

/// Write one packet verbatim.
pub fn write_raw<W: Write>(w: &mut W, packet: &[u8]) -> std::io::Result<()> {
    w.write_all(packet)?;
    w.flush()
}

/// Wrap the packet body in a Hadock envelope:
/// `SYNC | preamble u16 BE | seq u16 BE | len u32 BE | body | crc u16 BE`
/// where crc is the one's-complement 16-bit sum over the body.
pub fn write_hadock<W: Write>(
    w: &mut W,
    preamble: u16,
    seq: u16,
    packet: &[u8],
) -> std::io::Result<()> {
    let body = if packet.len() >= HRDL_HEADER_LEN + HRDL_TRAILER_LEN {
        &packet[HRDL_HEADER_LEN..packet.len() - HRDL_TRAILER_LEN]
    } else {
        packet
    };
    let mut buf = Vec::with_capacity(body.len() + 14);
    buf.extend_from_slice(&SYNC);
    buf.extend_from_slice(&preamble.to_be_bytes());
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(body);
    buf.extend_from_slice(&inet_sum(body).to_be_bytes());
    w.write_all(&buf)?;
    w.flush()
}

struct Outbound {
    writer: RateLimited<Conn>,
    seq: u16,
}

impl Outbound {
    fn write_packet(&mut self, instance: Instance, packet: &[u8]) -> std::io::Result<()> {
        let zult = match instance.preamble() {
            None => write_raw(&mut self.writer, packet),
            Some(preamble) => write_hadock(&mut self.writer, preamble, self.seq, packet),
        };
        self.seq = self.seq.wrapping_add(1);
        zult
    }
}

/// Fixed-size pool of persistent outbound connections.
///
/// A write takes an idle connection, frames the packet and returns the
/// connection on success; on error the connection is closed and a
/// replacement is dialed lazily on a later write. Packets may be
/// reordered across connections; set the pool size to 1 when strict
/// ordering matters.
pub struct Pool {
    addr: Addr,
    instance: Instance,
    rate: Option<u64>,
    idle: ArrayQueue<Outbound>,
    redials: AtomicU64,
}

impl Pool {
    /// Dial `size` connections up front.
    ///
    /// # Errors
    /// [Error::Io] when a connection cannot be established.
    pub fn new(addr: Addr, size: usize, instance: Instance, rate: Option<u64>) -> Result<Pool> {
        if size == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "pool size must be at least 1",
            )));
        }
        let pool = Pool {
            idle: ArrayQueue::new(size),
            addr,
            instance,
            rate,
            redials: AtomicU64::new(0),
        };
        for _ in 0..size {
            let conn = pool.connect()?;
            let _ = pool.idle.push(conn);
        }
        Ok(pool)
    }

    fn connect(&self) -> Result<Outbound> {
        let conn = dial(&self.addr)?;
        debug!("connected to {}", self.addr);
        Ok(Outbound {
            writer: RateLimited::new(conn, self.rate),
            seq: 0,
        })
    }

    /// Connections re-established after write failures.
    #[must_use]
    pub fn redials(&self) -> u64 {
        self.redials.load(Relaxed)
    }

    /// Send one packet through an idle connection.
    ///
    /// # Errors
    /// [Error::Io] when both the write and, for an empty pool, the
    /// replacement dial fail. The failed connection is dropped either
    /// way.
    pub fn write(&self, packet: &[u8]) -> Result<()> {
        let mut conn = match self.idle.pop() {
            Some(conn) => conn,
            None => {
                self.redials.fetch_add(1, Relaxed);
                self.connect()?
            }
        };
        match conn.write_packet(self.instance, packet) {
            Ok(()) => {
                let _ = self.idle.push(conn);
                Ok(())
            }
            Err(err) => {
                warn!("downstream write failed, closing connection: {err}");
                Err(Error::Io(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_parsing() {
        assert_eq!(Instance::parse(-1).unwrap(), Instance::Raw);
        assert_eq!(Instance::parse(255).unwrap(), Instance::Hadock(255));
        assert!(Instance::parse(7).is_err());
    }

    #[test]
    fn preamble_packs_versions_and_instance() {
        assert_eq!(Instance::Hadock(255).preamble(), Some(0x02FF));
        assert_eq!(Instance::Hadock(0).preamble(), Some(0x0200));
        assert_eq!(Instance::Hadock(2).preamble(), Some(0x0202));
        assert_eq!(Instance::Raw.preamble(), None);
    }

    #[test]
    fn hadock_envelope_layout() {
        // A minimal packet: sync, length 1, one body byte, trailer.
        let mut packet = Vec::new();
        packet.extend_from_slice(&SYNC);
        packet.extend_from_slice(&1u32.to_le_bytes());
        packet.push(0x5A);
        packet.extend_from_slice(&0x5Au32.to_le_bytes());

        let mut out = Vec::new();
        write_hadock(&mut out, 0x02FF, 3, &packet).unwrap();

        assert_eq!(&out[..4], &SYNC);
        assert_eq!(&out[4..6], &[0x02, 0xFF]);
        assert_eq!(&out[6..8], &[0x00, 0x03]);
        assert_eq!(&out[8..12], &1u32.to_be_bytes());
        assert_eq!(out[12], 0x5A);
        assert_eq!(&out[13..15], &inet_sum(&[0x5A]).to_be_bytes());
        assert_eq!(out.len(), 15);
    }

    #[test]
    fn raw_mode_writes_packet_verbatim() {
        let packet = b"\xf8\x2e\x35\x53rest of packet";
        let mut out = Vec::new();
        write_raw(&mut out, packet).unwrap();
        assert_eq!(out, packet);
    }

    #[test]
    fn sequence_increments_per_write() {
        use std::io::Read;
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let local = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = Vec::new();
            conn.read_to_end(&mut buf).unwrap();
            buf
        });

        let addr: Addr = format!("tcp://127.0.0.1:{}", local.port()).parse().unwrap();
        let pool = Pool::new(addr, 1, Instance::Hadock(255), None).unwrap();
        let mut packet = Vec::new();
        packet.extend_from_slice(&SYNC);
        packet.extend_from_slice(&1u32.to_le_bytes());
        packet.push(0x01);
        packet.extend_from_slice(&1u32.to_le_bytes());
        pool.write(&packet).unwrap();
        pool.write(&packet).unwrap();
        drop(pool);

        let buf = server.join().unwrap();
        // Two 15-byte envelopes, sequence 0 then 1.
        assert_eq!(buf.len(), 30);
        assert_eq!(&buf[6..8], &[0x00, 0x00]);
        assert_eq!(&buf[21..23], &[0x00, 0x01]);
    }
}
