//! Socket ingress and egress.
//!
//! Addresses use the `scheme://host:port` grammar with scheme tcp or
//! udp; a bare `host:port` defaults to tcp. UDP listeners join multicast
//! groups automatically and request a 16 MiB receive buffer to absorb
//! downlink bursts.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::str::FromStr;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::warn;

use crate::{Error, Result};

/// Receive buffer requested for UDP ingress sockets.
pub const UDP_RECV_BUFFER: usize = 16 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Udp,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Tcp => write!(f, "tcp"),
            Scheme::Udp => write!(f, "udp"),
        }
    }
}

/// A parsed `scheme://host:port` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addr {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Addr {
    /// The `host:port` part, with an empty host meaning all interfaces.
    #[must_use]
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn socket_addr(&self) -> Result<SocketAddr> {
        let host = if self.host.is_empty() {
            "0.0.0.0"
        } else {
            self.host.as_str()
        };
        (host, self.port)
            .to_socket_addrs()
            .map_err(Error::Io)?
            .next()
            .ok_or_else(|| Error::Addr(self.authority()))
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())
    }
}

impl FromStr for Addr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Addr> {
        let (scheme, rest) = match s.split_once("://") {
            Some(("tcp", rest)) => (Scheme::Tcp, rest),
            Some(("udp", rest)) => (Scheme::Udp, rest),
            Some((other, _)) => return Err(Error::Addr(format!("unsupported scheme {other}"))),
            None => (Scheme::Tcp, s),
        };
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| Error::Addr(s.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::Addr(s.to_string()))?;
        Ok(Addr {
            scheme,
            host: host.to_string(),
            port,
        })
    }
}

/// Open a UDP ingress socket: multicast join when the host is a group
/// address, plain bind otherwise. The receive buffer is enlarged to
/// [UDP_RECV_BUFFER].
pub fn listen_udp(addr: &Addr) -> Result<UdpSocket> {
    let target = addr.socket_addr()?;
    let domain = Domain::for_address(target);
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if let Err(err) = socket.set_recv_buffer_size(UDP_RECV_BUFFER) {
        warn!("could not enlarge receive buffer: {err}");
    }
    match target.ip() {
        IpAddr::V4(group) if group.is_multicast() => {
            socket.bind(&SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), target.port()).into())?;
            socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        }
        IpAddr::V6(group) if group.is_multicast() => {
            socket.bind(&SocketAddr::new(target.ip(), target.port()).into())?;
            socket.join_multicast_v6(&group, 0)?;
        }
        _ => socket.bind(&target.into())?,
    }
    Ok(socket.into())
}

/// Open a TCP listener on `addr`.
pub fn listen_tcp(addr: &Addr) -> Result<TcpListener> {
    Ok(TcpListener::bind(addr.socket_addr()?)?)
}

/// An established outbound or ingress connection.
pub enum Conn {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl Conn {
    pub fn peer(&self) -> io::Result<SocketAddr> {
        match self {
            Conn::Tcp(s) => s.peer_addr(),
            Conn::Udp(s) => s.peer_addr(),
        }
    }
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Conn::Tcp(s) => s.read(buf),
            Conn::Udp(s) => s.recv(buf),
        }
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Conn::Tcp(s) => s.write(buf),
            Conn::Udp(s) => s.send(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Conn::Tcp(s) => s.flush(),
            Conn::Udp(_) => Ok(()),
        }
    }
}

/// Dial `addr` over its scheme.
pub fn dial(addr: &Addr) -> Result<Conn> {
    match addr.scheme {
        Scheme::Tcp => Ok(Conn::Tcp(TcpStream::connect(addr.socket_addr()?)?)),
        Scheme::Udp => {
            let socket = UdpSocket::bind("0.0.0.0:0")?;
            socket.connect(addr.socket_addr()?)?;
            Ok(Conn::Udp(socket))
        }
    }
}

/// Token-bucket writer: caps throughput at `rate` bytes per second with
/// a burst of one second's worth. A rate of `None` passes writes through
/// untouched.
pub struct RateLimited<W> {
    inner: W,
    rate: Option<f64>,
    tokens: f64,
    last: Instant,
}

impl<W: Write> RateLimited<W> {
    pub fn new(inner: W, rate: Option<u64>) -> Self {
        let rate = rate.filter(|r| *r > 0).map(|r| r as f64);
        RateLimited {
            inner,
            rate,
            tokens: rate.unwrap_or_default(),
            last: Instant::now(),
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn take(&mut self, amount: f64) {
        let Some(rate) = self.rate else { return };
        let now = Instant::now();
        self.tokens = (self.tokens + now.duration_since(self.last).as_secs_f64() * rate).min(rate);
        self.last = now;
        if self.tokens < amount {
            let wait = (amount - self.tokens) / rate;
            std::thread::sleep(Duration::from_secs_f64(wait));
            self.last = Instant::now();
            self.tokens = amount;
        }
        self.tokens -= amount;
    }
}

impl<W: Write> Write for RateLimited<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.take(buf.len() as f64);
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Copies everything written to `inner` to an optional side connection,
/// used to proxy the raw CADU stream for debugging. The tee is dropped
/// on its first error; the primary path is never affected.
pub struct Tee<W> {
    inner: W,
    tee: Option<Conn>,
}

impl<W: Write> Tee<W> {
    pub fn new(inner: W, tee: Option<Conn>) -> Self {
        Tee { inner, tee }
    }
}

impl<W: Write> Write for Tee<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(conn) = self.tee.as_mut() {
            if let Err(err) = conn.write_all(buf) {
                warn!("proxy copy failed, detaching: {err}");
                self.tee = None;
            }
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
