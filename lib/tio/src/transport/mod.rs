//! Bidirectional packet endpoints. A `Transport` frames packets over one
//! of the supported links and exposes the non-blocking send/recv contract
//! the proxy's readiness loop is built on: sends that cannot complete stay
//! buffered inside the transport, and receives report `Wait` until a full
//! packet is available.

use crate::buffer::Buffer;
use crate::link::{LinkError, LinkResult, SendStatus};
use crate::packet::Packet;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use slog::Logger;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub mod replay;
pub mod serial;
pub mod tcp;
pub mod ws;

pub use replay::ReplayLink;
pub use serial::SerialLink;
pub use tcp::TcpLink;
pub use ws::WsLink;

const INTEREST: Interest = Interest::READABLE.add(Interest::WRITABLE);

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("malformed url '{0}'")]
    BadUrl(String),
    #[error("unsupported url scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("serial port: {0}")]
    Serial(#[from] serialport::Error),
    #[error("websocket handshake refused")]
    WsHandshake,
    #[error("{0}")]
    Io(#[from] io::Error),
}

/// A parsed endpoint URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Tcp(String, u16),
    Ws(String, u16),
    Serial(PathBuf, u32),
    Replay(PathBuf),
}

/// Parses `scheme://rest` into a connect target. Hosts default to the
/// protocol TCP/WebSocket ports; serial paths default to `/dev/` and
/// 115200 baud.
pub fn parse_url(url: &str) -> Result<Target, OpenError> {
    let (scheme, rest) = match url.find("://") {
        Some(pos) => (&url[..pos], &url[pos + 3..]),
        None => ("tcp", url),
    };
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        return Err(OpenError::BadUrl(url.to_string()));
    }

    match scheme {
        "tcp" | "ws" => {
            let (host, port) = match rest.rfind(':') {
                Some(pos) => {
                    let port = rest[pos + 1..]
                        .parse::<u16>()
                        .map_err(|_| OpenError::BadUrl(url.to_string()))?;
                    (rest[..pos].to_string(), port)
                }
                None => {
                    let default = if scheme == "ws" {
                        crate::WS_DEFAULT_PORT
                    } else {
                        crate::TCP_DEFAULT_PORT
                    };
                    (rest.to_string(), default)
                }
            };
            if scheme == "ws" {
                Ok(Target::Ws(host, port))
            } else {
                Ok(Target::Tcp(host, port))
            }
        }
        "serial" => {
            let (path, baud) = match rest.rfind(':') {
                Some(pos) => match rest[pos + 1..].parse::<u32>() {
                    Ok(baud) => (&rest[..pos], baud),
                    Err(_) => (rest, crate::SERIAL_DEFAULT_BAUD),
                },
                None => (rest, crate::SERIAL_DEFAULT_BAUD),
            };
            let path = if path.starts_with('/') {
                PathBuf::from(path)
            } else {
                PathBuf::from("/dev").join(path)
            };
            Ok(Target::Serial(path, baud))
        }
        "file" => Ok(Target::Replay(PathBuf::from(rest))),
        other => Err(OpenError::UnsupportedScheme(other.to_string())),
    }
}

/// A packet endpoint over one of the supported link types.
pub enum Transport {
    Tcp(TcpLink),
    Ws(WsLink),
    Serial(SerialLink),
    Replay(ReplayLink),
}

impl Transport {
    /// Opens an outbound endpoint. TCP and WebSocket targets connect
    /// synchronously (the WebSocket upgrade handshake included) and are
    /// switched to non-blocking afterwards.
    pub fn open(url: &str, log: &Logger) -> Result<Transport, OpenError> {
        match parse_url(url)? {
            Target::Tcp(host, port) => Ok(Transport::Tcp(TcpLink::connect(&host, port, log)?)),
            Target::Ws(host, port) => Ok(Transport::Ws(WsLink::connect(&host, port, log)?)),
            Target::Serial(path, baud) => Ok(Transport::Serial(SerialLink::open(&path, baud, log)?)),
            Target::Replay(path) => Ok(Transport::Replay(ReplayLink::open(&path, log)?)),
        }
    }

    /// Wraps an accepted client socket with native packet framing.
    pub fn from_tcp_stream(stream: TcpStream, log: &Logger) -> Transport {
        Transport::Tcp(TcpLink::new(stream, log))
    }

    /// Wraps an upgraded client socket with server-side WebSocket framing.
    /// `residual` holds any bytes the client pipelined after its HTTP
    /// request.
    pub fn websocket(stream: TcpStream, residual: &[u8], log: &Logger) -> Transport {
        Transport::Ws(WsLink::server(stream, residual, log))
    }

    /// Queues a packet for transmission and pushes as much of the transmit
    /// buffer to the wire as the link accepts.
    pub fn send(&mut self, packet: &Packet) -> LinkResult<SendStatus> {
        match self {
            Transport::Tcp(link) => link.send(packet),
            Transport::Ws(link) => link.send(packet),
            Transport::Serial(link) => link.send(packet),
            Transport::Replay(link) => link.send(packet),
        }
    }

    /// Retries transmission of buffered data.
    pub fn flush(&mut self) -> LinkResult<SendStatus> {
        match self {
            Transport::Tcp(link) => link.flush(),
            Transport::Ws(link) => link.flush(),
            Transport::Serial(link) => link.flush(),
            Transport::Replay(link) => link.flush(),
        }
    }

    /// Receives the next complete packet, or `Wait` when none is
    /// available. Protocol errors are recoverable: the link resyncs and
    /// subsequent calls keep going.
    pub fn recv(&mut self) -> LinkResult<Packet> {
        match self {
            Transport::Tcp(link) => link.recv(),
            Transport::Ws(link) => link.recv(),
            Transport::Serial(link) => link.recv(),
            Transport::Replay(link) => link.recv(),
        }
    }

    /// True while transmit data is buffered awaiting writable readiness.
    pub fn has_egress(&self) -> bool {
        match self {
            Transport::Tcp(link) => link.has_egress(),
            Transport::Ws(link) => link.has_egress(),
            Transport::Serial(link) => link.has_egress(),
            Transport::Replay(_) => false,
        }
    }

    /// File replay cannot be registered for readiness and must be
    /// serviced every loop iteration instead.
    pub fn always_ready(&self) -> bool {
        matches!(self, Transport::Replay(_))
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        match self {
            Transport::Tcp(link) => registry.register(link.stream_mut(), token, INTEREST),
            Transport::Ws(link) => registry.register(link.stream_mut(), token, INTEREST),
            Transport::Serial(link) => {
                registry.register(&mut mio::unix::SourceFd(&link.raw_fd()), token, INTEREST)
            }
            Transport::Replay(_) => Ok(()),
        }
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Transport::Tcp(link) => registry.deregister(link.stream_mut()),
            Transport::Ws(link) => registry.deregister(link.stream_mut()),
            Transport::Serial(link) => {
                registry.deregister(&mut mio::unix::SourceFd(&link.raw_fd()))
            }
            Transport::Replay(_) => Ok(()),
        }
    }
}

/// Pulls the next packet out of a natively framed receive buffer.
/// Oversize frames are skipped across calls via `skip` so the stream
/// resynchronises on the next header.
pub(crate) fn next_packet(rx: &mut Buffer, skip: &mut usize) -> LinkResult<Option<Packet>> {
    if *skip > 0 {
        let have = (*skip).min(rx.len());
        rx.consume(have);
        *skip -= have;
        if *skip > 0 {
            return Ok(None);
        }
    }

    match Packet::parse(rx.read_slice()) {
        Ok(Some((packet, used))) => {
            rx.consume(used);
            Ok(Some(packet))
        }
        Ok(None) => Ok(None),
        Err(err) => {
            let total = err.total_size();
            let have = total.min(rx.len());
            rx.consume(have);
            *skip = total - have;
            Err(LinkError::Proto(err.into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PTYPE_HEARTBEAT, PTYPE_USER};
    use crate::route::Route;
    use byteorder::{ByteOrder, LittleEndian};

    #[test]
    fn test_parse_url_tcp() {
        assert_eq!(
            parse_url("tcp://localhost").unwrap(),
            Target::Tcp("localhost".to_string(), crate::TCP_DEFAULT_PORT)
        );
        assert_eq!(
            parse_url("tcp://10.0.0.1:9000").unwrap(),
            Target::Tcp("10.0.0.1".to_string(), 9000)
        );
        // bare host defaults to tcp
        assert_eq!(
            parse_url("localhost:1234").unwrap(),
            Target::Tcp("localhost".to_string(), 1234)
        );
    }

    #[test]
    fn test_parse_url_ws() {
        assert_eq!(
            parse_url("ws://localhost").unwrap(),
            Target::Ws("localhost".to_string(), crate::WS_DEFAULT_PORT)
        );
    }

    #[test]
    fn test_parse_url_serial() {
        assert_eq!(
            parse_url("serial://ttyUSB0:115200/").unwrap(),
            Target::Serial(PathBuf::from("/dev/ttyUSB0"), 115200)
        );
        assert_eq!(
            parse_url("serial:///dev/cu.usbmodem1").unwrap(),
            Target::Serial(PathBuf::from("/dev/cu.usbmodem1"), crate::SERIAL_DEFAULT_BAUD)
        );
    }

    #[test]
    fn test_parse_url_errors() {
        assert!(matches!(
            parse_url("gopher://x"),
            Err(OpenError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            parse_url("tcp://host:notaport"),
            Err(OpenError::BadUrl(_))
        ));
        assert!(matches!(parse_url("tcp://"), Err(OpenError::BadUrl(_))));
    }

    #[test]
    fn test_next_packet_incremental() {
        let mut rx = Buffer::new(4096);
        let mut skip = 0;

        let packet = Packet::new(PTYPE_USER, vec![1, 2, 3], Route::from_hops(&[4]).unwrap());
        let bytes = packet.to_bytes();

        rx.push(&bytes[..3]);
        assert!(next_packet(&mut rx, &mut skip).unwrap().is_none());

        rx.push(&bytes[3..]);
        let out = next_packet(&mut rx, &mut skip).unwrap().unwrap();
        assert_eq!(out, packet);
        assert!(rx.is_empty());
    }

    #[test]
    fn test_next_packet_skips_oversize_frame() {
        let mut rx = Buffer::new(4096);
        let mut skip = 0;

        // header declaring a payload past the protocol maximum
        let mut bad = vec![PTYPE_USER, 0, 0, 0];
        LittleEndian::write_u16(&mut bad[2..4], 600);
        rx.push(&bad);
        rx.push(&[0u8; 100]);

        assert!(matches!(
            next_packet(&mut rx, &mut skip),
            Err(LinkError::Proto(_))
        ));
        // 104 of the 604 declared bytes were buffered and discarded
        assert_eq!(skip, 500);

        // drip the remainder of the oversize frame, then a good packet
        rx.push(&[0u8; 500]);
        let good = Packet::heartbeat();
        rx.push(&good.to_bytes());
        let out = loop {
            if let Some(p) = next_packet(&mut rx, &mut skip).unwrap() {
                break p;
            }
        };
        assert_eq!(out.ptype, PTYPE_HEARTBEAT);
        assert_eq!(skip, 0);
    }
}
