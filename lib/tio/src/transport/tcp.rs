use crate::buffer::Buffer;
use crate::link::{is_wouldblock, LinkError, LinkResult, SendStatus};
use crate::packet::Packet;
use crate::transport::{next_packet, OpenError};
use mio::net::TcpStream;
use slog::{o, trace, Logger};
use std::io;
use std::net::ToSocketAddrs;

const READ_BUF_SIZE: usize = 64 * 1024;
const WRITE_BUF_SIZE: usize = 512 * 1024;

/// Native packet framing over a non-blocking TCP stream. Packets that
/// cannot be written immediately stay in the transmit buffer until the
/// socket reports writable again.
pub struct TcpLink {
    stream: TcpStream,
    rx: Buffer,
    tx: Buffer,
    skip: usize,
    eof: bool,
    log: Logger,
}

impl TcpLink {
    pub fn new(stream: TcpStream, log: &Logger) -> TcpLink {
        TcpLink {
            stream,
            rx: Buffer::new(READ_BUF_SIZE),
            tx: Buffer::new(WRITE_BUF_SIZE),
            skip: 0,
            eof: false,
            log: log.new(o!()),
        }
    }

    /// Connects synchronously (startup and reconnect both want an
    /// immediate verdict), then switches the stream to non-blocking.
    pub fn connect(host: &str, port: u16, log: &Logger) -> Result<TcpLink, OpenError> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| OpenError::BadUrl(format!("{}:{}", host, port)))?;
        let stream = std::net::TcpStream::connect(addr)?;
        stream.set_nonblocking(true)?;
        Ok(TcpLink::new(TcpStream::from_std(stream), log))
    }

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Hands the stream back, e.g. for a framing upgrade. Buffered state
    /// is discarded.
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }

    pub fn has_egress(&self) -> bool {
        !self.tx.is_empty()
    }

    pub fn send(&mut self, packet: &Packet) -> LinkResult<SendStatus> {
        let bytes = packet.to_bytes();
        if !self.tx.push(&bytes) {
            return Err(LinkError::Overflow);
        }
        self.flush()
    }

    pub fn flush(&mut self) -> LinkResult<SendStatus> {
        match self.tx.egress(&mut self.stream) {
            Ok(_) if self.tx.is_empty() => Ok(SendStatus::Sent),
            Ok(_) => Ok(SendStatus::Buffered),
            Err(err) => Err(LinkError::Io(err)),
        }
    }

    pub fn recv(&mut self) -> LinkResult<Packet> {
        loop {
            match next_packet(&mut self.rx, &mut self.skip) {
                Ok(Some(packet)) => return Ok(packet),
                Ok(None) => {}
                Err(err) => {
                    trace!(self.log, "framing error on tcp link"; "error" => %err);
                    return Err(err);
                }
            }

            if self.eof {
                return Err(LinkError::Closed);
            }
            match self.rx.ingress(&mut self.stream) {
                Ok(0) => return Err(LinkError::Wait),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => self.eof = true,
                Err(err) if is_wouldblock(&err) => return Err(LinkError::Wait),
                Err(err) => return Err(LinkError::Io(err)),
            }
        }
    }
}
