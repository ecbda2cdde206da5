//! RFC 6455 framing for packet links. Each binary WebSocket message
//! carries exactly one wire packet. The server side expects masked client
//! frames; the client side masks its own. Ping is answered with pong,
//! close ends the link, and everything else is a recoverable protocol
//! error.

use crate::buffer::Buffer;
use crate::link::{is_wouldblock, LinkError, LinkResult, ProtoError, SendStatus};
use crate::packet::Packet;
use crate::transport::OpenError;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use byteorder::{BigEndian, ByteOrder};
use mio::net::TcpStream;
use slog::{o, trace, Logger};
use std::hash::{BuildHasher, Hasher};
use std::io;
use std::io::{Read, Write};
use std::net::ToSocketAddrs;
use std::time::Duration;

const READ_BUF_SIZE: usize = 64 * 1024;
const WRITE_BUF_SIZE: usize = 512 * 1024;

// A message holds one packet (512 bytes max); anything bigger is junk.
const MAX_MESSAGE_SIZE: u64 = 4096;

const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

pub struct WsLink {
    stream: TcpStream,
    rx: Buffer,
    tx: Buffer,
    // true when this end is the connection initiator and must mask
    masking: bool,
    eof: bool,
    log: Logger,
}

struct WsFrame {
    opcode: u8,
    payload: Vec<u8>,
}

impl WsLink {
    /// Server-side link over an already upgraded client socket.
    pub fn server(stream: TcpStream, residual: &[u8], log: &Logger) -> WsLink {
        let mut rx = Buffer::new(READ_BUF_SIZE);
        rx.push(residual);
        WsLink {
            stream,
            rx,
            tx: Buffer::new(WRITE_BUF_SIZE),
            masking: false,
            eof: false,
            log: log.new(o!()),
        }
    }

    /// Dials a WebSocket endpoint: synchronous TCP connect and HTTP
    /// upgrade, then non-blocking framed operation.
    pub fn connect(host: &str, port: u16, log: &Logger) -> Result<WsLink, OpenError> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| OpenError::BadUrl(format!("{}:{}", host, port)))?;
        let mut stream = std::net::TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;

        let mut key_bytes = [0u8; 16];
        fill_nonce(&mut key_bytes);
        let key = BASE64_STANDARD.encode(key_bytes);

        let request = format!(
            "GET / HTTP/1.1\r\n\
             Host: {}:{}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n",
            host, port, key
        );
        stream.write_all(request.as_bytes())?;

        // read headers until the blank line; anything but a 101 is a refusal
        let mut response = Vec::new();
        let mut byte = [0u8; 1];
        while !response.ends_with(b"\r\n\r\n") {
            if response.len() > 8192 {
                return Err(OpenError::WsHandshake);
            }
            match stream.read(&mut byte) {
                Ok(0) => return Err(OpenError::WsHandshake),
                Ok(_) => response.push(byte[0]),
                Err(err) => return Err(OpenError::Io(err)),
            }
        }
        if !response.starts_with(b"HTTP/1.1 101") {
            return Err(OpenError::WsHandshake);
        }

        stream.set_read_timeout(None)?;
        stream.set_nonblocking(true)?;
        Ok(WsLink {
            stream: TcpStream::from_std(stream),
            rx: Buffer::new(READ_BUF_SIZE),
            tx: Buffer::new(WRITE_BUF_SIZE),
            masking: true,
            eof: false,
            log: log.new(o!()),
        })
    }

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn has_egress(&self) -> bool {
        !self.tx.is_empty()
    }

    pub fn send(&mut self, packet: &Packet) -> LinkResult<SendStatus> {
        let mut message = Vec::with_capacity(packet.total_size() + 14);
        encode_frame(OP_BINARY, &packet.to_bytes(), self.masking, &mut message);
        if !self.tx.push(&message) {
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
            match parse_frame(self.rx.read_slice(), !self.masking) {
                Ok(Some((frame, used))) => {
                    self.rx.consume(used);
                    match frame.opcode {
                        OP_BINARY => match Packet::parse(&frame.payload) {
                            Ok(Some((packet, total))) if total == frame.payload.len() => {
                                return Ok(packet)
                            }
                            Ok(Some((_, total))) => {
                                return Err(LinkError::Proto(ProtoError::TrailingBytes(
                                    frame.payload.len() - total,
                                )))
                            }
                            Ok(None) => {
                                return Err(LinkError::Proto(ProtoError::WsFrame(
                                    "truncated packet in message",
                                )))
                            }
                            Err(err) => return Err(LinkError::Proto(err.into())),
                        },
                        OP_PING => {
                            trace!(self.log, "websocket ping");
                            let mut pong = Vec::with_capacity(frame.payload.len() + 14);
                            encode_frame(OP_PONG, &frame.payload, self.masking, &mut pong);
                            // best effort; a full buffer just drops the pong
                            if self.tx.push(&pong) {
                                let _ = self.flush();
                            }
                        }
                        OP_PONG => {}
                        OP_CLOSE => return Err(LinkError::Closed),
                        OP_TEXT => {
                            return Err(LinkError::Proto(ProtoError::WsFrame(
                                "unexpected text message",
                            )))
                        }
                        _ => {
                            return Err(LinkError::Proto(ProtoError::WsFrame(
                                "unsupported opcode",
                            )))
                        }
                    }
                }
                Ok(None) => {
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
                Err(err) => {
                    // framing is unrecoverable mid-stream; drop the buffer
                    // so the caller's close tears the link down cleanly
                    self.rx.clear();
                    return Err(LinkError::Proto(err));
                }
            }
        }
    }
}

/// Parses one frame from the front of `buf`. `expect_masked` enforces the
/// RFC: client-to-server frames are masked, server-to-client are not.
fn parse_frame(buf: &[u8], expect_masked: bool) -> Result<Option<(WsFrame, usize)>, ProtoError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let fin = buf[0] & 0x80 != 0;
    if buf[0] & 0x70 != 0 {
        return Err(ProtoError::WsFrame("reserved bits set"));
    }
    if !fin {
        return Err(ProtoError::WsFrame("fragmented messages not supported"));
    }
    let opcode = buf[0] & 0x0F;

    let masked = buf[1] & 0x80 != 0;
    if masked != expect_masked {
        return Err(ProtoError::WsFrame("mask bit does not match direction"));
    }

    let mut offset = 2;
    let len = match buf[1] & 0x7F {
        126 => {
            if buf.len() < offset + 2 {
                return Ok(None);
            }
            let len = BigEndian::read_u16(&buf[offset..offset + 2]) as u64;
            offset += 2;
            len
        }
        127 => {
            if buf.len() < offset + 8 {
                return Ok(None);
            }
            let len = BigEndian::read_u64(&buf[offset..offset + 8]);
            offset += 8;
            len
        }
        small => small as u64,
    };
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtoError::WsFrame("oversize message"));
    }
    let len = len as usize;

    let mask = if masked {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let mut key = [0u8; 4];
        key.copy_from_slice(&buf[offset..offset + 4]);
        offset += 4;
        Some(key)
    } else {
        None
    };

    if buf.len() < offset + len {
        return Ok(None);
    }

    let mut payload = buf[offset..offset + len].to_vec();
    if let Some(key) = mask {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i & 3];
        }
    }

    Ok(Some((WsFrame { opcode, payload }, offset + len)))
}

/// Appends one frame to `out`.
fn encode_frame(opcode: u8, payload: &[u8], mask: bool, out: &mut Vec<u8>) {
    out.push(0x80 | opcode);
    let mask_bit = if mask { 0x80 } else { 0x00 };
    if payload.len() < 126 {
        out.push(mask_bit | payload.len() as u8);
    } else if payload.len() <= 0xFFFF {
        out.push(mask_bit | 126);
        let mut len = [0u8; 2];
        BigEndian::write_u16(&mut len, payload.len() as u16);
        out.extend_from_slice(&len);
    } else {
        out.push(mask_bit | 127);
        let mut len = [0u8; 8];
        BigEndian::write_u64(&mut len, payload.len() as u64);
        out.extend_from_slice(&len);
    }
    if mask {
        let mut key = [0u8; 4];
        fill_nonce(&mut key);
        out.extend_from_slice(&key);
        out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i & 3]));
    } else {
        out.extend_from_slice(payload);
    }
}

/// Fills `out` with unpredictable bytes for handshake keys and frame
/// masks. Std's per-process randomised hasher is enough entropy here;
/// masking is an anti-cache measure, not a security boundary.
fn fill_nonce(out: &mut [u8]) {
    let mut offset = 0;
    while offset < out.len() {
        let mut hasher = std::collections::hash_map::RandomState::new().build_hasher();
        hasher.write_usize(out.len() - offset);
        let word = hasher.finish().to_be_bytes();
        let take = (out.len() - offset).min(8);
        out[offset..offset + take].copy_from_slice(&word[..take]);
        offset += take;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PTYPE_HEARTBEAT;

    fn masked_frame(opcode: u8, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
        let mut out = vec![0x80 | opcode];
        assert!(payload.len() < 126);
        out.push(0x80 | payload.len() as u8);
        out.extend_from_slice(&key);
        out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i & 3]));
        out
    }

    #[test]
    fn test_parse_masked_binary() {
        let packet = Packet::heartbeat();
        let frame = masked_frame(OP_BINARY, &packet.to_bytes(), [1, 2, 3, 4]);

        let (parsed, used) = parse_frame(&frame, true).unwrap().unwrap();
        assert_eq!(used, frame.len());
        assert_eq!(parsed.opcode, OP_BINARY);
        assert_eq!(parsed.payload, packet.to_bytes());
        assert_eq!(
            Packet::parse(&parsed.payload).unwrap().unwrap().0.ptype,
            PTYPE_HEARTBEAT
        );
    }

    #[test]
    fn test_parse_incomplete() {
        let frame = masked_frame(OP_BINARY, &[1, 2, 3], [9, 9, 9, 9]);
        for cut in 0..frame.len() {
            assert!(parse_frame(&frame[..cut], true).unwrap().is_none());
        }
    }

    #[test]
    fn test_unmasked_client_frame_rejected() {
        let mut out = Vec::new();
        encode_frame(OP_BINARY, &[1, 2, 3], false, &mut out);
        assert!(parse_frame(&out, true).is_err());
    }

    #[test]
    fn test_extended_length_roundtrip() {
        let payload = vec![0xA5u8; 300];
        let mut out = Vec::new();
        encode_frame(OP_BINARY, &payload, true, &mut out);

        let (frame, used) = parse_frame(&out, true).unwrap().unwrap();
        assert_eq!(used, out.len());
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn test_server_frames_unmasked() {
        let mut out = Vec::new();
        encode_frame(OP_BINARY, &[7; 10], false, &mut out);
        assert_eq!(out[0], 0x82);
        assert_eq!(out[1], 10);
        assert_eq!(&out[2..], &[7; 10]);
    }

    #[test]
    fn test_oversize_message_rejected() {
        let mut out = vec![0x82, 127];
        let mut len = [0u8; 8];
        BigEndian::write_u64(&mut len, MAX_MESSAGE_SIZE + 1);
        out.extend_from_slice(&len);
        assert!(parse_frame(&out, false).is_err());
    }

    #[test]
    fn test_fragmented_rejected() {
        // fin bit clear
        let out = vec![OP_BINARY, 0x00];
        assert!(parse_frame(&out, false).is_err());
    }
}
