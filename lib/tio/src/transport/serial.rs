//! Packet framing over a serial link. Frames are SLIP-delimited with a
//! trailing CRC32, so corrupted bytes cost one frame and the decoder
//! resynchronises at the next delimiter. Sensors boot in an ASCII console
//! mode; until the first valid binary frame arrives, newline-terminated
//! input is surfaced as synthetic text packets so the proxy can log it and
//! nudge the sensor into binary framing with a heartbeat.

use crate::buffer::Buffer;
use crate::link::{is_wouldblock, LinkError, LinkResult, ProtoError, SendStatus};
use crate::packet::{Packet, MAX_PAYLOAD_SIZE, PTYPE_TEXT};
use crate::route::Route;
use slog::{o, trace, Logger};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::time::Duration;

const READ_BUF_SIZE: usize = 64 * 1024;
const WRITE_BUF_SIZE: usize = 64 * 1024;

// Unterminated garbage is discarded once it grows past this.
const MAX_FRAME_SIZE: usize = 4096;

const END: u8 = 0xC0;
const ESC: u8 = 0xDB;
const ESC_END: u8 = 0xDC;
const ESC_ESC: u8 = 0xDD;

pub struct SerialLink {
    port: serialport::TTYPort,
    fd: RawFd,
    rx: Buffer,
    tx: Buffer,
    binary: bool,
    log: Logger,
}

impl SerialLink {
    pub fn open(path: &Path, baud: u32, log: &Logger) -> Result<SerialLink, serialport::Error> {
        let port = serialport::new(path.to_string_lossy(), baud)
            .timeout(Duration::from_millis(0))
            .open_native()?;
        let fd = port.as_raw_fd();
        Ok(SerialLink {
            port,
            fd,
            rx: Buffer::new(READ_BUF_SIZE),
            tx: Buffer::new(WRITE_BUF_SIZE),
            binary: false,
            log: log.new(o!()),
        })
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd
    }

    pub fn has_egress(&self) -> bool {
        !self.tx.is_empty()
    }

    pub fn send(&mut self, packet: &Packet) -> LinkResult<SendStatus> {
        let frame = encode_frame(&packet.to_bytes());
        if !self.tx.push(&frame) {
            return Err(LinkError::Overflow);
        }
        self.flush()
    }

    pub fn flush(&mut self) -> LinkResult<SendStatus> {
        match self.tx.egress(&mut self.port) {
            Ok(_) if self.tx.is_empty() => Ok(SendStatus::Sent),
            Ok(_) => Ok(SendStatus::Buffered),
            Err(err) => Err(LinkError::Io(err)),
        }
    }

    pub fn recv(&mut self) -> LinkResult<Packet> {
        loop {
            match decode_next(&mut self.rx, &mut self.binary) {
                Ok(Some(packet)) => return Ok(packet),
                Ok(None) => {}
                Err(err) => {
                    trace!(self.log, "serial frame damage"; "error" => %err);
                    return Err(err);
                }
            }

            match self.rx.ingress(&mut self.port) {
                Ok(0) => return Err(LinkError::Wait),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(LinkError::Closed)
                }
                Err(err) if is_wouldblock(&err) => return Err(LinkError::Wait),
                Err(err) => return Err(LinkError::Io(err)),
            }
        }
    }
}

/// Pulls the next packet (or synthetic text line) out of the receive
/// buffer. `binary` latches once a valid frame has been seen.
fn decode_next(rx: &mut Buffer, binary: &mut bool) -> LinkResult<Option<Packet>> {
    loop {
        let slice = rx.read_slice();
        if slice.is_empty() {
            return Ok(None);
        }

        let end_pos = slice.iter().position(|&b| b == END);
        let nl_pos = if *binary {
            None
        } else {
            slice.iter().position(|&b| b == b'\n')
        };

        match (end_pos, nl_pos) {
            (None, None) => {
                if rx.len() >= MAX_FRAME_SIZE {
                    rx.clear();
                    return Err(LinkError::Proto(ProtoError::Slip("unterminated frame")));
                }
                return Ok(None);
            }
            // console text line before any binary framing
            (end, Some(nl)) if end.map_or(true, |e| nl < e) => {
                let mut line = slice[..nl].to_vec();
                rx.consume(nl + 1);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if line.is_empty() {
                    continue;
                }
                line.truncate(MAX_PAYLOAD_SIZE);
                return Ok(Some(Packet::new(PTYPE_TEXT, line, Route::empty())));
            }
            (Some(end), _) => {
                let frame = slice[..end].to_vec();
                rx.consume(end + 1);
                if frame.is_empty() {
                    continue;
                }
                let packet = decode_frame(&frame)?;
                *binary = true;
                return Ok(Some(packet));
            }
            (None, _) => unreachable!("both boundary positions exhausted"),
        }
    }
}

/// SLIP-escapes `bytes ++ crc32(bytes)` and appends the frame delimiter.
fn encode_frame(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() + 8);
    let crc = crc32fast::hash(bytes);
    let mut push = |b: u8| match b {
        END => {
            out.push(ESC);
            out.push(ESC_END);
        }
        ESC => {
            out.push(ESC);
            out.push(ESC_ESC);
        }
        b => out.push(b),
    };
    for &b in bytes {
        push(b);
    }
    for &b in crc.to_le_bytes().iter() {
        push(b);
    }
    out.push(END);
    out
}

/// Unescapes one delimited frame, verifies the CRC and parses the packet.
fn decode_frame(frame: &[u8]) -> LinkResult<Packet> {
    let mut bytes = Vec::with_capacity(frame.len());
    let mut iter = frame.iter();
    while let Some(&b) = iter.next() {
        if b == ESC {
            match iter.next() {
                Some(&ESC_END) => bytes.push(END),
                Some(&ESC_ESC) => bytes.push(ESC),
                _ => return Err(LinkError::Proto(ProtoError::Slip("bad escape sequence"))),
            }
        } else {
            bytes.push(b);
        }
    }

    if bytes.len() < 4 {
        return Err(LinkError::Proto(ProtoError::Slip("frame too short")));
    }
    let (data, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let found = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let expected = crc32fast::hash(data);
    if found != expected {
        return Err(LinkError::Proto(ProtoError::Crc { expected, found }));
    }

    match Packet::parse(data) {
        Ok(Some((packet, used))) if used == data.len() => Ok(packet),
        Ok(Some((_, used))) => Err(LinkError::Proto(ProtoError::TrailingBytes(
            data.len() - used,
        ))),
        Ok(None) => Err(LinkError::Proto(ProtoError::Slip("truncated packet"))),
        Err(err) => Err(LinkError::Proto(err.into())),
    }
}
