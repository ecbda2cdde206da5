//! Playback of a recorded packet capture: the on-disk format is the
//! concatenation of raw on-wire packets in arrival order, exactly as the
//! record tool writes them. Sends are discarded, and end-of-file reports
//! the link as closed.

use crate::buffer::Buffer;
use crate::link::{LinkError, LinkResult, SendStatus};
use crate::packet::Packet;
use crate::transport::next_packet;
use slog::{o, trace, Logger};
use std::fs::File;
use std::io;
use std::path::Path;

const READ_BUF_SIZE: usize = 64 * 1024;

pub struct ReplayLink {
    file: File,
    rx: Buffer,
    skip: usize,
    eof: bool,
    log: Logger,
}

impl ReplayLink {
    pub fn open(path: &Path, log: &Logger) -> io::Result<ReplayLink> {
        Ok(ReplayLink {
            file: File::open(path)?,
            rx: Buffer::new(READ_BUF_SIZE),
            skip: 0,
            eof: false,
            log: log.new(o!()),
        })
    }

    pub fn send(&mut self, packet: &Packet) -> LinkResult<SendStatus> {
        trace!(self.log, "discarding write to replay link"; "type" => packet.ptype);
        Ok(SendStatus::Sent)
    }

    pub fn flush(&mut self) -> LinkResult<SendStatus> {
        Ok(SendStatus::Sent)
    }

    pub fn recv(&mut self) -> LinkResult<Packet> {
        loop {
            match next_packet(&mut self.rx, &mut self.skip)? {
                Some(packet) => return Ok(packet),
                None => {}
            }

            if self.eof {
                return Err(LinkError::Closed);
            }
            match self.rx.ingress(&mut self.file) {
                Ok(0) => return Err(LinkError::Closed),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => self.eof = true,
                Err(err) => return Err(LinkError::Io(err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PTYPE_STREAM0, PTYPE_TIMEBASE};
    use crate::route::Route;
    use slog::Discard;
    use std::io::Write;

    #[test]
    fn test_replays_recorded_packets_in_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let packets = vec![
            Packet::new(PTYPE_TIMEBASE, vec![1; 8], Route::empty()),
            Packet::new(PTYPE_STREAM0, vec![2; 16], Route::empty()),
            Packet::new(PTYPE_STREAM0 + 1, vec![3; 4], Route::from_hops(&[0]).unwrap()),
        ];
        for packet in &packets {
            file.write_all(&packet.to_bytes()).unwrap();
        }
        file.flush().unwrap();

        let log = Logger::root(Discard, o!());
        let mut link = ReplayLink::open(file.path(), &log).unwrap();

        for expected in &packets {
            assert_eq!(&link.recv().unwrap(), expected);
        }
        assert!(matches!(link.recv(), Err(LinkError::Closed)));
    }

    #[test]
    fn test_truncated_tail_is_closed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let packet = Packet::new(PTYPE_STREAM0, vec![9; 32], Route::empty());
        let bytes = packet.to_bytes();
        file.write_all(&bytes).unwrap();
        file.write_all(&bytes[..10]).unwrap();
        file.flush().unwrap();

        let log = Logger::root(Discard, o!());
        let mut link = ReplayLink::open(file.path(), &log).unwrap();

        assert_eq!(link.recv().unwrap(), packet);
        assert!(matches!(link.recv(), Err(LinkError::Closed)));
    }
}
