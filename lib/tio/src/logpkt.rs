//! View over log packets emitted by sensors: a small fixed header followed
//! by the message bytes.

use crate::packet::{Packet, PTYPE_LOG};
use byteorder::{ByteOrder, LittleEndian};

pub const LOG_CRITICAL: u8 = 1;
pub const LOG_ERROR: u8 = 2;
pub const LOG_WARNING: u8 = 3;
pub const LOG_INFO: u8 = 4;
pub const LOG_DEBUG: u8 = 5;

pub const LOG_HEADER_SIZE: usize = 5;

#[derive(Debug, PartialEq, Eq)]
pub struct LogMessage<'a> {
    pub data: u32,
    pub level: u8,
    pub message: &'a [u8],
}

pub fn parse(packet: &Packet) -> Option<LogMessage<'_>> {
    if packet.ptype != PTYPE_LOG || packet.payload.len() < LOG_HEADER_SIZE {
        return None;
    }
    Some(LogMessage {
        data: LittleEndian::read_u32(&packet.payload[0..4]),
        level: packet.payload[4],
        message: &packet.payload[LOG_HEADER_SIZE..],
    })
}

pub fn level_name(level: u8) -> &'static str {
    match level {
        LOG_CRITICAL => "CRITICAL",
        LOG_ERROR => "ERROR",
        LOG_WARNING => "WARNING",
        LOG_INFO => "INFO",
        LOG_DEBUG => "DEBUG",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::Route;

    #[test]
    fn test_parse() {
        let mut payload = vec![0; LOG_HEADER_SIZE];
        LittleEndian::write_u32(&mut payload[0..4], 0xDEAD);
        payload[4] = LOG_WARNING;
        payload.extend_from_slice(b"low voltage");
        let packet = Packet::new(PTYPE_LOG, payload, Route::empty());

        let msg = parse(&packet).unwrap();
        assert_eq!(msg.data, 0xDEAD);
        assert_eq!(msg.level, LOG_WARNING);
        assert_eq!(msg.message, b"low voltage");
    }

    #[test]
    fn test_short_payload() {
        let packet = Packet::new(PTYPE_LOG, vec![0; 3], Route::empty());
        assert!(parse(&packet).is_none());
    }

    #[test]
    fn test_level_names() {
        assert_eq!(level_name(LOG_CRITICAL), "CRITICAL");
        assert_eq!(level_name(LOG_DEBUG), "DEBUG");
        assert_eq!(level_name(99), "UNKNOWN");
    }
}
