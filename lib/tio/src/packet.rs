use crate::route::{Route, MAX_ROUTING_SIZE};
use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

/// Fixed header: type, routing byte, payload size.
pub const HEADER_SIZE: usize = 4;
/// Largest payload a conforming packet may declare.
pub const MAX_PAYLOAD_SIZE: usize = 500;
/// Header + payload + routing ceiling.
pub const MAX_PACKET_SIZE: usize = 512;

pub const PTYPE_INVALID: u8 = 0;
pub const PTYPE_LOG: u8 = 1;
pub const PTYPE_RPC_REQ: u8 = 2;
pub const PTYPE_RPC_REP: u8 = 3;
pub const PTYPE_RPC_ERROR: u8 = 4;
pub const PTYPE_HEARTBEAT: u8 = 5;
pub const PTYPE_TIMEBASE: u8 = 6;
pub const PTYPE_SOURCE: u8 = 7;
pub const PTYPE_STREAM: u8 = 8;
pub const PTYPE_TEXT: u8 = 9;
pub const PTYPE_METADATA: u8 = 10;
pub const PTYPE_USER: u8 = 64;
/// Types at or above this threshold carry stream data for stream
/// `type - PTYPE_STREAM0`.
pub const PTYPE_STREAM0: u8 = 128;

/// Low nibble of the routing byte holds the hop count; high bits are
/// reserved flags and must be carried through unchanged.
pub const ROUTING_SIZE_MASK: u8 = 0x0F;

/// A parsed wire packet: header fields, payload bytes and the routing
/// stack. The payload is opaque at this layer; `rpc` and `logpkt` provide
/// typed views for the kinds the proxy inspects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub ptype: u8,
    pub flags: u8,
    pub payload: Vec<u8>,
    pub route: Route,
}

/// Header-level framing violation. `total` is the full declared size of
/// the offending packet, letting stream readers skip it and resync.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("declared payload of {declared} bytes exceeds protocol maximum")]
    PayloadTooLarge { declared: usize, total: usize },
    #[error("declared routing of {declared} hops exceeds protocol maximum")]
    RoutingTooDeep { declared: usize, total: usize },
}

impl FrameError {
    /// Bytes occupied by the rejected packet on the wire.
    pub fn total_size(&self) -> usize {
        match *self {
            FrameError::PayloadTooLarge { total, .. } => total,
            FrameError::RoutingTooDeep { total, .. } => total,
        }
    }
}

impl Packet {
    pub fn new(ptype: u8, payload: Vec<u8>, route: Route) -> Packet {
        debug_assert!(payload.len() <= MAX_PAYLOAD_SIZE);
        Packet {
            ptype,
            flags: 0,
            payload,
            route,
        }
    }

    /// The zero-payload heartbeat used to keep sensor links in binary
    /// framing mode.
    pub fn heartbeat() -> Packet {
        Packet::new(PTYPE_HEARTBEAT, Vec::new(), Route::empty())
    }

    /// Total on-wire size of this packet.
    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.payload.len() + self.route.len()
    }

    /// The stream id for data packets, `None` for control types.
    pub fn stream_id(&self) -> Option<u8> {
        if self.ptype >= PTYPE_STREAM0 {
            Some(self.ptype - PTYPE_STREAM0)
        } else {
            None
        }
    }

    /// Attempts to parse one packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete
    /// packet, and `Err` when the header declares sizes outside the
    /// protocol limits (the caller may skip `total_size()` bytes and
    /// continue on a recoverable byte stream).
    pub fn parse(buf: &[u8]) -> Result<Option<(Packet, usize)>, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let ptype = buf[0];
        let routing_size = (buf[1] & ROUTING_SIZE_MASK) as usize;
        let flags = buf[1] & !ROUTING_SIZE_MASK;
        let payload_size = LittleEndian::read_u16(&buf[2..4]) as usize;
        let total = HEADER_SIZE + payload_size + routing_size;

        if payload_size > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge {
                declared: payload_size,
                total,
            });
        }
        if routing_size > MAX_ROUTING_SIZE {
            return Err(FrameError::RoutingTooDeep {
                declared: routing_size,
                total,
            });
        }
        if buf.len() < total {
            return Ok(None);
        }

        let payload = buf[HEADER_SIZE..HEADER_SIZE + payload_size].to_vec();
        let route = Route::from_hops(&buf[HEADER_SIZE + payload_size..total])
            .expect("routing size checked against protocol maximum");

        Ok(Some((
            Packet {
                ptype,
                flags,
                payload,
                route,
            },
            total,
        )))
    }

    /// Appends the on-wire form of this packet to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.ptype);
        out.push(self.flags | (self.route.len() as u8 & ROUTING_SIZE_MASK));
        let mut size = [0u8; 2];
        LittleEndian::write_u16(&mut size, self.payload.len() as u16);
        out.extend_from_slice(&size);
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(self.route.hops());
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_size());
        self.write_to(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let packet = Packet::new(
            PTYPE_STREAM0,
            vec![1, 2, 3, 4],
            Route::from_hops(&[7, 0]).unwrap(),
        );
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), packet.total_size());

        let (parsed, used) = Packet::parse(&bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_short_input_is_incomplete() {
        let packet = Packet::new(PTYPE_LOG, vec![0; 10], Route::empty());
        let bytes = packet.to_bytes();
        for cut in 0..bytes.len() {
            assert_eq!(Packet::parse(&bytes[..cut]).unwrap(), None);
        }
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let packet = Packet::heartbeat();
        let mut bytes = packet.to_bytes();
        bytes.extend_from_slice(&[0xAA; 3]);
        let (parsed, used) = Packet::parse(&bytes).unwrap().unwrap();
        assert_eq!(used, HEADER_SIZE);
        assert_eq!(parsed.ptype, PTYPE_HEARTBEAT);
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn test_oversize_payload_rejected() {
        let mut bytes = vec![PTYPE_USER, 0, 0, 0];
        LittleEndian::write_u16(&mut bytes[2..4], (MAX_PAYLOAD_SIZE + 1) as u16);
        let err = Packet::parse(&bytes).unwrap_err();
        assert_eq!(
            err,
            FrameError::PayloadTooLarge {
                declared: MAX_PAYLOAD_SIZE + 1,
                total: HEADER_SIZE + MAX_PAYLOAD_SIZE + 1,
            }
        );
        assert_eq!(err.total_size(), HEADER_SIZE + MAX_PAYLOAD_SIZE + 1);
    }

    #[test]
    fn test_oversize_routing_rejected() {
        // routing nibble can express up to 15 hops, protocol allows 8
        let bytes = vec![PTYPE_HEARTBEAT, 0x09, 0, 0];
        let err = Packet::parse(&bytes).unwrap_err();
        assert_eq!(
            err,
            FrameError::RoutingTooDeep {
                declared: 9,
                total: HEADER_SIZE + 9,
            }
        );
    }

    #[test]
    fn test_reserved_flags_preserved() {
        let mut packet = Packet::new(PTYPE_SOURCE, vec![5], Route::from_hops(&[1]).unwrap());
        packet.flags = 0x30;
        let bytes = packet.to_bytes();
        assert_eq!(bytes[1], 0x31);
        let (parsed, _) = Packet::parse(&bytes).unwrap().unwrap();
        assert_eq!(parsed.flags, 0x30);
        assert_eq!(parsed.route.len(), 1);
    }

    #[test]
    fn test_stream_id() {
        assert_eq!(Packet::heartbeat().stream_id(), None);
        let data = Packet::new(PTYPE_STREAM0 + 3, vec![], Route::empty());
        assert_eq!(data.stream_id(), Some(3));
    }
}
