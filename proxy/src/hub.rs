//! The proxy's own node in the sensor tree. In hub mode a client packet
//! with an empty routing stack addresses the proxy itself, which answers a
//! small set of discovery RPCs locally and refuses everything else.

use byteorder::{ByteOrder, LittleEndian};
use tio::packet::Packet;
use tio::route::Route;
use tio::rpc;
use tio::rpc::{ErrorCode, Method};

pub const HUB_NAME: &str = "TIO PROXY";

pub struct Hub {
    pub id: String,
    pub ports: u32,
}

impl Hub {
    pub fn new(id: String, ports: u32) -> Hub {
        Hub { id, ports }
    }

    /// Answers an RPC request addressed to the hub. Malformed requests
    /// and unknown methods get an error packet; either way the client
    /// receives exactly one response.
    pub fn handle_request(&self, packet: &Packet) -> Packet {
        let request = match rpc::parse_request(packet) {
            Some(request) => request,
            None => return rpc::make_error(UNPARSEABLE_ID, ErrorCode::Malformed, Route::empty()),
        };

        match request.method {
            Method::Name(b"dev.desc") => {
                rpc::make_reply(request.id, HUB_NAME.as_bytes(), Route::empty())
            }
            Method::Name(b"dev.proc.id") => {
                rpc::make_reply(request.id, self.id.as_bytes(), Route::empty())
            }
            Method::Name(b"dev.ports") => {
                let mut count = [0u8; 4];
                LittleEndian::write_u32(&mut count, self.ports);
                rpc::make_reply(request.id, &count, Route::empty())
            }
            _ => rpc::make_error(request.id, ErrorCode::NotFound, Route::empty()),
        }
    }
}

// A request too short to carry an id still gets a response; the id echoed
// back is the reserved one.
const UNPARSEABLE_ID: u16 = u16::MAX;

#[cfg(test)]
mod tests {
    use super::*;
    use tio::packet::PTYPE_RPC_REP;

    fn hub() -> Hub {
        Hub::new("testhost.1234".to_string(), 2)
    }

    #[test]
    fn test_dev_desc() {
        let request = rpc::make_request(7, "dev.desc", &[], Route::empty());
        let reply = hub().handle_request(&request);
        assert_eq!(reply.ptype, PTYPE_RPC_REP);
        assert_eq!(rpc::reply_id(&reply), Some(7));
        assert_eq!(&reply.payload[rpc::REP_HEADER_SIZE..], HUB_NAME.as_bytes());
        assert!(reply.route.is_empty());
    }

    #[test]
    fn test_dev_proc_id() {
        let request = rpc::make_request(8, "dev.proc.id", &[], Route::empty());
        let reply = hub().handle_request(&request);
        assert_eq!(rpc::reply_id(&reply), Some(8));
        assert_eq!(&reply.payload[rpc::REP_HEADER_SIZE..], b"testhost.1234");
    }

    #[test]
    fn test_dev_ports_is_u32_sensor_count() {
        let request = rpc::make_request(9, "dev.ports", &[], Route::empty());
        let reply = hub().handle_request(&request);
        assert_eq!(rpc::reply_id(&reply), Some(9));
        let payload = &reply.payload[rpc::REP_HEADER_SIZE..];
        assert_eq!(payload.len(), 4);
        assert_eq!(LittleEndian::read_u32(payload), 2);
    }

    #[test]
    fn test_unknown_method_not_found() {
        let request = rpc::make_request(10, "dev.nope", &[], Route::empty());
        let reply = hub().handle_request(&request);
        assert_eq!(rpc::reply_id(&reply), Some(10));
        assert_eq!(rpc::error_code(&reply), Some(ErrorCode::NotFound as u16));
    }

    #[test]
    fn test_indexed_method_not_found() {
        let mut payload = vec![0u8; 4];
        LittleEndian::write_u16(&mut payload[0..2], 11);
        LittleEndian::write_u16(&mut payload[2..4], 3);
        let request = Packet::new(tio::packet::PTYPE_RPC_REQ, payload, Route::empty());
        let reply = hub().handle_request(&request);
        assert_eq!(rpc::error_code(&reply), Some(ErrorCode::NotFound as u16));
    }
}
