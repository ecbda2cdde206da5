//! Typed views over the RPC packet payloads. Requests carry a 16-bit id
//! and either a numeric method index or an inline method name; replies and
//! errors echo the request id back.

use crate::packet::{Packet, MAX_PAYLOAD_SIZE, PTYPE_RPC_ERROR, PTYPE_RPC_REP, PTYPE_RPC_REQ};
use crate::route::Route;
use byteorder::{ByteOrder, LittleEndian};

/// High bit of the method word marks a by-name request; the low 15 bits
/// then give the method-name length at the front of the payload.
pub const METHOD_BY_NAME: u16 = 0x8000;

pub const REQ_HEADER_SIZE: usize = 4;
pub const REP_HEADER_SIZE: usize = 2;
pub const ERR_HEADER_SIZE: usize = 4;

/// Wire error codes, fixed by the protocol header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    None = 0,
    Undefined = 1,
    NotFound = 2,
    Malformed = 3,
    ArgsSize = 4,
    Invalid = 5,
    ReadOnly = 6,
    WriteOnly = 7,
    Timeout = 8,
    Busy = 9,
    State = 10,
    Load = 11,
    LoadRpc = 12,
    Save = 13,
    SaveWr = 14,
    Internal = 15,
    NoBufs = 16,
    Range = 17,
}

impl ErrorCode {
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::None => "NONE",
            ErrorCode::Undefined => "UNDEFINED",
            ErrorCode::NotFound => "NOTFOUND",
            ErrorCode::Malformed => "MALFORMED",
            ErrorCode::ArgsSize => "ARGS_SIZE",
            ErrorCode::Invalid => "INVALID",
            ErrorCode::ReadOnly => "READ_ONLY",
            ErrorCode::WriteOnly => "WRITE_ONLY",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Busy => "BUSY",
            ErrorCode::State => "STATE",
            ErrorCode::Load => "LOAD",
            ErrorCode::LoadRpc => "LOAD_RPC",
            ErrorCode::Save => "SAVE",
            ErrorCode::SaveWr => "SAVE_WR",
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::NoBufs => "NOBUFS",
            ErrorCode::Range => "RANGE",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Method<'a> {
    Index(u16),
    Name(&'a [u8]),
}

/// A parsed request payload. `args` borrows the argument bytes following
/// the header (and the method name, for by-name requests).
#[derive(Debug, PartialEq, Eq)]
pub struct Request<'a> {
    pub id: u16,
    pub method: Method<'a>,
    pub args: &'a [u8],
}

/// Parses an RPC request payload. Returns `None` for packets of the wrong
/// type or with a malformed payload.
pub fn parse_request(packet: &Packet) -> Option<Request<'_>> {
    if packet.ptype != PTYPE_RPC_REQ || packet.payload.len() < REQ_HEADER_SIZE {
        return None;
    }
    let id = LittleEndian::read_u16(&packet.payload[0..2]);
    let method_word = LittleEndian::read_u16(&packet.payload[2..4]);
    let rest = &packet.payload[REQ_HEADER_SIZE..];

    if method_word & METHOD_BY_NAME != 0 {
        let name_len = (method_word & !METHOD_BY_NAME) as usize;
        if name_len > rest.len() {
            return None;
        }
        Some(Request {
            id,
            method: Method::Name(&rest[..name_len]),
            args: &rest[name_len..],
        })
    } else {
        Some(Request {
            id,
            method: Method::Index(method_word),
            args: rest,
        })
    }
}

/// The request id of an RPC request packet.
pub fn request_id(packet: &Packet) -> Option<u16> {
    if packet.ptype != PTYPE_RPC_REQ || packet.payload.len() < REQ_HEADER_SIZE {
        return None;
    }
    Some(LittleEndian::read_u16(&packet.payload[0..2]))
}

/// The echoed request id of a reply or error packet.
pub fn reply_id(packet: &Packet) -> Option<u16> {
    match packet.ptype {
        PTYPE_RPC_REP if packet.payload.len() >= REP_HEADER_SIZE => {
            Some(LittleEndian::read_u16(&packet.payload[0..2]))
        }
        PTYPE_RPC_ERROR if packet.payload.len() >= ERR_HEADER_SIZE => {
            Some(LittleEndian::read_u16(&packet.payload[0..2]))
        }
        _ => None,
    }
}

/// Rewrites the id of a request packet in place. The caller must have
/// validated the packet with `request_id` first.
pub fn set_request_id(packet: &mut Packet, id: u16) {
    LittleEndian::write_u16(&mut packet.payload[0..2], id);
}

/// Rewrites the echoed id of a reply or error packet in place.
pub fn set_reply_id(packet: &mut Packet, id: u16) {
    LittleEndian::write_u16(&mut packet.payload[0..2], id);
}

/// Builds a by-name request packet.
pub fn make_request(id: u16, method: &str, args: &[u8], route: Route) -> Packet {
    debug_assert!(method.len() < METHOD_BY_NAME as usize);
    let mut payload = Vec::with_capacity(REQ_HEADER_SIZE + method.len() + args.len());
    let mut word = [0u8; 2];
    LittleEndian::write_u16(&mut word, id);
    payload.extend_from_slice(&word);
    LittleEndian::write_u16(&mut word, METHOD_BY_NAME | method.len() as u16);
    payload.extend_from_slice(&word);
    payload.extend_from_slice(method.as_bytes());
    payload.extend_from_slice(args);
    Packet::new(PTYPE_RPC_REQ, payload, route)
}

/// Builds a reply packet echoing `req_id`. The result payload is truncated
/// at the protocol maximum.
pub fn make_reply(req_id: u16, result: &[u8], route: Route) -> Packet {
    let len = result.len().min(MAX_PAYLOAD_SIZE - REP_HEADER_SIZE);
    let mut payload = Vec::with_capacity(REP_HEADER_SIZE + len);
    let mut word = [0u8; 2];
    LittleEndian::write_u16(&mut word, req_id);
    payload.extend_from_slice(&word);
    payload.extend_from_slice(&result[..len]);
    Packet::new(PTYPE_RPC_REP, payload, route)
}

/// Builds an error packet echoing `req_id` with the given code.
pub fn make_error(req_id: u16, code: ErrorCode, route: Route) -> Packet {
    let mut payload = Vec::with_capacity(ERR_HEADER_SIZE);
    let mut word = [0u8; 2];
    LittleEndian::write_u16(&mut word, req_id);
    payload.extend_from_slice(&word);
    LittleEndian::write_u16(&mut word, code as u16);
    payload.extend_from_slice(&word);
    Packet::new(PTYPE_RPC_ERROR, payload, route)
}

/// The error code of an error packet.
pub fn error_code(packet: &Packet) -> Option<u16> {
    if packet.ptype != PTYPE_RPC_ERROR || packet.payload.len() < ERR_HEADER_SIZE {
        return None;
    }
    Some(LittleEndian::read_u16(&packet.payload[2..4]))
}
