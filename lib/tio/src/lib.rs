//! Wire protocol and transport layer for the sensor telemetry framing
//! protocol: packet model, routing stack, RPC codecs and the non-blocking
//! transport adapters (TCP, serial, WebSocket, file replay) used by the
//! proxy and the companion command-line tools.

pub const TCP_DEFAULT_PORT: u16 = 7855;
pub const WS_DEFAULT_PORT: u16 = 7853;
pub const SERIAL_DEFAULT_BAUD: u32 = 115200;

pub mod buffer;
pub mod link;
pub mod logpkt;
pub mod packet;
pub mod route;
pub mod rpc;
pub mod transport;
