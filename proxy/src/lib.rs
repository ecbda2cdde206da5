//! The multiplexing sensor proxy: connects to one or more sensors and
//! re-exposes each of them to many concurrent TCP/WebSocket clients while
//! preserving the point-to-point RPC semantics of the wire protocol.

pub mod hub;
pub mod logging;
pub mod proxy;
pub mod remap;
pub mod websock;
