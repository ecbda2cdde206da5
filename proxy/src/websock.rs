//! HTTP/1.1 upgrade handling for clients accepted on the WebSocket port.
//! The whole request is expected in a single read; anything partial or
//! missing the required headers is a hard close.

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Result of parsing a client's opening bytes.
#[derive(Debug, PartialEq, Eq)]
pub enum Upgrade {
    /// Handshake accepted: the 101 response to write back, plus any bytes
    /// the client pipelined after its request.
    Complete {
        response: Vec<u8>,
        residual: Vec<u8>,
    },
    /// Partial or invalid request.
    Reject,
}

/// Computes the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64_STANDARD.encode(hasher.finalize())
}

/// Parses the HTTP request headers and produces the switching-protocols
/// response. Requires `Upgrade: websocket` and a `Sec-WebSocket-Key`.
pub fn process_request(buf: &[u8]) -> Upgrade {
    let end = match find_terminator(buf) {
        Some(end) => end,
        None => return Upgrade::Reject,
    };
    let headers = match std::str::from_utf8(&buf[..end]) {
        Ok(headers) => headers,
        Err(_) => return Upgrade::Reject,
    };

    let mut upgrade = false;
    let mut key = None;
    for line in headers.split("\r\n") {
        if line == "Upgrade: websocket" {
            upgrade = true;
        } else if let Some(value) = line.strip_prefix("Sec-WebSocket-Key:") {
            key = Some(value.trim());
        }
    }

    let key = match key {
        Some(key) if upgrade => key,
        _ => return Upgrade::Reject,
    };

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    );

    Upgrade::Complete {
        response: response.into_bytes(),
        residual: buf[end + 4..].to_vec(),
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc6455_sample_key() {
        // the worked example from RFC 6455 §1.3
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_complete_handshake() {
        let request = b"GET / HTTP/1.1\r\n\
                        Host: localhost\r\n\
                        Upgrade: websocket\r\n\
                        Connection: Upgrade\r\n\
                        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                        Sec-WebSocket-Version: 13\r\n\r\n";
        match process_request(request) {
            Upgrade::Complete { response, residual } => {
                let response = String::from_utf8(response).unwrap();
                assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
                assert!(response
                    .contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
                assert!(response.ends_with("\r\n\r\n"));
                assert!(residual.is_empty());
            }
            Upgrade::Reject => panic!("handshake should complete"),
        }
    }

    #[test]
    fn test_pipelined_bytes_preserved() {
        let mut request = b"GET / HTTP/1.1\r\n\
                            Upgrade: websocket\r\n\
                            Sec-WebSocket-Key: abc\r\n\r\n"
            .to_vec();
        request.extend_from_slice(&[0x82, 0x00]);
        match process_request(&request) {
            Upgrade::Complete { residual, .. } => assert_eq!(residual, vec![0x82, 0x00]),
            Upgrade::Reject => panic!("handshake should complete"),
        }
    }

    #[test]
    fn test_partial_request_rejected() {
        let request = b"GET / HTTP/1.1\r\nUpgrade: websocket\r\n";
        assert_eq!(process_request(request), Upgrade::Reject);
    }

    #[test]
    fn test_missing_upgrade_header_rejected() {
        let request = b"GET / HTTP/1.1\r\nSec-WebSocket-Key: abc\r\n\r\n";
        assert_eq!(process_request(request), Upgrade::Reject);
    }

    #[test]
    fn test_missing_key_rejected() {
        let request = b"GET / HTTP/1.1\r\nUpgrade: websocket\r\n\r\n";
        assert_eq!(process_request(request), Upgrade::Reject);
    }
}
