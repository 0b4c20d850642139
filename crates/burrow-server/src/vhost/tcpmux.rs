//! TCP multiplexing over one port, keyed by the HTTP CONNECT host.
//!
//! Clients open a `CONNECT host:port` preface; the muxer routes by host and
//! then splices raw bytes.  With passthrough on, the preface itself is
//! forwarded to the backend; otherwise the muxer answers 200 and swallows
//! it.

use super::ListenerRouters;
use crate::net::mux::PeekedStream;
use crate::net::AnyStream;
use crate::util::host_from_addr;
use base64::Engine;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

const MAX_HEADER_BYTES: usize = 8 * 1024;

pub struct TcpConnectMuxer {
    pub routers: Arc<ListenerRouters>,
    timeout: Duration,
    passthrough: bool,
}

impl TcpConnectMuxer {
    pub fn new(timeout: Duration, passthrough: bool) -> Self {
        Self {
            routers: Arc::new(ListenerRouters::new()),
            timeout,
            passthrough,
        }
    }

    pub async fn handle_conn(&self, mut conn: AnyStream) {
        let buf = match tokio::time::timeout(self.timeout, read_header(&mut conn)).await {
            Ok(Some(buf)) => buf,
            _ => return,
        };
        let Some(preface) = parse_connect(&buf) else {
            debug!("tcpmux: preface is not a CONNECT request, dropping");
            return;
        };

        let Some(listener) = self.routers.route(&preface.host, "", &preface.http_user) else {
            debug!("tcpmux: no route for host {}", preface.host);
            return;
        };

        let replay = if self.passthrough {
            buf
        } else {
            if conn.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.is_err() {
                return;
            }
            // Payload the client pipelined behind the header still counts.
            buf[preface.header_len..].to_vec()
        };
        let stream: AnyStream = Box::new(PeekedStream::new(replay, conn));
        if let Err(e) = listener.put(stream) {
            debug!("tcpmux: listener for {} rejected conn: {e}", preface.host);
        }
    }
}

struct ConnectPreface {
    host: String,
    http_user: String,
    header_len: usize,
}

async fn read_header(conn: &mut AnyStream) -> Option<Vec<u8>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            return Some(buf);
        }
        if buf.len() > MAX_HEADER_BYTES {
            return None;
        }
        match conn.read(&mut chunk).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

fn parse_connect(buf: &[u8]) -> Option<ConnectPreface> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    let header_len = match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        _ => return None,
    };
    if req.method != Some("CONNECT") {
        return None;
    }
    let host = host_from_addr(req.path?).to_lowercase();

    // Route-by-user comes from proxy basic credentials when present.
    let http_user = req
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("proxy-authorization"))
        .and_then(|h| basic_user(h.value))
        .unwrap_or_default();

    Some(ConnectPreface {
        host,
        http_user,
        header_len,
    })
}

fn basic_user(value: &[u8]) -> Option<String> {
    let value = std::str::from_utf8(value).ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    Some(decoded.split(':').next().unwrap_or_default().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect() {
        let preface = parse_connect(b"CONNECT api.internal:8080 HTTP/1.1\r\nHost: api.internal\r\n\r\n")
            .unwrap();
        assert_eq!(preface.host, "api.internal");
        assert_eq!(preface.http_user, "");
        assert_eq!(
            preface.header_len,
            b"CONNECT api.internal:8080 HTTP/1.1\r\nHost: api.internal\r\n\r\n".len()
        );
    }

    #[test]
    fn test_parse_connect_with_proxy_auth() {
        let auth = base64::engine::general_purpose::STANDARD.encode("alice:pw");
        let raw = format!(
            "CONNECT db.internal:5432 HTTP/1.1\r\nProxy-Authorization: Basic {auth}\r\n\r\n"
        );
        let preface = parse_connect(raw.as_bytes()).unwrap();
        assert_eq!(preface.host, "db.internal");
        assert_eq!(preface.http_user, "alice");
    }

    #[test]
    fn test_parse_rejects_other_methods() {
        assert!(parse_connect(b"GET / HTTP/1.1\r\n\r\n").is_none());
    }
}
