//! SNI-routed HTTPS multiplexing.
//!
//! TLS byte streams are forwarded without decryption: the muxer parses just
//! enough of the ClientHello to read the server name, then hands the intact
//! stream (peeked bytes replayed) to the listener registered for that
//! domain.

use super::ListenerRouters;
use crate::net::mux::PeekedStream;
use crate::net::AnyStream;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::debug;

const MAX_HELLO_BYTES: usize = 16 * 1024;

pub struct HttpsMuxer {
    pub routers: Arc<ListenerRouters>,
    timeout: Duration,
}

impl HttpsMuxer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            routers: Arc::new(ListenerRouters::new()),
            timeout,
        }
    }

    /// Route one accepted connection.  Unroutable or unparsable connections
    /// are dropped.
    pub async fn handle_conn(&self, mut conn: AnyStream) {
        let peeked = match tokio::time::timeout(self.timeout, read_client_hello(&mut conn)).await {
            Ok(Some(buf)) => buf,
            _ => return,
        };
        let Some(sni) = extract_sni(&peeked) else {
            debug!("https muxer: client hello without sni, dropping");
            return;
        };
        let Some(listener) = self.routers.route(&sni, "", "") else {
            debug!("https muxer: no route for sni {sni}");
            return;
        };
        let stream: AnyStream = Box::new(PeekedStream::new(peeked, conn));
        if let Err(e) = listener.put(stream) {
            debug!("https muxer: listener for {sni} rejected conn: {e}");
        }
    }
}

/// Read until the buffer contains a complete TLS record (or give up).
async fn read_client_hello(conn: &mut AnyStream) -> Option<Vec<u8>> {
    let mut buf = Vec::with_capacity(2048);
    let mut chunk = [0u8; 2048];
    loop {
        if let Some(total) = record_len(&buf) {
            if buf.len() >= total {
                return Some(buf);
            }
        }
        if buf.len() > MAX_HELLO_BYTES {
            return None;
        }
        match conn.read(&mut chunk).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

/// Total length of the first TLS record, once the 5-byte header is in.
fn record_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 5 || buf[0] != 0x16 {
        return None;
    }
    Some(5 + ((buf[3] as usize) << 8 | buf[4] as usize))
}

/// Pull the server name out of a ClientHello, if present.
pub fn extract_sni(buf: &[u8]) -> Option<String> {
    // Record header (5) + handshake type/length (4).
    if buf.len() < 9 || buf[0] != 0x16 || buf[5] != 0x01 {
        return None;
    }
    let mut pos = 9;

    // Client version + random.
    pos += 2 + 32;
    // Session id.
    let session_len = *buf.get(pos)? as usize;
    pos += 1 + session_len;
    // Cipher suites.
    let suites_len = read_u16(buf, pos)? as usize;
    pos += 2 + suites_len;
    // Compression methods.
    let comp_len = *buf.get(pos)? as usize;
    pos += 1 + comp_len;
    // Extensions.
    let ext_total = read_u16(buf, pos)? as usize;
    pos += 2;
    let ext_end = pos.checked_add(ext_total)?;
    if ext_end > buf.len() {
        return None;
    }

    while pos + 4 <= ext_end {
        let ext_type = read_u16(buf, pos)?;
        let ext_len = read_u16(buf, pos + 2)? as usize;
        pos += 4;
        if pos + ext_len > ext_end {
            return None;
        }
        if ext_type == 0 {
            // server_name list: 2-byte list length, then 1-byte name type
            // and 2-byte hostname length.
            if ext_len < 5 || buf[pos + 2] != 0 {
                return None;
            }
            let name_len = read_u16(buf, pos + 3)? as usize;
            let start = pos + 5;
            if start + name_len > ext_end {
                return None;
            }
            return std::str::from_utf8(&buf[start..start + name_len])
                .ok()
                .map(str::to_lowercase);
        }
        pos += ext_len;
    }
    None
}

fn read_u16(buf: &[u8], pos: usize) -> Option<u16> {
    Some(((*buf.get(pos)? as u16) << 8) | *buf.get(pos + 1)? as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal ClientHello with one SNI entry.
    fn client_hello(sni: &str) -> Vec<u8> {
        let name = sni.as_bytes();
        let sni_ext_len = 5 + name.len();
        let ext_total = 4 + sni_ext_len;

        let mut hs = Vec::new();
        hs.extend_from_slice(&[0x03, 0x03]); // version
        hs.extend_from_slice(&[0u8; 32]); // random
        hs.push(0); // session id
        hs.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one cipher suite
        hs.extend_from_slice(&[0x01, 0x00]); // null compression
        hs.extend_from_slice(&(ext_total as u16).to_be_bytes());
        hs.extend_from_slice(&0u16.to_be_bytes()); // ext type: server_name
        hs.extend_from_slice(&(sni_ext_len as u16).to_be_bytes());
        hs.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes()); // list len
        hs.push(0); // host_name
        hs.extend_from_slice(&(name.len() as u16).to_be_bytes());
        hs.extend_from_slice(name);

        let mut out = Vec::new();
        out.push(0x16);
        out.extend_from_slice(&[0x03, 0x01]);
        out.extend_from_slice(&((hs.len() + 4) as u16).to_be_bytes());
        out.push(0x01); // client hello
        out.push(0);
        out.extend_from_slice(&(hs.len() as u16).to_be_bytes()[..]);
        out.extend_from_slice(&hs);
        out
    }

    #[test]
    fn test_extract_sni() {
        let hello = client_hello("api.example.com");
        assert_eq!(extract_sni(&hello).as_deref(), Some("api.example.com"));
    }

    #[test]
    fn test_extract_sni_lowercases() {
        let hello = client_hello("API.Example.Com");
        assert_eq!(extract_sni(&hello).as_deref(), Some("api.example.com"));
    }

    #[test]
    fn test_extract_sni_rejects_non_tls() {
        assert_eq!(extract_sni(b"GET / HTTP/1.1\r\n\r\n"), None);
        assert_eq!(extract_sni(&[]), None);
    }

    #[test]
    fn test_extract_sni_truncated_returns_none() {
        let hello = client_hello("api.example.com");
        assert_eq!(extract_sni(&hello[..20]), None);
    }

    #[test]
    fn test_record_len() {
        let hello = client_hello("x.y");
        assert_eq!(record_len(&hello), Some(hello.len()));
        assert_eq!(record_len(&hello[..3]), None);
    }
}
