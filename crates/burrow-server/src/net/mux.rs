//! Byte-peek demultiplexing for the shared bind port.
//!
//! The first bytes of every accepted connection decide which sub-listener
//! owns it; the consumed prefix is replayed through [`PeekedStream`] so the
//! downstream handler sees an untouched stream.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Leading byte a client sends before its TLS handshake to claim the
/// tunnel-over-TLS sub-listener.  0x17 deliberately differs from the
/// standard ClientHello byte 0x16 so vhost-HTTPS can share the port.
pub const TLS_HEAD_BYTE: u8 = 0x17;

/// Path the websocket sub-listener answers on.
pub const WEBSOCKET_PATH: &str = "/~!frp";

const HTTP_METHODS: [&str; 9] = [
    "GET ", "POST ", "PUT ", "DELETE ", "HEAD ", "OPTIONS ", "PATCH ", "CONNECT ", "TRACE ",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniffed {
    /// Websocket handshake for the tunnel protocol.
    Websocket,
    /// Tunnel-over-TLS; `strip_head` marks the dedicated 0x17 preface byte
    /// that must be consumed before the handshake.
    FrpTls { strip_head: bool },
    /// TLS ClientHello routed to the vhost-HTTPS muxer.
    VhostHttps,
    /// Plain HTTP routed to the vhost reverse proxy.
    VhostHttp,
    /// Anything else: raw framed control traffic.
    Raw,
}

/// Classify a connection by its first bytes.  Returns None while the prefix
/// is still ambiguous and more bytes are needed.
pub fn classify(prefix: &[u8], https_on_bind_port: bool, http_on_bind_port: bool) -> Option<Sniffed> {
    let first = *prefix.first()?;
    if first == TLS_HEAD_BYTE {
        return Some(Sniffed::FrpTls { strip_head: true });
    }
    if first == 0x16 {
        return if https_on_bind_port {
            Some(Sniffed::VhostHttps)
        } else {
            Some(Sniffed::FrpTls { strip_head: false })
        };
    }

    // The websocket magic is an HTTP GET for a reserved path, so it must win
    // over the generic HTTP match.
    let ws_magic = format!("GET {WEBSOCKET_PATH}");
    match starts_with_partial(prefix, ws_magic.as_bytes()) {
        Match::Full => return Some(Sniffed::Websocket),
        Match::Partial => return None,
        Match::No => {}
    }

    if http_on_bind_port {
        let mut partial = false;
        for method in HTTP_METHODS {
            match starts_with_partial(prefix, method.as_bytes()) {
                Match::Full => return Some(Sniffed::VhostHttp),
                Match::Partial => partial = true,
                Match::No => {}
            }
        }
        if partial {
            return None;
        }
    }

    Some(Sniffed::Raw)
}

enum Match {
    Full,
    Partial,
    No,
}

fn starts_with_partial(prefix: &[u8], pattern: &[u8]) -> Match {
    let n = prefix.len().min(pattern.len());
    if prefix[..n] != pattern[..n] {
        return Match::No;
    }
    if prefix.len() >= pattern.len() {
        Match::Full
    } else {
        Match::Partial
    }
}

/// A stream that replays an already-read prefix before the inner stream.
pub struct PeekedStream<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> PeekedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let n = (this.prefix.len() - this.pos).min(buf.remaining());
            buf.put_slice(&this.prefix[this.pos..this.pos + n]);
            this.pos += n;
            if this.pos == this.prefix.len() {
                this.prefix = Vec::new();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_classify_tls_head_byte() {
        // 0x17 always claims the tunnel TLS listener, shared port or not.
        assert_eq!(
            classify(&[0x17, 0x03], true, true),
            Some(Sniffed::FrpTls { strip_head: true })
        );
        assert_eq!(
            classify(&[0x17], false, false),
            Some(Sniffed::FrpTls { strip_head: true })
        );
    }

    #[test]
    fn test_classify_client_hello_depends_on_layout() {
        // Plain ClientHello: vhost-HTTPS wins only when it shares the port.
        assert_eq!(classify(&[0x16, 0x03], true, false), Some(Sniffed::VhostHttps));
        assert_eq!(
            classify(&[0x16, 0x03], false, false),
            Some(Sniffed::FrpTls { strip_head: false })
        );
    }

    #[test]
    fn test_classify_websocket_beats_vhost_http() {
        assert_eq!(
            classify(b"GET /~!frp HTTP/1.1\r\n", true, true),
            Some(Sniffed::Websocket)
        );
        assert_eq!(
            classify(b"GET /index.html HTTP/1.1\r\n", false, true),
            Some(Sniffed::VhostHttp)
        );
        // Without vhost HTTP on this port a GET is raw traffic.
        assert_eq!(
            classify(b"GET /index.html HTTP/1.1\r\n", false, false),
            Some(Sniffed::Raw)
        );
    }

    #[test]
    fn test_classify_needs_more_bytes() {
        assert_eq!(classify(b"", true, true), None);
        assert_eq!(classify(b"GET /~!", true, true), None);
        assert_eq!(classify(b"PO", false, true), None);
        assert_eq!(classify(b"o", false, true), Some(Sniffed::Raw));
    }

    #[tokio::test]
    async fn test_peeked_stream_replays_prefix() {
        let (a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            b.write_all(b" world").await.unwrap();
        });
        let mut s = PeekedStream::new(b"hello".to_vec(), a);
        let mut out = vec![0u8; 11];
        s.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hello world");
    }
}
