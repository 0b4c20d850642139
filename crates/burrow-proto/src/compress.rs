//! Optional deflate layer for work connections.
//!
//! Compression applies per direction: reads inflate, writes deflate.  The
//! encoder emits a sync flush whenever the stream is flushed, so framed
//! messages cross the wire without waiting for more payload.

use async_compression::tokio::bufread::DeflateDecoder;
use async_compression::tokio::write::DeflateEncoder;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, Join, ReadHalf, WriteHalf};

pub type CompressedStream<S> =
    Join<DeflateDecoder<BufReader<ReadHalf<S>>>, DeflateEncoder<WriteHalf<S>>>;

/// Wrap a duplex stream so that both directions are deflate-compressed.
pub fn compressed<S>(stream: S) -> CompressedStream<S>
where
    S: AsyncRead + AsyncWrite,
{
    let (r, w) = tokio::io::split(stream);
    let r = DeflateDecoder::new(BufReader::new(r));
    let w = DeflateEncoder::new(w);
    tokio::io::join(r, w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_compressed_round_trip() {
        let (a, b) = tokio::io::duplex(16 * 1024);
        let mut tx = compressed(a);
        let mut rx = compressed(b);

        let payload = "0123456789".repeat(500);
        tx.write_all(payload.as_bytes()).await.unwrap();
        tx.flush().await.unwrap();

        let mut got = vec![0u8; payload.len()];
        rx.read_exact(&mut got).await.unwrap();
        assert_eq!(got, payload.as_bytes());
    }
}
