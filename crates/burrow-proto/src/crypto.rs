//! AES-CTR wrapping for control and work connections.
//!
//! Each direction uses an independent keystream: the writer generates a
//! random 16-byte IV and sends it as a plaintext prefix; the reader consumes
//! the peer's IV before decrypting.  The key is derived from the shared
//! token, so both sides agree without any further handshake.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

type Cipher = ctr::Ctr128BE<Aes128>;

const IV_LEN: usize = 16;
const KEY_SALT: &str = "burrow";

/// Derive the 16-byte AES key from the shared token.
pub fn derive_key(token: &str) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.update(KEY_SALT.as_bytes());
    let digest = hasher.finalize();
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

enum ReadState {
    AwaitIv { iv: [u8; IV_LEN], filled: usize },
    Ready(Cipher),
}

enum WriteState {
    Init,
    Ready(Cipher),
}

/// A stream that AES-CTR-encrypts written bytes and decrypts read bytes.
pub struct EncryptedStream<S> {
    inner: S,
    key: [u8; 16],
    read_state: ReadState,
    write_state: WriteState,
    /// Ciphertext (and leading IV) not yet accepted by the inner stream.
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<S> EncryptedStream<S> {
    pub fn new(inner: S, key: [u8; 16]) -> Self {
        Self {
            inner,
            key,
            read_state: ReadState::AwaitIv {
                iv: [0u8; IV_LEN],
                filled: 0,
            },
            write_state: WriteState::Init,
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    pub fn with_token(inner: S, token: &str) -> Self {
        Self::new(inner, derive_key(token))
    }
}

impl<S> EncryptedStream<S>
where
    S: AsyncWrite + Unpin,
{
    /// Push buffered ciphertext into the inner stream.  Returns Ready(Ok)
    /// once the buffer is drained.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending_pos < self.pending.len() {
            let n = std::task::ready!(
                Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.pending_pos..])
            )?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending_pos += n;
        }
        self.pending.clear();
        self.pending_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncRead for EncryptedStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.read_state {
                ReadState::AwaitIv { iv, filled } => {
                    let mut iv_buf = ReadBuf::new(&mut iv[*filled..]);
                    std::task::ready!(Pin::new(&mut this.inner).poll_read(cx, &mut iv_buf))?;
                    let n = iv_buf.filled().len();
                    if n == 0 {
                        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                    }
                    *filled += n;
                    if *filled == IV_LEN {
                        let cipher = Cipher::new(&this.key.into(), (&*iv).into());
                        this.read_state = ReadState::Ready(cipher);
                    }
                }
                ReadState::Ready(cipher) => {
                    let before = buf.filled().len();
                    std::task::ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
                    cipher.apply_keystream(&mut buf.filled_mut()[before..]);
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl<S> AsyncWrite for EncryptedStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let WriteState::Init = this.write_state {
            let mut iv = [0u8; IV_LEN];
            rand::thread_rng().fill_bytes(&mut iv);
            this.pending.extend_from_slice(&iv);
            this.write_state = WriteState::Ready(Cipher::new(&this.key.into(), (&iv).into()));
        }
        // Only accept new plaintext once earlier ciphertext has gone out, so
        // the internal buffer stays bounded.
        std::task::ready!(this.poll_drain(cx))?;
        let cipher = match &mut this.write_state {
            WriteState::Ready(c) => c,
            WriteState::Init => unreachable!(),
        };
        let mut chunk = buf.to_vec();
        cipher.apply_keystream(&mut chunk);
        this.pending = chunk;
        this.pending_pos = 0;
        // Best effort push; leftovers drain on the next write or flush.
        let _ = this.poll_drain(cx)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        std::task::ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        std::task::ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
