pub mod kcp;
pub mod mux;
pub mod quic;
pub mod tls;
pub mod ws;
pub mod yamux;

use crate::error::{Result, ServerError};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};

use burrow_proto::msg::{self, Message};

/// Object-safe duplex byte stream.  Every transport (TCP, TLS, websocket,
/// KCP, QUIC streams, yamux streams, in-memory pipes) erases to this.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type AnyStream = Box<dyn AsyncStream>;

/// A listener other tasks can push established connections into.  Backs the
/// STCP/SUDP/XTCP internal listeners, group listeners, vhost muxer routes,
/// and the SSH gateway bridge.
#[derive(Debug)]
pub struct InternalListener {
    tx: StdMutex<Option<mpsc::Sender<AnyStream>>>,
    rx: Mutex<mpsc::Receiver<AnyStream>>,
}

impl InternalListener {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(128);
        Self {
            tx: StdMutex::new(Some(tx)),
            rx: Mutex::new(rx),
        }
    }

    /// Next queued connection; None once the listener is closed and drained.
    pub async fn accept(&self) -> Option<AnyStream> {
        self.rx.lock().await.recv().await
    }

    /// Non-blocking enqueue.  A full queue drops the connection, per the
    /// overflow policy: bounded channels with discard-and-error.
    pub fn put(&self, conn: AnyStream) -> Result<()> {
        let guard = self.tx.lock().unwrap();
        let tx = guard.as_ref().ok_or(ServerError::ControlClosed)?;
        tx.try_send(conn).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ServerError::ResourceUnavailable("listener accept queue is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => ServerError::ControlClosed,
        })
    }

    pub fn close(&self) {
        self.tx.lock().unwrap().take();
    }
}

impl Default for InternalListener {
    fn default() -> Self {
        Self::new()
    }
}

pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Token bucket with rate == burst == bytes/sec, per the server-side
/// bandwidth-limit mode.
pub fn new_limiter(bytes_per_sec: u64) -> Option<Limiter> {
    let rate = u32::try_from(bytes_per_sec).unwrap_or(u32::MAX);
    let quota = Quota::per_second(NonZeroU32::new(rate)?);
    Some(RateLimiter::direct(quota))
}

async fn limit(limiter: &Limiter, mut n: u32) {
    // until_n_ready cannot exceed the burst; large reads pay in slices.
    const SLICE: u32 = 64 * 1024;
    while n > 0 {
        let step = n.min(SLICE);
        if let Some(step) = NonZeroU32::new(step) {
            // Only fails when step exceeds the burst; fall back to waiting a
            // full refill period in that case.
            if limiter.until_n_ready(step).await.is_err() {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        n -= step;
    }
}

async fn copy_half<R, W>(
    r: &mut R,
    w: &mut W,
    limiter: Option<&Limiter>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0u64;
    loop {
        let n = match r.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if let Some(l) = limiter {
            limit(l, n as u32).await;
        }
        if w.write_all(&buf[..n]).await.is_err() {
            break;
        }
        if w.flush().await.is_err() {
            break;
        }
        total += n as u64;
    }
    let _ = w.shutdown().await;
    total
}

/// Splice two streams together until both directions finish.  Returns
/// (bytes a→b, bytes b→a).  The optional limiter throttles both directions
/// out of one bucket.
pub async fn join_streams<A, B>(a: A, b: B, limiter: Option<&Limiter>) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ar, mut aw) = tokio::io::split(a);
    let (mut br, mut bw) = tokio::io::split(b);
    tokio::join!(
        copy_half(&mut ar, &mut bw, limiter),
        copy_half(&mut br, &mut aw, limiter),
    )
}

/// Read one framed message with a deadline.
pub async fn read_message_timeout(
    stream: &mut (impl AsyncRead + Unpin),
    deadline: Duration,
) -> Result<Message> {
    match tokio::time::timeout(deadline, msg::read_message(stream)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ServerError::ProtocolViolation(
            "timed out waiting for message".to_string(),
        )),
    }
}
