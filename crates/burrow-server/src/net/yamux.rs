//! Stream multiplexing for the control transports.
//!
//! With tcp_mux enabled, every physical connection (plain, TLS, websocket,
//! KCP) carries a yamux session whose inbound streams are independent
//! message-carrying connections.  The mux keep-alive also replaces the
//! application heartbeat.

use crate::net::AnyStream;
use futures_util::future::poll_fn;
use std::net::SocketAddr;
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use yamux::{Config, Connection, Mode};

/// Drive one server-side yamux session, handing each inbound stream to the
/// handler.  Returns when the peer goes away or the token fires.
pub fn spawn_session<F>(stream: AnyStream, peer: SocketAddr, cancel: CancellationToken, handler: F)
where
    F: Fn(AnyStream, SocketAddr) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut connection = Connection::new(stream.compat(), Config::default(), Mode::Server);
        loop {
            let inbound = tokio::select! {
                _ = cancel.cancelled() => return,
                inbound = poll_fn(|cx| connection.poll_next_inbound(cx)) => inbound,
            };
            match inbound {
                Some(Ok(mux_stream)) => handler(Box::new(mux_stream.compat()), peer),
                Some(Err(e)) => {
                    debug!("yamux session from {peer} failed: {e}");
                    return;
                }
                None => {
                    debug!("yamux session from {peer} closed");
                    return;
                }
            }
        }
    });
}
