//! QUIC front door.
//!
//! QUIC streams are natively multiplexed: every accepted bidirectional
//! stream is one message-carrying connection, with no yamux layer on top.

use crate::config::ServerConfig;
use crate::net::AnyStream;
use quinn::crypto::rustls::QuicServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::Join;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One logical connection: a bidirectional QUIC stream pair.
pub type QuicStream = Join<quinn::RecvStream, quinn::SendStream>;

pub fn bind(cfg: &ServerConfig) -> anyhow::Result<quinn::Endpoint> {
    let tls = super::tls::quic_server_config(cfg)?;
    let quic_tls = QuicServerConfig::try_from(tls)
        .map_err(|e| anyhow::anyhow!("quic tls config: {e}"))?;
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_tls));

    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        Duration::from_secs(cfg.transport.quic.max_idle_timeout_secs)
            .try_into()
            .map_err(|e| anyhow::anyhow!("quic idle timeout: {e}"))?,
    ));
    transport.keep_alive_interval(Some(Duration::from_secs(
        cfg.transport.quic.keepalive_period_secs,
    )));
    transport.max_concurrent_bidi_streams(cfg.transport.quic.max_incoming_streams.into());
    server_config.transport_config(Arc::new(transport));

    let bind_addr: SocketAddr = format!("{}:{}", cfg.bind_addr, cfg.quic_bind_port).parse()?;
    let endpoint = quinn::Endpoint::server(server_config, bind_addr)?;
    info!("quic listener on {bind_addr}");
    Ok(endpoint)
}

/// Accept connections, then streams within them; each stream goes through
/// the handler independently.
pub fn spawn_accept_loop<F>(endpoint: quinn::Endpoint, cancel: CancellationToken, handler: F)
where
    F: Fn(AnyStream, SocketAddr) + Send + Sync + Clone + 'static,
{
    tokio::spawn(async move {
        loop {
            let incoming = tokio::select! {
                _ = cancel.cancelled() => return,
                incoming = endpoint.accept() => match incoming {
                    Some(i) => i,
                    None => return,
                }
            };
            let handler = handler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let connection = match incoming.await {
                    Ok(c) => c,
                    Err(e) => {
                        debug!("quic handshake failed: {e}");
                        return;
                    }
                };
                let peer = connection.remote_address();
                loop {
                    let stream = tokio::select! {
                        _ = cancel.cancelled() => return,
                        stream = connection.accept_bi() => stream,
                    };
                    match stream {
                        Ok((send, recv)) => {
                            handler(Box::new(tokio::io::join(recv, send)), peer);
                        }
                        Err(quinn::ConnectionError::ApplicationClosed(_))
                        | Err(quinn::ConnectionError::ConnectionClosed(_)) => return,
                        Err(e) => {
                            warn!("quic stream error from {peer}: {e}");
                            return;
                        }
                    }
                }
            });
        }
    });
}
