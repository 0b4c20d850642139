//! KCP front door: reliable UDP with stream framing.

use crate::net::AnyStream;
use std::net::SocketAddr;
use tokio_kcp::{KcpConfig, KcpListener};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Fixed MTU for the tunnel's KCP transport.
const KCP_MTU: usize = 1350;

pub async fn bind(addr: &str, port: u16) -> anyhow::Result<KcpListener> {
    let config = KcpConfig {
        mtu: KCP_MTU,
        stream: true,
        ..KcpConfig::default()
    };
    let bind_addr: SocketAddr = format!("{addr}:{port}").parse()?;
    let listener = KcpListener::bind(config, bind_addr).await?;
    info!("kcp listener on {bind_addr}");
    Ok(listener)
}

/// Accept loop; each KCP session is handed off like any raw connection.
pub fn spawn_accept_loop<F>(mut listener: KcpListener, cancel: CancellationToken, handler: F)
where
    F: Fn(AnyStream, SocketAddr) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => handler(Box::new(stream), peer),
                    Err(e) => {
                        warn!("kcp accept error: {e}");
                        return;
                    }
                }
            }
        }
    });
}
