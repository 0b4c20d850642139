//! UDP proxies.
//!
//! The public socket's datagrams ride a single long-lived work connection
//! as framed UdpPacket messages; replies carry the original user address so
//! the relay can route them back.  A dead work connection is replaced on
//! demand.

use super::{BaseProxy, Proxy};
use crate::error::Result;
use base64::Engine;
use burrow_proto::msg::{self, Message, UdpPacket};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct UdpProxy {
    base: Arc<BaseProxy>,
    state: Mutex<Option<u16>>,
}

impl UdpProxy {
    pub fn new(base: Arc<BaseProxy>) -> Self {
        Self {
            base,
            state: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Proxy for UdpProxy {
    fn base(&self) -> &Arc<BaseProxy> {
        &self.base
    }

    async fn run(&self) -> Result<String> {
        let ctx = &self.base.ctx;
        let port = ctx
            .udp_ports
            .acquire(&self.base.name, self.base.msg.remote_port)?;
        let bind_addr = format!("{}:{}", ctx.cfg.proxy_bind_addr, port);
        let socket = match UdpSocket::bind(&bind_addr).await {
            Ok(s) => Arc::new(s),
            Err(e) => {
                ctx.udp_ports.release(&self.base.name, port);
                return Err(e.into());
            }
        };
        info!("proxy [{}]: udp listener on port {port}", self.base.name);
        *self.state.lock().unwrap() = Some(port);

        let base = Arc::clone(&self.base);
        tokio::spawn(async move {
            relay_loop(base, socket, port).await;
        });
        Ok(format!(":{port}"))
    }

    async fn close(&self) {
        self.base.cancel.cancel();
        if let Some(port) = self.state.lock().unwrap().take() {
            self.base.ctx.udp_ports.release(&self.base.name, port);
        }
    }

    fn used_ports_num(&self) -> usize {
        1
    }
}

/// Keep one work connection alive and pump datagrams both ways.
async fn relay_loop(base: Arc<BaseProxy>, socket: Arc<UdpSocket>, port: u16) {
    loop {
        if base.cancel.is_cancelled() {
            return;
        }
        let work = tokio::select! {
            _ = base.cancel.cancelled() => return,
            result = base.work_conn_for_user(None, port) => match result {
                Ok(w) => w,
                Err(e) => {
                    warn!("proxy [{}]: no work conn for udp relay: {e}", base.name);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            }
        };
        debug!("proxy [{}]: udp relay work conn established", base.name);
        pump(&base, &socket, work).await;
    }
}

async fn pump(base: &Arc<BaseProxy>, socket: &Arc<UdpSocket>, work: crate::net::AnyStream) {
    let (mut work_r, mut work_w) = tokio::io::split(work);
    let (out_tx, mut out_rx) = mpsc::channel::<UdpPacket>(64);

    // Socket → work conn.
    let recv_socket = Arc::clone(socket);
    let ingest = tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        loop {
            let Ok((n, peer)) = recv_socket.recv_from(&mut buf).await else {
                return;
            };
            let packet = UdpPacket {
                content: base64::engine::general_purpose::STANDARD.encode(&buf[..n]),
                src_addr: peer.to_string(),
                dst_addr: String::new(),
            };
            if out_tx.send(packet).await.is_err() {
                return;
            }
        }
    });

    let writer = async {
        while let Some(packet) = out_rx.recv().await {
            if msg::write_message(&mut work_w, &Message::UdpPacket(packet))
                .await
                .is_err()
            {
                return;
            }
        }
    };

    // Work conn → socket.
    let reader = async {
        loop {
            match msg::read_message(&mut work_r).await {
                Ok(Message::UdpPacket(packet)) => {
                    let Ok(payload) =
                        base64::engine::general_purpose::STANDARD.decode(&packet.content)
                    else {
                        continue;
                    };
                    let Ok(dest) = packet.dst_addr.parse::<std::net::SocketAddr>() else {
                        continue;
                    };
                    let _ = socket.send_to(&payload, dest).await;
                }
                Ok(_) => continue,
                Err(_) => return,
            }
        }
    };

    tokio::select! {
        _ = base.cancel.cancelled() => {}
        _ = writer => {}
        _ = reader => {}
    }
    ingest.abort();
}
