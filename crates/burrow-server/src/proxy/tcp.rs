//! Plain TCP proxies: one reserved public port per proxy, or a shared
//! group port with round-robin dispatch.

use super::{BaseProxy, Proxy};
use crate::error::Result;
use crate::group::spawn_health_monitor;
use crate::net::InternalListener;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tracing::{debug, info};

enum RunState {
    Standalone { port: u16 },
    Grouped { group: String, port: u16 },
}

pub struct TcpProxy {
    base: Arc<BaseProxy>,
    state: Mutex<Option<RunState>>,
}

impl TcpProxy {
    pub fn new(base: Arc<BaseProxy>) -> Self {
        Self {
            base,
            state: Mutex::new(None),
        }
    }

    fn spawn_accept_tcp(&self, listener: TcpListener, port: u16) {
        let base = Arc::clone(&self.base);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = base.cancel.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((conn, peer)) => {
                            debug!("proxy [{}]: user conn from {peer}", base.name);
                            base.spawn_user_conn(Box::new(conn), Some(peer), port);
                        }
                        Err(e) => {
                            debug!("proxy [{}]: accept error: {e}", base.name);
                            return;
                        }
                    }
                }
            }
        });
    }

    fn spawn_accept_internal(&self, listener: Arc<InternalListener>, port: u16) {
        let base = Arc::clone(&self.base);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = base.cancel.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Some(conn) => base.spawn_user_conn(conn, None, port),
                        None => return,
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Proxy for TcpProxy {
    fn base(&self) -> &Arc<BaseProxy> {
        &self.base
    }

    async fn run(&self) -> Result<String> {
        let msg = &self.base.msg;
        let ctx = &self.base.ctx;

        let real_port = if msg.group.is_empty() {
            let port = ctx.tcp_ports.acquire(&self.base.name, msg.remote_port)?;
            let bind_addr = (ctx.cfg.proxy_bind_addr.as_str(), port);
            let listener = match TcpListener::bind(bind_addr).await {
                Ok(l) => l,
                Err(e) => {
                    ctx.tcp_ports.release(&self.base.name, port);
                    return Err(e.into());
                }
            };
            info!("proxy [{}]: tcp listener on port {port}", self.base.name);
            self.spawn_accept_tcp(listener, port);
            *self.state.lock().unwrap() = Some(RunState::Standalone { port });
            port
        } else {
            let (listener, port) = ctx
                .tcp_groups
                .register(&self.base.name, &msg.group, &msg.group_key, msg.remote_port)
                .await?;
            self.spawn_accept_internal(listener, port);
            if let Some(check) = &msg.health_check {
                if let Some(flag) = ctx
                    .tcp_groups
                    .member_health_flag(&msg.group, &self.base.name)
                    .await
                {
                    spawn_health_monitor(
                        self.base.name.clone(),
                        check.clone(),
                        self.base.conn_dialer(port),
                        flag,
                        self.base.cancel.child_token(),
                    );
                }
            }
            *self.state.lock().unwrap() = Some(RunState::Grouped {
                group: msg.group.clone(),
                port,
            });
            port
        };

        Ok(format!(":{real_port}"))
    }

    async fn close(&self) {
        self.base.cancel.cancel();
        let state = self.state.lock().unwrap().take();
        match state {
            Some(RunState::Standalone { port }) => {
                self.base.ctx.tcp_ports.release(&self.base.name, port);
            }
            Some(RunState::Grouped { group, .. }) => {
                self.base
                    .ctx
                    .tcp_groups
                    .unregister(&group, &self.base.name)
                    .await;
            }
            None => {}
        }
    }

    fn used_ports_num(&self) -> usize {
        1
    }
}
