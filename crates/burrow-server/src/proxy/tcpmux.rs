//! TCP proxies multiplexed over the shared HTTP-CONNECT port.

use super::{BaseProxy, Proxy};
use crate::error::{Result, ServerError};
use crate::group::spawn_health_monitor;
use crate::net::InternalListener;
use crate::vhost::register_listener_route;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::info;

enum RouteHandle {
    Direct { domain: String, http_user: String },
    Grouped { rotation: String },
}

pub struct TcpMuxProxy {
    base: Arc<BaseProxy>,
    registered: Mutex<Vec<RouteHandle>>,
}

impl TcpMuxProxy {
    pub fn new(base: Arc<BaseProxy>) -> Self {
        Self {
            base,
            registered: Mutex::new(Vec::new()),
        }
    }

    fn spawn_accept(&self, listener: Arc<InternalListener>, port: u16) {
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

    fn unwind(&self) {
        let ctx = &self.base.ctx;
        for handle in self.registered.lock().unwrap().drain(..) {
            match handle {
                RouteHandle::Direct { domain, http_user } => {
                    if let Some(muxer) = &ctx.tcpmux_muxer {
                        if let Some(listener) = muxer.routers.get(&domain, "", &http_user) {
                            listener.close();
                        }
                        muxer.routers.remove(&domain, "", &http_user);
                    }
                }
                RouteHandle::Grouped { rotation } => {
                    if let Some(groups) = &ctx.tcpmux_groups {
                        groups.unregister(&rotation, &self.base.name);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Proxy for TcpMuxProxy {
    fn base(&self) -> &Arc<BaseProxy> {
        &self.base
    }

    async fn run(&self) -> Result<String> {
        let msg = &self.base.msg;
        let ctx = &self.base.ctx;
        if msg.multiplexer != "httpconnect" {
            return Err(ServerError::UnknownProxyType(format!(
                "tcpmux multiplexer [{}]",
                msg.multiplexer
            )));
        }
        if ctx.cfg.tcpmux_httpconnect_port == 0 {
            return Err(ServerError::ResourceUnavailable(
                "tcpmux proxies need tcpmux_httpconnect_port".to_string(),
            ));
        }
        let muxer = ctx.tcpmux_muxer.as_ref().expect("tcpmux muxer built with port");
        let port = ctx.cfg.tcpmux_httpconnect_port;

        let domains = self.base.vhost_domains()?;
        let mut addrs = Vec::new();
        for domain in &domains {
            let outcome = if msg.group.is_empty() {
                register_listener_route(&muxer.routers, domain, &msg.route_by_http_user).map(
                    |listener| {
                        (
                            listener,
                            RouteHandle::Direct {
                                domain: domain.clone(),
                                http_user: msg.route_by_http_user.clone(),
                            },
                        )
                    },
                )
            } else {
                let groups = ctx.tcpmux_groups.as_ref().expect("built with muxer");
                groups
                    .register(
                        &self.base.name,
                        &msg.group,
                        &msg.group_key,
                        domain,
                        &msg.route_by_http_user,
                    )
                    .map(|(listener, rotation)| (listener, RouteHandle::Grouped { rotation }))
            };
            match outcome {
                Ok((listener, handle)) => {
                    self.registered.lock().unwrap().push(handle);
                    self.spawn_accept(listener, port);
                }
                Err(e) => {
                    self.unwind();
                    return Err(e);
                }
            }
            addrs.push(format!("{domain}:{port}"));
        }

        if !msg.group.is_empty() {
            if let Some(check) = &msg.health_check {
                let groups = ctx.tcpmux_groups.as_ref().expect("built with muxer");
                let registered = self.registered.lock().unwrap();
                for handle in registered.iter() {
                    let RouteHandle::Grouped { rotation } = handle else {
                        continue;
                    };
                    if let Some(flag) = groups.member_health_flag(rotation, &self.base.name) {
                        spawn_health_monitor(
                            self.base.name.clone(),
                            check.clone(),
                            self.base.conn_dialer(port),
                            flag,
                            self.base.cancel.child_token(),
                        );
                    }
                }
            }
        }

        info!(
            "proxy [{}]: tcpmux routes for [{}]",
            self.base.name,
            addrs.join(",")
        );
        Ok(addrs.join(","))
    }

    async fn close(&self) {
        self.base.cancel.cancel();
        self.unwind();
    }
}
