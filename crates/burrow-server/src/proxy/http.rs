//! HTTP proxies: vhost routes into the shared reverse proxy.

use super::{BaseProxy, Proxy};
use crate::error::{Result, ServerError};
use crate::group::spawn_health_monitor;
use crate::vhost::RouteConfig;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::info;

enum RouteHandle {
    Direct {
        domain: String,
        location: String,
        http_user: String,
    },
    Grouped {
        rotation: String,
    },
}

pub struct HttpProxy {
    base: Arc<BaseProxy>,
    registered: Mutex<Vec<RouteHandle>>,
}

impl HttpProxy {
    pub fn new(base: Arc<BaseProxy>) -> Self {
        Self {
            base,
            registered: Mutex::new(Vec::new()),
        }
    }

    fn route_config(&self, domain: &str, location: &str) -> RouteConfig {
        let msg = &self.base.msg;
        RouteConfig {
            domain: domain.to_string(),
            location: location.to_string(),
            rewrite_host: msg.host_header_rewrite.clone(),
            username: msg.http_user.clone(),
            password: msg.http_pwd.clone(),
            headers: msg.headers.clone(),
            response_headers: msg.response_headers.clone(),
            route_by_http_user: msg.route_by_http_user.clone(),
            create_conn: Some(
                self.base
                    .conn_dialer(self.base.ctx.cfg.vhost_http_port),
            ),
            choose_endpoint: None,
            create_conn_by_endpoint: None,
        }
    }

    fn unwind(&self) {
        let ctx = &self.base.ctx;
        let mut registered = self.registered.lock().unwrap();
        for handle in registered.drain(..) {
            match handle {
                RouteHandle::Direct {
                    domain,
                    location,
                    http_user,
                } => {
                    if let Some(proxy) = &ctx.http_proxy {
                        proxy.routers.remove(&domain, &location, &http_user);
                    }
                }
                RouteHandle::Grouped { rotation } => {
                    if let Some(groups) = &ctx.http_groups {
                        groups.unregister(&rotation, &self.base.name);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Proxy for HttpProxy {
    fn base(&self) -> &Arc<BaseProxy> {
        &self.base
    }

    async fn run(&self) -> Result<String> {
        let msg = &self.base.msg;
        let ctx = &self.base.ctx;
        if ctx.cfg.vhost_http_port == 0 {
            return Err(ServerError::ResourceUnavailable(
                "http proxies need vhost_http_port".to_string(),
            ));
        }
        let http_proxy = ctx.http_proxy.as_ref().expect("http proxy built with port");

        let domains = self.base.vhost_domains()?;
        let locations = if msg.locations.is_empty() {
            vec!["/".to_string()]
        } else {
            msg.locations.clone()
        };

        let mut addrs = Vec::new();
        for domain in &domains {
            for location in &locations {
                let route = self.route_config(domain, location);
                let outcome = if msg.group.is_empty() {
                    http_proxy
                        .routers
                        .add(domain, location, &msg.route_by_http_user, Arc::new(route))
                        .map(|()| RouteHandle::Direct {
                            domain: domain.clone(),
                            location: location.clone(),
                            http_user: msg.route_by_http_user.clone(),
                        })
                } else {
                    let groups = ctx.http_groups.as_ref().expect("built with http proxy");
                    groups
                        .register(&self.base.name, &msg.group, &msg.group_key, route)
                        .map(|rotation| RouteHandle::Grouped { rotation })
                };
                match outcome {
                    Ok(handle) => self.registered.lock().unwrap().push(handle),
                    Err(e) => {
                        // No half-registered proxies.
                        self.unwind();
                        return Err(e);
                    }
                }
            }
            addrs.push(format!("{domain}:{}", ctx.cfg.vhost_http_port));
        }

        if !msg.group.is_empty() {
            if let Some(check) = &msg.health_check {
                let groups = ctx.http_groups.as_ref().expect("built with http proxy");
                let registered = self.registered.lock().unwrap();
                for handle in registered.iter() {
                    let RouteHandle::Grouped { rotation } = handle else {
                        continue;
                    };
                    if let Some(flag) = groups.member_health_flag(rotation, &self.base.name) {
                        spawn_health_monitor(
                            self.base.name.clone(),
                            check.clone(),
                            self.base.conn_dialer(ctx.cfg.vhost_http_port),
                            flag,
                            self.base.cancel.child_token(),
                        );
                    }
                }
            }
        }

        info!(
            "proxy [{}]: http routes for [{}]",
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
