//! HTTPS proxies: SNI-routed raw TLS byte streams, no decryption.

use super::{BaseProxy, Proxy};
use crate::error::{Result, ServerError};
use crate::net::InternalListener;
use crate::vhost::register_listener_route;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::info;

pub struct HttpsProxy {
    base: Arc<BaseProxy>,
    registered: Mutex<Vec<String>>,
}

impl HttpsProxy {
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
        if let Some(muxer) = &self.base.ctx.https_muxer {
            for domain in self.registered.lock().unwrap().drain(..) {
                if let Some(listener) = muxer.routers.get(&domain, "", "") {
                    listener.close();
                }
                muxer.routers.remove(&domain, "", "");
            }
        }
    }
}

#[async_trait]
impl Proxy for HttpsProxy {
    fn base(&self) -> &Arc<BaseProxy> {
        &self.base
    }

    async fn run(&self) -> Result<String> {
        let ctx = &self.base.ctx;
        if ctx.cfg.vhost_https_port == 0 {
            return Err(ServerError::ResourceUnavailable(
                "https proxies need vhost_https_port".to_string(),
            ));
        }
        let muxer = ctx.https_muxer.as_ref().expect("https muxer built with port");

        let domains = self.base.vhost_domains()?;
        let mut addrs = Vec::new();
        for domain in &domains {
            let listener = match register_listener_route(&muxer.routers, domain, "") {
                Ok(l) => l,
                Err(e) => {
                    self.unwind();
                    return Err(e);
                }
            };
            self.registered.lock().unwrap().push(domain.clone());
            self.spawn_accept(listener, ctx.cfg.vhost_https_port);
            addrs.push(format!("{domain}:{}", ctx.cfg.vhost_https_port));
        }

        info!(
            "proxy [{}]: https routes for [{}]",
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
