//! Secret TCP/UDP proxies: no public surface at all.  The internal
//! listener receives admitted visitor connections from the visitor
//! manager.

use super::{BaseProxy, Proxy};
use crate::error::Result;
use crate::net::InternalListener;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct StcpProxy {
    base: Arc<BaseProxy>,
}

impl StcpProxy {
    pub fn new(base: Arc<BaseProxy>) -> Self {
        Self { base }
    }
}

pub(super) fn spawn_visitor_accept(base: &Arc<BaseProxy>, listener: Arc<InternalListener>) {
    let base = Arc::clone(base);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = base.cancel.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Some(conn) => base.spawn_user_conn(conn, None, 0),
                    None => return,
                }
            }
        }
    });
}

#[async_trait]
impl Proxy for StcpProxy {
    fn base(&self) -> &Arc<BaseProxy> {
        &self.base
    }

    async fn run(&self) -> Result<String> {
        let msg = &self.base.msg;
        let listener = self.base.ctx.visitors.register(
            &self.base.name,
            &msg.sk,
            &self.base.login.user,
            &msg.allow_users,
        )?;
        spawn_visitor_accept(&self.base, listener);
        info!(
            "proxy [{}]: {} visitor listener ready",
            self.base.name, msg.proxy_type
        );
        // Nothing public to advertise.
        Ok(String::new())
    }

    async fn close(&self) {
        self.base.cancel.cancel();
        self.base.ctx.visitors.unregister(&self.base.name);
    }
}
