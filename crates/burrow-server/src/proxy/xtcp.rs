//! XTCP proxies: a secret internal listener for the fallback path plus
//! enrolment as a NAT-hole host for the direct path.

use super::stcp::spawn_visitor_accept;
use super::{BaseProxy, Proxy};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct XtcpProxy {
    base: Arc<BaseProxy>,
}

impl XtcpProxy {
    pub fn new(base: Arc<BaseProxy>) -> Self {
        Self { base }
    }
}

#[async_trait]
impl Proxy for XtcpProxy {
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

        if let Err(e) = self.base.ctx.nathole.register_client(
            &self.base.name,
            &msg.sk,
            &self.base.login.user,
            &msg.allow_users,
            Arc::clone(&self.base.transporter),
        ) {
            self.base.ctx.visitors.unregister(&self.base.name);
            return Err(e);
        }

        spawn_visitor_accept(&self.base, listener);
        info!("proxy [{}]: xtcp host enrolled for rendezvous", self.base.name);
        Ok(String::new())
    }

    async fn close(&self) {
        self.base.cancel.cancel();
        self.base.ctx.nathole.unregister_client(&self.base.name);
        self.base.ctx.visitors.unregister(&self.base.name);
    }
}
