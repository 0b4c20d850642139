//! Internal listeners for STCP/SUDP/XTCP services.
//!
//! The host side of such a proxy never opens a public port; instead its
//! proxy registers an in-memory listener here, and visitor connections are
//! admitted by secret key and allow-user list.

use crate::error::{Result, ServerError};
use crate::net::{AnyStream, InternalListener};
use burrow_proto::auth;
use burrow_proto::msg::NewVisitorConn;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

struct ListenerBundle {
    listener: Arc<InternalListener>,
    sk: String,
    owner_user: String,
    allow_users: Vec<String>,
}

pub struct VisitorManager {
    listeners: RwLock<HashMap<String, ListenerBundle>>,
    /// Shared token used for the optional encryption layer.
    token: String,
}

impl VisitorManager {
    pub fn new(token: &str) -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            token: token.to_string(),
        }
    }

    /// Called by STCP/SUDP/XTCP proxies at Run.
    pub fn register(
        &self,
        proxy_name: &str,
        sk: &str,
        owner_user: &str,
        allow_users: &[String],
    ) -> Result<Arc<InternalListener>> {
        let mut listeners = self.listeners.write().unwrap();
        if listeners.contains_key(proxy_name) {
            return Err(ServerError::DuplicateName(proxy_name.to_string()));
        }
        let listener = Arc::new(InternalListener::new());
        listeners.insert(
            proxy_name.to_string(),
            ListenerBundle {
                listener: Arc::clone(&listener),
                sk: sk.to_string(),
                owner_user: owner_user.to_string(),
                allow_users: allow_users.to_vec(),
            },
        );
        Ok(listener)
    }

    pub fn unregister(&self, proxy_name: &str) {
        let mut listeners = self.listeners.write().unwrap();
        if let Some(bundle) = listeners.remove(proxy_name) {
            bundle.listener.close();
        }
    }

    /// Check a visitor's credentials without touching its connection, so
    /// the caller can answer before any tunnel bytes flow.
    pub fn verify(&self, msg: &NewVisitorConn) -> Result<()> {
        let listeners = self.listeners.read().unwrap();
        let bundle = listeners
            .get(&msg.proxy_name)
            .ok_or(ServerError::NoRouteFound)?;

        let expected = auth::auth_key(&bundle.sk, msg.timestamp);
        if !auth::constant_time_eq(&expected, &msg.sign_key) {
            return Err(ServerError::AuthFailed(
                "visitor secret key does not match".to_string(),
            ));
        }
        if !user_allowed(&msg.visitor_user, &bundle.owner_user, &bundle.allow_users) {
            return Err(ServerError::AuthFailed(format!(
                "user [{}] is not allowed to visit [{}]",
                msg.visitor_user, msg.proxy_name
            )));
        }
        Ok(())
    }

    /// Admit one verified visitor connection: apply the requested stream
    /// layers and push into the host proxy's accept queue.
    pub fn admit(&self, msg: &NewVisitorConn, conn: AnyStream) -> Result<()> {
        let listeners = self.listeners.read().unwrap();
        let bundle = listeners
            .get(&msg.proxy_name)
            .ok_or(ServerError::NoRouteFound)?;

        let mut stream = conn;
        if msg.use_encryption {
            stream = Box::new(burrow_proto::crypto::EncryptedStream::with_token(
                stream,
                &self.token,
            ));
        }
        if msg.use_compression {
            stream = Box::new(burrow_proto::compress::compressed(stream));
        }

        bundle.listener.put(stream).map_err(|e| {
            debug!("visitor listener for [{}] rejected conn", msg.proxy_name);
            e
        })
    }

    /// Verify-then-admit in one step.
    pub fn handle_visitor_conn(&self, msg: &NewVisitorConn, conn: AnyStream) -> Result<()> {
        self.verify(msg)?;
        self.admit(msg, conn)
    }
}

fn user_allowed(visitor: &str, owner: &str, allow: &[String]) -> bool {
    if allow.is_empty() {
        // No explicit list: only the owner may visit.
        return visitor == owner;
    }
    allow.iter().any(|u| u == "*" || u == visitor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::unix_timestamp;

    fn visitor_msg(name: &str, sk: &str, user: &str) -> NewVisitorConn {
        let timestamp = unix_timestamp();
        NewVisitorConn {
            proxy_name: name.to_string(),
            sign_key: auth::auth_key(sk, timestamp),
            timestamp,
            visitor_user: user.to_string(),
            ..NewVisitorConn::default()
        }
    }

    fn stream() -> AnyStream {
        let (a, _b) = tokio::io::duplex(8);
        Box::new(a)
    }

    #[tokio::test]
    async fn test_visitor_admission() {
        let manager = VisitorManager::new("tok");
        let listener = manager
            .register("svc", "s3cret", "owner", &["*".to_string()])
            .unwrap();
        manager
            .handle_visitor_conn(&visitor_msg("svc", "s3cret", "anyone"), stream())
            .unwrap();
        assert!(listener.accept().await.is_some());
    }

    #[test]
    fn test_visitor_bad_key_refused() {
        let manager = VisitorManager::new("tok");
        manager
            .register("svc", "s3cret", "owner", &["*".to_string()])
            .unwrap();
        match manager.handle_visitor_conn(&visitor_msg("svc", "wrong", "anyone"), stream()) {
            Err(ServerError::AuthFailed(_)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_visitor_unknown_proxy() {
        let manager = VisitorManager::new("tok");
        match manager.handle_visitor_conn(&visitor_msg("ghost", "sk", "u"), stream()) {
            Err(ServerError::NoRouteFound) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_user_allowed_rules() {
        assert!(user_allowed("owner", "owner", &[]));
        assert!(!user_allowed("stranger", "owner", &[]));
        assert!(user_allowed("bob", "owner", &["bob".to_string()]));
        assert!(!user_allowed("eve", "owner", &["bob".to_string()]));
        assert!(user_allowed("eve", "owner", &["*".to_string()]));
    }

    #[test]
    fn test_duplicate_registration_refused() {
        let manager = VisitorManager::new("tok");
        manager.register("svc", "a", "o", &[]).unwrap();
        match manager.register("svc", "b", "o", &[]) {
            Err(ServerError::DuplicateName(_)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
