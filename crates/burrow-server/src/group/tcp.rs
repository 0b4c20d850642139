//! TCP load-balancing groups.
//!
//! The first proxy to register a `(group, group_key)` reserves the public
//! port and owns the shared accept loop; later members join the rotation.
//! Inbound connections round-robin across healthy members.

use super::{next_healthy, Member};
use crate::error::{Result, ServerError};
use crate::net::{AnyStream, InternalListener};
use crate::ports::PortManager;
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct GroupMember {
    member: Member,
    listener: Arc<InternalListener>,
}

pub struct TcpGroup {
    group: String,
    group_key: String,
    port: u16,
    members: Mutex<Vec<GroupMember>>,
    cursor: AtomicUsize,
    cancel: CancellationToken,
}

impl TcpGroup {
    fn dispatch(&self, conn: AnyStream) {
        let members = self.members.lock().unwrap();
        let refs: Vec<&Member> = members.iter().map(|m| &m.member).collect();
        match next_healthy(&refs, &self.cursor) {
            Some(idx) => {
                if let Err(e) = members[idx].listener.put(conn) {
                    debug!(
                        "tcp group [{}]: member [{}] refused conn: {e}",
                        self.group, members[idx].member.name
                    );
                }
            }
            None => {
                debug!("tcp group [{}]: no healthy members, dropping conn", self.group);
            }
        }
    }
}

pub struct TcpGroupCtl {
    /// Async mutex: creation holds the lock across the bind.
    groups: tokio::sync::Mutex<HashMap<String, Arc<TcpGroup>>>,
    port_manager: Arc<PortManager>,
    bind_addr: String,
}

impl TcpGroupCtl {
    pub fn new(port_manager: Arc<PortManager>, bind_addr: &str) -> Self {
        Self {
            groups: tokio::sync::Mutex::new(HashMap::new()),
            port_manager,
            bind_addr: bind_addr.to_string(),
        }
    }

    /// Join `proxy_name` to a group, creating it (and its listener) if this
    /// is the first member.  Returns the member's accept listener and the
    /// actual public port.
    pub async fn register(
        &self,
        proxy_name: &str,
        group: &str,
        group_key: &str,
        port: u16,
    ) -> Result<(Arc<InternalListener>, u16)> {
        let mut groups = self.groups.lock().await;
        if let Some(existing) = groups.get(group).cloned() {
            if existing.group_key != group_key {
                return Err(ServerError::AuthFailed("group key does not match".to_string()));
            }
            if port != 0 && port != existing.port {
                return Err(ServerError::ProtocolViolation(format!(
                    "group [{group}] already listens on port {}",
                    existing.port
                )));
            }
            let listener = Arc::new(InternalListener::new());
            existing.members.lock().unwrap().push(GroupMember {
                member: Member::new(proxy_name),
                listener: Arc::clone(&listener),
            });
            return Ok((listener, existing.port));
        }

        // First member brings the group up.
        let reservation_name = format!("group__{group}");
        let real_port = self.port_manager.acquire(&reservation_name, port)?;
        let tcp_listener = match TcpListener::bind((self.bind_addr.as_str(), real_port)).await {
            Ok(l) => l,
            Err(e) => {
                self.port_manager.release(&reservation_name, real_port);
                return Err(e.into());
            }
        };

        let listener = Arc::new(InternalListener::new());
        let tcp_group = Arc::new(TcpGroup {
            group: group.to_string(),
            group_key: group_key.to_string(),
            port: real_port,
            members: Mutex::new(vec![GroupMember {
                member: Member::new(proxy_name),
                listener: Arc::clone(&listener),
            }]),
            cursor: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
        });
        groups.insert(group.to_string(), Arc::clone(&tcp_group));

        info!("tcp group [{group}] listening on port {real_port}");
        let accept_group = Arc::clone(&tcp_group);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_group.cancel.cancelled() => return,
                    accepted = tcp_listener.accept() => match accepted {
                        Ok((conn, _peer)) => accept_group.dispatch(Box::new(conn)),
                        Err(e) => {
                            warn!("tcp group [{}] accept error: {e}", accept_group.group);
                            return;
                        }
                    }
                }
            }
        });

        Ok((listener, real_port))
    }

    /// Drop a member; tearing down the group when the last one leaves.
    pub async fn unregister(&self, group: &str, proxy_name: &str) {
        let mut groups = self.groups.lock().await;
        let Some(tcp_group) = groups.get(group) else {
            return;
        };
        let empty = {
            let mut members = tcp_group.members.lock().unwrap();
            if let Some(pos) = members.iter().position(|m| m.member.name == proxy_name) {
                members[pos].listener.close();
                members.remove(pos);
            }
            members.is_empty()
        };
        if empty {
            tcp_group.cancel.cancel();
            self.port_manager
                .release(&format!("group__{group}"), tcp_group.port);
            groups.remove(group);
            info!("tcp group [{group}] torn down");
        }
    }

    /// Health flag for one member, shared with the health monitor.
    pub async fn member_health_flag(
        &self,
        group: &str,
        proxy_name: &str,
    ) -> Option<Arc<std::sync::atomic::AtomicBool>> {
        let groups = self.groups.lock().await;
        let tcp_group = groups.get(group)?;
        let members = tcp_group.members.lock().unwrap();
        members
            .iter()
            .find(|m| m.member.name == proxy_name)
            .map(|m| Arc::clone(&m.member.healthy))
    }
}
