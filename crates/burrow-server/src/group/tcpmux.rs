//! Groups for HTTP-CONNECT multiplexed TCP proxies.
//!
//! Works like the TCP group, but the shared resource is a tcpmux route
//! rather than a bound port: the group owns one listener registered with
//! the CONNECT muxer and fans accepted connections out to members.

use super::{next_healthy, Member};
use crate::error::{Result, ServerError};
use crate::net::{AnyStream, InternalListener};
use crate::vhost::ListenerRouters;
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct GroupMember {
    member: Member,
    listener: Arc<InternalListener>,
}

pub struct TcpMuxGroup {
    group_key: String,
    domain: String,
    route_by_http_user: String,
    members: Mutex<Vec<GroupMember>>,
    cursor: AtomicUsize,
    cancel: CancellationToken,
}

impl TcpMuxGroup {
    fn dispatch(&self, conn: AnyStream) {
        let members = self.members.lock().unwrap();
        let refs: Vec<&Member> = members.iter().map(|m| &m.member).collect();
        match next_healthy(&refs, &self.cursor) {
            Some(idx) => {
                if let Err(e) = members[idx].listener.put(conn) {
                    debug!(
                        "tcpmux group: member [{}] refused conn: {e}",
                        members[idx].member.name
                    );
                }
            }
            None => debug!("tcpmux group [{}]: no healthy members", self.domain),
        }
    }
}

pub struct TcpMuxGroupCtl {
    groups: Mutex<HashMap<String, Arc<TcpMuxGroup>>>,
    routers: Arc<ListenerRouters>,
}

impl TcpMuxGroupCtl {
    pub fn new(routers: Arc<ListenerRouters>) -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            routers,
        }
    }

    /// Rotations are scoped per (group, domain, user) route; the returned
    /// key identifies the membership for unregister.
    pub fn register(
        &self,
        proxy_name: &str,
        group: &str,
        group_key: &str,
        domain: &str,
        route_by_http_user: &str,
    ) -> Result<(Arc<InternalListener>, String)> {
        let rotation = format!("{group}@{domain}@{route_by_http_user}");
        let mut groups = self.groups.lock().unwrap();
        if let Some(existing) = groups.get(&rotation) {
            if existing.group_key != group_key {
                return Err(ServerError::AuthFailed("group key does not match".to_string()));
            }
            let listener = Arc::new(InternalListener::new());
            existing.members.lock().unwrap().push(GroupMember {
                member: Member::new(proxy_name),
                listener: Arc::clone(&listener),
            });
            return Ok((listener, rotation));
        }

        let shared = Arc::new(InternalListener::new());
        self.routers
            .add(domain, "", route_by_http_user, Arc::clone(&shared))?;

        let listener = Arc::new(InternalListener::new());
        let mux_group = Arc::new(TcpMuxGroup {
            group_key: group_key.to_string(),
            domain: domain.to_string(),
            route_by_http_user: route_by_http_user.to_string(),
            members: Mutex::new(vec![GroupMember {
                member: Member::new(proxy_name),
                listener: Arc::clone(&listener),
            }]),
            cursor: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
        });
        groups.insert(rotation.clone(), Arc::clone(&mux_group));

        info!("tcpmux group [{group}] routing host {domain}");
        let accept_group = Arc::clone(&mux_group);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_group.cancel.cancelled() => return,
                    accepted = shared.accept() => match accepted {
                        Some(conn) => accept_group.dispatch(conn),
                        None => return,
                    }
                }
            }
        });

        Ok((listener, rotation))
    }

    pub fn unregister(&self, rotation: &str, proxy_name: &str) {
        let mut groups = self.groups.lock().unwrap();
        let Some(mux_group) = groups.get(rotation) else {
            return;
        };
        let empty = {
            let mut members = mux_group.members.lock().unwrap();
            if let Some(pos) = members.iter().position(|m| m.member.name == proxy_name) {
                members[pos].listener.close();
                members.remove(pos);
            }
            members.is_empty()
        };
        if empty {
            mux_group.cancel.cancel();
            self.routers
                .remove(&mux_group.domain, "", &mux_group.route_by_http_user);
            groups.remove(rotation);
            info!("tcpmux group rotation [{rotation}] torn down");
        }
    }

    pub fn member_health_flag(
        &self,
        rotation: &str,
        proxy_name: &str,
    ) -> Option<Arc<std::sync::atomic::AtomicBool>> {
        let groups = self.groups.lock().unwrap();
        let mux_group = groups.get(rotation)?;
        let members = mux_group.members.lock().unwrap();
        members
            .iter()
            .find(|m| m.member.name == proxy_name)
            .map(|m| Arc::clone(&m.member.healthy))
    }
}
