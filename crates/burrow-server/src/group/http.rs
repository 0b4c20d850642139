//! HTTP load-balancing groups.
//!
//! The group registers a single vhost route whose endpoint chooser
//! round-robins across member proxies; each member contributes its own
//! work-connection dialer.

use super::{next_healthy, Member};
use crate::error::{Result, ServerError};
use crate::vhost::{ConfigRouters, CreateConnFn, RouteConfig};
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use tracing::info;

struct GroupMember {
    member: Member,
    create_conn: CreateConnFn,
}

pub struct HttpGroup {
    group_key: String,
    domain: String,
    location: String,
    route_by_http_user: String,
    members: Mutex<Vec<GroupMember>>,
    cursor: AtomicUsize,
}

impl HttpGroup {
    /// Next healthy member name for the reverse proxy's endpoint selection.
    fn choose(&self) -> Result<String> {
        let members = self.members.lock().unwrap();
        let refs: Vec<&Member> = members.iter().map(|m| &m.member).collect();
        match next_healthy(&refs, &self.cursor) {
            Some(idx) => Ok(members[idx].member.name.clone()),
            None => Err(ServerError::ResourceUnavailable(
                "no healthy group member".to_string(),
            )),
        }
    }

    fn dialer(&self, endpoint: &str) -> Result<CreateConnFn> {
        let members = self.members.lock().unwrap();
        members
            .iter()
            .find(|m| m.member.name == endpoint)
            .map(|m| Arc::clone(&m.create_conn))
            .ok_or(ServerError::NoRouteFound)
    }
}

pub struct HttpGroupCtl {
    groups: Mutex<HashMap<String, Arc<HttpGroup>>>,
    routers: Arc<ConfigRouters>,
}

impl HttpGroupCtl {
    pub fn new(routers: Arc<ConfigRouters>) -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            routers,
        }
    }

    /// Join a member carrying its per-proxy route config.  The first member
    /// registers the shared group route.  Rotations are scoped per route, so
    /// one group name can span several domains.  Returns the rotation key
    /// the proxy must use to leave again.
    pub fn register(
        &self,
        proxy_name: &str,
        group: &str,
        group_key: &str,
        route: RouteConfig,
    ) -> Result<String> {
        let create_conn = route
            .create_conn
            .clone()
            .ok_or(ServerError::NoRouteFound)?;

        let rotation = format!(
            "{group}@{}@{}@{}",
            route.domain, route.location, route.route_by_http_user
        );
        let mut groups = self.groups.lock().unwrap();
        if let Some(existing) = groups.get(&rotation) {
            if existing.group_key != group_key {
                return Err(ServerError::AuthFailed("group key does not match".to_string()));
            }
            existing.members.lock().unwrap().push(GroupMember {
                member: Member::new(proxy_name),
                create_conn,
            });
            return Ok(rotation);
        }

        let http_group = Arc::new(HttpGroup {
            group_key: group_key.to_string(),
            domain: route.domain.clone(),
            location: route.location.clone(),
            route_by_http_user: route.route_by_http_user.clone(),
            members: Mutex::new(vec![GroupMember {
                member: Member::new(proxy_name),
                create_conn,
            }]),
            cursor: AtomicUsize::new(0),
        });

        let chooser = Arc::clone(&http_group);
        let by_endpoint = Arc::clone(&http_group);
        let group_route = RouteConfig {
            create_conn: None,
            choose_endpoint: Some(Arc::new(move || chooser.choose())),
            create_conn_by_endpoint: Some(Arc::new(
                move |endpoint, addr| -> crate::vhost::ConnFuture {
                    let group = Arc::clone(&by_endpoint);
                    Box::pin(async move {
                        let dial = group.dialer(&endpoint)?;
                        dial(addr).await
                    })
                },
            )),
            ..route
        };
        let (domain, location, http_user) = (
            group_route.domain.clone(),
            group_route.location.clone(),
            group_route.route_by_http_user.clone(),
        );
        self.routers
            .add(&domain, &location, &http_user, Arc::new(group_route))?;
        groups.insert(rotation.clone(), http_group);
        info!("http group [{group}] created for {domain}{location}");
        Ok(rotation)
    }

    pub fn unregister(&self, rotation: &str, proxy_name: &str) {
        let mut groups = self.groups.lock().unwrap();
        let Some(http_group) = groups.get(rotation) else {
            return;
        };
        let empty = {
            let mut members = http_group.members.lock().unwrap();
            members.retain(|m| m.member.name != proxy_name);
            members.is_empty()
        };
        if empty {
            self.routers.remove(
                &http_group.domain,
                &http_group.location,
                &http_group.route_by_http_user,
            );
            groups.remove(rotation);
            info!("http group rotation [{rotation}] torn down");
        }
    }

    pub fn member_health_flag(
        &self,
        rotation: &str,
        proxy_name: &str,
    ) -> Option<Arc<std::sync::atomic::AtomicBool>> {
        let groups = self.groups.lock().unwrap();
        let http_group = groups.get(rotation)?;
        let members = http_group.members.lock().unwrap();
        members
            .iter()
            .find(|m| m.member.name == proxy_name)
            .map(|m| Arc::clone(&m.member.healthy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_dialer() -> CreateConnFn {
        Arc::new(|_addr| -> crate::vhost::ConnFuture {
            Box::pin(async {
                let (a, _b) = tokio::io::duplex(8);
                Ok(Box::new(a) as crate::net::AnyStream)
            })
        })
    }

    fn route(domain: &str) -> RouteConfig {
        RouteConfig {
            domain: domain.to_string(),
            location: "/".to_string(),
            create_conn: Some(dummy_dialer()),
            ..RouteConfig::default()
        }
    }

    #[test]
    fn test_group_round_robin_endpoints() {
        let routers = Arc::new(ConfigRouters::new());
        let ctl = HttpGroupCtl::new(Arc::clone(&routers));
        ctl.register("p1", "g", "k", route("a.example.com")).unwrap();
        ctl.register("p2", "g", "k", route("a.example.com")).unwrap();

        let shared = routers.route("a.example.com", "/", "").unwrap();
        let choose = shared.choose_endpoint.as_ref().unwrap();
        let picks: Vec<String> = (0..4).map(|_| choose().unwrap()).collect();
        assert_eq!(picks, vec!["p1", "p2", "p1", "p2"]);
    }

    #[test]
    fn test_group_key_mismatch_refused() {
        let routers = Arc::new(ConfigRouters::new());
        let ctl = HttpGroupCtl::new(Arc::clone(&routers));
        ctl.register("p1", "g", "k", route("a.example.com")).unwrap();
        match ctl.register("p2", "g", "wrong", route("a.example.com")) {
            Err(ServerError::AuthFailed(_)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_unhealthy_member_skipped() {
        let routers = Arc::new(ConfigRouters::new());
        let ctl = HttpGroupCtl::new(Arc::clone(&routers));
        let rotation = ctl.register("p1", "g", "k", route("a.example.com")).unwrap();
        ctl.register("p2", "g", "k", route("a.example.com")).unwrap();

        let flag = ctl.member_health_flag(&rotation, "p1").unwrap();
        flag.store(false, std::sync::atomic::Ordering::Relaxed);

        let shared = routers.route("a.example.com", "/", "").unwrap();
        let choose = shared.choose_endpoint.as_ref().unwrap();
        for _ in 0..4 {
            assert_eq!(choose().unwrap(), "p2");
        }
    }

    #[test]
    fn test_last_member_removes_route() {
        let routers = Arc::new(ConfigRouters::new());
        let ctl = HttpGroupCtl::new(Arc::clone(&routers));
        let rotation = ctl.register("p1", "g", "k", route("a.example.com")).unwrap();
        ctl.unregister(&rotation, "p1");
        assert!(routers.route("a.example.com", "/", "").is_none());
        // Group name and route are reusable.
        ctl.register("p9", "g", "k2", route("a.example.com")).unwrap();
    }

    #[test]
    fn test_one_group_name_spans_domains() {
        let routers = Arc::new(ConfigRouters::new());
        let ctl = HttpGroupCtl::new(Arc::clone(&routers));
        let r1 = ctl.register("p1", "g", "k", route("a.example.com")).unwrap();
        let r2 = ctl.register("p1", "g", "k", route("b.example.com")).unwrap();
        assert_ne!(r1, r2);
        assert!(routers.route("a.example.com", "/", "").is_some());
        assert!(routers.route("b.example.com", "/", "").is_some());
    }
}
