pub mod http;
pub mod https;
pub mod router;
pub mod tcpmux;

use crate::error::Result;
use crate::net::{AnyStream, InternalListener};
use self::router::VhostRouters;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type ConnFuture = Pin<Box<dyn Future<Output = Result<AnyStream>> + Send>>;
/// Dial the backend of a route; the argument is the user's remote address.
pub type CreateConnFn = Arc<dyn Fn(String) -> ConnFuture + Send + Sync>;
/// Pick a group endpoint (a member proxy name) for the next request.
pub type ChooseEndpointFn = Arc<dyn Fn() -> Result<String> + Send + Sync>;
pub type CreateConnByEndpointFn = Arc<dyn Fn(String, String) -> ConnFuture + Send + Sync>;

/// Backend description attached to an HTTP vhost route.
#[derive(Clone, Default)]
pub struct RouteConfig {
    pub domain: String,
    pub location: String,
    pub rewrite_host: String,
    pub username: String,
    pub password: String,
    pub headers: HashMap<String, String>,
    pub response_headers: HashMap<String, String>,
    pub route_by_http_user: String,
    pub create_conn: Option<CreateConnFn>,
    pub choose_endpoint: Option<ChooseEndpointFn>,
    pub create_conn_by_endpoint: Option<CreateConnByEndpointFn>,
}

impl RouteConfig {
    /// Open a transport to the backend, honoring group endpoint selection
    /// when configured.
    pub async fn dial(&self, remote_addr: &str) -> Result<AnyStream> {
        if let (Some(choose), Some(by_endpoint)) =
            (&self.choose_endpoint, &self.create_conn_by_endpoint)
        {
            let endpoint = choose()?;
            return by_endpoint(endpoint, remote_addr.to_string()).await;
        }
        match &self.create_conn {
            Some(create) => create(remote_addr.to_string()).await,
            None => Err(crate::error::ServerError::NoRouteFound),
        }
    }
}

/// Routers whose payload is a live listener (HTTPS SNI and tcpmux routes).
pub type ListenerRouters = VhostRouters<InternalListener>;
/// Routers whose payload is a reverse-proxy backend description.
pub type ConfigRouters = VhostRouters<RouteConfig>;

/// Register a fresh internal listener under (domain, "", http_user).
pub fn register_listener_route(
    routers: &ListenerRouters,
    domain: &str,
    http_user: &str,
) -> Result<Arc<InternalListener>> {
    let listener = Arc::new(InternalListener::new());
    routers.add(domain, "", http_user, Arc::clone(&listener))?;
    Ok(listener)
}
