//! The vhost HTTP reverse proxy.
//!
//! One proxy instance serves every HTTP route.  Each request is resolved
//! through the config routers, then forwarded over a transport dialed from
//! the owning proxy's work-connection pool.  Responding 404 uses the
//! configured custom page when present.

use super::{ConfigRouters, RouteConfig};
use crate::net::{join_streams, AnyStream};
use base64::Engine;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, AUTHORIZATION, HOST, WWW_AUTHENTICATE};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POOL_MAX_IDLE_PER_ROUTE: usize = 5;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

type ProxyBody = BoxBody<Bytes, hyper::Error>;
type Sender = hyper::client::conn::http1::SendRequest<Incoming>;

pub struct HttpReverseProxy {
    pub routers: Arc<ConfigRouters>,
    response_header_timeout: Duration,
    not_found_body: String,
    pool: Mutex<HashMap<String, Vec<(Sender, Instant)>>>,
}

impl HttpReverseProxy {
    pub fn new(response_header_timeout: Duration, custom_404_page: &Path) -> Self {
        let not_found_body = std::fs::read_to_string(custom_404_page)
            .unwrap_or_else(|_| DEFAULT_NOT_FOUND.to_string());
        Self {
            routers: Arc::new(ConfigRouters::new()),
            response_header_timeout,
            not_found_body,
            pool: Mutex::new(HashMap::new()),
        }
    }

    /// Serve one accepted downstream connection.
    pub async fn serve_stream(self: Arc<Self>, stream: AnyStream, peer: SocketAddr) {
        let io = TokioIo::new(stream);
        let proxy = Arc::clone(&self);
        let service = service_fn(move |req| {
            let proxy = Arc::clone(&proxy);
            async move { Ok::<_, std::convert::Infallible>(proxy.handle(req, peer).await) }
        });
        if let Err(e) = hyper::server::conn::http1::Builder::new()
            .serve_connection(io, service)
            .with_upgrades()
            .await
        {
            debug!("vhost http connection from {peer} ended: {e}");
        }
    }

    async fn handle(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        let host = match request_host(&req) {
            Some(h) => h,
            None => return self.not_found(),
        };
        let path = req.uri().path().to_string();
        let http_user = basic_credentials(&req)
            .map(|(user, _)| user)
            .unwrap_or_default();

        let Some(route) = self.routers.route(&host, &path, &http_user) else {
            debug!("vhost http: no route for {host}{path}");
            return self.not_found();
        };

        if !route.username.is_empty() {
            let ok = basic_credentials(&req)
                .map(|(u, p)| u == route.username && p == route.password)
                .unwrap_or(false);
            if !ok {
                return unauthorized();
            }
        }

        if req.method() == Method::CONNECT {
            return self.handle_connect(req, route, peer).await;
        }
        self.forward(req, route, &host, peer).await
    }

    async fn forward(
        &self,
        mut req: Request<Incoming>,
        route: Arc<RouteConfig>,
        original_host: &str,
        peer: SocketAddr,
    ) -> Response<ProxyBody> {
        // Origin-form URI towards the backend.
        if let Ok(uri) = origin_form(req.uri()) {
            *req.uri_mut() = uri;
        }

        let host = if route.rewrite_host.is_empty() {
            original_host.to_string()
        } else {
            route.rewrite_host.clone()
        };
        if let Ok(value) = HeaderValue::from_str(&host) {
            req.headers_mut().insert(HOST, value);
        }
        for (name, value) in &route.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<HeaderName>(),
                HeaderValue::from_str(value),
            ) {
                req.headers_mut().insert(name, value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(&peer.ip().to_string()) {
            req.headers_mut()
                .insert(HeaderName::from_static("x-forwarded-for"), value);
        }

        let mut sender = match self.checkout(&route, peer).await {
            Ok(s) => s,
            Err(e) => {
                warn!("vhost http: dial backend for {} failed: {e}", route.domain);
                return self.not_found();
            }
        };

        let resp = match tokio::time::timeout(self.response_header_timeout, sender.send_request(req))
            .await
        {
            Err(_) => {
                return text_response(StatusCode::GATEWAY_TIMEOUT, "gateway timeout");
            }
            Ok(Err(e)) => {
                debug!("vhost http: upstream error: {e}");
                return self.not_found();
            }
            Ok(Ok(resp)) => resp,
        };

        self.checkin(&route, sender);

        let mut resp = resp.map(|b| b.boxed());
        for (name, value) in &route.response_headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<HeaderName>(),
                HeaderValue::from_str(value),
            ) {
                resp.headers_mut().insert(name, value);
            }
        }
        resp
    }

    async fn handle_connect(
        &self,
        req: Request<Incoming>,
        route: Arc<RouteConfig>,
        peer: SocketAddr,
    ) -> Response<ProxyBody> {
        let backend = match route.dial(&peer.to_string()).await {
            Ok(c) => c,
            Err(e) => {
                warn!("vhost http: CONNECT dial failed: {e}");
                return self.not_found();
            }
        };
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let client = TokioIo::new(upgraded);
                    let _ = join_streams(client, backend, None).await;
                }
                Err(e) => debug!("vhost http: CONNECT upgrade failed: {e}"),
            }
        });
        Response::new(empty_body())
    }

    /// Reuse an idle upstream sender for this route, or dial a fresh one.
    async fn checkout(
        &self,
        route: &Arc<RouteConfig>,
        peer: SocketAddr,
    ) -> crate::error::Result<Sender> {
        let key = route_key(route);
        {
            let mut pool = self.pool.lock().unwrap();
            if let Some(entries) = pool.get_mut(&key) {
                entries.retain(|(sender, idle_since)| {
                    !sender.is_closed() && idle_since.elapsed() < POOL_IDLE_TIMEOUT
                });
                while let Some((sender, _)) = entries.pop() {
                    if sender.is_ready() {
                        return Ok(sender);
                    }
                }
            }
        }

        let stream = route.dial(&peer.to_string()).await?;
        let io = TokioIo::new(stream);
        let (sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| {
                crate::error::ServerError::ResourceUnavailable(format!(
                    "upstream handshake failed: {e}"
                ))
            })?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("vhost http upstream connection ended: {e}");
            }
        });
        Ok(sender)
    }

    fn checkin(&self, route: &Arc<RouteConfig>, sender: Sender) {
        if sender.is_closed() {
            return;
        }
        let mut pool = self.pool.lock().unwrap();
        let entries = pool.entry(route_key(route)).or_default();
        if entries.len() < POOL_MAX_IDLE_PER_ROUTE {
            entries.push((sender, Instant::now()));
        }
    }

    fn not_found(&self) -> Response<ProxyBody> {
        let mut resp = Response::new(
            Full::new(Bytes::from(self.not_found_body.clone()))
                .map_err(|never| match never {})
                .boxed(),
        );
        *resp.status_mut() = StatusCode::NOT_FOUND;
        resp.headers_mut().insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/html"),
        );
        resp
    }
}

const DEFAULT_NOT_FOUND: &str = "<!DOCTYPE html><html><body><h1>404</h1>\
<p>The page you visit not found.</p></body></html>\n";

fn route_key(route: &RouteConfig) -> String {
    format!(
        "{}|{}|{}",
        route.domain, route.location, route.route_by_http_user
    )
}

fn empty_body() -> ProxyBody {
    Full::new(Bytes::new()).map_err(|never| match never {}).boxed()
}

fn text_response(status: StatusCode, text: &str) -> Response<ProxyBody> {
    let mut resp = Response::new(
        Full::new(Bytes::from(text.to_string()))
            .map_err(|never| match never {})
            .boxed(),
    );
    *resp.status_mut() = status;
    resp
}

fn unauthorized() -> Response<ProxyBody> {
    let mut resp = text_response(StatusCode::UNAUTHORIZED, "unauthorized");
    resp.headers_mut().insert(
        WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"Restricted\""),
    );
    resp
}

/// Host a request is addressed to, lowercased and without the port.
fn request_host(req: &Request<Incoming>) -> Option<String> {
    let raw = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().host().map(str::to_string))?;
    Some(crate::util::host_from_addr(&raw).to_lowercase())
}

fn basic_credentials(req: &Request<Incoming>) -> Option<(String, String)> {
    let value = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

fn origin_form(uri: &Uri) -> Result<Uri, http::Error> {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Uri::try_from(path_and_query).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_form() {
        let uri: Uri = "http://a.example.com/api/v1?x=1".parse().unwrap();
        assert_eq!(origin_form(&uri).unwrap().to_string(), "/api/v1?x=1");
        let uri: Uri = "/bare".parse().unwrap();
        assert_eq!(origin_form(&uri).unwrap().to_string(), "/bare");
    }

    #[test]
    fn test_route_key_distinguishes_users() {
        let mut a = RouteConfig {
            domain: "d".into(),
            location: "/".into(),
            ..RouteConfig::default()
        };
        let key_anon = route_key(&a);
        a.route_by_http_user = "alice".into();
        assert_ne!(key_anon, route_key(&a));
    }
}
