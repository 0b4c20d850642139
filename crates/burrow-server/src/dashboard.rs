//! Dashboard HTTP API.
//!
//! Everything except the health probe sits behind basic auth.  The JSON
//! field names are part of the public API surface; keep them stable.

use crate::control::ServiceContext;
use crate::metrics;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use base64::Engine;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone)]
struct DashboardState {
    ctx: Arc<ServiceContext>,
}

pub async fn spawn(ctx: Arc<ServiceContext>, cancel: CancellationToken) -> anyhow::Result<()> {
    let web = &ctx.cfg.web_server;
    let addr = format!("{}:{}", web.addr, web.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("dashboard api listening on http://{addr}");

    let state = DashboardState { ctx };
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/api/serverinfo", get(server_info))
        .layer(middleware::from_fn_with_state(state.clone(), basic_auth))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state);

    tokio::spawn(async move {
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await });
        if let Err(e) = serve.await {
            warn!("dashboard server error: {e}");
        }
    });
    Ok(())
}

async fn basic_auth(
    State(state): State<DashboardState>,
    req: Request,
    next: Next,
) -> Response {
    // The health probe stays open for load balancers.
    if req.uri().path() == "/healthz" {
        return next.run(req).await;
    }
    let web = &state.ctx.cfg.web_server;
    if web.user.is_empty() && web.password.is_empty() {
        return next.run(req).await;
    }

    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|v| base64::engine::general_purpose::STANDARD.decode(v.trim()).ok())
        .and_then(|v| String::from_utf8(v).ok())
        .and_then(|v| {
            v.split_once(':')
                .map(|(u, p)| u == web.user && p == web.password)
        })
        .unwrap_or(false);

    if authorized {
        next.run(req).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"Restricted\"")],
        )
            .into_response()
    }
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

#[derive(Serialize)]
struct ServerInfo {
    version: String,
    #[serde(rename = "bindPort")]
    bind_port: u16,
    #[serde(rename = "vhostHTTPPort")]
    vhost_http_port: u16,
    #[serde(rename = "vhostHTTPSPort")]
    vhost_https_port: u16,
    #[serde(rename = "tcpmuxHTTPConnectPort")]
    tcpmux_httpconnect_port: u16,
    #[serde(rename = "kcpBindPort")]
    kcp_bind_port: u16,
    #[serde(rename = "quicBindPort")]
    quic_bind_port: u16,
    #[serde(rename = "subdomainHost")]
    subdomain_host: String,
    #[serde(rename = "maxPoolCount")]
    max_pool_count: usize,
    #[serde(rename = "maxPortsPerClient")]
    max_ports_per_client: usize,
    #[serde(rename = "heartbeatTimeout")]
    heartbeat_timeout: i64,
    #[serde(rename = "allowPortsStr", skip_serializing_if = "String::is_empty")]
    allow_ports_str: String,
    #[serde(rename = "tlsForce")]
    tls_force: bool,
    #[serde(rename = "totalTrafficIn")]
    total_traffic_in: i64,
    #[serde(rename = "totalTrafficOut")]
    total_traffic_out: i64,
    #[serde(rename = "curConns")]
    cur_conns: i64,
    #[serde(rename = "clientConns")]
    client_conns: i64,
    #[serde(rename = "proxyTypeCounts")]
    proxy_type_counts: HashMap<String, i64>,
}

async fn server_info(State(state): State<DashboardState>) -> Json<ServerInfo> {
    let cfg = &state.ctx.cfg;
    let stats = metrics::collector().server_stats();
    Json(ServerInfo {
        version: burrow_proto::msg::PROTOCOL_VERSION.to_string(),
        bind_port: cfg.bind_port,
        vhost_http_port: cfg.vhost_http_port,
        vhost_https_port: cfg.vhost_https_port,
        tcpmux_httpconnect_port: cfg.tcpmux_httpconnect_port,
        kcp_bind_port: cfg.kcp_bind_port,
        quic_bind_port: cfg.quic_bind_port,
        subdomain_host: cfg.subdomain_host.clone(),
        max_pool_count: cfg.max_pool_count,
        max_ports_per_client: cfg.max_ports_per_client,
        heartbeat_timeout: cfg.effective_heartbeat_timeout(),
        allow_ports_str: cfg.allow_ports.clone(),
        tls_force: cfg.transport.tls.force,
        total_traffic_in: stats.total_traffic_in,
        total_traffic_out: stats.total_traffic_out,
        cur_conns: stats.cur_conns,
        client_conns: stats.client_counts,
        proxy_type_counts: stats.proxy_type_counts,
    })
}
