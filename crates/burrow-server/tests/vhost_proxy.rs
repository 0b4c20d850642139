//! The vhost HTTP reverse proxy and HTTPS SNI muxer, driven over
//! in-memory pipes with a hand-rolled backend.

use burrow_server::net::AnyStream;
use burrow_server::vhost::http::HttpReverseProxy;
use burrow_server::vhost::https::{extract_sni, HttpsMuxer};
use burrow_server::vhost::{register_listener_route, ConnFuture, RouteConfig};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn peer() -> SocketAddr {
    "192.0.2.7:4242".parse().unwrap()
}

/// Backend that answers every HTTP request with a fixed body and echoes
/// the Host header back in "x-seen-host".
fn fixed_backend() -> burrow_server::vhost::CreateConnFn {
    Arc::new(|_remote_addr| -> ConnFuture {
        Box::pin(async {
            let (ours, theirs) = tokio::io::duplex(16 * 1024);
            tokio::spawn(async move {
                let mut conn = theirs;
                let mut buf = vec![0u8; 4096];
                let mut read = 0;
                loop {
                    let n = match conn.read(&mut buf[read..]).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    read += n;
                    if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let text = String::from_utf8_lossy(&buf[..read]).to_string();
                let host = text
                    .lines()
                    .find_map(|l| l.strip_prefix("host: ").or_else(|| l.strip_prefix("Host: ")))
                    .unwrap_or("")
                    .to_string();
                let body = "backend says hi";
                let resp = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nx-seen-host: {host}\r\n\r\n{body}",
                    body.len()
                );
                let _ = conn.write_all(resp.as_bytes()).await;
                let _ = conn.flush().await;
            });
            Ok(Box::new(ours) as AnyStream)
        })
    })
}

fn proxy_with_route(domain: &str, rewrite_host: &str) -> Arc<HttpReverseProxy> {
    let proxy = Arc::new(HttpReverseProxy::new(
        Duration::from_secs(5),
        Path::new("/nonexistent-404-page"),
    ));
    let route = RouteConfig {
        domain: domain.to_string(),
        location: "/".to_string(),
        rewrite_host: rewrite_host.to_string(),
        create_conn: Some(fixed_backend()),
        ..RouteConfig::default()
    };
    proxy
        .routers
        .add(domain, "/", "", Arc::new(route))
        .unwrap();
    proxy
}

async fn roundtrip(proxy: Arc<HttpReverseProxy>, request: &str) -> String {
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        proxy.serve_stream(Box::new(server), peer()).await;
    });
    client.write_all(request.as_bytes()).await.unwrap();
    client.flush().await.unwrap();
    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();
    String::from_utf8_lossy(&out).to_string()
}

#[tokio::test]
async fn test_reverse_proxy_routes_by_host() {
    let proxy = proxy_with_route("a.example.com", "");
    let resp = roundtrip(
        proxy,
        "GET /index.html HTTP/1.1\r\nHost: a.example.com\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(resp.starts_with("HTTP/1.1 200"), "got: {resp}");
    assert!(resp.contains("backend says hi"));
    assert!(resp.contains("x-seen-host: a.example.com"));
}

#[tokio::test]
async fn test_reverse_proxy_rewrites_host() {
    let proxy = proxy_with_route("a.example.com", "internal.service");
    let resp = roundtrip(
        proxy,
        "GET / HTTP/1.1\r\nHost: a.example.com\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(resp.contains("x-seen-host: internal.service"), "got: {resp}");
}

#[tokio::test]
async fn test_reverse_proxy_404_on_unknown_host() {
    let proxy = proxy_with_route("a.example.com", "");
    let resp = roundtrip(
        proxy,
        "GET / HTTP/1.1\r\nHost: other.example.com\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(resp.starts_with("HTTP/1.1 404"), "got: {resp}");
}

#[tokio::test]
async fn test_reverse_proxy_basic_auth_gate() {
    let proxy = Arc::new(HttpReverseProxy::new(
        Duration::from_secs(5),
        Path::new("/nonexistent-404-page"),
    ));
    let route = RouteConfig {
        domain: "a.example.com".to_string(),
        location: "/".to_string(),
        username: "u".to_string(),
        password: "p".to_string(),
        create_conn: Some(fixed_backend()),
        ..RouteConfig::default()
    };
    proxy
        .routers
        .add("a.example.com", "/", "", Arc::new(route))
        .unwrap();

    let resp = roundtrip(
        Arc::clone(&proxy),
        "GET / HTTP/1.1\r\nHost: a.example.com\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(resp.starts_with("HTTP/1.1 401"), "got: {resp}");
    assert!(resp.contains("WWW-Authenticate: Basic realm=\"Restricted\"")
        || resp.contains("www-authenticate: Basic realm=\"Restricted\""));

    // dTpw is base64("u:p").
    let resp = roundtrip(
        proxy,
        "GET / HTTP/1.1\r\nHost: a.example.com\r\nAuthorization: Basic dTpw\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(resp.starts_with("HTTP/1.1 200"), "got: {resp}");
}

#[tokio::test]
async fn test_https_muxer_routes_by_sni() {
    let muxer = Arc::new(HttpsMuxer::new(Duration::from_secs(2)));
    let listener = register_listener_route(&muxer.routers, "api.example.com", "").unwrap();

    // Borrow the handshake builder from the unit tests: a hello for the
    // registered domain must land on its listener byte-for-byte.
    let hello = sample_client_hello("api.example.com");
    let (mut client, server) = tokio::io::duplex(16 * 1024);
    let muxer_clone = Arc::clone(&muxer);
    tokio::spawn(async move {
        muxer_clone.handle_conn(Box::new(server)).await;
    });
    client.write_all(&hello).await.unwrap();

    let mut routed = tokio::time::timeout(Duration::from_secs(2), listener.accept())
        .await
        .expect("routed in time")
        .expect("listener open");
    let mut got = vec![0u8; hello.len()];
    routed.read_exact(&mut got).await.unwrap();
    assert_eq!(got, hello, "tls bytes must be forwarded untouched");
}

#[tokio::test]
async fn test_https_muxer_drops_unknown_sni() {
    let muxer = Arc::new(HttpsMuxer::new(Duration::from_millis(500)));
    register_listener_route(&muxer.routers, "api.example.com", "").unwrap();

    let hello = sample_client_hello("other.example.com");
    let (mut client, server) = tokio::io::duplex(16 * 1024);
    let muxer_clone = Arc::clone(&muxer);
    let handled = tokio::spawn(async move {
        muxer_clone.handle_conn(Box::new(server)).await;
    });
    client.write_all(&hello).await.unwrap();
    handled.await.unwrap();

    // The connection was dropped: reads on the client side hit EOF.
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).await.unwrap_or(0);
    assert_eq!(n, 0);
}

/// Minimal ClientHello carrying one SNI entry.
fn sample_client_hello(sni: &str) -> Vec<u8> {
    let name = sni.as_bytes();
    let sni_ext_len = 5 + name.len();
    let ext_total = 4 + sni_ext_len;

    let mut hs = Vec::new();
    hs.extend_from_slice(&[0x03, 0x03]);
    hs.extend_from_slice(&[0u8; 32]);
    hs.push(0);
    hs.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
    hs.extend_from_slice(&[0x01, 0x00]);
    hs.extend_from_slice(&(ext_total as u16).to_be_bytes());
    hs.extend_from_slice(&0u16.to_be_bytes());
    hs.extend_from_slice(&(sni_ext_len as u16).to_be_bytes());
    hs.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    hs.push(0);
    hs.extend_from_slice(&(name.len() as u16).to_be_bytes());
    hs.extend_from_slice(name);

    let mut out = Vec::new();
    out.push(0x16);
    out.extend_from_slice(&[0x03, 0x01]);
    out.extend_from_slice(&((hs.len() + 4) as u16).to_be_bytes());
    out.push(0x01);
    out.push(0);
    out.extend_from_slice(&(hs.len() as u16).to_be_bytes());
    out.extend_from_slice(&hs);

    assert_eq!(extract_sni(&out).as_deref(), Some(sni));
    out
}
