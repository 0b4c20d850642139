//! End-to-end control-session scenarios over in-memory pipes and ephemeral
//! TCP ports: login, proxy registration, work-connection pairing, run-id
//! replacement, and work-conn starvation.

use burrow_proto::msg::{self, ClientSpec, Login, Message, NewProxy, NewWorkConn};
use burrow_server::config::ServerConfig;
use burrow_server::service::Service;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.allow_ports = "21000-22000".to_string();
    config.transport.tcp_mux = false;
    config.user_conn_timeout = 1;
    config.complete();
    config.validate().unwrap();
    config
}

fn peer() -> SocketAddr {
    "127.0.0.1:54321".parse().unwrap()
}

/// Open a logical connection into the service, as the SSH bridge does:
/// plaintext messages, auth exempt.
fn connect(service: &Arc<Service>) -> DuplexStream {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let service = Arc::clone(service);
    tokio::spawn(async move {
        service
            .handle_initial_message(Box::new(server), peer(), true)
            .await;
    });
    client
}

fn internal_login(pool_count: usize, run_id: &str) -> Message {
    Message::Login(Login {
        version: msg::PROTOCOL_VERSION.to_string(),
        user: "tester".to_string(),
        run_id: run_id.to_string(),
        pool_count,
        client_spec: ClientSpec {
            kind: "ssh-tunnel".to_string(),
            always_auth_pass: true,
        },
        ..Login::default()
    })
}

/// Read messages until one that is not ReqWorkConn shows up.
async fn read_skipping_req<R: tokio::io::AsyncRead + Unpin>(r: &mut R) -> Message {
    loop {
        match msg::read_message(r).await.expect("control read") {
            Message::ReqWorkConn(_) => continue,
            other => return other,
        }
    }
}

async fn login(service: &Arc<Service>, pool_count: usize, run_id: &str) -> (DuplexStream, String) {
    let mut conn = connect(service);
    msg::write_message(&mut conn, &internal_login(pool_count, run_id))
        .await
        .unwrap();
    match msg::read_message(&mut conn).await.unwrap() {
        Message::LoginResp(resp) => {
            assert!(resp.error.is_empty(), "login refused: {}", resp.error);
            assert!(!resp.run_id.is_empty());
            (conn, resp.run_id)
        }
        other => panic!("expected LoginResp, got 0x{:02x}", other.type_byte()),
    }
}

async fn register_tcp_proxy(conn: &mut DuplexStream, name: &str, remote_port: u16) -> u16 {
    let new_proxy = Message::NewProxy(NewProxy {
        proxy_name: name.to_string(),
        proxy_type: "tcp".to_string(),
        remote_port,
        ..NewProxy::default()
    });
    msg::write_message(conn, &new_proxy).await.unwrap();
    match read_skipping_req(conn).await {
        Message::NewProxyResp(resp) => {
            assert!(resp.error.is_empty(), "proxy refused: {}", resp.error);
            assert_eq!(resp.proxy_name, name);
            let port: u16 = resp.remote_addr.trim_start_matches(':').parse().unwrap();
            port
        }
        other => panic!("expected NewProxyResp, got 0x{:02x}", other.type_byte()),
    }
}

/// Answer one ReqWorkConn by registering a fresh work connection.
async fn supply_work_conn(service: &Arc<Service>, run_id: &str) -> DuplexStream {
    let mut work = connect(service);
    let register = Message::NewWorkConn(NewWorkConn {
        run_id: run_id.to_string(),
        ..NewWorkConn::default()
    });
    msg::write_message(&mut work, &register).await.unwrap();
    // Give the service a beat to route it into the pool.
    tokio::time::sleep(Duration::from_millis(50)).await;
    work
}

#[tokio::test]
async fn test_simple_tcp_proxy_end_to_end() {
    let service = Service::new(test_config()).unwrap();

    let (mut control, run_id) = login(&service, 1, "").await;
    // Pool prefill: exactly one ReqWorkConn for pool_count 1.
    match msg::read_message(&mut control).await.unwrap() {
        Message::ReqWorkConn(_) => {}
        other => panic!("expected ReqWorkConn, got 0x{:02x}", other.type_byte()),
    }
    let mut work = supply_work_conn(&service, &run_id).await;

    let port = register_tcp_proxy(&mut control, "t", 0).await;
    assert!((21000..=22000).contains(&port));

    // An external user dials the published port.
    let mut user = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();

    // The work connection starts with a complete StartWorkConn frame,
    // before any user payload.
    match msg::read_message(&mut work).await.unwrap() {
        Message::StartWorkConn(start) => {
            assert_eq!(start.proxy_name, "t");
            assert_eq!(start.dst_port, port);
        }
        other => panic!("expected StartWorkConn, got 0x{:02x}", other.type_byte()),
    }

    user.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    work.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    work.write_all(b"world").await.unwrap();
    user.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"world");

    // Dropping the control connection releases the public port.
    drop(control);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(tokio::net::TcpListener::bind(("127.0.0.1", port)).await.is_ok());
}

#[tokio::test]
async fn test_duplicate_run_id_replacement() {
    let service = Service::new(test_config()).unwrap();

    let (mut c1, run_id) = login(&service, 0, "fixed-run-id").await;
    let port = register_tcp_proxy(&mut c1, "old-proxy", 0).await;

    let (mut c2, run_id2) = login(&service, 0, "fixed-run-id").await;
    assert_eq!(run_id, run_id2);

    // The old control is closed and its proxies torn down exactly once.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut buf = [0u8; 16];
    let n = c1.read(&mut buf).await.unwrap_or(0);
    assert_eq!(n, 0, "old control should be closed");

    let ctx = service.context();
    assert!(ctx.proxy_manager.get("old-proxy").is_none());
    assert_eq!(ctx.ctl_manager.client_count(), 1);

    // The replacement control is fully usable; the old port is free again.
    let new_port = register_tcp_proxy(&mut c2, "new-proxy", port).await;
    assert_eq!(new_port, port);
}

#[tokio::test]
async fn test_work_conn_timeout_closes_user_conn() {
    let service = Service::new(test_config()).unwrap();

    let (mut control, _run_id) = login(&service, 0, "").await;
    let port = register_tcp_proxy(&mut control, "timeouts", 0).await;

    let mut user = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();

    // user_conn_timeout is 1 s; the user connection dies shortly after.
    let mut buf = [0u8; 8];
    let read = tokio::time::timeout(Duration::from_secs(3), user.read(&mut buf)).await;
    match read {
        Ok(Ok(0)) => {}
        Ok(Ok(n)) => panic!("unexpected {n} bytes"),
        Ok(Err(_)) => {}
        Err(_) => panic!("user conn not closed after work-conn timeout"),
    }
}

#[tokio::test]
async fn test_duplicate_proxy_name_rejected() {
    let service = Service::new(test_config()).unwrap();

    let (mut c1, _r1) = login(&service, 0, "").await;
    let (mut c2, _r2) = login(&service, 0, "").await;
    register_tcp_proxy(&mut c1, "shared-name", 0).await;

    let new_proxy = Message::NewProxy(NewProxy {
        proxy_name: "shared-name".to_string(),
        proxy_type: "tcp".to_string(),
        remote_port: 0,
        ..NewProxy::default()
    });
    msg::write_message(&mut c2, &new_proxy).await.unwrap();
    match read_skipping_req(&mut c2).await {
        Message::NewProxyResp(resp) => {
            assert!(!resp.error.is_empty(), "duplicate name must be refused");
        }
        other => panic!("expected NewProxyResp, got 0x{:02x}", other.type_byte()),
    }
}

#[tokio::test]
async fn test_unknown_proxy_type_rejected() {
    let service = Service::new(test_config()).unwrap();
    let (mut control, _run_id) = login(&service, 0, "").await;

    let new_proxy = Message::NewProxy(NewProxy {
        proxy_name: "weird".to_string(),
        proxy_type: "gopher".to_string(),
        ..NewProxy::default()
    });
    msg::write_message(&mut control, &new_proxy).await.unwrap();
    match read_skipping_req(&mut control).await {
        Message::NewProxyResp(resp) => assert!(!resp.error.is_empty()),
        other => panic!("expected NewProxyResp, got 0x{:02x}", other.type_byte()),
    }
}

#[tokio::test]
async fn test_port_quota_enforced() {
    let mut config = test_config();
    config.max_ports_per_client = 1;
    let service = Service::new(config).unwrap();

    let (mut control, _run_id) = login(&service, 0, "").await;
    register_tcp_proxy(&mut control, "first", 0).await;

    let new_proxy = Message::NewProxy(NewProxy {
        proxy_name: "second".to_string(),
        proxy_type: "tcp".to_string(),
        ..NewProxy::default()
    });
    msg::write_message(&mut control, &new_proxy).await.unwrap();
    match read_skipping_req(&mut control).await {
        Message::NewProxyResp(resp) => {
            assert!(resp.error.contains("quota"), "got: {}", resp.error);
        }
        other => panic!("expected NewProxyResp, got 0x{:02x}", other.type_byte()),
    }
}

#[tokio::test]
async fn test_close_proxy_frees_the_name_and_port() {
    let service = Service::new(test_config()).unwrap();
    let (mut control, _run_id) = login(&service, 0, "").await;
    let port = register_tcp_proxy(&mut control, "recycled", 0).await;

    let close = Message::CloseProxy(burrow_proto::msg::CloseProxy {
        proxy_name: "recycled".to_string(),
    });
    msg::write_message(&mut control, &close).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(service.context().proxy_manager.get("recycled").is_none());
    // Same name, same explicit port: the system is back to its
    // pre-registration state.
    let again = register_tcp_proxy(&mut control, "recycled", port).await;
    assert_eq!(again, port);
}
