//! SSH tunnel gateway.
//!
//! `ssh -R` users get tunnels without a tunnel client: the exec payload
//! carries the proxy flags, and a small in-process "virtual client" speaks
//! the normal control protocol over in-memory pipes.  User traffic is
//! spliced into `forwarded-tcpip` channels back to the ssh client.

use crate::config::ServerConfig;
use crate::net::{join_streams, AnyStream, InternalListener};
use crate::util::rand_id;
use async_trait::async_trait;
use burrow_proto::msg::{
    self, ClientSpec, Login, Message, NewProxy, NewWorkConn, Ping,
};
use russh::server::{Auth, Handle, Msg, Server, Session};
use russh::{Channel, ChannelId};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const VIRTUAL_PING_INTERVAL: Duration = Duration::from_secs(30);

pub async fn spawn_gateway(
    cfg: Arc<ServerConfig>,
    sink: Arc<InternalListener>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let key = load_or_generate_host_key(&cfg.ssh_tunnel_gateway.auto_gen_private_key_path)?;
    let russh_config = Arc::new(russh::server::Config {
        keys: vec![key],
        ..Default::default()
    });

    let bind_addr = cfg.bind_addr.clone();
    let port = cfg.ssh_tunnel_gateway.bind_port;
    info!("ssh tunnel gateway on {bind_addr}:{port}");

    let mut gateway = Gateway { sink };
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            result = gateway.run_on_address(russh_config, (bind_addr.as_str(), port)) => {
                if let Err(e) = result {
                    warn!("ssh tunnel gateway stopped: {e}");
                }
            }
        }
    });
    Ok(())
}

fn load_or_generate_host_key(path: &Path) -> anyhow::Result<russh_keys::key::KeyPair> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        return russh_keys::decode_secret_key(&content, None)
            .map_err(|e| anyhow::anyhow!("bad ssh host key at {}: {e}", path.display()));
    }
    let key = russh_keys::key::KeyPair::generate_ed25519()
        .ok_or_else(|| anyhow::anyhow!("ed25519 key generation failed"))?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut buf = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut buf)?;
    std::fs::write(path, &buf)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    info!("generated ssh host key at {}", path.display());
    Ok(key)
}

struct Gateway {
    sink: Arc<InternalListener>,
}

impl Server for Gateway {
    type Handler = GatewayHandler;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> GatewayHandler {
        GatewayHandler {
            sink: Arc::clone(&self.sink),
            peer,
            session_channel: None,
            forward: None,
            exec: None,
            started: false,
        }
    }
}

pub struct GatewayHandler {
    sink: Arc<InternalListener>,
    peer: Option<SocketAddr>,
    session_channel: Option<ChannelId>,
    forward: Option<(String, u32)>,
    exec: Option<String>,
    started: bool,
}

impl GatewayHandler {
    /// Once both the forward request and the exec payload are in, start
    /// the virtual client.
    fn maybe_start(&mut self, handle: Handle) {
        if self.started {
            return;
        }
        let (Some((forward_addr, forward_port)), Some(command)) = (&self.forward, &self.exec)
        else {
            return;
        };
        let new_proxy = match parse_proxy_command(command, *forward_port as u16) {
            Ok(p) => p,
            Err(e) => {
                warn!("ssh gateway: bad proxy command [{command}]: {e}");
                return;
            }
        };
        self.started = true;
        info!(
            "ssh gateway: starting virtual client for proxy [{}] ({})",
            new_proxy.proxy_name, new_proxy.proxy_type
        );
        tokio::spawn(run_virtual_client(VirtualClient {
            sink: Arc::clone(&self.sink),
            handle,
            session_channel: self.session_channel,
            forward: (forward_addr.clone(), *forward_port),
            peer: self.peer,
            new_proxy,
        }));
    }
}

#[async_trait]
impl russh::server::Handler for GatewayHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn auth_password(&mut self, _user: &str, _password: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _public_key: &russh_keys::key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.session_channel = Some(channel.id());
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.exec = Some(String::from_utf8_lossy(data).trim().to_string());
        session.channel_success(channel);
        self.maybe_start(session.handle());
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.forward = Some((address.to_string(), *port));
        self.maybe_start(session.handle());
        Ok(true)
    }
}

/// Translate "tcp --remote_port 9090" style payloads into a NewProxy.
fn parse_proxy_command(command: &str, forward_port: u16) -> anyhow::Result<NewProxy> {
    let mut tokens = command.split_whitespace();
    let proxy_type = tokens.next().unwrap_or_default().to_string();
    match proxy_type.as_str() {
        "tcp" | "http" | "https" | "tcpmux" | "stcp" => {}
        other => anyhow::bail!("unsupported proxy type [{other}]"),
    }

    let mut new_proxy = NewProxy {
        proxy_type,
        remote_port: forward_port,
        ..NewProxy::default()
    };
    while let Some(flag) = tokens.next() {
        let mut value = || {
            tokens
                .next()
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("flag {flag} needs a value"))
        };
        match flag {
            "--proxy_name" | "-n" => new_proxy.proxy_name = value()?,
            "--remote_port" => new_proxy.remote_port = value()?.parse()?,
            "--custom_domain" => new_proxy.custom_domains = vec![value()?],
            "--sub_domain" | "--sd" => new_proxy.subdomain = value()?,
            "--locations" => {
                new_proxy.locations = value()?.split(',').map(str::to_string).collect()
            }
            "--group" => new_proxy.group = value()?,
            "--group_key" => new_proxy.group_key = value()?,
            "--multiplexer" => new_proxy.multiplexer = value()?,
            "--sk" => new_proxy.sk = value()?,
            "--allow_users" => {
                new_proxy.allow_users = value()?.split(',').map(str::to_string).collect()
            }
            other => anyhow::bail!("unknown flag [{other}]"),
        }
    }
    if new_proxy.proxy_name.is_empty() {
        new_proxy.proxy_name = format!("ssh-{}", &rand_id()[..8]);
    }
    if new_proxy.proxy_type == "tcpmux" && new_proxy.multiplexer.is_empty() {
        new_proxy.multiplexer = "httpconnect".to_string();
    }
    Ok(new_proxy)
}

struct VirtualClient {
    sink: Arc<InternalListener>,
    handle: Handle,
    session_channel: Option<ChannelId>,
    forward: (String, u32),
    peer: Option<SocketAddr>,
    new_proxy: NewProxy,
}

impl VirtualClient {
    async fn notify(&self, text: String) {
        if let Some(channel) = self.session_channel {
            let _ = self
                .handle
                .data(channel, russh::CryptoVec::from(text.into_bytes()))
                .await;
        }
    }
}

/// The in-process client: Login, NewProxy, then answer ReqWorkConn by
/// bridging work connections into forwarded-tcpip channels.
async fn run_virtual_client(client: VirtualClient) {
    let (control, server_side) = tokio::io::duplex(16 * 1024);
    if client.sink.put(Box::new(server_side)).is_err() {
        warn!("ssh gateway: service is not accepting virtual connections");
        return;
    }
    let (mut reader, mut writer) = tokio::io::split(control);

    let login = Message::Login(Login {
        version: msg::PROTOCOL_VERSION.to_string(),
        user: String::new(),
        run_id: String::new(),
        pool_count: 0,
        client_spec: ClientSpec {
            kind: "ssh-tunnel".to_string(),
            always_auth_pass: true,
        },
        ..Login::default()
    });
    if msg::write_message(&mut writer, &login).await.is_err() {
        return;
    }
    let run_id = match msg::read_message(&mut reader).await {
        Ok(Message::LoginResp(resp)) if resp.error.is_empty() => resp.run_id,
        Ok(Message::LoginResp(resp)) => {
            client.notify(format!("login failed: {}\n", resp.error)).await;
            return;
        }
        _ => return,
    };

    let new_proxy_msg = Message::NewProxy(client.new_proxy.clone());
    if msg::write_message(&mut writer, &new_proxy_msg).await.is_err() {
        return;
    }

    let client = Arc::new(client);
    let mut ping = tokio::time::interval(VIRTUAL_PING_INTERVAL);
    loop {
        tokio::select! {
            _ = ping.tick() => {
                if msg::write_message(&mut writer, &Message::Ping(Ping::default())).await.is_err() {
                    return;
                }
            }
            message = msg::read_message(&mut reader) => match message {
                Ok(Message::ReqWorkConn(_)) => {
                    let client = Arc::clone(&client);
                    let run_id = run_id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = supply_work_conn(&client, &run_id).await {
                            debug!("ssh gateway: work conn bridge failed: {e}");
                        }
                    });
                }
                Ok(Message::NewProxyResp(resp)) => {
                    if resp.error.is_empty() {
                        client.notify(format!(
                            "proxy [{}] is ready at [{}]\n",
                            resp.proxy_name, resp.remote_addr
                        )).await;
                    } else {
                        client.notify(format!(
                            "proxy [{}] failed: {}\n",
                            resp.proxy_name, resp.error
                        )).await;
                        return;
                    }
                }
                Ok(Message::Pong(_)) => {}
                Ok(_) => {}
                Err(e) => {
                    debug!("ssh gateway: virtual control closed: {e}");
                    return;
                }
            }
        }
    }
}

/// One work connection: register it, wait for StartWorkConn, then splice
/// into a forwarded-tcpip channel to the ssh client.
async fn supply_work_conn(client: &Arc<VirtualClient>, run_id: &str) -> crate::error::Result<()> {
    let (mut work, server_side) = tokio::io::duplex(16 * 1024);
    client.sink.put(Box::new(server_side))?;

    let register = Message::NewWorkConn(NewWorkConn {
        run_id: run_id.to_string(),
        ..NewWorkConn::default()
    });
    msg::write_message(&mut work, &register).await?;

    // The proxy announces itself before any payload bytes.
    let start = match msg::read_message(&mut work).await? {
        Message::StartWorkConn(s) => s,
        _ => {
            return Err(crate::error::ServerError::ProtocolViolation(
                "expected StartWorkConn".to_string(),
            ))
        }
    };

    let (originator, originator_port) = client
        .peer
        .map(|p| (p.ip().to_string(), p.port() as u32))
        .unwrap_or_else(|| ("127.0.0.1".to_string(), 0));
    let channel = client
        .handle
        .channel_open_forwarded_tcpip(
            client.forward.0.clone(),
            client.forward.1,
            originator,
            originator_port,
        )
        .await
        .map_err(|e| {
            crate::error::ServerError::ResourceUnavailable(format!(
                "forwarded-tcpip channel refused: {e}"
            ))
        })?;
    debug!(
        "ssh gateway: bridging user conn for proxy [{}]",
        start.proxy_name
    );
    join_streams(work, channel.into_stream(), None).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_command() {
        let p = parse_proxy_command("tcp --proxy_name web --remote_port 9090", 80).unwrap();
        assert_eq!(p.proxy_type, "tcp");
        assert_eq!(p.proxy_name, "web");
        assert_eq!(p.remote_port, 9090);
    }

    #[test]
    fn test_parse_defaults_from_forward() {
        let p = parse_proxy_command("tcp", 8443).unwrap();
        assert_eq!(p.remote_port, 8443);
        assert!(p.proxy_name.starts_with("ssh-"));
    }

    #[test]
    fn test_parse_http_command() {
        let p = parse_proxy_command("http --sub_domain app --locations /,/api", 0).unwrap();
        assert_eq!(p.proxy_type, "http");
        assert_eq!(p.subdomain, "app");
        assert_eq!(p.locations, vec!["/", "/api"]);
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert!(parse_proxy_command("gopher", 0).is_err());
        assert!(parse_proxy_command("tcp --nope 1", 0).is_err());
        assert!(parse_proxy_command("tcp --remote_port", 0).is_err());
    }
}
