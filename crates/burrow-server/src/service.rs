//! Process-level orchestration.
//!
//! The service owns every listener, classifies inbound connections by
//! their first bytes, reads exactly one initial message per logical
//! connection, and routes it: logins become controls, work connections go
//! to their control's pool, visitor connections go to the visitor manager.

use crate::config::ServerConfig;
use crate::control::{Control, ControlManager, ServiceContext};
use crate::dashboard;
use crate::error::{Result, ServerError};
use crate::metrics;
use crate::nathole::NatHoleController;
use crate::net::mux::{classify, PeekedStream, Sniffed};
use crate::net::{self, AnyStream, InternalListener};
use crate::plugin::{Op, PluginManager};
use crate::ports::{NetType, PortManager};
use crate::proxy::{ProxyContext, ProxyManager};
use crate::ssh;
use crate::util::{rand_id, unix_timestamp};
use crate::vhost::http::HttpReverseProxy;
use crate::vhost::https::HttpsMuxer;
use crate::vhost::tcpmux::TcpConnectMuxer;
use crate::visitor::VisitorManager;
use burrow_proto::auth;
use burrow_proto::msg::{self, Login, LoginResp, Message, NewVisitorConnResp, NewWorkConn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FIRST_MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);
const VHOST_PEEK_TIMEOUT: Duration = Duration::from_secs(30);
const SNIFF_MAX_BYTES: usize = 16;

pub struct Service {
    ctx: Arc<ServiceContext>,
    cancel: CancellationToken,
    tls_acceptor: TlsAcceptor,
    /// Virtual connections from the SSH tunnel gateway.
    ssh_listener: Arc<InternalListener>,
}

impl Service {
    pub fn new(cfg: ServerConfig) -> anyhow::Result<Arc<Self>> {
        let cfg = Arc::new(cfg);
        let allow = cfg.allow_port_ranges();
        let tcp_ports = Arc::new(PortManager::new(
            NetType::Tcp,
            &cfg.proxy_bind_addr,
            allow.clone(),
        ));
        let udp_ports = Arc::new(PortManager::new(NetType::Udp, &cfg.proxy_bind_addr, allow));

        let http_proxy = (cfg.vhost_http_port > 0).then(|| {
            Arc::new(HttpReverseProxy::new(
                Duration::from_secs(cfg.vhost_http_timeout),
                &cfg.custom_404_page,
            ))
        });
        let https_muxer =
            (cfg.vhost_https_port > 0).then(|| Arc::new(HttpsMuxer::new(VHOST_PEEK_TIMEOUT)));
        let tcpmux_muxer = (cfg.tcpmux_httpconnect_port > 0).then(|| {
            Arc::new(TcpConnectMuxer::new(
                VHOST_PEEK_TIMEOUT,
                cfg.tcpmux_passthrough,
            ))
        });

        let proxy_ctx = Arc::new(ProxyContext {
            cfg: Arc::clone(&cfg),
            tcp_ports: Arc::clone(&tcp_ports),
            udp_ports,
            http_groups: http_proxy
                .as_ref()
                .map(|p| Arc::new(crate::group::http::HttpGroupCtl::new(Arc::clone(&p.routers)))),
            tcpmux_groups: tcpmux_muxer.as_ref().map(|m| {
                Arc::new(crate::group::tcpmux::TcpMuxGroupCtl::new(Arc::clone(&m.routers)))
            }),
            tcp_groups: Arc::new(crate::group::tcp::TcpGroupCtl::new(
                Arc::clone(&tcp_ports),
                &cfg.proxy_bind_addr,
            )),
            http_proxy,
            https_muxer,
            tcpmux_muxer,
            visitors: Arc::new(VisitorManager::new(&cfg.auth.token)),
            nathole: Arc::new(NatHoleController::new(Duration::from_secs(
                cfg.nathole_analysis_data_reserve_hours * 3600,
            ))),
            plugins: Arc::new(PluginManager::new(&cfg.http_plugins)),
        });

        let tls_acceptor = net::tls::acceptor(&cfg)?;
        let ctx = Arc::new(ServiceContext {
            plugins: Arc::clone(&proxy_ctx.plugins),
            cfg,
            ctl_manager: Arc::new(ControlManager::new()),
            proxy_manager: Arc::new(ProxyManager::new()),
            proxy_ctx,
        });

        Ok(Arc::new(Self {
            ctx,
            cancel: CancellationToken::new(),
            tls_acceptor,
            ssh_listener: Arc::new(InternalListener::new()),
        }))
    }

    pub fn context(&self) -> Arc<ServiceContext> {
        Arc::clone(&self.ctx)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Bring every listener up and serve until cancelled.  Binding failures
    /// surface as startup errors.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let cfg = Arc::clone(&self.ctx.cfg);
        if !metrics::set_collector(Arc::new(metrics::MemCollector::new())) {
            debug!("metrics collector was already installed");
        }

        let bind_addr = format!("{}:{}", cfg.bind_addr, cfg.bind_port);
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("listening on {bind_addr}, tcp_mux: {}", cfg.transport.tcp_mux);

        // Dedicated vhost listeners when they do not share the bind port.
        if cfg.vhost_http_port > 0 && cfg.vhost_http_port != cfg.bind_port {
            self.spawn_vhost_http_listener(cfg.vhost_http_port).await?;
        }
        if cfg.vhost_https_port > 0 && cfg.vhost_https_port != cfg.bind_port {
            self.spawn_vhost_https_listener(cfg.vhost_https_port).await?;
        }
        if cfg.tcpmux_httpconnect_port > 0 {
            self.spawn_tcpmux_listener(cfg.tcpmux_httpconnect_port).await?;
        }

        if cfg.kcp_bind_port > 0 {
            let kcp = net::kcp::bind(&cfg.bind_addr, cfg.kcp_bind_port).await?;
            let service = Arc::clone(&self);
            net::kcp::spawn_accept_loop(kcp, self.cancel.clone(), move |stream, peer| {
                service.clone().dispatch_frp_conn(stream, peer, false);
            });
        }
        if cfg.quic_bind_port > 0 {
            let endpoint = net::quic::bind(&cfg)?;
            let service = Arc::clone(&self);
            net::quic::spawn_accept_loop(endpoint, self.cancel.clone(), move |stream, peer| {
                let service = service.clone();
                tokio::spawn(async move {
                    service.handle_initial_message(stream, peer, false).await;
                });
            });
        }
        if cfg.ssh_tunnel_gateway.bind_port > 0 {
            ssh::spawn_gateway(
                Arc::clone(&self.ctx.cfg),
                Arc::clone(&self.ssh_listener),
                self.cancel.clone(),
            )
            .await?;
        }
        if cfg.web_server.port > 0 {
            dashboard::spawn(Arc::clone(&self.ctx), self.cancel.clone()).await?;
        }

        // Background sweeps.
        self.ctx.proxy_ctx.tcp_ports.spawn_gc(self.cancel.clone());
        self.ctx.proxy_ctx.udp_ports.spawn_gc(self.cancel.clone());
        self.ctx.proxy_ctx.nathole.spawn_gc(self.cancel.clone());

        // Virtual connections from the SSH gateway skip sniffing and
        // multiplexing; they are already logical streams.
        let ssh_service = Arc::clone(&self);
        tokio::spawn(async move {
            let unspecified: SocketAddr = "127.0.0.1:0".parse().unwrap();
            loop {
                match ssh_service.ssh_listener.accept().await {
                    Some(stream) => {
                        let service = Arc::clone(&ssh_service);
                        tokio::spawn(async move {
                            service.handle_initial_message(stream, unspecified, true).await;
                        });
                    }
                    None => return,
                }
            }
        });

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let service = Arc::clone(&self);
                        tokio::spawn(async move {
                            service.handle_accepted(stream, peer).await;
                        });
                    }
                    Err(e) => {
                        warn!("accept error: {e}");
                    }
                }
            }
        }
    }

    /// The SSH gateway pushes its virtual connections here.
    pub fn ssh_conn_sink(&self) -> Arc<InternalListener> {
        Arc::clone(&self.ssh_listener)
    }

    async fn spawn_vhost_http_listener(self: &Arc<Self>, port: u16) -> anyhow::Result<()> {
        let listener =
            TcpListener::bind(format!("{}:{port}", self.ctx.cfg.proxy_bind_addr)).await?;
        info!("vhost http listener on port {port}");
        let proxy = self
            .ctx
            .proxy_ctx
            .http_proxy
            .clone()
            .expect("http proxy exists when port is set");
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let proxy = Arc::clone(&proxy);
                            tokio::spawn(async move {
                                proxy.serve_stream(Box::new(stream), peer).await;
                            });
                        }
                        Err(e) => { warn!("vhost http accept error: {e}"); return; }
                    }
                }
            }
        });
        Ok(())
    }

    async fn spawn_vhost_https_listener(self: &Arc<Self>, port: u16) -> anyhow::Result<()> {
        let listener =
            TcpListener::bind(format!("{}:{port}", self.ctx.cfg.proxy_bind_addr)).await?;
        info!("vhost https listener on port {port}");
        let muxer = self
            .ctx
            .proxy_ctx
            .https_muxer
            .clone()
            .expect("https muxer exists when port is set");
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _peer)) => {
                            let muxer = Arc::clone(&muxer);
                            tokio::spawn(async move {
                                muxer.handle_conn(Box::new(stream)).await;
                            });
                        }
                        Err(e) => { warn!("vhost https accept error: {e}"); return; }
                    }
                }
            }
        });
        Ok(())
    }

    async fn spawn_tcpmux_listener(self: &Arc<Self>, port: u16) -> anyhow::Result<()> {
        let listener =
            TcpListener::bind(format!("{}:{port}", self.ctx.cfg.proxy_bind_addr)).await?;
        info!("tcpmux httpconnect listener on port {port}");
        let muxer = self
            .ctx
            .proxy_ctx
            .tcpmux_muxer
            .clone()
            .expect("tcpmux muxer exists when port is set");
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _peer)) => {
                            let muxer = Arc::clone(&muxer);
                            tokio::spawn(async move {
                                muxer.handle_conn(Box::new(stream)).await;
                            });
                        }
                        Err(e) => { warn!("tcpmux accept error: {e}"); return; }
                    }
                }
            }
        });
        Ok(())
    }

    /// Sniff the first bytes of a bind-port connection and route it.
    async fn handle_accepted(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let cfg = &self.ctx.cfg;
        let https_shared = cfg.vhost_https_port > 0 && cfg.vhost_https_port == cfg.bind_port;
        let http_shared = cfg.vhost_http_port > 0 && cfg.vhost_http_port == cfg.bind_port;

        let mut stream = stream;
        let mut prefix = Vec::with_capacity(SNIFF_MAX_BYTES);
        let sniffed = match tokio::time::timeout(FIRST_MESSAGE_TIMEOUT, async {
            let mut chunk = [0u8; 1024];
            loop {
                if let Some(s) = classify(&prefix, https_shared, http_shared) {
                    return Some(s);
                }
                if prefix.len() >= SNIFF_MAX_BYTES {
                    return Some(Sniffed::Raw);
                }
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => return None,
                    Ok(n) => prefix.extend_from_slice(&chunk[..n]),
                }
            }
        })
        .await
        {
            Ok(Some(s)) => s,
            _ => return,
        };

        match sniffed {
            Sniffed::VhostHttp => {
                let proxy = self
                    .ctx
                    .proxy_ctx
                    .http_proxy
                    .clone()
                    .expect("sniffed only when shared");
                proxy
                    .serve_stream(Box::new(PeekedStream::new(prefix, stream)), peer)
                    .await;
            }
            Sniffed::VhostHttps => {
                let muxer = self
                    .ctx
                    .proxy_ctx
                    .https_muxer
                    .clone()
                    .expect("sniffed only when shared");
                muxer
                    .handle_conn(Box::new(PeekedStream::new(prefix, stream)))
                    .await;
            }
            Sniffed::Websocket => {
                match net::ws::accept(PeekedStream::new(prefix, stream)).await {
                    Ok(ws_stream) => self.dispatch_frp_conn(Box::new(ws_stream), peer, false),
                    Err(e) => debug!("websocket handshake from {peer} failed: {e}"),
                }
            }
            Sniffed::FrpTls { strip_head } => {
                let replay = if strip_head { prefix[1..].to_vec() } else { prefix };
                let peeked = PeekedStream::new(replay, stream);
                match self.tls_acceptor.accept(peeked).await {
                    Ok(tls_stream) => self.dispatch_frp_conn(Box::new(tls_stream), peer, false),
                    Err(e) => debug!("tls handshake from {peer} failed: {e}"),
                }
            }
            Sniffed::Raw => {
                if self.ctx.cfg.transport.tls.force {
                    warn!("{peer}: plain connection refused, tls is enforced");
                    return;
                }
                self.dispatch_frp_conn(Box::new(PeekedStream::new(prefix, stream)), peer, false);
            }
        }
    }

    /// Wrap a tunnel-protocol connection in the stream multiplexer if
    /// enabled; each logical stream carries one initial message.
    fn dispatch_frp_conn(self: Arc<Self>, stream: AnyStream, peer: SocketAddr, internal: bool) {
        if self.ctx.cfg.transport.tcp_mux && !internal {
            let service = Arc::clone(&self);
            net::yamux::spawn_session(stream, peer, self.cancel.clone(), move |s, p| {
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    service.handle_initial_message(s, p, false).await;
                });
            });
        } else {
            let service = self;
            tokio::spawn(async move {
                service.handle_initial_message(stream, peer, internal).await;
            });
        }
    }

    /// Read exactly one message and dispatch by its type; anything else
    /// closes the connection.
    pub async fn handle_initial_message(
        self: &Arc<Self>,
        mut stream: AnyStream,
        peer: SocketAddr,
        internal: bool,
    ) {
        let first = match net::read_message_timeout(&mut stream, FIRST_MESSAGE_TIMEOUT).await {
            Ok(m) => m,
            Err(e) => {
                debug!("{peer}: no usable initial message: {e}");
                return;
            }
        };
        match first {
            Message::Login(login) => {
                if let Err(e) = self.register_control(stream, login, peer, internal).await {
                    warn!("{peer}: login failed: {e}");
                }
            }
            Message::NewWorkConn(m) => self.register_work_conn(stream, m, internal).await,
            Message::NewVisitorConn(m) => {
                let resp_error = match self.ctx.proxy_ctx.visitors.verify(&m) {
                    Ok(()) => None,
                    Err(e) => {
                        warn!("{peer}: visitor for [{}] refused: {e}", m.proxy_name);
                        Some(e.client_facing(self.ctx.cfg.detailed_errors_to_client))
                    }
                };
                let resp = Message::NewVisitorConnResp(NewVisitorConnResp {
                    proxy_name: m.proxy_name.clone(),
                    error: resp_error.clone().unwrap_or_default(),
                });
                if msg::write_message(&mut stream, &resp).await.is_err() || resp_error.is_some() {
                    return;
                }
                if let Err(e) = self.ctx.proxy_ctx.visitors.admit(&m, stream) {
                    warn!("{peer}: visitor admit failed: {e}");
                }
            }
            other => {
                warn!(
                    "{peer}: unexpected initial message type 0x{:02x}",
                    other.type_byte()
                );
            }
        }
    }

    async fn register_control(
        self: &Arc<Self>,
        mut stream: AnyStream,
        login: Login,
        peer: SocketAddr,
        internal: bool,
    ) -> Result<()> {
        let outcome = self.verify_and_build_control(login, internal).await;
        let (ctl, old) = match outcome {
            Ok(pair) => pair,
            Err(e) => {
                let resp = Message::LoginResp(LoginResp {
                    version: msg::PROTOCOL_VERSION.to_string(),
                    run_id: String::new(),
                    error: e.client_facing(self.ctx.cfg.detailed_errors_to_client),
                });
                let _ = msg::write_message(&mut stream, &resp).await;
                return Err(e);
            }
        };

        if let Some(old) = old {
            old.replaced();
        }
        metrics::collector().new_client();
        info!(
            "client from {peer} logged in, user [{}], run id [{}]",
            ctl.user(),
            ctl.run_id
        );
        ctl.start(stream);
        Ok(())
    }

    async fn verify_and_build_control(
        self: &Arc<Self>,
        login: Login,
        internal: bool,
    ) -> Result<(Arc<Control>, Option<Arc<Control>>)> {
        let login = if self.ctx.plugins.is_empty() {
            login
        } else {
            self.ctx.plugins.run_typed_hook(Op::Login, &login).await?
        };

        let auth_exempt = internal && login.client_spec.always_auth_pass;
        if !auth_exempt {
            let expected = auth::auth_key(&self.ctx.cfg.auth.token, login.timestamp);
            if !auth::constant_time_eq(&expected, &login.privilege_key) {
                return Err(ServerError::AuthFailed(
                    "token in login does not match".to_string(),
                ));
            }
            if !auth::timestamp_in_range(login.timestamp, unix_timestamp()) {
                return Err(ServerError::AuthFailed(
                    "login timestamp is too skewed".to_string(),
                ));
            }
        }

        let pool_count = login.pool_count.min(self.ctx.cfg.max_pool_count);
        let run_id = if login.run_id.is_empty() {
            rand_id()
        } else {
            login.run_id.clone()
        };

        let ctl = Control::new(
            Arc::clone(&self.ctx),
            login,
            run_id.clone(),
            pool_count,
            internal,
        );
        let old = self.ctx.ctl_manager.add(&run_id, Arc::clone(&ctl));
        Ok((ctl, old))
    }

    async fn register_work_conn(self: &Arc<Self>, stream: AnyStream, m: NewWorkConn, internal: bool) {
        let Some(ctl) = self.ctx.ctl_manager.get(&m.run_id) else {
            warn!("work conn for unknown run id [{}]", m.run_id);
            return;
        };
        if self.ctx.cfg.auth.verify_new_work_conns() && !internal {
            let expected = auth::auth_key(&self.ctx.cfg.auth.token, m.timestamp);
            if !auth::constant_time_eq(&expected, &m.privilege_key)
                || !auth::timestamp_in_range(m.timestamp, unix_timestamp())
            {
                warn!("work conn auth failed for run id [{}]", m.run_id);
                return;
            }
        }
        if !self.ctx.plugins.is_empty() {
            if let Err(e) = self.ctx.plugins.run_typed_hook(Op::NewWorkConn, &m).await {
                warn!("work conn rejected by plugin: {e}");
                return;
            }
        }
        if let Err(e) = ctl.register_work_conn(stream) {
            debug!("work conn for [{}] dropped: {e}", m.run_id);
        }
    }
}
