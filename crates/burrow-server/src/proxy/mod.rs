pub mod http;
pub mod https;
pub mod stcp;
pub mod tcp;
pub mod tcpmux;
pub mod udp;
pub mod xtcp;

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::group::http::HttpGroupCtl;
use crate::group::tcp::TcpGroupCtl;
use crate::group::tcpmux::TcpMuxGroupCtl;
use crate::metrics;
use crate::nathole::NatHoleController;
use crate::net::{join_streams, AnyStream, Limiter};
use crate::plugin::{Op, PluginManager};
use crate::ports::PortManager;
use crate::transport::MessageTransporter;
use crate::util::parse_bandwidth;
use crate::vhost::http::HttpReverseProxy;
use crate::vhost::https::HttpsMuxer;
use crate::vhost::tcpmux::TcpConnectMuxer;
use crate::vhost::ConnFuture;
use crate::visitor::VisitorManager;
use async_trait::async_trait;
use burrow_proto::msg::{self, Login, Message, NewProxy, StartWorkConn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Pulls one raw work connection from the owning control's pool.
pub type GetWorkConnFn = Arc<dyn Fn() -> ConnFuture + Send + Sync>;

/// Shared subsystems a proxy needs to come alive.  Proxies never hold their
/// control directly; the work-conn callable is the only path back.
pub struct ProxyContext {
    pub cfg: Arc<ServerConfig>,
    pub tcp_ports: Arc<PortManager>,
    pub udp_ports: Arc<PortManager>,
    pub http_proxy: Option<Arc<HttpReverseProxy>>,
    pub https_muxer: Option<Arc<HttpsMuxer>>,
    pub tcpmux_muxer: Option<Arc<TcpConnectMuxer>>,
    pub visitors: Arc<VisitorManager>,
    pub nathole: Arc<NatHoleController>,
    pub tcp_groups: Arc<TcpGroupCtl>,
    pub http_groups: Option<Arc<HttpGroupCtl>>,
    pub tcpmux_groups: Option<Arc<TcpMuxGroupCtl>>,
    pub plugins: Arc<PluginManager>,
}

pub struct BaseProxy {
    pub name: String,
    pub msg: NewProxy,
    pub login: Login,
    pub run_id: String,
    pub get_work_conn: GetWorkConnFn,
    pub transporter: Arc<MessageTransporter>,
    pub ctx: Arc<ProxyContext>,
    pub limiter: Option<Limiter>,
    pub cancel: CancellationToken,
}

impl BaseProxy {
    pub fn new(
        msg: NewProxy,
        login: Login,
        run_id: String,
        get_work_conn: GetWorkConnFn,
        transporter: Arc<MessageTransporter>,
        ctx: Arc<ProxyContext>,
    ) -> Self {
        let limiter = if msg.bandwidth_limit_mode == "server" {
            parse_bandwidth(&msg.bandwidth_limit).and_then(crate::net::new_limiter)
        } else {
            None
        };
        Self {
            name: msg.proxy_name.clone(),
            msg,
            login,
            run_id,
            get_work_conn,
            transporter,
            ctx,
            limiter,
            cancel: CancellationToken::new(),
        }
    }

    /// Obtain a work connection ready to carry one user connection: a
    /// StartWorkConn frame goes out first, then the configured encryption
    /// and compression layers wrap the stream.
    pub async fn work_conn_for_user(
        &self,
        src: Option<SocketAddr>,
        dst_port: u16,
    ) -> Result<AnyStream> {
        let mut last_err = ServerError::WorkConnTimeout;
        for _ in 0..5 {
            let mut conn = match (self.get_work_conn)().await {
                Ok(c) => c,
                Err(e) => return Err(e),
            };
            let start = StartWorkConn {
                proxy_name: self.name.clone(),
                src_addr: src.map(|a| a.ip().to_string()).unwrap_or_default(),
                src_port: src.map(|a| a.port()).unwrap_or_default(),
                dst_addr: self.ctx.cfg.proxy_bind_addr.clone(),
                dst_port,
                error: String::new(),
            };
            match msg::write_message(&mut conn, &Message::StartWorkConn(start)).await {
                Ok(()) => {
                    let mut stream = conn;
                    if self.msg.use_encryption {
                        stream = Box::new(burrow_proto::crypto::EncryptedStream::with_token(
                            stream,
                            &self.ctx.cfg.auth.token,
                        ));
                    }
                    if self.msg.use_compression {
                        stream = Box::new(burrow_proto::compress::compressed(stream));
                    }
                    return Ok(stream);
                }
                Err(e) => {
                    // A pooled conn may have died while idle; retry on a
                    // fresh one.
                    debug!("proxy [{}]: stale work conn: {e}", self.name);
                    last_err = e.into();
                }
            }
        }
        Err(last_err)
    }

    /// A dialer for vhost routes and health probes.
    pub fn conn_dialer(self: &Arc<Self>, dst_port: u16) -> crate::vhost::CreateConnFn {
        let base = Arc::clone(self);
        Arc::new(move |remote_addr: String| -> ConnFuture {
            let base = Arc::clone(&base);
            Box::pin(async move {
                let src = remote_addr.parse::<SocketAddr>().ok();
                base.work_conn_for_user(src, dst_port).await
            })
        })
    }

    /// Run one user connection end to end: plugin gate, work-conn fetch,
    /// byte splicing, traffic accounting.
    pub async fn handle_user_conn(
        self: Arc<Self>,
        user: AnyStream,
        peer: Option<SocketAddr>,
        dst_port: u16,
    ) {
        if !self.ctx.plugins.is_empty() {
            let content = serde_json::json!({
                "user": {
                    "user": self.login.user,
                    "metas": self.login.metas,
                    "run_id": self.run_id,
                },
                "proxy_name": self.name,
                "proxy_type": self.msg.proxy_type,
                "remote_addr": peer.map(|p| p.to_string()).unwrap_or_default(),
            });
            if let Err(e) = self.ctx.plugins.run_hook(Op::NewUserConn, content).await {
                warn!("proxy [{}]: user conn rejected: {e}", self.name);
                return;
            }
        }

        let work = match self.work_conn_for_user(peer, dst_port).await {
            Ok(w) => w,
            Err(e) => {
                warn!("proxy [{}]: {e}", self.name);
                return;
            }
        };

        let collector = metrics::collector();
        collector.open_connection(&self.name);
        let (user_to_work, work_to_user) =
            join_streams(user, work, self.limiter.as_ref()).await;
        collector.add_traffic_in(&self.name, user_to_work as i64);
        collector.add_traffic_out(&self.name, work_to_user as i64);
        collector.close_connection(&self.name);
        debug!(
            "proxy [{}]: user conn done, in {user_to_work}B out {work_to_user}B",
            self.name
        );
    }

    /// Spawn-and-forget variant for accept loops.
    pub fn spawn_user_conn(self: &Arc<Self>, user: AnyStream, peer: Option<SocketAddr>, dst_port: u16) {
        let base = Arc::clone(self);
        tokio::spawn(async move {
            base.handle_user_conn(user, peer, dst_port).await;
        });
    }

    /// Domains this proxy serves: custom domains plus the projected
    /// subdomain.
    pub fn vhost_domains(&self) -> Result<Vec<String>> {
        let mut domains: Vec<String> = self
            .msg
            .custom_domains
            .iter()
            .filter(|d| !d.is_empty())
            .map(|d| d.to_lowercase())
            .collect();
        if !self.msg.subdomain.is_empty() {
            if self.ctx.cfg.subdomain_host.is_empty() {
                return Err(ServerError::ResourceUnavailable(
                    "subdomain is not supported: subdomain_host is not configured".to_string(),
                ));
            }
            domains.push(format!(
                "{}.{}",
                self.msg.subdomain.to_lowercase(),
                self.ctx.cfg.subdomain_host.to_lowercase()
            ));
        }
        if domains.is_empty() {
            return Err(ServerError::ProtocolViolation(
                "no custom domain or subdomain configured".to_string(),
            ));
        }
        Ok(domains)
    }
}

#[async_trait]
pub trait Proxy: Send + Sync {
    fn base(&self) -> &Arc<BaseProxy>;

    /// Bring the public surface up.  Returns the remote address clients
    /// should advertise.  Partial failures must leave no registrations
    /// behind.
    async fn run(&self) -> Result<String>;

    /// Release every owned handle: ports, routes, listeners, tasks.
    async fn close(&self);

    fn used_ports_num(&self) -> usize {
        0
    }

    fn name(&self) -> &str {
        &self.base().name
    }

    fn run_id(&self) -> &str {
        &self.base().run_id
    }

    fn proxy_type(&self) -> &str {
        &self.base().msg.proxy_type
    }
}

/// Type tag → constructor table.
pub fn new_proxy(base: BaseProxy) -> Result<Arc<dyn Proxy>> {
    let base = Arc::new(base);
    let pxy: Arc<dyn Proxy> = match base.msg.proxy_type.as_str() {
        "tcp" => Arc::new(tcp::TcpProxy::new(base)),
        "udp" => Arc::new(udp::UdpProxy::new(base)),
        "http" => Arc::new(http::HttpProxy::new(base)),
        "https" => Arc::new(https::HttpsProxy::new(base)),
        "tcpmux" => Arc::new(tcpmux::TcpMuxProxy::new(base)),
        "stcp" | "sudp" => Arc::new(stcp::StcpProxy::new(base)),
        "xtcp" => Arc::new(xtcp::XtcpProxy::new(base)),
        other => return Err(ServerError::UnknownProxyType(other.to_string())),
    };
    Ok(pxy)
}

/// Global name → proxy registry; names are unique across every control.
pub struct ProxyManager {
    proxies: RwLock<HashMap<String, Arc<dyn Proxy>>>,
}

impl ProxyManager {
    pub fn new() -> Self {
        Self {
            proxies: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, name: &str, pxy: Arc<dyn Proxy>) -> Result<()> {
        let mut proxies = self.proxies.write().unwrap();
        if proxies.contains_key(name) {
            return Err(ServerError::DuplicateName(name.to_string()));
        }
        proxies.insert(name.to_string(), pxy);
        Ok(())
    }

    pub fn remove(&self, name: &str) {
        self.proxies.write().unwrap().remove(name);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Proxy>> {
        self.proxies.read().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.proxies.read().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.proxies.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ProxyManager {
    fn default() -> Self {
        Self::new()
    }
}
