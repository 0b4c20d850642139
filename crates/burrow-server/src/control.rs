//! One control session per logged-in client.
//!
//! The control owns the message stream (one reader task, one writer task
//! draining a bounded queue), the work-connection pool, the heartbeat
//! watcher, and every proxy the client registers.  Teardown cascades: when
//! the reader exits, owned proxies close, the pool drains, and the manager
//! entry is removed, but only if it still points at this control, so a
//! replacement is never deleted by its predecessor.

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::metrics;
use crate::plugin::{Op, PluginManager};
use crate::proxy::{self, Proxy, ProxyContext, ProxyManager};
use crate::transport::MessageTransporter;
use crate::net::AnyStream;
use burrow_proto::auth;
use burrow_proto::msg::{
    self, Login, LoginResp, Message, NewProxy, Ping, Pong, ReqWorkConn,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SEND_QUEUE_SIZE: usize = 100;
const WORK_CONN_SLACK: usize = 10;

/// Everything a control needs besides its own connection.
pub struct ServiceContext {
    pub cfg: Arc<ServerConfig>,
    pub ctl_manager: Arc<ControlManager>,
    pub proxy_manager: Arc<ProxyManager>,
    pub proxy_ctx: Arc<ProxyContext>,
    pub plugins: Arc<PluginManager>,
}

pub struct Control {
    pub run_id: String,
    login: Login,
    pool_count: usize,
    ports_used: AtomicUsize,
    last_ping: Mutex<Instant>,
    proxies: Mutex<HashMap<String, Arc<dyn Proxy>>>,
    send_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    work_tx: mpsc::Sender<AnyStream>,
    work_rx: tokio::sync::Mutex<mpsc::Receiver<AnyStream>>,
    transporter: Arc<MessageTransporter>,
    cancel: CancellationToken,
    ctx: Arc<ServiceContext>,
    /// True for the SSH gateway's in-process client; bypasses token auth.
    internal: bool,
}

impl Control {
    pub fn new(
        ctx: Arc<ServiceContext>,
        login: Login,
        run_id: String,
        pool_count: usize,
        internal: bool,
    ) -> Arc<Self> {
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_SIZE);
        let (work_tx, work_rx) = mpsc::channel(pool_count + WORK_CONN_SLACK);
        Arc::new(Self {
            run_id,
            login,
            pool_count,
            ports_used: AtomicUsize::new(0),
            last_ping: Mutex::new(Instant::now()),
            proxies: Mutex::new(HashMap::new()),
            transporter: Arc::new(MessageTransporter::new(send_tx)),
            send_rx: Mutex::new(Some(send_rx)),
            work_tx,
            work_rx: tokio::sync::Mutex::new(work_rx),
            cancel: CancellationToken::new(),
            ctx,
            internal,
        })
    }

    pub fn transporter(&self) -> Arc<MessageTransporter> {
        Arc::clone(&self.transporter)
    }

    pub fn user(&self) -> &str {
        &self.login.user
    }

    pub fn ports_used_num(&self) -> usize {
        self.ports_used.load(Ordering::Relaxed)
    }

    pub fn proxy_count(&self) -> usize {
        self.proxies.lock().unwrap().len()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Queue a message onto the control connection.
    pub fn send(&self, message: Message) -> Result<()> {
        self.transporter.send(message)
    }

    /// Launch the session: LoginResp first, then the work-conn prefill, the
    /// writer/reader tasks, and the heartbeat watcher.
    pub fn start(self: &Arc<Self>, conn: AnyStream) {
        let ctl = Arc::clone(self);
        let mut send_rx = self
            .send_rx
            .lock()
            .unwrap()
            .take()
            .expect("control started twice");

        tokio::spawn(async move {
            // Teardown must run no matter how this task ends, a panicking
            // message handler included.
            let _teardown = TeardownGuard {
                ctl: Some(Arc::clone(&ctl)),
            };

            // LoginResp goes out before the crypto wrapper and before every
            // ReqWorkConn, so clients can always read it in the clear.
            let mut conn = conn;
            let resp = Message::LoginResp(LoginResp {
                version: msg::PROTOCOL_VERSION.to_string(),
                run_id: ctl.run_id.clone(),
                error: String::new(),
            });
            if msg::write_message(&mut conn, &resp).await.is_err() {
                return;
            }

            // Message stream encryption is skipped for the in-process
            // client, whose pipe never leaves the address space.
            let conn: AnyStream = if ctl.internal {
                conn
            } else {
                Box::new(burrow_proto::crypto::EncryptedStream::with_token(
                    conn,
                    &ctl.ctx.cfg.auth.token,
                ))
            };
            let (mut reader, mut writer) = tokio::io::split(conn);

            for _ in 0..ctl.pool_count {
                let _ = ctl.send(Message::ReqWorkConn(ReqWorkConn {}));
            }

            let writer_ctl = Arc::clone(&ctl);
            let writer_task = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = writer_ctl.cancel.cancelled() => return,
                        queued = send_rx.recv() => match queued {
                            Some(message) => {
                                if msg::write_message(&mut writer, &message).await.is_err() {
                                    writer_ctl.cancel.cancel();
                                    return;
                                }
                            }
                            None => return,
                        }
                    }
                }
            });

            if ctl.ctx.cfg.effective_heartbeat_timeout() > 0 {
                ctl.spawn_heartbeat_watcher();
            }

            // Reader: serial, per-connection FIFO dispatch.
            loop {
                tokio::select! {
                    _ = ctl.cancel.cancelled() => break,
                    read = msg::read_message(&mut reader) => match read {
                        Ok(message) => ctl.dispatch(message).await,
                        Err(e) => {
                            debug!("control [{}]: reader exits: {e}", ctl.run_id);
                            break;
                        }
                    }
                }
            }
            writer_task.abort();
        });
    }

    fn spawn_heartbeat_watcher(self: &Arc<Self>) {
        let ctl = Arc::clone(self);
        let timeout = Duration::from_secs(ctl.ctx.cfg.effective_heartbeat_timeout() as u64);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ctl.cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
                let stale = ctl.last_ping.lock().unwrap().elapsed() > timeout;
                if stale {
                    warn!("control [{}]: heartbeat timeout", ctl.run_id);
                    ctl.cancel.cancel();
                    return;
                }
            }
        });
    }

    async fn dispatch(self: &Arc<Self>, message: Message) {
        match message {
            Message::Ping(ping) => self.handle_ping(ping).await,
            Message::NewProxy(new_proxy) => {
                let proxy_name = new_proxy.proxy_name.clone();
                let (remote_addr, error) = match self.register_proxy(new_proxy).await {
                    Ok(addr) => (addr, String::new()),
                    Err(e) => {
                        warn!("control [{}]: new proxy [{proxy_name}] failed: {e}", self.run_id);
                        (
                            String::new(),
                            e.client_facing(self.ctx.cfg.detailed_errors_to_client),
                        )
                    }
                };
                let _ = self.send(Message::NewProxyResp(msg::NewProxyResp {
                    proxy_name,
                    remote_addr,
                    error,
                }));
            }
            Message::CloseProxy(close) => {
                self.close_proxy(&close.proxy_name).await;
            }
            Message::NatHoleVisitor(visitor) => {
                let nathole = Arc::clone(&self.ctx.proxy_ctx.nathole);
                let transporter = self.transporter();
                let mut visitor = visitor;
                visitor.user = self.login.user.clone();
                // Pairing blocks on the host's reply; never stall the
                // dispatcher for it.
                tokio::spawn(async move {
                    nathole.handle_visitor(visitor, transporter).await;
                });
            }
            Message::NatHoleClient(client) => {
                let sid = client.sid.clone();
                if !self.transporter.dispatch(Message::NatHoleClient(client), &sid) {
                    debug!("control [{}]: unsolicited NatHoleClient for sid {sid}", self.run_id);
                }
            }
            Message::NatHoleReport(report) => {
                self.ctx.proxy_ctx.nathole.handle_report(&report);
            }
            other => {
                warn!(
                    "control [{}]: unexpected message type 0x{:02x}",
                    self.run_id,
                    other.type_byte()
                );
            }
        }
    }

    async fn handle_ping(self: &Arc<Self>, ping: Ping) {
        if self.ctx.cfg.auth.verify_heartbeats() && !self.internal {
            let expected = auth::auth_key(&self.ctx.cfg.auth.token, ping.timestamp);
            if !auth::constant_time_eq(&expected, &ping.privilege_key)
                || !auth::timestamp_in_range(ping.timestamp, crate::util::unix_timestamp())
            {
                warn!("control [{}]: heartbeat auth failed", self.run_id);
                let _ = self.send(Message::Pong(Pong {
                    error: ServerError::AuthFailed("invalid heartbeat".to_string())
                        .client_facing(self.ctx.cfg.detailed_errors_to_client),
                }));
                self.cancel.cancel();
                return;
            }
        }
        if !self.ctx.plugins.is_empty() {
            if let Err(e) = self.ctx.plugins.run_typed_hook(Op::Ping, &ping).await {
                let _ = self.send(Message::Pong(Pong {
                    error: e.client_facing(self.ctx.cfg.detailed_errors_to_client),
                }));
                self.cancel.cancel();
                return;
            }
        }
        *self.last_ping.lock().unwrap() = Instant::now();
        let _ = self.send(Message::Pong(Pong::default()));
    }

    /// Hand a fresh work connection to the pool.  Overflow discards.
    pub fn register_work_conn(&self, conn: AnyStream) -> Result<()> {
        self.work_tx.try_send(conn).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                debug!("control [{}]: work conn pool overflow", self.run_id);
                ServerError::ResourceUnavailable("work conn pool is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => ServerError::ControlClosed,
        })
    }

    /// Take a work connection, pulling from the pool or requesting one on
    /// demand.  Every success triggers a refill request.
    pub async fn get_work_conn(&self) -> Result<AnyStream> {
        let mut work_rx = self.work_rx.lock().await;
        match work_rx.try_recv() {
            Ok(conn) => {
                let _ = self.send(Message::ReqWorkConn(ReqWorkConn {}));
                return Ok(conn);
            }
            Err(mpsc::error::TryRecvError::Disconnected) => return Err(ServerError::ControlClosed),
            Err(mpsc::error::TryRecvError::Empty) => {}
        }

        self.send(Message::ReqWorkConn(ReqWorkConn {}))?;
        let wait = Duration::from_secs(self.ctx.cfg.user_conn_timeout);
        match tokio::time::timeout(wait, work_rx.recv()).await {
            Ok(Some(conn)) => {
                let _ = self.send(Message::ReqWorkConn(ReqWorkConn {}));
                Ok(conn)
            }
            Ok(None) => Err(ServerError::ControlClosed),
            Err(_) => Err(ServerError::WorkConnTimeout),
        }
    }

    async fn register_proxy(self: &Arc<Self>, new_proxy: NewProxy) -> Result<String> {
        let new_proxy = if self.ctx.plugins.is_empty() {
            new_proxy
        } else {
            self.ctx
                .plugins
                .run_typed_hook(Op::NewProxy, &new_proxy)
                .await?
        };

        let weak = Arc::downgrade(self);
        let get_work_conn: proxy::GetWorkConnFn = Arc::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                let ctl = weak.upgrade().ok_or(ServerError::ControlClosed)?;
                ctl.get_work_conn().await
            })
        });

        let base = proxy::BaseProxy::new(
            new_proxy,
            self.login.clone(),
            self.run_id.clone(),
            get_work_conn,
            self.transporter(),
            Arc::clone(&self.ctx.proxy_ctx),
        );
        let pxy = proxy::new_proxy(base)?;

        // Quota before any port is touched.
        let max_ports = self.ctx.cfg.max_ports_per_client;
        if max_ports > 0 && self.ports_used_num() + pxy.used_ports_num() > max_ports {
            return Err(ServerError::QuotaExceeded);
        }

        let remote_addr = pxy.run().await?;

        let name = pxy.name().to_string();
        if let Err(e) = self.ctx.proxy_manager.add(&name, Arc::clone(&pxy)) {
            pxy.close().await;
            return Err(e);
        }
        self.ports_used.fetch_add(pxy.used_ports_num(), Ordering::Relaxed);
        self.proxies.lock().unwrap().insert(name.clone(), Arc::clone(&pxy));
        metrics::collector().new_proxy(&name, pxy.proxy_type());
        info!(
            "control [{}]: proxy [{name}] registered at [{remote_addr}]",
            self.run_id
        );
        Ok(remote_addr)
    }

    pub async fn close_proxy(self: &Arc<Self>, name: &str) {
        let Some(pxy) = self.proxies.lock().unwrap().remove(name) else {
            return;
        };
        self.ports_used
            .fetch_sub(pxy.used_ports_num(), Ordering::Relaxed);
        self.ctx.proxy_manager.remove(name);
        pxy.close().await;
        metrics::collector().close_proxy(name, pxy.proxy_type());
        self.fire_close_proxy_hook(name);
        info!("control [{}]: proxy [{name}] closed", self.run_id);
    }

    fn fire_close_proxy_hook(&self, name: &str) {
        if self.ctx.plugins.is_empty() {
            return;
        }
        let plugins = Arc::clone(&self.ctx.plugins);
        let content = serde_json::json!({
            "user": {
                "user": self.login.user,
                "metas": self.login.metas,
                "run_id": self.run_id,
            },
            "proxy_name": name,
        });
        tokio::spawn(async move {
            if let Err(e) = plugins.run_hook(Op::CloseProxy, content).await {
                debug!("CloseProxy hook failed: {e}");
            }
        });
    }

    /// The control manager replaced this session with a newer login that
    /// carries the same run id.
    pub fn replaced(&self) {
        info!("control [{}]: replaced by a new login", self.run_id);
        self.cancel.cancel();
    }

    async fn teardown(self: &Arc<Self>) {
        self.cancel.cancel();
        self.ctx.ctl_manager.remove_if_same(&self.run_id, self);

        // Drain and drop pooled work connections.
        {
            let mut work_rx = self.work_rx.lock().await;
            work_rx.close();
            while work_rx.try_recv().is_ok() {}
        }

        let owned: Vec<(String, Arc<dyn Proxy>)> =
            self.proxies.lock().unwrap().drain().collect();
        for (name, pxy) in owned {
            self.ctx.proxy_manager.remove(&name);
            pxy.close().await;
            metrics::collector().close_proxy(&name, pxy.proxy_type());
            self.fire_close_proxy_hook(&name);
        }
        metrics::collector().close_client();
        info!("control [{}]: torn down", self.run_id);
    }
}

/// Runs the control's teardown when its session task finishes for any
/// reason, including a panic inside a message handler.
struct TeardownGuard {
    ctl: Option<Arc<Control>>,
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        if let Some(ctl) = self.ctl.take() {
            if std::thread::panicking() {
                warn!("control [{}]: message handler panicked", ctl.run_id);
            }
            tokio::spawn(async move {
                ctl.teardown().await;
            });
        }
    }
}

/// runID → control, with atomic replacement.
pub struct ControlManager {
    ctls: RwLock<HashMap<String, Arc<Control>>>,
}

impl ControlManager {
    pub fn new() -> Self {
        Self {
            ctls: RwLock::new(HashMap::new()),
        }
    }

    /// Insert, returning the control being replaced (same run id), if any.
    pub fn add(&self, run_id: &str, ctl: Arc<Control>) -> Option<Arc<Control>> {
        self.ctls.write().unwrap().insert(run_id.to_string(), ctl)
    }

    /// Compare-and-delete: only removes the entry if it still is `ctl`, so
    /// a replacement control survives its predecessor's teardown.
    pub fn remove_if_same(&self, run_id: &str, ctl: &Arc<Control>) {
        let mut ctls = self.ctls.write().unwrap();
        if let Some(current) = ctls.get(run_id) {
            if Arc::ptr_eq(current, ctl) {
                ctls.remove(run_id);
            }
        }
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<Control>> {
        self.ctls.read().unwrap().get(run_id).cloned()
    }

    pub fn client_count(&self) -> usize {
        self.ctls.read().unwrap().len()
    }
}

impl Default for ControlManager {
    fn default() -> Self {
        Self::new()
    }
}
