//! Remote-port reservation for tcp and udp proxies.
//!
//! A reservation is keyed by proxy name so a client that reconnects shortly
//! after dropping gets the same public port back.  Reservations closed for
//! more than 24 hours are garbage-collected by an hourly sweep.

use crate::error::{Result, ServerError};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::{TcpListener, UdpSocket};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const RESERVATION_TTL: Duration = Duration::from_secs(24 * 3600);
const GC_PERIOD: Duration = Duration::from_secs(3600);
const MAX_RANDOM_TRIES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetType {
    Tcp,
    Udp,
}

#[derive(Debug, Clone)]
struct PortCtx {
    port: u16,
    closed: bool,
    update_time: Instant,
}

struct Inner {
    /// Name-keyed reservations; survive brief proxy-down periods.
    reserved: HashMap<String, PortCtx>,
    used: HashSet<u16>,
}

pub struct PortManager {
    net_type: NetType,
    bind_addr: String,
    allow: Option<Vec<RangeInclusive<u16>>>,
    inner: Mutex<Inner>,
}

impl PortManager {
    pub fn new(
        net_type: NetType,
        bind_addr: &str,
        allow: Option<Vec<RangeInclusive<u16>>>,
    ) -> Self {
        Self {
            net_type,
            bind_addr: bind_addr.to_string(),
            allow,
            inner: Mutex::new(Inner {
                reserved: HashMap::new(),
                used: HashSet::new(),
            }),
        }
    }

    fn allowed(&self, port: u16) -> bool {
        match &self.allow {
            None => port > 0,
            Some(ranges) => ranges.iter().any(|r| r.contains(&port)),
        }
    }

    /// Can the OS actually give us this port right now?
    fn bindable(&self, port: u16) -> bool {
        let addr = format!("{}:{}", self.bind_addr, port);
        match self.net_type {
            NetType::Tcp => TcpListener::bind(&addr).is_ok(),
            NetType::Udp => UdpSocket::bind(&addr).is_ok(),
        }
    }

    /// Reserve a port.  `port == 0` lets the manager choose: the proxy's
    /// previous reservation if one exists, otherwise a free allowed port.
    pub fn acquire(&self, proxy_name: &str, port: u16) -> Result<u16> {
        let mut inner = self.inner.lock().unwrap();

        if port > 0 {
            if !self.allowed(port) {
                return Err(ServerError::PortForbidden(port));
            }
            if inner.used.contains(&port) || !self.bindable(port) {
                return Err(ServerError::PortUnavailable(port));
            }
            inner.grant(proxy_name, port);
            return Ok(port);
        }

        // Prefer the proxy's previous port.
        if let Some(ctx) = inner.reserved.get(proxy_name).cloned() {
            if !inner.used.contains(&ctx.port) && self.allowed(ctx.port) && self.bindable(ctx.port)
            {
                inner.grant(proxy_name, ctx.port);
                return Ok(ctx.port);
            }
        }

        for candidate in self.random_candidates() {
            if !inner.used.contains(&candidate) && self.bindable(candidate) {
                inner.grant(proxy_name, candidate);
                return Ok(candidate);
            }
        }
        Err(ServerError::ResourceUnavailable(
            "no free port available".to_string(),
        ))
    }

    fn random_candidates(&self) -> Vec<u16> {
        let mut rng = rand::thread_rng();
        let mut out = Vec::with_capacity(MAX_RANDOM_TRIES);
        for _ in 0..MAX_RANDOM_TRIES {
            let port = match &self.allow {
                None => rng.gen_range(1024..=u16::MAX),
                Some(ranges) => {
                    let range = &ranges[rng.gen_range(0..ranges.len())];
                    rng.gen_range(range.clone())
                }
            };
            out.push(port);
        }
        out
    }

    /// Return a port to the pool.  The name-keyed reservation is kept and
    /// marked closed so the same proxy can reclaim it.
    pub fn release(&self, proxy_name: &str, port: u16) {
        let mut inner = self.inner.lock().unwrap();
        inner.used.remove(&port);
        if let Some(ctx) = inner.reserved.get_mut(proxy_name) {
            ctx.closed = true;
            ctx.update_time = Instant::now();
        }
    }

    pub fn used_count(&self) -> usize {
        self.inner.lock().unwrap().used.len()
    }

    /// Drop reservations that have been closed for longer than the TTL.
    pub fn sweep(&self, ttl: Duration) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.reserved.len();
        inner
            .reserved
            .retain(|_, ctx| !(ctx.closed && ctx.update_time.elapsed() > ttl));
        before - inner.reserved.len()
    }

    /// Hourly GC task; runs until cancelled.
    pub fn spawn_gc(self: &Arc<Self>, cancel: CancellationToken) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(GC_PERIOD) => {}
                }
                let removed = manager.sweep(RESERVATION_TTL);
                if removed > 0 {
                    debug!("port gc removed {removed} stale reservations");
                }
            }
        });
    }
}

impl Inner {
    fn grant(&mut self, proxy_name: &str, port: u16) {
        self.used.insert(port);
        self.reserved.insert(
            proxy_name.to_string(),
            PortCtx {
                port,
                closed: false,
                update_time: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(allow: &str) -> PortManager {
        let ranges = if allow.is_empty() {
            None
        } else {
            Some(crate::config::parse_port_ranges(allow).unwrap())
        };
        PortManager::new(NetType::Tcp, "127.0.0.1", ranges)
    }

    #[test]
    fn test_explicit_port_lifecycle() {
        let pm = manager("20000-21000");
        let port = pm.acquire("p1", 20100).unwrap();
        assert_eq!(port, 20100);
        assert_eq!(pm.used_count(), 1);

        // Same port again: refused while in use.
        match pm.acquire("p2", 20100) {
            Err(ServerError::PortUnavailable(20100)) => {}
            other => panic!("unexpected: {other:?}"),
        }

        pm.release("p1", 20100);
        assert_eq!(pm.used_count(), 0);
        assert_eq!(pm.acquire("p2", 20100).unwrap(), 20100);
    }

    #[test]
    fn test_forbidden_port() {
        let pm = manager("20000-21000");
        match pm.acquire("p1", 19999) {
            Err(ServerError::PortForbidden(19999)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_reacquire_prefers_previous_port() {
        let pm = manager("22000-23000");
        let first = pm.acquire("sticky", 0).unwrap();
        pm.release("sticky", first);
        let second = pm.acquire("sticky", 0).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let pm = manager("24000-25000");
        let port = pm.acquire("gone", 0).unwrap();
        pm.release("gone", port);

        // Fresh closure survives the sweep.
        assert_eq!(pm.sweep(RESERVATION_TTL), 0);
        // A zero TTL expires it immediately.
        assert_eq!(pm.sweep(Duration::ZERO), 1);
    }

    #[test]
    fn test_open_reservation_survives_sweep() {
        let pm = manager("25500-25600");
        pm.acquire("live", 0).unwrap();
        assert_eq!(pm.sweep(Duration::ZERO), 0);
    }
}
