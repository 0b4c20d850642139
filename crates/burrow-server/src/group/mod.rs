pub mod http;
pub mod tcp;
pub mod tcpmux;

use crate::vhost::CreateConnFn;
use burrow_proto::msg::HealthCheck;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One proxy participating in a group rotation.
pub struct Member {
    pub name: String,
    pub healthy: Arc<AtomicBool>,
}

impl Member {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }
}

/// Round-robin over healthy members; returns the index of the pick.
pub fn next_healthy(members: &[&Member], cursor: &AtomicUsize) -> Option<usize> {
    if members.is_empty() {
        return None;
    }
    for _ in 0..members.len() {
        let idx = cursor.fetch_add(1, Ordering::Relaxed) % members.len();
        if members[idx].healthy.load(Ordering::Relaxed) {
            return Some(idx);
        }
    }
    None
}

/// Server-side backend probing for group members.  The backend lives behind
/// the tunnel, so probes ride a fresh work connection from the owning proxy.
pub fn spawn_health_monitor(
    proxy_name: String,
    check: HealthCheck,
    dial: CreateConnFn,
    healthy: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let interval = Duration::from_secs(check.interval_seconds.max(1));
        let timeout = Duration::from_secs(check.timeout_seconds.max(1));
        let mut failed = 0u32;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            let ok = tokio::time::timeout(timeout, probe(&check, &dial))
                .await
                .unwrap_or(false);
            if ok {
                if failed >= check.max_failed && !healthy.load(Ordering::Relaxed) {
                    info!("proxy [{proxy_name}] back in rotation");
                }
                failed = 0;
                healthy.store(true, Ordering::Relaxed);
            } else {
                failed = failed.saturating_add(1);
                if failed == check.max_failed {
                    info!("proxy [{proxy_name}] failed {failed} health checks, out of rotation");
                }
                if failed >= check.max_failed {
                    healthy.store(false, Ordering::Relaxed);
                }
            }
        }
    });
}

async fn probe(check: &HealthCheck, dial: &CreateConnFn) -> bool {
    let Ok(mut conn) = dial("healthcheck".to_string()).await else {
        return false;
    };
    match check.check_type.as_str() {
        "http" => {
            let path = if check.path.is_empty() { "/" } else { &check.path };
            let request =
                format!("GET {path} HTTP/1.1\r\nHost: healthcheck\r\nConnection: close\r\n\r\n");
            if conn.write_all(request.as_bytes()).await.is_err() {
                return false;
            }
            let mut buf = [0u8; 64];
            let Ok(n) = conn.read(&mut buf).await else {
                return false;
            };
            let line = String::from_utf8_lossy(&buf[..n]);
            let ok = line
                .split_whitespace()
                .nth(1)
                .map(|code| code.starts_with('2'))
                .unwrap_or(false);
            if !ok {
                debug!("health check got non-2xx: {}", line.lines().next().unwrap_or(""));
            }
            ok
        }
        // "tcp": reaching the backend at all is the success signal.
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_healthy_round_robin() {
        let a = Member::new("a");
        let b = Member::new("b");
        let members = [&a, &b];
        let cursor = AtomicUsize::new(0);
        let picks: Vec<usize> = (0..4)
            .map(|_| next_healthy(&members, &cursor).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_next_healthy_skips_sick_members() {
        let a = Member::new("a");
        let b = Member::new("b");
        b.healthy.store(false, Ordering::Relaxed);
        let members = [&a, &b];
        let cursor = AtomicUsize::new(0);
        for _ in 0..4 {
            assert_eq!(next_healthy(&members, &cursor), Some(0));
        }
        b.healthy.store(true, Ordering::Relaxed);
        a.healthy.store(false, Ordering::Relaxed);
        assert_eq!(next_healthy(&members, &cursor), Some(1));
    }

    #[test]
    fn test_next_healthy_none_when_all_down() {
        let a = Member::new("a");
        a.healthy.store(false, Ordering::Relaxed);
        let members = [&a];
        let cursor = AtomicUsize::new(0);
        assert_eq!(next_healthy(&members, &cursor), None);
        assert_eq!(next_healthy(&[], &cursor), None);
    }
}
