//! In-memory server metrics behind a process-wide collector.
//!
//! The collector is installed once at startup; everything else reaches it
//! through [`collector()`].  Tests run against the no-op default unless they
//! install the memory implementation themselves.

use chrono::{Local, NaiveDate};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

/// How many days of per-day traffic counters are kept.
pub const RESERVE_DAYS: usize = 7;

#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_traffic_in: i64,
    pub total_traffic_out: i64,
    pub cur_conns: i64,
    pub client_counts: i64,
    pub proxy_type_counts: HashMap<String, i64>,
}

pub trait Collector: Send + Sync {
    fn new_client(&self);
    fn close_client(&self);
    fn new_proxy(&self, name: &str, proxy_type: &str);
    fn close_proxy(&self, name: &str, proxy_type: &str);
    fn open_connection(&self, name: &str);
    fn close_connection(&self, name: &str);
    fn add_traffic_in(&self, name: &str, bytes: i64);
    fn add_traffic_out(&self, name: &str, bytes: i64);
    fn server_stats(&self) -> ServerStats;
}

struct NoopCollector;

impl Collector for NoopCollector {
    fn new_client(&self) {}
    fn close_client(&self) {}
    fn new_proxy(&self, _: &str, _: &str) {}
    fn close_proxy(&self, _: &str, _: &str) {}
    fn open_connection(&self, _: &str) {}
    fn close_connection(&self, _: &str) {}
    fn add_traffic_in(&self, _: &str, _: i64) {}
    fn add_traffic_out(&self, _: &str, _: i64) {}
    fn server_stats(&self) -> ServerStats {
        ServerStats::default()
    }
}

static COLLECTOR: OnceLock<Arc<dyn Collector>> = OnceLock::new();

/// Install the process collector.  Returns false if one is already set.
pub fn set_collector(collector: Arc<dyn Collector>) -> bool {
    COLLECTOR.set(collector).is_ok()
}

pub fn collector() -> Arc<dyn Collector> {
    COLLECTOR
        .get_or_init(|| Arc::new(NoopCollector))
        .clone()
}

/// Per-day counter over a circular buffer of `reserve_days` slots.  The
/// buffer rotates lazily on access, so idle days cost nothing.
pub struct DateCounter {
    inner: Mutex<DateCounterState>,
}

struct DateCounterState {
    counts: Vec<i64>,
    last_update: NaiveDate,
}

impl DateCounter {
    pub fn new(reserve_days: usize) -> Self {
        let reserve_days = reserve_days.max(1);
        Self {
            inner: Mutex::new(DateCounterState {
                counts: vec![0; reserve_days],
                last_update: Local::now().date_naive(),
            }),
        }
    }

    pub fn inc(&self, n: i64) {
        self.inc_at(n, Local::now().date_naive());
    }

    fn inc_at(&self, n: i64, today: NaiveDate) {
        let mut state = self.inner.lock().unwrap();
        state.rotate(today);
        let last = state.counts.len() - 1;
        state.counts[last] += n;
    }

    pub fn today_count(&self) -> i64 {
        self.today_count_at(Local::now().date_naive())
    }

    fn today_count_at(&self, today: NaiveDate) -> i64 {
        let mut state = self.inner.lock().unwrap();
        state.rotate(today);
        *state.counts.last().unwrap()
    }

    /// Counters for the last `days` days, oldest first.
    pub fn last_days(&self, days: usize) -> Vec<i64> {
        let mut state = self.inner.lock().unwrap();
        state.rotate(Local::now().date_naive());
        let len = state.counts.len();
        let days = days.min(len);
        state.counts[len - days..].to_vec()
    }
}

impl DateCounterState {
    fn rotate(&mut self, today: NaiveDate) {
        let elapsed = (today - self.last_update).num_days();
        if elapsed <= 0 {
            return;
        }
        let len = self.counts.len();
        if elapsed as usize >= len {
            self.counts.iter_mut().for_each(|c| *c = 0);
        } else {
            self.counts.rotate_left(elapsed as usize);
            for c in &mut self.counts[len - elapsed as usize..] {
                *c = 0;
            }
        }
        self.last_update = today;
    }
}

struct ProxyStats {
    proxy_type: String,
    traffic_in: DateCounter,
    traffic_out: DateCounter,
    cur_conns: i64,
    closed: bool,
}

/// The in-memory implementation used by the running server.
pub struct MemCollector {
    state: Mutex<MemState>,
    total_traffic_in: DateCounter,
    total_traffic_out: DateCounter,
}

#[derive(Default)]
struct MemState {
    client_counts: i64,
    cur_conns: i64,
    proxies: HashMap<String, ProxyStats>,
}

impl MemCollector {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemState::default()),
            total_traffic_in: DateCounter::new(RESERVE_DAYS),
            total_traffic_out: DateCounter::new(RESERVE_DAYS),
        }
    }
}

impl Default for MemCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for MemCollector {
    fn new_client(&self) {
        self.state.lock().unwrap().client_counts += 1;
    }

    fn close_client(&self) {
        let mut state = self.state.lock().unwrap();
        state.client_counts = (state.client_counts - 1).max(0);
    }

    fn new_proxy(&self, name: &str, proxy_type: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .proxies
            .entry(name.to_string())
            .and_modify(|p| p.closed = false)
            .or_insert_with(|| ProxyStats {
                proxy_type: proxy_type.to_string(),
                traffic_in: DateCounter::new(RESERVE_DAYS),
                traffic_out: DateCounter::new(RESERVE_DAYS),
                cur_conns: 0,
                closed: false,
            });
    }

    fn close_proxy(&self, name: &str, _proxy_type: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(p) = state.proxies.get_mut(name) {
            p.closed = true;
        }
    }

    fn open_connection(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.cur_conns += 1;
        if let Some(p) = state.proxies.get_mut(name) {
            p.cur_conns += 1;
        }
    }

    fn close_connection(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.cur_conns = (state.cur_conns - 1).max(0);
        if let Some(p) = state.proxies.get_mut(name) {
            p.cur_conns = (p.cur_conns - 1).max(0);
        }
    }

    fn add_traffic_in(&self, name: &str, bytes: i64) {
        self.total_traffic_in.inc(bytes);
        let state = self.state.lock().unwrap();
        if let Some(p) = state.proxies.get(name) {
            p.traffic_in.inc(bytes);
        }
    }

    fn add_traffic_out(&self, name: &str, bytes: i64) {
        self.total_traffic_out.inc(bytes);
        let state = self.state.lock().unwrap();
        if let Some(p) = state.proxies.get(name) {
            p.traffic_out.inc(bytes);
        }
    }

    fn server_stats(&self) -> ServerStats {
        let state = self.state.lock().unwrap();
        let mut proxy_type_counts: HashMap<String, i64> = HashMap::new();
        for p in state.proxies.values().filter(|p| !p.closed) {
            *proxy_type_counts.entry(p.proxy_type.clone()).or_default() += 1;
        }
        ServerStats {
            total_traffic_in: self.total_traffic_in.today_count(),
            total_traffic_out: self.total_traffic_out.today_count(),
            cur_conns: state.cur_conns,
            client_counts: state.client_counts,
            proxy_type_counts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Days;

    #[test]
    fn test_date_counter_rotation() {
        let counter = DateCounter::new(3);
        let day0 = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        counter.inner.lock().unwrap().last_update = day0;

        counter.inc_at(10, day0);
        assert_eq!(counter.today_count_at(day0), 10);

        // Next day starts at zero, history shifts.
        let day1 = day0.checked_add_days(Days::new(1)).unwrap();
        assert_eq!(counter.today_count_at(day1), 0);
        counter.inc_at(5, day1);
        assert_eq!(counter.today_count_at(day1), 5);

        // Jumping past the whole window clears everything.
        let day9 = day0.checked_add_days(Days::new(9)).unwrap();
        assert_eq!(counter.today_count_at(day9), 0);
        let state = counter.inner.lock().unwrap();
        assert!(state.counts.iter().all(|&c| c == 0));
    }

    #[test]
    fn test_mem_collector_stats() {
        let collector = MemCollector::new();
        collector.new_client();
        collector.new_proxy("a", "tcp");
        collector.new_proxy("b", "http");
        collector.open_connection("a");
        collector.add_traffic_in("a", 100);
        collector.add_traffic_out("a", 40);

        let stats = collector.server_stats();
        assert_eq!(stats.client_counts, 1);
        assert_eq!(stats.cur_conns, 1);
        assert_eq!(stats.total_traffic_in, 100);
        assert_eq!(stats.total_traffic_out, 40);
        assert_eq!(stats.proxy_type_counts.get("tcp"), Some(&1));
        assert_eq!(stats.proxy_type_counts.get("http"), Some(&1));

        collector.close_proxy("b", "http");
        let stats = collector.server_stats();
        assert_eq!(stats.proxy_type_counts.get("http"), None);

        collector.close_connection("a");
        collector.close_client();
        let stats = collector.server_stats();
        assert_eq!(stats.cur_conns, 0);
        assert_eq!(stats.client_counts, 0);
    }
}
