//! NAT-hole rendezvous.
//!
//! XTCP hosts enrol here; a visitor request is paired with its host over
//! the two control connections, the analyzer picks a punching plan from the
//! observed NAT features, and both sides receive matching instructions.
//! Reports of the outcome feed back into per-pair scoring.

use crate::error::{Result, ServerError};
use crate::transport::MessageTransporter;
use crate::util::{host_from_addr, rand_id};
use burrow_proto::auth;
use burrow_proto::msg::{
    kind, DetectBehavior, Message, NatFeature, NatHoleClient, NatHoleReport, NatHoleResp,
    NatHoleVisitor,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long the host side has to answer the pairing request.
const PAIR_TIMEOUT: Duration = Duration::from_secs(3);
/// How long a finished session stays correlatable for reports.
const SESSION_TTL: Duration = Duration::from_secs(600);
const GC_PERIOD: Duration = Duration::from_secs(600);

pub const NAT_TYPE_EASY: &str = "EasyNAT";
pub const NAT_TYPE_HARD: &str = "HardNAT";
pub const ROLE_SENDER: &str = "sender";
pub const ROLE_RECEIVER: &str = "receiver";

const SCORE_MIN: i32 = -10;
const SCORE_MAX: i32 = 10;

struct ClientCfg {
    sk: String,
    owner_user: String,
    allow_users: Vec<String>,
    transporter: Arc<MessageTransporter>,
}

struct SessionRecord {
    analysis_key: String,
    mode: u8,
    index: u8,
    created: Instant,
}

pub struct NatHoleController {
    client_cfgs: Mutex<HashMap<String, ClientCfg>>,
    sessions: Mutex<HashMap<String, SessionRecord>>,
    analyzer: Analyzer,
}

impl NatHoleController {
    pub fn new(data_reserve: Duration) -> Self {
        Self {
            client_cfgs: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            analyzer: Analyzer::new(data_reserve),
        }
    }

    /// Enrol an xtcp proxy as a punchable host.
    pub fn register_client(
        &self,
        proxy_name: &str,
        sk: &str,
        owner_user: &str,
        allow_users: &[String],
        transporter: Arc<MessageTransporter>,
    ) -> Result<()> {
        let mut cfgs = self.client_cfgs.lock().unwrap();
        if cfgs.contains_key(proxy_name) {
            return Err(ServerError::DuplicateName(proxy_name.to_string()));
        }
        cfgs.insert(
            proxy_name.to_string(),
            ClientCfg {
                sk: sk.to_string(),
                owner_user: owner_user.to_string(),
                allow_users: allow_users.to_vec(),
                transporter,
            },
        );
        Ok(())
    }

    pub fn unregister_client(&self, proxy_name: &str) {
        self.client_cfgs.lock().unwrap().remove(proxy_name);
    }

    /// Full pairing flow, driven by the visitor's control connection.
    pub async fn handle_visitor(
        &self,
        visitor: NatHoleVisitor,
        visitor_transporter: Arc<MessageTransporter>,
    ) {
        let transaction_id = visitor.transaction_id.clone();
        if let Err(e) = self.pair(&visitor, &visitor_transporter).await {
            warn!("nathole pairing for [{}] failed: {e}", visitor.proxy_name);
            let _ = visitor_transporter.send(Message::NatHoleResp(NatHoleResp {
                transaction_id,
                error: e.to_string(),
                ..NatHoleResp::default()
            }));
        }
    }

    async fn pair(
        &self,
        visitor: &NatHoleVisitor,
        visitor_transporter: &Arc<MessageTransporter>,
    ) -> Result<()> {
        let (sid, host_transporter) = {
            let cfgs = self.client_cfgs.lock().unwrap();
            let cfg = cfgs
                .get(&visitor.proxy_name)
                .ok_or(ServerError::NoRouteFound)?;

            let expected = auth::auth_key(&cfg.sk, visitor.timestamp);
            if !auth::constant_time_eq(&expected, &visitor.sign_key) {
                return Err(ServerError::AuthFailed(
                    "visitor secret key does not match".to_string(),
                ));
            }
            let allowed = if cfg.allow_users.is_empty() {
                visitor.user == cfg.owner_user
            } else {
                cfg.allow_users
                    .iter()
                    .any(|u| u == "*" || *u == visitor.user)
            };
            if !allowed {
                return Err(ServerError::AuthFailed(format!(
                    "user [{}] is not allowed",
                    visitor.user
                )));
            }
            (rand_id(), Arc::clone(&cfg.transporter))
        };

        // Ask the host for its NAT feature and mapped addresses.
        let request = Message::NatHoleClient(NatHoleClient {
            transaction_id: rand_id(),
            proxy_name: visitor.proxy_name.clone(),
            sid: sid.clone(),
            ..NatHoleClient::default()
        });
        let reply = host_transporter
            .request(request, kind::NAT_HOLE_CLIENT, &sid, PAIR_TIMEOUT)
            .await
            .map_err(|_| {
                ServerError::ResourceUnavailable("host did not answer the pairing".to_string())
            })?;
        let host = match reply {
            Message::NatHoleClient(m) => m,
            _ => return Err(ServerError::ProtocolViolation("unexpected reply".to_string())),
        };

        let analysis_key = analysis_key(&visitor.mapped_addrs, &host.mapped_addrs);
        let plan = self
            .analyzer
            .recommend(&analysis_key, &visitor.nat_feature, &host.nat_feature);
        info!(
            "nathole [{}] sid {sid}: mode {} index {}",
            visitor.proxy_name, plan.mode, plan.index
        );

        self.sessions.lock().unwrap().insert(
            sid.clone(),
            SessionRecord {
                analysis_key,
                mode: plan.mode,
                index: plan.index,
                created: Instant::now(),
            },
        );

        visitor_transporter.send(Message::NatHoleResp(NatHoleResp {
            transaction_id: visitor.transaction_id.clone(),
            sid: sid.clone(),
            protocol: visitor.protocol.clone(),
            candidate_addrs: host.mapped_addrs.clone(),
            assisted_addrs: host.assisted_addrs.clone(),
            detect_behavior: plan.visitor_behavior.clone(),
            error: String::new(),
        }))?;
        host_transporter.send(Message::NatHoleResp(NatHoleResp {
            transaction_id: host.transaction_id.clone(),
            sid,
            protocol: visitor.protocol.clone(),
            candidate_addrs: visitor.mapped_addrs.clone(),
            assisted_addrs: visitor.assisted_addrs.clone(),
            detect_behavior: plan.host_behavior.clone(),
            error: String::new(),
        }))?;
        Ok(())
    }

    pub fn handle_report(&self, report: &NatHoleReport) {
        let sessions = self.sessions.lock().unwrap();
        let Some(record) = sessions.get(&report.sid) else {
            debug!("nathole report for unknown sid {}", report.sid);
            return;
        };
        self.analyzer
            .report(&record.analysis_key, record.mode, record.index, report.success);
    }

    pub fn spawn_gc(self: &Arc<Self>, cancel: CancellationToken) {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(GC_PERIOD) => {}
                }
                controller
                    .sessions
                    .lock()
                    .unwrap()
                    .retain(|_, s| s.created.elapsed() < SESSION_TTL);
                controller.analyzer.sweep();
            }
        });
    }

}

fn analysis_key(visitor_addrs: &[String], host_addrs: &[String]) -> String {
    let v = visitor_addrs
        .first()
        .map(|a| host_from_addr(a))
        .unwrap_or("");
    let h = host_addrs.first().map(|a| host_from_addr(a)).unwrap_or("");
    format!("{v}+{h}")
}

/// One recommended plan for both peers.
pub struct Plan {
    pub mode: u8,
    pub index: u8,
    pub visitor_behavior: DetectBehavior,
    pub host_behavior: DetectBehavior,
}

struct PairRecords {
    scores: HashMap<(u8, u8), i32>,
    last_update: Instant,
}

pub struct Analyzer {
    records: Mutex<HashMap<String, PairRecords>>,
    data_reserve: Duration,
}

impl Analyzer {
    pub fn new(data_reserve: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            data_reserve,
        }
    }

    /// Pick the best-scoring candidate plan for this address pair.
    pub fn recommend(&self, key: &str, visitor: &NatFeature, host: &NatFeature) -> Plan {
        let candidates = candidates(visitor, host);
        let records = self.records.lock().unwrap();
        let best = candidates
            .iter()
            .max_by_key(|(mode, index)| {
                records
                    .get(key)
                    .and_then(|r| r.scores.get(&(*mode, *index)))
                    .copied()
                    .unwrap_or(0)
            })
            .copied()
            .unwrap_or((0, 0));
        build_plan(best.0, best.1, visitor, host)
    }

    /// Fold one punching outcome into the pair's score.
    pub fn report(&self, key: &str, mode: u8, index: u8, success: bool) {
        let mut records = self.records.lock().unwrap();
        let entry = records.entry(key.to_string()).or_insert_with(|| PairRecords {
            scores: HashMap::new(),
            last_update: Instant::now(),
        });
        entry.last_update = Instant::now();
        let score = entry.scores.entry((mode, index)).or_insert(0);
        *score = (*score + if success { 1 } else { -1 }).clamp(SCORE_MIN, SCORE_MAX);
    }

    pub fn sweep(&self) {
        let reserve = self.data_reserve;
        self.records
            .lock()
            .unwrap()
            .retain(|_, r| r.last_update.elapsed() < reserve);
    }

    #[cfg(test)]
    fn score(&self, key: &str, mode: u8, index: u8) -> i32 {
        self.records
            .lock()
            .unwrap()
            .get(key)
            .and_then(|r| r.scores.get(&(mode, index)))
            .copied()
            .unwrap_or(0)
    }
}

fn is_hard(f: &NatFeature) -> bool {
    f.nat_type == NAT_TYPE_HARD && !f.public_network
}

/// Candidate (mode, index) pairs for the observed NAT combination.  Index
/// selects which side sends: 0 makes the visitor the sender, 1 the host.
fn candidates(visitor: &NatFeature, host: &NatFeature) -> Vec<(u8, u8)> {
    match (is_hard(visitor), is_hard(host)) {
        // Two easy NATs punch with the simple exchange, either direction.
        (false, false) => vec![(0, 0), (0, 1)],
        // One hard side: the hard side's port behavior picks the mode, and
        // the easy side does the low-TTL receiving.
        (true, false) => {
            let mode = if visitor.regular_ports_change { 1 } else { 2 };
            vec![(mode, 0), (0, 0)]
        }
        (false, true) => {
            let mode = if host.regular_ports_change { 1 } else { 2 };
            vec![(mode, 1), (0, 1)]
        }
        // Hard against hard.
        (true, true) => {
            if visitor.regular_ports_change && host.regular_ports_change {
                vec![(3, 0), (3, 1)]
            } else if visitor.regular_ports_change {
                vec![(4, 0)]
            } else if host.regular_ports_change {
                vec![(4, 1)]
            } else {
                vec![(3, 0), (3, 1)]
            }
        }
    }
}

fn build_plan(mode: u8, index: u8, _visitor: &NatFeature, _host: &NatFeature) -> Plan {
    let (mut sender, mut receiver) = behaviors_for_mode(mode);
    sender.mode = mode;
    receiver.mode = mode;
    sender.role = ROLE_SENDER.to_string();
    receiver.role = ROLE_RECEIVER.to_string();
    let (visitor_behavior, host_behavior) = if index == 0 {
        (sender, receiver)
    } else {
        (receiver, sender)
    };
    Plan {
        mode,
        index,
        visitor_behavior,
        host_behavior,
    }
}

/// Tunable punching parameters per mode; the pairing protocol and score
/// bounds are the stable part.
fn behaviors_for_mode(mode: u8) -> (DetectBehavior, DetectBehavior) {
    let mut sender = DetectBehavior {
        send_delay_ms: 100,
        ..DetectBehavior::default()
    };
    let mut receiver = DetectBehavior {
        ttl: 3,
        ..DetectBehavior::default()
    };
    match mode {
        1 => {
            receiver.ports_range_number = 10;
        }
        2 => {
            receiver.listen_random_ports = 50;
            sender.ports_random_number = 50;
        }
        3 => {
            sender.ports_range_number = 10;
            receiver.ports_range_number = 10;
        }
        4 => {
            receiver.listen_random_ports = 50;
            receiver.ttl = 3;
            sender.ports_random_number = 50;
            sender.send_delay_ms = 200;
        }
        _ => {}
    }
    (sender, receiver)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn easy() -> NatFeature {
        NatFeature {
            nat_type: NAT_TYPE_EASY.to_string(),
            ..NatFeature::default()
        }
    }

    fn hard(regular: bool) -> NatFeature {
        NatFeature {
            nat_type: NAT_TYPE_HARD.to_string(),
            regular_ports_change: regular,
            ..NatFeature::default()
        }
    }

    #[test]
    fn test_candidates_cover_modes() {
        assert_eq!(candidates(&easy(), &easy()), vec![(0, 0), (0, 1)]);
        assert_eq!(candidates(&hard(true), &easy())[0], (1, 0));
        assert_eq!(candidates(&hard(false), &easy())[0], (2, 0));
        assert_eq!(candidates(&easy(), &hard(true))[0], (1, 1));
        assert_eq!(candidates(&hard(true), &hard(true))[0].0, 3);
        assert_eq!(candidates(&hard(true), &hard(false)), vec![(4, 0)]);
    }

    #[test]
    fn test_plan_roles_follow_index() {
        let plan = build_plan(0, 0, &easy(), &easy());
        assert_eq!(plan.visitor_behavior.role, ROLE_SENDER);
        assert_eq!(plan.host_behavior.role, ROLE_RECEIVER);
        let plan = build_plan(0, 1, &easy(), &easy());
        assert_eq!(plan.visitor_behavior.role, ROLE_RECEIVER);
        assert_eq!(plan.host_behavior.role, ROLE_SENDER);
    }

    #[test]
    fn test_scores_clamped() {
        let analyzer = Analyzer::new(Duration::from_secs(3600));
        for _ in 0..30 {
            analyzer.report("k", 0, 0, true);
        }
        assert_eq!(analyzer.score("k", 0, 0), SCORE_MAX);
        for _ in 0..60 {
            analyzer.report("k", 0, 0, false);
        }
        assert_eq!(analyzer.score("k", 0, 0), SCORE_MIN);
    }

    #[test]
    fn test_reports_bias_recommendation() {
        let analyzer = Analyzer::new(Duration::from_secs(3600));
        // Index 1 keeps succeeding for this pair; it should win.
        for _ in 0..3 {
            analyzer.report("pair", 0, 1, true);
            analyzer.report("pair", 0, 0, false);
        }
        let plan = analyzer.recommend("pair", &easy(), &easy());
        assert_eq!((plan.mode, plan.index), (0, 1));
    }

    #[test]
    fn test_sweep_expires_records() {
        let analyzer = Analyzer::new(Duration::ZERO);
        analyzer.report("old", 0, 0, true);
        analyzer.sweep();
        assert_eq!(analyzer.score("old", 0, 0), 0);
    }

    #[test]
    fn test_analysis_key_uses_ips() {
        let key = analysis_key(
            &["1.2.3.4:5000".to_string()],
            &["5.6.7.8:6000".to_string()],
        );
        assert_eq!(key, "1.2.3.4+5.6.7.8");
    }

    fn signed_visitor(proxy_name: &str, sk: &str, user: &str) -> NatHoleVisitor {
        let timestamp = crate::util::unix_timestamp();
        NatHoleVisitor {
            transaction_id: "t-visitor".to_string(),
            proxy_name: proxy_name.to_string(),
            user: user.to_string(),
            sign_key: auth::auth_key(sk, timestamp),
            timestamp,
            protocol: "quic".to_string(),
            mapped_addrs: vec!["1.2.3.4:1000".to_string()],
            nat_feature: easy(),
            ..NatHoleVisitor::default()
        }
    }

    #[tokio::test]
    async fn test_pairing_flow_delivers_plans_to_both_sides() {
        let controller = Arc::new(NatHoleController::new(Duration::from_secs(3600)));

        let (host_tx, mut host_rx) = tokio::sync::mpsc::channel(16);
        let host_transporter = Arc::new(MessageTransporter::new(host_tx));
        controller
            .register_client("p", "sk", "owner", &["*".to_string()], Arc::clone(&host_transporter))
            .unwrap();

        let (visitor_tx, mut visitor_rx) = tokio::sync::mpsc::channel(16);
        let visitor_transporter = Arc::new(MessageTransporter::new(visitor_tx));

        let pairing_controller = Arc::clone(&controller);
        let pairing_transporter = Arc::clone(&visitor_transporter);
        let pairing = tokio::spawn(async move {
            pairing_controller
                .handle_visitor(signed_visitor("p", "sk", "anyone"), pairing_transporter)
                .await;
        });

        // The host's control sees the pairing request and replies with its
        // own NAT feature on the same sid lane.
        let request = host_rx.recv().await.unwrap();
        let Message::NatHoleClient(request) = request else {
            panic!("expected NatHoleClient");
        };
        assert_eq!(request.proxy_name, "p");
        let delivered = host_transporter.dispatch(
            Message::NatHoleClient(NatHoleClient {
                transaction_id: "t-host".to_string(),
                proxy_name: "p".to_string(),
                sid: request.sid.clone(),
                mapped_addrs: vec!["5.6.7.8:2000".to_string()],
                nat_feature: easy(),
                ..NatHoleClient::default()
            }),
            &request.sid,
        );
        assert!(delivered);
        pairing.await.unwrap();

        let Message::NatHoleResp(visitor_resp) = visitor_rx.recv().await.unwrap() else {
            panic!("expected NatHoleResp for the visitor");
        };
        assert!(visitor_resp.error.is_empty());
        assert_eq!(visitor_resp.sid, request.sid);
        assert_eq!(visitor_resp.candidate_addrs, vec!["5.6.7.8:2000"]);
        assert_eq!(visitor_resp.protocol, "quic");

        let Message::NatHoleResp(host_resp) = host_rx.recv().await.unwrap() else {
            panic!("expected NatHoleResp for the host");
        };
        assert!(host_resp.error.is_empty());
        assert_eq!(host_resp.candidate_addrs, vec!["1.2.3.4:1000"]);
        // One side sends, the other receives.
        assert_ne!(
            visitor_resp.detect_behavior.role,
            host_resp.detect_behavior.role
        );
    }

    #[tokio::test]
    async fn test_pairing_refuses_bad_secret() {
        let controller = Arc::new(NatHoleController::new(Duration::from_secs(3600)));
        let (host_tx, _host_rx) = tokio::sync::mpsc::channel(16);
        controller
            .register_client(
                "p",
                "sk",
                "owner",
                &[],
                Arc::new(MessageTransporter::new(host_tx)),
            )
            .unwrap();

        let (visitor_tx, mut visitor_rx) = tokio::sync::mpsc::channel(16);
        let visitor_transporter = Arc::new(MessageTransporter::new(visitor_tx));
        controller
            .handle_visitor(signed_visitor("p", "wrong", "owner"), visitor_transporter)
            .await;

        let Message::NatHoleResp(resp) = visitor_rx.recv().await.unwrap() else {
            panic!("expected NatHoleResp");
        };
        assert!(!resp.error.is_empty());
    }
}
