use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the main listener binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    /// KCP front door; 0 disables it.
    #[serde(default)]
    pub kcp_bind_port: u16,
    /// QUIC front door; 0 disables it.
    #[serde(default)]
    pub quic_bind_port: u16,
    /// Address proxy listeners bind to; defaults to `bind_addr`.
    #[serde(default)]
    pub proxy_bind_addr: String,
    /// Shared HTTP vhost port; 0 disables http proxies.
    #[serde(default)]
    pub vhost_http_port: u16,
    /// Response-header timeout of the vhost HTTP reverse proxy, seconds.
    #[serde(default = "default_vhost_http_timeout")]
    pub vhost_http_timeout: u64,
    /// Shared HTTPS (SNI-routed) vhost port; 0 disables https proxies.
    #[serde(default)]
    pub vhost_https_port: u16,
    /// HTTP-CONNECT multiplexed TCP port; 0 disables tcpmux proxies.
    #[serde(default)]
    pub tcpmux_httpconnect_port: u16,
    /// Forward the CONNECT preface to the backend instead of answering it.
    #[serde(default)]
    pub tcpmux_passthrough: bool,
    /// Domain that subdomain proxies are projected under.
    #[serde(default)]
    pub subdomain_host: String,
    /// Path of a custom 404 page for the HTTP reverse proxy.
    #[serde(default)]
    pub custom_404_page: PathBuf,
    /// Ports clients may reserve, e.g. "2000-3000,3001".  Empty allows all.
    #[serde(default)]
    pub allow_ports: String,
    #[serde(default = "default_max_pool_count")]
    pub max_pool_count: usize,
    /// 0 means unlimited.
    #[serde(default)]
    pub max_ports_per_client: usize,
    /// Seconds to wait for an on-demand work connection.
    #[serde(default = "default_user_conn_timeout")]
    pub user_conn_timeout: u64,
    #[serde(default = "default_detailed_errors")]
    pub detailed_errors_to_client: bool,
    #[serde(default = "default_nathole_reserve_hours")]
    pub nathole_analysis_data_reserve_hours: u64,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub web_server: WebServerConfig,
    #[serde(default)]
    pub ssh_tunnel_gateway: SshGatewayConfig,
    #[serde(default)]
    pub http_plugins: Vec<HttpPluginConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Only "token" is supported.
    #[serde(default = "default_auth_method")]
    pub method: String,
    #[serde(default)]
    pub token: String,
    /// Extra scopes that also carry credentials: "HeartBeats", "NewWorkConns".
    #[serde(default)]
    pub additional_scopes: Vec<String>,
}

impl AuthConfig {
    pub fn verify_heartbeats(&self) -> bool {
        self.additional_scopes.iter().any(|s| s == "HeartBeats")
    }

    pub fn verify_new_work_conns(&self) -> bool {
        self.additional_scopes.iter().any(|s| s == "NewWorkConns")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Multiplex logical control streams over one physical connection.
    #[serde(default = "default_tcp_mux")]
    pub tcp_mux: bool,
    /// Application-layer heartbeat timeout in seconds.  Unset means 90, or
    /// disabled when tcp_mux is on (the mux keep-alive takes over).
    #[serde(default)]
    pub heartbeat_timeout: Option<i64>,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub quic: QuicConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    /// Refuse control connections that are not TLS-wrapped.
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub cert_file: PathBuf,
    #[serde(default)]
    pub key_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuicConfig {
    #[serde(default = "default_quic_keepalive")]
    pub keepalive_period_secs: u64,
    #[serde(default = "default_quic_idle_timeout")]
    pub max_idle_timeout_secs: u64,
    #[serde(default = "default_quic_max_streams")]
    pub max_incoming_streams: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebServerConfig {
    #[serde(default = "default_web_addr")]
    pub addr: String,
    /// 0 disables the dashboard API.
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshGatewayConfig {
    /// 0 disables the gateway.
    #[serde(default)]
    pub bind_port: u16,
    #[serde(default = "default_ssh_key_path")]
    pub auto_gen_private_key_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpPluginConfig {
    pub name: String,
    /// E.g. "http://127.0.0.1:9000".
    pub addr: String,
    #[serde(default)]
    pub path: String,
    /// Hook ops this plugin subscribes to: Login, NewProxy, CloseProxy,
    /// Ping, NewWorkConn, NewUserConn.
    pub ops: Vec<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_bind_port() -> u16 {
    7000
}

fn default_vhost_http_timeout() -> u64 {
    60
}

fn default_max_pool_count() -> usize {
    5
}

fn default_user_conn_timeout() -> u64 {
    10
}

fn default_detailed_errors() -> bool {
    true
}

fn default_nathole_reserve_hours() -> u64 {
    168
}

fn default_auth_method() -> String {
    "token".to_string()
}

fn default_tcp_mux() -> bool {
    true
}

fn default_quic_keepalive() -> u64 {
    10
}

fn default_quic_idle_timeout() -> u64 {
    30
}

fn default_quic_max_streams() -> u32 {
    100_000
}

fn default_web_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_ssh_key_path() -> PathBuf {
    PathBuf::from("./.autogen_ssh_key")
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            method: default_auth_method(),
            token: String::new(),
            additional_scopes: Vec::new(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tcp_mux: default_tcp_mux(),
            heartbeat_timeout: None,
            tls: TlsConfig::default(),
            quic: QuicConfig::default(),
        }
    }
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            keepalive_period_secs: default_quic_keepalive(),
            max_idle_timeout_secs: default_quic_idle_timeout(),
            max_incoming_streams: default_quic_max_streams(),
        }
    }
}

impl Default for WebServerConfig {
    fn default() -> Self {
        Self {
            addr: default_web_addr(),
            port: 0,
            user: String::new(),
            password: String::new(),
        }
    }
}

impl Default for SshGatewayConfig {
    fn default() -> Self {
        Self {
            bind_port: 0,
            auto_gen_private_key_path: default_ssh_key_path(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        // serde fills every field, so defaults come from one place only.
        toml::from_str("").expect("empty config must deserialize")
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&content)?;
        config.complete();
        config.validate()?;
        Ok(config)
    }

    /// Fill derived fields after deserialization.
    pub fn complete(&mut self) {
        if self.proxy_bind_addr.is_empty() {
            self.proxy_bind_addr = self.bind_addr.clone();
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.auth.method != "token" {
            anyhow::bail!("unsupported auth method: {}", self.auth.method);
        }
        for scope in &self.auth.additional_scopes {
            if scope != "HeartBeats" && scope != "NewWorkConns" {
                anyhow::bail!("unknown auth scope: {scope}");
            }
        }
        if self.tcpmux_passthrough && self.tcpmux_httpconnect_port == 0 {
            anyhow::bail!("tcpmux_passthrough requires tcpmux_httpconnect_port");
        }
        if !self.allow_ports.is_empty() {
            parse_port_ranges(&self.allow_ports)
                .map_err(|e| anyhow::anyhow!("invalid allow_ports: {e}"))?;
        }
        for plugin in &self.http_plugins {
            for op in &plugin.ops {
                const KNOWN: [&str; 6] = [
                    "Login",
                    "NewProxy",
                    "CloseProxy",
                    "Ping",
                    "NewWorkConn",
                    "NewUserConn",
                ];
                if !KNOWN.contains(&op.as_str()) {
                    anyhow::bail!("plugin {}: unknown op {op}", plugin.name);
                }
            }
        }
        Ok(())
    }

    /// Parsed allow-list; `None` when every port is acceptable.
    pub fn allow_port_ranges(&self) -> Option<Vec<RangeInclusive<u16>>> {
        if self.allow_ports.is_empty() {
            None
        } else {
            // Validated at load time.
            Some(parse_port_ranges(&self.allow_ports).unwrap_or_default())
        }
    }

    /// Effective heartbeat timeout: explicit value wins, otherwise disabled
    /// under tcp_mux (mux keep-alive covers liveness) and 90 s without it.
    pub fn effective_heartbeat_timeout(&self) -> i64 {
        match self.transport.heartbeat_timeout {
            Some(v) => v,
            None if self.transport.tcp_mux => -1,
            None => 90,
        }
    }
}

/// Parse "2000-3000,3001,4000-4010" into inclusive ranges.
pub fn parse_port_ranges(spec: &str) -> std::result::Result<Vec<RangeInclusive<u16>>, String> {
    let mut ranges = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err("empty range element".to_string());
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u16 = lo.trim().parse().map_err(|_| format!("bad port: {lo}"))?;
                let hi: u16 = hi.trim().parse().map_err(|_| format!("bad port: {hi}"))?;
                if hi < lo {
                    return Err(format!("range {part} is inverted"));
                }
                ranges.push(lo..=hi);
            }
            None => {
                let p: u16 = part.parse().map_err(|_| format!("bad port: {part}"))?;
                ranges.push(p..=p);
            }
        }
    }
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0");
        assert_eq!(config.bind_port, 7000);
        assert_eq!(config.max_pool_count, 5);
        assert_eq!(config.user_conn_timeout, 10);
        assert!(config.detailed_errors_to_client);
        assert!(config.transport.tcp_mux);
        assert_eq!(config.vhost_http_timeout, 60);
        assert_eq!(config.effective_heartbeat_timeout(), -1);
    }

    #[test]
    fn test_heartbeat_defaults_without_mux() {
        let mut config = ServerConfig::default();
        config.transport.tcp_mux = false;
        assert_eq!(config.effective_heartbeat_timeout(), 90);
        config.transport.heartbeat_timeout = Some(30);
        assert_eq!(config.effective_heartbeat_timeout(), 30);
    }

    #[test]
    fn test_parse_port_ranges() {
        let ranges = parse_port_ranges("2000-3000, 3001,4000-4010").unwrap();
        assert_eq!(ranges.len(), 3);
        assert!(ranges[0].contains(&2500));
        assert!(ranges[1].contains(&3001));
        assert!(!ranges[2].contains(&4011));

        assert!(parse_port_ranges("3000-2000").is_err());
        assert!(parse_port_ranges("abc").is_err());
        assert!(parse_port_ranges("").is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let toml_src = r#"
            bind_port = 7100
            allow_ports = "6000-7000"

            [auth]
            token = "s3cret"
            additional_scopes = ["HeartBeats"]

            [transport]
            tcp_mux = false

            [[http_plugins]]
            name = "gate"
            addr = "http://127.0.0.1:9000"
            ops = ["Login"]
        "#;
        let mut config: ServerConfig = toml::from_str(toml_src).unwrap();
        config.complete();
        config.validate().unwrap();
        assert_eq!(config.bind_port, 7100);
        assert_eq!(config.proxy_bind_addr, "0.0.0.0");
        assert!(config.auth.verify_heartbeats());
        assert!(!config.auth.verify_new_work_conns());
        assert_eq!(config.http_plugins.len(), 1);
    }

    #[test]
    fn test_validate_rejects_unknown_scope() {
        let mut config = ServerConfig::default();
        config.auth.additional_scopes = vec!["Everything".to_string()];
        assert!(config.validate().is_err());
    }
}
