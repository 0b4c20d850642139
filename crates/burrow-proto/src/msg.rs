use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  The server echoes it in LoginResp so clients can refuse to
/// talk to an incompatible peer.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Hard cap on the JSON body of a single message.  Anything larger is a
/// protocol violation and closes the connection.
pub const MAX_MSG_LENGTH: u64 = 10 * 1024;

/// One-byte type tags.  This is a closed set shared by client and server;
/// the values are stable wire constants.
pub mod kind {
    pub const LOGIN: u8 = b'o';
    pub const LOGIN_RESP: u8 = b'1';
    pub const NEW_PROXY: u8 = b'p';
    pub const NEW_PROXY_RESP: u8 = b'2';
    pub const CLOSE_PROXY: u8 = b'c';
    pub const NEW_WORK_CONN: u8 = b'w';
    pub const REQ_WORK_CONN: u8 = b'r';
    pub const START_WORK_CONN: u8 = b's';
    pub const NEW_VISITOR_CONN: u8 = b'v';
    pub const NEW_VISITOR_CONN_RESP: u8 = b'3';
    pub const PING: u8 = b'h';
    pub const PONG: u8 = b'4';
    pub const UDP_PACKET: u8 = b'u';
    pub const NAT_HOLE_VISITOR: u8 = b'i';
    pub const NAT_HOLE_CLIENT: u8 = b'n';
    pub const NAT_HOLE_RESP: u8 = b'm';
    pub const NAT_HOLE_REPORT: u8 = b'6';
}

#[derive(Debug, thiserror::Error)]
pub enum MsgError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("message body of {0} bytes exceeds the {MAX_MSG_LENGTH} byte limit")]
    TooLarge(u64),
    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),
    #[error("malformed message body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Marks special client kinds, e.g. the server's own SSH-gateway bridge.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientSpec {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub always_auth_pass: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Login {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub privilege_key: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub metas: HashMap<String, String>,
    #[serde(default)]
    pub pool_count: usize,
    #[serde(default)]
    pub client_spec: ClientSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoginResp {
    pub version: String,
    pub run_id: String,
    #[serde(default)]
    pub error: String,
}

/// Optional backend health check, configured client-side and enforced by the
/// server-side group controllers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheck {
    /// "tcp" or "http".
    pub check_type: String,
    /// Request path for http checks, e.g. "/healthz".
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_health_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_health_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_health_max_failed")]
    pub max_failed: u32,
}

fn default_health_interval() -> u64 {
    10
}

fn default_health_timeout() -> u64 {
    3
}

fn default_health_max_failed() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NewProxy {
    #[serde(default)]
    pub proxy_name: String,
    #[serde(default)]
    pub proxy_type: String,
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_compression: bool,
    /// E.g. "1MB" or "512KB"; empty means unlimited.
    #[serde(default)]
    pub bandwidth_limit: String,
    /// "client" or "server"; only "server" is acted on here.
    #[serde(default)]
    pub bandwidth_limit_mode: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub group_key: String,

    // tcp / udp
    #[serde(default)]
    pub remote_port: u16,

    // http / https / tcpmux
    #[serde(default)]
    pub custom_domains: Vec<String>,
    #[serde(default)]
    pub subdomain: String,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub http_user: String,
    #[serde(default)]
    pub http_pwd: String,
    #[serde(default)]
    pub host_header_rewrite: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub response_headers: HashMap<String, String>,
    #[serde(default)]
    pub route_by_http_user: String,
    /// tcpmux only; "httpconnect" is the single supported value.
    #[serde(default)]
    pub multiplexer: String,

    // stcp / sudp / xtcp
    #[serde(default)]
    pub sk: String,
    #[serde(default)]
    pub allow_users: Vec<String>,

    #[serde(default)]
    pub metas: HashMap<String, String>,
    #[serde(default)]
    pub health_check: Option<HealthCheck>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NewProxyResp {
    pub proxy_name: String,
    #[serde(default)]
    pub remote_addr: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseProxy {
    pub proxy_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NewWorkConn {
    pub run_id: String,
    #[serde(default)]
    pub privilege_key: String,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReqWorkConn {}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StartWorkConn {
    pub proxy_name: String,
    #[serde(default)]
    pub src_addr: String,
    #[serde(default)]
    pub dst_addr: String,
    #[serde(default)]
    pub src_port: u16,
    #[serde(default)]
    pub dst_port: u16,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NewVisitorConn {
    #[serde(default)]
    pub run_id: String,
    pub proxy_name: String,
    #[serde(default)]
    pub sign_key: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_compression: bool,
    #[serde(default)]
    pub visitor_user: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NewVisitorConnResp {
    pub proxy_name: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Ping {
    #[serde(default)]
    pub privilege_key: String,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Pong {
    #[serde(default)]
    pub error: String,
}

/// One relayed datagram.  The UDP proxy serialises packets as these frames
/// over a single long-lived work connection.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UdpPacket {
    /// Base64-encoded payload.
    pub content: String,
    #[serde(default)]
    pub src_addr: String,
    #[serde(default)]
    pub dst_addr: String,
}

/// NAT classification detected client-side (STUN-assisted) and reported to
/// the rendezvous controller.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct NatFeature {
    /// "EasyNAT" or "HardNAT".
    #[serde(default)]
    pub nat_type: String,
    #[serde(default)]
    pub behavior: String,
    #[serde(default)]
    pub ports_difference: i32,
    #[serde(default)]
    pub regular_ports_change: bool,
    #[serde(default)]
    pub public_network: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NatHoleVisitor {
    #[serde(default)]
    pub transaction_id: String,
    pub proxy_name: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub sign_key: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub mapped_addrs: Vec<String>,
    #[serde(default)]
    pub assisted_addrs: Vec<String>,
    #[serde(default)]
    pub nat_feature: NatFeature,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NatHoleClient {
    #[serde(default)]
    pub transaction_id: String,
    pub proxy_name: String,
    #[serde(default)]
    pub sid: String,
    #[serde(default)]
    pub mapped_addrs: Vec<String>,
    #[serde(default)]
    pub assisted_addrs: Vec<String>,
    #[serde(default)]
    pub nat_feature: NatFeature,
}

/// The hole-punching plan handed to each side.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DetectBehavior {
    /// "sender" or "receiver".
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub mode: u8,
    #[serde(default)]
    pub ttl: u32,
    #[serde(default)]
    pub send_delay_ms: u64,
    #[serde(default)]
    pub ports_range_number: u32,
    #[serde(default)]
    pub ports_random_number: u32,
    #[serde(default)]
    pub listen_random_ports: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NatHoleResp {
    #[serde(default)]
    pub transaction_id: String,
    #[serde(default)]
    pub sid: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub candidate_addrs: Vec<String>,
    #[serde(default)]
    pub assisted_addrs: Vec<String>,
    #[serde(default)]
    pub detect_behavior: DetectBehavior,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NatHoleReport {
    pub sid: String,
    #[serde(default)]
    pub mode: u8,
    #[serde(default)]
    pub success: bool,
}

/// Tagged union over everything that can travel on a control, work, or
/// visitor connection.
#[derive(Debug, Clone)]
pub enum Message {
    Login(Login),
    LoginResp(LoginResp),
    NewProxy(NewProxy),
    NewProxyResp(NewProxyResp),
    CloseProxy(CloseProxy),
    NewWorkConn(NewWorkConn),
    ReqWorkConn(ReqWorkConn),
    StartWorkConn(StartWorkConn),
    NewVisitorConn(NewVisitorConn),
    NewVisitorConnResp(NewVisitorConnResp),
    Ping(Ping),
    Pong(Pong),
    UdpPacket(UdpPacket),
    NatHoleVisitor(NatHoleVisitor),
    NatHoleClient(NatHoleClient),
    NatHoleResp(NatHoleResp),
    NatHoleReport(NatHoleReport),
}

impl Message {
    pub fn type_byte(&self) -> u8 {
        match self {
            Message::Login(_) => kind::LOGIN,
            Message::LoginResp(_) => kind::LOGIN_RESP,
            Message::NewProxy(_) => kind::NEW_PROXY,
            Message::NewProxyResp(_) => kind::NEW_PROXY_RESP,
            Message::CloseProxy(_) => kind::CLOSE_PROXY,
            Message::NewWorkConn(_) => kind::NEW_WORK_CONN,
            Message::ReqWorkConn(_) => kind::REQ_WORK_CONN,
            Message::StartWorkConn(_) => kind::START_WORK_CONN,
            Message::NewVisitorConn(_) => kind::NEW_VISITOR_CONN,
            Message::NewVisitorConnResp(_) => kind::NEW_VISITOR_CONN_RESP,
            Message::Ping(_) => kind::PING,
            Message::Pong(_) => kind::PONG,
            Message::UdpPacket(_) => kind::UDP_PACKET,
            Message::NatHoleVisitor(_) => kind::NAT_HOLE_VISITOR,
            Message::NatHoleClient(_) => kind::NAT_HOLE_CLIENT,
            Message::NatHoleResp(_) => kind::NAT_HOLE_RESP,
            Message::NatHoleReport(_) => kind::NAT_HOLE_REPORT,
        }
    }

    fn body_json(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Message::Login(m) => serde_json::to_vec(m),
            Message::LoginResp(m) => serde_json::to_vec(m),
            Message::NewProxy(m) => serde_json::to_vec(m),
            Message::NewProxyResp(m) => serde_json::to_vec(m),
            Message::CloseProxy(m) => serde_json::to_vec(m),
            Message::NewWorkConn(m) => serde_json::to_vec(m),
            Message::ReqWorkConn(m) => serde_json::to_vec(m),
            Message::StartWorkConn(m) => serde_json::to_vec(m),
            Message::NewVisitorConn(m) => serde_json::to_vec(m),
            Message::NewVisitorConnResp(m) => serde_json::to_vec(m),
            Message::Ping(m) => serde_json::to_vec(m),
            Message::Pong(m) => serde_json::to_vec(m),
            Message::UdpPacket(m) => serde_json::to_vec(m),
            Message::NatHoleVisitor(m) => serde_json::to_vec(m),
            Message::NatHoleClient(m) => serde_json::to_vec(m),
            Message::NatHoleResp(m) => serde_json::to_vec(m),
            Message::NatHoleReport(m) => serde_json::to_vec(m),
        }
    }

    pub fn from_wire(type_byte: u8, body: &[u8]) -> Result<Self, MsgError> {
        let msg = match type_byte {
            kind::LOGIN => Message::Login(serde_json::from_slice(body)?),
            kind::LOGIN_RESP => Message::LoginResp(serde_json::from_slice(body)?),
            kind::NEW_PROXY => Message::NewProxy(serde_json::from_slice(body)?),
            kind::NEW_PROXY_RESP => Message::NewProxyResp(serde_json::from_slice(body)?),
            kind::CLOSE_PROXY => Message::CloseProxy(serde_json::from_slice(body)?),
            kind::NEW_WORK_CONN => Message::NewWorkConn(serde_json::from_slice(body)?),
            kind::REQ_WORK_CONN => Message::ReqWorkConn(serde_json::from_slice(body)?),
            kind::START_WORK_CONN => Message::StartWorkConn(serde_json::from_slice(body)?),
            kind::NEW_VISITOR_CONN => Message::NewVisitorConn(serde_json::from_slice(body)?),
            kind::NEW_VISITOR_CONN_RESP => {
                Message::NewVisitorConnResp(serde_json::from_slice(body)?)
            }
            kind::PING => Message::Ping(serde_json::from_slice(body)?),
            kind::PONG => Message::Pong(serde_json::from_slice(body)?),
            kind::UDP_PACKET => Message::UdpPacket(serde_json::from_slice(body)?),
            kind::NAT_HOLE_VISITOR => Message::NatHoleVisitor(serde_json::from_slice(body)?),
            kind::NAT_HOLE_CLIENT => Message::NatHoleClient(serde_json::from_slice(body)?),
            kind::NAT_HOLE_RESP => Message::NatHoleResp(serde_json::from_slice(body)?),
            kind::NAT_HOLE_REPORT => Message::NatHoleReport(serde_json::from_slice(body)?),
            other => return Err(MsgError::UnknownType(other)),
        };
        Ok(msg)
    }

    /// Frame as `[1-byte type][8-byte big-endian length][JSON body]`.
    pub fn encode(&self) -> Result<Vec<u8>, MsgError> {
        let body = self.body_json()?;
        let mut out = Vec::with_capacity(9 + body.len());
        out.push(self.type_byte());
        out.extend_from_slice(&(body.len() as u64).to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode one message from the front of `data`, returning the message and
    /// the number of bytes consumed.  Errors with `Io(UnexpectedEof)` when the
    /// buffer does not yet hold a complete frame.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), MsgError> {
        if data.len() < 9 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        let len = u64::from_be_bytes(data[1..9].try_into().unwrap());
        if len > MAX_MSG_LENGTH {
            return Err(MsgError::TooLarge(len));
        }
        let len = len as usize;
        if data.len() < 9 + len {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        let msg = Self::from_wire(data[0], &data[9..9 + len])?;
        Ok((msg, 9 + len))
    }
}

/// Read exactly one framed message.
pub async fn read_message<R>(r: &mut R) -> Result<Message, MsgError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 9];
    r.read_exact(&mut header).await?;
    let len = u64::from_be_bytes(header[1..9].try_into().unwrap());
    if len > MAX_MSG_LENGTH {
        return Err(MsgError::TooLarge(len));
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body).await?;
    Message::from_wire(header[0], &body)
}

/// Write one framed message and flush it.
pub async fn write_message<W>(w: &mut W, msg: &Message) -> Result<(), MsgError>
where
    W: AsyncWrite + Unpin,
{
    let encoded = msg.encode()?;
    w.write_all(&encoded).await?;
    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_encode_decode() {
        let msg = Message::Login(Login {
            version: PROTOCOL_VERSION.to_string(),
            user: "alice".to_string(),
            run_id: "abc123".to_string(),
            pool_count: 3,
            ..Login::default()
        });
        let encoded = msg.encode().unwrap();
        assert_eq!(encoded[0], kind::LOGIN);
        let (decoded, len) = Message::decode(&encoded).unwrap();
        assert_eq!(len, encoded.len());
        match decoded {
            Message::Login(m) => {
                assert_eq!(m.user, "alice");
                assert_eq!(m.run_id, "abc123");
                assert_eq!(m.pool_count, 3);
            }
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn test_decode_incomplete_frame() {
        let msg = Message::Ping(Ping::default());
        let encoded = msg.encode().unwrap();
        let err = Message::decode(&encoded[..encoded.len() - 1]).unwrap_err();
        match err {
            MsgError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_decode_rejects_oversized_body() {
        let mut frame = vec![kind::PING];
        frame.extend_from_slice(&(MAX_MSG_LENGTH + 1).to_be_bytes());
        match Message::decode(&frame) {
            Err(MsgError::TooLarge(n)) => assert_eq!(n, MAX_MSG_LENGTH + 1),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_byte() {
        let mut frame = vec![b'z'];
        frame.extend_from_slice(&2u64.to_be_bytes());
        frame.extend_from_slice(b"{}");
        match Message::decode(&frame) {
            Err(MsgError::UnknownType(b)) => assert_eq!(b, b'z'),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_async_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let msg = Message::NewProxy(NewProxy {
            proxy_name: "web".to_string(),
            proxy_type: "http".to_string(),
            custom_domains: vec!["a.example.com".to_string()],
            ..NewProxy::default()
        });
        write_message(&mut a, &msg).await.unwrap();
        let decoded = read_message(&mut b).await.unwrap();
        match decoded {
            Message::NewProxy(m) => {
                assert_eq!(m.proxy_name, "web");
                assert_eq!(m.custom_domains, vec!["a.example.com"]);
            }
            _ => panic!("wrong message type"),
        }
    }
}
