use thiserror::Error;

/// Typed failures surfaced by the server core.  Per-message handlers convert
/// these into the error field of the matching response message instead of
/// tearing down the control session.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("proxy name [{0}] is already in use")]
    DuplicateName(String),
    #[error("port {0} is unavailable")]
    PortUnavailable(u16),
    #[error("port {0} is not allowed")]
    PortForbidden(u16),
    #[error("exceeded the per-client port quota")]
    QuotaExceeded,
    #[error("unsupported proxy type [{0}]")]
    UnknownProxyType(String),
    #[error("no client found for run id [{0}]")]
    UnknownRunId(String),
    #[error("control connection is closed")]
    ControlClosed,
    #[error("timeout trying to get work connection")]
    WorkConnTimeout,
    #[error("route for [{domain}{location}] already exists")]
    RouteConflict { domain: String, location: String },
    #[error("no route found")]
    NoRouteFound,
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] burrow_proto::msg::MsgError),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("rejected by plugin: {0}")]
    PluginRejected(String),
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;

impl ServerError {
    /// The string sent back to clients.  When `detailed` is off only a short
    /// summary of the kind leaks; the full text stays in the server log.
    pub fn client_facing(&self, detailed: bool) -> String {
        if detailed {
            return self.to_string();
        }
        match self {
            ServerError::AuthFailed(_) => "authentication failed".to_string(),
            ServerError::DuplicateName(_) => "proxy name is already in use".to_string(),
            ServerError::PortUnavailable(_) | ServerError::PortForbidden(_) => {
                "port unavailable".to_string()
            }
            ServerError::QuotaExceeded => "port quota exceeded".to_string(),
            ServerError::UnknownProxyType(_) => "unsupported proxy type".to_string(),
            ServerError::UnknownRunId(_) => "unknown run id".to_string(),
            ServerError::ControlClosed => "control closed".to_string(),
            ServerError::WorkConnTimeout => "work connection timeout".to_string(),
            ServerError::RouteConflict { .. } => "route conflict".to_string(),
            ServerError::NoRouteFound => "no route found".to_string(),
            ServerError::PluginRejected(_) => "rejected".to_string(),
            _ => "internal error".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_facing_hides_detail() {
        let err = ServerError::DuplicateName("secret-proxy".to_string());
        assert!(err.client_facing(true).contains("secret-proxy"));
        assert!(!err.client_facing(false).contains("secret-proxy"));
    }
}
