//! Webhook plugins.
//!
//! Six lifecycle hooks fan out to HTTP endpoints in registration order.
//! Each plugin may reject the operation, pass the content through
//! unchanged, or replace it for the rest of the chain.

use crate::config::HttpPluginConfig;
use crate::error::{Result, ServerError};
use crate::util::rand_id;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Login,
    NewProxy,
    CloseProxy,
    Ping,
    NewWorkConn,
    NewUserConn,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Login => "Login",
            Op::NewProxy => "NewProxy",
            Op::CloseProxy => "CloseProxy",
            Op::Ping => "Ping",
            Op::NewWorkConn => "NewWorkConn",
            Op::NewUserConn => "NewUserConn",
        }
    }
}

#[derive(Debug, Serialize)]
struct HookRequest<'a> {
    version: &'a str,
    op: &'a str,
    content: &'a Value,
}

#[derive(Debug, Deserialize, Default)]
pub struct HookResponse {
    #[serde(default)]
    pub reject: bool,
    #[serde(default)]
    pub reject_reason: String,
    #[serde(default)]
    pub unchange: bool,
    #[serde(default)]
    pub content: Option<Value>,
}

struct HttpPlugin {
    name: String,
    url: String,
    ops: Vec<String>,
}

impl HttpPlugin {
    fn supports(&self, op: Op) -> bool {
        self.ops.iter().any(|o| o == op.as_str())
    }

    async fn call(&self, client: &reqwest::Client, op: Op, content: &Value) -> Result<HookResponse> {
        let request = HookRequest {
            version: burrow_proto::msg::PROTOCOL_VERSION,
            op: op.as_str(),
            content,
        };
        let resp = client
            .post(&self.url)
            .header("X-Request-Id", rand_id())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                ServerError::ResourceUnavailable(format!("plugin {} unreachable: {e}", self.name))
            })?;
        if !resp.status().is_success() {
            return Err(ServerError::ResourceUnavailable(format!(
                "plugin {} returned {}",
                self.name,
                resp.status()
            )));
        }
        resp.json::<HookResponse>().await.map_err(|e| {
            ServerError::ResourceUnavailable(format!("plugin {} bad response: {e}", self.name))
        })
    }
}

pub struct PluginManager {
    plugins: Vec<HttpPlugin>,
    client: reqwest::Client,
}

impl PluginManager {
    pub fn new(configs: &[HttpPluginConfig]) -> Self {
        let plugins = configs
            .iter()
            .map(|c| HttpPlugin {
                name: c.name.clone(),
                url: format!("{}{}", c.addr.trim_end_matches('/'), c.path),
                ops: c.ops.clone(),
            })
            .collect();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { plugins, client }
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Run the hook chain for `op`.  The returned value is the possibly
    /// rewritten content.
    pub async fn run_hook(&self, op: Op, content: Value) -> Result<Value> {
        let mut content = content;
        for plugin in self.plugins.iter().filter(|p| p.supports(op)) {
            let response = match plugin.call(&self.client, op, &content).await {
                Ok(r) => r,
                Err(e) => {
                    // An unreachable plugin fails the operation rather than
                    // silently skipping a gatekeeper.
                    warn!("{e}");
                    return Err(e);
                }
            };
            if response.reject {
                return Err(ServerError::PluginRejected(response.reject_reason));
            }
            if response.unchange {
                continue;
            }
            if let Some(new_content) = response.content {
                debug!("plugin {} rewrote {} content", plugin.name, op.as_str());
                content = new_content;
            }
        }
        Ok(content)
    }

    /// Hook helper that deserializes the rewritten content back into the
    /// original message type.
    pub async fn run_typed_hook<T>(&self, op: Op, msg: &T) -> Result<T>
    where
        T: Serialize + serde::de::DeserializeOwned + Clone,
    {
        if self.is_empty() {
            return Ok(msg.clone());
        }
        let content = serde_json::to_value(msg)
            .map_err(|e| ServerError::ProtocolViolation(format!("unencodable content: {e}")))?;
        let rewritten = self.run_hook(op, content).await?;
        serde_json::from_value(rewritten)
            .map_err(|e| ServerError::ProtocolViolation(format!("plugin content invalid: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_response_defaults() {
        let resp: HookResponse = serde_json::from_str("{}").unwrap();
        assert!(!resp.reject);
        assert!(!resp.unchange);
        assert!(resp.content.is_none());
    }

    #[tokio::test]
    async fn test_empty_manager_passes_through() {
        let manager = PluginManager::new(&[]);
        let login = burrow_proto::msg::Login {
            user: "u".into(),
            ..Default::default()
        };
        let out = manager.run_typed_hook(Op::Login, &login).await.unwrap();
        assert_eq!(out.user, "u");
    }

    #[test]
    fn test_plugin_supports_filter() {
        let plugin = HttpPlugin {
            name: "p".into(),
            url: "http://localhost/hook".into(),
            ops: vec!["Login".into(), "NewProxy".into()],
        };
        assert!(plugin.supports(Op::Login));
        assert!(!plugin.supports(Op::Ping));
    }
}
