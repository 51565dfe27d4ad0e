use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

/// Transport and envelope failures from the RPC clients. Checked once per
/// call; nothing downstream re-probes response JSON.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("POST {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("HTTP {status}: {body}")]
    Http { status: StatusCode, body: String },
    #[error("RPC error: {0}")]
    Rpc(String),
    #[error("missing result field")]
    MissingResult,
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("provider error: {0}")]
    Provider(String),
}

/// Thin JSON-RPC 2.0 POST client shared by the bundler and paymaster
/// clients.
#[derive(Debug, Clone)]
pub struct JsonRpcHttp {
    url: String,
    http: reqwest::Client,
}

impl JsonRpcHttp {
    pub fn new(url: String) -> Self {
        Self {
            url,
            http: reqwest::Client::new(),
        }
    }

    /// One round trip: envelope the call, check HTTP status and the `error`
    /// member, return the `result` member.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let req = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|source| RpcError::Transport {
                url: self.url.clone(),
                source,
            })?;

        let status = resp.status();
        let body: Value = resp.json().await.map_err(|source| RpcError::Transport {
            url: self.url.clone(),
            source,
        })?;

        if !status.is_success() {
            return Err(RpcError::Http {
                status,
                body: body.to_string(),
            });
        }

        if let Some(err) = body.get("error") {
            return Err(RpcError::Rpc(err.to_string()));
        }

        body.get("result").cloned().ok_or(RpcError::MissingResult)
    }
}
