// Neurai RPC Proxy
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Outbound transports for Neurai nodes and DePIN endpoints
//!
//! Both are traits so the pool, the freshness gate and the DePIN caller can be
//! driven by in-memory fakes in tests. The HTTP implementations use a shared
//! `reqwest::Client` per endpoint.

use crate::errors::{DePinError, ProxyError};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tracing::debug;

/// Default timeout for a single upstream HTTP request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of characters of an upstream body kept in error messages
const MAX_ERROR_BODY_CHARS: usize = 200;

/// JSON-RPC transport to one Neurai node
///
/// Credentials and addressing are owned by the implementation and opaque to
/// the rest of the proxy.
pub trait RpcTransport: Send + Sync {
    /// Invoke `method` with `params` and resolve to the `result` member
    fn call<'a>(
        &'a self,
        method: &'a str,
        params: &'a [Value],
    ) -> BoxFuture<'a, Result<Value, ProxyError>>;
}

/// JSON-RPC 1.0 over HTTP POST with basic authentication
pub struct HttpRpcTransport {
    node_name: String,
    url: String,
    credentials: Option<(String, String)>,
    client: reqwest::Client,
    timeout: Duration,
    request_id: AtomicU64,
}

impl HttpRpcTransport {
    /// Create a transport for the node at `url`
    ///
    /// # Arguments
    /// * `node_name` - Display name used in errors and logs
    /// * `url` - Node RPC URL
    /// * `credentials` - Optional (username, password) for basic auth
    /// * `timeout` - Per-request timeout
    pub fn new(
        node_name: impl Into<String>,
        url: impl Into<String>,
        credentials: Option<(String, String)>,
        timeout: Duration,
    ) -> eyre::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            node_name: node_name.into(),
            url: url.into(),
            credentials,
            client,
            timeout,
            request_id: AtomicU64::new(1),
        })
    }

    /// The node URL this transport posts to
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send(&self, method: &str, params: &[Value]) -> Result<Value, ProxyError> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let mut builder = self.client.post(&self.url).json(&request);
        if let Some((username, password)) = &self.credentials {
            builder = builder.basic_auth(username, Some(password));
        }

        let response = builder.send().await.map_err(|e| self.map_reqwest_error(e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| self.map_reqwest_error(e))?;

        debug!(
            "Response from {} for {} ({}): {}",
            self.node_name,
            method,
            status,
            truncate(&text)
        );

        // Nodes report RPC errors with a 500 status and a JSON body
        let mut body: Value = match serde_json::from_str(&text) {
            Ok(body) => body,
            Err(e) if status.is_success() => {
                return Err(ProxyError::InvalidResponse {
                    node: self.node_name.clone(),
                    message: format!("{e}: {}", truncate(&text)),
                });
            }
            Err(_) => {
                return Err(ProxyError::Http {
                    node: self.node_name.clone(),
                    status: status.as_u16(),
                    body: truncate(&text),
                });
            }
        };

        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            return Err(ProxyError::Rpc { node: self.node_name.clone(), error: error.clone() });
        }

        if !status.is_success() {
            return Err(ProxyError::Http {
                node: self.node_name.clone(),
                status: status.as_u16(),
                body: truncate(&text),
            });
        }

        match body.get_mut("result") {
            Some(result) => Ok(result.take()),
            None => Err(ProxyError::InvalidResponse {
                node: self.node_name.clone(),
                message: "response has neither result nor error".to_string(),
            }),
        }
    }

    fn map_reqwest_error(&self, error: reqwest::Error) -> ProxyError {
        if error.is_timeout() {
            ProxyError::Timeout {
                node: self.node_name.clone(),
                after_ms: self.timeout.as_millis() as u64,
            }
        } else {
            ProxyError::Transport { node: self.node_name.clone(), message: error.to_string() }
        }
    }
}

impl RpcTransport for HttpRpcTransport {
    fn call<'a>(
        &'a self,
        method: &'a str,
        params: &'a [Value],
    ) -> BoxFuture<'a, Result<Value, ProxyError>> {
        Box::pin(self.send(method, params))
    }
}

/// Raw answer of a DePIN endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DePinResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body as text
    pub body: String,
}

impl DePinResponse {
    /// Whether the status is in the 2xx range
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP transport to DePIN endpoints
///
/// The challenge protocol is plaintext, the authenticated submission is JSON.
pub trait DePinTransport: Send + Sync {
    /// POST a `text/plain` body
    fn post_text<'a>(
        &'a self,
        url: &'a str,
        body: String,
    ) -> BoxFuture<'a, Result<DePinResponse, DePinError>>;

    /// POST a JSON body
    fn post_json<'a>(
        &'a self,
        url: &'a str,
        body: Value,
    ) -> BoxFuture<'a, Result<DePinResponse, DePinError>>;
}

/// reqwest-backed [`DePinTransport`]
pub struct HttpDePinTransport {
    client: reqwest::Client,
}

impl HttpDePinTransport {
    /// Create a transport whose requests time out after `timeout`
    pub fn new(timeout: Duration) -> eyre::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<DePinResponse, DePinError> {
        let response = request.send().await.map_err(|e| DePinError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| DePinError::Transport(e.to_string()))?;
        Ok(DePinResponse { status, body })
    }
}

impl DePinTransport for HttpDePinTransport {
    fn post_text<'a>(
        &'a self,
        url: &'a str,
        body: String,
    ) -> BoxFuture<'a, Result<DePinResponse, DePinError>> {
        let request =
            self.client.post(url).header(reqwest::header::CONTENT_TYPE, "text/plain").body(body);
        Box::pin(self.send(request))
    }

    fn post_json<'a>(
        &'a self,
        url: &'a str,
        body: Value,
    ) -> BoxFuture<'a, Result<DePinResponse, DePinError>> {
        let request = self.client.post(url).json(&body);
        Box::pin(self.send(request))
    }
}

/// Shorten an upstream body for logs and error messages
pub(crate) fn truncate(text: &str) -> String {
    text.chars().take(MAX_ERROR_BODY_CHARS).collect()
}
