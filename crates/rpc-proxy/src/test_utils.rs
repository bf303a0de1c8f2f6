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

//! In-memory transports for unit tests.
//!
//! Unlike wiremock servers these never touch the network, so they can be used
//! together with tokio's paused clock.

use crate::{
    errors::{DePinError, ProxyError},
    transport::{DePinResponse, DePinTransport, RpcTransport},
};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

/// Scripted [`RpcTransport`] that counts every call per method
pub(crate) struct MockTransport {
    node: String,
    responses: Mutex<HashMap<String, Result<Value, ProxyError>>>,
    calls: Mutex<Vec<(String, Vec<Value>)>>,
    delay: Mutex<Option<Duration>>,
}

impl MockTransport {
    pub(crate) fn new(node: &str) -> Arc<Self> {
        Arc::new(Self {
            node: node.to_string(),
            responses: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
        })
    }

    /// Answer every future call to `method` with `result`
    pub(crate) fn respond(&self, method: &str, result: Result<Value, ProxyError>) {
        self.responses.lock().insert(method.to_string(), result);
    }

    /// Delay every answer, to keep calls in flight
    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub(crate) fn calls(&self, method: &str) -> usize {
        self.calls.lock().iter().filter(|(m, _)| m == method).count()
    }

    pub(crate) fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    pub(crate) fn unavailable(node: &str) -> ProxyError {
        ProxyError::Transport { node: node.to_string(), message: "connection refused".to_string() }
    }
}

impl RpcTransport for MockTransport {
    fn call<'a>(
        &'a self,
        method: &'a str,
        params: &'a [Value],
    ) -> BoxFuture<'a, Result<Value, ProxyError>> {
        Box::pin(async move {
            self.calls.lock().push((method.to_string(), params.to_vec()));

            let delay = *self.delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            self.responses.lock().get(method).cloned().unwrap_or_else(|| {
                Err(ProxyError::Rpc {
                    node: self.node.clone(),
                    error: json!({"code": -32601, "message": "Method not found"}),
                })
            })
        })
    }
}

type Script = HashMap<String, VecDeque<Result<DePinResponse, DePinError>>>;

/// Scripted [`DePinTransport`]
///
/// Responses are queued per URL and per body kind; the last queued response
/// is repeated once the queue drains.
#[derive(Default)]
pub(crate) struct MockDePinTransport {
    text: Mutex<Script>,
    json: Mutex<Script>,
    text_requests: Mutex<Vec<(String, String)>>,
    json_requests: Mutex<Vec<(String, Value)>>,
}

impl MockDePinTransport {
    pub(crate) fn respond_text(&self, url: &str, status: u16, body: &str) {
        Self::push(&self.text, url, Ok(DePinResponse { status, body: body.to_string() }));
    }

    pub(crate) fn fail_text(&self, url: &str, error: DePinError) {
        Self::push(&self.text, url, Err(error));
    }

    pub(crate) fn respond_json(&self, url: &str, status: u16, body: &str) {
        Self::push(&self.json, url, Ok(DePinResponse { status, body: body.to_string() }));
    }

    pub(crate) fn text_requests(&self, url: &str) -> Vec<String> {
        self.text_requests
            .lock()
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub(crate) fn json_requests(&self, url: &str) -> Vec<Value> {
        self.json_requests
            .lock()
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, body)| body.clone())
            .collect()
    }

    fn push(script: &Mutex<Script>, url: &str, response: Result<DePinResponse, DePinError>) {
        script.lock().entry(url.to_string()).or_default().push_back(response);
    }

    fn next(script: &Mutex<Script>, url: &str) -> Result<DePinResponse, DePinError> {
        let mut script = script.lock();
        let Some(queue) = script.get_mut(url) else {
            return Err(DePinError::Transport(format!("no scripted response for {url}")));
        };
        match queue.len() {
            0 => Err(DePinError::Transport("script exhausted".to_string())),
            1 => queue[0].clone(),
            _ => queue.pop_front().expect("queue has entries"),
        }
    }
}

impl DePinTransport for MockDePinTransport {
    fn post_text<'a>(
        &'a self,
        url: &'a str,
        body: String,
    ) -> BoxFuture<'a, Result<DePinResponse, DePinError>> {
        Box::pin(async move {
            self.text_requests.lock().push((url.to_string(), body));
            Self::next(&self.text, url)
        })
    }

    fn post_json<'a>(
        &'a self,
        url: &'a str,
        body: Value,
    ) -> BoxFuture<'a, Result<DePinResponse, DePinError>> {
        Box::pin(async move {
            self.json_requests.lock().push((url.to_string(), body));
            Self::next(&self.json, url)
        })
    }
}
