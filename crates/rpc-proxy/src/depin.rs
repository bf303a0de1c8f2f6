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

//! Authenticated RPC calls against DePIN endpoints
//!
//! Each call obtains a challenge for the caller's identity, has it signed and
//! submits the signed request. A submission rejected because the challenge
//! expired drops the cached challenge and, while the retry budget allows,
//! starts over with a fresh one. Every other failure is returned as is.

use crate::{
    challenge::{Challenge, ChallengeCache},
    errors::DePinError,
    metrics::MetricsCollector,
    transport::{truncate, DePinTransport},
};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Extra attempts allowed after an expired-challenge rejection
pub const DEFAULT_RETRIES: u32 = 1;

/// Produces the signature for a challenge
///
/// Signing may involve I/O (a wallet, a remote signer), so it is async.
pub trait ChallengeSigner: Send + Sync {
    /// Sign `challenge` and return the encoded signature
    fn sign<'a>(&'a self, challenge: &'a Challenge) -> BoxFuture<'a, Result<String, DePinError>>;
}

/// Signer returning a signature supplied up front by the client
#[derive(Debug, Clone)]
pub struct StaticSignature(String);

impl StaticSignature {
    /// Wrap a base64 signature produced by the client
    pub fn new(signature: impl Into<String>) -> Self {
        Self(signature.into())
    }
}

impl ChallengeSigner for StaticSignature {
    fn sign<'a>(&'a self, _challenge: &'a Challenge) -> BoxFuture<'a, Result<String, DePinError>> {
        Box::pin(futures::future::ready(Ok(self.0.clone())))
    }
}

enum CallState {
    AwaitingChallenge,
    Submitted { signature: String },
}

/// Executes authenticated calls with challenge caching and expiry retry
pub struct AuthenticatedCaller {
    challenges: Arc<ChallengeCache>,
    transport: Arc<dyn DePinTransport>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl AuthenticatedCaller {
    /// Create a caller sharing `challenges` and submitting through `transport`
    pub fn new(challenges: Arc<ChallengeCache>, transport: Arc<dyn DePinTransport>) -> Self {
        Self { challenges, transport, metrics: None }
    }

    /// Count retries in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The challenge cache used by this caller
    pub fn challenges(&self) -> &Arc<ChallengeCache> {
        &self.challenges
    }

    /// Execute `method` on the DePIN endpoint at `url` as `identity`
    ///
    /// # Arguments
    /// * `url` - DePIN endpoint URL
    /// * `identity` - Address the challenge is issued for
    /// * `signer` - Produces the signature for each challenge
    /// * `method` - RPC method name
    /// * `params` - RPC parameters
    /// * `retries_remaining` - Attempts left after an expired-challenge rejection
    pub async fn execute(
        &self,
        url: &str,
        identity: &str,
        signer: &dyn ChallengeSigner,
        method: &str,
        params: &[Value],
        mut retries_remaining: u32,
    ) -> Result<Value, DePinError> {
        let mut state = CallState::AwaitingChallenge;

        loop {
            state = match state {
                CallState::AwaitingChallenge => {
                    let challenge = self.challenges.request_challenge(url, identity).await?;
                    let signature = signer.sign(&challenge).await?;
                    CallState::Submitted { signature }
                }
                CallState::Submitted { signature } => {
                    match self.submit(url, identity, &signature, method, params).await {
                        Ok(result) => return Ok(result),
                        Err(e) if e.is_challenge_expired() => {
                            self.challenges.invalidate(url, identity);
                            if retries_remaining == 0 {
                                return Err(e);
                            }
                            retries_remaining -= 1;
                            warn!(
                                "Challenge for {} at {} expired, retrying ({} retries left)",
                                identity, url, retries_remaining
                            );
                            if let Some(metrics) = &self.metrics {
                                metrics.record_depin_retry();
                            }
                            CallState::AwaitingChallenge
                        }
                        Err(e) => return Err(e),
                    }
                }
            };
        }
    }

    async fn submit(
        &self,
        url: &str,
        identity: &str,
        signature: &str,
        method: &str,
        params: &[Value],
    ) -> Result<Value, DePinError> {
        let body = json!({
            "address": identity,
            "signature": signature,
            "request": {
                "jsonrpc": "2.0",
                "id": 1,
                "method": method,
                "params": params,
            },
        });

        debug!("Submitting authenticated {} to {}", method, url);
        let response = self.transport.post_json(url, body).await?;
        if !response.is_success() {
            return Err(DePinError::Rejected { status: response.status, body: response.body });
        }

        let mut reply: Value = serde_json::from_str(&response.body).map_err(|e| {
            DePinError::InvalidResponse(format!("{e}: {}", truncate(&response.body)))
        })?;

        if let Some(error) = reply.get("error").filter(|e| !e.is_null()) {
            return Err(DePinError::Rpc(error.clone()));
        }

        Ok(reply.get_mut("result").map(Value::take).unwrap_or(Value::Null))
    }
}
