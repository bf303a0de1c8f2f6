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

//! Request orchestration for the plain and the authenticated paths
//!
//! Plain calls pass the whitelist, wait for the freshness gate, then either
//! join a cache entry or register one whose upstream call runs on the
//! dispatch queue. Non-cacheable methods skip the cache and always go through
//! the queue. Authenticated calls go straight to the DePIN caller.

use crate::{
    cache::{CacheLookup, ResultCache},
    challenge::ChallengeCache,
    depin::{AuthenticatedCaller, StaticSignature, DEFAULT_RETRIES},
    errors::{ProxyError, RequestError},
    freshness::FreshnessGate,
    health::{HealthService, PublicSettings},
    metrics::MetricsCollector,
    providers::NodePool,
    queue::DispatchQueue,
    whitelist::Whitelist,
};
use futures::FutureExt;
use serde_json::{json, Value};
use std::{future::Future, sync::Arc, time::Instant};
use tracing::{debug, info, warn};

/// A plain RPC call as received on `/rpc`
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    /// Method name
    pub method: String,
    /// Positional parameters
    pub params: Vec<Value>,
}

impl RpcRequest {
    /// Extract the call from a request body
    ///
    /// `params` may be omitted or null, in which case it is empty.
    pub fn from_value(body: &Value) -> Result<Self, RequestError> {
        let method = body.get("method").and_then(Value::as_str).ok_or_else(|| {
            RequestError::InvalidRequest {
                error: "Missing or invalid method".to_string(),
                description: "Request must include a valid 'method' field".to_string(),
            }
        })?;

        let params = match body.get("params") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(params)) => params.clone(),
            Some(_) => {
                return Err(RequestError::InvalidRequest {
                    error: "Missing or invalid params".to_string(),
                    description: "'params' must be an array".to_string(),
                });
            }
        };

        Ok(Self { method: method.to_string(), params })
    }
}

/// An authenticated call as received on `/depin`
#[derive(Debug, Clone, PartialEq)]
pub struct DePinRequest {
    /// Neurai address the challenge is issued for
    pub address: String,
    /// Base64 signature of the challenge, produced by the client
    pub signature: String,
    /// Method name
    pub method: String,
    /// Positional parameters
    pub params: Vec<Value>,
}

impl DePinRequest {
    /// Extract and type-check every field of a request body
    pub fn from_value(body: &Value) -> Result<Self, RequestError> {
        let field = |name: &str, description: &str| {
            body.get(name)
                .and_then(Value::as_str)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
                .ok_or_else(|| RequestError::InvalidRequest {
                    error: format!("Missing or invalid {name}"),
                    description: description.to_string(),
                })
        };

        let address = field("address", "Request must include a valid 'address' field")?;
        let signature = field(
            "signature",
            "Request must include a valid 'signature' field (base64-encoded)",
        )?;
        let method = field("method", "Request must include a valid 'method' field")?;
        let params = match body.get("params") {
            Some(Value::Array(params)) => params.clone(),
            _ => {
                return Err(RequestError::InvalidRequest {
                    error: "Missing or invalid params".to_string(),
                    description: "Request must include a 'params' array".to_string(),
                });
            }
        };

        Ok(Self { address, signature, method, params })
    }
}

/// Serves inbound calls against the node pool
pub struct RpcHandler {
    pool: Arc<NodePool>,
    cache: Arc<ResultCache>,
    gate: Arc<FreshnessGate>,
    queue: DispatchQueue,
    caller: AuthenticatedCaller,
    whitelist: Whitelist,
    metrics: Arc<MetricsCollector>,
    health: HealthService,
}

impl RpcHandler {
    /// Wire up every component around `pool`; must run inside a tokio runtime
    ///
    /// # Arguments
    /// * `pool` - Upstream nodes for both paths
    /// * `concurrency` - Maximum number of concurrent upstream calls
    /// * `whitelist` - Methods allowed through the proxy
    /// * `settings` - Public settings served on `/settings`
    pub fn new(
        pool: Arc<NodePool>,
        concurrency: usize,
        whitelist: Whitelist,
        settings: PublicSettings,
    ) -> Self {
        let cache = Arc::new(ResultCache::new());
        let gate = Arc::new(FreshnessGate::new(pool.clone(), cache.clone()));
        let metrics = Arc::new(MetricsCollector::new());
        let challenges = Arc::new(ChallengeCache::new(pool.depin_transport().clone()));
        let caller = AuthenticatedCaller::new(challenges, pool.depin_transport().clone())
            .with_metrics(metrics.clone());

        Self {
            pool,
            cache,
            gate,
            queue: DispatchQueue::new(concurrency),
            caller,
            whitelist,
            metrics,
            health: HealthService::new(settings),
        }
    }

    /// Upstream node pool
    pub fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }

    /// Result cache
    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Chain tip gate
    pub fn gate(&self) -> &Arc<FreshnessGate> {
        &self.gate
    }

    /// Upstream dispatch queue
    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    /// DePIN challenge cache
    pub fn challenges(&self) -> &Arc<ChallengeCache> {
        self.caller.challenges()
    }

    /// Method whitelist
    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    /// Request counters
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Liveness and settings
    pub fn health(&self) -> &HealthService {
        &self.health
    }

    /// Serve a plain call
    pub async fn handle_call(&self, request: RpcRequest) -> Result<Value, RequestError> {
        let RpcRequest { method, params } = request;
        self.metrics.record_request();

        if let Err(description) = self.whitelist.check(&method, &params) {
            debug!("Not whitelisted: {}", method);
            self.metrics.record_rejected();
            return Err(RequestError::NotWhitelisted { description });
        }

        self.gate.ensure_fresh().await?;
        self.cache.record_method(&method);

        if !ResultCache::should_cache(&method) {
            self.metrics.record_uncached();
            let call = self.upstream_call(method, params);
            return Ok(self.queue.submit(call).await?);
        }

        let lookup = self.cache.get_or_insert_with(&method, &params, |key, id| {
            let call = self.upstream_call(method.clone(), params.clone());
            let cache = self.cache.clone();
            let key = key.to_string();

            // Runs on the queue, so cleanup happens even if every caller is gone
            let task = {
                let cache = cache.clone();
                let key = key.clone();
                async move {
                    let result = call.await;
                    if result.is_err() && cache.remove_entry(&key, id) {
                        info!("Removed failed call {} from cache", key);
                    }
                    result
                }
            };
            let handle = self.queue.submit(task);

            // Also covers a task that never reported back
            async move {
                let result = handle.await;
                if result.is_err() {
                    cache.remove_entry(&key, id);
                }
                result
            }
            .boxed()
            .shared()
        });

        match &lookup {
            CacheLookup::Hit { resolved: true, .. } => self.metrics.record_cache_hit(),
            CacheLookup::Hit { resolved: false, .. } => self.metrics.record_coalesced_hit(),
            CacheLookup::Registered(_) => self.metrics.record_cache_miss(),
        }

        Ok(lookup.handle().await?)
    }

    fn upstream_call(
        &self,
        method: String,
        params: Vec<Value>,
    ) -> impl Future<Output = Result<Value, ProxyError>> + Send + 'static {
        let pool = self.pool.clone();
        let metrics = self.metrics.clone();

        async move {
            let endpoint = pool.select_endpoint();
            let start = Instant::now();
            let result = endpoint.call(&method, &params).await;
            let elapsed_ms = start.elapsed().as_millis() as u64;

            metrics.record_upstream_call(endpoint.name(), elapsed_ms, result.is_ok());
            match &result {
                Ok(_) => debug!("{} answered {} in {}ms", endpoint.name(), method, elapsed_ms),
                Err(e) => warn!("{} failed on {}: {}", method, endpoint.name(), e),
            }
            result
        }
    }

    /// Serve an authenticated call with the client-supplied signature
    pub async fn handle_depin(&self, request: DePinRequest) -> Result<Value, RequestError> {
        let DePinRequest { address, signature, method, params } = request;

        if let Err(description) = self.whitelist.check(&method, &params) {
            debug!("DePIN: not whitelisted: {}", method);
            self.metrics.record_rejected();
            return Err(RequestError::NotWhitelisted { description });
        }

        let target = self.pool.select_depin_endpoint();
        debug!("DePIN {} for {} via {}", method, address, target.name);

        let signer = StaticSignature::new(signature);
        let result = self
            .caller
            .execute(&target.url, &address, &signer, &method, &params, DEFAULT_RETRIES)
            .await;

        self.metrics.record_depin_request(result.is_ok());
        match result {
            Ok(value) => {
                self.metrics.record_request();
                Ok(value)
            }
            Err(e) => {
                warn!("DePIN {} via {} failed: {}", method, target.name, e);
                Err(e.into())
            }
        }
    }

    /// Everything `/getCache` reports
    pub fn cache_report(&self) -> Value {
        json!({
            "number_of_items_in_cache": self.cache.len(),
            "items_by_method": self.cache.counts_by_method(),
            "cache_age_secs": self.cache.oldest_entry_age().map(|age| age.as_secs()),
            "queue_size": self.queue.pending(),
            "running": self.queue.running(),
            "concurrency": self.queue.concurrency(),
            "number_of_requests": self.metrics.total_requests(),
            "methods": self.cache.methods(),
            "depin_challenges": self.challenges().stats(),
            "nodes": self.pool.list_status(),
            "depin_nodes": self.pool.list_depin_status(),
            "last_best_block_hash": self.gate.last_tip(),
            "uptime": self.health.uptime_secs(),
            "metrics": self.metrics.snapshot(),
        })
    }
}
