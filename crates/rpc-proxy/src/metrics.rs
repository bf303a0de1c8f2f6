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

//! Request and upstream usage counters exposed through `/getCache`

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

/// The request counter restarts from zero once it gets this close to `u64::MAX`
const REQUEST_COUNTER_HEADROOM: u64 = 1000;

/// Usage statistics of one upstream node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeUsage {
    /// Upstream calls sent to this node
    pub request_count: u64,
    /// Calls that succeeded
    pub success_count: u64,
    /// Calls that failed
    pub error_count: u64,
    /// Sum of response times in milliseconds
    pub total_response_time_ms: u64,
}

impl NodeUsage {
    /// Average response time in milliseconds
    pub fn avg_response_time_ms(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.total_response_time_ms as f64 / self.request_count as f64
        }
    }

    /// Success rate as a percentage (0.0 to 100.0)
    pub fn success_rate(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            (self.success_count as f64 / self.request_count as f64) * 100.0
        }
    }

    fn record(&mut self, response_time_ms: u64, success: bool) {
        self.request_count += 1;
        self.total_response_time_ms = self.total_response_time_ms.saturating_add(response_time_ms);
        if success {
            self.success_count += 1;
        } else {
            self.error_count += 1;
        }
    }
}

/// Serializable copy of every counter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Accepted inbound requests (restarts near `u64::MAX`)
    pub total_requests: u64,
    /// Requests answered from an already resolved cache entry
    pub cache_hits: u64,
    /// Requests that joined an in-flight upstream call
    pub coalesced_hits: u64,
    /// Requests that registered a new cache entry
    pub cache_misses: u64,
    /// Requests for non-cacheable methods
    pub uncached_requests: u64,
    /// Requests rejected by the whitelist
    pub rejected_requests: u64,
    /// Failed upstream calls
    pub upstream_errors: u64,
    /// Authenticated DePIN calls
    pub depin_requests: u64,
    /// Failed authenticated DePIN calls
    pub depin_errors: u64,
    /// Retries after an expired challenge
    pub depin_retries: u64,
    /// Cache hit rate (resolved and coalesced) as a percentage of cacheable requests
    pub cache_hit_rate: f64,
    /// Per-node usage, keyed by node name
    pub nodes: HashMap<String, NodeUsage>,
}

/// Thread-safe counters for the proxy
#[derive(Debug, Default)]
pub struct MetricsCollector {
    total_requests: AtomicU64,
    cache_hits: AtomicU64,
    coalesced_hits: AtomicU64,
    cache_misses: AtomicU64,
    uncached_requests: AtomicU64,
    rejected_requests: AtomicU64,
    upstream_errors: AtomicU64,
    depin_requests: AtomicU64,
    depin_errors: AtomicU64,
    depin_retries: AtomicU64,
    node_usage: RwLock<HashMap<String, NodeUsage>>,
}

impl MetricsCollector {
    /// Create a collector with every counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Count an inbound request, returning the new total
    pub fn record_request(&self) -> u64 {
        let next =
            |count: u64| if count > u64::MAX - REQUEST_COUNTER_HEADROOM { 1 } else { count + 1 };
        let previous = self
            .total_requests
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| Some(next(count)))
            .unwrap_or_default();
        next(previous)
    }

    /// Count a request served from a resolved cache entry
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a request that joined an in-flight call
    pub fn record_coalesced_hit(&self) {
        self.coalesced_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a request that registered a new cache entry
    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a request for a non-cacheable method
    pub fn record_uncached(&self) {
        self.uncached_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a whitelist rejection
    pub fn record_rejected(&self) {
        self.rejected_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of one upstream call on `node`
    pub fn record_upstream_call(&self, node: &str, response_time_ms: u64, success: bool) {
        if !success {
            self.upstream_errors.fetch_add(1, Ordering::Relaxed);
        }
        self.node_usage.write().entry(node.to_string()).or_default().record(response_time_ms, success);
    }

    /// Record the outcome of an authenticated DePIN call
    pub fn record_depin_request(&self, success: bool) {
        self.depin_requests.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.depin_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count a retry after an expired challenge
    pub fn record_depin_retry(&self) {
        self.depin_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value of the request counter
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Hits (resolved and coalesced) as a percentage of cacheable requests
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed)
            + self.coalesced_hits.load(Ordering::Relaxed);
        let total = hits + self.cache_misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64) * 100.0
        }
    }

    /// Usage of every node that received at least one call
    pub fn node_usage(&self) -> HashMap<String, NodeUsage> {
        self.node_usage.read().clone()
    }

    /// Copy every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests(),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            coalesced_hits: self.coalesced_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            uncached_requests: self.uncached_requests.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
            depin_requests: self.depin_requests.load(Ordering::Relaxed),
            depin_errors: self.depin_errors.load(Ordering::Relaxed),
            depin_retries: self.depin_retries.load(Ordering::Relaxed),
            cache_hit_rate: self.cache_hit_rate(),
            nodes: self.node_usage(),
        }
    }
}
