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

//! In-memory result cache with in-flight request coalescing
//!
//! Entries hold a shared handle that is either still pending or already
//! resolved. Every caller asking for the same (method, params) while an entry
//! exists awaits the same handle, so at most one upstream call is outstanding
//! per key. Entries live until the freshness gate clears the cache on a new
//! chain tip, or until the call that produced them fails.

use crate::errors::ProxyError;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};
use tracing::debug;

/// Pending or resolved upstream result shared by coalesced callers
pub type SharedResult = Shared<BoxFuture<'static, Result<Value, ProxyError>>>;

/// Methods whose results must always be fetched fresh
///
/// Mempool and network state changes independently of the chain tip, and
/// submissions have side effects.
pub const NON_CACHEABLE_METHODS: &[&str] = &[
    "getaddressmempool",
    "getconnectioncount",
    "getmempoolancestors",
    "getmempooldescendants",
    "getmempoolentry",
    "getmempoolinfo",
    "getnettotals",
    "getnetworkinfo",
    "getpeerinfo",
    "getrawmempool",
    "ping",
    "sendrawtransaction",
    "submitblock",
    "testmempoolaccept",
    "uptime",
];

/// Build the cache key for a call
///
/// Object keys inside `params` are sorted recursively, so structurally equal
/// parameter lists always map to the same key.
pub fn cache_key(method: &str, params: &[Value]) -> String {
    let mut key = String::with_capacity(method.len() + 16);
    key.push_str(method);
    key.push(':');
    key.push('[');
    for (i, param) in params.iter().enumerate() {
        if i > 0 {
            key.push(',');
        }
        write_canonical(param, &mut key);
    }
    key.push(']');
    key
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<_> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (name, field)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical(field, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// A registered call in the cache
#[derive(Clone)]
pub struct CacheEntry {
    /// Unique id, used to remove exactly this entry after a failure
    pub id: u64,
    /// Method the entry was created for
    pub method: String,
    /// Shared result handle
    pub handle: SharedResult,
    /// When the entry was registered
    pub created_at: Instant,
}

impl CacheEntry {
    /// Whether the underlying call already produced a result
    pub fn is_resolved(&self) -> bool {
        self.handle.peek().is_some()
    }
}

/// Per-method observability counters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MethodCacheStats {
    /// Last time the method was requested
    pub last_seen: DateTime<Utc>,
    /// Number of requests for the method
    pub calls: u64,
    /// Whether results of this method are cached
    pub cacheable: bool,
}

/// Outcome of [`ResultCache::get_or_insert_with`]
pub enum CacheLookup {
    /// An entry already existed; `resolved` tells whether it had finished
    Hit {
        /// The shared handle of the existing entry
        handle: SharedResult,
        /// Whether the handle had already resolved at lookup time
        resolved: bool,
    },
    /// A new entry was registered from the supplied constructor
    Registered(SharedResult),
}

impl CacheLookup {
    /// The handle to await, regardless of how it was obtained
    pub fn handle(&self) -> SharedResult {
        match self {
            Self::Hit { handle, .. } | Self::Registered(handle) => handle.clone(),
        }
    }
}

/// Result cache keyed by (method, canonical params)
#[derive(Default)]
pub struct ResultCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    methods: Mutex<BTreeMap<String, MethodCacheStats>>,
    next_id: AtomicU64,
}

impl ResultCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Static classification of a method, independent of its parameters
    pub fn should_cache(method: &str) -> bool {
        !NON_CACHEABLE_METHODS.contains(&method)
    }

    /// Look up the handle registered for a call
    pub fn get(&self, method: &str, params: &[Value]) -> Option<SharedResult> {
        let key = cache_key(method, params);
        let handle = self.entries.lock().get(&key).map(|entry| entry.handle.clone());
        debug!("Cache {}: {}", if handle.is_some() { "hit" } else { "miss" }, key);
        handle
    }

    /// Register a handle for a call, replacing any previous entry
    ///
    /// Returns the id of the new entry.
    pub fn put(&self, method: &str, params: &[Value], handle: SharedResult) -> u64 {
        let key = cache_key(method, params);
        let entry = self.new_entry(method, handle);
        let id = entry.id;
        self.entries.lock().insert(key, entry);
        id
    }

    /// Return the existing handle for a call or register the one built by `make`
    ///
    /// Lookup and registration happen under one lock, so concurrent identical
    /// calls always end up sharing a single handle. `make` receives the cache
    /// key and the id of the entry it is building; it must not block.
    pub fn get_or_insert_with<F>(&self, method: &str, params: &[Value], make: F) -> CacheLookup
    where
        F: FnOnce(&str, u64) -> SharedResult,
    {
        let key = cache_key(method, params);
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get(&key) {
            let resolved = entry.is_resolved();
            debug!("Cache hit ({}): {}", if resolved { "resolved" } else { "in flight" }, key);
            return CacheLookup::Hit { handle: entry.handle.clone(), resolved };
        }

        debug!("Cache miss: {}", key);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = make(&key, id);
        entries.insert(
            key,
            CacheEntry {
                id,
                method: method.to_string(),
                handle: handle.clone(),
                created_at: Instant::now(),
            },
        );
        CacheLookup::Registered(handle)
    }

    /// Remove the entry for a call
    pub fn remove(&self, method: &str, params: &[Value]) -> bool {
        self.entries.lock().remove(&cache_key(method, params)).is_some()
    }

    /// Remove the entry under `key` only if it is still the entry with `id`
    ///
    /// A bulk clear followed by a new registration for the same key must not
    /// be undone by the failure of the older call.
    pub fn remove_entry(&self, key: &str, id: u64) -> bool {
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|entry| entry.id == id) {
            entries.remove(key);
            debug!("Removed failed entry from cache: {}", key);
            true
        } else {
            false
        }
    }

    /// Drop every entry, returning how many were removed
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let removed = entries.len();
        entries.clear();
        removed
    }

    /// All keys currently cached
    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Number of cached entries per method
    pub fn counts_by_method(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.entries.lock().values() {
            *counts.entry(entry.method.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Age of the oldest entry, i.e. how long ago the cache was last cleared
    pub fn oldest_entry_age(&self) -> Option<Duration> {
        self.entries.lock().values().map(|entry| entry.created_at.elapsed()).max()
    }

    /// Note a request for `method`
    pub fn record_method(&self, method: &str) {
        let mut methods = self.methods.lock();
        let stats = methods.entry(method.to_string()).or_insert_with(|| MethodCacheStats {
            last_seen: Utc::now(),
            calls: 0,
            cacheable: Self::should_cache(method),
        });
        stats.last_seen = Utc::now();
        stats.calls = stats.calls.saturating_add(1);
    }

    /// Per-method statistics, ordered by method name
    pub fn methods(&self) -> BTreeMap<String, MethodCacheStats> {
        self.methods.lock().clone()
    }

    fn new_entry(&self, method: &str, handle: SharedResult) -> CacheEntry {
        CacheEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: method.to_string(),
            handle,
            created_at: Instant::now(),
        }
    }
}
