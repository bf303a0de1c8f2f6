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

//! Chain tip tracking that keeps the result cache valid
//!
//! Every inbound call awaits a tip probe before touching the cache. Probes are
//! shared: while one is outstanding, all callers join it, and the slot is
//! emptied on a fixed short interval so a new probe is issued at most once
//! per window no matter how many requests arrive.

use crate::{
    cache::ResultCache,
    errors::ProxyError,
    providers::{NodePool, TIP_METHOD},
};
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// How often the in-flight probe slot is emptied
pub const PROBE_RESET_INTERVAL: Duration = Duration::from_millis(300);

type TipProbe = Shared<BoxFuture<'static, Result<String, ProxyError>>>;

/// Detects chain tip changes and clears the result cache when one happens
pub struct FreshnessGate {
    pool: Arc<NodePool>,
    cache: Arc<ResultCache>,
    probe: Mutex<Option<TipProbe>>,
    last_tip: Mutex<Option<String>>,
}

impl FreshnessGate {
    /// Create a gate that has not observed any tip yet
    pub fn new(pool: Arc<NodePool>, cache: Arc<ResultCache>) -> Self {
        Self { pool, cache, probe: Mutex::new(None), last_tip: Mutex::new(None) }
    }

    /// Make sure the cache belongs to the current chain tip
    ///
    /// Joins the outstanding probe or starts one. When the probe reports a tip
    /// that differs from the last one seen, the cache is cleared. A failed
    /// probe leaves both the cache and the tip marker untouched.
    pub async fn ensure_fresh(&self) -> Result<String, ProxyError> {
        let tip = self.current_probe().await?;
        self.observe_tip(&tip);
        Ok(tip)
    }

    fn current_probe(&self) -> TipProbe {
        let mut slot = self.probe.lock();
        if let Some(probe) = slot.as_ref() {
            return probe.clone();
        }

        let endpoint = self.pool.select_endpoint();
        debug!("Probing chain tip on {}", endpoint.name());

        let probe = async move {
            match endpoint.call(TIP_METHOD, &[]).await? {
                Value::String(tip) => Ok(tip),
                other => Err(ProxyError::InvalidResponse {
                    node: endpoint.name().to_string(),
                    message: format!("{TIP_METHOD} returned {other}"),
                }),
            }
        }
        .boxed()
        .shared();

        *slot = Some(probe.clone());
        probe
    }

    /// Record `tip`, clearing the cache if it is new; returns whether it was
    fn observe_tip(&self, tip: &str) -> bool {
        let mut last_tip = self.last_tip.lock();
        if last_tip.as_deref() == Some(tip) {
            return false;
        }

        let removed = self.cache.clear();
        info!(
            "New chain tip {} (previous {}), cleared {} cached entries",
            tip,
            last_tip.as_deref().unwrap_or("none"),
            removed
        );
        *last_tip = Some(tip.to_string());
        true
    }

    /// Forget the in-flight probe so the next caller issues a new one
    pub fn reset_probe(&self) {
        self.probe.lock().take();
    }

    /// The last tip observed by a successful probe
    pub fn last_tip(&self) -> Option<String> {
        self.last_tip.lock().clone()
    }

    /// Spawn the loop that empties the probe slot every `window`
    pub fn start_probe_reset(self: &Arc<Self>, window: Duration) -> JoinHandle<()> {
        let gate = Arc::clone(self);
        let mut ticker = tokio::time::interval(window);
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                gate.reset_probe();
            }
        })
    }
}
