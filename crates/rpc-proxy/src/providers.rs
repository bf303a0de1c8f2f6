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

//! Upstream node pool with health checking and first-active failover
//!
//! Selection is deliberately simple: the first endpoint in configured order
//! that passed its last health check wins, and when none did the first
//! configured endpoint is returned anyway. There is no latency ranking.

use crate::{
    config::NodeConfig,
    errors::ProxyError,
    transport::{DePinTransport, HttpDePinTransport, HttpRpcTransport, RpcTransport},
};
use eyre::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Interval between two health check cycles
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Upper bound for a single liveness probe
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// DePIN endpoint used when none is configured at all
pub const DEFAULT_DEPIN_URL: &str = "http://localhost:19002";

/// Display name of [`DEFAULT_DEPIN_URL`]
pub const DEFAULT_DEPIN_NAME: &str = "Default DePIN";

/// Chain tip query used as the RPC liveness probe
pub const TIP_METHOD: &str = "getbestblockhash";

/// Well-known (RPC port, DePIN port) pairs: mainnet and testnet
const DEPIN_PORT_PAIRS: &[(u16, u16)] = &[(19001, 19002), (19101, 19102)];

/// Body of the DePIN liveness probe
const DEPIN_PING: &str = "PING\n";

#[derive(Debug, Clone, Default)]
struct EndpointState {
    active: bool,
    last_observed_tip: Option<String>,
    last_health_check: Option<Instant>,
}

/// One upstream Neurai node and its liveness state
pub struct Endpoint {
    name: String,
    url: String,
    transport: Arc<dyn RpcTransport>,
    state: RwLock<EndpointState>,
}

impl Endpoint {
    /// Create an endpoint that starts out inactive until its first health check
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        transport: Arc<dyn RpcTransport>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            transport,
            state: RwLock::new(EndpointState::default()),
        }
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node RPC URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the last health check succeeded
    pub fn is_active(&self) -> bool {
        self.state.read().active
    }

    /// Tip reported by the last successful health check
    pub fn last_observed_tip(&self) -> Option<String> {
        self.state.read().last_observed_tip.clone()
    }

    /// Issue an RPC call through this endpoint's transport
    pub async fn call(&self, method: &str, params: &[Value]) -> Result<Value, ProxyError> {
        self.transport.call(method, params).await
    }

    fn record_success(&self, tip: String) {
        let mut state = self.state.write();
        if !state.active {
            info!("Node {} is now active (tip {})", self.name, tip);
        }
        state.active = true;
        state.last_observed_tip = Some(tip);
        state.last_health_check = Some(Instant::now());
    }

    fn record_failure(&self, reason: &str) {
        let mut state = self.state.write();
        if state.active {
            warn!("Node {} is now inactive: {}", self.name, reason);
        } else {
            debug!("Health check failed for {}: {}", self.name, reason);
        }
        state.active = false;
        state.last_health_check = Some(Instant::now());
    }

    /// Serializable snapshot of this endpoint
    pub fn status(&self) -> EndpointStatus {
        let state = self.state.read();
        EndpointStatus {
            name: self.name.clone(),
            active: state.active,
            last_observed_tip: state.last_observed_tip.clone(),
            last_health_check_seconds_ago: state.last_health_check.map(|t| t.elapsed().as_secs()),
        }
    }
}

/// Serializable view of an [`Endpoint`] for API responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointStatus {
    /// Display name
    pub name: String,
    /// Whether the last health check succeeded
    pub active: bool,
    /// Best block hash seen by the last successful health check
    pub last_observed_tip: Option<String>,
    /// Seconds since the last health check
    pub last_health_check_seconds_ago: Option<u64>,
}

#[derive(Debug, Clone, Default)]
struct DePinState {
    active: bool,
    last_health_check: Option<Instant>,
}

/// One authenticated DePIN upstream
pub struct DePinEndpoint {
    name: String,
    url: String,
    state: RwLock<DePinState>,
}

impl DePinEndpoint {
    /// Create a DePIN endpoint that starts out inactive
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self { name: name.into(), url: url.into(), state: RwLock::new(DePinState::default()) }
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// DePIN URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the last ping succeeded
    pub fn is_active(&self) -> bool {
        self.state.read().active
    }

    fn record(&self, active: bool) {
        let mut state = self.state.write();
        if state.active != active {
            info!("DePIN node {} is now {}", self.name, if active { "active" } else { "inactive" });
        }
        state.active = active;
        state.last_health_check = Some(Instant::now());
    }

    fn target(&self) -> DePinTarget {
        DePinTarget { name: self.name.clone(), url: self.url.clone() }
    }

    /// Serializable snapshot of this endpoint
    pub fn status(&self) -> DePinEndpointStatus {
        let state = self.state.read();
        DePinEndpointStatus {
            name: self.name.clone(),
            depin_url: self.url.clone(),
            active: state.active,
            last_health_check_seconds_ago: state.last_health_check.map(|t| t.elapsed().as_secs()),
        }
    }
}

/// The DePIN endpoint chosen for a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DePinTarget {
    /// Display name
    pub name: String,
    /// DePIN URL
    pub url: String,
}

/// Serializable view of a [`DePinEndpoint`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DePinEndpointStatus {
    /// Display name
    pub name: String,
    /// DePIN URL
    pub depin_url: String,
    /// Whether the last ping succeeded
    pub active: bool,
    /// Seconds since the last ping
    pub last_health_check_seconds_ago: Option<u64>,
}

/// Derive a DePIN URL from a node RPC URL by port substitution
///
/// Only the well-known mainnet (19001 → 19002) and testnet (19101 → 19102)
/// ports are recognized; anything else yields `None`.
pub fn derive_depin_url(rpc_url: &str) -> Option<String> {
    let mut url = reqwest::Url::parse(rpc_url).ok()?;
    let port = url.port()?;
    let (_, depin_port) = DEPIN_PORT_PAIRS.iter().find(|(rpc, _)| *rpc == port)?;
    url.set_port(Some(*depin_port)).ok()?;

    // Url normalizes an empty path to "/", keep the configured spelling
    let mut derived = url.to_string();
    if !rpc_url.ends_with('/') && url.path() == "/" {
        derived.pop();
    }
    Some(derived)
}

/// Upstream node pool for the plain and the DePIN paths
pub struct NodePool {
    nodes: Vec<Arc<Endpoint>>,
    depin_nodes: Vec<DePinEndpoint>,
    depin_transport: Arc<dyn DePinTransport>,
    probe_timeout: Duration,
}

impl NodePool {
    /// Create a pool from already constructed endpoints
    ///
    /// Fails when `nodes` is empty, so selection can always fall back to the
    /// first configured endpoint.
    pub fn new(
        nodes: Vec<Endpoint>,
        depin_nodes: Vec<DePinEndpoint>,
        depin_transport: Arc<dyn DePinTransport>,
    ) -> Result<Self> {
        if nodes.is_empty() {
            eyre::bail!("Node pool requires at least one endpoint");
        }

        Ok(Self {
            nodes: nodes.into_iter().map(Arc::new).collect(),
            depin_nodes,
            depin_transport,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        })
    }

    /// Override the per-probe timeout
    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    /// Build HTTP endpoints for every configured node
    ///
    /// DePIN endpoints are created only for nodes with `depin_enabled`, using
    /// the explicit `depin_url` or the port-derived one.
    pub fn from_config(nodes: &[NodeConfig], request_timeout: Duration) -> Result<Self> {
        let mut endpoints = Vec::with_capacity(nodes.len());
        let mut depin_endpoints = Vec::new();

        for node in nodes {
            let transport = HttpRpcTransport::new(
                node.name.clone(),
                node.neurai_url.clone(),
                node.credentials(),
                request_timeout,
            )?;
            endpoints.push(Endpoint::new(&node.name, &node.neurai_url, Arc::new(transport)));
            info!("  - {} ({})", node.name, node.neurai_url);

            if !node.depin_enabled {
                continue;
            }
            match node.depin_url.clone().or_else(|| derive_depin_url(&node.neurai_url)) {
                Some(depin_url) => {
                    info!("  - {} DePIN at {}", node.name, depin_url);
                    depin_endpoints.push(DePinEndpoint::new(&node.name, depin_url));
                }
                None => warn!(
                    "Node {} has DePIN enabled but no depin_url and {} has no known DePIN port",
                    node.name, node.neurai_url
                ),
            }
        }

        let depin_transport = Arc::new(HttpDePinTransport::new(request_timeout)?);
        Self::new(endpoints, depin_endpoints, depin_transport)
    }

    /// The first active endpoint, or the first configured one if none is active
    pub fn select_endpoint(&self) -> Arc<Endpoint> {
        let selected =
            self.nodes.iter().find(|node| node.is_active()).unwrap_or(&self.nodes[0]);
        Arc::clone(selected)
    }

    /// The first active DePIN endpoint, then the first configured, then the default
    pub fn select_depin_endpoint(&self) -> DePinTarget {
        self.depin_nodes
            .iter()
            .find(|node| node.is_active())
            .or_else(|| self.depin_nodes.first())
            .map(DePinEndpoint::target)
            .unwrap_or_else(|| DePinTarget {
                name: DEFAULT_DEPIN_NAME.to_string(),
                url: DEFAULT_DEPIN_URL.to_string(),
            })
    }

    /// Status of every RPC endpoint in configured order
    pub fn list_status(&self) -> Vec<EndpointStatus> {
        self.nodes.iter().map(|node| node.status()).collect()
    }

    /// Status of every DePIN endpoint in configured order
    pub fn list_depin_status(&self) -> Vec<DePinEndpointStatus> {
        self.depin_nodes.iter().map(DePinEndpoint::status).collect()
    }

    /// Number of RPC endpoints that passed their last health check
    pub fn active_count(&self) -> usize {
        self.nodes.iter().filter(|node| node.is_active()).count()
    }

    /// The transport shared by every DePIN endpoint
    pub fn depin_transport(&self) -> &Arc<dyn DePinTransport> {
        &self.depin_transport
    }

    /// Probe every endpoint once
    ///
    /// All probes run concurrently and are bounded by the probe timeout. A
    /// failing endpoint only affects its own state.
    pub async fn run_health_check(&self) {
        let rpc_checks = futures::future::join_all(
            self.nodes.iter().map(|node| self.check_endpoint(node)),
        );
        let depin_checks = futures::future::join_all(
            self.depin_nodes.iter().map(|node| self.check_depin_endpoint(node)),
        );
        futures::future::join(rpc_checks, depin_checks).await;

        debug!(
            "Health check complete: {}/{} nodes active",
            self.active_count(),
            self.nodes.len()
        );
    }

    async fn check_endpoint(&self, endpoint: &Endpoint) {
        match tokio::time::timeout(self.probe_timeout, endpoint.call(TIP_METHOD, &[])).await {
            Ok(Ok(Value::String(tip))) => endpoint.record_success(tip),
            Ok(Ok(other)) => endpoint.record_failure(&format!("unexpected tip value {other}")),
            Ok(Err(e)) => endpoint.record_failure(&e.to_string()),
            Err(_) => endpoint.record_failure("probe timed out"),
        }
    }

    async fn check_depin_endpoint(&self, endpoint: &DePinEndpoint) {
        let ping = self.depin_transport.post_text(endpoint.url(), DEPIN_PING.to_string());
        let active = match tokio::time::timeout(self.probe_timeout, ping).await {
            Ok(Ok(response)) => response.is_success(),
            Ok(Err(e)) => {
                debug!("DePIN ping failed for {}: {}", endpoint.name(), e);
                false
            }
            Err(_) => false,
        };
        endpoint.record(active);
    }

    /// Spawn the periodic health check loop; the first cycle runs immediately
    pub fn start_health_checks(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                pool.run_health_check().await;
            }
        })
    }
}
