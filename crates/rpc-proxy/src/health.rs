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

//! Service liveness and public settings

use crate::config::ProxyConfig;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Name reported by the health endpoints
pub const SERVICE_NAME: &str = "neurai-rpc-proxy";

/// The parts of the configuration that are safe to publish
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicSettings {
    /// Page heading
    pub heading: Option<String>,
    /// Environment label
    pub environment: Option<String>,
    /// Public RPC endpoint
    pub endpoint: Option<String>,
}

impl From<&ProxyConfig> for PublicSettings {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            heading: config.heading.clone(),
            environment: config.environment.clone(),
            endpoint: config.endpoint.clone(),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Health check service for monitoring proxy status
pub struct HealthService {
    start_time: u64,
    settings: PublicSettings,
}

impl HealthService {
    /// Create the service, recording now as the start time
    pub fn new(settings: PublicSettings) -> Self {
        Self { start_time: unix_now(), settings }
    }

    /// Seconds since the service started
    pub fn uptime_secs(&self) -> u64 {
        unix_now().saturating_sub(self.start_time)
    }

    /// Simple liveness answer
    pub fn ping(&self) -> Value {
        json!({
            "status": "ok",
            "service": SERVICE_NAME,
            "timestamp": unix_now(),
        })
    }

    /// Version, uptime and process information
    pub fn info(&self) -> Value {
        json!({
            "service": SERVICE_NAME,
            "version": env!("CARGO_PKG_VERSION"),
            "uptime": self.uptime_secs(),
            "started_at": self.start_time,
            "pid": std::process::id(),
        })
    }

    /// Public configuration served on `/settings`
    pub fn settings(&self) -> &PublicSettings {
        &self.settings
    }
}
