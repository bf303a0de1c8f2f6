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

//! Static proxy configuration loaded from a JSON document

use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Default config file name, resolved relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Port used when neither the config, the CLI nor `PORT` provide one
pub const FALLBACK_PORT: u16 = 80;

/// Example document printed when no configuration can be loaded
pub const CONFIG_TEMPLATE: &str = r#"{
    "concurrency": 4,
    "endpoint": "https://rpc-main.neurai.org/rpc",
    "environment": "Neurai",
    "local_port": 19999,
    "nodes": [
        {
            "name": "Node number 1",
            "username": "dauser",
            "password": "dapassword",
            "neurai_url": "http://localhost:19001",
            "depin_enabled": true,
            "depin_url": "http://localhost:19002"
        },
        {
            "name": "Node number 2 (no DePIN)",
            "username": "secret",
            "password": "secret",
            "neurai_url": "http://localhost:19101",
            "depin_enabled": false
        },
        {
            "name": "Node number 3 (DePIN auto-port)",
            "username": "user3",
            "password": "pass3",
            "neurai_url": "http://localhost:19001",
            "depin_enabled": true
        }
    ]
}"#;

/// One upstream Neurai node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Display name
    pub name: String,
    /// RPC username
    #[serde(default)]
    pub username: Option<String>,
    /// RPC password
    #[serde(default)]
    pub password: Option<String>,
    /// Node RPC URL
    pub neurai_url: String,
    /// Whether this node also serves the authenticated DePIN protocol
    #[serde(default)]
    pub depin_enabled: bool,
    /// Explicit DePIN URL; derived from `neurai_url` when absent
    #[serde(default)]
    pub depin_url: Option<String>,
}

impl NodeConfig {
    /// Basic-auth credentials, present only when a username is configured
    pub fn credentials(&self) -> Option<(String, String)> {
        self.username
            .as_ref()
            .map(|user| (user.clone(), self.password.clone().unwrap_or_default()))
    }
}

/// Top level configuration document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Maximum number of concurrent upstream calls (0 is treated as 1)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Public endpoint advertised through `/settings`
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Environment label advertised through `/settings`
    #[serde(default)]
    pub environment: Option<String>,
    /// Page heading advertised through `/settings`
    #[serde(default)]
    pub heading: Option<String>,
    /// Port to serve on
    #[serde(default)]
    pub local_port: Option<u16>,
    /// Upstream nodes in failover order
    pub nodes: Vec<NodeConfig>,
    /// Methods allowed through the proxy; the built-in list when absent
    #[serde(default)]
    pub whitelist: Option<Vec<String>>,
    /// Directory served as static files
    #[serde(default)]
    pub static_dir: Option<String>,
}

fn default_concurrency() -> usize {
    1
}

impl ProxyConfig {
    /// Parse and validate a configuration document
    pub fn from_json(content: &str) -> Result<Self> {
        let mut config: Self =
            serde_json::from_str(content).wrap_err("Config is not a valid proxy configuration")?;
        config.normalize()?;
        Ok(config)
    }

    /// Load and validate the configuration file at `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .wrap_err_with(|| format!("Could not read {}", path.display()))?;
        Self::from_json(&content).wrap_err_with(|| format!("Invalid config in {}", path.display()))
    }

    fn normalize(&mut self) -> Result<()> {
        if self.nodes.is_empty() {
            eyre::bail!("At least one node must be configured");
        }
        if let Some(node) = self.nodes.iter().find(|n| n.neurai_url.trim().is_empty()) {
            eyre::bail!("Node '{}' has an empty neurai_url", node.name);
        }
        if self.concurrency == 0 {
            self.concurrency = 1;
        }
        Ok(())
    }

    /// Resolve the listening port: explicit override, config, `PORT`, then 80
    pub fn resolve_port(&self, cli_port: Option<u16>) -> u16 {
        cli_port
            .or(self.local_port)
            .or_else(|| std::env::var("PORT").ok().and_then(|p| p.parse().ok()))
            .unwrap_or(FALLBACK_PORT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_template_is_valid_config() {
        let config = ProxyConfig::from_json(CONFIG_TEMPLATE).unwrap();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.local_port, Some(19999));
        assert_eq!(config.nodes.len(), 3);
        assert!(config.nodes[0].depin_enabled);
        assert_eq!(config.nodes[0].depin_url.as_deref(), Some("http://localhost:19002"));
        assert!(!config.nodes[1].depin_enabled);
        assert!(config.nodes[2].depin_url.is_none());
    }

    #[test]
    fn test_defaults_and_zero_concurrency() {
        let config = ProxyConfig::from_json(
            r#"{"nodes": [{"name": "a", "neurai_url": "http://localhost:19001"}]}"#,
        )
        .unwrap();
        assert_eq!(config.concurrency, 1);
        assert!(config.nodes[0].credentials().is_none());
        assert!(!config.nodes[0].depin_enabled);

        let config = ProxyConfig::from_json(
            r#"{"concurrency": 0, "nodes": [{"name": "a", "neurai_url": "http://x:1"}]}"#,
        )
        .unwrap();
        assert_eq!(config.concurrency, 1);
    }

    #[test]
    fn test_rejects_empty_node_list() {
        assert!(ProxyConfig::from_json(r#"{"nodes": []}"#).is_err());
        assert!(ProxyConfig::from_json(r#"{"concurrency": 2}"#).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let error = ProxyConfig::load(temp_dir.path().join("config.json")).unwrap_err();
        assert!(error.to_string().contains("Could not read"));
    }

    #[test]
    fn test_load_from_disk() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(&path, CONFIG_TEMPLATE).unwrap();

        let config = ProxyConfig::load(&path).unwrap();
        assert_eq!(config.environment.as_deref(), Some("Neurai"));
        assert_eq!(
            config.nodes[0].credentials(),
            Some(("dauser".to_string(), "dapassword".to_string()))
        );
    }

    #[test]
    fn test_port_precedence() {
        let config = ProxyConfig::from_json(CONFIG_TEMPLATE).unwrap();
        assert_eq!(config.resolve_port(Some(8080)), 8080);
        assert_eq!(config.resolve_port(None), 19999);
    }
}
