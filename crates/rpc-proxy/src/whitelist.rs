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

//! Methods the proxy is willing to forward

use serde_json::Value;

/// Read-only Neurai methods allowed when the config provides no whitelist
pub const DEFAULT_WHITELIST: &[&str] = &[
    "decoderawtransaction",
    "decodescript",
    "estimatesmartfee",
    "getaddressbalance",
    "getaddressdeltas",
    "getaddressmempool",
    "getaddresstxids",
    "getaddressutxos",
    "getassetdata",
    "getbestblockhash",
    "getblock",
    "getblockchaininfo",
    "getblockcount",
    "getblockhash",
    "getblockheader",
    "getchaintips",
    "getchaintxstats",
    "getdifficulty",
    "getmempoolinfo",
    "getmininginfo",
    "getnetworkhashps",
    "getrawmempool",
    "getrawtransaction",
    "getspentinfo",
    "gettxout",
    "listaddressesbyasset",
    "listassetbalancesbyaddress",
    "listassets",
    "sendrawtransaction",
    "validateaddress",
    "verifymessage",
];

/// Method filter applied to both the plain and the DePIN routes
#[derive(Debug, Clone)]
pub struct Whitelist {
    methods: Vec<String>,
}

impl Default for Whitelist {
    fn default() -> Self {
        Self::new(DEFAULT_WHITELIST.iter().map(|m| m.to_string()).collect())
    }
}

impl Whitelist {
    /// Allow exactly `methods`
    pub fn new(methods: Vec<String>) -> Self {
        Self { methods }
    }

    /// Use the configured list, or the default one
    pub fn from_config(methods: Option<Vec<String>>) -> Self {
        methods.map(Self::new).unwrap_or_default()
    }

    /// Allowed methods in configured order
    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    /// Check a call, returning the rejection description on failure
    pub fn check(&self, method: &str, params: &[Value]) -> Result<(), String> {
        if !self.methods.iter().any(|m| m == method) {
            return Err(format!("Method {method} is not supported"));
        }

        // totalCount = true makes the node walk every holder of the asset
        if method == "listaddressesbyasset" && params.get(1) == Some(&Value::Bool(true)) {
            return Err(format!(
                "Method {method} with totalCount set to true is not whitelisted. \
                 Please use {method} without totalCount = true"
            ));
        }

        Ok(())
    }

    /// Whether a call may be forwarded
    pub fn is_whitelisted(&self, method: &str, params: &[Value]) -> bool {
        self.check(method, params).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_whitelist() {
        let whitelist = Whitelist::default();
        assert!(whitelist.is_whitelisted("getassetdata", &[json!("GOLD")]));
        assert!(whitelist.is_whitelisted("getbestblockhash", &[]));
        assert!(!whitelist.is_whitelisted("stop", &[]));
        assert!(!whitelist.is_whitelisted("dumpprivkey", &[json!("addr")]));

        let description = whitelist.check("stop", &[]).unwrap_err();
        assert_eq!(description, "Method stop is not supported");
    }

    #[test]
    fn test_listaddressesbyasset_total_count() {
        let whitelist = Whitelist::default();
        assert!(whitelist.is_whitelisted("listaddressesbyasset", &[json!("GOLD")]));
        assert!(whitelist.is_whitelisted("listaddressesbyasset", &[json!("GOLD"), json!(false)]));

        let description =
            whitelist.check("listaddressesbyasset", &[json!("GOLD"), json!(true)]).unwrap_err();
        assert!(description.contains("totalCount set to true"));
    }

    #[test]
    fn test_configured_whitelist() {
        let whitelist = Whitelist::from_config(Some(vec!["getinfo".to_string()]));
        assert_eq!(whitelist.methods(), ["getinfo".to_string()]);
        assert!(whitelist.is_whitelisted("getinfo", &[]));
        assert!(!whitelist.is_whitelisted("getassetdata", &[]));

        assert_eq!(Whitelist::from_config(None).methods().len(), DEFAULT_WHITELIST.len());
    }
}
