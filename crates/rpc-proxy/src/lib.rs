// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
// SPDX-License-Identifier: AGPL-3.0
//! Neurai RPC Proxy Library
//!
//! A caching, load-balancing gateway that sits between clients and a pool of
//! Neurai nodes. Identical concurrent calls share one upstream request, results
//! stay cached until the chain tip moves, and upstream work is bounded by a FIFO
//! dispatch queue. A separate DePIN path forwards calls that are authenticated
//! with a per-address challenge.

pub mod cache;
pub mod challenge;
pub mod config;
pub mod depin;
pub mod errors;
pub mod freshness;
pub mod health;
pub mod metrics;
pub mod providers;
pub mod proxy;
pub mod queue;
pub mod rpc;
pub mod transport;
pub mod whitelist;

#[cfg(test)]
mod test_utils;

pub use cache::{CacheEntry, ResultCache};
pub use errors::{DePinError, ProxyError, RequestError};
pub use proxy::{ProxyServer, ProxyServerBuilder};
pub use rpc::RpcHandler;
