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

//! Error types for upstream RPC calls, the DePIN authentication path and
//! inbound requests
//!
//! `ProxyError` is `Clone` because a single upstream outcome is shared by every
//! caller coalesced onto the same cache entry.

use serde_json::Value;
use thiserror::Error;

/// Failure of a plain (non-authenticated) upstream RPC call
#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    /// Network level failure talking to a node
    #[error("transport error from {node}: {message}")]
    Transport {
        /// Name of the node that failed
        node: String,
        /// Underlying error description
        message: String,
    },

    /// The call did not complete within its deadline
    #[error("request to {node} timed out after {after_ms}ms")]
    Timeout {
        /// Name of the node that timed out
        node: String,
        /// Deadline that elapsed, in milliseconds
        after_ms: u64,
    },

    /// Non-success HTTP status without a JSON-RPC error body
    #[error("node {node} answered with HTTP {status}: {body}")]
    Http {
        /// Name of the node
        node: String,
        /// HTTP status code
        status: u16,
        /// Raw response body (truncated)
        body: String,
    },

    /// The node answered with something that is not a JSON-RPC response
    #[error("invalid response from {node}: {message}")]
    InvalidResponse {
        /// Name of the node
        node: String,
        /// What was wrong with the response
        message: String,
    },

    /// The node answered with a JSON-RPC error object
    #[error("RPC error from {node}: {error}")]
    Rpc {
        /// Name of the node
        node: String,
        /// The error object exactly as returned by the node
        error: Value,
    },

    /// The dispatch task was dropped or panicked before producing a result
    #[error("dispatch task failed: {0}")]
    TaskFailed(String),
}

impl ProxyError {
    /// The error as it is reported to HTTP clients
    ///
    /// JSON-RPC error objects are forwarded verbatim, everything else is
    /// rendered as its message.
    pub fn to_client_error(&self) -> Value {
        match self {
            Self::Rpc { error, .. } => error.clone(),
            other => Value::String(other.to_string()),
        }
    }

    /// Name of the node the error originated from, if any
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::Transport { node, .. }
            | Self::Timeout { node, .. }
            | Self::Http { node, .. }
            | Self::InvalidResponse { node, .. }
            | Self::Rpc { node, .. } => Some(node),
            Self::TaskFailed(_) => None,
        }
    }
}

/// Failure on the authenticated DePIN path
#[derive(Debug, Clone, Error)]
pub enum DePinError {
    /// The challenge endpoint answered with a non-success status
    #[error("Failed to request challenge: {status} {body}")]
    ChallengeRequest {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// The challenge response did not match `CHALLENGE <hex> <seconds>`
    #[error("Invalid challenge response: {0}")]
    InvalidChallenge(String),

    /// Network level failure talking to the DePIN endpoint
    #[error("DePIN transport error: {0}")]
    Transport(String),

    /// The authenticated submission was rejected with a non-success status
    #[error("DePIN request failed: {status} {body}")]
    Rejected {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// The authenticated submission returned a JSON-RPC error object
    #[error("DePIN RPC error: {0}")]
    Rpc(Value),

    /// The submission response was not valid JSON
    #[error("Invalid DePIN response: {0}")]
    InvalidResponse(String),

    /// The signer could not produce a signature
    #[error("Failed to sign challenge: {0}")]
    Signer(String),
}

impl DePinError {
    /// Whether the endpoint rejected the submission because its challenge expired
    ///
    /// Only rejections of a submitted request qualify; failures while obtaining
    /// or signing a challenge never do.
    pub fn is_challenge_expired(&self) -> bool {
        match self {
            Self::Rejected { body, .. } => body.to_lowercase().contains("expired"),
            Self::Rpc(error) => error.to_string().to_lowercase().contains("expired"),
            _ => false,
        }
    }
}

/// Failure of an inbound request, as seen by the HTTP layer
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    /// The request body is missing a field or has one of the wrong type
    #[error("{error}")]
    InvalidRequest {
        /// Short error message
        error: String,
        /// Explanation for the client
        description: String,
    },

    /// The method (or this use of it) is not allowed
    #[error("Not in whitelist: {description}")]
    NotWhitelisted {
        /// Explanation for the client
        description: String,
    },

    /// The plain path failed upstream
    #[error(transparent)]
    Upstream(#[from] ProxyError),

    /// The authenticated path failed
    #[error(transparent)]
    DePin(#[from] DePinError),
}

impl RequestError {
    /// HTTP status code reported to the client
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest { .. } => 400,
            Self::NotWhitelisted { .. } => 404,
            Self::Upstream(_) | Self::DePin(_) => 500,
        }
    }

    /// JSON body reported to the client
    pub fn to_body(&self) -> Value {
        match self {
            Self::InvalidRequest { error, description } => {
                serde_json::json!({ "error": error, "description": description })
            }
            Self::NotWhitelisted { description } => {
                serde_json::json!({ "error": "Not in whitelist", "description": description })
            }
            Self::Upstream(error) => match error.node() {
                Some(node) => serde_json::json!({ "error": error.to_client_error(), "node": node }),
                None => serde_json::json!({ "error": error.to_client_error() }),
            },
            Self::DePin(error) => serde_json::json!({ "error": error.to_string() }),
        }
    }
}
