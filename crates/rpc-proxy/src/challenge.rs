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

//! Per (endpoint, identity) cache of DePIN authentication challenges
//!
//! A challenge is requested with `AUTH <identity>\n` and answered with
//! `CHALLENGE <hex> <seconds>`. It is reused until five seconds before the
//! declared timeout, so a signature is never produced for a challenge the
//! endpoint is about to reject.

use crate::{
    errors::DePinError,
    transport::{truncate, DePinTransport},
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::Instant};
use tracing::debug;

/// Safety margin subtracted from the declared challenge timeout
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(5);

/// Interval between two sweeps of expired challenges
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// An issued challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Hex token to be signed
    pub token: String,
    /// Timeout declared by the endpoint, in seconds
    pub timeout_secs: u64,
    /// Instant after which the challenge is no longer handed out
    pub expires_at: Instant,
}

impl Challenge {
    fn is_valid_at(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// One entry in [`ChallengeStats`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeInfo {
    /// `<url>:<identity>`
    pub key: String,
    /// Wall-clock expiry
    pub expires_at: DateTime<Utc>,
    /// Whether the challenge would still be handed out
    pub is_valid: bool,
}

/// Snapshot of the challenge cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeStats {
    /// Number of stored challenges
    pub total_challenges: usize,
    /// Challenges that are still valid
    pub valid_challenges: usize,
    /// Challenges waiting for the sweeper
    pub expired_challenges: usize,
    /// Per-challenge details
    pub challenges: Vec<ChallengeInfo>,
}

/// Parse a `CHALLENGE <hex> <seconds>` line
///
/// A single trailing line terminator is accepted.
pub fn parse_challenge(text: &str) -> Result<(String, u64), DePinError> {
    let line = text
        .strip_suffix("\r\n")
        .or_else(|| text.strip_suffix('\n'))
        .unwrap_or(text);
    let invalid = || DePinError::InvalidChallenge(truncate(text));

    let mut parts = line.split(' ');
    let (Some("CHALLENGE"), Some(token), Some(timeout), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };

    let is_hex = |c: char| c.is_ascii_digit() || ('a'..='f').contains(&c);
    if token.is_empty() || !token.chars().all(is_hex) {
        return Err(invalid());
    }
    if timeout.is_empty() || !timeout.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let timeout = timeout.parse().map_err(|_| invalid())?;

    Ok((token.to_string(), timeout))
}

type ChallengeKey = (String, String);

/// Challenge cache keyed by (endpoint URL, identity)
pub struct ChallengeCache {
    transport: Arc<dyn DePinTransport>,
    entries: Mutex<HashMap<ChallengeKey, Challenge>>,
}

impl ChallengeCache {
    /// Create an empty cache that requests challenges through `transport`
    pub fn new(transport: Arc<dyn DePinTransport>) -> Self {
        Self { transport, entries: Mutex::new(HashMap::new()) }
    }

    /// Return a valid challenge for (url, identity), requesting one if needed
    pub async fn request_challenge(
        &self,
        url: &str,
        identity: &str,
    ) -> Result<Challenge, DePinError> {
        let key = (url.to_string(), identity.to_string());
        let cached =
            self.entries.lock().get(&key).filter(|c| c.is_valid_at(Instant::now())).cloned();
        if let Some(challenge) = cached {
            debug!("Reusing challenge for {} at {}", identity, url);
            return Ok(challenge);
        }

        debug!("Requesting challenge for {} at {}", identity, url);
        let response = self.transport.post_text(url, format!("AUTH {identity}\n")).await?;
        if !response.is_success() {
            return Err(DePinError::ChallengeRequest {
                status: response.status,
                body: truncate(&response.body),
            });
        }

        let (token, timeout_secs) = parse_challenge(&response.body)?;
        let lifetime = Duration::from_secs(timeout_secs).saturating_sub(EXPIRY_MARGIN);
        let expires_at = Instant::now()
            .checked_add(lifetime)
            .ok_or_else(|| DePinError::InvalidChallenge(truncate(&response.body)))?;
        let challenge = Challenge { token, timeout_secs, expires_at };

        self.entries.lock().insert(key, challenge.clone());
        Ok(challenge)
    }

    /// Drop the challenge for (url, identity)
    pub fn invalidate(&self, url: &str, identity: &str) -> bool {
        self.entries.lock().remove(&(url.to_string(), identity.to_string())).is_some()
    }

    /// Remove every expired challenge, returning how many were removed
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, challenge| challenge.is_valid_at(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!("Swept {} expired challenges", removed);
        }
        removed
    }

    /// Spawn the periodic sweep loop
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                cache.sweep_expired();
            }
        })
    }

    /// Number of stored challenges, expired ones included
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no challenge is stored
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every challenge
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Counts and per-challenge details
    pub fn stats(&self) -> ChallengeStats {
        let now = Instant::now();
        let wall_now = Utc::now();
        let entries = self.entries.lock();

        let challenges: Vec<_> = entries
            .iter()
            .map(|((url, identity), challenge)| {
                let expires_at = if challenge.expires_at >= now {
                    wall_now + to_delta(challenge.expires_at - now)
                } else {
                    wall_now - to_delta(now - challenge.expires_at)
                };
                ChallengeInfo {
                    key: format!("{url}:{identity}"),
                    expires_at,
                    is_valid: challenge.is_valid_at(now),
                }
            })
            .collect();

        let valid_challenges = challenges.iter().filter(|c| c.is_valid).count();
        ChallengeStats {
            total_challenges: challenges.len(),
            valid_challenges,
            expired_challenges: challenges.len() - valid_challenges,
            challenges,
        }
    }
}

fn to_delta(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}
