//! Access-token management for ArcGIS layers.
//!
//! Provides:
//! - [`Credential`]: token + expiry + the referer it was issued for
//! - [`CredentialStore`]: durable credential state keyed by (layer, direction)
//! - [`TokenIssuer`]: the `generateToken` call
//! - [`AuthCache`]: just-in-time refresh with one refresh in flight per scope
//!
//! ## Design Decisions
//! - Layer configuration stays immutable; only the store is mutated, and only
//!   through the cache.
//! - The referer is always recorded next to the token. A cached token with no
//!   referer is treated as expired.
//! - How much validity must remain is decided by the caller, see
//!   [`PULL_GUARD`] and [`PUSH_GUARD`].

pub mod cache;
pub mod issuer;
pub mod store;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Direction;

pub use cache::AuthCache;
pub use issuer::{ArcgisTokenIssuer, TokenIssuer, TokenRequest};
pub use store::{CredentialStore, FileCredentialStore, MemoryCredentialStore};

/// Remaining validity required before a pull reuses a token.
pub const PULL_GUARD: Duration = Duration::from_secs(60 * 60);

/// Remaining validity required before a push batch reuses a token.
pub const PUSH_GUARD: Duration = Duration::from_secs(5);

/// Token lifetime requested from the issuer, in minutes. Must exceed every
/// guard window, or a freshly issued token could never be reused.
pub const TOKEN_LIFETIME_MINUTES: u32 = 120;

/// An issued access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    /// Referer the token was issued for; must accompany every request.
    #[serde(default)]
    pub referer: Option<String>,
}

impl Credential {
    /// Usable when paired with a referer and valid for longer than `guard`.
    pub fn is_usable(&self, now: DateTime<Utc>, guard: Duration) -> bool {
        if self.token.is_empty() || self.referer.is_none() {
            return false;
        }
        self.expires_at
            .signed_duration_since(now)
            .to_std()
            .map(|remaining| remaining > guard)
            .unwrap_or(false)
    }
}

/// Outcome of one issuance call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResponse {
    Issued {
        token: String,
        expires_at: DateTime<Utc>,
        referer: String,
    },
    Rejected {
        reason: String,
    },
}

/// Which credential a caller needs: one per layer and direction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CredentialScope {
    pub layer_id: String,
    pub direction: Direction,
}

impl CredentialScope {
    pub fn new(layer_id: impl Into<String>, direction: Direction) -> Self {
        Self {
            layer_id: layer_id.into(),
            direction,
        }
    }

    /// Stable key used by the file store.
    pub fn key(&self) -> String {
        format!("{}:{}", self.layer_id, self.direction)
    }
}

impl std::fmt::Display for CredentialScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "layer {} ({})", self.layer_id, self.direction)
    }
}
