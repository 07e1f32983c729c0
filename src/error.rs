//! Error taxonomy for the sync pipelines.
//!
//! Pull treats every variant as fatal for the run. Push catches errors at
//! the per-record boundary, so only `Config` and `Auth` can stop a batch
//! before its fan-out starts.

use crate::geometry::GeometryType;

/// Library-wide result alias.
pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Missing or invalid settings. Raised before any network call.
    #[error("configuration error: {0}")]
    Config(String),

    /// Token issuance failed or returned nothing usable.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network failure or non-success HTTP status.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote answered 200 but carried an error payload.
    #[error("remote service error: {0}")]
    Remote(String),

    /// No remote destination or projection exists for this geometry type.
    #[error("unsupported geometry type: {0}")]
    UnsupportedGeometry(GeometryType),

    /// A payload could not be decoded into the expected shape.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether the error came from the remote side (network or payload).
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Remote(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
