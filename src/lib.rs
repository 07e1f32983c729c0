//! Two-way synchronization between a feature store and an ArcGIS feature
//! server.
//!
//! - **Pull**: page through a remote layer, split multi-part geometries,
//!   assign stable ids, and hand one GeoJSON collection to the host.
//! - **Push**: apply inbound change records to per-geometry-kind remote
//!   layers, by insert or by query-then-update.
//!
//! Both directions share one [`auth::AuthCache`] that refreshes ArcGIS
//! tokens just in time and keeps one refresh in flight per layer and
//! direction.

pub mod auth;
pub mod config;
pub mod error;
pub mod feature;
pub mod fields;
pub mod geometry;
pub mod host;
pub mod remote;
pub mod sync;

pub use error::{Result, SyncError};
