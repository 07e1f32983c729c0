//! The two sync directions of a layer.
//!
//! - [`pull`]: read every remote feature, normalize, hand one collection to
//!   the host. Any failure fails the run.
//! - [`push`]: apply a batch of inbound change records to the remote layers.
//!   Failures are isolated per record.
//!
//! Both pipelines authenticate through the shared [`crate::auth::AuthCache`]
//! and reach the remote only through the capability traits in
//! [`crate::remote`].

pub mod pull;
pub mod push;

pub use pull::{PullPipeline, PullState};
pub use push::{BatchReport, PushPipeline, PushRecord, RecordOutcome, RecordReport};
