//! Entry points invoked by the task host.
//!
//! The host sends one [`HostEvent`] per invocation: a request for the input
//! or output schema, a pull run, or a push batch. [`SyncHost::handle`]
//! dispatches it to the right pipeline and turns the outcome into a
//! [`HostResponse`]. Pulled collections leave through a [`FeatureSink`].

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config;
use crate::feature::FeatureCollection;
use crate::sync::{PullPipeline, PushPipeline};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HostEvent {
    #[serde(rename = "schema:input")]
    SchemaInput,
    #[serde(rename = "schema:output")]
    SchemaOutput,
    #[serde(rename = "pull")]
    Pull,
    #[serde(rename = "push")]
    Push { batch: Vec<Value> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostResponse {
    Schema(Value),
    /// A pull finished and this many features were submitted.
    Submitted(usize),
    /// A push batch was processed.
    Acknowledged(bool),
}

/// Where pulled collections go.
#[async_trait]
pub trait FeatureSink: Send + Sync {
    async fn submit(&self, collection: &FeatureCollection) -> anyhow::Result<()>;
}

/// Writes each collection as JSON to stdout, or to a file when a path is set.
#[derive(Debug, Default)]
pub struct JsonSink {
    path: Option<PathBuf>,
}

impl JsonSink {
    pub fn stdout() -> Self {
        Self { path: None }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }
}

#[async_trait]
impl FeatureSink for JsonSink {
    async fn submit(&self, collection: &FeatureCollection) -> anyhow::Result<()> {
        let body = serde_json::to_string(collection).context("Failed to serialize features")?;
        match &self.path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(path, body)
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?;
            }
            None => {
                use std::io::Write;
                let mut out = std::io::stdout().lock();
                out.write_all(body.as_bytes())?;
                out.write_all(b"\n")?;
            }
        }
        Ok(())
    }
}

pub struct SyncHost {
    pull: PullPipeline,
    push: PushPipeline,
    sink: Arc<dyn FeatureSink>,
}

impl SyncHost {
    pub fn new(pull: PullPipeline, push: PushPipeline, sink: Arc<dyn FeatureSink>) -> Self {
        Self { pull, push, sink }
    }

    pub async fn handle(&self, event: HostEvent) -> anyhow::Result<HostResponse> {
        match event {
            HostEvent::SchemaInput => Ok(HostResponse::Schema(config::input_schema())),
            HostEvent::SchemaOutput => {
                let schema = self
                    .pull
                    .schema()
                    .await
                    .context("Failed to read remote layer schema")?;
                Ok(HostResponse::Schema(schema))
            }
            HostEvent::Pull => {
                let collection = self.pull.run().await.context("Pull failed")?;
                self.sink
                    .submit(&collection)
                    .await
                    .context("Failed to submit features")?;
                Ok(HostResponse::Submitted(collection.len()))
            }
            HostEvent::Push { batch } => {
                self.push.process(&batch).await.context("Push failed")?;
                Ok(HostResponse::Acknowledged(true))
            }
        }
    }
}
