//! Pull direction: remote layer → normalized feature collection.
//!
//! `Idle → Authenticating → Streaming → Aggregating → Done | Failed`.
//! Any error aborts the whole run; a partial collection is never returned.

use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;

use crate::auth::{AuthCache, CredentialScope, PULL_GUARD};
use crate::config::{Direction, LayerConfig};
use crate::feature::FeatureCollection;
use crate::fields::DateFormatter;
use crate::geometry::normalize_with;
use crate::remote::{FeatureReader, ReadRequest};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullState {
    Idle,
    Authenticating,
    Streaming,
    Aggregating,
    Done,
    Failed,
}

pub struct PullPipeline {
    layer: Arc<LayerConfig>,
    auth: Arc<AuthCache>,
    reader: Arc<dyn FeatureReader>,
    state: Mutex<PullState>,
}

impl PullPipeline {
    pub fn new(
        layer: Arc<LayerConfig>,
        auth: Arc<AuthCache>,
        reader: Arc<dyn FeatureReader>,
    ) -> Self {
        Self {
            layer,
            auth,
            reader,
            state: Mutex::new(PullState::Idle),
        }
    }

    pub fn state(&self) -> PullState {
        *self.state.lock()
    }

    fn transition(&self, next: PullState) {
        let mut state = self.state.lock();
        tracing::debug!(layer = %self.layer.id, from = ?*state, to = ?next, "Pull state");
        *state = next;
    }

    /// Authenticated read request for the incoming side of the layer.
    async fn read_request(&self) -> Result<ReadRequest> {
        let incoming = self.layer.incoming()?;
        let scope = CredentialScope::new(&self.layer.id, Direction::Incoming);
        let credential = self
            .auth
            .ensure_credential(&scope, &incoming.auth, &incoming.url, PULL_GUARD)
            .await?;

        Ok(ReadRequest {
            url: incoming.url.clone(),
            where_clause: incoming.query.clone(),
            params: incoming.params.clone(),
            credential,
        })
    }

    /// Property schema of the remote layer.
    pub async fn schema(&self) -> Result<serde_json::Value> {
        let request = self.read_request().await?;
        self.reader.schema(&request).await
    }

    /// Read, normalize and collect every feature of the layer.
    pub async fn run(&self) -> Result<FeatureCollection> {
        match self.collect().await {
            Ok(collection) => {
                self.transition(PullState::Done);
                tracing::info!(
                    layer = %self.layer.id,
                    count = collection.len(),
                    "ok - obtained {} features",
                    collection.len()
                );
                Ok(collection)
            }
            Err(e) => {
                self.transition(PullState::Failed);
                tracing::error!(layer = %self.layer.id, error = %e, "Pull failed");
                Err(e)
            }
        }
    }

    async fn collect(&self) -> Result<FeatureCollection> {
        self.transition(PullState::Authenticating);
        let request = self.read_request().await?;

        let formatter = match self
            .layer
            .incoming()?
            .timezone
            .as_deref()
            .filter(|tz| !tz.trim().is_empty())
        {
            Some(tz) => {
                let schema = self.reader.schema(&request).await?;
                Some(DateFormatter::from_schema(tz, &schema)?)
            }
            None => None,
        };

        self.transition(PullState::Streaming);
        let mut features = self.reader.fetch(request);

        self.transition(PullState::Aggregating);
        let mut collection = FeatureCollection::new();
        while let Some(raw) = features.next().await {
            collection.extend(normalize_with(raw?, &self.layer.id, formatter.as_ref()));
        }
        Ok(collection)
    }
}
