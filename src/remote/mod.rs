//! Capabilities consumed from the remote feature service.
//!
//! - [`FeatureReader`]: property schema on demand, plus a lazy, finite
//!   stream of raw features that ends in completion or exactly one error.
//! - [`FeatureWriter`]: query by correlation id, insert, update.
//!
//! [`arcgis`] holds the HTTP implementations. Pipelines only see the traits,
//! so tests swap in fakes.

pub mod arcgis;

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::auth::Credential;
use crate::feature::RawFeature;
use crate::geometry::EsriGeometry;
use crate::Result;

pub use arcgis::{ArcgisReader, ArcgisWriter, DEFAULT_PAGE_SIZE};

/// Lazy sequence of raw features. Ends after the first error.
pub type FeatureStream = BoxStream<'static, Result<RawFeature>>;

/// Parameters for reading one layer.
#[derive(Debug, Clone, Default)]
pub struct ReadRequest {
    pub url: String,
    /// `where` clause; `1=1` when absent.
    pub where_clause: Option<String>,
    /// Extra query parameters, passed through verbatim.
    pub params: BTreeMap<String, String>,
    pub credential: Option<Credential>,
}

#[async_trait]
pub trait FeatureReader: Send + Sync {
    /// JSON schema of the layer's properties.
    async fn schema(&self, request: &ReadRequest) -> Result<Value>;

    /// Start reading. Nothing is requested until the stream is polled.
    fn fetch(&self, request: ReadRequest) -> FeatureStream;
}

/// A remote row found by correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingRow {
    /// Name of the layer's object id field, e.g. `OBJECTID`.
    pub object_id_field: String,
    pub object_id: i64,
}

/// A feature in ArcGIS JSON form, ready for `addFeatures`/`updateFeatures`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EsriFeature {
    pub attributes: Map<String, Value>,
    pub geometry: EsriGeometry,
}

#[async_trait]
pub trait FeatureWriter: Send + Sync {
    /// Find the row whose `field` equals `value`, if any.
    async fn query_existing(
        &self,
        url: &str,
        credential: Option<&Credential>,
        field: &str,
        value: &str,
    ) -> Result<Option<ExistingRow>>;

    /// Insert one feature. Returns the new object id when the server reports it.
    async fn add_feature(
        &self,
        url: &str,
        credential: Option<&Credential>,
        feature: &EsriFeature,
    ) -> Result<Option<i64>>;

    /// Update one feature. The object id must be among its attributes.
    async fn update_feature(
        &self,
        url: &str,
        credential: Option<&Credential>,
        feature: &EsriFeature,
    ) -> Result<Option<i64>>;
}
