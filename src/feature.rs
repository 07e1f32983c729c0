//! Feature types on both sides of the pull normalizer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::geometry::Geometry;

/// Remote feature identifier. Feature servers hand out integers, GeoJSON
/// endpoints sometimes hand out strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteId {
    Number(i64),
    Text(String),
}

impl std::fmt::Display for RemoteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// One feature exactly as the read capability delivered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFeature {
    pub id: RemoteId,
    #[serde(default)]
    pub geometry: Option<Geometry>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// A single-part feature with a `layer-<layer>-<remote>[-<part>]` id.
///
/// Serializes as a GeoJSON `Feature`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "Feature")]
pub struct NormalizedFeature {
    pub id: String,
    pub properties: Map<String, Value>,
    pub geometry: Option<Geometry>,
}

impl NormalizedFeature {
    /// The remote attributes, as wrapped under `metadata`.
    pub fn metadata(&self) -> Option<&Map<String, Value>> {
        self.properties.get("metadata").and_then(Value::as_object)
    }
}

/// Ordered output of one pull run. Serializes as a GeoJSON `FeatureCollection`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "FeatureCollection")]
pub struct FeatureCollection {
    pub features: Vec<NormalizedFeature>,
}

impl FeatureCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn extend(&mut self, features: impl IntoIterator<Item = NormalizedFeature>) {
        self.features.extend(features);
    }
}
