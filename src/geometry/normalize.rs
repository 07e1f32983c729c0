//! Pull-side normalization: raw remote features to single-part features.
//!
//! Multi-part geometries are split into one feature per part, suffixed with
//! the zero-based part index. Attributes are wrapped as `{ metadata: ... }`
//! and every part carries an identical copy.

use serde_json::{Map, Value};

use crate::feature::{NormalizedFeature, RawFeature, RemoteId};
use crate::fields::DateFormatter;

/// Build the traceable identifier `layer-<layer>-<remote>[-<part>]`.
pub fn feature_id(layer_id: &str, remote_id: &RemoteId, part: Option<usize>) -> String {
    match part {
        Some(index) => format!("layer-{layer_id}-{remote_id}-{index}"),
        None => format!("layer-{layer_id}-{remote_id}"),
    }
}

/// Normalize one raw feature into one or more single-part features.
pub fn normalize(raw: RawFeature, layer_id: &str) -> Vec<NormalizedFeature> {
    normalize_with(raw, layer_id, None)
}

/// As [`normalize`], applying date-time formatting to the attributes first.
pub fn normalize_with(
    raw: RawFeature,
    layer_id: &str,
    dates: Option<&DateFormatter>,
) -> Vec<NormalizedFeature> {
    let RawFeature {
        id,
        geometry,
        mut properties,
    } = raw;

    if let Some(formatter) = dates {
        formatter.apply(&mut properties);
    }
    let wrapped = wrap_metadata(properties);

    let Some(geometry) = geometry else {
        return vec![NormalizedFeature {
            id: feature_id(layer_id, &id, None),
            properties: wrapped,
            geometry: None,
        }];
    };

    match geometry.into_parts() {
        Ok(parts) => parts
            .into_iter()
            .enumerate()
            .map(|(index, part)| NormalizedFeature {
                id: feature_id(layer_id, &id, Some(index)),
                properties: wrapped.clone(),
                geometry: Some(part),
            })
            .collect(),
        Err(single) => vec![NormalizedFeature {
            id: feature_id(layer_id, &id, None),
            properties: wrapped,
            geometry: Some(single),
        }],
    }
}

fn wrap_metadata(properties: Map<String, Value>) -> Map<String, Value> {
    let mut wrapped = Map::new();
    wrapped.insert("metadata".to_string(), Value::Object(properties));
    wrapped
}
