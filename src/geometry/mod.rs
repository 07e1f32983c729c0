//! GeoJSON geometry model plus the two normalizer directions.
//!
//! - [`normalize`]: pull side, splits multi-part features into single parts
//!   with traceable identifiers.
//! - [`project`]: push side, turns a single-part GeoJSON geometry into the
//!   ArcGIS JSON shape in the target spatial reference.

pub mod normalize;
pub mod project;

use serde::{Deserialize, Serialize};

pub use normalize::{feature_id, normalize, normalize_with};
pub use project::{
    project, EsriGeometry, Identity, Reproject, SpatialReference, WebMercator, WEB_MERCATOR, WGS84,
};

/// A coordinate tuple. Only `[x, y]` is reprojected; extra ordinates pass through.
pub type Position = Vec<f64>;

/// GeoJSON geometry, restricted to the six coordinate-bearing types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Point(Position),
    MultiPoint(Vec<Position>),
    LineString(Vec<Position>),
    MultiLineString(Vec<Vec<Position>>),
    Polygon(Vec<Vec<Position>>),
    MultiPolygon(Vec<Vec<Vec<Position>>>),
}

/// The GeoJSON `type` tag of a geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GeometryType {
    Point,
    MultiPoint,
    LineString,
    MultiLineString,
    Polygon,
    MultiPolygon,
}

impl GeometryType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Point => "Point",
            Self::MultiPoint => "MultiPoint",
            Self::LineString => "LineString",
            Self::MultiLineString => "MultiLineString",
            Self::Polygon => "Polygon",
            Self::MultiPolygon => "MultiPolygon",
        }
    }

    pub fn is_multi(self) -> bool {
        self.as_str().starts_with("Multi")
    }
}

impl std::fmt::Display for GeometryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of single-part kinds the push direction can write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GeometryKind {
    Point,
    LineString,
    Polygon,
}

impl GeometryKind {
    /// ArcGIS geometry type name used by feature-service layers.
    pub fn esri_type(self) -> &'static str {
        match self {
            Self::Point => "esriGeometryPoint",
            Self::LineString => "esriGeometryPolyline",
            Self::Polygon => "esriGeometryPolygon",
        }
    }
}

impl TryFrom<GeometryType> for GeometryKind {
    type Error = crate::SyncError;

    fn try_from(value: GeometryType) -> crate::Result<Self> {
        match value {
            GeometryType::Point => Ok(Self::Point),
            GeometryType::LineString => Ok(Self::LineString),
            GeometryType::Polygon => Ok(Self::Polygon),
            other => Err(crate::SyncError::UnsupportedGeometry(other)),
        }
    }
}

impl Geometry {
    pub fn geometry_type(&self) -> GeometryType {
        match self {
            Self::Point(_) => GeometryType::Point,
            Self::MultiPoint(_) => GeometryType::MultiPoint,
            Self::LineString(_) => GeometryType::LineString,
            Self::MultiLineString(_) => GeometryType::MultiLineString,
            Self::Polygon(_) => GeometryType::Polygon,
            Self::MultiPolygon(_) => GeometryType::MultiPolygon,
        }
    }

    /// Single-part kind, or `UnsupportedGeometry` for multi-part input.
    pub fn kind(&self) -> crate::Result<GeometryKind> {
        GeometryKind::try_from(self.geometry_type())
    }

    /// Break a multi-part geometry into its parts, in original order.
    ///
    /// Single-part geometries come back untouched in `Err`.
    pub fn into_parts(self) -> Result<Vec<Geometry>, Geometry> {
        match self {
            Self::MultiPoint(points) => Ok(points.into_iter().map(Self::Point).collect()),
            Self::MultiLineString(lines) => Ok(lines.into_iter().map(Self::LineString).collect()),
            Self::MultiPolygon(polys) => Ok(polys.into_iter().map(Self::Polygon).collect()),
            single => Err(single),
        }
    }
}
