//! Push-side projection: GeoJSON geometry to ArcGIS JSON geometry.
//!
//! Coordinates are transformed one `[x, y]` pair at a time through a
//! [`Reproject`] function. Nesting and point order are kept exactly: no
//! deduplication, no reordering, no ring closing.

use serde::{Deserialize, Serialize};

use super::{Geometry, GeometryKind, Position};
use crate::{Result, SyncError};

/// WGS84 geographic coordinates.
pub const WGS84: u32 = 4326;
/// Web Mercator, as published by most feature services.
pub const WEB_MERCATOR: u32 = 3857;

const WEB_MERCATOR_ALIASES: [u32; 3] = [3857, 102100, 900913];
const EARTH_RADIUS_M: f64 = 6_378_137.0;
const MAX_MERCATOR_LAT: f64 = 85.051_128_78;

/// ArcGIS `spatialReference` object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpatialReference {
    pub wkid: u32,
}

impl SpatialReference {
    pub const fn new(wkid: u32) -> Self {
        Self { wkid }
    }
}

/// A pure per-point coordinate transform between two spatial references.
pub trait Reproject: Send + Sync {
    fn transform(&self, from: u32, to: u32, xy: [f64; 2]) -> Result<[f64; 2]>;
}

/// Passes coordinates through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Reproject for Identity {
    fn transform(&self, _from: u32, _to: u32, xy: [f64; 2]) -> Result<[f64; 2]> {
        Ok(xy)
    }
}

/// Spherical Web Mercator to and from WGS84.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebMercator;

impl WebMercator {
    fn is_mercator(wkid: u32) -> bool {
        WEB_MERCATOR_ALIASES.contains(&wkid)
    }
}

impl Reproject for WebMercator {
    fn transform(&self, from: u32, to: u32, [x, y]: [f64; 2]) -> Result<[f64; 2]> {
        if from == to || (Self::is_mercator(from) && Self::is_mercator(to)) {
            return Ok([x, y]);
        }
        if from == WGS84 && Self::is_mercator(to) {
            let lat = y.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
            let mx = EARTH_RADIUS_M * x.to_radians();
            let my = EARTH_RADIUS_M * (std::f64::consts::FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln();
            return Ok([mx, my]);
        }
        if Self::is_mercator(from) && to == WGS84 {
            let lon = (x / EARTH_RADIUS_M).to_degrees();
            let lat = (2.0 * (y / EARTH_RADIUS_M).exp().atan() - std::f64::consts::FRAC_PI_2)
                .to_degrees();
            return Ok([lon, lat]);
        }
        Err(SyncError::Config(format!(
            "no coordinate transform from wkid {from} to wkid {to}"
        )))
    }
}

/// ArcGIS JSON geometry with its spatial reference attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EsriGeometry {
    Point {
        x: f64,
        y: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        z: Option<f64>,
        #[serde(rename = "spatialReference")]
        spatial_reference: SpatialReference,
    },
    Polyline {
        paths: Vec<Vec<Position>>,
        #[serde(rename = "spatialReference")]
        spatial_reference: SpatialReference,
    },
    Polygon {
        rings: Vec<Vec<Position>>,
        #[serde(rename = "spatialReference")]
        spatial_reference: SpatialReference,
    },
}

impl EsriGeometry {
    pub fn kind(&self) -> GeometryKind {
        match self {
            Self::Point { .. } => GeometryKind::Point,
            Self::Polyline { .. } => GeometryKind::LineString,
            Self::Polygon { .. } => GeometryKind::Polygon,
        }
    }

    pub fn spatial_reference(&self) -> SpatialReference {
        match self {
            Self::Point {
                spatial_reference, ..
            }
            | Self::Polyline {
                spatial_reference, ..
            }
            | Self::Polygon {
                spatial_reference, ..
            } => *spatial_reference,
        }
    }
}

/// Convert and reproject a single-part geometry into the target reference.
///
/// Multi-part geometries are rejected with [`SyncError::UnsupportedGeometry`].
pub fn project(
    geometry: &Geometry,
    source: SpatialReference,
    target: SpatialReference,
    reproject: &dyn Reproject,
) -> Result<EsriGeometry> {
    let convert = |pos: &Position| -> Result<Position> {
        let (x, y) = match pos.as_slice() {
            [x, y, ..] => (*x, *y),
            _ => {
                return Err(SyncError::Decode(format!(
                    "position needs at least two ordinates, got {}",
                    pos.len()
                )))
            }
        };
        let [px, py] = reproject.transform(source.wkid, target.wkid, [x, y])?;
        let mut out = Vec::with_capacity(pos.len());
        out.push(px);
        out.push(py);
        out.extend_from_slice(&pos[2..]);
        Ok(out)
    };
    let convert_seq = |seq: &[Position]| seq.iter().map(convert).collect::<Result<Vec<_>>>();

    match geometry {
        Geometry::Point(pos) => {
            let projected = convert(pos)?;
            Ok(EsriGeometry::Point {
                x: projected[0],
                y: projected[1],
                z: projected.get(2).copied(),
                spatial_reference: target,
            })
        }
        Geometry::LineString(line) => Ok(EsriGeometry::Polyline {
            paths: vec![convert_seq(line)?],
            spatial_reference: target,
        }),
        Geometry::Polygon(rings) => Ok(EsriGeometry::Polygon {
            rings: rings
                .iter()
                .map(|ring| convert_seq(ring))
                .collect::<Result<Vec<_>>>()?,
            spatial_reference: target,
        }),
        other => Err(SyncError::UnsupportedGeometry(other.geometry_type())),
    }
}
