// Copyright 2024 The Meridian Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![expect(missing_docs)]
//! Spatial filters: an optional `(CRS, polygon)` predicate that hides
//! features and tiles outside an area of interest.
//!
//! The filter geometry is reprojected into each dataset's CRS once (cached by
//! the caller holding the resolved [`DatasetFilter`]) through the
//! [`CrsTransform`] collaborator. When reprojection is impossible the filter
//! degrades to match-all for that dataset and warns once; hiding data because
//! a CRS could not be parsed would be worse than showing too much.

use std::fmt::Debug;
use std::str::FromStr as _;
use std::sync::Arc;
use std::sync::Mutex;

use blake2::Blake2b512;
use digest::Digest as _;
use geo::Intersects as _;
use geo::BoundingRect as _;
use geo::CoordsIter as _;
use geo::MapCoords as _;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::error::Error;
use crate::geometry::Envelope;
use crate::geometry::Geometry;
use crate::geometry::ParsedGeometry;
use crate::schema::Schema;
use crate::tabular::Row;
use crate::tile::TileEntry;

/// The CRS identifier features' CRS84 extents are expressed in.
pub const CRS84: &str = "EPSG:4326";

static CRS_SPEC_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9]{2,10}:[0-9]{1,10}$").unwrap());

/// Pure-function collaborator for coordinate reprojection. `from` and `to`
/// are authority strings (e.g. `EPSG:2193`) or full WKT definitions.
pub trait CrsTransform: Send + Sync + Debug {
    fn transform_points(
        &self,
        from: &str,
        to: &str,
        points: &mut [(f64, f64)],
    ) -> Result<(), String>;
}

/// A spatial filter: match-all, or a polygon in a particular CRS.
#[derive(Debug, Clone)]
pub struct SpatialFilter {
    inner: Option<FilterGeometry>,
}

#[derive(Debug, Clone)]
struct FilterGeometry {
    crs_spec: String,
    geometry_spec: String,
    geometry: geo_types::Geometry<f64>,
    transform: Option<Arc<dyn CrsTransform>>,
    warned: Arc<Mutex<Vec<String>>>,
}

impl SpatialFilter {
    pub fn match_all() -> Self {
        Self { inner: None }
    }

    pub fn is_match_all(&self) -> bool {
        self.inner.is_none()
    }

    /// Parses the inline form `AUTH:CODE;POLYGON((…))` (or MULTIPOLYGON, or
    /// hex-WKB). An empty spec is match-all.
    pub fn from_spec(spec: &str) -> Result<Self, Error> {
        if spec.is_empty() {
            return Ok(Self::match_all());
        }
        match spec.split_once(';') {
            Some((crs_spec, geometry_spec)) if CRS_SPEC_PATTERN.is_match(crs_spec) => {
                Self::from_parts(crs_spec, geometry_spec)
            }
            _ => Err(Error::InvalidFileFormat {
                message: "Invalid spatial filter definition - should be in the form \
                          CRS_AUTHORITY:CRS_ID;GEOMETRY"
                    .to_string(),
            }),
        }
    }

    /// Parses the two-section file form: a CRS definition, a blank line, then
    /// the geometry.
    pub fn from_file_contents(contents: &str) -> Result<Self, Error> {
        static BLANK_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\r?\n").unwrap());
        let mut sections = BLANK_LINE.splitn(contents, 2);
        let (Some(crs_spec), Some(geometry_spec)) = (sections.next(), sections.next()) else {
            return Err(Error::InvalidFileFormat {
                message: "Spatial filter file must contain the CRS, then an empty line, then \
                          the geometry."
                    .to_string(),
            });
        };
        Self::from_parts(crs_spec.trim(), geometry_spec.trim())
    }

    fn from_parts(crs_spec: &str, geometry_spec: &str) -> Result<Self, Error> {
        let geometry_spec = geometry_spec.trim();
        let geometry = parse_filter_geometry(geometry_spec)?;
        match &geometry {
            geo_types::Geometry::Polygon(p) if p.exterior().coords_count() > 0 => {}
            geo_types::Geometry::MultiPolygon(mp) if !mp.0.is_empty() => {}
            _ => {
                return Err(Error::GeometryError {
                    message: "Spatial filter geometry must be a non-empty Polygon or \
                              MultiPolygon"
                        .to_string(),
                });
            }
        }
        Ok(Self {
            inner: Some(FilterGeometry {
                crs_spec: crs_spec.to_string(),
                geometry_spec: geometry_spec.to_string(),
                geometry,
                transform: None,
                warned: Arc::new(Mutex::new(Vec::new())),
            }),
        })
    }

    /// Attaches the reprojection collaborator.
    pub fn with_transform(mut self, transform: Arc<dyn CrsTransform>) -> Self {
        if let Some(inner) = &mut self.inner {
            inner.transform = Some(transform);
        }
        self
    }

    pub fn crs_spec(&self) -> Option<&str> {
        self.inner.as_ref().map(|inner| inner.crs_spec.as_str())
    }

    /// A stable hash identifying this filter, stamped into the working copy
    /// state so that a filter change is detectable.
    pub fn hex_hash(&self) -> Option<String> {
        let inner = self.inner.as_ref()?;
        let mut hasher = Blake2b512::new();
        hasher.update(inner.crs_spec.trim().as_bytes());
        hasher.update(b"\0");
        hasher.update(inner.geometry_spec.as_bytes());
        Some(hex::encode(&hasher.finalize()[..20]))
    }

    /// Resolves this filter for content in the CRS identified by `crs_name`
    /// (authority string) and/or defined by `crs_wkt`. `dataset_key` is used
    /// for one-time warnings only.
    pub fn resolve_for_crs(
        &self,
        dataset_key: &str,
        crs_name: Option<&str>,
        crs_wkt: Option<&str>,
    ) -> DatasetFilter {
        let Some(inner) = &self.inner else {
            return DatasetFilter::MatchAll;
        };
        // Same CRS: no reprojection needed.
        if let Some(name) = crs_name {
            if name.eq_ignore_ascii_case(&inner.crs_spec) {
                return DatasetFilter::from_geometry(inner.geometry.clone());
            }
        }
        let target = crs_wkt.or(crs_name);
        let transformed = target.and_then(|to| {
            let transform = inner.transform.as_ref()?;
            let mut coords: Vec<(f64, f64)> = inner
                .geometry
                .coords_iter()
                .map(|c| (c.x, c.y))
                .collect();
            transform
                .transform_points(&inner.crs_spec, to, &mut coords)
                .ok()?;
            let counter = std::cell::Cell::new(0usize);
            Some(inner.geometry.map_coords(|_| {
                let index = counter.get();
                counter.set(index + 1);
                geo_types::Coord {
                    x: coords[index].0,
                    y: coords[index].1,
                }
            }))
        });
        match transformed {
            Some(geometry) => DatasetFilter::from_geometry(geometry),
            None => {
                let mut warned = inner.warned.lock().unwrap();
                if !warned.iter().any(|key| key == dataset_key) {
                    warned.push(dataset_key.to_string());
                    warn!(
                        dataset = dataset_key,
                        filter_crs = inner.crs_spec,
                        "Spatial filter cannot be reprojected for this dataset; \
                         showing all of its features"
                    );
                }
                DatasetFilter::MatchAll
            }
        }
    }

    /// Resolves this filter against CRS84, for tile extents.
    pub fn resolve_for_crs84(&self, dataset_key: &str) -> DatasetFilter {
        self.resolve_for_crs(dataset_key, Some(CRS84), None)
    }
}

fn parse_filter_geometry(spec: &str) -> Result<geo_types::Geometry<f64>, Error> {
    let upper = spec.to_uppercase();
    if upper.starts_with("POLYGON") || upper.starts_with("MULTIPOLYGON") {
        let parsed = wkt::Wkt::<f64>::from_str(spec).map_err(|e| Error::GeometryError {
            message: format!("Invalid spatial filter WKT: {e}"),
        })?;
        geo_types::Geometry::try_from(parsed).map_err(|_| Error::GeometryError {
            message: "Invalid spatial filter WKT".to_string(),
        })
    } else {
        let geometry = Geometry::from_hex_wkb(spec).map_err(|e| Error::GeometryError {
            message: format!("Invalid spatial filter WKB: {e}"),
        })?;
        let parsed = geometry.parse_2d().map_err(|e| Error::GeometryError {
            message: format!("Invalid spatial filter WKB: {e}"),
        })?;
        parsed_to_geo(&parsed).ok_or_else(|| Error::GeometryError {
            message: "Spatial filter geometry is empty".to_string(),
        })
    }
}

fn coords(points: &[(f64, f64)]) -> Vec<geo_types::Coord<f64>> {
    points
        .iter()
        .map(|(x, y)| geo_types::Coord { x: *x, y: *y })
        .collect()
}

fn polygon(rings: &[Vec<(f64, f64)>]) -> geo_types::Polygon<f64> {
    let exterior = geo_types::LineString(rings.first().map(|r| coords(r)).unwrap_or_default());
    let interiors = rings
        .iter()
        .skip(1)
        .map(|r| geo_types::LineString(coords(r)))
        .collect();
    geo_types::Polygon::new(exterior, interiors)
}

/// Converts a parsed 2D WKB structure into a `geo` geometry. Returns None for
/// empty geometries.
pub(crate) fn parsed_to_geo(parsed: &ParsedGeometry) -> Option<geo_types::Geometry<f64>> {
    match parsed {
        ParsedGeometry::Point(None) => None,
        ParsedGeometry::Point(Some((x, y))) => {
            Some(geo_types::Geometry::Point(geo_types::Point::new(*x, *y)))
        }
        ParsedGeometry::LineString(points) => Some(geo_types::Geometry::LineString(
            geo_types::LineString(coords(points)),
        )),
        ParsedGeometry::Polygon(rings) => Some(geo_types::Geometry::Polygon(polygon(rings))),
        ParsedGeometry::MultiPoint(points) => Some(geo_types::Geometry::MultiPoint(
            geo_types::MultiPoint(
                points
                    .iter()
                    .flatten()
                    .map(|(x, y)| geo_types::Point::new(*x, *y))
                    .collect(),
            ),
        )),
        ParsedGeometry::MultiLineString(lines) => Some(geo_types::Geometry::MultiLineString(
            geo_types::MultiLineString(
                lines
                    .iter()
                    .map(|l| geo_types::LineString(coords(l)))
                    .collect(),
            ),
        )),
        ParsedGeometry::MultiPolygon(polygons) => Some(geo_types::Geometry::MultiPolygon(
            geo_types::MultiPolygon(polygons.iter().map(|p| polygon(p)).collect()),
        )),
        ParsedGeometry::Collection(children) => {
            let geometries: Vec<_> = children.iter().filter_map(parsed_to_geo).collect();
            if geometries.is_empty() {
                None
            } else {
                Some(geo_types::Geometry::GeometryCollection(
                    geo_types::GeometryCollection(geometries),
                ))
            }
        }
    }
}

/// A spatial filter resolved into one dataset's CRS.
#[derive(Debug, Clone)]
pub enum DatasetFilter {
    MatchAll,
    Geometry {
        envelope: Envelope,
        geometry: geo_types::Geometry<f64>,
    },
}

impl DatasetFilter {
    fn from_geometry(geometry: geo_types::Geometry<f64>) -> Self {
        match geometry.bounding_rect() {
            Some(rect) => Self::Geometry {
                envelope: Envelope {
                    min_x: rect.min().x,
                    max_x: rect.max().x,
                    min_y: rect.min().y,
                    max_y: rect.max().y,
                },
                geometry,
            },
            None => Self::MatchAll,
        }
    }

    pub fn is_match_all(&self) -> bool {
        matches!(self, Self::MatchAll)
    }

    /// Whether a feature row matches. A row with a null geometry, or a schema
    /// with no geometry column, always matches.
    pub fn matches_row(&self, schema: &Schema, row: &Row) -> bool {
        let Self::Geometry { .. } = self else {
            return true;
        };
        let Some(geom_name) = schema.geometry_column_name() else {
            return true;
        };
        let Some(position) = schema.columns().iter().position(|c| c.name == geom_name) else {
            return true;
        };
        match row.get(position).and_then(|value| value.as_geometry()) {
            Some(geometry) => self.matches_geometry(geometry),
            None => true,
        }
    }

    /// Whether a stored geometry matches: envelope test first, exact
    /// intersection only when the envelopes touch.
    pub fn matches_geometry(&self, geometry: &Geometry) -> bool {
        let Self::Geometry {
            envelope: filter_envelope,
            geometry: filter_geometry,
        } = self
        else {
            return true;
        };
        let feature_envelope = match geometry.envelope() {
            Ok(Some(envelope)) => envelope,
            // Empty geometries always match; unparseable ones are kept to be
            // safe.
            Ok(None) | Err(_) => return true,
        };
        if !filter_envelope.intersects(&feature_envelope) {
            return false;
        }
        match geometry.parse_2d().ok().as_ref().and_then(parsed_to_geo) {
            Some(feature_geometry) => filter_geometry.intersects(&feature_geometry),
            None => true,
        }
    }

    /// Whether a tile matches, judged by its CRS84 extent envelope. Tiles
    /// without an extent always match.
    pub fn matches_tile(&self, tile: &TileEntry) -> bool {
        let Self::Geometry { envelope, .. } = self else {
            return true;
        };
        match tile.crs84_envelope() {
            Some(tile_envelope) => envelope.intersects(&tile_envelope),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::schema::Column;
    use crate::schema::DataType;
    use crate::value::Value;

    const SQUARE: &str = "EPSG:2193;POLYGON((0 0, 10 0, 10 10, 0 10, 0 0))";

    fn point(x: f64, y: f64) -> Geometry {
        use byteorder::LittleEndian;
        use byteorder::WriteBytesExt as _;
        let mut wkb = vec![1u8];
        wkb.write_u32::<LittleEndian>(1).unwrap();
        wkb.write_f64::<LittleEndian>(x).unwrap();
        wkb.write_f64::<LittleEndian>(y).unwrap();
        Geometry::from_wkb(&wkb).unwrap()
    }

    fn geometry_schema() -> Schema {
        Schema::new(vec![
            Column::new("fid", DataType::Integer { size: 64 }, Some(0)),
            Column::new(
                "geom",
                DataType::Geometry {
                    geometry_type: "POINT".to_string(),
                    crs_name: Some("EPSG:2193".to_string()),
                },
                None,
            ),
        ])
    }

    #[test]
    fn test_parse_inline_spec() {
        let filter = SpatialFilter::from_spec(SQUARE).unwrap();
        assert!(!filter.is_match_all());
        assert_eq!(filter.crs_spec(), Some("EPSG:2193"));
        assert!(filter.hex_hash().is_some());
    }

    #[test]
    fn test_parse_rejects_non_polygon() {
        assert_matches!(
            SpatialFilter::from_spec("EPSG:4326;POINT(1 2)"),
            Err(Error::GeometryError { .. })
        );
        assert_matches!(
            SpatialFilter::from_spec("no semicolon here"),
            Err(Error::InvalidFileFormat { .. })
        );
    }

    #[test]
    fn test_parse_file_contents() {
        let contents = "EPSG:2193\n\nPOLYGON((0 0, 1 0, 1 1, 0 1, 0 0))";
        let filter = SpatialFilter::from_file_contents(contents).unwrap();
        assert_eq!(filter.crs_spec(), Some("EPSG:2193"));
        assert_matches!(
            SpatialFilter::from_file_contents("only one section"),
            Err(Error::InvalidFileFormat { .. })
        );
    }

    #[test]
    fn test_matches_same_crs() {
        let filter = SpatialFilter::from_spec(SQUARE).unwrap();
        let resolved = filter.resolve_for_crs("ds", Some("EPSG:2193"), None);
        let schema = geometry_schema();

        let inside = vec![Value::Integer(1), Value::Geometry(point(5.0, 5.0))];
        let outside = vec![Value::Integer(2), Value::Geometry(point(50.0, 50.0))];
        let null_geom = vec![Value::Integer(3), Value::Null];

        assert!(resolved.matches_row(&schema, &inside));
        assert!(!resolved.matches_row(&schema, &outside));
        // Null geometry always matches.
        assert!(resolved.matches_row(&schema, &null_geom));
    }

    #[test]
    fn test_unprojectable_is_conservative() {
        let filter = SpatialFilter::from_spec(SQUARE).unwrap();
        // No transform attached, different CRS: degrade to match-all.
        let resolved = filter.resolve_for_crs("ds", Some("EPSG:27700"), None);
        assert!(resolved.is_match_all());
    }

    #[test]
    fn test_envelope_fast_path_vs_exact() {
        // A thin L-shaped polygon whose bounding box covers (0..10)^2 but
        // whose area does not include (8, 8).
        let filter = SpatialFilter::from_spec(
            "EPSG:2193;POLYGON((0 0, 10 0, 10 1, 1 1, 1 10, 0 10, 0 0))",
        )
        .unwrap();
        let resolved = filter.resolve_for_crs("ds", Some("EPSG:2193"), None);
        assert!(resolved.matches_geometry(&point(5.0, 0.5)));
        assert!(!resolved.matches_geometry(&point(8.0, 8.0)));
    }

    #[test]
    fn test_matches_tile() {
        let filter =
            SpatialFilter::from_spec("EPSG:4326;POLYGON((174 -37, 175 -37, 175 -36, 174 -36, 174 -37))")
                .unwrap();
        let resolved = filter.resolve_for_crs84("ds");
        let mut tile = TileEntry {
            name: "a.laz".to_string(),
            oid: "sha256:00".to_string(),
            size: 1,
            format: "laz-1.4/copc-1.0".to_string(),
            native_extent: None,
            crs84_extent: Some("174.2,174.4,-36.8,-36.6".to_string()),
            pam_oid: None,
            pam_size: None,
            pam_name: None,
            source_oid: None,
        };
        assert!(resolved.matches_tile(&tile));
        tile.crs84_extent = Some("170.0,171.0,-44.0,-43.0".to_string());
        assert!(!resolved.matches_tile(&tile));
        tile.crs84_extent = None;
        assert!(resolved.matches_tile(&tile));
    }

    #[derive(Debug)]
    struct ShiftTransform;

    impl CrsTransform for ShiftTransform {
        fn transform_points(
            &self,
            _from: &str,
            _to: &str,
            points: &mut [(f64, f64)],
        ) -> Result<(), String> {
            for p in points {
                p.0 += 100.0;
                p.1 += 100.0;
            }
            Ok(())
        }
    }

    #[test]
    fn test_transform_applied() {
        let filter = SpatialFilter::from_spec(SQUARE)
            .unwrap()
            .with_transform(Arc::new(ShiftTransform));
        let resolved = filter.resolve_for_crs("ds", Some("EPSG:9999"), None);
        // The square is now (100..110)^2.
        assert!(resolved.matches_geometry(&point(105.0, 105.0)));
        assert!(!resolved.matches_geometry(&point(5.0, 5.0)));
    }
}
