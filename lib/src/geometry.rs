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
//! Standard GeoPackage binary geometry handling.
//!
//! Geometries are stored in their normalised form: little-endian header,
//! version 0, no envelope, srs_id 0 (the column's CRS is authoritative), and
//! ISO WKB rewritten to little-endian. See
//! <http://www.geopackage.org/spec/#gpb_format>.

use std::fmt;
use std::fmt::Debug;
use std::fmt::Formatter;

use byteorder::BigEndian;
use byteorder::ByteOrder as _;
use byteorder::LittleEndian;
use byteorder::WriteBytesExt as _;
use thiserror::Error;

const GPKG_MAGIC: &[u8; 2] = b"GP";

const FLAG_LITTLE_ENDIAN: u8 = 0b0000_0001;
const FLAG_EMPTY: u8 = 0b0001_0000;
const FLAG_EXTENDED: u8 = 0b0010_0000;
const ENVELOPE_MASK: u8 = 0b0000_1110;

const WKB_Z_FLAG: u32 = 0x8000_0000;
const WKB_M_FLAG: u32 = 0x4000_0000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GeometryError {
    #[error("Expected GeoPackage binary geometry")]
    BadMagic,
    #[error("Expected GeoPackage v1 geometry, got {0}")]
    UnsupportedVersion(u8),
    #[error("ExtendedGeoPackageBinary is not supported")]
    ExtendedBinary,
    #[error("Invalid envelope contents indicator")]
    BadEnvelopeIndicator,
    #[error("Geometry value is truncated")]
    Truncated,
    #[error("Invalid WKB byte-order marker {0}")]
    BadByteOrder(u8),
    #[error("Unsupported WKB geometry type {0}")]
    UnsupportedWkbType(u32),
}

/// A 2D bounding box, `(min_x, max_x, min_y, max_y)` like the GeoPackage
/// envelope layout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Envelope {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl Envelope {
    pub fn intersects(&self, other: &Self) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    fn extend(&mut self, x: f64, y: f64) {
        self.min_x = self.min_x.min(x);
        self.max_x = self.max_x.max(x);
        self.min_y = self.min_y.min(y);
        self.max_y = self.max_y.max(y);
    }

    fn empty_accumulator() -> Self {
        Self {
            min_x: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            min_y: f64::INFINITY,
            max_y: f64::NEG_INFINITY,
        }
    }

    fn is_degenerate(&self) -> bool {
        self.min_x > self.max_x || self.min_y > self.max_y
    }
}

/// A geometry value in normalised StandardGeoPackageBinary form.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Geometry(Vec<u8>);

impl Debug for Geometry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Geometry({})", hex::encode(&self.0))
    }
}

impl Geometry {
    /// Normalises arbitrary GeoPackage binary input: the header is rewritten
    /// little-endian with srs_id 0 and no envelope, and the WKB is rewritten
    /// to little-endian ISO form. Round-tripping a normalised geometry is the
    /// identity.
    pub fn from_gpkg_bytes(bytes: &[u8]) -> Result<Self, GeometryError> {
        let header = GpkgHeader::parse(bytes)?;
        let wkb = &bytes[header.wkb_offset..];
        let wkb = rewrite_wkb_little_endian(wkb)?;
        let mut out = Vec::with_capacity(8 + wkb.len());
        out.extend_from_slice(GPKG_MAGIC);
        out.push(0); // version
        let mut flags = FLAG_LITTLE_ENDIAN;
        if header.empty {
            flags |= FLAG_EMPTY;
        }
        out.push(flags);
        out.write_i32::<LittleEndian>(0).unwrap(); // srs_id is always 0 in storage
        out.extend_from_slice(&wkb);
        Ok(Self(out))
    }

    /// Builds a geometry from little-endian ISO WKB.
    pub fn from_wkb(wkb: &[u8]) -> Result<Self, GeometryError> {
        let mut bytes = Vec::with_capacity(8 + wkb.len());
        bytes.extend_from_slice(GPKG_MAGIC);
        bytes.push(0);
        bytes.push(FLAG_LITTLE_ENDIAN);
        bytes.write_i32::<LittleEndian>(0).unwrap();
        bytes.extend_from_slice(wkb);
        // Normalise in case the caller handed us big-endian WKB.
        Self::from_gpkg_bytes(&bytes)
    }

    pub fn from_hex_wkb(hex_wkb: &str) -> Result<Self, GeometryError> {
        let wkb = hex::decode(hex_wkb).map_err(|_| GeometryError::Truncated)?;
        Self::from_wkb(&wkb)
    }

    /// Wraps bytes that are already in normalised form (e.g. read back from a
    /// committed blob). No validation is performed.
    pub(crate) fn from_stored(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// The little-endian ISO WKB without the GeoPackage header.
    pub fn to_wkb(&self) -> Result<&[u8], GeometryError> {
        let header = GpkgHeader::parse(&self.0)?;
        Ok(&self.0[header.wkb_offset..])
    }

    pub fn to_hex_wkb(&self) -> Result<String, GeometryError> {
        Ok(hex::encode_upper(self.to_wkb()?))
    }

    pub fn is_empty_geometry(&self) -> Result<bool, GeometryError> {
        Ok(GpkgHeader::parse(&self.0)?.empty)
    }

    /// Parses this geometry to a 2D envelope without instantiating a full
    /// geometry model. Returns None for empty geometries.
    pub fn envelope(&self) -> Result<Option<Envelope>, GeometryError> {
        let header = GpkgHeader::parse(&self.0)?;
        if header.empty {
            return Ok(None);
        }
        if let Some(envelope) = header.envelope {
            if [
                envelope.min_x,
                envelope.max_x,
                envelope.min_y,
                envelope.max_y,
            ]
            .iter()
            .any(|c| c.is_nan())
            {
                return Ok(None);
            }
            return Ok(Some(envelope));
        }
        let mut acc = Envelope::empty_accumulator();
        let mut reader = WkbReader::new(&self.0[header.wkb_offset..]);
        reader.scan_envelope(&mut acc)?;
        if acc.is_degenerate() {
            Ok(None)
        } else {
            Ok(Some(acc))
        }
    }
}

struct GpkgHeader {
    empty: bool,
    envelope: Option<Envelope>,
    wkb_offset: usize,
}

impl GpkgHeader {
    fn parse(bytes: &[u8]) -> Result<Self, GeometryError> {
        if bytes.len() < 8 {
            return Err(GeometryError::Truncated);
        }
        if &bytes[0..2] != GPKG_MAGIC {
            return Err(GeometryError::BadMagic);
        }
        let version = bytes[2];
        if version != 0 {
            return Err(GeometryError::UnsupportedVersion(version));
        }
        let flags = bytes[3];
        if flags & FLAG_EXTENDED != 0 {
            return Err(GeometryError::ExtendedBinary);
        }
        let is_le = flags & FLAG_LITTLE_ENDIAN != 0;
        let envelope_code = (flags & ENVELOPE_MASK) >> 1;
        let envelope_len = match envelope_code {
            0 => 0,
            1 => 32,
            2 | 3 => 48,
            4 => 64,
            _ => return Err(GeometryError::BadEnvelopeIndicator),
        };
        let wkb_offset = 8 + envelope_len;
        if bytes.len() < wkb_offset {
            return Err(GeometryError::Truncated);
        }
        let envelope = (envelope_len > 0).then(|| {
            let read = |offset: usize| {
                let chunk = &bytes[8 + offset * 8..][..8];
                if is_le {
                    LittleEndian::read_f64(chunk)
                } else {
                    BigEndian::read_f64(chunk)
                }
            };
            // Envelope layout is [minx, maxx, miny, maxy, ...]; we only care
            // about the 2D part.
            Envelope {
                min_x: read(0),
                max_x: read(1),
                min_y: read(2),
                max_y: read(3),
            }
        });
        Ok(Self {
            empty: flags & FLAG_EMPTY != 0,
            envelope,
            wkb_offset,
        })
    }
}

/// Rewrites arbitrary (possibly mixed-endian, possibly EWKB-flagged) WKB into
/// little-endian ISO WKB.
fn rewrite_wkb_little_endian(wkb: &[u8]) -> Result<Vec<u8>, GeometryError> {
    let mut out = Vec::with_capacity(wkb.len());
    let mut reader = WkbReader::new(wkb);
    reader.rewrite_geometry(&mut out)?;
    Ok(out)
}

struct WkbReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

struct WkbTypeInfo {
    base_type: u32,
    has_z: bool,
    has_m: bool,
}

impl WkbTypeInfo {
    fn iso_code(&self) -> u32 {
        self.base_type + if self.has_z { 1000 } else { 0 } + if self.has_m { 2000 } else { 0 }
    }

    fn coord_count(&self) -> usize {
        2 + usize::from(self.has_z) + usize::from(self.has_m)
    }
}

impl<'a> WkbReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, GeometryError> {
        let b = *self.buf.get(self.pos).ok_or(GeometryError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u32(&mut self, is_le: bool) -> Result<u32, GeometryError> {
        let chunk = self
            .buf
            .get(self.pos..self.pos + 4)
            .ok_or(GeometryError::Truncated)?;
        self.pos += 4;
        Ok(if is_le {
            LittleEndian::read_u32(chunk)
        } else {
            BigEndian::read_u32(chunk)
        })
    }

    fn read_f64(&mut self, is_le: bool) -> Result<f64, GeometryError> {
        let chunk = self
            .buf
            .get(self.pos..self.pos + 8)
            .ok_or(GeometryError::Truncated)?;
        self.pos += 8;
        Ok(if is_le {
            LittleEndian::read_f64(chunk)
        } else {
            BigEndian::read_f64(chunk)
        })
    }

    fn read_header(&mut self) -> Result<(bool, WkbTypeInfo), GeometryError> {
        let order = self.read_u8()?;
        let is_le = match order {
            0 => false,
            1 => true,
            other => return Err(GeometryError::BadByteOrder(other)),
        };
        let raw_type = self.read_u32(is_le)?;
        // Accept both the EWKB flag bits and the ISO 1000-based offsets.
        let mut has_z = raw_type & WKB_Z_FLAG != 0;
        let mut has_m = raw_type & WKB_M_FLAG != 0;
        let code = raw_type & !(WKB_Z_FLAG | WKB_M_FLAG);
        let base_type = match code {
            1..=7 => code,
            1001..=1007 => {
                has_z = true;
                code - 1000
            }
            2001..=2007 => {
                has_m = true;
                code - 2000
            }
            3001..=3007 => {
                has_z = true;
                has_m = true;
                code - 3000
            }
            other => return Err(GeometryError::UnsupportedWkbType(other)),
        };
        Ok((
            is_le,
            WkbTypeInfo {
                base_type,
                has_z,
                has_m,
            },
        ))
    }

    fn rewrite_geometry(&mut self, out: &mut Vec<u8>) -> Result<(), GeometryError> {
        let (is_le, info) = self.read_header()?;
        out.push(1); // little-endian
        out.write_u32::<LittleEndian>(info.iso_code()).unwrap();
        match info.base_type {
            1 => self.rewrite_coords(out, is_le, &info, 1)?,
            2 => {
                let n = self.read_u32(is_le)?;
                out.write_u32::<LittleEndian>(n).unwrap();
                self.rewrite_coords(out, is_le, &info, n as usize)?;
            }
            3 => {
                let rings = self.read_u32(is_le)?;
                out.write_u32::<LittleEndian>(rings).unwrap();
                for _ in 0..rings {
                    let n = self.read_u32(is_le)?;
                    out.write_u32::<LittleEndian>(n).unwrap();
                    self.rewrite_coords(out, is_le, &info, n as usize)?;
                }
            }
            4..=7 => {
                let n = self.read_u32(is_le)?;
                out.write_u32::<LittleEndian>(n).unwrap();
                for _ in 0..n {
                    self.rewrite_geometry(out)?;
                }
            }
            other => return Err(GeometryError::UnsupportedWkbType(other)),
        }
        Ok(())
    }

    fn rewrite_coords(
        &mut self,
        out: &mut Vec<u8>,
        is_le: bool,
        info: &WkbTypeInfo,
        points: usize,
    ) -> Result<(), GeometryError> {
        for _ in 0..points * info.coord_count() {
            let value = self.read_f64(is_le)?;
            out.write_f64::<LittleEndian>(value).unwrap();
        }
        Ok(())
    }

    fn scan_envelope(&mut self, acc: &mut Envelope) -> Result<(), GeometryError> {
        let (is_le, info) = self.read_header()?;
        match info.base_type {
            1 => self.scan_coords(acc, is_le, &info, 1)?,
            2 => {
                let n = self.read_u32(is_le)?;
                self.scan_coords(acc, is_le, &info, n as usize)?;
            }
            3 => {
                let rings = self.read_u32(is_le)?;
                for _ in 0..rings {
                    let n = self.read_u32(is_le)?;
                    self.scan_coords(acc, is_le, &info, n as usize)?;
                }
            }
            4..=7 => {
                let n = self.read_u32(is_le)?;
                for _ in 0..n {
                    self.scan_envelope(acc)?;
                }
            }
            other => return Err(GeometryError::UnsupportedWkbType(other)),
        }
        Ok(())
    }

    fn scan_coords(
        &mut self,
        acc: &mut Envelope,
        is_le: bool,
        info: &WkbTypeInfo,
        points: usize,
    ) -> Result<(), GeometryError> {
        for _ in 0..points {
            let x = self.read_f64(is_le)?;
            let y = self.read_f64(is_le)?;
            for _ in 2..info.coord_count() {
                self.read_f64(is_le)?;
            }
            if !x.is_nan() && !y.is_nan() {
                acc.extend(x, y);
            }
        }
        Ok(())
    }
}

/// A 2D structural view of a WKB geometry (Z/M ordinates dropped), used by
/// the spatial filter's exact-intersection test.
#[derive(Clone, Debug, PartialEq)]
pub enum ParsedGeometry {
    Point(Option<(f64, f64)>),
    LineString(Vec<(f64, f64)>),
    Polygon(Vec<Vec<(f64, f64)>>),
    MultiPoint(Vec<Option<(f64, f64)>>),
    MultiLineString(Vec<Vec<(f64, f64)>>),
    MultiPolygon(Vec<Vec<Vec<(f64, f64)>>>),
    Collection(Vec<ParsedGeometry>),
}

impl Geometry {
    /// Parses the WKB into 2D coordinate structure.
    pub fn parse_2d(&self) -> Result<ParsedGeometry, GeometryError> {
        let header = GpkgHeader::parse(&self.0)?;
        let mut reader = WkbReader::new(&self.0[header.wkb_offset..]);
        reader.parse_geometry_2d()
    }
}

impl WkbReader<'_> {
    fn parse_point_2d(
        &mut self,
        is_le: bool,
        info: &WkbTypeInfo,
    ) -> Result<Option<(f64, f64)>, GeometryError> {
        let x = self.read_f64(is_le)?;
        let y = self.read_f64(is_le)?;
        for _ in 2..info.coord_count() {
            self.read_f64(is_le)?;
        }
        if x.is_nan() && y.is_nan() {
            Ok(None)
        } else {
            Ok(Some((x, y)))
        }
    }

    fn parse_line_2d(
        &mut self,
        is_le: bool,
        info: &WkbTypeInfo,
    ) -> Result<Vec<(f64, f64)>, GeometryError> {
        let n = self.read_u32(is_le)?;
        let mut points = Vec::with_capacity(n as usize);
        for _ in 0..n {
            if let Some(p) = self.parse_point_2d(is_le, info)? {
                points.push(p);
            }
        }
        Ok(points)
    }

    fn parse_rings_2d(
        &mut self,
        is_le: bool,
        info: &WkbTypeInfo,
    ) -> Result<Vec<Vec<(f64, f64)>>, GeometryError> {
        let rings = self.read_u32(is_le)?;
        let mut result = Vec::with_capacity(rings as usize);
        for _ in 0..rings {
            result.push(self.parse_line_2d(is_le, info)?);
        }
        Ok(result)
    }

    fn parse_geometry_2d(&mut self) -> Result<ParsedGeometry, GeometryError> {
        let (is_le, info) = self.read_header()?;
        match info.base_type {
            1 => Ok(ParsedGeometry::Point(self.parse_point_2d(is_le, &info)?)),
            2 => Ok(ParsedGeometry::LineString(self.parse_line_2d(is_le, &info)?)),
            3 => Ok(ParsedGeometry::Polygon(self.parse_rings_2d(is_le, &info)?)),
            4..=7 => {
                let n = self.read_u32(is_le)?;
                let mut children = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    children.push(self.parse_geometry_2d()?);
                }
                match info.base_type {
                    4 => Ok(ParsedGeometry::MultiPoint(
                        children
                            .into_iter()
                            .map(|c| match c {
                                ParsedGeometry::Point(p) => Ok(p),
                                _ => Err(GeometryError::UnsupportedWkbType(4)),
                            })
                            .collect::<Result<_, _>>()?,
                    )),
                    5 => Ok(ParsedGeometry::MultiLineString(
                        children
                            .into_iter()
                            .map(|c| match c {
                                ParsedGeometry::LineString(l) => Ok(l),
                                _ => Err(GeometryError::UnsupportedWkbType(5)),
                            })
                            .collect::<Result<_, _>>()?,
                    )),
                    6 => Ok(ParsedGeometry::MultiPolygon(
                        children
                            .into_iter()
                            .map(|c| match c {
                                ParsedGeometry::Polygon(p) => Ok(p),
                                _ => Err(GeometryError::UnsupportedWkbType(6)),
                            })
                            .collect::<Result<_, _>>()?,
                    )),
                    _ => Ok(ParsedGeometry::Collection(children)),
                }
            }
            other => Err(GeometryError::UnsupportedWkbType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point_wkb_le(x: f64, y: f64) -> Vec<u8> {
        let mut wkb = vec![1u8];
        wkb.write_u32::<LittleEndian>(1).unwrap();
        wkb.write_f64::<LittleEndian>(x).unwrap();
        wkb.write_f64::<LittleEndian>(y).unwrap();
        wkb
    }

    fn point_wkb_be(x: f64, y: f64) -> Vec<u8> {
        let mut wkb = vec![0u8];
        wkb.write_u32::<BigEndian>(1).unwrap();
        wkb.write_f64::<BigEndian>(x).unwrap();
        wkb.write_f64::<BigEndian>(y).unwrap();
        wkb
    }

    #[test]
    fn test_normalise_big_endian_point() {
        let le = Geometry::from_wkb(&point_wkb_le(3.0, -7.5)).unwrap();
        let be = Geometry::from_wkb(&point_wkb_be(3.0, -7.5)).unwrap();
        assert_eq!(le, be);
        assert_eq!(le.to_wkb().unwrap(), &point_wkb_le(3.0, -7.5)[..]);
    }

    #[test]
    fn test_normalise_is_idempotent() {
        let g = Geometry::from_wkb(&point_wkb_le(1.0, 2.0)).unwrap();
        let again = Geometry::from_gpkg_bytes(g.as_bytes()).unwrap();
        assert_eq!(g, again);
    }

    #[test]
    fn test_envelope_stripped_but_computed() {
        // Header with envelope code 1 and a bogus srs_id; both must vanish.
        let wkb = point_wkb_le(5.0, 6.0);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"GP");
        bytes.push(0);
        bytes.push(FLAG_LITTLE_ENDIAN | (1 << 1));
        bytes.write_i32::<LittleEndian>(4326).unwrap();
        for value in [5.0, 5.0, 6.0, 6.0] {
            bytes.write_f64::<LittleEndian>(value).unwrap();
        }
        bytes.extend_from_slice(&wkb);

        let g = Geometry::from_gpkg_bytes(&bytes).unwrap();
        assert_eq!(g.as_bytes().len(), 8 + wkb.len());
        assert_eq!(&g.as_bytes()[4..8], &[0, 0, 0, 0]);
        let envelope = g.envelope().unwrap().unwrap();
        assert_eq!(envelope.min_x, 5.0);
        assert_eq!(envelope.max_y, 6.0);
    }

    #[test]
    fn test_multipolygon_roundtrip() {
        // MULTIPOLYGON with one square.
        let mut wkb = vec![1u8];
        wkb.write_u32::<LittleEndian>(6).unwrap();
        wkb.write_u32::<LittleEndian>(1).unwrap();
        wkb.push(1);
        wkb.write_u32::<LittleEndian>(3).unwrap();
        wkb.write_u32::<LittleEndian>(1).unwrap();
        wkb.write_u32::<LittleEndian>(5).unwrap();
        for (x, y) in [(0., 0.), (4., 0.), (4., 4.), (0., 4.), (0., 0.)] {
            wkb.write_f64::<LittleEndian>(x).unwrap();
            wkb.write_f64::<LittleEndian>(y).unwrap();
        }
        let g = Geometry::from_wkb(&wkb).unwrap();
        assert_eq!(g.to_wkb().unwrap(), &wkb[..]);
        let envelope = g.envelope().unwrap().unwrap();
        assert_eq!(
            (envelope.min_x, envelope.max_x, envelope.min_y, envelope.max_y),
            (0.0, 4.0, 0.0, 4.0)
        );
    }

    #[test]
    fn test_bad_magic() {
        assert_eq!(
            Geometry::from_gpkg_bytes(b"XX\x00\x01\x00\x00\x00\x00"),
            Err(GeometryError::BadMagic)
        );
    }
}
