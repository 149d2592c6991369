//! Polygon decoding and bounding boxes.
//! All coordinate math uses f64, in the geometry's geographic CRS.

use geo::{BoundingRect, Coord, LineString, MultiPolygon, Polygon};

use crate::error::GeometryError;

/// Axis-aligned bounding box in geographic units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self { min_x, min_y, max_x, max_y }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn of(geom: &MultiPolygon<f64>) -> Option<Self> {
        geom.bounding_rect().map(|r| Self::new(r.min().x, r.min().y, r.max().x, r.max().y))
    }

    pub fn to_polygon(&self) -> Polygon<f64> {
        geo::Rect::new(
            Coord { x: self.min_x, y: self.min_y },
            Coord { x: self.max_x, y: self.max_y },
        )
        .to_polygon()
    }
}

// ── WKB ───────────────────────────────────────────────────────────────────────

const WKB_POLYGON: u32 = 3;
const WKB_MULTIPOLYGON: u32 = 6;
const WKB_COLLECTION: u32 = 7;

const EWKB_Z: u32 = 0x8000_0000;
const EWKB_M: u32 = 0x4000_0000;
const EWKB_SRID: u32 = 0x2000_0000;

struct WkbReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WkbReader<'a> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], GeometryError> {
        let end = self.pos + N;
        let bytes = self.buf.get(self.pos..end).ok_or(GeometryError::Truncated(self.pos))?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn byte_order(&mut self) -> Result<bool, GeometryError> {
        match self.take::<1>()?[0] {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(GeometryError::ByteOrder(b)),
        }
    }

    fn u32(&mut self, le: bool) -> Result<u32, GeometryError> {
        let b = self.take::<4>()?;
        Ok(if le { u32::from_le_bytes(b) } else { u32::from_be_bytes(b) })
    }

    fn f64(&mut self, le: bool) -> Result<f64, GeometryError> {
        let b = self.take::<8>()?;
        Ok(if le { f64::from_le_bytes(b) } else { f64::from_be_bytes(b) })
    }

    /// Reads a geometry header; returns (little-endian, base type, dimensions).
    fn header(&mut self) -> Result<(bool, u32, usize), GeometryError> {
        let le = self.byte_order()?;
        let raw = self.u32(le)?;
        let mut dims = 2;
        if raw & EWKB_Z != 0 {
            dims += 1;
        }
        if raw & EWKB_M != 0 {
            dims += 1;
        }
        if raw & EWKB_SRID != 0 {
            self.u32(le)?;
        }
        let code = raw & 0x0FFF_FFFF;
        // ISO WKB: 1000s = Z, 2000s = M, 3000s = ZM.
        dims += match code / 1000 {
            1 | 2 => 1,
            3 => 2,
            _ => 0,
        };
        Ok((le, code % 1000, dims))
    }

    fn polygon_body(&mut self, le: bool, dims: usize) -> Result<Polygon<f64>, GeometryError> {
        let n_rings = self.u32(le)? as usize;
        let mut rings = Vec::with_capacity(n_rings.min(1024));
        for _ in 0..n_rings {
            let n_points = self.u32(le)? as usize;
            let mut coords = Vec::with_capacity(n_points.min(1 << 16));
            for _ in 0..n_points {
                let x = self.f64(le)?;
                let y = self.f64(le)?;
                for _ in 2..dims {
                    self.f64(le)?;
                }
                coords.push(Coord { x, y });
            }
            rings.push(LineString::new(coords));
        }
        let mut rings = rings.into_iter();
        let exterior = rings.next().unwrap_or_else(|| LineString::new(Vec::new()));
        Ok(Polygon::new(exterior, rings.collect()))
    }

    fn collect_polygons(&mut self, out: &mut Vec<Polygon<f64>>) -> Result<(), GeometryError> {
        let (le, kind, dims) = self.header()?;
        match kind {
            WKB_POLYGON => out.push(self.polygon_body(le, dims)?),
            WKB_MULTIPOLYGON | WKB_COLLECTION => {
                let n = self.u32(le)?;
                for _ in 0..n {
                    self.collect_polygons(out)?;
                }
            }
            other => return Err(GeometryError::UnsupportedType(other)),
        }
        Ok(())
    }
}

/// Decode a WKB (or PostGIS EWKB) polygon, multipolygon or collection of them.
pub fn decode_wkb(bytes: &[u8]) -> Result<MultiPolygon<f64>, GeometryError> {
    let mut reader = WkbReader { buf: bytes, pos: 0 };
    let mut polygons = Vec::new();
    reader.collect_polygons(&mut polygons)?;
    polygons.retain(|p| !p.exterior().0.is_empty());
    if polygons.is_empty() {
        return Err(GeometryError::Empty);
    }
    Ok(MultiPolygon::new(polygons))
}

/// Little-endian 2D WKB for a multipolygon.
#[cfg(test)]
pub(crate) fn encode_wkb(geom: &MultiPolygon<f64>) -> Vec<u8> {
    let mut out = vec![1u8];
    out.extend_from_slice(&WKB_MULTIPOLYGON.to_le_bytes());
    out.extend_from_slice(&(geom.0.len() as u32).to_le_bytes());
    for poly in &geom.0 {
        out.push(1);
        out.extend_from_slice(&WKB_POLYGON.to_le_bytes());
        let rings: Vec<&LineString<f64>> =
            std::iter::once(poly.exterior()).chain(poly.interiors()).collect();
        out.extend_from_slice(&(rings.len() as u32).to_le_bytes());
        for ring in rings {
            out.extend_from_slice(&(ring.0.len() as u32).to_le_bytes());
            for c in &ring.0 {
                out.extend_from_slice(&c.x.to_le_bytes());
                out.extend_from_slice(&c.y.to_le_bytes());
            }
        }
    }
    out
}
