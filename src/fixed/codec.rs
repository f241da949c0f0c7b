//! Geometry codec: length-prefixed, zig-zag delta-encoded serialization of
//! [`FixedGeometry`] variants.
//!
//! Every coordinate stream resets its delta origin to
//! [`crate::config::FIXED_COORD_MAGIC_OFFSET`] so that signed deltas stay
//! symmetric around a magic offset rather than around zero.

use integer_encoding::VarInt;

use crate::config::FIXED_COORD_MAGIC_OFFSET;

use super::geometry::{
    FixedGeometry, FixedLine, FixedPoint, FixedPolygon, FixedPolygonRing, FixedRing, FixedXy,
};

const TAG_NULL: u8 = 0;
const TAG_POINT: u8 = 1;
const TAG_POLYLINE: u8 = 2;
const TAG_POLYGON: u8 = 3;

struct DeltaEncoder {
    curr: i64,
}

impl DeltaEncoder {
    fn new() -> Self {
        DeltaEncoder {
            curr: FIXED_COORD_MAGIC_OFFSET,
        }
    }

    fn encode(&mut self, val: i64) -> i64 {
        let delta = val - self.curr;
        self.curr = val;
        delta
    }
}

struct DeltaDecoder {
    curr: i64,
}

impl DeltaDecoder {
    fn new() -> Self {
        DeltaDecoder {
            curr: FIXED_COORD_MAGIC_OFFSET,
        }
    }

    fn decode(&mut self, delta: i64) -> i64 {
        self.curr += delta;
        self.curr
    }
}

fn write_varint(buf: &mut Vec<u8>, v: u64) {
    let mut tmp = [0u8; 10];
    let n = v.encode_var(&mut tmp);
    buf.extend_from_slice(&tmp[..n]);
}

fn write_zigzag(buf: &mut Vec<u8>, v: i64) {
    let mut tmp = [0u8; 10];
    let n = v.encode_var(&mut tmp);
    buf.extend_from_slice(&tmp[..n]);
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn read_varint(&mut self) -> anyhow::Result<u64> {
        let (v, n) = u64::decode_var(&self.data[self.pos..])
            .ok_or_else(|| anyhow::anyhow!("geometry codec: truncated varint"))?;
        self.pos += n;
        Ok(v)
    }

    fn read_zigzag(&mut self) -> anyhow::Result<i64> {
        let (v, n) = i64::decode_var(&self.data[self.pos..])
            .ok_or_else(|| anyhow::anyhow!("geometry codec: truncated varint"))?;
        self.pos += n;
        Ok(v)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }
}

fn encode_ring(buf: &mut Vec<u8>, ring: &[FixedXy]) {
    write_varint(buf, ring.len() as u64);
    let mut ex = DeltaEncoder::new();
    let mut ey = DeltaEncoder::new();
    for p in ring {
        write_zigzag(buf, ex.encode(p.x));
        write_zigzag(buf, ey.encode(p.y));
    }
}

fn decode_ring(r: &mut Reader) -> anyhow::Result<Vec<FixedXy>> {
    let count = r.read_varint()? as usize;
    let mut dx = DeltaDecoder::new();
    let mut dy = DeltaDecoder::new();
    let mut ring = Vec::with_capacity(count);
    for _ in 0..count {
        let x = dx.decode(r.read_zigzag()?);
        let y = dy.decode(r.read_zigzag()?);
        ring.push(FixedXy::new(x, y));
    }
    Ok(ring)
}

/// Serialize a [`FixedGeometry`] to its length-prefixed, delta-encoded wire form.
pub fn serialize(geo: &FixedGeometry) -> Vec<u8> {
    let mut buf = Vec::new();
    match geo {
        FixedGeometry::Null => buf.push(TAG_NULL),
        FixedGeometry::Point(pts) => {
            buf.push(TAG_POINT);
            encode_ring(&mut buf, pts);
        }
        FixedGeometry::Polyline(lines) => {
            buf.push(TAG_POLYLINE);
            write_varint(&mut buf, lines.len() as u64);
            for line in lines {
                encode_ring(&mut buf, line);
            }
        }
        FixedGeometry::Polygon(polys) => {
            buf.push(TAG_POLYGON);
            write_varint(&mut buf, polys.len() as u64);
            for poly in polys {
                encode_ring(&mut buf, &poly.outer);
                write_varint(&mut buf, poly.inners.len() as u64);
                for inner in &poly.inners {
                    encode_ring(&mut buf, inner);
                }
            }
        }
    }
    buf
}

/// Inverse of [`serialize`]. Fatal on a truncated or malformed stream.
pub fn deserialize(data: &[u8]) -> anyhow::Result<FixedGeometry> {
    if data.is_empty() {
        anyhow::bail!("geometry codec: empty buffer");
    }
    let tag = data[0];
    let mut r = Reader::new(&data[1..]);
    let geo = match tag {
        TAG_NULL => FixedGeometry::Null,
        TAG_POINT => {
            let ring = decode_ring(&mut r)?;
            let pts: FixedPoint = ring.into_iter().collect();
            FixedGeometry::Point(pts)
        }
        TAG_POLYLINE => {
            let count = r.read_varint()? as usize;
            let mut lines: FixedPolyline = Vec::with_capacity(count);
            for _ in 0..count {
                let ring = decode_ring(&mut r)?;
                lines.push(ring as FixedLine);
            }
            FixedGeometry::Polyline(lines)
        }
        TAG_POLYGON => {
            let count = r.read_varint()? as usize;
            let mut polys: FixedPolygon = Vec::with_capacity(count);
            for _ in 0..count {
                let outer: FixedRing = decode_ring(&mut r)?;
                let inner_count = r.read_varint()? as usize;
                let mut inners = Vec::with_capacity(inner_count);
                for _ in 0..inner_count {
                    inners.push(decode_ring(&mut r)?);
                }
                polys.push(FixedPolygonRing { outer, inners });
            }
            FixedGeometry::Polygon(polys)
        }
        other => anyhow::bail!("geometry codec: unknown tag {other}"),
    };
    let _ = r.at_end();
    Ok(geo)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xy(x: i64, y: i64) -> FixedXy {
        FixedXy::new(x, y)
    }

    #[test]
    fn roundtrip_null() {
        let geo = FixedGeometry::Null;
        assert_eq!(deserialize(&serialize(&geo)).unwrap(), geo);
    }

    #[test]
    fn roundtrip_point() {
        let geo = FixedGeometry::Point(FixedPoint::from_vec(vec![xy(1, 2), xy(-5, 100), xy(0, 0)]));
        assert_eq!(deserialize(&serialize(&geo)).unwrap(), geo);
    }

    #[test]
    fn roundtrip_polyline() {
        let geo = FixedGeometry::Polyline(vec![
            vec![xy(0, 0), xy(10, 10), xy(20, 5)],
            vec![xy(-3, -3), xy(7, 7)],
        ]);
        assert_eq!(deserialize(&serialize(&geo)).unwrap(), geo);
    }

    #[test]
    fn roundtrip_polygon_with_holes() {
        let geo = FixedGeometry::Polygon(vec![FixedPolygonRing {
            outer: vec![xy(0, 0), xy(0, 100), xy(100, 100), xy(100, 0), xy(0, 0)],
            inners: vec![vec![xy(10, 10), xy(10, 20), xy(20, 20), xy(20, 10), xy(10, 10)]],
        }]);
        assert_eq!(deserialize(&serialize(&geo)).unwrap(), geo);
    }

    #[test]
    fn truncated_stream_is_fatal() {
        let geo = FixedGeometry::Point(FixedPoint::from_vec(vec![xy(1, 2)]));
        let mut buf = serialize(&geo);
        buf.truncate(buf.len() - 1);
        assert!(deserialize(&buf).is_err());
    }
}
