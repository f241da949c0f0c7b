//! Feature pack codec: a self-describing binary blob holding an ordered
//! set of serialized features, optionally with an embedded quad-tree
//! spatial index for tile-restricted scans.

use integer_encoding::VarInt;

use crate::feature::{Feature, MetaDecoder, MetaEncoder};
use crate::fixed::FixedBox;
use crate::quadtree::{self, QuadTree, QuadTreeEntry, Tile};

const SEGMENT_QUADTREE: u8 = 1;
const SEGMENT_TERMINATOR: u8 = 0xFF;

fn write_varint(buf: &mut Vec<u8>, v: u64) {
    let mut tmp = [0u8; 10];
    let n = v.encode_var(&mut tmp);
    buf.extend_from_slice(&tmp[..n]);
}

/// Concatenates every feature's serialized bytes with no spatial index.
/// Used by the ingest flush path for speed.
pub fn quick_pack(features: &[Feature], coder: Option<&dyn MetaEncoder>) -> Vec<u8> {
    let blobs: Vec<Vec<u8>> = features.iter().map(|f| f.serialize(coder)).collect();
    quick_pack_bytes(&blobs)
}

/// Same as [`quick_pack`] but over already-serialized feature blobs — the
/// ingest cache accumulates these directly so a flush never re-serializes.
pub fn quick_pack_bytes(blobs: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(blobs.len() as u32).to_le_bytes());
    buf.push(SEGMENT_TERMINATOR);
    for bytes in blobs {
        write_varint(&mut buf, bytes.len() as u64);
        buf.extend_from_slice(bytes);
    }
    write_varint(&mut buf, 0);
    buf
}

/// Assigns each feature a best tile, lays features out in quad-key order
/// (subtree-contiguous), and appends a quad-tree over the resulting
/// `(tile, offset, size)` groups. Used by the repack pipeline.
pub fn optimal_pack(
    root: Tile,
    features: &[Feature],
    coder: Option<&dyn MetaEncoder>,
    max_zoom: u32,
) -> anyhow::Result<Vec<u8>> {
    let mut assigned: Vec<(Vec<u8>, Tile, usize)> = Vec::with_capacity(features.len());
    for (i, f) in features.iter().enumerate() {
        let bbox = f
            .bounding_box()
            .unwrap_or_else(|| FixedBox::new(crate::fixed::FixedXy::new(0, 0), crate::fixed::FixedXy::new(0, 0)));
        let tile = quadtree::best_tile(&bbox, root, max_zoom);
        let quad_key = quadtree::quad_key(root, tile)?;
        assigned.push((quad_key, tile, i));
    }
    assigned.sort_by(|a, b| a.0.cmp(&b.0));

    let mut region = Vec::new();
    let mut entries = Vec::new();
    let mut i = 0;
    while i < assigned.len() {
        let tile = assigned[i].1;
        let start = region.len() as u32;
        let mut j = i;
        while j < assigned.len() && assigned[j].1 == tile {
            let bytes = features[assigned[j].2].serialize(coder);
            write_varint(&mut region, bytes.len() as u64);
            region.extend_from_slice(&bytes);
            j += 1;
        }
        entries.push(QuadTreeEntry {
            tile,
            offset: start,
            size: region.len() as u32 - start,
        });
        i = j;
    }
    write_varint(&mut region, 0);

    let tree = QuadTree::build(root, &entries)?;
    let quadtree_bytes = tree.serialize();

    let mut buf = Vec::new();
    buf.extend_from_slice(&(features.len() as u32).to_le_bytes());
    buf.push(SEGMENT_QUADTREE);
    let offset_field_pos = buf.len();
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.push(SEGMENT_TERMINATOR);

    let feature_region_start = buf.len();
    buf.extend_from_slice(&region);
    let quadtree_region_start = buf.len();
    buf.extend_from_slice(&quadtree_bytes);

    buf[offset_field_pos..offset_field_pos + 4].copy_from_slice(&(quadtree_region_start as u32).to_le_bytes());
    let _ = feature_region_start;
    Ok(buf)
}

/// A parsed view over one pack's bytes: header, optional quad-tree, and
/// the feature region.
pub struct PackReader<'a> {
    data: &'a [u8],
    root: Tile,
    feature_count: u32,
    feature_region_start: usize,
    quadtree: Option<QuadTree>,
}

impl<'a> PackReader<'a> {
    pub fn open(data: &'a [u8], root: Tile) -> anyhow::Result<Self> {
        if data.len() < 4 {
            anyhow::bail!("feature pack: truncated header");
        }
        let feature_count = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let mut pos = 4usize;
        let mut quadtree_offset = None;
        loop {
            let seg_id = *data
                .get(pos)
                .ok_or_else(|| anyhow::anyhow!("feature pack: truncated segment table"))?;
            pos += 1;
            if seg_id == SEGMENT_TERMINATOR {
                break;
            }
            let offset_bytes: [u8; 4] = data
                .get(pos..pos + 4)
                .ok_or_else(|| anyhow::anyhow!("feature pack: truncated segment table"))?
                .try_into()
                .unwrap();
            pos += 4;
            if seg_id == SEGMENT_QUADTREE {
                quadtree_offset = Some(u32::from_le_bytes(offset_bytes) as usize);
            }
        }
        let feature_region_start = pos;
        let quadtree = match quadtree_offset {
            Some(off) => {
                let bytes = data
                    .get(off..)
                    .ok_or_else(|| anyhow::anyhow!("feature pack: quad-tree segment offset out of range"))?;
                Some(QuadTree::deserialize(bytes, root)?)
            }
            None => None,
        };
        Ok(PackReader {
            data,
            root,
            feature_count,
            feature_region_start,
            quadtree,
        })
    }

    pub fn feature_count(&self) -> u32 {
        self.feature_count
    }

    /// Emits every feature's raw bytes in declaration order.
    pub fn full_scan(&self) -> anyhow::Result<Vec<&'a [u8]>> {
        self.slice_range(0, (self.data.len() - self.feature_region_start) as u32)
    }

    /// Emits only the feature bytes covered by `query`'s quad-tree range.
    /// Packs with no quad-tree segment (quick packs) fall back to a full
    /// scan when `query` and the pack's root tile overlap, and to nothing
    /// otherwise.
    pub fn tile_scan(&self, query: Tile) -> anyhow::Result<Vec<&'a [u8]>> {
        let ranges = match &self.quadtree {
            Some(tree) => tree.walk(query)?,
            None => {
                let related =
                    quadtree::is_ancestor_or_equal(self.root, query) || quadtree::is_ancestor_or_equal(query, self.root);
                if related {
                    return self.full_scan();
                }
                Vec::new()
            }
        };
        let mut out = Vec::new();
        for (offset, size) in ranges {
            out.extend(self.slice_range(offset, size)?);
        }
        Ok(out)
    }

    fn slice_range(&self, offset: u32, size: u32) -> anyhow::Result<Vec<&'a [u8]>> {
        let mut pos = self.feature_region_start + offset as usize;
        let end = pos + size as usize;
        let mut out = Vec::new();
        while pos < end {
            let (len, n) = u64::decode_var(&self.data[pos..])
                .ok_or_else(|| anyhow::anyhow!("feature pack: truncated feature length"))?;
            pos += n;
            if len == 0 {
                break;
            }
            let len = len as usize;
            let bytes = self
                .data
                .get(pos..pos + len)
                .ok_or_else(|| anyhow::anyhow!("feature pack: truncated feature body"))?;
            out.push(bytes);
            pos += len;
        }
        Ok(out)
    }
}

/// Deserializes every feature found in `bytes`, in declaration order,
/// applying box/zoom hints to skip what can be skipped cheaply.
pub fn decode_all(
    bytes: &[&[u8]],
    box_hint: Option<&FixedBox>,
    zoom_hint: Option<u32>,
    decoder: Option<&dyn MetaDecoder>,
) -> anyhow::Result<Vec<Feature>> {
    let mut out = Vec::with_capacity(bytes.len());
    for b in bytes {
        if let Some(f) = Feature::deserialize_hinted(b, box_hint, zoom_hint, decoder)? {
            out.push(f);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_ZOOM_SENTINEL;
    use crate::fixed::{FixedGeometry, FixedXy};

    fn line_feature(id: u64, x0: i64, y0: i64, x1: i64, y1: i64) -> Feature {
        Feature::new(
            id,
            0,
            0,
            MAX_ZOOM_SENTINEL,
            vec![],
            FixedGeometry::Polyline(vec![vec![FixedXy::new(x0, y0), FixedXy::new(x1, y1)]]),
        )
        .unwrap()
    }

    #[test]
    fn quick_pack_full_scan_roundtrips_in_order() {
        let features = vec![line_feature(1, 0, 0, 10, 10), line_feature(2, 20, 20, 30, 30)];
        let bytes = quick_pack(&features, None);
        let reader = PackReader::open(&bytes, (0, 0, 0)).unwrap();
        assert_eq!(reader.feature_count(), 2);
        let raw = reader.full_scan().unwrap();
        let decoded = decode_all(&raw, None, None, None).unwrap();
        assert_eq!(decoded, features);
    }

    #[test]
    fn optimal_pack_tile_scan_finds_assigned_feature() {
        let root = (0, 0, 0);
        let features = vec![line_feature(1, 10, 10, 20, 20)];
        let bytes = optimal_pack(root, &features, None, 10).unwrap();
        let reader = PackReader::open(&bytes, root).unwrap();

        let raw = reader.tile_scan(root).unwrap();
        let decoded = decode_all(&raw, None, None, None).unwrap();
        assert_eq!(decoded, features);
    }

    #[test]
    fn optimal_pack_tile_scan_misses_disjoint_tile() {
        let root = (0, 0, 0);
        let features = vec![line_feature(1, 10, 10, 20, 20)];
        let bytes = optimal_pack(root, &features, None, 10).unwrap();
        let reader = PackReader::open(&bytes, root).unwrap();

        let far = (100, 100, 0);
        assert!(reader.tile_scan(far).unwrap().is_empty());
    }
}
