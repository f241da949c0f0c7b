//! Vector-tile wire emission: encodes surviving features — already clipped,
//! shifted, and converted into the tile's own extent-space coordinates —
//! into one MVT `Tile` message, one layer per distinct layer index present,
//! then gzip-compresses the result. Built on the same `GeomEncoder`/`Layer`/
//! `Feature` builder dance a PMTiles writer uses against the `mvt` crate.

use std::collections::BTreeMap;
use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use mvt::{GeomEncoder, GeomType, Tile as MvtTile};

use crate::feature::MetaValue;
use crate::fixed::{FixedGeometry, FixedPolygonRing, FixedXy};
use crate::layer::LayerNameTable;

/// One feature ready for wire emission: tile-local extent-space geometry,
/// a resolved layer index, and plain `(key, value)` tags.
pub struct OutputFeature {
    pub layer: u32,
    pub tags: Vec<(String, MetaValue)>,
    pub geometry: FixedGeometry,
}

fn encode_point_geom(points: &[FixedXy]) -> anyhow::Result<mvt::GeomData> {
    let mut encoder = GeomEncoder::new(GeomType::Point);
    for p in points {
        encoder = encoder.point(p.x as f64, p.y as f64)?;
    }
    encoder.encode()
}

fn encode_line_geom(lines: &[Vec<FixedXy>]) -> anyhow::Result<mvt::GeomData> {
    let mut encoder = GeomEncoder::new(GeomType::Linestring);
    for line in lines {
        for p in line {
            encoder = encoder.point(p.x as f64, p.y as f64)?;
        }
        encoder = encoder.complete()?;
    }
    encoder.encode()
}

fn encode_polygon_geom(polys: &[FixedPolygonRing]) -> anyhow::Result<mvt::GeomData> {
    let mut encoder = GeomEncoder::new(GeomType::Polygon);
    for poly in polys {
        for p in &poly.outer {
            encoder = encoder.point(p.x as f64, p.y as f64)?;
        }
        encoder = encoder.complete()?;
        for ring in &poly.inners {
            for p in ring {
                encoder = encoder.point(p.x as f64, p.y as f64)?;
            }
            encoder = encoder.complete()?;
        }
    }
    encoder.encode()
}

fn apply_tag(feature: &mut mvt::Feature, key: &str, value: &MetaValue) -> anyhow::Result<()> {
    match value {
        MetaValue::Bool(b) => feature.add_tag_bool(key, *b)?,
        MetaValue::String(s) => feature.add_tag_string(key, s)?,
        MetaValue::Numeric(v) => feature.add_tag_double(key, *v)?,
        MetaValue::Integer(v) => feature.add_tag_sint(key, *v)?,
    }
    Ok(())
}

/// Encodes `features` into one MVT `Tile` message and gzip-compresses it.
/// Layers are emitted in ascending layer-index order; feature ids are
/// assigned sequentially per layer (the wire format requires an id but
/// this store doesn't carry a stable one post-aggregation).
pub fn encode_tile(features: &[OutputFeature], layers: &LayerNameTable, tile_extent: u32) -> anyhow::Result<Vec<u8>> {
    let mut by_layer: BTreeMap<u32, Vec<&OutputFeature>> = BTreeMap::new();
    for f in features {
        if !f.geometry.is_null() {
            by_layer.entry(f.layer).or_default().push(f);
        }
    }

    let mut tile = MvtTile::new(tile_extent);
    for (layer_idx, group) in by_layer {
        let name = layers.name(layer_idx).unwrap_or_else(|| format!("layer_{layer_idx}"));
        let mut mvt_layer = tile.create_layer(&name);
        let mut next_id = 1u64;
        for f in group {
            let geom = match &f.geometry {
                FixedGeometry::Null => continue,
                FixedGeometry::Point(pts) => encode_point_geom(pts)?,
                FixedGeometry::Polyline(lines) => encode_line_geom(lines)?,
                FixedGeometry::Polygon(polys) => encode_polygon_geom(polys)?,
            };
            let mut feature = mvt_layer.into_feature(geom);
            feature.set_id(next_id);
            next_id += 1;
            for (key, value) in &f.tags {
                apply_tag(&mut feature, key, value)?;
            }
            mvt_layer = feature.into_layer();
        }
        tile.add_layer(mvt_layer)?;
    }

    let bytes = tile.to_bytes()?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&bytes)?;
    Ok(encoder.finish()?)
}
