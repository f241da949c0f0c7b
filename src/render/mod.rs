//! Render pipeline: turns a query tile into a gzip-compressed vector-tile
//! message, or the cached bytes from a previous render.
//!
//! Geometry stays in reference-zoom fixed-point units through clip,
//! simplify, and aggregation, at full precision until the very last step.
//! Only once a feature's final
//! shape is settled does this module shift it down to the query zoom and
//! rescale it into the tile's own `0..tile_extent` space, right before
//! handing it to [`mvt_encode`].

pub mod aggregate;
pub mod mvt_encode;

use std::collections::BTreeMap;

use geo::BooleanOps;

use crate::config::StoreConfig;
use crate::feature::{Feature, MetaDecoder, MetaPair, MetaValue};
use crate::fixed::{self, FixedBox, FixedGeometry, FixedPolygonRing, FixedXy};
use crate::layer::LayerNameTable;
use crate::packheap::PackHeap;
use crate::tiledb::TileDb;

pub type Tile = (u32, u32, u32);

/// Toggles the `(layer, metadata)` aggregation step. Off only for tests that
/// want to see individual segments survive intact.
#[derive(Debug, Clone, Copy)]
pub struct RenderOptions {
    pub aggregate: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        RenderOptions { aggregate: true }
    }
}

fn tile_side_at_zoom(z: u32) -> i64 {
    (crate::config::FIXED_COORD_MAX >> z).max(1)
}

/// A query tile's draw bounds in reference-zoom fixed units, expanded by
/// `config.overdraw` (itself expressed at the tile's own zoom, so it's
/// scaled up to reference-zoom units before use).
fn draw_bounds(q: Tile, config: &StoreConfig) -> FixedBox {
    let side = tile_side_at_zoom(q.2);
    let min = FixedXy::new(q.0 as i64 * side, q.1 as i64 * side);
    let max = FixedXy::new(min.x + side, min.y + side);
    let delta_z = config.reference_zoom.saturating_sub(q.2);
    let margin = config.overdraw << delta_z;
    FixedBox::new(min, max).expand(margin)
}

/// The index-zoom tiles covering `q`: a single ancestor when `q` is already
/// at or below index zoom, or every descendant index-zoom tile when `q` is
/// shallower.
fn source_tiles(index_zoom: u32, q: Tile) -> Vec<Tile> {
    if q.2 >= index_zoom {
        let shift = q.2 - index_zoom;
        return vec![(q.0 >> shift, q.1 >> shift, index_zoom)];
    }
    let shift = index_zoom - q.2;
    let span = 1u32 << shift;
    let x0 = q.0 << shift;
    let y0 = q.1 << shift;
    let mut out = Vec::with_capacity((span * span) as usize);
    for dy in 0..span {
        for dx in 0..span {
            out.push((x0 + dx, y0 + dy, index_zoom));
        }
    }
    out
}

struct Survivor {
    layer: u32,
    meta: Vec<MetaPair>,
    geometry: FixedGeometry,
}

/// Collects and filters every feature visible at `q`, still in
/// reference-zoom units (clipped but not yet shifted to the query zoom).
fn collect_survivors(
    db: &TileDb,
    heap: &PackHeap,
    config: &StoreConfig,
    decoder: Option<&dyn MetaDecoder>,
    q: Tile,
) -> anyhow::Result<Vec<Survivor>> {
    let bounds = draw_bounds(q, config);
    let mut out = Vec::new();

    for source in source_tiles(config.index_zoom, q) {
        let records = db.feature_records(source.0, source.1, source.2)?;
        for record in records {
            let bytes = heap.get(record)?;
            let reader = crate::featurepack::PackReader::open(&bytes, source)?;
            let ranges = reader.tile_scan(q)?;
            for raw in ranges {
                let feature = match Feature::deserialize_hinted(raw, Some(&bounds), Some(q.2), decoder)? {
                    Some(f) => f,
                    None => continue,
                };
                let clipped = fixed::clip(&feature.geometry, &bounds);
                if clipped.is_null() {
                    continue;
                }
                out.push(Survivor {
                    layer: feature.layer,
                    meta: feature.meta,
                    geometry: clipped,
                });
            }
        }
    }
    Ok(out)
}

fn oneway_of(meta: &[MetaPair]) -> bool {
    meta.iter()
        .find(|p| p.key == "oneway")
        .and_then(|p| p.decode_value().ok())
        .map(|v| matches!(v, MetaValue::Bool(true)))
        .unwrap_or(false)
}

fn to_geo_polygon(p: &FixedPolygonRing) -> geo_types::Polygon<f64> {
    let outer = geo_types::LineString::from(p.outer.iter().map(|xy| (xy.x as f64, xy.y as f64)).collect::<Vec<_>>());
    let inners: Vec<geo_types::LineString<f64>> = p
        .inners
        .iter()
        .map(|r| geo_types::LineString::from(r.iter().map(|xy| (xy.x as f64, xy.y as f64)).collect::<Vec<_>>()))
        .collect();
    geo_types::Polygon::new(outer, inners)
}

fn from_geo_polygon(p: &geo_types::Polygon<f64>) -> Option<FixedPolygonRing> {
    let outer: Vec<FixedXy> = p
        .exterior()
        .coords()
        .map(|c| FixedXy::new(c.x.round() as i64, c.y.round() as i64))
        .collect();
    if outer.len() < 3 {
        return None;
    }
    let inners: Vec<Vec<FixedXy>> = p
        .interiors()
        .iter()
        .map(|r| r.coords().map(|c| FixedXy::new(c.x.round() as i64, c.y.round() as i64)).collect())
        .filter(|r: &Vec<FixedXy>| r.len() >= 3)
        .collect();
    Some(FixedPolygonRing { outer, inners })
}

/// Unions every polygon in the group into one multi-polygon, folding
/// pairwise since `geo::BooleanOps` only unions two shapes at a time.
fn union_polygons(groups: Vec<FixedPolygonRing>) -> Vec<FixedPolygonRing> {
    let mut acc: Option<geo_types::MultiPolygon<f64>> = None;
    for ring in &groups {
        let gp = geo_types::MultiPolygon(vec![to_geo_polygon(ring)]);
        acc = Some(match acc {
            Some(a) => a.union(&gp),
            None => gp,
        });
    }
    match acc {
        Some(mp) => mp.0.iter().filter_map(from_geo_polygon).collect(),
        None => Vec::new(),
    }
}

/// Shifts `geo` down from reference zoom to `q.z`, then rescales it from
/// world units (one tile spans `TILE_SIZE`) into the tile's own
/// `0..tile_extent` coordinate space — the transform the `mvt` crate's
/// `GeomEncoder` needs, kept out of [`mvt_encode`] so that module never has
/// to know about tile origins or reference zooms.
fn to_tile_local(geo: FixedGeometry, config: &StoreConfig, q: Tile) -> FixedGeometry {
    let shifted = fixed::shift(geo, config.reference_zoom, q.2);
    let scale = config.tile_extent as f64 / crate::config::TILE_SIZE as f64;
    let origin_x = q.0 as i64 * crate::config::TILE_SIZE;
    let origin_y = q.1 as i64 * crate::config::TILE_SIZE;
    let xf = |x: i64| ((x - origin_x) as f64 * scale).round() as i64;
    let yf = |y: i64| ((y - origin_y) as f64 * scale).round() as i64;
    let local = |p: FixedXy| FixedXy::new(xf(p.x), yf(p.y));

    match shifted {
        FixedGeometry::Null => FixedGeometry::Null,
        FixedGeometry::Point(pts) => {
            let out: crate::fixed::FixedPoint = pts.into_iter().map(local).collect();
            FixedGeometry::Point(out)
        }
        FixedGeometry::Polyline(lines) => {
            let out: crate::fixed::FixedPolyline = lines
                .into_iter()
                .map(|l| -> crate::fixed::FixedLine { l.into_iter().map(local).collect() })
                .collect();
            FixedGeometry::Polyline(out)
        }
        FixedGeometry::Polygon(polys) => {
            let out: crate::fixed::FixedPolygon = polys
                .into_iter()
                .map(|p| FixedPolygonRing {
                    outer: p.outer.into_iter().map(local).collect(),
                    inners: p.inners.into_iter().map(|r| r.into_iter().map(local).collect()).collect(),
                })
                .collect();
            FixedGeometry::Polygon(out)
        }
    }
}

/// Renders `q`, checking the precomputed `tiles` table first and caching
/// the result there on a cold render.
pub fn render_tile(
    db: &TileDb,
    heap: &PackHeap,
    layers: &LayerNameTable,
    config: &StoreConfig,
    decoder: Option<&dyn MetaDecoder>,
    q: Tile,
    options: RenderOptions,
) -> anyhow::Result<Vec<u8>> {
    if let Some(cached) = db.get_tile(q.0, q.1, q.2)? {
        return Ok(cached);
    }

    let survivors = collect_survivors(db, heap, config, decoder, q)?;

    let mut groups: BTreeMap<(u32, Vec<MetaPair>), Vec<FixedGeometry>> = BTreeMap::new();
    for s in survivors {
        groups.entry((s.layer, s.meta)).or_default().push(s.geometry);
    }

    let simplify_tolerance = 1i64 << config.reference_zoom.saturating_sub(q.2).min(62);
    let mut out_features = Vec::new();

    for ((layer, meta), geoms) in groups {
        let tags: Vec<(String, MetaValue)> = meta
            .iter()
            .filter_map(|p| p.decode_value().ok().map(|v| (p.key.clone(), v)))
            .collect();

        let is_line = geoms.iter().any(|g| matches!(g, FixedGeometry::Polyline(_)));
        let is_polygon = geoms.iter().any(|g| matches!(g, FixedGeometry::Polygon(_)));

        if options.aggregate && is_line {
            let oneway = oneway_of(&meta);
            let mut segments = Vec::new();
            for g in &geoms {
                if let FixedGeometry::Polyline(lines) = g {
                    segments.extend(lines.iter().cloned());
                }
            }
            let joined = aggregate::aggregate_lines(segments, oneway);
            let aggregated = fixed::simplify(FixedGeometry::Polyline(joined), simplify_tolerance);
            if !aggregated.is_null() {
                out_features.push((layer, tags.clone(), aggregated));
            }
        } else if options.aggregate && is_polygon {
            let mut rings = Vec::new();
            for g in &geoms {
                if let FixedGeometry::Polygon(polys) = g {
                    rings.extend(polys.iter().cloned());
                }
            }
            let unioned = union_polygons(rings);
            if !unioned.is_empty() {
                out_features.push((layer, tags.clone(), FixedGeometry::Polygon(unioned)));
            }
        } else {
            for g in geoms {
                let g = if matches!(g, FixedGeometry::Polyline(_)) {
                    fixed::simplify(g, simplify_tolerance)
                } else {
                    g
                };
                if !g.is_null() {
                    out_features.push((layer, tags.clone(), g));
                }
            }
        }
    }

    let encodable: Vec<mvt_encode::OutputFeature> = out_features
        .into_iter()
        .map(|(layer, tags, geom)| mvt_encode::OutputFeature {
            layer,
            tags,
            geometry: to_tile_local(geom, config, q),
        })
        .collect();

    let bytes = mvt_encode::encode_tile(&encodable, layers, config.tile_extent)?;
    db.put_tile(q.0, q.1, q.2, &bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_ZOOM_SENTINEL;
    use crate::featurepack;
    use crate::fixed::FixedXy;
    use tempfile::tempdir;

    fn harness() -> (tempfile::TempDir, TileDb, PackHeap, LayerNameTable, StoreConfig) {
        let dir = tempdir().unwrap();
        let db = TileDb::open(&dir.path().join("t.db")).unwrap();
        let heap = PackHeap::open(&dir.path().join("t.pack")).unwrap();
        let layers = LayerNameTable::new();
        let mut config = StoreConfig::default();
        config.index_zoom = 4;
        config.reference_zoom = 10;
        (dir, db, heap, layers, config)
    }

    fn line_feature(id: u64, layer: u32, x0: i64, y0: i64, x1: i64, y1: i64) -> Feature {
        Feature::new(
            id,
            layer,
            0,
            MAX_ZOOM_SENTINEL,
            vec![],
            FixedGeometry::Polyline(vec![vec![FixedXy::new(x0, y0), FixedXy::new(x1, y1)]]),
        )
        .unwrap()
    }

    #[test]
    fn source_tiles_single_ancestor_when_query_is_deeper() {
        let tiles = source_tiles(4, (20, 20, 6));
        assert_eq!(tiles, vec![(5, 5, 4)]);
    }

    #[test]
    fn source_tiles_fan_out_when_query_is_shallower() {
        let tiles = source_tiles(4, (1, 1, 3));
        assert_eq!(tiles.len(), 4);
        assert!(tiles.contains(&(2, 2, 4)));
        assert!(tiles.contains(&(3, 3, 4)));
    }

    #[test]
    fn empty_db_renders_an_empty_but_valid_tile() {
        let (_dir, db, heap, layers, config) = harness();
        let bytes = render_tile(&db, &heap, &layers, &config, None, (0, 0, 0), RenderOptions::default()).unwrap();
        assert!(!bytes.is_empty()); // still a valid gzip-wrapped empty Tile message
    }

    #[test]
    fn cached_tile_short_circuits_the_pipeline() {
        let (_dir, db, heap, layers, config) = harness();
        db.put_tile(1, 2, 3, b"precomputed").unwrap();
        let bytes = render_tile(&db, &heap, &layers, &config, None, (1, 2, 3), RenderOptions::default()).unwrap();
        assert_eq!(bytes, b"precomputed");
    }

    #[test]
    fn feature_round_trips_into_a_rendered_tile() {
        let (_dir, db, mut heap, layers, config) = harness();
        let root = (0, 0, 0);
        let tile_span = crate::config::FIXED_COORD_MAX >> config.index_zoom;
        let f = line_feature(1, 1, tile_span + 1, tile_span + 1, tile_span + 10, tile_span + 10);
        let bytes = featurepack::quick_pack(&[f], None);
        let record = heap.append(&bytes).unwrap();
        db.insert_feature_records(1, 1, config.index_zoom, 0, &[record]).unwrap();

        layers.get_or_create_index("roads");
        let bytes = render_tile(&db, &heap, &layers, &config, None, root, RenderOptions::default()).unwrap();
        assert!(!bytes.is_empty());

        // rendering again hits the now-cached tiles table entry
        let cached = render_tile(&db, &heap, &layers, &config, None, root, RenderOptions::default()).unwrap();
        assert_eq!(bytes, cached);
    }
}
