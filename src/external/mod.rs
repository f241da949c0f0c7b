//! External collaborator surface: the capability seams the ingest and
//! render pipelines consume but never implement themselves — an OSM
//! reader, a tag classifier, and a geometry-ops wrapper over `geo`.
//! Production wiring supplies real implementations; this crate only
//! defines the traits plus test doubles.

use crate::feature::MetaPair;
use crate::fixed::{FixedBox, FixedGeometry};

/// The not-yet-classified precursor to a [`crate::feature::Feature`]: owns
/// geometry and raw tags, but hasn't been assigned a layer or zoom range.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingFeature {
    pub tags: Vec<(String, String)>,
    pub geometry: FixedGeometry,
}

/// The result of classification: a feature ready for [`crate::feature::Feature::new`]
/// once an id and layer index have been assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedFeature {
    pub layer: String,
    pub min_zoom: u32,
    pub max_zoom: u32,
    pub meta: Vec<MetaPair>,
    pub geometry: FixedGeometry,
}

/// Consumes raw OSM primitives and produces [`PendingFeature`]s. Stands in
/// for an OSM PBF reader, deliberately out of scope for this crate.
pub trait SourceFeed {
    fn process_node(&mut self, id: u64, lon: f64, lat: f64);
    fn process_way(&mut self, id: u64, node_ids: &[u64]) -> Option<PendingFeature>;
    fn process_area(&mut self, id: u64, outer_node_ids: &[u64], inner_node_ids: &[Vec<u64>]) -> Option<PendingFeature>;
}

/// Resolves a [`PendingFeature`]'s raw tags into a layer and zoom range.
/// Stands in for an embedded tag-classification script, deliberately out
/// of scope for this crate.
pub trait FeatureClassifier {
    fn classify(&self, pending: &PendingFeature) -> Option<ClassifiedFeature>;
}

/// Thin wrapper over the `geo` crate's boolean and simplification
/// algorithms, given a name so ingest-side callers (coastline merging,
/// area validation) don't reach into `fixed::algo` directly.
pub trait GeometryOps {
    fn clip_to_rect(&self, geo: &FixedGeometry, bounds: &FixedBox) -> FixedGeometry;
    fn simplify(&self, geo: FixedGeometry, tolerance: i64) -> FixedGeometry;
    fn point_in_polygon(&self, point: crate::fixed::FixedXy, polygon: &crate::fixed::FixedPolygonRing) -> bool;
    /// Orientation sign of a ring: positive for counter-clockwise, negative
    /// for clockwise, zero for degenerate input.
    fn ring_orientation(&self, ring: &[crate::fixed::FixedXy]) -> i64;
}

/// The production [`GeometryOps`] implementation, riding directly on
/// [`crate::fixed::algo`] — the same functions the render pipeline calls.
pub struct FixedGeometryOps;

impl GeometryOps for FixedGeometryOps {
    fn clip_to_rect(&self, geo: &FixedGeometry, bounds: &FixedBox) -> FixedGeometry {
        crate::fixed::clip(geo, bounds)
    }

    fn simplify(&self, geo: FixedGeometry, tolerance: i64) -> FixedGeometry {
        crate::fixed::simplify(geo, tolerance)
    }

    fn point_in_polygon(&self, point: crate::fixed::FixedXy, polygon: &crate::fixed::FixedPolygonRing) -> bool {
        if !ray_cast(point, &polygon.outer) {
            return false;
        }
        !polygon.inners.iter().any(|hole| ray_cast(point, hole))
    }

    fn ring_orientation(&self, ring: &[crate::fixed::FixedXy]) -> i64 {
        if ring.len() < 3 {
            return 0;
        }
        let mut acc: i64 = 0;
        for w in ring.windows(2) {
            acc += w[0].x * w[1].y - w[1].x * w[0].y;
        }
        let n = ring.len();
        acc += ring[n - 1].x * ring[0].y - ring[0].x * ring[n - 1].y;
        acc.signum()
    }
}

/// Standard even-odd ray casting, x-axis ray. `ring` is assumed closed
/// (first point repeated at the end) like every other ring in this crate.
fn ray_cast(p: crate::fixed::FixedXy, ring: &[crate::fixed::FixedXy]) -> bool {
    let mut inside = false;
    for w in ring.windows(2) {
        let (a, b) = (w[0], w[1]);
        let crosses = (a.y > p.y) != (b.y > p.y);
        if crosses {
            let x_at_y = a.x as f64 + (p.y - a.y) as f64 * (b.x - a.x) as f64 / (b.y - a.y) as f64;
            if (p.x as f64) < x_at_y {
                inside = !inside;
            }
        }
    }
    inside
}

#[cfg(test)]
pub mod test_doubles {
    //! Minimal in-memory collaborators used only by this crate's own
    //! tests, so the ingest pipeline has something concrete to drive
    //! without a real OSM reader or scripting engine.

    use super::*;
    use std::collections::HashMap;

    use crate::feature::MetaValue;
    use crate::fixed::FixedXy;

    /// An in-memory node table plus a fixed way->line, area->polygon
    /// translation — enough to exercise [`SourceFeed`] end to end.
    #[derive(Default)]
    pub struct InMemorySourceFeed {
        nodes: HashMap<u64, FixedXy>,
    }

    impl InMemorySourceFeed {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl SourceFeed for InMemorySourceFeed {
        fn process_node(&mut self, id: u64, lon: f64, lat: f64) {
            // Test-only projection: scale degrees directly into fixed units,
            // no real Web Mercator math (that belongs to a production feed).
            let scale = 1000.0;
            self.nodes.insert(id, FixedXy::new((lon * scale) as i64, (lat * scale) as i64));
        }

        fn process_way(&mut self, _id: u64, node_ids: &[u64]) -> Option<PendingFeature> {
            let line: Vec<FixedXy> = node_ids.iter().filter_map(|id| self.nodes.get(id).copied()).collect();
            if line.len() < 2 {
                return None;
            }
            Some(PendingFeature {
                tags: Vec::new(),
                geometry: FixedGeometry::Polyline(vec![line]),
            })
        }

        fn process_area(
            &mut self,
            _id: u64,
            outer_node_ids: &[u64],
            inner_node_ids: &[Vec<u64>],
        ) -> Option<PendingFeature> {
            let outer: Vec<FixedXy> = outer_node_ids.iter().filter_map(|id| self.nodes.get(id).copied()).collect();
            if outer.len() < 3 {
                return None;
            }
            let inners: Vec<Vec<FixedXy>> = inner_node_ids
                .iter()
                .map(|ring| ring.iter().filter_map(|id| self.nodes.get(id).copied()).collect())
                .filter(|r: &Vec<FixedXy>| r.len() >= 3)
                .collect();
            Some(PendingFeature {
                tags: Vec::new(),
                geometry: FixedGeometry::Polygon(vec![crate::fixed::FixedPolygonRing { outer, inners }]),
            })
        }
    }

    /// Classifies anything tagged `highway=*` as layer `"roads"` at all
    /// zooms, and drops everything else — just enough rule to exercise the
    /// seam in tests.
    pub struct HighwayOnlyClassifier;

    impl FeatureClassifier for HighwayOnlyClassifier {
        fn classify(&self, pending: &PendingFeature) -> Option<ClassifiedFeature> {
            let highway = pending.tags.iter().find(|(k, _)| k == "highway")?;
            Some(ClassifiedFeature {
                layer: "roads".to_string(),
                min_zoom: 0,
                max_zoom: crate::config::MAX_ZOOM_SENTINEL,
                meta: vec![MetaPair::new("highway", &MetaValue::String(highway.1.clone()))],
                geometry: pending.geometry.clone(),
            })
        }
    }

    #[test]
    fn way_with_two_nodes_becomes_a_pending_line() {
        let mut feed = InMemorySourceFeed::new();
        feed.process_node(1, 0.0, 0.0);
        feed.process_node(2, 1.0, 1.0);
        let pending = feed.process_way(100, &[1, 2]).unwrap();
        assert!(matches!(pending.geometry, FixedGeometry::Polyline(_)));
    }

    #[test]
    fn way_with_missing_nodes_is_dropped() {
        let mut feed = InMemorySourceFeed::new();
        feed.process_node(1, 0.0, 0.0);
        assert!(feed.process_way(100, &[1]).is_none());
    }

    #[test]
    fn classifier_keeps_highway_drops_everything_else() {
        let pending = PendingFeature {
            tags: vec![("highway".to_string(), "primary".to_string())],
            geometry: FixedGeometry::Polyline(vec![vec![FixedXy::new(0, 0), FixedXy::new(1, 1)]]),
        };
        let classified = HighwayOnlyClassifier.classify(&pending).unwrap();
        assert_eq!(classified.layer, "roads");

        let other = PendingFeature {
            tags: vec![("natural".to_string(), "wood".to_string())],
            geometry: pending.geometry,
        };
        assert!(HighwayOnlyClassifier.classify(&other).is_none());
    }

    #[test]
    fn point_in_polygon_respects_holes() {
        let ops = FixedGeometryOps;
        let outer = vec![
            FixedXy::new(0, 0),
            FixedXy::new(10, 0),
            FixedXy::new(10, 10),
            FixedXy::new(0, 10),
            FixedXy::new(0, 0),
        ];
        let hole = vec![
            FixedXy::new(4, 4),
            FixedXy::new(6, 4),
            FixedXy::new(6, 6),
            FixedXy::new(4, 6),
            FixedXy::new(4, 4),
        ];
        let poly = crate::fixed::FixedPolygonRing { outer, inners: vec![hole] };
        assert!(ops.point_in_polygon(FixedXy::new(1, 1), &poly));
        assert!(!ops.point_in_polygon(FixedXy::new(5, 5), &poly));
        assert!(!ops.point_in_polygon(FixedXy::new(20, 20), &poly));
    }

    #[test]
    fn ring_orientation_sign_matches_winding() {
        let ops = FixedGeometryOps;
        let ccw = vec![FixedXy::new(0, 0), FixedXy::new(10, 0), FixedXy::new(10, 10), FixedXy::new(0, 10)];
        let cw: Vec<FixedXy> = ccw.iter().rev().copied().collect();
        assert!(ops.ring_orientation(&ccw) > 0);
        assert!(ops.ring_orientation(&cw) < 0);
    }
}
