//! Fixed-geometry algorithms: bounding box, area, shift, clip, simplify.
//!
//! Clipping and simplification are treated as geometry-library primitives
//! rather than hand-rolled from scratch; this module is the seam where
//! they're invoked (polygon clipping rides on `geo`'s boolean-op
//! intersection, polyline clipping is a direct Liang-Barsky cut since
//! rect-vs-line isn't a boolean op, simplification rides on `geo`'s
//! Visvalingam-Whyatt implementation).

use geo::BooleanOps;
use geo::SimplifyVw;

use super::geometry::{
    FixedBox, FixedGeometry, FixedLine, FixedPoint, FixedPolygon, FixedPolygonRing, FixedRing,
    FixedXy,
};

// ---- bounding box ----------------------------------------------------------

pub fn bounding_box(geo: &FixedGeometry) -> Option<FixedBox> {
    match geo {
        FixedGeometry::Null => None,
        FixedGeometry::Point(pts) => {
            let mut it = pts.iter();
            let first = it.next()?;
            let mut b = FixedBox::point(*first);
            for p in it {
                b.extend(*p);
            }
            Some(b)
        }
        FixedGeometry::Polyline(lines) => {
            let mut b: Option<FixedBox> = None;
            for line in lines {
                for p in line {
                    b = Some(match b {
                        Some(mut acc) => {
                            acc.extend(*p);
                            acc
                        }
                        None => FixedBox::point(*p),
                    });
                }
            }
            b
        }
        FixedGeometry::Polygon(polys) => {
            let mut b: Option<FixedBox> = None;
            for poly in polys {
                for p in &poly.outer {
                    b = Some(match b {
                        Some(mut acc) => {
                            acc.extend(*p);
                            acc
                        }
                        None => FixedBox::point(*p),
                    });
                }
            }
            b
        }
    }
}

// ---- area -------------------------------------------------------------------

fn ring_area(ring: &[FixedXy]) -> i64 {
    if ring.len() < 3 {
        return 0;
    }
    let mut acc: i64 = 0;
    for w in ring.windows(2) {
        acc += w[0].x * w[1].y - w[1].x * w[0].y;
    }
    let n = ring.len();
    acc += ring[n - 1].x * ring[0].y - ring[0].x * ring[n - 1].y;
    acc.abs() / 2
}

pub fn area(geo: &FixedGeometry) -> i64 {
    match geo {
        FixedGeometry::Polygon(polys) => polys
            .iter()
            .map(|p| {
                let outer = ring_area(&p.outer);
                let holes: i64 = p.inners.iter().map(|r| ring_area(r)).sum();
                outer - holes
            })
            .sum(),
        _ => 0,
    }
}

// ---- shift ------------------------------------------------------------------

fn shift_xy(p: FixedXy, delta_z: u32) -> FixedXy {
    FixedXy::new(p.x >> delta_z, p.y >> delta_z)
}

/// Shift every coordinate from the reference zoom down to zoom `z`, dropping
/// rings/lines that degenerate (fewer than the minimum vertex count) as a
/// result of the shift.
pub fn shift(geo: FixedGeometry, reference_zoom: u32, z: u32) -> FixedGeometry {
    let delta_z = reference_zoom.saturating_sub(z);
    match geo {
        FixedGeometry::Null => FixedGeometry::Null,
        FixedGeometry::Point(pts) => {
            let shifted: FixedPoint = pts.into_iter().map(|p| shift_xy(p, delta_z)).collect();
            if shifted.is_empty() {
                FixedGeometry::Null
            } else {
                FixedGeometry::Point(shifted)
            }
        }
        FixedGeometry::Polyline(lines) => {
            let shifted: FixedPolyline = lines
                .into_iter()
                .map(|line| -> FixedLine { line.into_iter().map(|p| shift_xy(p, delta_z)).collect() })
                .filter(|line| line.len() >= 2)
                .collect();
            if shifted.is_empty() {
                FixedGeometry::Null
            } else {
                FixedGeometry::Polyline(shifted)
            }
        }
        FixedGeometry::Polygon(polys) => {
            let shifted: FixedPolygon = polys
                .into_iter()
                .map(|poly| {
                    let outer: FixedRing =
                        poly.outer.into_iter().map(|p| shift_xy(p, delta_z)).collect();
                    let inners: Vec<FixedRing> = poly
                        .inners
                        .into_iter()
                        .map(|r| -> FixedRing { r.into_iter().map(|p| shift_xy(p, delta_z)).collect() })
                        .filter(|r| r.len() >= 3)
                        .collect();
                    FixedPolygonRing { outer, inners }
                })
                .filter(|p| p.outer.len() >= 3)
                .collect();
            if shifted.is_empty() {
                FixedGeometry::Null
            } else {
                FixedGeometry::Polygon(shifted)
            }
        }
    }
}

// ---- clip ---------------------------------------------------------------

/// Liang-Barsky segment clip against an axis-aligned box, returning the
/// clipped sub-segment's parametric `[t0, t1]` if any part survives.
fn clip_segment_params(p0: FixedXy, p1: FixedXy, b: &FixedBox) -> Option<(f64, f64)> {
    let dx = (p1.x - p0.x) as f64;
    let dy = (p1.y - p0.y) as f64;
    let mut t0 = 0.0f64;
    let mut t1 = 1.0f64;
    let checks = [
        (-dx, (p0.x - b.min.x) as f64),
        (dx, (b.max.x - p0.x) as f64),
        (-dy, (p0.y - b.min.y) as f64),
        (dy, (b.max.y - p0.y) as f64),
    ];
    for (p, q) in checks {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
        } else {
            let r = q / p;
            if p < 0.0 {
                if r > t1 {
                    return None;
                }
                if r > t0 {
                    t0 = r;
                }
            } else {
                if r < t0 {
                    return None;
                }
                if r < t1 {
                    t1 = r;
                }
            }
        }
    }
    if t0 > t1 {
        None
    } else {
        Some((t0, t1))
    }
}

fn lerp(p0: FixedXy, p1: FixedXy, t: f64) -> FixedXy {
    FixedXy::new(
        p0.x + ((p1.x - p0.x) as f64 * t).round() as i64,
        p0.y + ((p1.y - p0.y) as f64 * t).round() as i64,
    )
}

/// Clip one polyline against `b`, producing zero or more sub-lines (a line
/// may be split into several pieces by a non-convex clip boundary — here the
/// boundary is a box, so at most the input segment count of pieces).
fn clip_line(line: &[FixedXy], b: &FixedBox) -> Vec<FixedLine> {
    let mut out: Vec<FixedLine> = Vec::new();
    let mut current: FixedLine = Vec::new();
    for w in line.windows(2) {
        match clip_segment_params(w[0], w[1], b) {
            Some((t0, t1)) => {
                let a = lerp(w[0], w[1], t0);
                let c = lerp(w[0], w[1], t1);
                if current.last() != Some(&a) {
                    if !current.is_empty() {
                        out.push(std::mem::take(&mut current));
                    }
                    current.push(a);
                }
                current.push(c);
            }
            None => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
        }
    }
    if current.len() >= 2 {
        out.push(current);
    }
    out
}

fn to_geo_polygon(p: &FixedPolygonRing) -> geo_types::Polygon<f64> {
    let outer = geo_types::LineString::from(
        p.outer.iter().map(|xy| (xy.x as f64, xy.y as f64)).collect::<Vec<_>>(),
    );
    let inners: Vec<geo_types::LineString<f64>> = p
        .inners
        .iter()
        .map(|r| geo_types::LineString::from(r.iter().map(|xy| (xy.x as f64, xy.y as f64)).collect::<Vec<_>>()))
        .collect();
    geo_types::Polygon::new(outer, inners)
}

fn from_geo_polygon(p: &geo_types::Polygon<f64>) -> Option<FixedPolygonRing> {
    let outer: FixedRing = p
        .exterior()
        .coords()
        .map(|c| FixedXy::new(c.x.round() as i64, c.y.round() as i64))
        .collect();
    if outer.len() < 3 {
        return None;
    }
    let inners: Vec<FixedRing> = p
        .interiors()
        .iter()
        .map(|r| r.coords().map(|c| FixedXy::new(c.x.round() as i64, c.y.round() as i64)).collect())
        .filter(|r: &FixedRing| r.len() >= 3)
        .collect();
    Some(FixedPolygonRing { outer, inners })
}

/// Clip geometry to `b` (a tile's overdrawn bounds). Returns `Null` if
/// nothing survives.
pub fn clip(geo: &FixedGeometry, b: &FixedBox) -> FixedGeometry {
    match geo {
        FixedGeometry::Null => FixedGeometry::Null,
        FixedGeometry::Point(pts) => {
            let kept: FixedPoint = pts
                .iter()
                .copied()
                .filter(|p| p.x >= b.min.x && p.x <= b.max.x && p.y >= b.min.y && p.y <= b.max.y)
                .collect();
            if kept.is_empty() {
                FixedGeometry::Null
            } else {
                FixedGeometry::Point(kept)
            }
        }
        FixedGeometry::Polyline(lines) => {
            let clipped: FixedPolyline = lines.iter().flat_map(|l| clip_line(l, b)).collect();
            if clipped.is_empty() {
                FixedGeometry::Null
            } else {
                FixedGeometry::Polyline(clipped)
            }
        }
        FixedGeometry::Polygon(polys) => {
            let rect = geo_types::Polygon::new(
                geo_types::LineString::from(vec![
                    (b.min.x as f64, b.min.y as f64),
                    (b.max.x as f64, b.min.y as f64),
                    (b.max.x as f64, b.max.y as f64),
                    (b.min.x as f64, b.max.y as f64),
                    (b.min.x as f64, b.min.y as f64),
                ]),
                vec![],
            );
            let mut clipped: FixedPolygon = Vec::new();
            for poly in polys {
                let gp = to_geo_polygon(poly);
                let mp = gp.intersection(&rect);
                for out_poly in mp.0 {
                    if let Some(fp) = from_geo_polygon(&out_poly) {
                        clipped.push(fp);
                    }
                }
            }
            if clipped.is_empty() {
                FixedGeometry::Null
            } else {
                FixedGeometry::Polygon(clipped)
            }
        }
    }
}

// ---- simplify -------------------------------------------------------------

/// Apply Visvalingam-Whyatt simplification with the given tolerance. Only
/// polylines are transformed; points and polygons pass through unchanged.
pub fn simplify(geo: FixedGeometry, tolerance: i64) -> FixedGeometry {
    match geo {
        FixedGeometry::Polyline(lines) => {
            let eps = tolerance as f64;
            let simplified: FixedPolyline = lines
                .into_iter()
                .map(|line| {
                    let ls = geo_types::LineString::from(
                        line.iter().map(|p| (p.x as f64, p.y as f64)).collect::<Vec<_>>(),
                    );
                    let simplified_ls = ls.simplify_vw(&eps);
                    simplified_ls
                        .coords()
                        .map(|c| FixedXy::new(c.x.round() as i64, c.y.round() as i64))
                        .collect::<FixedLine>()
                })
                .filter(|l| l.len() >= 2)
                .collect();
            if simplified.is_empty() {
                FixedGeometry::Null
            } else {
                FixedGeometry::Polyline(simplified)
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xy(x: i64, y: i64) -> FixedXy {
        FixedXy::new(x, y)
    }

    #[test]
    fn bounding_box_of_polyline() {
        let geo = FixedGeometry::Polyline(vec![vec![xy(1, 2), xy(5, -1), xy(3, 7)]]);
        let b = bounding_box(&geo).unwrap();
        assert_eq!(b.min, xy(1, -1));
        assert_eq!(b.max, xy(5, 7));
    }

    #[test]
    fn shift_drops_degenerate_lines() {
        let geo = FixedGeometry::Polyline(vec![vec![xy(0, 0), xy(1, 0)]]);
        // at delta_z >= 1 both points collapse to (0,0) -> degenerate -> dropped
        let shifted = shift(geo, 1, 0);
        assert!(shifted.is_null());
    }

    #[test]
    fn clip_line_fully_inside() {
        let b = FixedBox::new(xy(0, 0), xy(10, 10));
        let geo = FixedGeometry::Polyline(vec![vec![xy(1, 1), xy(5, 5)]]);
        let clipped = clip(&geo, &b);
        assert_eq!(clipped, geo);
    }

    #[test]
    fn clip_line_fully_outside() {
        let b = FixedBox::new(xy(0, 0), xy(10, 10));
        let geo = FixedGeometry::Polyline(vec![vec![xy(20, 20), xy(30, 30)]]);
        assert!(clip(&geo, &b).is_null());
    }

    #[test]
    fn clip_line_crossing_boundary() {
        let b = FixedBox::new(xy(0, 0), xy(10, 10));
        let geo = FixedGeometry::Polyline(vec![vec![xy(-5, 5), xy(15, 5)]]);
        let clipped = clip(&geo, &b);
        match clipped {
            FixedGeometry::Polyline(lines) => {
                assert_eq!(lines.len(), 1);
                assert_eq!(lines[0][0].x, 0);
                assert_eq!(lines[0].last().unwrap().x, 10);
            }
            _ => panic!("expected polyline"),
        }
    }

    #[test]
    fn area_of_square() {
        let poly = FixedPolygonRing {
            outer: vec![xy(0, 0), xy(0, 10), xy(10, 10), xy(10, 0), xy(0, 0)],
            inners: vec![],
        };
        let geo = FixedGeometry::Polygon(vec![poly]);
        assert_eq!(area(&geo), 100);
    }
}
