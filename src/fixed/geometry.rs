use smallvec::SmallVec;

/// A projected coordinate component, at the fixed reference zoom.
pub type FixedCoord = i64;

/// A single fixed-point vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct FixedXy {
    pub x: FixedCoord,
    pub y: FixedCoord,
}

impl FixedXy {
    pub fn new(x: FixedCoord, y: FixedCoord) -> Self {
        FixedXy { x, y }
    }
}

/// Axis-aligned bounding box in fixed-point space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBox {
    pub min: FixedXy,
    pub max: FixedXy,
}

impl FixedBox {
    pub fn new(min: FixedXy, max: FixedXy) -> Self {
        FixedBox { min, max }
    }

    pub fn point(p: FixedXy) -> Self {
        FixedBox { min: p, max: p }
    }

    pub fn union(&self, other: &FixedBox) -> FixedBox {
        FixedBox {
            min: FixedXy::new(self.min.x.min(other.min.x), self.min.y.min(other.min.y)),
            max: FixedXy::new(self.max.x.max(other.max.x), self.max.y.max(other.max.y)),
        }
    }

    pub fn extend(&mut self, p: FixedXy) {
        self.min.x = self.min.x.min(p.x);
        self.min.y = self.min.y.min(p.y);
        self.max.x = self.max.x.max(p.x);
        self.max.y = self.max.y.max(p.y);
    }

    /// Whether `other` is disjoint from `self` (no overlap, touching included as overlap).
    pub fn disjoint(&self, other: &FixedBox) -> bool {
        self.max.x < other.min.x
            || self.min.x > other.max.x
            || self.max.y < other.min.y
            || self.min.y > other.max.y
    }

    /// Whether `self` is entirely contained within `other`.
    pub fn contained_in(&self, other: &FixedBox) -> bool {
        self.min.x >= other.min.x
            && self.min.y >= other.min.y
            && self.max.x <= other.max.x
            && self.max.y <= other.max.y
    }

    pub fn expand(&self, margin: FixedCoord) -> FixedBox {
        FixedBox {
            min: FixedXy::new(self.min.x - margin, self.min.y - margin),
            max: FixedXy::new(self.max.x + margin, self.max.y + margin),
        }
    }
}

/// A closed ring: outer rings wind one way, inner (hole) rings the other.
/// Rings are closed — the first point is repeated at the end.
pub type FixedRing = Vec<FixedXy>;

/// One polyline: a sequence of vertices, not closed.
pub type FixedLine = Vec<FixedXy>;

/// Multi-point geometry.
pub type FixedPoint = SmallVec<[FixedXy; 4]>;

/// Multi-polyline geometry.
pub type FixedPolyline = Vec<FixedLine>;

/// One polygon: an outer ring plus any number of inner (hole) rings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedPolygonRing {
    pub outer: FixedRing,
    pub inners: Vec<FixedRing>,
}

/// Multi-polygon geometry.
pub type FixedPolygon = Vec<FixedPolygonRing>;

/// Tagged geometry variant: `{null, multi_point, multi_polyline,
/// multi_polygon}`.
#[derive(Debug, Clone, PartialEq)]
pub enum FixedGeometry {
    Null,
    Point(FixedPoint),
    Polyline(FixedPolyline),
    Polygon(FixedPolygon),
}

impl FixedGeometry {
    pub fn is_null(&self) -> bool {
        matches!(self, FixedGeometry::Null)
    }
}
