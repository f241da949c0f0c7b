//! Fixed-coordinate model: 64-bit integer projected coordinates, bounding
//! boxes, and the tagged geometry variant.

mod algo;
pub mod codec;
mod geometry;

pub use algo::{area, bounding_box, clip, shift, simplify};
pub use geometry::{
    FixedBox, FixedCoord, FixedGeometry, FixedLine, FixedPoint, FixedPolygon, FixedPolygonRing,
    FixedPolyline, FixedRing, FixedXy,
};

use crate::config::FIXED_COORD_MAX;

/// Is `(x, y)` inside the valid fixed-coordinate range `[0, 2^(tile_size_bits
/// + reference_zoom))`?
pub fn in_valid_range(x: FixedCoord, y: FixedCoord) -> bool {
    (0..FIXED_COORD_MAX).contains(&x) && (0..FIXED_COORD_MAX).contains(&y)
}
