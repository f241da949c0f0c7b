//! Tunable constants, kept out of algorithm code so tests can shrink them.

/// Reference zoom level fixed-point coordinates are projected at.
pub const REFERENCE_ZOOM: u32 = 20;

/// Zoom level at which the primary tile-key partition lives.
pub const INDEX_ZOOM: u32 = 10;

/// `max_zoom` sentinel meaning "no upper bound".
pub const MAX_ZOOM_SENTINEL: u32 = 0x7F;

/// Highest zoom level representable in a tile key's 5-bit `z` field.
pub const MAX_ZOOM_LEVEL: u32 = 31;

/// Side length, in fixed-point units, of one tile at its own zoom level.
pub const TILE_SIZE_BITS: u32 = 8;
pub const TILE_SIZE: i64 = 1 << TILE_SIZE_BITS;

/// Half the valid coordinate range; used as the delta-encoding origin.
pub const FIXED_COORD_MAX: i64 = 1i64 << (TILE_SIZE_BITS + REFERENCE_ZOOM);
pub const FIXED_COORD_MAGIC_OFFSET: i64 = FIXED_COORD_MAX / 2;

/// Overdraw margin (in fixed-point units at the tile's own zoom) added to tile
/// draw bounds before clipping, so edge-straddling geometry isn't cut bare.
pub const DEFAULT_OVERDRAW: i64 = 8;

/// Extent of the emitted vector-tile coordinate space (MVT convention).
pub const TILE_EXTENT: u32 = 4096;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub reference_zoom: u32,
    pub index_zoom: u32,
    pub overdraw: i64,
    pub tile_extent: u32,
    /// Ingest global cache size that triggers a flush (bytes).
    pub ingest_flush_upper: usize,
    /// Ingest global cache size a flush drains down to (bytes).
    pub ingest_flush_lower: usize,
    /// Shared metadata pair occurrence count required to survive finalize.
    pub shared_metadata_min_count: u64,
    /// Repack in-flight task byte budget before the producer blocks.
    pub repack_in_flight_cap: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            reference_zoom: REFERENCE_ZOOM,
            index_zoom: INDEX_ZOOM,
            overdraw: DEFAULT_OVERDRAW,
            tile_extent: TILE_EXTENT,
            ingest_flush_upper: 1024 * 1024 * 1024,
            ingest_flush_lower: 768 * 1024 * 1024,
            shared_metadata_min_count: 2,
            repack_in_flight_cap: 128 * 1024 * 1024,
        }
    }
}
