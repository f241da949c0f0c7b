//! Ingest cache: a fixed array of one bucket per index-zoom tile.
//! Inserting a feature serializes it once and appends the bytes to every
//! touched bucket; a global size threshold triggers a flush that
//! quick-packs and writes the smallest buckets first until enough space is
//! reclaimed.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::config::StoreConfig;
use crate::feature::{Feature, MetaEncoder};
use crate::featurepack;
use crate::fixed::{FixedBox, FixedXy};
use crate::packheap::PackHeap;
use crate::tiledb::TileDb;

pub type Tile = (u32, u32, u32);

struct Bucket {
    tile: Tile,
    fill_state: AtomicU64,
    size: AtomicUsize,
    mem: Mutex<Vec<Vec<u8>>>,
}

impl Bucket {
    fn new(tile: Tile) -> Self {
        Bucket {
            tile,
            fill_state: AtomicU64::new(0),
            size: AtomicUsize::new(0),
            mem: Mutex::new(Vec::new()),
        }
    }
}

/// One bucket per index-zoom tile (`2^(2*index_zoom)` of them), each
/// independently lockable so concurrent inserts touching different tiles
/// never contend. Serialization of flushed packs and commits to the
/// database are serialized through a single flush mutex.
pub struct IngestCache {
    buckets: Vec<Bucket>,
    side: u32,
    index_zoom: u32,
    global_size: AtomicUsize,
    flush_mutex: Mutex<()>,
    heap: Mutex<PackHeap>,
    config: StoreConfig,
}

impl IngestCache {
    pub fn new(config: StoreConfig, heap: PackHeap) -> Self {
        let side = 1u32 << config.index_zoom;
        let mut buckets = Vec::with_capacity((side as usize) * (side as usize));
        for y in 0..side {
            for x in 0..side {
                buckets.push(Bucket::new((x, y, config.index_zoom)));
            }
        }
        IngestCache {
            buckets,
            side,
            index_zoom: config.index_zoom,
            global_size: AtomicUsize::new(0),
            flush_mutex: Mutex::new(()),
            heap: Mutex::new(heap),
            config,
        }
    }

    fn bucket_index(&self, x: u32, y: u32) -> usize {
        y as usize * self.side as usize + x as usize
    }

    /// Index-zoom tiles whose draw bounds intersect `bbox`.
    fn touched_tiles(&self, bbox: &FixedBox) -> Vec<Tile> {
        let tile_span = crate::config::FIXED_COORD_MAX >> self.index_zoom;
        let clamp = |v: i64| -> u32 {
            v.max(0).min((self.side - 1) as i64) as u32
        };
        let x0 = clamp(bbox.min.x / tile_span);
        let x1 = clamp(bbox.max.x / tile_span);
        let y0 = clamp(bbox.min.y / tile_span);
        let y1 = clamp(bbox.max.y / tile_span);

        let mut out = Vec::new();
        for y in y0..=y1 {
            for x in x0..=x1 {
                out.push((x, y, self.index_zoom));
            }
        }
        out
    }

    /// Serializes `feature` once, appends it to every touched bucket, and
    /// triggers a flush when the global cache has grown past
    /// `config.ingest_flush_upper`.
    pub fn insert(&self, feature: &Feature, coder: Option<&dyn MetaEncoder>, db: &TileDb) -> anyhow::Result<()> {
        let bbox = feature
            .bounding_box()
            .unwrap_or_else(|| FixedBox::new(FixedXy::new(0, 0), FixedXy::new(0, 0)));
        let tiles = self.touched_tiles(&bbox);
        let bytes = feature.serialize(coder);

        for tile in tiles {
            let idx = self.bucket_index(tile.0, tile.1);
            let bucket = &self.buckets[idx];
            bucket.mem.lock().push(bytes.clone());
            bucket.size.fetch_add(bytes.len(), Ordering::Relaxed);
            self.global_size.fetch_add(bytes.len(), Ordering::Relaxed);
        }

        if self.global_size.load(Ordering::Relaxed) > self.config.ingest_flush_upper {
            self.flush(self.config.ingest_flush_upper, self.config.ingest_flush_lower, db)?;
        }
        Ok(())
    }

    /// Drains the smallest buckets first until the cache is at or below
    /// `threshold_lower`, committing one quick-pack per evicted bucket in a
    /// single write transaction. `threshold_upper == 0` forces a drain
    /// regardless of current size — used for the final flush before
    /// shutdown.
    ///
    /// Acquires the global flush mutex first (double-checked: most callers
    /// return immediately because another thread already flushed below the
    /// line).
    pub fn flush(&self, threshold_upper: usize, threshold_lower: usize, db: &TileDb) -> anyhow::Result<()> {
        let _guard = self.flush_mutex.lock();
        if threshold_upper > 0 && self.global_size.load(Ordering::Relaxed) <= threshold_upper {
            return Ok(());
        }

        let mut candidates: Vec<usize> = (0..self.buckets.len())
            .filter(|&i| self.buckets[i].size.load(Ordering::Relaxed) > 0)
            .collect();
        candidates.sort_by_key(|&i| self.buckets[i].size.load(Ordering::Relaxed));

        let mut evicted: Vec<(usize, Vec<Vec<u8>>)> = Vec::new();
        for i in candidates {
            if self.global_size.load(Ordering::Relaxed) <= threshold_lower {
                break;
            }
            let bucket = &self.buckets[i];
            let taken = std::mem::take(&mut *bucket.mem.lock());
            if taken.is_empty() {
                continue;
            }
            let taken_size: usize = taken.iter().map(|b| b.len()).sum();
            bucket.size.fetch_sub(taken_size, Ordering::Relaxed);
            self.global_size.fetch_sub(taken_size, Ordering::Relaxed);
            evicted.push((i, taken));
        }

        if evicted.is_empty() {
            return Ok(());
        }

        let mut heap = self.heap.lock();
        let mut writes = Vec::with_capacity(evicted.len());
        for (i, blobs) in evicted {
            let bucket = &self.buckets[i];
            let pack_bytes = featurepack::quick_pack_bytes(&blobs);
            let record = heap.append(&pack_bytes)?;
            let n = bucket.fill_state.fetch_add(1, Ordering::SeqCst) as u32 + 1;
            writes.push((bucket.tile.0, bucket.tile.1, bucket.tile.2, n, vec![record]));
        }
        drop(heap);

        db.insert_feature_records_batch(&writes)
    }

    /// Forces a full drain. Callers must invoke this explicitly before the
    /// cache is dropped — there is no `Drop` impl here because a correct
    /// flush needs a live `&TileDb`.
    pub fn finish(&self, db: &TileDb) -> anyhow::Result<()> {
        self.flush(0, 0, db)
    }

    pub fn global_size(&self) -> usize {
        self.global_size.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_ZOOM_SENTINEL;
    use crate::fixed::FixedGeometry;
    use tempfile::tempdir;

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

    fn harness() -> (tempfile::TempDir, TileDb, IngestCache) {
        let dir = tempdir().unwrap();
        let db = TileDb::open(&dir.path().join("test.db")).unwrap();
        let heap = PackHeap::open(&dir.path().join("test.pack")).unwrap();
        let mut config = StoreConfig::default();
        config.index_zoom = 2; // shrink the bucket array so tests stay cheap
        let cache = IngestCache::new(config, heap);
        (dir, db, cache)
    }

    #[test]
    fn insert_then_forced_flush_writes_one_record_per_touched_bucket() {
        let (_dir, db, cache) = harness();
        let f = line_feature(1, 10, 10, 20, 20);
        cache.insert(&f, None, &db).unwrap();
        assert!(cache.global_size() > 0);

        cache.finish(&db).unwrap();
        assert_eq!(cache.global_size(), 0);

        let tile_span = crate::config::FIXED_COORD_MAX >> 2;
        let tx = (10 / tile_span) as u32;
        let ty = (10 / tile_span) as u32;
        let records = db.feature_records(tx, ty, 2).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn flush_below_threshold_is_a_no_op() {
        let (_dir, db, cache) = harness();
        let f = line_feature(1, 10, 10, 20, 20);
        cache.insert(&f, None, &db).unwrap();
        let before = cache.global_size();
        cache.flush(usize::MAX, 0, &db).unwrap();
        assert_eq!(cache.global_size(), before);
    }

    #[test]
    fn feature_spanning_two_buckets_is_recorded_in_both() {
        let (_dir, db, cache) = harness();
        let tile_span = crate::config::FIXED_COORD_MAX >> 2;
        let f = line_feature(1, tile_span - 5, 10, tile_span + 5, 10);
        cache.insert(&f, None, &db).unwrap();
        cache.finish(&db).unwrap();

        assert_eq!(db.feature_records(0, 0, 2).unwrap().len(), 1);
        assert_eq!(db.feature_records(1, 0, 2).unwrap().len(), 1);
    }
}
