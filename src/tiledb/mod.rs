//! Tile-index database: a small transactional key/value store with three
//! logical tables — `features`, `tiles`, `meta` — backed by an embedded
//! sled database. Key ordering is lexicographic over packed tile keys
//! (big-endian bytes preserve that).

pub mod key;

use std::path::Path;

use sled::Db;

use crate::packheap::{deserialize_records, serialize_records, PackRecord};

pub use key::{pack as pack_tile_key, unpack as unpack_tile_key};

pub const META_KEY_LAYER_NAMES: &str = "layer_names";
pub const META_KEY_FEATURE_META_CODING: &str = "feature_meta_coding";
pub const META_KEY_MAX_PREPARED_ZOOM_LEVEL: &str = "max_prepared_zoom_level";

/// Single writer, multiple concurrent readers; read/write transactions with
/// commit/abort. sled already guarantees this at the tree level, so this
/// wrapper only needs to name the three tables.
pub struct TileDb {
    db: Db,
    features: sled::Tree,
    tiles: sled::Tree,
    meta: sled::Tree,
}

impl TileDb {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let db = sled::open(path)
            .map_err(|e| anyhow::anyhow!("tiledb: open {}: {e}", path.display()))?;
        let features = db.open_tree("features")?;
        let tiles = db.open_tree("tiles")?;
        let meta = db.open_tree("meta")?;
        Ok(TileDb {
            db,
            features,
            tiles,
            meta,
        })
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// All pack records currently owned by `(x, y, z)`, across every `n`.
    pub fn feature_records(&self, x: u32, y: u32, z: u32) -> anyhow::Result<Vec<PackRecord>> {
        let (lo, hi) = key::tile_key_range(x, y, z)?;
        let mut out = Vec::new();
        for entry in self.features.range(lo.to_be_bytes()..=hi.to_be_bytes()) {
            let (_, v) = entry.map_err(|e| anyhow::anyhow!("tiledb: scan features: {e}"))?;
            out.extend(deserialize_records(&v)?);
        }
        Ok(out)
    }

    /// Writes one quick-pack's record list under `(x, y, z, n)`.
    /// Non-transactional single insert; callers needing multiple tiles
    /// written atomically should use [`TileDb::insert_feature_records_batch`].
    pub fn insert_feature_records(
        &self,
        x: u32,
        y: u32,
        z: u32,
        n: u32,
        records: &[PackRecord],
    ) -> anyhow::Result<()> {
        let key = key::pack(x, y, z, n)?;
        self.features
            .insert(key.to_be_bytes(), serialize_records(records))?;
        Ok(())
    }

    /// Atomically writes several `(x, y, z, n) -> records` entries in a
    /// single transaction.
    pub fn insert_feature_records_batch(
        &self,
        items: &[(u32, u32, u32, u32, Vec<PackRecord>)],
    ) -> anyhow::Result<()> {
        let encoded: Vec<(u64, Vec<u8>)> = items
            .iter()
            .map(|(x, y, z, n, records)| {
                key::pack(*x, *y, *z, *n).map(|k| (k, serialize_records(records)))
            })
            .collect::<anyhow::Result<_>>()?;

        self.features
            .transaction(
                move |tx| -> sled::transaction::ConflictableTransactionResult<(), ()> {
                    for (k, v) in &encoded {
                        tx.insert(&k.to_be_bytes(), v.clone())?;
                    }
                    Ok(())
                },
            )
            .map_err(|e| anyhow::anyhow!("tiledb: batch insert failed: {e:?}"))?;
        Ok(())
    }

    /// Atomically replaces every pack record owned by `(x, y, z)` with a
    /// single canonical `n = 0` entry.
    pub fn replace_tile_records(
        &self,
        x: u32,
        y: u32,
        z: u32,
        records: &[PackRecord],
    ) -> anyhow::Result<()> {
        let (lo, hi) = key::tile_key_range(x, y, z)?;
        let stale_keys: Vec<sled::IVec> = self
            .features
            .range(lo.to_be_bytes()..=hi.to_be_bytes())
            .keys()
            .collect::<Result<_, _>>()
            .map_err(|e| anyhow::anyhow!("tiledb: scan stale records: {e}"))?;
        let new_key = key::pack(x, y, z, 0)?.to_be_bytes();
        let new_val = serialize_records(records);

        self.features
            .transaction(
                move |tx| -> sled::transaction::ConflictableTransactionResult<(), ()> {
                    for k in &stale_keys {
                        tx.remove(k.as_ref())?;
                    }
                    tx.insert(new_key.as_ref(), new_val.clone())?;
                    Ok(())
                },
            )
            .map_err(|e| anyhow::anyhow!("tiledb: replace_tile_records failed: {e:?}"))?;
        Ok(())
    }

    /// Every distinct `(x, y, z)` tile in the `features` table with at least
    /// one record at zoom `z`, in key order. Used to discover a repack's
    /// candidate task list without a caller having to already know which
    /// tiles exist.
    pub fn distinct_index_tiles(&self, z: u32) -> anyhow::Result<Vec<(u32, u32, u32)>> {
        let lo = key::pack(0, 0, z, 0)?;
        let hi = key::pack(key::MAX_X, key::MAX_Y, z, key::MAX_N)?;

        let mut out = Vec::new();
        let mut last: Option<(u32, u32)> = None;
        for entry in self.features.range(lo.to_be_bytes()..=hi.to_be_bytes()) {
            let (k, _) = entry.map_err(|e| anyhow::anyhow!("tiledb: scan tiles at z={z}: {e}"))?;
            let key = u64::from_be_bytes(k.as_ref().try_into().map_err(|_| anyhow::anyhow!("tiledb: malformed key"))?);
            let (x, y, kz, _) = unpack(key);
            debug_assert_eq!(kz, z);
            if last != Some((x, y)) {
                out.push((x, y, z));
                last = Some((x, y));
            }
        }
        Ok(out)
    }

    pub fn get_tile(&self, x: u32, y: u32, z: u32) -> anyhow::Result<Option<Vec<u8>>> {
        let key = key::pack(x, y, z, 0)?;
        Ok(self.tiles.get(key.to_be_bytes())?.map(|v| v.to_vec()))
    }

    pub fn put_tile(&self, x: u32, y: u32, z: u32, bytes: &[u8]) -> anyhow::Result<()> {
        let key = key::pack(x, y, z, 0)?;
        self.tiles.insert(key.to_be_bytes(), bytes)?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.meta.get(key)?.map(|v| v.to_vec()))
    }

    pub fn put_meta(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        self.meta.insert(key, value)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn feature_records_roundtrip_across_n() {
        let dir = tempdir().unwrap();
        let db = TileDb::open(&dir.path().join("test.db")).unwrap();
        db.insert_feature_records(1, 2, 10, 0, &[PackRecord::new(0, 10)])
            .unwrap();
        db.insert_feature_records(1, 2, 10, 1, &[PackRecord::new(10, 20)])
            .unwrap();
        db.insert_feature_records(9, 9, 10, 0, &[PackRecord::new(999, 1)])
            .unwrap();

        let records = db.feature_records(1, 2, 10).unwrap();
        assert_eq!(records, vec![PackRecord::new(0, 10), PackRecord::new(10, 20)]);
    }

    #[test]
    fn replace_tile_records_clears_fragments() {
        let dir = tempdir().unwrap();
        let db = TileDb::open(&dir.path().join("test.db")).unwrap();
        db.insert_feature_records(4, 5, 6, 0, &[PackRecord::new(0, 5)])
            .unwrap();
        db.insert_feature_records(4, 5, 6, 1, &[PackRecord::new(5, 5)])
            .unwrap();
        db.replace_tile_records(4, 5, 6, &[PackRecord::new(100, 10)])
            .unwrap();
        assert_eq!(
            db.feature_records(4, 5, 6).unwrap(),
            vec![PackRecord::new(100, 10)]
        );
    }

    #[test]
    fn distinct_index_tiles_dedups_across_n_and_ignores_other_zooms() {
        let dir = tempdir().unwrap();
        let db = TileDb::open(&dir.path().join("test.db")).unwrap();
        db.insert_feature_records(1, 2, 10, 0, &[PackRecord::new(0, 5)]).unwrap();
        db.insert_feature_records(1, 2, 10, 1, &[PackRecord::new(5, 5)]).unwrap();
        db.insert_feature_records(3, 3, 10, 0, &[PackRecord::new(10, 5)]).unwrap();
        db.insert_feature_records(1, 2, 11, 0, &[PackRecord::new(15, 5)]).unwrap();

        let tiles = db.distinct_index_tiles(10).unwrap();
        assert_eq!(tiles, vec![(1, 2, 10), (3, 3, 10)]);
    }

    #[test]
    fn meta_and_tile_tables() {
        let dir = tempdir().unwrap();
        let db = TileDb::open(&dir.path().join("test.db")).unwrap();
        assert_eq!(db.get_meta(META_KEY_LAYER_NAMES).unwrap(), None);
        db.put_meta(META_KEY_LAYER_NAMES, b"coastline").unwrap();
        assert_eq!(
            db.get_meta(META_KEY_LAYER_NAMES).unwrap(),
            Some(b"coastline".to_vec())
        );

        assert_eq!(db.get_tile(1, 1, 5).unwrap(), None);
        db.put_tile(1, 1, 5, b"gzip-bytes").unwrap();
        assert_eq!(db.get_tile(1, 1, 5).unwrap(), Some(b"gzip-bytes".to_vec()));
    }
}
