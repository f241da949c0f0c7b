//! Shared metadata coder: a global dictionary of frequent `(key, value)`
//! metadata pairs, built by counting occurrences during ingest and
//! keeping entries seen at least [`StoreConfig::shared_metadata_min_count`]
//! times.
//!
//! [`StoreConfig::shared_metadata_min_count`]: crate::config::StoreConfig::shared_metadata_min_count

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::queue::SegQueue;
use integer_encoding::VarInt;
use parking_lot::Mutex;

use crate::feature::{MetaDecoder, MetaEncoder, MetaPair};
use crate::tiledb::{TileDb, META_KEY_FEATURE_META_CODING};

const FLUSH_THRESHOLD: usize = 10_000_000;

/// Consumer-side accumulator: an owned, process-wide queue drained
/// periodically into a persistent counts map by a dedicated consolidation
/// step, rather than a hidden global.
pub struct SharedMetadataBuilder {
    queue: SegQueue<MetaPair>,
    pending: AtomicUsize,
    counts: Mutex<BTreeMap<MetaPair, u64>>,
}

impl Default for SharedMetadataBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedMetadataBuilder {
    pub fn new() -> Self {
        SharedMetadataBuilder {
            queue: SegQueue::new(),
            pending: AtomicUsize::new(0),
            counts: Mutex::new(BTreeMap::new()),
        }
    }

    /// Enqueues every metadata pair contributed by one feature during
    /// ingest, triggering a background-style flush once the pending count
    /// crosses the threshold.
    pub fn update(&self, pairs: &[MetaPair]) {
        for p in pairs {
            self.queue.push(p.clone());
        }
        self.pending.fetch_add(pairs.len(), Ordering::Relaxed);
        if self.should_flush() {
            self.flush(false);
        }
    }

    fn should_flush(&self) -> bool {
        self.pending.load(Ordering::Relaxed) > FLUSH_THRESHOLD
    }

    /// Drains the queue into the persistent counts map. Returns `false`
    /// when nothing was drained, unless `force`.
    pub fn flush(&self, force: bool) -> bool {
        if !self.should_flush() && !force {
            return false;
        }
        let mut counts = self.counts.lock();
        let mut drained = 0usize;
        while let Some(pair) = self.queue.pop() {
            *counts.entry(pair).or_insert(0) += 1;
            drained += 1;
        }
        self.pending.fetch_sub(drained, Ordering::Relaxed);
        drained > 0
    }

    /// Drains everything, drops pairs seen fewer than `min_count` times, and
    /// returns the dictionary sorted by descending count — the position
    /// in this list is the compressed id.
    pub fn finalize(&self, min_count: u64) -> Vec<MetaPair> {
        while self.flush(true) {}
        let counts = self.counts.lock();
        let mut entries: Vec<(MetaPair, u64)> = counts
            .iter()
            .filter(|&(_, &c)| c >= min_count)
            .map(|(p, c)| (p.clone(), *c))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries.into_iter().map(|(p, _)| p).collect()
    }

    pub fn store(&self, db: &TileDb, min_count: u64) -> anyhow::Result<Vec<MetaPair>> {
        let dict = self.finalize(min_count);
        db.put_meta(META_KEY_FEATURE_META_CODING, &encode_dict(&dict))?;
        Ok(dict)
    }
}

/// Read-only decoder: direct index into the persisted dictionary.
#[derive(Clone)]
pub struct SharedMetadataDecoder {
    dict: Vec<MetaPair>,
}

impl SharedMetadataDecoder {
    pub fn new(dict: Vec<MetaPair>) -> Self {
        SharedMetadataDecoder { dict }
    }

    pub fn load(db: &TileDb) -> anyhow::Result<Self> {
        let dict = match db.get_meta(META_KEY_FEATURE_META_CODING)? {
            None => Vec::new(),
            Some(bytes) => decode_dict(&bytes)?,
        };
        Ok(SharedMetadataDecoder { dict })
    }

    pub fn dict(&self) -> &[MetaPair] {
        &self.dict
    }
}

impl MetaDecoder for SharedMetadataDecoder {
    fn decode(&self, id: u64) -> anyhow::Result<MetaPair> {
        self.dict
            .get(id as usize)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("shared metadata: id {id} out of range"))
    }
}

/// Encoder over the same dictionary: a sorted-by-pair array so
/// `encode(pair) -> Option<id>` can binary search.
pub struct SharedMetadataCoder {
    decoder: SharedMetadataDecoder,
    sorted: Vec<(MetaPair, u64)>,
}

impl SharedMetadataCoder {
    pub fn new(dict: Vec<MetaPair>) -> Self {
        let mut sorted: Vec<(MetaPair, u64)> = dict
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, p)| (p, i as u64))
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        SharedMetadataCoder {
            decoder: SharedMetadataDecoder::new(dict),
            sorted,
        }
    }

    pub fn load(db: &TileDb) -> anyhow::Result<Self> {
        let decoder = SharedMetadataDecoder::load(db)?;
        Ok(Self::new(decoder.dict))
    }

    pub fn dict(&self) -> &[MetaPair] {
        self.decoder.dict()
    }
}

impl MetaEncoder for SharedMetadataCoder {
    fn encode(&self, pair: &MetaPair) -> Option<u64> {
        let pos = self.sorted.partition_point(|(p, _)| p < pair);
        self.sorted
            .get(pos)
            .filter(|(p, _)| p == pair)
            .map(|(_, id)| *id)
    }
}

impl MetaDecoder for SharedMetadataCoder {
    fn decode(&self, id: u64) -> anyhow::Result<MetaPair> {
        self.decoder.decode(id)
    }
}

fn write_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    let mut tmp = [0u8; 10];
    let n = (bytes.len() as u64).encode_var(&mut tmp);
    buf.extend_from_slice(&tmp[..n]);
    buf.extend_from_slice(bytes);
}

fn read_len_prefixed<'a>(data: &'a [u8], pos: &mut usize) -> anyhow::Result<&'a [u8]> {
    let (len, n) = u64::decode_var(&data[*pos..])
        .ok_or_else(|| anyhow::anyhow!("shared metadata: truncated length"))?;
    *pos += n;
    let len = len as usize;
    let slice = data
        .get(*pos..*pos + len)
        .ok_or_else(|| anyhow::anyhow!("shared metadata: truncated entry"))?;
    *pos += len;
    Ok(slice)
}

fn encode_dict(dict: &[MetaPair]) -> Vec<u8> {
    let mut buf = Vec::new();
    for p in dict {
        write_len_prefixed(&mut buf, p.key.as_bytes());
        write_len_prefixed(&mut buf, &p.value);
    }
    buf
}

fn decode_dict(data: &[u8]) -> anyhow::Result<Vec<MetaPair>> {
    let mut pos = 0;
    let mut out = Vec::new();
    while pos < data.len() {
        let key = std::str::from_utf8(read_len_prefixed(data, &mut pos)?)
            .map_err(|e| anyhow::anyhow!("shared metadata: invalid utf8 key: {e}"))?
            .to_string();
        let value = read_len_prefixed(data, &mut pos)?.to_vec();
        out.push(MetaPair { key, value });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::MetaValue;
    use tempfile::tempdir;

    fn pair(k: &str, v: &str) -> MetaPair {
        MetaPair::new(k, &MetaValue::String(v.to_string()))
    }

    #[test]
    fn drops_singletons_keeps_frequent() {
        let b = SharedMetadataBuilder::new();
        b.update(&[pair("highway", "primary"), pair("highway", "primary")]);
        b.update(&[pair("name", "only-once")]);
        let dict = b.finalize(2);
        assert!(dict.contains(&pair("highway", "primary")));
        assert!(!dict.contains(&pair("name", "only-once")));
    }

    #[test]
    fn sorted_by_descending_count() {
        let b = SharedMetadataBuilder::new();
        for _ in 0..5 {
            b.update(&[pair("a", "1")]);
        }
        for _ in 0..3 {
            b.update(&[pair("b", "2")]);
        }
        let dict = b.finalize(2);
        assert_eq!(dict, vec![pair("a", "1"), pair("b", "2")]);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let b = SharedMetadataBuilder::new();
        b.update(&[pair("a", "1"), pair("a", "1")]);
        b.update(&[pair("b", "2"), pair("b", "2")]);
        let dict = b.finalize(2);
        let coder = SharedMetadataCoder::new(dict.clone());
        for (i, p) in dict.iter().enumerate() {
            let id = coder.encode(p).unwrap();
            assert_eq!(coder.decode(id).unwrap(), *p);
            let _ = i;
        }
        assert_eq!(coder.encode(&pair("missing", "value")), None);
    }

    #[test]
    fn min_count_threshold_is_configurable() {
        let b = SharedMetadataBuilder::new();
        b.update(&[pair("a", "1")]);
        b.update(&[pair("b", "2"), pair("b", "2")]);
        assert_eq!(b.finalize(1), vec![pair("b", "2"), pair("a", "1")]);
    }

    #[test]
    fn store_and_load_from_db() {
        let dir = tempdir().unwrap();
        let db = TileDb::open(&dir.path().join("test.db")).unwrap();
        let b = SharedMetadataBuilder::new();
        b.update(&[pair("a", "1"), pair("a", "1")]);
        let dict = b.store(&db, 2).unwrap();

        let loaded = SharedMetadataDecoder::load(&db).unwrap();
        assert_eq!(loaded.dict(), dict.as_slice());
    }
}
