//! Layer-name table: a process-wide, append-on-first-use mapping
//! `name -> index`. Index 0 is reserved for `coastline`. Persisted to the
//! `meta` table.
//!
//! Modeled as an explicit builder passed through ingest and finalized once
//! before repack, rather than a shared mutable singleton.

use std::collections::HashMap;

use integer_encoding::VarInt;
use parking_lot::Mutex;

use crate::tiledb::{TileDb, META_KEY_LAYER_NAMES};

pub const COASTLINE_LAYER_NAME: &str = "coastline";
pub const COASTLINE_LAYER_INDEX: u32 = 0;

struct Inner {
    names: Vec<String>,
    index: HashMap<String, u32>,
}

pub struct LayerNameTable {
    inner: Mutex<Inner>,
}

impl Default for LayerNameTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerNameTable {
    pub fn new() -> Self {
        let mut index = HashMap::new();
        index.insert(COASTLINE_LAYER_NAME.to_string(), COASTLINE_LAYER_INDEX);
        LayerNameTable {
            inner: Mutex::new(Inner {
                names: vec![COASTLINE_LAYER_NAME.to_string()],
                index,
            }),
        }
    }

    /// `get_or_create_index` under a mutex during ingest; read-only during
    /// render.
    pub fn get_or_create_index(&self, name: &str) -> u32 {
        let mut inner = self.inner.lock();
        if let Some(&idx) = inner.index.get(name) {
            return idx;
        }
        let idx = inner.names.len() as u32;
        inner.names.push(name.to_string());
        inner.index.insert(name.to_string(), idx);
        idx
    }

    pub fn name(&self, index: u32) -> Option<String> {
        self.inner.lock().names.get(index as usize).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.lock().names.clone()
    }

    pub fn store(&self, db: &TileDb) -> anyhow::Result<()> {
        db.put_meta(META_KEY_LAYER_NAMES, &encode_names(&self.inner.lock().names))
    }

    pub fn load(db: &TileDb) -> anyhow::Result<LayerNameTable> {
        match db.get_meta(META_KEY_LAYER_NAMES)? {
            None => Ok(LayerNameTable::new()),
            Some(bytes) => {
                let names = decode_names(&bytes)?;
                let mut index = HashMap::with_capacity(names.len());
                for (i, n) in names.iter().enumerate() {
                    index.insert(n.clone(), i as u32);
                }
                Ok(LayerNameTable {
                    inner: Mutex::new(Inner { names, index }),
                })
            }
        }
    }
}

fn encode_names(names: &[String]) -> Vec<u8> {
    let mut buf = Vec::new();
    for n in names {
        let bytes = n.as_bytes();
        let mut tmp = [0u8; 10];
        let len_n = (bytes.len() as u64).encode_var(&mut tmp);
        buf.extend_from_slice(&tmp[..len_n]);
        buf.extend_from_slice(bytes);
    }
    buf
}

fn decode_names(data: &[u8]) -> anyhow::Result<Vec<String>> {
    let mut names = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let (len, n) = u64::decode_var(&data[pos..])
            .ok_or_else(|| anyhow::anyhow!("layer names: truncated length"))?;
        pos += n;
        let len = len as usize;
        let slice = data
            .get(pos..pos + len)
            .ok_or_else(|| anyhow::anyhow!("layer names: truncated name"))?;
        names.push(
            std::str::from_utf8(slice)
                .map_err(|e| anyhow::anyhow!("layer names: invalid utf8: {e}"))?
                .to_string(),
        );
        pos += len;
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn coastline_is_reserved_index_zero() {
        let t = LayerNameTable::new();
        assert_eq!(t.get_or_create_index(COASTLINE_LAYER_NAME), COASTLINE_LAYER_INDEX);
        assert_eq!(t.name(0).as_deref(), Some(COASTLINE_LAYER_NAME));
    }

    #[test]
    fn get_or_create_is_idempotent_and_append_only() {
        let t = LayerNameTable::new();
        let a = t.get_or_create_index("building");
        let b = t.get_or_create_index("road");
        let a2 = t.get_or_create_index("building");
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(t.names(), vec!["coastline", "building", "road"]);
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempdir().unwrap();
        let db = TileDb::open(&dir.path().join("test.db")).unwrap();
        let t = LayerNameTable::new();
        t.get_or_create_index("water");
        t.get_or_create_index("building");
        t.store(&db).unwrap();

        let reloaded = LayerNameTable::load(&db).unwrap();
        assert_eq!(reloaded.names(), t.names());
        assert_eq!(reloaded.get_or_create_index("water"), 1);
    }
}
