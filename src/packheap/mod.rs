//! Pack heap: an append-only byte file with per-record LZ4-frame
//! compression, defragmenting moves, and a trailing non-null sentinel that
//! detects a truncated reopen.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;

use lz4_flex::frame::{FrameDecoder, FrameEncoder};

/// A non-overlapping `(offset, size)` span into the pack heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PackRecord {
    pub offset: u64,
    pub size: u64,
}

impl PackRecord {
    pub fn new(offset: u64, size: u64) -> Self {
        PackRecord { offset, size }
    }

    pub fn end_offset(&self) -> u64 {
        self.offset + self.size
    }
}

/// Serializes a list of pack records to the fixed 16-byte-per-record
/// layout stored as the `features` table's value.
pub fn serialize_records(records: &[PackRecord]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(records.len() * 16);
    for r in records {
        buf.extend_from_slice(&r.offset.to_le_bytes());
        buf.extend_from_slice(&r.size.to_le_bytes());
    }
    buf
}

pub fn deserialize_records(data: &[u8]) -> anyhow::Result<Vec<PackRecord>> {
    if data.len() % 16 != 0 {
        anyhow::bail!("pack heap: record list has invalid length {}", data.len());
    }
    Ok(data
        .chunks_exact(16)
        .map(|c| {
            let offset = u64::from_le_bytes(c[0..8].try_into().unwrap());
            let size = u64::from_le_bytes(c[8..16].try_into().unwrap());
            PackRecord::new(offset, size)
        })
        .collect())
}

const SENTINEL_BYTE: u8 = b'a';

/// The single growable file into which every pack is concatenated at
/// arbitrary offsets. Exclusive writer during ingest and repack; read-only
/// and safely shared during render.
pub struct PackHeap {
    file: File,
    size: u64,
    closed: bool,
}

impl PackHeap {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("pack heap: open {}: {e}", path.display()))?;
        let size = file.metadata()?.len();
        Ok(PackHeap {
            file,
            size,
            closed: false,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Places `bytes` (compressed) at the current end of the heap.
    pub fn append(&mut self, bytes: &[u8]) -> anyhow::Result<PackRecord> {
        self.insert(self.size, bytes)
    }

    /// Writes `bytes` (compressed) at `offset`, growing the heap if needed.
    pub fn insert(&mut self, offset: u64, bytes: &[u8]) -> anyhow::Result<PackRecord> {
        let compressed = compress(bytes)?;
        let record = PackRecord::new(offset, compressed.len() as u64);
        self.ensure_size(record.end_offset())?;
        self.file
            .write_all_at(&compressed, record.offset)
            .map_err(|e| anyhow::anyhow!("pack heap: write at {offset}: {e}"))?;
        Ok(record)
    }

    /// Memmove-equivalent relocation of an already-compressed record;
    /// correct for overlapping ranges. Does not decompress or recompress.
    pub fn move_record(&mut self, target_offset: u64, from: PackRecord) -> anyhow::Result<PackRecord> {
        let mut buf = vec![0u8; from.size as usize];
        self.file
            .read_exact_at(&mut buf, from.offset)
            .map_err(|e| anyhow::anyhow!("pack heap: read record {from:?}: {e}"))?;
        let to = PackRecord::new(target_offset, from.size);
        self.ensure_size(to.end_offset())?;
        self.file
            .write_all_at(&buf, to.offset)
            .map_err(|e| anyhow::anyhow!("pack heap: write record {to:?}: {e}"))?;
        Ok(to)
    }

    /// Decompresses and returns a copy of `record`'s bytes.
    pub fn get(&self, record: PackRecord) -> anyhow::Result<Vec<u8>> {
        if record.end_offset() > self.size {
            anyhow::bail!(
                "pack heap: record {:?} outside heap (size={})",
                record,
                self.size
            );
        }
        let mut buf = vec![0u8; record.size as usize];
        self.file
            .read_exact_at(&mut buf, record.offset)
            .map_err(|e| anyhow::anyhow!("pack heap: read record {record:?}: {e}"))?;
        decompress(&buf)
    }

    /// Truncates or grows the heap. The caller guarantees truncation never
    /// destroys a live record.
    pub fn resize(&mut self, new_size: u64) -> anyhow::Result<()> {
        self.file.set_len(new_size)?;
        self.size = new_size;
        Ok(())
    }

    /// Ensures the trailing byte is never `\0` (the truncation detector on
    /// reopen). Called explicitly before drop; `Drop` performs the same
    /// check as a best-effort backstop.
    pub fn finalize(&mut self) -> anyhow::Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.size > 0 {
            let mut last = [0u8; 1];
            self.file.read_exact_at(&mut last, self.size - 1)?;
            if last[0] == 0 {
                self.file.write_all_at(&[SENTINEL_BYTE], self.size)?;
                self.size += 1;
            }
        }
        self.closed = true;
        Ok(())
    }

    fn ensure_size(&mut self, min_size: u64) -> anyhow::Result<()> {
        if min_size > self.size {
            self.file.set_len(min_size)?;
            self.size = min_size;
        }
        Ok(())
    }
}

impl Drop for PackHeap {
    fn drop(&mut self) {
        let _ = self.finalize();
    }
}

fn compress(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut encoder = FrameEncoder::new(Vec::new());
    encoder
        .write_all(data)
        .map_err(|e| anyhow::anyhow!("pack heap: lz4 compress: {e}"))?;
    encoder
        .finish()
        .map_err(|e| anyhow::anyhow!("pack heap: lz4 compress finish: {e}"))
}

fn decompress(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut decoder = FrameDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| anyhow::anyhow!("pack heap: lz4 decompress: {e}"))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_and_get_roundtrip() {
        let dir = tempdir().unwrap();
        let mut heap = PackHeap::open(&dir.path().join("test.pack")).unwrap();
        let r1 = heap.append(b"hello world").unwrap();
        let r2 = heap.append(b"second record, a bit longer").unwrap();
        assert_eq!(heap.get(r1).unwrap(), b"hello world");
        assert_eq!(heap.get(r2).unwrap(), b"second record, a bit longer");
    }

    #[test]
    fn move_record_relocates_bytes() {
        let dir = tempdir().unwrap();
        let mut heap = PackHeap::open(&dir.path().join("test.pack")).unwrap();
        let r1 = heap.append(b"payload").unwrap();
        heap.append(b"filler-filler-filler").unwrap();
        let moved = heap.move_record(1_000, r1).unwrap();
        assert_eq!(heap.get(moved).unwrap(), b"payload");
    }

    #[test]
    fn resize_truncates() {
        let dir = tempdir().unwrap();
        let mut heap = PackHeap::open(&dir.path().join("test.pack")).unwrap();
        heap.append(b"keep me").unwrap();
        let size_before = heap.size();
        heap.resize(size_before).unwrap();
        assert_eq!(heap.size(), size_before);
    }

    #[test]
    fn finalize_appends_sentinel_when_last_byte_is_null() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.pack");
        {
            let mut heap = PackHeap::open(&path).unwrap();
            heap.append(b"x").unwrap();
            let size = heap.size();
            heap.resize(size + 1).unwrap(); // appends a zero byte at the tail
            heap.finalize().unwrap();
        }
        let bytes = std::fs::read(&path).unwrap();
        assert_ne!(*bytes.last().unwrap(), 0);
    }

    #[test]
    fn record_list_roundtrip() {
        let records = vec![PackRecord::new(0, 10), PackRecord::new(10, 20)];
        let bytes = serialize_records(&records);
        assert_eq!(deserialize_records(&bytes).unwrap(), records);
    }
}
