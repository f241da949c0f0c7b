use integer_encoding::VarInt;

use crate::fixed::FixedXy;

use super::NodeId;

/// One index entry is recorded roughly every this many coordinates.
const COORDS_PER_INDEX_STRIDE: u64 = 1024;

/// Builds the two on-disk artifacts of a coordinate index from a
/// monotonically increasing stream of `(id, xy)` pushes.
pub struct CoordIndexBuilder {
    idx: Vec<(u64, u64)>,
    dat: Vec<u8>,
    last_id: u64,
    span: Vec<FixedXy>,
    coords_written: u64,
}

impl Default for CoordIndexBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordIndexBuilder {
    pub fn new() -> Self {
        CoordIndexBuilder {
            idx: Vec::new(),
            dat: Vec::new(),
            last_id: 0,
            span: Vec::new(),
            coords_written: 0,
        }
    }

    /// Requires `id > last_id` and `(x, y)` representable as unsigned
    /// 32-bit fixed coordinates.
    pub fn push(&mut self, id: NodeId, xy: FixedXy) -> anyhow::Result<()> {
        if xy.x < 0 || xy.y < 0 || xy.x > u32::MAX as i64 || xy.y > u32::MAX as i64 {
            anyhow::bail!("coord_index: ({}, {}) not within u32 bounds", xy.x, xy.y);
        }
        if id <= self.last_id {
            anyhow::bail!("coord_index: ids not sorted (got {id} after {})", self.last_id);
        }

        if self.last_id + 1 != id && !self.span.is_empty() {
            self.push_coord_span();
            self.push_empty_span(id);
        }

        self.last_id = id;
        self.span.push(xy);

        if self.span.len() as u64 >= COORDS_PER_INDEX_STRIDE {
            self.push_coord_span();
        }
        Ok(())
    }

    /// Flushes the pending span and appends the zero-length empty span
    /// that marks end of stream.
    pub fn finish(mut self) -> BuiltCoordIndex {
        self.push_coord_span();
        self.push_empty_span(self.last_id + 1);
        BuiltCoordIndex {
            idx: self.idx,
            dat: self.dat,
        }
    }

    fn push_coord_span(&mut self) {
        if self.span.is_empty() {
            return;
        }
        if self.idx.is_empty() || self.coords_written > COORDS_PER_INDEX_STRIDE {
            let start_id = self.last_id - self.span.len() as u64 + 1;
            self.idx.push((start_id, self.dat.len() as u64));
            self.coords_written = 0;
        }

        let mut i = 0usize;
        while i < self.span.len() {
            let mut x_run = self.span[i].x;
            let mut y_run = self.span[i].y;
            let mut j = i + 1;
            while j < self.span.len() {
                let dx = self.span[j].x - x_run;
                let dy = self.span[j].y - y_run;
                if zigzag_varint_len(dx) + zigzag_varint_len(dy) > 2 * 4 + 1 {
                    break;
                }
                x_run = self.span[j].x;
                y_run = self.span[j].y;
                j += 1;
            }

            let span_len = j - i;
            write_varint(&mut self.dat, ((span_len as u64 - 1) << 1) | 0);
            write_fixed_u32(&mut self.dat, self.span[i].x as u32);
            write_fixed_u32(&mut self.dat, self.span[i].y as u32);

            let mut x_prev = self.span[i].x;
            let mut y_prev = self.span[i].y;
            for point in &self.span[i + 1..j] {
                write_zigzag(&mut self.dat, point.x - x_prev);
                write_zigzag(&mut self.dat, point.y - y_prev);
                x_prev = point.x;
                y_prev = point.y;
            }

            i = j;
        }

        self.coords_written += self.span.len() as u64;
        self.span.clear();
    }

    fn push_empty_span(&mut self, next_id: u64) {
        let gap = next_id - self.last_id - 1;
        write_varint(&mut self.dat, (gap << 1) | 1);
    }
}

/// The two in-memory artifacts produced by [`CoordIndexBuilder::finish`],
/// ready to be persisted or handed directly to a reader.
pub struct BuiltCoordIndex {
    pub(super) idx: Vec<(u64, u64)>,
    pub(super) dat: Vec<u8>,
}

impl BuiltCoordIndex {
    pub fn write(&self, idx_path: &std::path::Path, dat_path: &std::path::Path) -> anyhow::Result<()> {
        use std::io::Write;
        let mut idx_file = std::io::BufWriter::new(
            std::fs::File::create(idx_path)
                .map_err(|e| anyhow::anyhow!("coord_index: create {}: {e}", idx_path.display()))?,
        );
        for (id, off) in &self.idx {
            idx_file.write_all(&id.to_le_bytes())?;
            idx_file.write_all(&off.to_le_bytes())?;
        }
        idx_file.flush()?;
        std::fs::write(dat_path, &self.dat)
            .map_err(|e| anyhow::anyhow!("coord_index: write {}: {e}", dat_path.display()))?;
        Ok(())
    }

    pub fn into_reader(self) -> super::CoordIndexReader {
        super::CoordIndexReader::from_parts(self.idx, self.dat)
    }
}

fn zigzag_varint_len(v: i64) -> usize {
    let zz = ((v << 1) ^ (v >> 63)) as u64;
    let mut n = 1usize;
    let mut val = zz;
    while val >= 0x80 {
        val >>= 7;
        n += 1;
    }
    n
}

fn write_varint(buf: &mut Vec<u8>, v: u64) {
    let mut tmp = [0u8; 10];
    let n = v.encode_var(&mut tmp);
    buf.extend_from_slice(&tmp[..n]);
}

fn write_zigzag(buf: &mut Vec<u8>, v: i64) {
    let mut tmp = [0u8; 10];
    let n = v.encode_var(&mut tmp);
    buf.extend_from_slice(&tmp[..n]);
}

fn write_fixed_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}
