use integer_encoding::VarInt;

use crate::fixed::FixedXy;

use super::NodeId;

const REINIT_DISTANCE: u64 = 1024;

/// Read-only view over a built coordinate index: a sorted `(id, offset)`
/// index array plus the span-compressed data stream.
pub struct CoordIndexReader {
    idx: Vec<(u64, u64)>,
    dat: Vec<u8>,
}

impl CoordIndexReader {
    pub(super) fn from_parts(idx: Vec<(u64, u64)>, dat: Vec<u8>) -> Self {
        CoordIndexReader { idx, dat }
    }

    pub fn open(idx_path: &std::path::Path, dat_path: &std::path::Path) -> anyhow::Result<Self> {
        let idx_bytes = std::fs::read(idx_path)
            .map_err(|e| anyhow::anyhow!("coord_index: read {}: {e}", idx_path.display()))?;
        if idx_bytes.len() % 16 != 0 {
            anyhow::bail!("coord_index: malformed index file {}", idx_path.display());
        }
        let idx = idx_bytes
            .chunks_exact(16)
            .map(|c| {
                let id = u64::from_le_bytes(c[0..8].try_into().unwrap());
                let off = u64::from_le_bytes(c[8..16].try_into().unwrap());
                (id, off)
            })
            .collect();
        let dat = std::fs::read(dat_path)
            .map_err(|e| anyhow::anyhow!("coord_index: read {}: {e}", dat_path.display()))?;
        Ok(CoordIndexReader { idx, dat })
    }

    fn find_anchor(&self, id: NodeId) -> Option<(u64, usize)> {
        if self.idx.is_empty() || id < self.idx[0].0 {
            return None;
        }
        let pos = self.idx.partition_point(|&(eid, _)| eid <= id);
        let (eid, off) = self.idx[pos - 1];
        Some((eid, off as usize))
    }

    /// Single-point lookup. `Ok(None)` means `id` was never pushed; `Err`
    /// only on a corrupt stream.
    pub fn get(&self, id: NodeId) -> anyhow::Result<Option<FixedXy>> {
        let Some((anchor_id, off)) = self.find_anchor(id) else {
            return Ok(None);
        };
        let mut w = Walker::at(&self.dat, off, anchor_id);
        loop {
            match w.next_point()? {
                None => return Ok(None),
                Some((pid, xy)) => {
                    if pid == id {
                        return Ok(Some(xy));
                    }
                    if pid > id {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Batched ordered lookup: `ids` must be sorted ascending. Reuses a
    /// single streaming cursor across queries, re-binary-searching only
    /// when the gap from the cursor's current id exceeds the re-init
    /// distance.
    pub fn get_batch(&self, ids: &[NodeId]) -> anyhow::Result<Vec<Option<FixedXy>>> {
        let mut results = Vec::with_capacity(ids.len());
        if self.idx.is_empty() {
            results.resize(ids.len(), None);
            return Ok(results);
        }

        let mut walker: Option<Walker> = None;
        let mut last: Option<(u64, Option<FixedXy>)> = None;

        for &id in ids {
            if let Some((last_id, last_val)) = last {
                if id == last_id {
                    results.push(last_val);
                    continue;
                }
            }

            let need_jump = match &walker {
                None => true,
                Some(w) => id < w.id || id - w.id > REINIT_DISTANCE,
            };
            if need_jump {
                walker = self
                    .find_anchor(id)
                    .map(|(anchor_id, off)| Walker::at(&self.dat, off, anchor_id));
            }

            let found = match walker.as_mut() {
                None => None,
                Some(w) => {
                    let mut found = None;
                    loop {
                        match w.next_point()? {
                            None => break,
                            Some((pid, xy)) => {
                                if pid == id {
                                    found = Some(xy);
                                    break;
                                }
                                if pid > id {
                                    break;
                                }
                            }
                        }
                    }
                    found
                }
            };
            last = Some((id, found));
            results.push(found);
        }
        Ok(results)
    }
}

/// Forward-only decoder positioned at a coord-span boundary, yielding every
/// present `(id, xy)` pair from that point on in increasing id order.
struct Walker<'a> {
    dat: &'a [u8],
    pos: usize,
    id: u64,
    span_remaining: u32,
    x_run: i64,
    y_run: i64,
}

impl<'a> Walker<'a> {
    fn at(dat: &'a [u8], pos: usize, start_id: u64) -> Self {
        Walker {
            dat,
            pos,
            id: start_id.wrapping_sub(1),
            span_remaining: 0,
            x_run: 0,
            y_run: 0,
        }
    }

    fn next_point(&mut self) -> anyhow::Result<Option<(u64, FixedXy)>> {
        loop {
            if self.span_remaining > 0 {
                let dx = read_zigzag(self.dat, &mut self.pos)?;
                let dy = read_zigzag(self.dat, &mut self.pos)?;
                self.x_run += dx;
                self.y_run += dy;
                self.id += 1;
                self.span_remaining -= 1;
                return Ok(Some((self.id, FixedXy::new(self.x_run, self.y_run))));
            }

            if self.pos >= self.dat.len() {
                return Ok(None);
            }
            let header = read_varint(self.dat, &mut self.pos)?;
            let span_size = header >> 1;
            if header & 1 == 1 {
                if span_size == 0 {
                    return Ok(None);
                }
                self.id += span_size;
                continue;
            }

            let x0 = read_fixed_u32(self.dat, &mut self.pos)?;
            let y0 = read_fixed_u32(self.dat, &mut self.pos)?;
            self.x_run = x0 as i64;
            self.y_run = y0 as i64;
            self.id += 1;
            self.span_remaining = span_size as u32;
            return Ok(Some((self.id, FixedXy::new(self.x_run, self.y_run))));
        }
    }
}

fn read_varint(data: &[u8], pos: &mut usize) -> anyhow::Result<u64> {
    let (v, n) = u64::decode_var(&data[*pos..])
        .ok_or_else(|| anyhow::anyhow!("coord_index: truncated varint (corrupt stream)"))?;
    *pos += n;
    Ok(v)
}

fn read_zigzag(data: &[u8], pos: &mut usize) -> anyhow::Result<i64> {
    let (v, n) = i64::decode_var(&data[*pos..])
        .ok_or_else(|| anyhow::anyhow!("coord_index: truncated varint (corrupt stream)"))?;
    *pos += n;
    Ok(v)
}

fn read_fixed_u32(data: &[u8], pos: &mut usize) -> anyhow::Result<u32> {
    let bytes: [u8; 4] = data
        .get(*pos..*pos + 4)
        .ok_or_else(|| anyhow::anyhow!("coord_index: truncated fixed coordinate (corrupt stream)"))?
        .try_into()
        .unwrap();
    *pos += 4;
    Ok(u32::from_le_bytes(bytes))
}
