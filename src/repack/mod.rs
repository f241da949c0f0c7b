//! Repack pipeline: rewrites the per-tile multi-pack accumulations built
//! up during ingest into a single optimal pack per tile, reclaiming heap
//! space by defragmenting in the same pass.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam::channel::bounded;
use parking_lot::{Condvar, Mutex};

use crate::config::StoreConfig;
use crate::feature::{Feature, MetaDecoder, MetaEncoder};
use crate::featurepack;
use crate::packheap::{PackHeap, PackRecord};
use crate::tiledb::TileDb;

pub type Tile = (u32, u32, u32);

/// One index-zoom tile's current set of pack records, about to be
/// coalesced into a single optimal pack.
#[derive(Debug, Clone)]
pub struct TileRecordTask {
    pub tile: Tile,
    pub records: Vec<PackRecord>,
}

impl TileRecordTask {
    fn max_offset(&self) -> u64 {
        self.records.iter().map(|r| r.offset).max().unwrap_or(0)
    }

    fn byte_size(&self) -> u64 {
        self.records.iter().map(|r| r.size).sum()
    }
}

/// Gathers a [`TileRecordTask`] per tile directly from the tile-index
/// database (only tiles with at least one record are included).
pub fn collect_tasks(db: &TileDb, tiles: impl IntoIterator<Item = Tile>) -> anyhow::Result<Vec<TileRecordTask>> {
    let mut tasks = Vec::new();
    for (x, y, z) in tiles {
        let records = db.feature_records(x, y, z)?;
        if !records.is_empty() {
            tasks.push(TileRecordTask { tile: (x, y, z), records });
        }
    }
    Ok(tasks)
}

struct Defragmented {
    /// Each task's records at their new, tail-compacted positions.
    moved: Vec<(Tile, Vec<PackRecord>)>,
    /// Start of the now-compacted live region; everything below this is
    /// free for phase 2's writes.
    live_region_start: u64,
    /// How much of `[0, live_region_start)` phase 1 already consumed by
    /// shuttling blockers to the front.
    insert_offset: u64,
}

/// Phase 1: relocates every record so the heap's live footprint sits
/// compacted at the tail, freeing a contiguous run at the front for phase
/// 2's writes.
///
/// `q_frag` holds every record still sitting at its original offset, in
/// descending-offset order, so the next record due to move is always the
/// one currently nearest the tail — freeing the tail first creates room.
/// Moving the next record can uncover a different, not-yet-reached record
/// still occupying the target span (fragmentation means original offset
/// doesn't track cumulative compacted size) — that's the "blocker" case,
/// resolved by shuttling the blocker to the current front frontier before
/// the pending move proceeds. Each shuttle strictly shrinks `q_frag`, so
/// the pass always terminates.
fn defragment(heap: &mut PackHeap, tasks: &[TileRecordTask]) -> anyhow::Result<Defragmented> {
    let mut q_frag: VecDeque<(usize, PackRecord)> = tasks
        .iter()
        .enumerate()
        .flat_map(|(i, t)| t.records.iter().map(move |r| (i, *r)))
        .collect();
    {
        let slice = q_frag.make_contiguous();
        slice.sort_by_key(|(_, r)| std::cmp::Reverse(r.offset));
    }
    let mut moved: Vec<Vec<PackRecord>> = vec![Vec::new(); tasks.len()];
    let mut end_offset = heap.size();
    let mut insert_offset = 0u64;

    while let Some((task_idx, record)) = q_frag.pop_front() {
        anyhow::ensure!(
            insert_offset + record.size <= end_offset,
            "repack: defrag ran out of heap space"
        );
        let target = end_offset - record.size;

        // Evacuate anything still un-moved whose original span overlaps
        // the slot we're about to write into.
        while let Some(blocker_pos) = q_frag
            .iter()
            .position(|(_, r)| r.offset < target + record.size && r.offset + r.size > target)
        {
            let (b_task, b_record) = q_frag.remove(blocker_pos).unwrap();
            anyhow::ensure!(
                insert_offset + b_record.size <= end_offset,
                "repack: defrag insert_offset crossed the live region"
            );
            let new_record = heap.move_record(insert_offset, b_record)?;
            moved[b_task].push(new_record);
            insert_offset += b_record.size;
        }

        let new_record = heap.move_record(target, record)?;
        moved[task_idx].push(new_record);
        end_offset = target;
    }

    Ok(Defragmented {
        moved: tasks.iter().zip(moved).map(|(t, m)| (t.tile, m)).collect(),
        live_region_start: end_offset,
        insert_offset,
    })
}

struct WorkItem {
    tile: Tile,
    records: Vec<PackRecord>,
    bytes: u64,
}

struct RepackResult {
    tile: Tile,
    bytes: Vec<u8>,
}

/// Caps the total size of tasks in flight between the producer and the
/// worker pool; the producer blocks once the work queue reaches the
/// in-flight cap.
struct InFlightBudget {
    used: Mutex<u64>,
    cap: u64,
    room: Condvar,
}

impl InFlightBudget {
    fn new(cap: u64) -> Self {
        InFlightBudget {
            used: Mutex::new(0),
            cap,
            room: Condvar::new(),
        }
    }

    fn acquire(&self, bytes: u64) {
        let mut used = self.used.lock();
        while *used > 0 && *used + bytes > self.cap {
            self.room.wait(&mut used);
        }
        *used += bytes;
    }

    fn release(&self, bytes: u64) {
        let mut used = self.used.lock();
        *used = used.saturating_sub(bytes);
        self.room.notify_all();
    }
}

fn repack_one(
    heap: &Mutex<PackHeap>,
    tile: Tile,
    records: &[PackRecord],
    coder: Option<&(dyn MetaEncoder + Sync)>,
    decoder: Option<&(dyn MetaDecoder + Sync)>,
    max_zoom: u32,
) -> anyhow::Result<Vec<u8>> {
    let mut blobs: Vec<Vec<u8>> = Vec::new();
    for &record in records {
        let pack_bytes = heap.lock().get(record)?;
        let reader = featurepack::PackReader::open(&pack_bytes, tile)?;
        for blob in reader.full_scan()? {
            blobs.push(blob.to_vec());
        }
    }
    let features: Vec<Feature> = blobs
        .iter()
        .map(|b| Feature::deserialize(b, decoder))
        .collect::<anyhow::Result<_>>()?;
    featurepack::optimal_pack(tile, &features, coder, max_zoom)
}

/// Runs the full repack pipeline over `tasks`: defragment (step 1),
/// parallel rebuild with back-stash (steps 2-3), then a per-tile
/// database update (step 4).
pub fn repack_all(
    db: &TileDb,
    heap: &Mutex<PackHeap>,
    tasks: Vec<TileRecordTask>,
    coder: Option<&(dyn MetaEncoder + Sync)>,
    decoder: Option<&(dyn MetaDecoder + Sync)>,
    max_zoom: u32,
    config: &StoreConfig,
    worker_count: usize,
) -> anyhow::Result<()> {
    if tasks.is_empty() {
        return Ok(());
    }

    let defragged = {
        let mut h = heap.lock();
        defragment(&mut h, &tasks)?
    };
    let mut original: HashMap<Tile, Vec<PackRecord>> = defragged.moved.into_iter().collect();
    let live_region_start = defragged.live_region_start;
    let insert_offset = AtomicU64::new(defragged.insert_offset);

    let items: Vec<WorkItem> = tasks
        .iter()
        .map(|t| {
            let records = original.remove(&t.tile).unwrap_or_default();
            WorkItem {
                tile: t.tile,
                bytes: t.byte_size(),
                records,
            }
        })
        .collect();

    let budget_owned = InFlightBudget::new(config.repack_in_flight_cap as u64);
    let budget = &budget_owned;
    let back_stash: Mutex<Vec<(Tile, PackRecord)>> = Mutex::new(Vec::new());
    let committed: Mutex<Vec<(Tile, PackRecord)>> = Mutex::new(Vec::new());

    let (work_tx, work_rx) = bounded::<WorkItem>(0);
    let (result_tx, result_rx) = bounded::<RepackResult>(worker_count.max(1));

    thread::scope(|scope| -> anyhow::Result<()> {
        for _ in 0..worker_count.max(1) {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                for item in work_rx.iter() {
                    let outcome = repack_one(heap, item.tile, &item.records, coder, decoder, max_zoom);
                    budget.release(item.bytes);
                    match outcome {
                        Ok(bytes) => {
                            let _ = result_tx.send(RepackResult { tile: item.tile, bytes });
                        }
                        Err(e) => eprintln!("repack: worker failed on tile {:?}: {e}", item.tile),
                    }
                }
            });
        }
        drop(work_rx);
        drop(result_tx);

        let coordinator = scope.spawn(|| {
            for result in result_rx.iter() {
                let mut h = heap.lock();
                let io = insert_offset.load(Ordering::SeqCst);
                let free = live_region_start.saturating_sub(io);
                if free >= result.bytes.len() as u64 {
                    match h.insert(io, &result.bytes) {
                        Ok(record) => {
                            insert_offset.store(io + record.size, Ordering::SeqCst);
                            committed.lock().push((result.tile, record));
                        }
                        Err(e) => eprintln!("repack: coordinator insert failed for {:?}: {e}", result.tile),
                    }
                } else {
                    match h.append(&result.bytes) {
                        Ok(record) => back_stash.lock().push((result.tile, record)),
                        Err(e) => eprintln!("repack: coordinator back-stash append failed for {:?}: {e}", result.tile),
                    }
                }
            }
        });

        for item in items {
            budget.acquire(item.bytes);
            work_tx
                .send(item)
                .map_err(|_| anyhow::anyhow!("repack: worker pool closed before all tasks were sent"))?;
        }
        drop(work_tx);

        coordinator.join().map_err(|_| anyhow::anyhow!("repack: coordinator thread panicked"))?;
        Ok(())
    })?;

    // Back-stash flush: move every back-stashed record into the
    // reclaimed front region, then truncate the heap.
    {
        let mut h = heap.lock();
        let mut io = insert_offset.load(Ordering::SeqCst);
        for (tile, record) in back_stash.into_inner() {
            let moved = h.move_record(io, record)?;
            io += moved.size;
            committed.lock().push((tile, moved));
        }
        h.resize(io)?;
    }

    // Database update: one atomic replace per tile.
    for (tile, record) in committed.into_inner() {
        db.replace_tile_records(tile.0, tile.1, tile.2, &[record])?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_ZOOM_SENTINEL;
    use crate::fixed::{FixedGeometry, FixedXy};
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

    #[test]
    fn defragment_relocates_every_record_exactly_once() {
        let dir = tempdir().unwrap();
        let mut heap = PackHeap::open(&dir.path().join("test.pack")).unwrap();

        let r1 = heap.append(b"tile-a-first").unwrap();
        let r2 = heap.append(b"tile-b-first").unwrap();
        let r3 = heap.append(b"tile-a-second").unwrap();

        let tasks = vec![
            TileRecordTask {
                tile: (1, 1, 10),
                records: vec![r1, r3],
            },
            TileRecordTask {
                tile: (2, 2, 10),
                records: vec![r2],
            },
        ];

        let heap_size = heap.size();
        let result = defragment(&mut heap, &tasks).unwrap();
        let total_size: u64 = tasks.iter().flat_map(|t| &t.records).map(|r| r.size).sum();
        assert_eq!((heap_size - result.live_region_start) + result.insert_offset, total_size);

        let mut seen_offsets = std::collections::HashSet::new();
        for (_, records) in &result.moved {
            for r in records {
                assert!(seen_offsets.insert(r.offset), "overlapping relocation at {}", r.offset);
            }
        }
        assert_eq!(result.moved.iter().map(|(_, r)| r.len()).sum::<usize>(), 3);
    }

    #[test]
    fn repack_all_coalesces_tasks_into_single_optimal_pack_per_tile() {
        let dir = tempdir().unwrap();
        let db = TileDb::open(&dir.path().join("test.db")).unwrap();
        let heap = Mutex::new(PackHeap::open(&dir.path().join("test.pack")).unwrap());

        let tile = (5, 5, 10);
        let features = vec![line_feature(1, 100, 100, 200, 200), line_feature(2, 300, 300, 400, 400)];
        let bytes = featurepack::quick_pack(&features, None);
        {
            let mut h = heap.lock();
            let record = h.append(&bytes).unwrap();
            db.insert_feature_records(tile.0, tile.1, tile.2, 0, &[record]).unwrap();
        }

        let tasks = collect_tasks(&db, [tile]).unwrap();
        let config = StoreConfig::default();
        repack_all(&db, &heap, tasks, None, None, MAX_ZOOM_SENTINEL, &config, 2).unwrap();

        let records = db.feature_records(tile.0, tile.1, tile.2).unwrap();
        assert_eq!(records.len(), 1);

        let packed = heap.lock().get(records[0]).unwrap();
        let reader = featurepack::PackReader::open(&packed, tile).unwrap();
        assert_eq!(reader.feature_count(), 2);
    }
}
