//! Import driver: batch-loads a coastline archive and a geographic
//! extract into a store, then repacks and precomputes tiles.
//!
//! Source-feed parsing (relation assembly, the embedded classification
//! language) is explicitly out of scope; this driver supplies the
//! production wiring for the [`vtilestore::external`] seam with a line of
//! JSON per OSM primitive, and a placeholder linear projection in place of
//! real geographic projection arithmetic (also out of scope).

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum, ValueHint};
use parking_lot::Mutex;
use serde::Deserialize;

use vtilestore::config::{self, StoreConfig};
use vtilestore::coord_index::{CoordIndexBuilder, CoordIndexReader, NodeId};
use vtilestore::external::{ClassifiedFeature, FeatureClassifier, PendingFeature, SourceFeed};
use vtilestore::feature::{Feature, MetaPair, MetaValue};
use vtilestore::fixed::{FixedGeometry, FixedPolygonRing, FixedXy};
use vtilestore::ingest::IngestCache;
use vtilestore::layer::{LayerNameTable, COASTLINE_LAYER_NAME};
use vtilestore::metadata_coder::{SharedMetadataBuilder, SharedMetadataCoder};
use vtilestore::packheap::PackHeap;
use vtilestore::render::{self, RenderOptions};
use vtilestore::repack;
use vtilestore::tiledb::{TileDb, META_KEY_MAX_PREPARED_ZOOM_LEVEL};

/// Highest zoom level precomputed and stored in the `tiles` table by the
/// `tiles` task, so `GET /{z}/{x}/{y}.mvt` below it never renders on demand.
const PRECOMPUTE_MAX_ZOOM: u32 = 8;

#[derive(Parser, Debug)]
#[command(name = "vtile-import", version, about, propagate_version = true)]
struct Cli {
    /// Increase output verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Tile-index database path (`.db`); the pack heap and coordinate index
    /// are derived sibling files.
    #[arg(long, value_hint = ValueHint::FilePath)]
    db_path: PathBuf,

    /// Geographic extract, one JSON record per line (see module docs).
    #[arg(long, value_hint = ValueHint::FilePath)]
    osm_path: Option<PathBuf>,

    /// Coastline archive, same line format, `area` records only.
    #[arg(long, value_hint = ValueHint::FilePath)]
    coastlines_path: Option<PathBuf>,

    /// Which stages to run, in the fixed order coastlines, features, tiles,
    /// stats (repeatable; defaults to `all`, which runs every stage).
    #[arg(long, value_enum, num_args = 1..)]
    tasks: Vec<Task>,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, ValueEnum)]
enum Task {
    All,
    Coastlines,
    Features,
    Stats,
    Tiles,
}

fn wants(tasks: &[Task], t: Task) -> bool {
    tasks.contains(&Task::All) || tasks.contains(&t)
}

/// One line of the JSON source-feed format this driver defines for the
/// external `SourceFeed` seam.
#[derive(Deserialize, Debug)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum SourceRecord {
    Node {
        id: u64,
        lon: f64,
        lat: f64,
    },
    Way {
        id: u64,
        nodes: Vec<u64>,
        #[serde(default)]
        tags: BTreeMap<String, String>,
    },
    Area {
        id: u64,
        outer: Vec<u64>,
        #[serde(default)]
        inners: Vec<Vec<u64>>,
        #[serde(default)]
        tags: BTreeMap<String, String>,
    },
}

/// Placeholder projection (real geographic projection arithmetic is out
/// of scope) — maps degrees linearly into the fixed-coordinate range
/// around [`config::FIXED_COORD_MAGIC_OFFSET`].
fn project(lon: f64, lat: f64) -> FixedXy {
    let scale = config::FIXED_COORD_MAX as f64 / 360.0;
    let x = (config::FIXED_COORD_MAGIC_OFFSET as f64 + lon * scale).round() as i64;
    let y = (config::FIXED_COORD_MAGIC_OFFSET as f64 + lat * scale).round() as i64;
    FixedXy::new(x.clamp(0, config::FIXED_COORD_MAX - 1), y.clamp(0, config::FIXED_COORD_MAX - 1))
}

/// Reads a source-feed file's `SourceRecord::Node` lines and builds a
/// coordinate index for it, independent of line order (the index builder
/// requires strictly increasing ids at build time; this sorts first).
fn build_coord_index(path: &Path, idx_path: &Path, dat_path: &Path) -> Result<CoordIndexReader> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut nodes: Vec<(NodeId, FixedXy)> = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let SourceRecord::Node { id, lon, lat } = serde_json::from_str(&line)? {
            nodes.push((id, project(lon, lat)));
        }
    }
    nodes.sort_by_key(|(id, _)| *id);
    nodes.dedup_by_key(|(id, _)| *id);

    let mut builder = CoordIndexBuilder::new();
    for (id, xy) in nodes {
        builder.push(id, xy)?;
    }
    let built = builder.finish();
    built.write(idx_path, dat_path)?;
    Ok(built.into_reader())
}

/// Resolves way/area node ids through the coordinate index, building
/// [`PendingFeature`]s the way a real [`SourceFeed`] implementation would.
struct JsonlFeed<'a> {
    coords: &'a CoordIndexReader,
}

impl<'a> JsonlFeed<'a> {
    fn resolve(&self, ids: &[NodeId]) -> Result<Vec<FixedXy>> {
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            if let Some(xy) = self.coords.get(id)? {
                out.push(xy);
            }
        }
        Ok(out)
    }
}

impl<'a> SourceFeed for JsonlFeed<'a> {
    fn process_node(&mut self, _id: u64, _lon: f64, _lat: f64) {
        // Nodes are already resolved through the coordinate index built in
        // the first pass; the second pass only needs ways and areas.
    }

    fn process_way(&mut self, _id: u64, node_ids: &[u64]) -> Option<PendingFeature> {
        let line = self.resolve(node_ids).ok()?;
        if line.len() < 2 {
            return None;
        }
        Some(PendingFeature { tags: Vec::new(), geometry: FixedGeometry::Polyline(vec![line]) })
    }

    fn process_area(&mut self, _id: u64, outer_node_ids: &[u64], inner_node_ids: &[Vec<u64>]) -> Option<PendingFeature> {
        let outer = self.resolve(outer_node_ids).ok()?;
        if outer.len() < 3 {
            return None;
        }
        let inners: Vec<Vec<FixedXy>> = inner_node_ids
            .iter()
            .filter_map(|ring| self.resolve(ring).ok())
            .filter(|r: &Vec<FixedXy>| r.len() >= 3)
            .collect();
        Some(PendingFeature {
            tags: Vec::new(),
            geometry: FixedGeometry::Polygon(vec![FixedPolygonRing { outer, inners }]),
        })
    }
}

/// Classifies every record it's given as the `coastline` layer (index 0),
/// ignoring tags — the coastline archive carries shoreline outlines only.
struct CoastlineClassifier;

impl FeatureClassifier for CoastlineClassifier {
    fn classify(&self, pending: &PendingFeature) -> Option<ClassifiedFeature> {
        if !matches!(pending.geometry, FixedGeometry::Polygon(_)) {
            return None;
        }
        Some(ClassifiedFeature {
            layer: COASTLINE_LAYER_NAME.to_string(),
            min_zoom: 0,
            max_zoom: config::MAX_ZOOM_SENTINEL,
            meta: Vec::new(),
            geometry: pending.geometry.clone(),
        })
    }
}

/// Classifies tagged features into a handful of common OSM layers. Stands
/// in for an embedded scripting language.
struct TaggedClassifier;

impl TaggedClassifier {
    const RULES: &'static [(&'static str, &'static str)] =
        &[("highway", "roads"), ("building", "buildings"), ("waterway", "waterways"), ("landuse", "landuse"), ("natural", "natural")];
}

impl FeatureClassifier for TaggedClassifier {
    fn classify(&self, pending: &PendingFeature) -> Option<ClassifiedFeature> {
        let layer = Self::RULES.iter().find_map(|(key, layer)| pending.tags.iter().any(|(k, _)| k == key).then_some(*layer))?;

        let meta: Vec<MetaPair> = pending
            .tags
            .iter()
            .map(|(k, v)| {
                let value = if k == "oneway" { MetaValue::Bool(v == "yes" || v == "true" || v == "1") } else { MetaValue::String(v.clone()) };
                MetaPair::new(k, &value)
            })
            .collect();

        Some(ClassifiedFeature { layer: layer.to_string(), min_zoom: 0, max_zoom: config::MAX_ZOOM_SENTINEL, meta, geometry: pending.geometry.clone() })
    }
}

/// Drives one source file end to end: build its coordinate index, read
/// ways/areas, classify, and insert into `cache`. Returns the number of
/// features ingested.
fn ingest_file(
    path: &Path,
    idx_path: &Path,
    dat_path: &Path,
    classifier: &dyn FeatureClassifier,
    cache: &IngestCache,
    db: &TileDb,
    layers: &LayerNameTable,
    meta_builder: &SharedMetadataBuilder,
    next_id: &AtomicU64,
    verbose: u8,
) -> Result<usize> {
    if verbose > 0 {
        eprintln!("[import] building coordinate index for {}", path.display());
    }
    let coords = build_coord_index(path, idx_path, dat_path)?;
    let mut feed = JsonlFeed { coords: &coords };

    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut count = 0usize;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: SourceRecord = serde_json::from_str(&line)?;
        let pending = match &record {
            SourceRecord::Node { .. } => continue,
            SourceRecord::Way { id, nodes, tags } => feed.process_way(*id, nodes).map(|mut p| {
                p.tags = tags.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                p
            }),
            SourceRecord::Area { id, outer, inners, tags } => feed.process_area(*id, outer, inners).map(|mut p| {
                p.tags = tags.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                p
            }),
        };
        let Some(pending) = pending else { continue };
        let Some(classified) = classifier.classify(&pending) else { continue };

        meta_builder.update(&classified.meta);
        let layer_idx = layers.get_or_create_index(&classified.layer);
        let id = next_id.fetch_add(1, Ordering::Relaxed);
        let feature = Feature::new(id, layer_idx, classified.min_zoom, classified.max_zoom, classified.meta, classified.geometry)?;
        cache.insert(&feature, None, db)?;
        count += 1;
    }
    Ok(count)
}

fn run_stats_task(db: &TileDb, heap_path: &Path, config: &StoreConfig) -> Result<()> {
    let layers = LayerNameTable::load(db)?;
    let heap = PackHeap::open(heap_path)?;
    let tiles = db.distinct_index_tiles(config.index_zoom)?;
    let mut record_count = 0usize;
    for &(x, y, z) in &tiles {
        record_count += db.feature_records(x, y, z)?.len();
    }

    println!("layers: {:?}", layers.names());
    println!("index-zoom tiles with data: {}", tiles.len());
    println!("total pack records: {record_count}");
    println!("heap size: {} bytes", heap.size());
    Ok(())
}

fn num_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

// Small helpers kept local rather than threaded through every call site.
fn heap_path_for(db_path: &Path) -> PathBuf {
    db_path.with_extension("pack")
}

fn main() -> Result<()> {
    let mut cli = Cli::parse();
    if cli.tasks.is_empty() {
        cli.tasks.push(Task::All);
    }
    let config = StoreConfig::default();

    let db = TileDb::open(&cli.db_path)?;
    let heap_path = heap_path_for(&cli.db_path);
    let layers = LayerNameTable::load(&db)?;
    let meta_builder = SharedMetadataBuilder::new();
    let next_id = AtomicU64::new(1);

    if wants(&cli.tasks, Task::Coastlines) {
        let path = cli.coastlines_path.as_ref().context("--coastlines_path is required for the coastlines task")?;
        let heap = PackHeap::open(&heap_path)?;
        let cache = IngestCache::new(config.clone(), heap);
        let idx_path = cli.db_path.with_extension("coastlines.idx");
        let dat_path = cli.db_path.with_extension("coastlines.dat");
        let n = ingest_file(path, &idx_path, &dat_path, &CoastlineClassifier, &cache, &db, &layers, &meta_builder, &next_id, cli.verbose)?;
        cache.finish(&db)?;
        if cli.verbose > 0 {
            eprintln!("[import] ingested {n} coastline features");
        }
    }

    if wants(&cli.tasks, Task::Features) {
        let path = cli.osm_path.as_ref().context("--osm_path is required for the features task")?;
        let heap = PackHeap::open(&heap_path)?;
        let cache = IngestCache::new(config.clone(), heap);
        let idx_path = cli.db_path.with_extension("idx");
        let dat_path = cli.db_path.with_extension("dat");
        let n = ingest_file(path, &idx_path, &dat_path, &TaggedClassifier, &cache, &db, &layers, &meta_builder, &next_id, cli.verbose)?;
        cache.finish(&db)?;
        if cli.verbose > 0 {
            eprintln!("[import] ingested {n} tagged features");
        }
    }

    layers.store(&db)?;
    meta_builder.store(&db, config.shared_metadata_min_count)?;

    if wants(&cli.tasks, Task::Tiles) {
        run_tiles_task(&db, &heap_path, &config, cli.verbose)?;
    }

    if wants(&cli.tasks, Task::Stats) {
        run_stats_task(&db, &heap_path, &config)?;
    }

    db.flush()?;
    Ok(())
}

/// Repacks every populated index-zoom tile, then precomputes and stores
/// tiles down to [`PRECOMPUTE_MAX_ZOOM`].
fn run_tiles_task(db: &TileDb, heap_path: &Path, config: &StoreConfig, verbose: u8) -> Result<()> {
    let coder = SharedMetadataCoder::load(db)?;
    let decoder = vtilestore::metadata_coder::SharedMetadataDecoder::load(db)?;

    let tasks = repack::collect_tasks(db, db.distinct_index_tiles(config.index_zoom)?)?;
    if verbose > 0 {
        eprintln!("[import] repacking {} index-zoom tiles", tasks.len());
    }
    let heap = Mutex::new(PackHeap::open(heap_path)?);
    repack::repack_all(db, &heap, tasks, Some(&coder), Some(&decoder), config::MAX_ZOOM_LEVEL, config, num_workers())?;

    let layers = LayerNameTable::load(db)?;
    let heap = heap.into_inner();
    let options = RenderOptions::default();
    let mut precomputed = 0usize;
    for z in 0..=PRECOMPUTE_MAX_ZOOM.min(config.index_zoom) {
        let span = 1u32 << z;
        for y in 0..span {
            for x in 0..span {
                render::render_tile(db, &heap, &layers, config, Some(&decoder), (x, y, z), options)?;
                precomputed += 1;
            }
        }
    }
    db.put_meta(META_KEY_MAX_PREPARED_ZOOM_LEVEL, &PRECOMPUTE_MAX_ZOOM.to_le_bytes())?;
    if verbose > 0 {
        eprintln!("[import] precomputed {precomputed} tiles up to zoom {PRECOMPUTE_MAX_ZOOM}");
    }
    Ok(())
}
