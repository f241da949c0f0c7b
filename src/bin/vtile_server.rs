//! Tile server: `GET /{z}/{x}/{y}.mvt` renders (or fetches a precomputed)
//! tile and returns it gzip-compressed with CORS headers open to any
//! origin; unknown paths are 404. Routing follows the same
//! `rouille::Request`/`Response` shape a terrain-radar map server uses,
//! without that server's GPU rendering.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueHint};
use parking_lot::Mutex;
use rouille::{Request, Response};

use vtilestore::config::StoreConfig;
use vtilestore::layer::LayerNameTable;
use vtilestore::metadata_coder::SharedMetadataDecoder;
use vtilestore::packheap::PackHeap;
use vtilestore::render::{self, RenderOptions, Tile};
use vtilestore::tiledb::TileDb;

#[derive(Parser, Debug)]
#[command(name = "vtile-server", version, about, propagate_version = true)]
struct Cli {
    /// Increase output verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Tile-index database path (`.db`); the pack heap is a derived sibling.
    #[arg(long, value_hint = ValueHint::FilePath)]
    db_path: PathBuf,

    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Serve every tile through the pass-through path instead of
    /// aggregating lines/polygons (useful for debugging raw features).
    #[arg(long)]
    disable_aggregation: bool,
}

struct ServerState {
    db: TileDb,
    heap: Mutex<PackHeap>,
    layers: LayerNameTable,
    config: StoreConfig,
    decoder: SharedMetadataDecoder,
    options: RenderOptions,
}

/// Parses a request path of the form `/{z}/{x}/{y}.mvt` into a query tile.
fn parse_tile_path(path: &str) -> Option<Tile> {
    let rest = path.strip_prefix('/')?.strip_suffix(".mvt")?;
    let mut parts = rest.split('/');
    let z: u32 = parts.next()?.parse().ok()?;
    let x: u32 = parts.next()?.parse().ok()?;
    let y: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((x, y, z))
}

fn handle(state: &ServerState, request: &Request) -> Response {
    let Some(tile) = parse_tile_path(&request.url()) else {
        return Response::empty_404();
    };

    let heap = state.heap.lock();
    let result = render::render_tile(&state.db, &heap, &state.layers, &state.config, Some(&state.decoder), tile, state.options);
    drop(heap);

    match result {
        Ok(bytes) => Response::from_data("application/vnd.mapbox-vector-tile", bytes)
            .with_additional_header("Content-Encoding", "gzip")
            .with_additional_header("Access-Control-Allow-Origin", "*")
            .with_additional_header("Access-Control-Allow-Methods", "GET"),
        Err(e) => {
            eprintln!("[server] rendering {tile:?} failed: {e:#}");
            Response::text("internal error").with_status_code(500)
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let db = TileDb::open(&cli.db_path).with_context(|| format!("opening {}", cli.db_path.display()))?;
    let heap_path = cli.db_path.with_extension("pack");
    let heap = PackHeap::open(&heap_path).with_context(|| format!("opening {}", heap_path.display()))?;
    let layers = LayerNameTable::load(&db)?;
    let decoder = SharedMetadataDecoder::load(&db)?;
    let config = StoreConfig::default();
    let options = RenderOptions { aggregate: !cli.disable_aggregation };

    let state = ServerState { db, heap: Mutex::new(heap), layers, config, decoder, options };

    if cli.verbose > 0 {
        eprintln!("[server] listening on {}", cli.listen);
    }
    rouille::start_server(&cli.listen, move |request| handle(&state, request))
}
