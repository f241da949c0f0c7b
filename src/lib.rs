//! On-disk vector-tile store: batch-ingests projected geometry into a
//! tile-keyed feature pack heap, repacks it into a quad-tree indexed
//! form, and renders query tiles into gzip-compressed MVT messages.
//!
//! Module layout mirrors the pipeline stages a build runs through, in
//! order: [`fixed`] and [`feature`] are the shared data model,
//! [`external`] is the capability seam for OSM input and classification,
//! [`featurepack`] and [`packheap`] are the on-disk feature encoding,
//! [`quadtree`], [`coord_index`], and [`metadata_coder`] are the index
//! structures built during [`repack`], [`ingest`] is the batch-loading
//! front door, and [`render`] turns a built store back into tiles.

pub mod config;
pub mod coord_index;
pub mod external;
pub mod feature;
pub mod featurepack;
pub mod fixed;
pub mod ingest;
pub mod layer;
pub mod metadata_coder;
pub mod packheap;
pub mod quadtree;
pub mod render;
pub mod repack;
pub mod tiledb;

pub use config::StoreConfig;
pub use feature::{Feature, MetaDecoder, MetaEncoder, MetaPair, MetaValue};
pub use fixed::{FixedBox, FixedGeometry, FixedXy};
pub use layer::LayerNameTable;
pub use packheap::PackHeap;
pub use render::{render_tile, RenderOptions};
pub use tiledb::TileDb;
