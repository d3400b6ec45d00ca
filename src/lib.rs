//! nestfs: mounts JSON-indexed media asset libraries as plain folders.
//!
//! A library bundle keeps its folder tree in `metadata.json`, a per-asset
//! change ledger in `mtime.json`, and each asset's metadata and binary
//! content under `images/<id>.info/`. nestfs exposes that as an ordinary
//! filesystem through three layers:
//! - `store`: the raw read/write surface over the bundle's files
//! - `index`: the in-memory snapshot plus throttled reconciliation with
//!   changes made by the owning application
//! - `fs`: the FUSE face translating kernel operations into index calls

pub mod error;
pub mod fs;
pub mod index;
pub mod inode;
pub mod model;
pub mod store;
pub mod thumb;

pub use error::{LibraryError, Result};
pub use fs::LibraryFs;
pub use index::{LibraryIndex, Node, Snapshot};
pub use model::{AssetRecord, FolderRecord, LibraryMeta};
pub use store::{now_ms, LibraryStore};
pub use thumb::Thumbnailer;
