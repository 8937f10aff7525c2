//! On-disk snapshots of meshes and their data.

pub mod export;

pub use export::{write_snapshot, ExportContext};
