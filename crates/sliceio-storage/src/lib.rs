//! SliceIO Storage Engine - per-bucket slice persistence
//!
//! This crate implements the storage side of a datanode bucket:
//! - A small key-value engine contract with pluggable backends
//!   (redb, append-only log file, in-memory, null)
//! - `SliceDb`: one engine instance holding slice payloads
//! - `BucketDb`: a metadata index plus an append-only sequence of
//!   `SliceDb`s, of which the newest is the active write target and
//!   older ones stay readable

pub mod bucketdb;
pub mod engine;
pub mod slicedb;

// Re-exports
pub use bucketdb::{BucketDb, BucketDbStats, METADATA_DBNAME};
pub use engine::{KvEngine, open_engine};
pub use slicedb::SliceDb;
