//! SliceIO Datanode - storage shards served over broker channels
//!
//! A datanode runs a fixed pool of buckets; each bucket owns one
//! `BucketDb` and a fixed pool of channels, every channel being an
//! independent connection to the broker backend.

pub mod actor;
pub mod bucket;
pub mod channel;
pub mod datanode;

// Re-exports
pub use actor::{Actor, ActorContext, ActorPool};
pub use bucket::{Bucket, BucketService};
pub use channel::Channel;
pub use datanode::Datanode;
