//! SliceIO Common - Shared types and utilities
//!
//! This crate provides the error type, configuration structures and core
//! identifiers used by the broker, the datanode and the storage engine.

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    BrokerConfig, DatanodeConfig, HeartbeatConfig, StorageBackend, StorageConfig,
};
pub use error::{Error, Result};
pub use types::*;
