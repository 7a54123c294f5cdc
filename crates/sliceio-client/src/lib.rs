//! SliceIO Client - broker frontend access
//!
//! This crate provides an async client that sends PUT/GET/DEL requests to
//! the broker frontend and decodes the worker replies relayed back.

pub mod client;

// Re-exports
pub use client::{Client, DEFAULT_REQUEST_TIMEOUT, Reply};
