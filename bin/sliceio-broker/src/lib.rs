//! SliceIO Broker - request routing across a pool of storage workers
//!
//! Clients connect to the frontend, storage channels connect to the
//! backend. The broker keeps a heartbeat-driven registry of live workers
//! and hashes each request key onto one of them.

pub mod broker;
pub mod metrics;
pub mod registry;

// Re-exports
pub use broker::{Broker, ConnId};
pub use metrics::{BrokerMetrics, HttpState, router};
pub use registry::{WorkerEntry, WorkerRegistry, key_hash};
