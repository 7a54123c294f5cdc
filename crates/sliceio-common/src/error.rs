//! Error types for SliceIO
//!
//! This module defines the common error types used throughout the system.

use thiserror::Error;

/// Common result type for SliceIO operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for SliceIO
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("slice database {0} is not open")]
    SliceDbNotOpen(u32),

    #[error("metadata database error: {0}")]
    Metadata(String),

    #[error("key-value engine error: {0}")]
    Engine(String),

    #[error("data corruption detected: {0}")]
    DataCorruption(String),

    #[error("storage error: {0}")]
    Storage(String),

    // Wire protocol errors
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    // Network errors
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a key-value engine error
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }

    /// Create a metadata database error
    pub fn metadata(msg: impl Into<String>) -> Self {
        Self::Metadata(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if the peer broke the framing contract
    #[must_use]
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::FrameTooLarge { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_protocol() {
        assert!(Error::protocol("short message").is_protocol());
        assert!(Error::FrameTooLarge { size: 10, max: 5 }.is_protocol());
        assert!(!Error::SliceDbNotOpen(3).is_protocol());
    }

    #[test]
    fn test_error_from_io() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert!(matches!(err, Error::DiskIo(_)));
        assert!(err.to_string().contains("boom"));
    }
}
