//! Error types for the acceleration-structure model.
//!
//! GPU kernels never report errors; everything here is raised on the host
//! while recording or submitting commands, before any dispatch runs.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for host-side operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Device address does not fall inside any live allocation
    #[error("Invalid device address: {0:#x}")]
    InvalidAddress(u64),

    /// Access range exceeds the allocation it starts in
    #[error("Device access out of bounds: {offset:#x}+{len} exceeds buffer of {size} bytes")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    /// Buffer is smaller than the computed layout requires
    #[error("Buffer too small: required {required} bytes, got {actual}")]
    BufferTooSmall { required: u64, actual: u64 },

    /// Device address space exhausted
    #[error("Out of device memory allocating {0} bytes")]
    OutOfDeviceMemory(u64),

    /// Geometry description cannot be expressed by the build
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Build request is inconsistent (mode, source, geometry counts)
    #[error("Invalid build request: {0}")]
    InvalidBuild(String),

    /// Serialized blob was produced by a different driver/cache
    #[error("Incompatible acceleration structure version")]
    IncompatibleVersion,

    /// No command is recorded with this pipeline / push-constant state
    #[error("Command buffer error: {0}")]
    CommandBuffer(String),

    /// Configuration file or override is malformed
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Configuration file does not exist
    #[error("Config file not found: {0}")]
    ConfigNotFound(PathBuf),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an "other" error from a string.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Create an invalid geometry error.
    pub fn geometry(msg: impl Into<String>) -> Self {
        Self::InvalidGeometry(msg.into())
    }

    /// Create an invalid build error.
    pub fn build(msg: impl Into<String>) -> Self {
        Self::InvalidBuild(msg.into())
    }
}

/// Result type alias for host-side operations.
pub type Result<T> = std::result::Result<T, Error>;
