//! Device-layer error types

use thiserror::Error;

/// Errors surfaced by [`DeviceApi`](super::DeviceApi) implementations.
#[derive(Error, Debug, Clone)]
pub enum DeviceError {
    #[error("heap creation failed: {0}")]
    HeapCreationFailed(String),
    #[error("resource creation failed: {0}")]
    ResourceCreationFailed(String),
    #[error("tile mapping failed: {0}")]
    TileMappingFailed(String),
    #[error("out of device memory: {0}")]
    OutOfMemory(String),
    #[error("map failed: {0}")]
    MapFailed(String),
    #[error("command list error: {0}")]
    CommandListError(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("device lost: {0}")]
    DeviceLost(String),
    #[error("internal lock poisoned - this indicates a bug: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for DeviceError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DeviceError::LockPoisoned(format!("Lock poisoned: {}", err))
    }
}

/// Device result type
pub type DeviceResult<T> = Result<T, DeviceError>;
