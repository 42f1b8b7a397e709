//! Unified error handling for DmlForge
//!
//! The allocators surface a single error type. Device-layer failures map
//! into it via `From`, so `?` works across the seam without callers seeing
//! backend-specific variants.

use thiserror::Error;

use crate::device::DeviceError;

/// Unified error type for DmlForge
#[derive(Debug, Error)]
pub enum DmlForgeError {
    /// Heap or resource creation refused by the device.
    #[error("out of device memory: {0}")]
    OutOfDeviceMemory(String),

    /// The allocation-id space wrapped. Not expected in practice.
    #[error("allocation IDs exhausted")]
    AllocationIdsExhausted,

    /// Caller-supplied argument violated the contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The device was removed or reset.
    #[error("device lost: {0}")]
    DeviceLost(String),

    /// Submission, mapping, or command-list execution failed.
    #[error("execution failure: {0}")]
    ExecutionFailure(String),

    #[error("internal lock poisoned - this indicates a bug: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for DmlForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DmlForgeError::LockPoisoned(format!("Lock poisoned: {}", err))
    }
}

impl From<DeviceError> for DmlForgeError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::OutOfMemory(msg)
            | DeviceError::HeapCreationFailed(msg)
            | DeviceError::ResourceCreationFailed(msg)
            | DeviceError::TileMappingFailed(msg) => DmlForgeError::OutOfDeviceMemory(msg),
            DeviceError::MapFailed(msg) | DeviceError::CommandListError(msg) => {
                DmlForgeError::ExecutionFailure(msg)
            }
            DeviceError::InvalidArgument(msg) => DmlForgeError::InvalidArgument(msg),
            DeviceError::DeviceLost(msg) => DmlForgeError::DeviceLost(msg),
            DeviceError::LockPoisoned(msg) => DmlForgeError::LockPoisoned(msg),
        }
    }
}

/// Crate-wide result type
pub type ForgeResult<T> = Result<T, DmlForgeError>;
