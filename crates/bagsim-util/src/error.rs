//! Error types for bagsimd

use thiserror::Error;

use crate::DeviceCode;

/// Error type for simulation control operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceCode),

    #[error("Simulation already running for device {0}")]
    AlreadyRunning(DeviceCode),

    #[error("No simulation running for device {0}")]
    NotRunning(DeviceCode),

    #[error("Device store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Conflicting update: {0}")]
    Conflict(String),

    #[error("Device store call timed out after {0} ms")]
    Timeout(u64),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl SimError {
    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Transient errors are expected to clear up on their own; a tick
    /// hitting one simply tries again on the next interval.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_) | Self::Conflict(_) | Self::Timeout(_)
        )
    }
}

pub type SimResult<T> = std::result::Result<T, SimError>;
