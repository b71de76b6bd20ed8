//! Persistence layer for bagsimd
//!
//! Provides:
//! - Device records (claim state, power, battery, telemetry heartbeat)
//! - Optimistic concurrency on device updates via a revision counter
//! - Audit log (append-only)
//! - An instrumented store for tests

mod audit;
mod device;
mod mock;
mod sqlite;
mod traits;

pub use audit::*;
pub use device::*;
pub use mock::*;
pub use sqlite::*;
pub use traits::*;

use bagsim_util::{DeviceCode, SimError};
use thiserror::Error;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceCode),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<StoreError> for SimError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DeviceNotFound(code) => SimError::DeviceNotFound(code),
            StoreError::Conflict(msg) => SimError::Conflict(msg),
            other => SimError::StoreUnavailable(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
