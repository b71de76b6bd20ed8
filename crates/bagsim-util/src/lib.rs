//! Shared utilities for bagsimd
//!
//! This crate provides:
//! - ID types (DeviceCode, RunId)
//! - Error types shared by the engine and its control surface
//! - Default paths for config and data directories

mod error;
mod ids;
mod paths;

pub use error::*;
pub use ids::*;
pub use paths::*;
