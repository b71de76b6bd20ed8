//! Configuration validation

use crate::schema::{RawConfig, RawSeedDevice};
use crate::settings::{DEFAULT_DRAIN_MAX, DEFAULT_DRAIN_MIN};
use bagsim_util::DeviceCode;
use std::collections::HashSet;
use std::net::SocketAddr;
use thiserror::Error;

/// Validation error
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("Device '{code}': {message}")]
    DeviceError { code: String, message: String },

    #[error("Duplicate device code: {0}")]
    DuplicateDeviceCode(String),

    #[error("Invalid listen address '{0}'")]
    InvalidListenAddr(String),

    #[error("Drain range {min}..={max} is invalid (need 1 <= min <= max <= 100)")]
    InvalidDrainRange { min: u8, max: u8 },

    #[error("Simulation setting '{field}' must be greater than zero")]
    ZeroDuration { field: &'static str },
}

/// Validate a raw configuration, collecting every error
pub fn validate_config(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if let Some(addr) = &config.service.listen_addr
        && addr.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidListenAddr(addr.clone()));
    }

    let sim = &config.simulation;
    if sim.tick_interval_ms == Some(0) {
        errors.push(ValidationError::ZeroDuration {
            field: "tick_interval_ms",
        });
    }
    if sim.store_timeout_ms == Some(0) {
        errors.push(ValidationError::ZeroDuration {
            field: "store_timeout_ms",
        });
    }

    let min = sim.drain_min.unwrap_or(DEFAULT_DRAIN_MIN);
    let max = sim.drain_max.unwrap_or(DEFAULT_DRAIN_MAX);
    if min == 0 || min > max || max > 100 {
        errors.push(ValidationError::InvalidDrainRange { min, max });
    }

    let mut seen_codes = HashSet::new();
    for device in &config.devices {
        if !seen_codes.insert(&device.code) {
            errors.push(ValidationError::DuplicateDeviceCode(device.code.clone()));
        }
    }

    for device in &config.devices {
        errors.extend(validate_device(device));
    }

    errors
}

fn validate_device(device: &RawSeedDevice) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if !DeviceCode::new(device.code.as_str()).is_valid() {
        errors.push(ValidationError::DeviceError {
            code: device.code.clone(),
            message: "code must be 1-64 characters of [A-Za-z0-9_-]".into(),
        });
    }

    if let Some(level) = device.battery_level
        && level > 100
    {
        errors.push(ValidationError::DeviceError {
            code: device.code.clone(),
            message: format!("battery_level {level} exceeds 100"),
        });
    }

    if let Some(owner) = &device.owner
        && owner.trim().is_empty()
    {
        errors.push(ValidationError::DeviceError {
            code: device.code.clone(),
            message: "owner cannot be blank".into(),
        });
    }

    errors
}
