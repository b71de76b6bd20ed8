//! Raw configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    /// Global service settings
    #[serde(default)]
    pub service: RawServiceConfig,

    /// Simulation engine settings
    #[serde(default)]
    pub simulation: RawSimulationConfig,

    /// Devices registered on boot if the store does not know them yet
    #[serde(default)]
    pub devices: Vec<RawSeedDevice>,
}

/// Service-level settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawServiceConfig {
    /// HTTP listen address (default: 0.0.0.0:8080)
    pub listen_addr: Option<String>,

    /// Data directory for store
    pub data_dir: Option<PathBuf>,

    /// Passkey required on mutating HTTP routes
    pub admin_passkey: Option<String>,
}

/// Simulation engine settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawSimulationConfig {
    /// Tick cadence per device (default: 5000)
    pub tick_interval_ms: Option<u64>,

    /// Smallest battery drain per tick, in percent (default: 1)
    pub drain_min: Option<u8>,

    /// Largest battery drain per tick, in percent (default: 3)
    pub drain_max: Option<u8>,

    /// Bound on each device store round-trip (default: 2000)
    pub store_timeout_ms: Option<u64>,

    /// When a fresh handle runs its first tick
    pub first_tick: Option<RawFirstTick>,
}

/// First tick policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RawFirstTick {
    Immediate,
    AfterInterval,
}

/// Seed device definition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawSeedDevice {
    pub code: String,

    /// Initial battery level (default: 100)
    pub battery_level: Option<u8>,

    /// Claims the device for this owner when set
    pub owner: Option<String>,

    /// Initial power state
    #[serde(default)]
    pub status: bool,
}
