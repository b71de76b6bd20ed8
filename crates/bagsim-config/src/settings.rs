//! Validated settings structures

use crate::schema::{RawConfig, RawFirstTick, RawSeedDevice, RawServiceConfig, RawSimulationConfig};
use bagsim_util::{DeviceCode, data_dir_without_env};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_TICK_INTERVAL_MS: u64 = 5000;
pub const DEFAULT_DRAIN_MIN: u8 = 1;
pub const DEFAULT_DRAIN_MAX: u8 = 3;
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2000;

/// Validated settings ready for use by the daemon and the engine
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub service: ServiceConfig,
    pub simulation: SimulationConfig,
    pub devices: Vec<SeedDevice>,
}

impl Settings {
    /// Convert from raw config (after validation)
    pub fn from_raw(raw: RawConfig) -> Self {
        Self {
            service: ServiceConfig::from_raw(raw.service),
            simulation: SimulationConfig::from_raw(raw.simulation),
            devices: raw.devices.into_iter().map(SeedDevice::from_raw).collect(),
        }
    }
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub listen_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub admin_passkey: Option<String>,
}

impl ServiceConfig {
    fn from_raw(raw: RawServiceConfig) -> Self {
        let defaults = Self::default();
        Self {
            listen_addr: raw
                .listen_addr
                .and_then(|a| a.parse().ok())
                .unwrap_or(defaults.listen_addr),
            data_dir: raw.data_dir.unwrap_or(defaults.data_dir),
            admin_passkey: raw.admin_passkey.filter(|k| !k.is_empty()),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            data_dir: data_dir_without_env(),
            admin_passkey: None,
        }
    }
}

/// Inclusive range of battery percentage drained per tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainRange {
    pub min: u8,
    pub max: u8,
}

impl DrainRange {
    /// A range that always drains exactly `step`
    pub fn fixed(step: u8) -> Self {
        Self {
            min: step,
            max: step,
        }
    }
}

impl Default for DrainRange {
    fn default() -> Self {
        Self {
            min: DEFAULT_DRAIN_MIN,
            max: DEFAULT_DRAIN_MAX,
        }
    }
}

/// When a freshly started handle runs its first tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FirstTick {
    /// Tick as soon as the handle starts
    #[default]
    Immediate,
    /// Wait one full interval before the first tick
    AfterInterval,
}

impl From<RawFirstTick> for FirstTick {
    fn from(raw: RawFirstTick) -> Self {
        match raw {
            RawFirstTick::Immediate => FirstTick::Immediate,
            RawFirstTick::AfterInterval => FirstTick::AfterInterval,
        }
    }
}

/// Simulation engine configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulationConfig {
    pub tick_interval: Duration,
    pub drain: DrainRange,
    pub store_timeout: Duration,
    pub first_tick: FirstTick,
}

impl SimulationConfig {
    fn from_raw(raw: RawSimulationConfig) -> Self {
        Self {
            tick_interval: Duration::from_millis(
                raw.tick_interval_ms.unwrap_or(DEFAULT_TICK_INTERVAL_MS),
            ),
            drain: DrainRange {
                min: raw.drain_min.unwrap_or(DEFAULT_DRAIN_MIN),
                max: raw.drain_max.unwrap_or(DEFAULT_DRAIN_MAX),
            },
            store_timeout: Duration::from_millis(
                raw.store_timeout_ms.unwrap_or(DEFAULT_STORE_TIMEOUT_MS),
            ),
            first_tick: raw.first_tick.map(FirstTick::from).unwrap_or_default(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(DEFAULT_TICK_INTERVAL_MS),
            drain: DrainRange::default(),
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            first_tick: FirstTick::default(),
        }
    }
}

/// Device registered on boot when missing from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedDevice {
    pub code: DeviceCode,
    pub battery_level: u8,
    pub owner: Option<String>,
    pub status: bool,
}

impl SeedDevice {
    fn from_raw(raw: RawSeedDevice) -> Self {
        Self {
            code: DeviceCode::new(raw.code),
            battery_level: raw.battery_level.unwrap_or(100),
            owner: raw.owner,
            status: raw.status,
        }
    }
}
