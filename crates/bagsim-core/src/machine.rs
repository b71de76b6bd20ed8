//! Per-device simulation state machine
//!
//! Pure logic: given the latest device snapshot and a drain step, compute
//! what the device looks like after one tick. Nothing here keeps state
//! between ticks, so a tick that failed to persist is simply recomputed
//! from the next read.

use bagsim_config::DrainRange;
use bagsim_store::{Device, DeviceStore, DeviceUpdate, StoreResult};
use bagsim_util::DeviceCode;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

use crate::WriteGate;

/// Simulated state of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SimState {
    /// Unclaimed, never changes
    Idle,
    /// Claimed and powered on, battery draining
    Running,
    /// Claimed and powered off, battery untouched
    Off,
    /// Battery at zero, power forced off
    Depleted,
}

impl SimState {
    /// Classify a device snapshot
    pub fn of(device: &Device) -> Self {
        if !device.is_claimed {
            SimState::Idle
        } else if device.battery_level == 0 {
            SimState::Depleted
        } else if device.status {
            SimState::Running
        } else {
            SimState::Off
        }
    }
}

/// Result of applying one tick to a device snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: SimState,
    pub to: SimState,
    pub status: bool,
    pub battery_level: u8,
}

impl Transition {
    /// Power or battery differs from the snapshot the transition started at
    pub fn changes(&self, device: &Device) -> bool {
        self.status != device.status || self.battery_level != device.battery_level
    }

    /// This tick is the one that drained the battery
    pub fn depleted_now(&self) -> bool {
        self.to == SimState::Depleted && self.from != SimState::Depleted
    }

    /// Update to persist for this tick, or `None` for idle devices.
    ///
    /// Claimed devices always get a telemetry heartbeat; the update is
    /// pinned to the snapshot's revision so an external change made since
    /// the read wins and the tick is recomputed next time.
    pub fn to_update(&self, device: &Device, now: DateTime<Utc>) -> Option<DeviceUpdate> {
        if self.from == SimState::Idle {
            return None;
        }

        let mut update = DeviceUpdate::new()
            .expect_revision(device.revision)
            .seen_at(now);
        if self.status != device.status {
            update = update.status(self.status);
        }
        if self.battery_level != device.battery_level {
            update = update.battery_level(self.battery_level);
        }
        Some(update)
    }
}

/// Compute the state of `device` after one tick draining `drain` percent
pub fn next_state(device: &Device, drain: u8) -> Transition {
    let from = SimState::of(device);
    let unchanged = Transition {
        from,
        to: from,
        status: device.status,
        battery_level: device.battery_level,
    };

    match from {
        SimState::Idle | SimState::Off => unchanged,
        SimState::Depleted => Transition {
            // Toggled back on with an empty battery: force it off again
            status: false,
            ..unchanged
        },
        SimState::Running => {
            let battery_level = device.battery_level.saturating_sub(drain);
            if battery_level == 0 {
                Transition {
                    from,
                    to: SimState::Depleted,
                    status: false,
                    battery_level,
                }
            } else {
                Transition {
                    from,
                    to: SimState::Running,
                    status: true,
                    battery_level,
                }
            }
        }
    }
}

/// Draw a drain step from the configured range
pub fn sample_drain(range: DrainRange, rng: &mut impl Rng) -> u8 {
    if range.min >= range.max {
        return range.min;
    }
    rng.gen_range(range.min..=range.max)
}

/// What one tick did to its device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Device is unclaimed; nothing was written
    Idle,
    /// Transition was computed and persisted
    Applied(Transition),
    /// Handle stopped between read and write; nothing was written
    Halted,
}

/// Run one full tick against the store: read, transition, write back.
///
/// Touches only the record of `code`. The write goes through `gate`, so a
/// tick whose handle was stopped mid-call leaves the record alone. A
/// write that lost a race with another writer fails with `Conflict`.
pub fn run_tick(
    store: &dyn DeviceStore,
    code: &DeviceCode,
    drain: u8,
    now: DateTime<Utc>,
    gate: &WriteGate,
) -> StoreResult<TickOutcome> {
    let device = store.get_device(code)?;
    let transition = next_state(&device, drain);

    let Some(update) = transition.to_update(&device, now) else {
        return Ok(TickOutcome::Idle);
    };
    match gate.pass(|| store.update_device(code, &update)) {
        Some(written) => {
            written?;
            Ok(TickOutcome::Applied(transition))
        }
        None => Ok(TickOutcome::Halted),
    }
}
