//! Device records as persisted by the store

use bagsim_util::DeviceCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Highest battery percentage a device can report
pub const MAX_BATTERY_LEVEL: u8 = 100;

/// A bag device as known to the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub code: DeviceCode,

    /// Bound to an owner; only claimed devices are simulated
    pub is_claimed: bool,

    pub owner: Option<String>,

    /// Power state, `true` is on
    pub status: bool,

    /// Battery percentage, always within 0..=100
    pub battery_level: u8,

    /// Bumped by every successful update
    pub revision: u64,

    /// Last telemetry heartbeat written by the simulation
    pub last_seen: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    /// Apply an update in place, bumping the revision.
    ///
    /// Battery levels above 100 are clamped. Revision checks are the
    /// caller's business.
    pub fn apply(&mut self, update: &DeviceUpdate, now: DateTime<Utc>) {
        if let Some(claimed) = update.is_claimed {
            self.is_claimed = claimed;
        }
        if let Some(owner) = &update.owner {
            self.owner = owner.clone();
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(level) = update.battery_level {
            self.battery_level = level.min(MAX_BATTERY_LEVEL);
        }
        if let Some(seen) = update.last_seen {
            self.last_seen = Some(seen);
        }
        self.revision += 1;
        self.updated_at = now;
    }
}

/// Parameters for registering a new device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDevice {
    pub code: DeviceCode,

    #[serde(default = "full_battery")]
    pub battery_level: u8,
}

fn full_battery() -> u8 {
    MAX_BATTERY_LEVEL
}

impl NewDevice {
    pub fn new(code: impl Into<DeviceCode>) -> Self {
        Self {
            code: code.into(),
            battery_level: MAX_BATTERY_LEVEL,
        }
    }

    pub fn with_battery(mut self, level: u8) -> Self {
        self.battery_level = level;
        self
    }
}

/// Partial update of a device record.
///
/// Unset fields are left untouched. When `expected_revision` is set the
/// store rejects the update with a conflict if the record moved on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceUpdate {
    pub expected_revision: Option<u64>,
    pub is_claimed: Option<bool>,
    pub owner: Option<Option<String>>,
    pub status: Option<bool>,
    pub battery_level: Option<u8>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl DeviceUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_revision(mut self, revision: u64) -> Self {
        self.expected_revision = Some(revision);
        self
    }

    pub fn claim(mut self, owner: impl Into<String>) -> Self {
        self.is_claimed = Some(true);
        self.owner = Some(Some(owner.into()));
        self
    }

    pub fn unclaim(mut self) -> Self {
        self.is_claimed = Some(false);
        self.owner = Some(None);
        self
    }

    pub fn status(mut self, on: bool) -> Self {
        self.status = Some(on);
        self
    }

    pub fn battery_level(mut self, level: u8) -> Self {
        self.battery_level = Some(level);
        self
    }

    pub fn seen_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_seen = Some(at);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        let now = Utc::now();
        Device {
            code: DeviceCode::new("BAG-1"),
            is_claimed: false,
            owner: None,
            status: false,
            battery_level: 50,
            revision: 0,
            last_seen: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn apply_touches_only_set_fields() {
        let mut d = device();
        d.apply(&DeviceUpdate::new().status(true), Utc::now());

        assert!(d.status);
        assert!(!d.is_claimed);
        assert_eq!(d.battery_level, 50);
        assert_eq!(d.revision, 1);
    }

    #[test]
    fn apply_clamps_battery() {
        let mut d = device();
        d.apply(&DeviceUpdate::new().battery_level(250), Utc::now());
        assert_eq!(d.battery_level, MAX_BATTERY_LEVEL);
    }

    #[test]
    fn claim_and_unclaim_set_owner() {
        let mut d = device();
        d.apply(&DeviceUpdate::new().claim("alice"), Utc::now());
        assert!(d.is_claimed);
        assert_eq!(d.owner.as_deref(), Some("alice"));

        d.apply(&DeviceUpdate::new().unclaim(), Utc::now());
        assert!(!d.is_claimed);
        assert!(d.owner.is_none());
        assert_eq!(d.revision, 2);
    }

    #[test]
    fn new_device_defaults_to_full_battery() {
        let parsed: NewDevice = serde_json::from_str(r#"{"code":"BAG-3"}"#).unwrap();
        assert_eq!(parsed.battery_level, MAX_BATTERY_LEVEL);
    }
}
