//! Audit event types

use bagsim_util::{DeviceCode, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Types of audit events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEventType {
    /// Service started
    ServiceStarted,

    /// Service stopped after all simulations were halted
    ServiceStopped { simulations_stopped: usize },

    /// Simulation handle started for a device
    SimulationStarted { device: DeviceCode, run_id: RunId },

    /// Simulation handle stopped
    SimulationStopped {
        device: DeviceCode,
        run_id: RunId,
        ticks: u64,
    },

    /// Battery hit zero and power was forced off
    DeviceDepleted { device: DeviceCode },

    /// New device registered
    DeviceRegistered { device: DeviceCode },

    /// Device bound to an owner
    DeviceClaimed { device: DeviceCode, owner: String },

    /// Device released by its owner
    DeviceUnclaimed { device: DeviceCode },
}

/// Full audit event with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID
    pub id: i64,

    /// Event timestamp
    pub timestamp: DateTime<Utc>,

    /// Event type and details
    pub event: AuditEventType,
}

impl AuditEvent {
    pub fn new(event: AuditEventType) -> Self {
        Self {
            id: 0, // Will be set by store
            timestamp: Utc::now(),
            event,
        }
    }
}
