//! Store trait definitions

use bagsim_util::DeviceCode;

use crate::{AuditEvent, Device, DeviceUpdate, NewDevice, StoreResult};

/// Device store consumed by the simulation engine and the HTTP layer.
///
/// Calls are blocking; async callers run them on the blocking pool.
pub trait DeviceStore: Send + Sync {
    // Devices

    /// List every known device, ordered by code
    fn list_devices(&self) -> StoreResult<Vec<Device>>;

    /// Fetch one device by code
    fn get_device(&self, code: &DeviceCode) -> StoreResult<Device>;

    /// Apply a partial update and return the updated record
    fn update_device(&self, code: &DeviceCode, update: &DeviceUpdate) -> StoreResult<Device>;

    /// Register a new, unclaimed, powered-off device
    fn register_device(&self, device: NewDevice) -> StoreResult<Device>;

    // Audit log

    /// Append an audit event
    fn append_audit(&self, event: AuditEvent) -> StoreResult<()>;

    /// Get recent audit events, newest first
    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>>;

    // Health

    /// Check if store is healthy
    fn is_healthy(&self) -> bool;
}
