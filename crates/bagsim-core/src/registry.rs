//! Registry of running simulation handles

use bagsim_util::{DeviceCode, SimError, SimResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::SimulationHandle;

/// Map of device code to its running handle.
///
/// Holds at most one handle per device. Mutations take the write lock;
/// `get` and `list_running` share the read lock. The lock is never held
/// across an await.
#[derive(Debug, Default)]
pub struct SimulationRegistry {
    handles: RwLock<BTreeMap<DeviceCode, Arc<SimulationHandle>>>,
}

impl SimulationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handle under its device code.
    ///
    /// Fails with `AlreadyRunning` if the device already has one; the
    /// registry is left unchanged in that case.
    pub fn register(&self, handle: Arc<SimulationHandle>) -> SimResult<()> {
        let mut handles = self.handles.write();
        let code = handle.code().clone();
        if handles.contains_key(&code) {
            return Err(SimError::AlreadyRunning(code));
        }
        debug!(device = %code, run_id = %handle.run_id(), "Handle registered");
        handles.insert(code, handle);
        Ok(())
    }

    /// Remove and return the handle for `code`, if any
    pub fn unregister(&self, code: &DeviceCode) -> Option<Arc<SimulationHandle>> {
        let removed = self.handles.write().remove(code);
        if removed.is_some() {
            debug!(device = %code, "Handle unregistered");
        }
        removed
    }

    pub fn get(&self, code: &DeviceCode) -> SimResult<Arc<SimulationHandle>> {
        self.handles
            .read()
            .get(code)
            .cloned()
            .ok_or_else(|| SimError::NotRunning(code.clone()))
    }

    pub fn contains(&self, code: &DeviceCode) -> bool {
        self.handles.read().contains_key(code)
    }

    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }

    /// Sorted snapshot of the registered device codes
    pub fn list_running(&self) -> Vec<DeviceCode> {
        self.handles.read().keys().cloned().collect()
    }

    /// Stop every registered handle and clear the registry.
    ///
    /// The map is drained under the write lock first, so a concurrent
    /// `unregister` either got its handle out before or finds nothing; each
    /// handle is stopped by exactly one caller. Returns the drained handles
    /// once all of them have halted.
    pub async fn stop_all(&self) -> Vec<Arc<SimulationHandle>> {
        let drained: Vec<_> = std::mem::take(&mut *self.handles.write())
            .into_values()
            .collect();

        if drained.is_empty() {
            return drained;
        }

        info!(count = drained.len(), "Stopping all simulations");

        let mut stops = JoinSet::new();
        for handle in &drained {
            let handle = handle.clone();
            stops.spawn(async move { handle.stop().await });
        }
        while let Some(result) = stops.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Stop task failed");
            }
        }

        drained
    }
}
