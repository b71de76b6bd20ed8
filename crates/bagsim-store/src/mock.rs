//! Instrumented store for unit/integration testing
//!
//! Wraps an in-memory [`SqliteStore`] and adds call counting, injected
//! outages and artificial latency.

use bagsim_util::DeviceCode;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::{
    AuditEvent, Device, DeviceStore, DeviceUpdate, NewDevice, SqliteStore, StoreError,
    StoreResult,
};

pub struct InstrumentedStore {
    inner: SqliteStore,
    reads: AtomicU64,
    updates: AtomicU64,

    /// Fail every device call with `StoreError::Unavailable`
    unavailable: AtomicBool,

    /// Sleep this long before every device call
    delay: Mutex<Option<Duration>>,

    /// Applied to the inner store right before the next `update_device`
    interleaved: Mutex<Option<(DeviceCode, DeviceUpdate)>>,
}

impl InstrumentedStore {
    pub fn new() -> Self {
        Self::wrap(SqliteStore::in_memory().expect("in-memory sqlite store"))
    }

    pub fn wrap(inner: SqliteStore) -> Self {
        Self {
            inner,
            reads: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
            delay: Mutex::new(None),
            interleaved: Mutex::new(None),
        }
    }

    /// Register a device and bring it to the given state in one go
    pub fn seed(&self, code: &str, claimed: bool, status: bool, battery: u8) -> Device {
        let code = DeviceCode::new(code);
        self.inner
            .register_device(NewDevice::new(code.clone()).with_battery(battery))
            .expect("seed device");

        let mut update = DeviceUpdate::new().status(status);
        if claimed {
            update = update.claim("seed-owner");
        }
        self.inner
            .update_device(&code, &update)
            .expect("seed device state")
    }

    /// Successful `get_device`/`list_devices` calls so far
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Successful `update_device` calls so far
    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Let another writer win the race against the next `update_device`.
    ///
    /// `update` is applied to `code` just before that call reaches the
    /// store, bumping the record's revision under the caller's feet.
    pub fn interleave_write(&self, code: &DeviceCode, update: DeviceUpdate) {
        *self.interleaved.lock().unwrap() = Some((code.clone(), update));
    }

    /// Direct access to the wrapped store, bypassing counters and faults
    pub fn inner(&self) -> &SqliteStore {
        &self.inner
    }

    fn before_call(&self) -> StoreResult<()> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected outage".into()));
        }
        Ok(())
    }
}

impl Default for InstrumentedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceStore for InstrumentedStore {
    fn list_devices(&self) -> StoreResult<Vec<Device>> {
        self.before_call()?;
        let devices = self.inner.list_devices()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(devices)
    }

    fn get_device(&self, code: &DeviceCode) -> StoreResult<Device> {
        self.before_call()?;
        let device = self.inner.get_device(code)?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(device)
    }

    fn update_device(&self, code: &DeviceCode, update: &DeviceUpdate) -> StoreResult<Device> {
        self.before_call()?;
        let interleaved = self.interleaved.lock().unwrap().take();
        if let Some((other, write)) = interleaved {
            self.inner.update_device(&other, &write)?;
        }
        let device = self.inner.update_device(code, update)?;
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(device)
    }

    fn register_device(&self, device: NewDevice) -> StoreResult<Device> {
        self.before_call()?;
        self.inner.register_device(device)
    }

    fn append_audit(&self, event: AuditEvent) -> StoreResult<()> {
        self.inner.append_audit(event)
    }

    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>> {
        self.inner.get_recent_audits(limit)
    }

    fn is_healthy(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst) && self.inner.is_healthy()
    }
}
