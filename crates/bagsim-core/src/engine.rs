//! Simulation engine: boot recovery, control surface, shutdown

use bagsim_config::{SeedDevice, SimulationConfig};
use bagsim_store::{
    AuditEvent, AuditEventType, Device, DeviceStore, DeviceUpdate, NewDevice, StoreError,
    MAX_BATTERY_LEVEL,
};
use bagsim_util::{DeviceCode, RunId, SimError, SimResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::{SimulationHandle, SimulationRegistry, StoreClient};

/// Attempts at a claim write that lost a race with a tick
const CLAIM_RETRIES: u32 = 3;

/// Point-in-time view of the engine for health checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineHealth {
    pub active_simulations: usize,
    pub simulating_devices: Vec<DeviceCode>,
    pub store_healthy: bool,
    pub uptime_seconds: u64,
}

/// Owns the registry and creates one handle per simulated device.
///
/// Shared behind an `Arc` by the daemon and the HTTP layer.
pub struct SimulationEngine {
    client: StoreClient,
    config: SimulationConfig,
    registry: SimulationRegistry,
    /// Single-flight guards, one per device, outliving individual handles
    in_flight: Mutex<BTreeMap<DeviceCode, Arc<AsyncMutex<()>>>>,
    started_at: Instant,
}

/// What seeding did to one configured device
enum Seeded {
    Present,
    Registered,
    Repaired,
}

impl SimulationEngine {
    pub fn new(store: Arc<dyn DeviceStore>, config: SimulationConfig) -> Self {
        info!(
            tick_interval_ms = config.tick_interval.as_millis() as u64,
            drain_min = config.drain.min,
            drain_max = config.drain.max,
            "Simulation engine initialized"
        );

        Self {
            client: StoreClient::new(store, config.store_timeout),
            config,
            registry: SimulationRegistry::new(),
            in_flight: Mutex::new(BTreeMap::new()),
            started_at: Instant::now(),
        }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn registry(&self) -> &SimulationRegistry {
        &self.registry
    }

    // Control surface

    /// Start a simulation for every claimed device that has none yet.
    ///
    /// Returns how many were started. A device that fails to start is
    /// logged and skipped.
    pub async fn initialize_all_simulations(&self) -> SimResult<usize> {
        let devices = self.client.call(|s| s.list_devices()).await?;

        let mut started = 0;
        for device in devices.iter().filter(|d| d.is_claimed) {
            if self.registry.contains(&device.code) {
                continue;
            }
            match self.spawn_handle(device.code.clone()).await {
                Ok(_) => started += 1,
                Err(SimError::AlreadyRunning(_)) => {}
                Err(e) => warn!(device = %device.code, error = %e, "Failed to start simulation"),
            }
        }

        info!(
            devices = devices.len(),
            started,
            "Simulations initialized"
        );
        Ok(started)
    }

    /// Start simulating one device.
    ///
    /// Unclaimed devices may be started; their ticks write nothing until
    /// the device is claimed.
    pub async fn start_simulation(&self, code: &DeviceCode) -> SimResult<RunId> {
        let lookup = code.clone();
        self.client.call(move |s| s.get_device(&lookup)).await?;

        if self.registry.contains(code) {
            return Err(SimError::AlreadyRunning(code.clone()));
        }
        self.spawn_handle(code.clone()).await
    }

    /// Stop simulating one device and wait for its task to halt
    pub async fn stop_simulation(&self, code: &DeviceCode) -> SimResult<()> {
        let handle = self
            .registry
            .unregister(code)
            .ok_or_else(|| SimError::NotRunning(code.clone()))?;

        handle.stop().await;
        self.audit(AuditEventType::SimulationStopped {
            device: code.clone(),
            run_id: handle.run_id(),
            ticks: handle.ticks(),
        })
        .await;
        Ok(())
    }

    /// Stop every simulation. Returns how many were stopped.
    pub async fn stop_all_simulations(&self) -> usize {
        let stopped = self.registry.stop_all().await;
        for handle in &stopped {
            self.audit(AuditEventType::SimulationStopped {
                device: handle.code().clone(),
                run_id: handle.run_id(),
                ticks: handle.ticks(),
            })
            .await;
        }

        info!(count = stopped.len(), "All simulations stopped");
        stopped.len()
    }

    pub fn get_running_simulations(&self) -> Vec<DeviceCode> {
        self.registry.list_running()
    }

    pub async fn health(&self) -> EngineHealth {
        let store_healthy = self
            .client
            .call(|s| Ok(s.is_healthy()))
            .await
            .unwrap_or(false);
        let simulating_devices = self.registry.list_running();

        EngineHealth {
            active_simulations: simulating_devices.len(),
            simulating_devices,
            store_healthy,
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    // Devices

    pub async fn list_devices(&self) -> SimResult<Vec<Device>> {
        self.client.call(|s| s.list_devices()).await
    }

    pub async fn get_device(&self, code: &DeviceCode) -> SimResult<Device> {
        let code = code.clone();
        self.client.call(move |s| s.get_device(&code)).await
    }

    /// Register a new unclaimed, powered-off device
    pub async fn register_device(&self, device: NewDevice) -> SimResult<Device> {
        if !device.code.is_valid() {
            return Err(SimError::invalid(format!(
                "invalid device code '{}'",
                device.code
            )));
        }
        if device.battery_level > MAX_BATTERY_LEVEL {
            return Err(SimError::invalid(format!(
                "battery_level {} exceeds {MAX_BATTERY_LEVEL}",
                device.battery_level
            )));
        }

        let created = self.client.call(move |s| s.register_device(device)).await?;
        info!(device = %created.code, battery = created.battery_level, "Device registered");
        self.audit(AuditEventType::DeviceRegistered {
            device: created.code.clone(),
        })
        .await;
        Ok(created)
    }

    /// Bind a device to `owner` and start simulating it.
    ///
    /// Claiming a device already held by someone else is a conflict;
    /// re-claiming by the same owner is accepted.
    pub async fn claim_device(&self, code: &DeviceCode, owner: &str) -> SimResult<Device> {
        let owner = owner.trim();
        if owner.is_empty() {
            return Err(SimError::invalid("owner must not be empty"));
        }

        let claim_code = code.clone();
        let claim_owner = owner.to_string();
        let device = self
            .client
            .call(move |s| {
                let mut attempt = 0;
                loop {
                    let current = s.get_device(&claim_code)?;
                    if current.is_claimed
                        && let Some(held_by) = current.owner.as_deref()
                        && held_by != claim_owner
                    {
                        return Err(StoreError::Conflict(format!(
                            "device {claim_code} is already claimed by {held_by}"
                        )));
                    }

                    let update = DeviceUpdate::new()
                        .expect_revision(current.revision)
                        .claim(claim_owner.clone());
                    match s.update_device(&claim_code, &update) {
                        // A tick landed between read and write
                        Err(StoreError::Conflict(_)) if attempt < CLAIM_RETRIES => attempt += 1,
                        result => return result,
                    }
                }
            })
            .await?;

        info!(device = %code, owner, "Device claimed");
        self.audit(AuditEventType::DeviceClaimed {
            device: code.clone(),
            owner: owner.to_string(),
        })
        .await;

        match self.start_simulation(code).await {
            Ok(_) | Err(SimError::AlreadyRunning(_)) => Ok(device),
            Err(e) => Err(e),
        }
    }

    /// Release a device and stop its simulation
    pub async fn unclaim_device(&self, code: &DeviceCode) -> SimResult<Device> {
        let device = self.update(code, DeviceUpdate::new().unclaim()).await?;

        info!(device = %code, "Device unclaimed");
        self.audit(AuditEventType::DeviceUnclaimed {
            device: code.clone(),
        })
        .await;

        match self.stop_simulation(code).await {
            Ok(()) | Err(SimError::NotRunning(_)) => Ok(device),
            Err(e) => Err(e),
        }
    }

    /// Toggle a device's power from outside the simulation.
    ///
    /// Powering on a depleted device is accepted; the next tick turns it
    /// off again.
    pub async fn set_power(&self, code: &DeviceCode, on: bool) -> SimResult<Device> {
        let device = self.update(code, DeviceUpdate::new().status(on)).await?;
        info!(device = %code, on, "Device power set");
        Ok(device)
    }

    /// Register configured devices that the store does not know yet.
    ///
    /// A record still at revision 0 never got its seeded state (claim,
    /// power), for instance because the boot that registered it failed
    /// halfway; that state is applied again. Other existing records are
    /// left as they are. Returns how many devices were registered or
    /// repaired.
    pub async fn seed_devices(&self, seeds: &[SeedDevice]) -> SimResult<usize> {
        let mut changed = 0;
        for seed in seeds {
            let seed = seed.clone();
            let code = seed.code.clone();
            let seeded = self
                .client
                .call(move |s| {
                    let (revision, action) = match s.get_device(&seed.code) {
                        Ok(device) if device.revision == 0 => (0, Seeded::Repaired),
                        Ok(_) => return Ok(Seeded::Present),
                        Err(StoreError::DeviceNotFound(_)) => {
                            let device = s.register_device(
                                NewDevice::new(seed.code.clone())
                                    .with_battery(seed.battery_level),
                            )?;
                            (device.revision, Seeded::Registered)
                        }
                        Err(e) => return Err(e),
                    };

                    if seed.owner.is_none() && !seed.status {
                        return Ok(match action {
                            Seeded::Repaired => Seeded::Present,
                            other => other,
                        });
                    }
                    let mut update = DeviceUpdate::new()
                        .expect_revision(revision)
                        .status(seed.status);
                    if let Some(owner) = &seed.owner {
                        update = update.claim(owner.clone());
                    }
                    s.update_device(&seed.code, &update)?;
                    Ok(action)
                })
                .await?;

            match seeded {
                Seeded::Present => continue,
                Seeded::Registered => {
                    debug!(device = %code, "Seed device registered");
                    self.audit(AuditEventType::DeviceRegistered { device: code })
                        .await;
                }
                Seeded::Repaired => {
                    warn!(device = %code, "Seed device found without its seeded state, reapplied");
                }
            }
            changed += 1;
        }

        if changed > 0 {
            info!(changed, "Seed devices applied");
        }
        Ok(changed)
    }

    /// Append an audit record; failures are logged and swallowed
    pub async fn audit(&self, event: AuditEventType) {
        let result = self
            .client
            .call(move |s| s.append_audit(AuditEvent::new(event)))
            .await;
        if let Err(e) = result {
            warn!(error = %e, "Failed to write audit event");
        }
    }

    async fn update(&self, code: &DeviceCode, update: DeviceUpdate) -> SimResult<Device> {
        let code = code.clone();
        self.client
            .call(move |s| s.update_device(&code, &update))
            .await
    }

    async fn spawn_handle(&self, code: DeviceCode) -> SimResult<RunId> {
        let in_flight = self.in_flight.lock().entry(code.clone()).or_default().clone();
        let handle = Arc::new(
            SimulationHandle::new(code.clone(), self.config, self.client.clone())
                .sharing_in_flight(in_flight),
        );
        let run_id = handle.run_id();

        self.registry.register(handle.clone())?;
        handle.start();

        self.audit(AuditEventType::SimulationStarted {
            device: code,
            run_id,
        })
        .await;
        Ok(run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bagsim_config::{DrainRange, FirstTick};
    use bagsim_store::InstrumentedStore;
    use std::time::Duration;

    fn config(step: u8) -> SimulationConfig {
        SimulationConfig {
            tick_interval: Duration::from_millis(10),
            drain: DrainRange::fixed(step),
            store_timeout: Duration::from_millis(500),
            first_tick: FirstTick::Immediate,
        }
    }

    fn engine(store: &Arc<InstrumentedStore>, step: u8) -> SimulationEngine {
        SimulationEngine::new(store.clone(), config(step))
    }

    fn code(s: &str) -> DeviceCode {
        DeviceCode::new(s)
    }

    #[tokio::test]
    async fn test_boot_scenario() {
        let store = Arc::new(InstrumentedStore::new());
        store.seed("A", true, true, 10);
        let b = store.seed("B", false, false, 50);
        let engine = engine(&store, 3);

        assert_eq!(engine.initialize_all_simulations().await.unwrap(), 1);
        assert_eq!(engine.get_running_simulations(), vec![code("A")]);

        tokio::time::sleep(Duration::from_millis(120)).await;
        engine.stop_all_simulations().await;

        let a = store.inner().get_device(&code("A")).unwrap();
        assert_eq!(a.battery_level, 0);
        assert!(!a.status);

        let b_after = store.inner().get_device(&code("B")).unwrap();
        assert_eq!(b_after, b);
    }

    #[tokio::test]
    async fn test_initialize_twice_starts_nothing_new() {
        let store = Arc::new(InstrumentedStore::new());
        store.seed("A", true, false, 10);
        let engine = engine(&store, 1);

        assert_eq!(engine.initialize_all_simulations().await.unwrap(), 1);
        assert_eq!(engine.initialize_all_simulations().await.unwrap(), 0);
        assert_eq!(engine.registry().len(), 1);

        engine.stop_all_simulations().await;
    }

    #[tokio::test]
    async fn test_start_unknown_device() {
        let store = Arc::new(InstrumentedStore::new());
        let engine = engine(&store, 1);

        let err = engine.start_simulation(&code("Z")).await.unwrap_err();
        assert_eq!(err, SimError::DeviceNotFound(code("Z")));
        assert!(engine.get_running_simulations().is_empty());
    }

    #[tokio::test]
    async fn test_double_start_and_stop() {
        let store = Arc::new(InstrumentedStore::new());
        store.seed("A", true, false, 10);
        let engine = engine(&store, 1);

        engine.start_simulation(&code("A")).await.unwrap();
        let err = engine.start_simulation(&code("A")).await.unwrap_err();
        assert_eq!(err, SimError::AlreadyRunning(code("A")));

        engine.stop_simulation(&code("A")).await.unwrap();
        let err = engine.stop_simulation(&code("A")).await.unwrap_err();
        assert_eq!(err, SimError::NotRunning(code("A")));
    }

    #[tokio::test]
    async fn test_restart_gets_new_run_id() {
        let store = Arc::new(InstrumentedStore::new());
        store.seed("A", true, false, 10);
        let engine = engine(&store, 1);

        let first = engine.start_simulation(&code("A")).await.unwrap();
        engine.stop_simulation(&code("A")).await.unwrap();
        let second = engine.start_simulation(&code("A")).await.unwrap();

        assert_ne!(first, second);
        engine.stop_all_simulations().await;
    }

    #[tokio::test]
    async fn test_stop_all_then_no_writes() {
        let store = Arc::new(InstrumentedStore::new());
        for c in ["A", "B", "C"] {
            store.seed(c, true, true, 100);
        }
        let engine = engine(&store, 1);
        engine.initialize_all_simulations().await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(engine.stop_all_simulations().await, 3);
        assert!(engine.get_running_simulations().is_empty());

        let writes = store.update_count();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.update_count(), writes);
    }

    #[tokio::test]
    async fn test_claim_starts_and_unclaim_stops() {
        let store = Arc::new(InstrumentedStore::new());
        let engine = engine(&store, 1);
        engine
            .register_device(NewDevice::new("bag-1").with_battery(80))
            .await
            .unwrap();

        let device = engine.claim_device(&code("bag-1"), "alice").await.unwrap();
        assert!(device.is_claimed);
        assert_eq!(device.owner.as_deref(), Some("alice"));
        assert_eq!(engine.get_running_simulations(), vec![code("bag-1")]);

        let device = engine.unclaim_device(&code("bag-1")).await.unwrap();
        assert!(!device.is_claimed);
        assert!(engine.get_running_simulations().is_empty());
    }

    #[tokio::test]
    async fn test_claim_by_other_owner_conflicts() {
        let store = Arc::new(InstrumentedStore::new());
        let engine = engine(&store, 1);
        engine.register_device(NewDevice::new("bag-1")).await.unwrap();
        engine.claim_device(&code("bag-1"), "alice").await.unwrap();

        let err = engine.claim_device(&code("bag-1"), "bob").await.unwrap_err();
        assert!(matches!(err, SimError::Conflict(_)));

        engine.claim_device(&code("bag-1"), "alice").await.unwrap();
        assert_eq!(engine.registry().len(), 1);
        engine.stop_all_simulations().await;
    }

    #[tokio::test]
    async fn test_claim_rejects_blank_owner() {
        let store = Arc::new(InstrumentedStore::new());
        let engine = engine(&store, 1);
        engine.register_device(NewDevice::new("bag-1")).await.unwrap();

        let err = engine.claim_device(&code("bag-1"), "  ").await.unwrap_err();
        assert!(matches!(err, SimError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_register_validates_input() {
        let store = Arc::new(InstrumentedStore::new());
        let engine = engine(&store, 1);

        let err = engine
            .register_device(NewDevice::new("bad code!"))
            .await
            .unwrap_err();
        assert!(matches!(err, SimError::InvalidRequest(_)));

        let err = engine
            .register_device(NewDevice::new("bag-1").with_battery(150))
            .await
            .unwrap_err();
        assert!(matches!(err, SimError::InvalidRequest(_)));

        engine.register_device(NewDevice::new("bag-1")).await.unwrap();
        let err = engine
            .register_device(NewDevice::new("bag-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SimError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_set_power_missing_device() {
        let store = Arc::new(InstrumentedStore::new());
        let engine = engine(&store, 1);

        let err = engine.set_power(&code("nope"), true).await.unwrap_err();
        assert_eq!(err, SimError::DeviceNotFound(code("nope")));
    }

    #[tokio::test]
    async fn test_seed_devices_is_idempotent() {
        let store = Arc::new(InstrumentedStore::new());
        let engine = engine(&store, 1);
        let seeds = vec![
            SeedDevice {
                code: code("A"),
                battery_level: 40,
                owner: Some("alice".into()),
                status: true,
            },
            SeedDevice {
                code: code("B"),
                battery_level: 100,
                owner: None,
                status: false,
            },
        ];

        assert_eq!(engine.seed_devices(&seeds).await.unwrap(), 2);
        assert_eq!(engine.seed_devices(&seeds).await.unwrap(), 0);

        let a = engine.get_device(&code("A")).await.unwrap();
        assert!(a.is_claimed);
        assert!(a.status);
        assert_eq!(a.battery_level, 40);

        let b = engine.get_device(&code("B")).await.unwrap();
        assert!(!b.is_claimed);
    }

    #[tokio::test]
    async fn test_health_reports_running_devices() {
        let store = Arc::new(InstrumentedStore::new());
        store.seed("A", true, false, 10);
        let engine = engine(&store, 1);
        engine.initialize_all_simulations().await.unwrap();

        let health = engine.health().await;
        assert_eq!(health.active_simulations, 1);
        assert_eq!(health.simulating_devices, vec![code("A")]);
        assert!(health.store_healthy);

        engine.stop_all_simulations().await;
        assert_eq!(engine.health().await.active_simulations, 0);
    }

    #[tokio::test]
    async fn test_audit_trail() {
        let store = Arc::new(InstrumentedStore::new());
        let engine = engine(&store, 1);
        engine.register_device(NewDevice::new("bag-1")).await.unwrap();
        engine.claim_device(&code("bag-1"), "alice").await.unwrap();
        engine.unclaim_device(&code("bag-1")).await.unwrap();

        let events = store.get_recent_audits(10).unwrap();
        let kinds: Vec<_> = events
            .iter()
            .rev()
            .map(|e| match &e.event {
                AuditEventType::DeviceRegistered { .. } => "registered",
                AuditEventType::DeviceClaimed { .. } => "claimed",
                AuditEventType::SimulationStarted { .. } => "started",
                AuditEventType::DeviceUnclaimed { .. } => "unclaimed",
                AuditEventType::SimulationStopped { .. } => "stopped",
                _ => "other",
            })
            .collect();
        assert_eq!(
            kinds,
            vec!["registered", "claimed", "started", "unclaimed", "stopped"]
        );
    }

    #[tokio::test]
    async fn test_claim_retries_after_losing_race_to_tick() {
        let store = Arc::new(InstrumentedStore::new());
        let engine = engine(&store, 1);
        let registered = engine.register_device(NewDevice::new("bag-1")).await.unwrap();

        // A heartbeat lands between the claim's read and its write
        store.interleave_write(
            &code("bag-1"),
            DeviceUpdate::new().seen_at(chrono::Utc::now()),
        );
        let device = engine.claim_device(&code("bag-1"), "alice").await.unwrap();

        assert!(device.is_claimed);
        assert_eq!(device.owner.as_deref(), Some("alice"));
        assert!(device.last_seen.is_some());
        assert_eq!(device.revision, registered.revision + 2);
        engine.stop_all_simulations().await;
    }

    #[tokio::test]
    async fn test_seed_state_reapplied_after_interrupted_boot() {
        let store = Arc::new(InstrumentedStore::new());
        let engine = engine(&store, 1);

        // Registered by an earlier boot that never applied the claim
        store
            .inner()
            .register_device(NewDevice::new("A").with_battery(40))
            .unwrap();
        let seeds = vec![SeedDevice {
            code: code("A"),
            battery_level: 40,
            owner: Some("alice".into()),
            status: true,
        }];

        assert_eq!(engine.seed_devices(&seeds).await.unwrap(), 1);
        let a = engine.get_device(&code("A")).await.unwrap();
        assert!(a.is_claimed);
        assert!(a.status);
        assert_eq!(a.owner.as_deref(), Some("alice"));

        assert_eq!(engine.seed_devices(&seeds).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_seed_leaves_touched_records_alone() {
        let store = Arc::new(InstrumentedStore::new());
        let engine = engine(&store, 1);
        store.seed("A", false, false, 15);

        let seeds = vec![SeedDevice {
            code: code("A"),
            battery_level: 100,
            owner: Some("alice".into()),
            status: true,
        }];
        assert_eq!(engine.seed_devices(&seeds).await.unwrap(), 0);

        let a = engine.get_device(&code("A")).await.unwrap();
        assert!(!a.is_claimed);
        assert_eq!(a.battery_level, 15);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_restart_waits_for_abandoned_call() {
        let store = Arc::new(InstrumentedStore::new());
        store.seed("A", true, true, 100);
        let engine = SimulationEngine::new(
            store.clone(),
            SimulationConfig {
                tick_interval: Duration::from_millis(50),
                store_timeout: Duration::from_millis(20),
                first_tick: FirstTick::AfterInterval,
                ..config(1)
            },
        );

        // First tick of the first run hangs in the store and is abandoned
        engine.start_simulation(&code("A")).await.unwrap();
        store.set_delay(Some(Duration::from_millis(300)));
        tokio::time::sleep(Duration::from_millis(90)).await;
        engine.stop_simulation(&code("A")).await.unwrap();
        store.set_delay(None);

        engine.start_simulation(&code("A")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        let handle = engine.registry().get(&code("A")).unwrap();
        assert!(handle.skipped() >= 1);

        engine.stop_all_simulations().await;
        assert_eq!(store.update_count(), 0);
    }
}
