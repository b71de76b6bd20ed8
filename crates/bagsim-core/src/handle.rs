//! Simulation handle: one supervised tick task per device

use bagsim_config::{FirstTick, SimulationConfig};
use bagsim_store::{AuditEvent, AuditEventType};
use bagsim_util::{DeviceCode, RunId};
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{StoreClient, TickOutcome, WriteGate, run_tick, sample_drain};

#[derive(Debug, Default)]
struct TickStats {
    ticks: AtomicU64,
    failures: AtomicU64,
    skipped: AtomicU64,
}

/// Drives one device's simulation on its own timer.
///
/// A handle is single-use: once stopped it cannot be started again, the
/// engine creates a fresh one instead.
pub struct SimulationHandle {
    code: DeviceCode,
    run_id: RunId,
    config: SimulationConfig,
    client: StoreClient,
    started: AtomicBool,
    stop_tx: watch::Sender<bool>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    stop_lock: AsyncMutex<()>,
    in_flight: Arc<AsyncMutex<()>>,
    gate: Arc<WriteGate>,
    stats: Arc<TickStats>,
}

impl SimulationHandle {
    pub fn new(code: DeviceCode, config: SimulationConfig, client: StoreClient) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            code,
            run_id: RunId::new(),
            config,
            client,
            started: AtomicBool::new(false),
            stop_tx,
            task: parking_lot::Mutex::new(None),
            stop_lock: AsyncMutex::new(()),
            in_flight: Arc::new(AsyncMutex::new(())),
            gate: Arc::new(WriteGate::new()),
            stats: Arc::new(TickStats::default()),
        }
    }

    /// Share the single-flight guard with earlier handles of the same
    /// device, so a store call abandoned by a stopped handle also holds off
    /// this one's ticks.
    pub fn sharing_in_flight(mut self, in_flight: Arc<AsyncMutex<()>>) -> Self {
        self.in_flight = in_flight;
        self
    }

    pub fn code(&self) -> &DeviceCode {
        &self.code
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Ticks that reached the store and completed
    pub fn ticks(&self) -> u64 {
        self.stats.ticks.load(Ordering::Relaxed)
    }

    /// Ticks that failed (store error or timeout)
    pub fn failures(&self) -> u64 {
        self.stats.failures.load(Ordering::Relaxed)
    }

    /// Ticks skipped because an earlier store call was still in flight
    pub fn skipped(&self) -> u64 {
        self.stats.skipped.load(Ordering::Relaxed)
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.is_stopped()
    }

    /// Spawn the tick task. Returns immediately.
    ///
    /// With [`FirstTick::Immediate`] the first tick fires right away,
    /// otherwise after one interval. Calling `start` on a running or
    /// stopped handle does nothing.
    pub fn start(&self) {
        if self.is_stopped() {
            warn!(device = %self.code, run_id = %self.run_id, "Ignoring start of stopped handle");
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let ticker = Ticker {
            code: self.code.clone(),
            config: self.config,
            client: self.client.clone(),
            in_flight: self.in_flight.clone(),
            gate: self.gate.clone(),
            stats: self.stats.clone(),
        };
        let stop_rx = self.stop_tx.subscribe();

        *self.task.lock() = Some(tokio::spawn(ticker.run(stop_rx)));

        info!(
            device = %self.code,
            run_id = %self.run_id,
            interval_ms = self.config.tick_interval.as_millis() as u64,
            "Simulation started"
        );
    }

    /// Stop the tick task and wait until it has halted.
    ///
    /// When this returns no tick of this handle will write the device
    /// record again. A store call abandoned by a timed-out tick may still
    /// be reading, but its write is refused. Stopping twice is a no-op.
    pub async fn stop(&self) {
        let _serial = self.stop_lock.lock().await;

        self.stop_tx.send_replace(true);

        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(device = %self.code, error = %e, "Simulation task ended abnormally");
        }

        if self.gate.is_closed() {
            return;
        }
        self.gate.close().await;
        if !self.started.load(Ordering::SeqCst) {
            return;
        }

        info!(
            device = %self.code,
            run_id = %self.run_id,
            ticks = self.ticks(),
            failures = self.failures(),
            "Simulation stopped"
        );
    }
}

impl std::fmt::Debug for SimulationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationHandle")
            .field("code", &self.code)
            .field("run_id", &self.run_id)
            .field("running", &self.is_running())
            .field("ticks", &self.ticks())
            .finish()
    }
}

/// State moved into the tick task
struct Ticker {
    code: DeviceCode,
    config: SimulationConfig,
    client: StoreClient,
    in_flight: Arc<AsyncMutex<()>>,
    gate: Arc<WriteGate>,
    stats: Arc<TickStats>,
}

impl Ticker {
    async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        let period = self.config.tick_interval;
        let first = match self.config.first_tick {
            FirstTick::Immediate => Instant::now(),
            FirstTick::AfterInterval => Instant::now() + period,
        };
        let mut interval = tokio::time::interval_at(first, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !*stop_rx.borrow() {
            tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                _ = interval.tick() => self.tick().await,
            }
        }

        debug!(device = %self.code, "Tick loop exited");
    }

    async fn tick(&self) {
        // Single flight: a store call abandoned by a timeout may still hold this
        let Ok(permit) = self.in_flight.clone().try_lock_owned() else {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            debug!(device = %self.code, "Previous store call still in flight, skipping tick");
            return;
        };

        let drain = sample_drain(self.config.drain, &mut rand::thread_rng());
        let code = self.code.clone();
        let gate = self.gate.clone();

        let result = self
            .client
            .call_guarded(permit, move |store| {
                let outcome = run_tick(store, &code, drain, Utc::now(), &gate)?;
                if let TickOutcome::Applied(t) = outcome
                    && t.depleted_now()
                    && let Some(Err(e)) = gate.pass(|| {
                        store.append_audit(AuditEvent::new(AuditEventType::DeviceDepleted {
                            device: code.clone(),
                        }))
                    })
                {
                    warn!(device = %code, error = %e, "Failed to audit depletion");
                }
                Ok(outcome)
            })
            .await;

        match result {
            Ok(TickOutcome::Idle) => {
                self.stats.ticks.fetch_add(1, Ordering::Relaxed);
                debug!(device = %self.code, "Device unclaimed, tick is a no-op");
            }
            Ok(TickOutcome::Applied(t)) => {
                self.stats.ticks.fetch_add(1, Ordering::Relaxed);
                if t.depleted_now() {
                    info!(device = %self.code, "Battery depleted, power forced off");
                } else {
                    debug!(
                        device = %self.code,
                        state = ?t.to,
                        battery = t.battery_level,
                        "Tick applied"
                    );
                }
            }
            Ok(TickOutcome::Halted) => {
                debug!(device = %self.code, "Handle stopped mid-tick, write dropped");
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                if e.is_transient() {
                    warn!(device = %self.code, error = %e, "Tick failed, retrying next interval");
                } else {
                    error!(device = %self.code, error = %e, "Tick failed");
                }
            }
        }
    }
}
