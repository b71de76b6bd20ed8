//! Bounded access to the blocking device store from async code

use bagsim_store::{DeviceStore, StoreResult};
use bagsim_util::{SimError, SimResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedMutexGuard, RwLock};

/// Runs store calls on the blocking pool with a timeout.
///
/// A call that times out keeps running on the blocking pool; callers that
/// must not overlap with it pass a guard to [`StoreClient::call_guarded`],
/// which releases it only when the call really finishes.
#[derive(Clone)]
pub struct StoreClient {
    store: Arc<dyn DeviceStore>,
    timeout: Duration,
}

impl StoreClient {
    pub fn new(store: Arc<dyn DeviceStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn store(&self) -> &Arc<dyn DeviceStore> {
        &self.store
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `f` against the store, bounded by the configured timeout
    pub async fn call<T, F>(&self, f: F) -> SimResult<T>
    where
        F: FnOnce(&dyn DeviceStore) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        self.bounded(tokio::task::spawn_blocking(move || f(store.as_ref())))
            .await
    }

    /// Like [`call`](Self::call), holding `guard` until `f` returns
    pub async fn call_guarded<T, F>(&self, guard: OwnedMutexGuard<()>, f: F) -> SimResult<T>
    where
        F: FnOnce(&dyn DeviceStore) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        self.bounded(tokio::task::spawn_blocking(move || {
            let result = f(store.as_ref());
            drop(guard);
            result
        }))
        .await
    }

    async fn bounded<T>(
        &self,
        task: tokio::task::JoinHandle<StoreResult<T>>,
    ) -> SimResult<T> {
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result.map_err(SimError::from),
            Ok(Err(join_err)) => Err(SimError::store_unavailable(format!(
                "store call failed: {join_err}"
            ))),
            Err(_) => Err(SimError::Timeout(self.timeout.as_millis() as u64)),
        }
    }
}

/// Admits device writes until a stopping handle closes it.
///
/// A store call abandoned by a timed-out tick keeps running on the blocking
/// pool. Its write goes through the gate, so once [`close`](Self::close)
/// returns that call can no longer touch the device record.
#[derive(Debug)]
pub struct WriteGate {
    closed: RwLock<bool>,
}

impl WriteGate {
    pub fn new() -> Self {
        Self {
            closed: RwLock::new(false),
        }
    }

    /// Run `write` unless the gate is closed.
    ///
    /// Blocks the calling thread; use from the blocking pool only.
    pub fn pass<T>(&self, write: impl FnOnce() -> T) -> Option<T> {
        let closed = self.closed.blocking_read();
        if *closed {
            return None;
        }
        Some(write())
    }

    /// Close the gate, waiting for a write already inside it to finish
    pub async fn close(&self) {
        *self.closed.write().await = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.try_read().map_or(true, |closed| *closed)
    }
}

impl Default for WriteGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bagsim_store::{InstrumentedStore, NewDevice};
    use bagsim_util::DeviceCode;

    #[tokio::test]
    async fn test_call_maps_store_errors() {
        let store = Arc::new(InstrumentedStore::new());
        let client = StoreClient::new(store, Duration::from_secs(1));

        let err = client
            .call(|s| s.get_device(&DeviceCode::new("missing")))
            .await
            .unwrap_err();
        assert_eq!(err, SimError::DeviceNotFound(DeviceCode::new("missing")));

        let device = client
            .call(|s| s.register_device(NewDevice::new("BAG-1")))
            .await
            .unwrap();
        assert_eq!(device.code.as_str(), "BAG-1");
    }

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let store = Arc::new(InstrumentedStore::new());
        store.set_delay(Some(Duration::from_millis(300)));
        let client = StoreClient::new(store, Duration::from_millis(20));

        let err = client.call(|s| s.list_devices()).await.unwrap_err();
        assert_eq!(err, SimError::Timeout(20));
    }

    #[tokio::test]
    async fn test_guard_held_until_call_finishes() {
        let store = Arc::new(InstrumentedStore::new());
        store.set_delay(Some(Duration::from_millis(150)));
        let client = StoreClient::new(store, Duration::from_millis(20));

        let lock = Arc::new(tokio::sync::Mutex::new(()));
        let guard = lock.clone().try_lock_owned().unwrap();
        let err = client
            .call_guarded(guard, |s| s.list_devices())
            .await
            .unwrap_err();
        assert!(matches!(err, SimError::Timeout(_)));

        // The abandoned call still holds the guard
        assert!(lock.clone().try_lock_owned().is_err());

        // ...and releases it once it completes
        let released = tokio::time::timeout(Duration::from_secs(2), lock.lock()).await;
        assert!(released.is_ok());
    }
    #[tokio::test]
    async fn test_closed_gate_refuses_writes() {
        let gate = Arc::new(WriteGate::new());
        assert!(!gate.is_closed());

        let g = gate.clone();
        let open = tokio::task::spawn_blocking(move || g.pass(|| 1)).await.unwrap();
        assert_eq!(open, Some(1));

        gate.close().await;
        assert!(gate.is_closed());
        let g = gate.clone();
        let shut = tokio::task::spawn_blocking(move || g.pass(|| 1)).await.unwrap();
        assert_eq!(shut, None);
    }

    #[tokio::test]
    async fn test_close_waits_for_write_in_progress() {
        let gate = Arc::new(WriteGate::new());
        let written = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();

        let g = gate.clone();
        let w = written.clone();
        let writer = tokio::task::spawn_blocking(move || {
            g.pass(|| {
                entered_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(80));
                w.store(true, std::sync::atomic::Ordering::SeqCst);
            })
        });
        tokio::task::spawn_blocking(move || entered_rx.recv().unwrap())
            .await
            .unwrap();

        gate.close().await;
        // The write that was inside finished before close returned
        assert!(written.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(writer.await.unwrap(), Some(()));
    }
}
