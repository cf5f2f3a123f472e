//! # Model Lifecycle Manager
//!
//! Owns the single inference resource of the process and decides when it
//! exists. The resource is built lazily by the first request that needs it,
//! placed on the best device that can hold it, and dropped again by a
//! background monitor once nobody has used it for `idle_timeout`.
//!
//! ## State machine:
//! ```text
//! Unloaded --acquire--> Loading --ok--> Ready --idle tick--> Unloading --> Unloaded
//!                          |
//!                          +--failure--> Unloaded (failure recorded for that load)
//! ```
//!
//! ## Key Rust Concepts:
//! - **`std::sync::Mutex` + `tokio::sync::Notify`**: every transition happens in a
//!   short critical section with no `.await` inside. Callers that must wait
//!   register a `Notified` future while still holding the lock, so a wake-up
//!   sent right after they unlock cannot be missed.
//! - **Detached construction task**: the load runs in its own task, so a caller
//!   that gives up (client disconnect) never abandons a half-finished load.
//! - **RAII lease**: [`ResourceLease`] keeps the in-flight counter raised while
//!   it lives and lowers it in `Drop`, on every exit path. Cloning a lease
//!   raises the counter again, so blocking work that outlives a cancelled
//!   request still counts as in use.
//! - **Monotonic usage clock**: last use is stored as milliseconds since the
//!   manager's epoch and only ever moves forward (`fetch_max`).

use super::error::ModelError;
use super::resource::{InferenceResource, ModelLoader};
use crate::device::{ComputeDevice, DeviceProbe, FailureClass};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Externally visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Unloaded,
    Loading,
    Ready,
    Unloading,
}

/// Timing knobs for idle eviction.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleSettings {
    pub idle_timeout: Duration,
    pub check_interval: Duration,
}

enum Slot {
    Unloaded,
    Loading,
    Ready(Arc<InferenceResource>),
    Unloading,
}

impl Slot {
    fn state(&self) -> LifecycleState {
        match self {
            Slot::Unloaded => LifecycleState::Unloaded,
            Slot::Loading => LifecycleState::Loading,
            Slot::Ready(_) => LifecycleState::Ready,
            Slot::Unloading => LifecycleState::Unloading,
        }
    }
}

struct Lifecycle {
    slot: Slot,
    /// Bumped every time a load starts
    generation: u64,
    /// Most recent failed load, tagged with its generation. Kept after later
    /// loads succeed so slow waiters on the failed load still see it.
    last_failure: Option<(u64, ModelError)>,
}

/// Point-in-time view of the manager for health and status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleSnapshot {
    pub state: LifecycleState,
    pub device: Option<ComputeDevice>,
    pub loaded_at: Option<DateTime<Utc>>,
    pub in_flight: usize,
    pub idle_seconds: f64,
    pub idle_timeout_seconds: u64,
    pub construction_attempts: u64,
    pub eviction_requested: bool,
    pub last_failure: Option<String>,
}

enum Step<'a> {
    Acquired(Arc<InferenceResource>),
    Failed(ModelError),
    Wait(Notified<'a>),
}

pub struct ModelManager {
    loader: Arc<dyn ModelLoader>,
    prober: Arc<dyn DeviceProbe>,
    settings: LifecycleSettings,
    lifecycle: Mutex<Lifecycle>,
    transitions: Notify,
    in_flight: AtomicUsize,
    epoch: Instant,
    last_used_ms: AtomicU64,
    eviction_requested: AtomicBool,
    construction_attempts: AtomicU64,
}

impl ModelManager {
    pub fn new(
        loader: Arc<dyn ModelLoader>,
        prober: Arc<dyn DeviceProbe>,
        settings: LifecycleSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            loader,
            prober,
            settings,
            lifecycle: Mutex::new(Lifecycle {
                slot: Slot::Unloaded,
                generation: 0,
                last_failure: None,
            }),
            transitions: Notify::new(),
            in_flight: AtomicUsize::new(0),
            epoch: Instant::now(),
            last_used_ms: AtomicU64::new(0),
            eviction_requested: AtomicBool::new(false),
            construction_attempts: AtomicU64::new(0),
        })
    }

    /// Get the inference resource, loading it first if necessary.
    ///
    /// ## Behavior:
    /// - **Ready**: returns immediately with a lease
    /// - **Unloaded**: starts one load and waits for it like everyone else
    /// - **Loading / Unloading**: waits for the transition to finish
    ///
    /// Every caller that waited on the same load sees the same outcome: either
    /// the shared resource or the same error. A failed load is not sticky; the
    /// next caller to arrive starts a fresh attempt.
    pub async fn acquire(self: &Arc<Self>) -> Result<ResourceLease, ModelError> {
        let mut observed_generation = None;

        loop {
            match self.next_step(&mut observed_generation) {
                Step::Acquired(resource) => {
                    return Ok(ResourceLease {
                        manager: Arc::clone(self),
                        resource,
                    })
                }
                Step::Failed(err) => return Err(err),
                Step::Wait(notified) => notified.await,
            }
        }
    }

    fn next_step<'a>(self: &'a Arc<Self>, observed_generation: &mut Option<u64>) -> Step<'a> {
        let mut guard = self.lock_lifecycle();
        let lifecycle = &mut *guard;

        // A caller that waited on a load which then failed gets that failure,
        // even if a newer load has started or finished since.
        if let (Some(seen), Some((failed, err))) = (*observed_generation, &lifecycle.last_failure) {
            if seen == *failed {
                return Step::Failed(err.clone());
            }
        }

        match &lifecycle.slot {
            Slot::Ready(resource) => {
                let resource = Arc::clone(resource);
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                self.touch();
                Step::Acquired(resource)
            }
            Slot::Loading => {
                *observed_generation = Some(lifecycle.generation);
                Step::Wait(self.transitions.notified())
            }
            Slot::Unloading => Step::Wait(self.transitions.notified()),
            Slot::Unloaded => {
                lifecycle.generation += 1;
                lifecycle.slot = Slot::Loading;
                *observed_generation = Some(lifecycle.generation);

                let notified = self.transitions.notified();
                self.spawn_construction(lifecycle.generation);
                Step::Wait(notified)
            }
        }
    }

    fn spawn_construction(self: &Arc<Self>, generation: u64) {
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            let outcome = manager.construct().await;

            {
                let mut lifecycle = manager.lock_lifecycle();
                match outcome {
                    Ok(resource) => {
                        manager.eviction_requested.store(false, Ordering::SeqCst);
                        manager.touch();
                        lifecycle.slot = Slot::Ready(Arc::new(resource));
                    }
                    Err(err) => {
                        error!(generation, error = %err, "Model construction failed");
                        lifecycle.slot = Slot::Unloaded;
                        lifecycle.last_failure = Some((generation, err));
                    }
                }
            }

            manager.transitions.notify_waiters();
        });
    }

    /// Walk the device preference list until one construction succeeds.
    ///
    /// Only `ResourceExhausted` failures move on to the next device, and the
    /// loop is bounded by the length of the list.
    async fn construct(&self) -> Result<InferenceResource, ModelError> {
        // Probing opens a CUDA context and shells out to nvidia-smi
        let prober = Arc::clone(&self.prober);
        let devices = tokio::task::spawn_blocking(move || prober.preference_order())
            .await
            .map_err(|join_error| ModelError::ConstructionFatal {
                device: None,
                message: format!("device probe task failed: {}", join_error),
            })?;
        let total = devices.len();
        let mut last_exhausted = None;

        for (index, device) in devices.into_iter().enumerate() {
            self.construction_attempts.fetch_add(1, Ordering::SeqCst);
            info!(%device, attempt = index + 1, of = total, "Constructing inference resource");

            let started = std::time::Instant::now();
            let loader = Arc::clone(&self.loader);
            let result = match tokio::task::spawn_blocking(move || loader.load(device)).await {
                Ok(result) => result,
                Err(join_error) => Err(anyhow::anyhow!(
                    "model construction task failed: {}",
                    join_error
                )),
            };

            match result {
                Ok(models) => {
                    info!(
                        %device,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Inference resource ready"
                    );
                    return Ok(InferenceResource::new(device, models));
                }
                Err(err) => {
                    let message = format!("{:#}", err);
                    match self.prober.classify(&err) {
                        FailureClass::ResourceExhausted => {
                            warn!(%device, error = %message, "Device exhausted, trying next device");
                            last_exhausted = Some(ModelError::ResourceExhausted { device, message });
                        }
                        FailureClass::Fatal => {
                            return Err(ModelError::ConstructionFatal {
                                device: Some(device),
                                message,
                            });
                        }
                    }
                }
            }
        }

        Err(last_exhausted.unwrap_or_else(|| ModelError::ConstructionFatal {
            device: None,
            message: "no compute device available".to_string(),
        }))
    }

    /// Ask for the resource to be dropped at the next monitor tick where it is
    /// not in use, regardless of idle time.
    pub fn request_eviction(&self) {
        if !self.eviction_requested.swap(true, Ordering::SeqCst) {
            info!("Eviction of inference resource requested");
        }
    }

    /// One monitor tick: drop the resource if it is loaded, unused and idle
    /// for at least `idle_timeout` (or an eviction was requested).
    ///
    /// Returns `true` when the resource was evicted.
    pub fn evict_if_idle(&self) -> bool {
        let (resource, idle, requested) = {
            let mut lifecycle = self.lock_lifecycle();
            if !matches!(lifecycle.slot, Slot::Ready(_)) {
                return false;
            }

            let idle = self.idle_for();
            let requested = self.eviction_requested.load(Ordering::SeqCst);
            let due = requested || idle >= self.settings.idle_timeout;

            let in_flight = self.in_flight.load(Ordering::SeqCst);
            if in_flight > 0 {
                if due {
                    debug!(in_flight, "Eviction deferred while resource is in use");
                }
                return false;
            }

            if !due {
                return false;
            }

            match std::mem::replace(&mut lifecycle.slot, Slot::Unloading) {
                Slot::Ready(resource) => (resource, idle, requested),
                other => {
                    lifecycle.slot = other;
                    return false;
                }
            }
        };

        info!(
            device = %resource.device(),
            idle_secs = idle.as_secs(),
            requested,
            "Evicting inference resource"
        );
        drop(resource);
        self.eviction_requested.store(false, Ordering::SeqCst);

        self.lock_lifecycle().slot = Slot::Unloaded;
        self.transitions.notify_waiters();
        true
    }

    /// Start the background idle monitor.
    ///
    /// The monitor holds only a weak reference and exits on its own once the
    /// manager is dropped.
    pub fn spawn_idle_monitor(self: &Arc<Self>) -> IdleMonitor {
        let manager = Arc::downgrade(self);
        let period = self.settings.check_interval;

        info!(
            check_interval_secs = period.as_secs_f64(),
            idle_timeout_secs = self.settings.idle_timeout.as_secs_f64(),
            "Starting idle monitor"
        );

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.evict_if_idle();
            }
        });

        IdleMonitor { handle }
    }

    /// Drop the resource at process stop. Leases still in use keep their own
    /// reference until they finish.
    pub fn shutdown(&self) {
        let resource = {
            let mut lifecycle = self.lock_lifecycle();
            if !matches!(lifecycle.slot, Slot::Ready(_)) {
                return;
            }
            std::mem::replace(&mut lifecycle.slot, Slot::Unloaded)
        };

        if let Slot::Ready(resource) = resource {
            info!(
                device = %resource.device(),
                in_flight = self.in_flight(),
                "Releasing inference resource on shutdown"
            );
            drop(resource);
        }
        self.transitions.notify_waiters();
    }

    pub fn state(&self) -> LifecycleState {
        self.lock_lifecycle().slot.state()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> LifecycleSnapshot {
        let lifecycle = self.lock_lifecycle();
        let (device, loaded_at) = match &lifecycle.slot {
            Slot::Ready(resource) => (Some(resource.device()), Some(resource.loaded_at())),
            _ => (None, None),
        };

        LifecycleSnapshot {
            state: lifecycle.slot.state(),
            device,
            loaded_at,
            in_flight: self.in_flight(),
            idle_seconds: self.idle_for().as_secs_f64(),
            idle_timeout_seconds: self.settings.idle_timeout.as_secs(),
            construction_attempts: self.construction_attempts.load(Ordering::SeqCst),
            eviction_requested: self.eviction_requested.load(Ordering::SeqCst),
            last_failure: lifecycle
                .last_failure
                .as_ref()
                .filter(|(failed, _)| *failed == lifecycle.generation)
                .map(|(_, err)| err.to_string()),
        }
    }

    /// Time since the resource was last acquired or released.
    pub fn idle_for(&self) -> Duration {
        let last = self.last_used_ms.load(Ordering::SeqCst);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    fn now_ms(&self) -> u64 {
        Instant::now().saturating_duration_since(self.epoch).as_millis() as u64
    }

    fn touch(&self) {
        self.last_used_ms.fetch_max(self.now_ms(), Ordering::SeqCst);
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Proof that the caller holds the resource for one unit of work.
///
/// Dropping the lease (or calling [`ResourceLease::release`]) refreshes the
/// usage clock and lowers the in-flight counter. It never unloads anything.
/// Each clone counts as one more user until it is dropped.
pub struct ResourceLease {
    manager: Arc<ModelManager>,
    resource: Arc<InferenceResource>,
}

impl ResourceLease {
    pub fn resource(&self) -> &Arc<InferenceResource> {
        &self.resource
    }

    pub fn device(&self) -> ComputeDevice {
        self.resource.device()
    }

    /// Mark the resource for eviction once this and every other lease is gone.
    pub fn request_eviction(&self) {
        self.manager.request_eviction();
    }

    pub fn release(self) {}
}

impl Clone for ResourceLease {
    fn clone(&self) -> Self {
        self.manager.in_flight.fetch_add(1, Ordering::SeqCst);
        Self {
            manager: Arc::clone(&self.manager),
            resource: Arc::clone(&self.resource),
        }
    }
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        self.manager.touch();
        let remaining = self.manager.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(remaining, "Released inference resource");
    }
}

/// Handle to the background idle monitor task.
pub struct IdleMonitor {
    handle: JoinHandle<()>,
}

impl IdleMonitor {
    pub fn stop(self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::testing::{FakeLoader, FixedProbe, SlowProbe};
    use futures_util::future::join_all;
    use std::sync::Barrier;

    const GPU: ComputeDevice = ComputeDevice::Cuda { ordinal: 0 };

    fn settings(idle_secs: u64, interval_secs: u64) -> LifecycleSettings {
        LifecycleSettings {
            idle_timeout: Duration::from_secs(idle_secs),
            check_interval: Duration::from_secs(interval_secs),
        }
    }

    fn manager_with(
        loader: Arc<FakeLoader>,
        devices: Vec<ComputeDevice>,
        settings: LifecycleSettings,
    ) -> Arc<ModelManager> {
        ModelManager::new(loader, Arc::new(FixedProbe(devices)), settings)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquires_construct_once() {
        let loader = Arc::new(FakeLoader::new().with_delay(Duration::from_millis(100)));
        let manager = manager_with(loader.clone(), vec![ComputeDevice::Cpu], settings(300, 10));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.acquire().await })
            })
            .collect();

        let leases: Vec<ResourceLease> = join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(loader.attempts(), 1);
        assert_eq!(manager.in_flight(), 16);
        assert_eq!(manager.state(), LifecycleState::Ready);
        assert!(leases.iter().all(|lease| lease.device() == ComputeDevice::Cpu));

        drop(leases);
        assert_eq!(manager.in_flight(), 0);
        // Release never unloads
        assert_eq!(manager.state(), LifecycleState::Ready);
    }

    #[tokio::test]
    async fn test_waiters_share_one_failure() {
        let loader = Arc::new(
            FakeLoader::new()
                .with_delay(Duration::from_millis(50))
                .failing_on(ComputeDevice::Cpu, "weights missing"),
        );
        let manager = manager_with(loader.clone(), vec![ComputeDevice::Cpu], settings(300, 10));

        let results = join_all((0..8).map(|_| manager.acquire())).await;

        assert_eq!(loader.attempts(), 1);
        for result in results {
            match result {
                Err(ModelError::ConstructionFatal { device, message }) => {
                    assert_eq!(device, Some(ComputeDevice::Cpu));
                    assert!(message.contains("weights missing"));
                }
                Err(other) => panic!("unexpected error: {other}"),
                Ok(_) => panic!("load should have failed"),
            }
        }
        assert_eq!(manager.state(), LifecycleState::Unloaded);
        assert_eq!(manager.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failed_load_is_retried_by_next_caller() {
        let loader = Arc::new(FakeLoader::new().failing_first(1));
        let manager = manager_with(loader.clone(), vec![ComputeDevice::Cpu], settings(300, 10));

        assert!(manager.acquire().await.is_err());
        assert!(manager.status().last_failure.is_some());

        let lease = manager.acquire().await.unwrap();
        assert_eq!(lease.device(), ComputeDevice::Cpu);
        assert_eq!(loader.attempts(), 2);
        assert!(manager.status().last_failure.is_none());
    }

    #[tokio::test]
    async fn test_falls_back_to_cpu_when_gpu_is_exhausted() {
        let loader = Arc::new(
            FakeLoader::new().failing_on(GPU, "CUDA_ERROR_OUT_OF_MEMORY: out of memory"),
        );
        let manager = manager_with(loader.clone(), vec![GPU, ComputeDevice::Cpu], settings(300, 10));

        let lease = manager.acquire().await.unwrap();

        assert_eq!(lease.device(), ComputeDevice::Cpu);
        assert_eq!(loader.attempts(), 2);
        assert_eq!(*loader.loaded_on.lock().unwrap(), vec![ComputeDevice::Cpu]);
        assert_eq!(manager.status().device, Some(ComputeDevice::Cpu));
    }

    #[tokio::test]
    async fn test_exhaustion_everywhere_is_bounded_by_device_list() {
        let loader = Arc::new(
            FakeLoader::new()
                .failing_on(GPU, "CUDA out of memory")
                .failing_on(ComputeDevice::Cpu, "cannot allocate memory"),
        );
        let manager = manager_with(loader.clone(), vec![GPU, ComputeDevice::Cpu], settings(300, 10));

        let err = manager.acquire().await.err().unwrap();

        assert_eq!(loader.attempts(), 2);
        assert!(matches!(
            err,
            ModelError::ResourceExhausted {
                device: ComputeDevice::Cpu,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_fatal_gpu_failure_does_not_fall_back() {
        let loader = Arc::new(FakeLoader::new().failing_on(GPU, "unsupported dtype"));
        let manager = manager_with(loader.clone(), vec![GPU, ComputeDevice::Cpu], settings(300, 10));

        let err = manager.acquire().await.err().unwrap();

        assert_eq!(loader.attempts(), 1);
        assert!(matches!(err, ModelError::ConstructionFatal { device: Some(d), .. } if d == GPU));
    }

    #[tokio::test]
    async fn test_empty_device_list_is_fatal() {
        let loader = Arc::new(FakeLoader::new());
        let manager = manager_with(loader.clone(), vec![], settings(300, 10));

        let err = manager.acquire().await.err().unwrap();
        assert!(matches!(err, ModelError::ConstructionFatal { device: None, .. }));
        assert_eq!(loader.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_waits_for_in_flight_work() {
        let loader = Arc::new(FakeLoader::new());
        let manager = manager_with(loader.clone(), vec![ComputeDevice::Cpu], settings(300, 10));

        let lease = manager.acquire().await.unwrap();
        tokio::time::advance(Duration::from_secs(400)).await;

        assert!(!manager.evict_if_idle());
        assert_eq!(manager.state(), LifecycleState::Ready);

        // Releasing counts as use, so the idle clock restarts here
        lease.release();
        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(!manager.evict_if_idle());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(manager.evict_if_idle());
        assert_eq!(manager.state(), LifecycleState::Unloaded);

        // Next request loads a fresh resource
        let _lease = manager.acquire().await.unwrap();
        assert_eq!(loader.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_evicts_within_one_interval_of_timeout() {
        let loader = Arc::new(FakeLoader::new());
        let manager = manager_with(loader, vec![ComputeDevice::Cpu], settings(300, 10));

        manager.acquire().await.unwrap().release();
        let started = Instant::now();
        let monitor = manager.spawn_idle_monitor();

        let mut evicted_after = None;
        for _ in 0..320 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if manager.state() == LifecycleState::Unloaded {
                evicted_after = Some(started.elapsed());
                break;
            }
        }
        monitor.stop();

        let evicted_after = evicted_after.expect("resource was never evicted");
        assert!(evicted_after >= Duration::from_secs(300), "{evicted_after:?}");
        assert!(evicted_after < Duration::from_secs(310), "{evicted_after:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_requested_eviction_ignores_idle_time() {
        let loader = Arc::new(FakeLoader::new());
        let manager = manager_with(loader, vec![ComputeDevice::Cpu], settings(300, 10));

        let lease = manager.acquire().await.unwrap();
        lease.request_eviction();
        assert!(!manager.evict_if_idle());

        drop(lease);
        assert!(manager.evict_if_idle());
        assert!(!manager.status().eviction_requested);
    }

    #[tokio::test]
    async fn test_cancelled_acquire_does_not_abandon_load() {
        let loader = Arc::new(FakeLoader::new().with_delay(Duration::from_millis(50)));
        let manager = manager_with(loader.clone(), vec![ComputeDevice::Cpu], settings(300, 10));

        let waiting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire().await.map(|_| ()) })
        };
        while manager.state() != LifecycleState::Loading {
            tokio::task::yield_now().await;
        }
        waiting.abort();

        while manager.state() != LifecycleState::Ready {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(manager.in_flight(), 0);

        let _lease = manager.acquire().await.unwrap();
        assert_eq!(loader.attempts(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_waiter_sees_its_own_failed_load() {
        let loader = Arc::new(
            FakeLoader::new()
                .failing_first(1)
                .with_delay(Duration::from_millis(50)),
        );
        let manager = manager_with(loader.clone(), vec![ComputeDevice::Cpu], settings(300, 10));

        let first = manager.acquire();
        tokio::pin!(first);
        assert!(futures_util::poll!(first.as_mut()).is_pending());

        while manager.status().last_failure.is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // A newcomer starts the next load before the first waiter runs again
        let second = manager.acquire();
        tokio::pin!(second);
        assert!(futures_util::poll!(second.as_mut()).is_pending());
        assert_eq!(manager.state(), LifecycleState::Loading);

        assert!(matches!(
            first.await,
            Err(ModelError::ConstructionFatal { ref message, .. }) if message.contains("corrupt")
        ));
        assert_eq!(second.await.unwrap().device(), ComputeDevice::Cpu);
        assert_eq!(loader.attempts(), 2);
    }

    #[tokio::test]
    async fn test_device_detection_runs_off_the_runtime_thread() {
        let probe = SlowProbe {
            devices: vec![ComputeDevice::Cpu],
            delay: Duration::from_millis(300),
        };
        let manager = ModelManager::new(
            Arc::new(FakeLoader::new()),
            Arc::new(probe),
            settings(300, 10),
        );

        let acquiring = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire().await.map(|lease| lease.device()) })
        };

        // Only completes on time if the probe is not blocking this thread
        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(started.elapsed() < Duration::from_millis(200), "{:?}", started.elapsed());
        assert_eq!(manager.state(), LifecycleState::Loading);

        assert_eq!(acquiring.await.unwrap().unwrap(), ComputeDevice::Cpu);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_acquire_waits_for_unloading_to_finish() {
        let gate = Arc::new(Barrier::new(2));
        let loader = Arc::new(FakeLoader::new().with_drop_gate(gate.clone()));
        let manager = manager_with(loader.clone(), vec![ComputeDevice::Cpu], settings(300, 10));

        manager.acquire().await.unwrap().release();
        manager.request_eviction();

        let evicting = {
            let manager = manager.clone();
            tokio::task::spawn_blocking(move || manager.evict_if_idle())
        };
        while manager.state() != LifecycleState::Unloading {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let acquiring = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire().await.map(|lease| lease.device()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!acquiring.is_finished());
        assert_eq!(manager.state(), LifecycleState::Unloading);
        assert_eq!(loader.attempts(), 1);
        assert_eq!(loader.live_bundles.current(), 1);

        tokio::task::spawn_blocking(move || gate.wait()).await.unwrap();
        assert!(evicting.await.unwrap());

        assert_eq!(acquiring.await.unwrap().unwrap(), ComputeDevice::Cpu);
        assert_eq!(loader.attempts(), 2);
        assert_eq!(loader.live_bundles.max(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drops_resource() {
        let loader = Arc::new(FakeLoader::new());
        let manager = manager_with(loader, vec![ComputeDevice::Cpu], settings(300, 10));

        manager.acquire().await.unwrap().release();
        manager.shutdown();

        let status = manager.status();
        assert_eq!(status.state, LifecycleState::Unloaded);
        assert_eq!(status.device, None);
    }
}
