//! Bounded pool of warm sandboxes.
//!
//! Spawning a worker costs tens of milliseconds, so the pool keeps sandboxes
//! alive between executions. Every execution still gets a fresh V8 isolate
//! inside the worker; only the process is reused.
//!
//! Admission is a fair (FIFO) semaphore sized `max_instances`. A caller that
//! cannot get a slot within `acquire_timeout` gets [`PoolError::Exhausted`].
//! Every checked-out or spawning sandbox holds one permit, so
//! `available + in_use <= max` holds at all times.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use codemode_config::PoolOverrides;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{PoolError, SandboxError};
#[cfg(feature = "metrics")]
use crate::metrics::CodemodeMetrics;
use crate::sandbox::{ExecutionRequest, ExecutionResult, Sandbox, SandboxConfig, SandboxState};
use crate::CapabilityDispatcher;

/// Sizing and timing of a [`SandboxPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Sandboxes kept warm, even when idle.
    pub min_instances: usize,
    /// Upper bound on idle plus checked-out sandboxes.
    pub max_instances: usize,
    /// Idle sandboxes above `min_instances` are disposed after this long.
    pub idle_timeout: Duration,
    /// How long `acquire()` queues before giving up.
    pub acquire_timeout: Duration,
    /// Period of the background maintenance task.
    pub reap_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_instances: 1,
            max_instances: 8,
            idle_timeout: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(30),
            reap_interval: Duration::from_secs(10),
        }
    }
}

impl PoolConfig {
    /// Defaults with the sizing set, validated.
    pub fn new(
        min_instances: usize,
        max_instances: usize,
        idle_timeout_ms: u64,
    ) -> Result<Self, PoolError> {
        let config = Self {
            min_instances,
            max_instances,
            idle_timeout: Duration::from_millis(idle_timeout_ms),
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply file overrides on top of the defaults, validated.
    pub fn from_overrides(overrides: &PoolOverrides) -> Result<Self, PoolError> {
        let d = Self::default();
        let config = Self {
            min_instances: overrides.min_instances.unwrap_or(d.min_instances),
            max_instances: overrides.max_instances.unwrap_or(d.max_instances),
            idle_timeout: overrides
                .idle_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(d.idle_timeout),
            acquire_timeout: overrides
                .acquire_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(d.acquire_timeout),
            reap_interval: overrides
                .reap_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(d.reap_interval),
        };
        config.validate()?;
        Ok(config)
    }

    /// `0 <= min_instances <= max_instances`, `max_instances > 0`.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_instances == 0 {
            return Err(PoolError::InvalidConfig(
                "max_instances must be at least 1".into(),
            ));
        }
        if self.min_instances > self.max_instances {
            return Err(PoolError::InvalidConfig(format!(
                "min_instances ({}) must not exceed max_instances ({})",
                self.min_instances, self.max_instances
            )));
        }
        if self.reap_interval.is_zero() {
            return Err(PoolError::InvalidConfig(
                "reap_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time occupancy of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Idle sandboxes ready for `acquire()`.
    pub available: usize,
    /// Sandboxes checked out to callers.
    pub in_use: usize,
    /// Configured `max_instances`.
    pub max: usize,
}

/// Atomic counters for pool observability.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Sandboxes spawned.
    pub spawned: AtomicU64,
    /// Acquisitions served from the idle set.
    pub reused: AtomicU64,
    /// Sandboxes disposed by idle eviction.
    pub evicted_idle: AtomicU64,
    /// Sandboxes dropped on release or acquire because they were unhealthy.
    pub discarded_unhealthy: AtomicU64,
    /// Callers turned away after `acquire_timeout`.
    pub exhausted: AtomicU64,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<Sandbox>,
    in_use: HashMap<Uuid, CancellationToken>,
    spawning: usize,
    closed: bool,
}

impl PoolState {
    fn alive(&self) -> usize {
        self.idle.len() + self.in_use.len() + self.spawning
    }
}

type SharedState = Arc<Mutex<PoolState>>;

enum Next {
    Idle(Sandbox),
    Spawn(SpawnReservation),
}

// Never held across an await.
fn lock(state: &Mutex<PoolState>) -> MutexGuard<'_, PoolState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counts a spawn in progress against the pool until settled or dropped.
struct SpawnReservation {
    state: SharedState,
    armed: bool,
}

impl SpawnReservation {
    fn new(state: &SharedState, locked: &mut PoolState) -> Self {
        locked.spawning += 1;
        Self {
            state: state.clone(),
            armed: true,
        }
    }

    /// Release the reservation under a lock the caller already holds.
    fn settle(mut self, locked: &mut PoolState) {
        locked.spawning -= 1;
        self.armed = false;
    }
}

impl Drop for SpawnReservation {
    fn drop(&mut self) {
        if self.armed {
            lock(&self.state).spawning -= 1;
        }
    }
}

/// A sandbox checked out of a [`SandboxPool`].
///
/// Hand it back with [`SandboxPool::release`]. Dropping it instead kills
/// the worker and frees the slot.
pub struct PooledSandbox {
    sandbox: Option<Sandbox>,
    state: SharedState,
    _permit: OwnedSemaphorePermit,
    #[cfg(feature = "metrics")]
    prometheus: Option<Arc<CodemodeMetrics>>,
}

impl std::fmt::Debug for PooledSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSandbox")
            .field("sandbox", &self.sandbox)
            .finish()
    }
}

impl PooledSandbox {
    /// Run one script on the checked-out sandbox.
    pub async fn execute(&mut self, request: ExecutionRequest) -> ExecutionResult {
        let result = match self.sandbox.as_mut() {
            Some(sandbox) => sandbox.execute(request).await,
            None => ExecutionResult::failed(&SandboxError::Disposed, Default::default()),
        };
        #[cfg(feature = "metrics")]
        if let Some(m) = &self.prometheus {
            m.record_execution(
                result.success,
                result.metrics.wall_time_ms as f64 / 1000.0,
                result.metrics.rpc_calls,
            );
        }
        result
    }

    /// Identity of the underlying sandbox.
    pub fn id(&self) -> Option<Uuid> {
        self.sandbox.as_ref().map(Sandbox::id)
    }

    /// Lifecycle state of the underlying sandbox.
    pub fn state(&self) -> SandboxState {
        self.sandbox
            .as_ref()
            .map_or(SandboxState::Disposed, Sandbox::state)
    }

    /// Whether the underlying sandbox can take another execution.
    pub fn is_healthy(&mut self) -> bool {
        self.sandbox.as_mut().is_some_and(Sandbox::is_healthy)
    }
}

impl Drop for PooledSandbox {
    fn drop(&mut self) {
        if let Some(sandbox) = self.sandbox.take() {
            lock(&self.state).in_use.remove(&sandbox.id());
            tracing::debug!(sandbox_id = %sandbox.id(), "pooled sandbox dropped without release");
        }
    }
}

/// A bounded, concurrently shared collection of [`Sandbox`]es.
pub struct SandboxPool {
    config: PoolConfig,
    sandbox_config: SandboxConfig,
    dispatcher: Arc<dyn CapabilityDispatcher>,
    slots: Arc<Semaphore>,
    state: SharedState,
    metrics: Arc<PoolMetrics>,
    #[cfg(feature = "metrics")]
    prometheus: Option<Arc<CodemodeMetrics>>,
}

impl std::fmt::Debug for SandboxPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxPool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl SandboxPool {
    /// Create an empty pool. No worker is spawned until [`initialize`](Self::initialize)
    /// or the first [`acquire`](Self::acquire).
    pub fn new(
        config: PoolConfig,
        sandbox_config: SandboxConfig,
        dispatcher: Arc<dyn CapabilityDispatcher>,
    ) -> Result<Self, PoolError> {
        config.validate()?;
        sandbox_config
            .validate()
            .map_err(|e| PoolError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            slots: Arc::new(Semaphore::new(config.max_instances)),
            config,
            sandbox_config,
            dispatcher,
            state: SharedState::default(),
            metrics: Arc::new(PoolMetrics::default()),
            #[cfg(feature = "metrics")]
            prometheus: None,
        })
    }

    /// Report executions and occupancy to Prometheus.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<CodemodeMetrics>) -> Self {
        self.prometheus = Some(metrics);
        self
    }

    /// Eagerly spawn sandboxes up to `min_instances`. Returns how many were created.
    #[tracing::instrument(skip(self), fields(min = self.config.min_instances))]
    pub async fn initialize(&self) -> Result<usize, PoolError> {
        let created = self.backfill().await?;
        tracing::info!(created, "sandbox pool initialized");
        Ok(created)
    }

    /// Check out a sandbox, queueing (FIFO) while the pool is at capacity.
    ///
    /// Prefers the most recently used idle sandbox, so the oldest ones age out
    /// through idle eviction. Spawns a new sandbox when none is idle.
    #[tracing::instrument(skip(self))]
    pub async fn acquire(&self) -> Result<PooledSandbox, PoolError> {
        let started = Instant::now();
        let permit = match tokio::time::timeout(
            self.config.acquire_timeout,
            self.slots.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => {
                self.metrics.exhausted.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "metrics")]
                if let Some(m) = &self.prometheus {
                    m.record_exhausted();
                }
                let waited_ms = started.elapsed().as_millis() as u64;
                tracing::warn!(max = self.config.max_instances, waited_ms, "sandbox pool exhausted");
                return Err(PoolError::Exhausted {
                    max: self.config.max_instances,
                    waited_ms,
                });
            }
        };

        loop {
            let next = {
                let mut state = lock(&self.state);
                if state.closed {
                    return Err(PoolError::Closed);
                }
                match state.idle.pop_back() {
                    Some(sandbox) => Next::Idle(sandbox),
                    None => Next::Spawn(SpawnReservation::new(&self.state, &mut state)),
                }
            };

            let reservation = match next {
                Next::Idle(mut sandbox) => {
                    if sandbox.is_healthy() {
                        self.metrics.reused.fetch_add(1, Ordering::Relaxed);
                        return self.check_out(sandbox, permit).await;
                    }
                    self.metrics
                        .discarded_unhealthy
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(sandbox_id = %sandbox.id(), "discarding unhealthy idle sandbox");
                    sandbox.dispose().await;
                    continue;
                }
                Next::Spawn(reservation) => reservation,
            };

            let spawned = self.spawn_sandbox().await;
            let sandbox = {
                let mut state = lock(&self.state);
                reservation.settle(&mut state);
                spawned?
            };
            return self.check_out(sandbox, permit).await;
        }
    }

    /// Return a checked-out sandbox.
    ///
    /// A healthy sandbox goes back to the idle set. An unhealthy one is
    /// disposed; the gap below `min_instances` is refilled by [`maintain`](Self::maintain).
    #[tracing::instrument(skip_all, fields(sandbox_id = ?guard.id()))]
    pub async fn release(&self, mut guard: PooledSandbox) {
        let Some(mut sandbox) = guard.sandbox.take() else {
            return;
        };
        let healthy = sandbox.is_healthy();
        let rejected = {
            let mut state = lock(&self.state);
            state.in_use.remove(&sandbox.id());
            if healthy && !state.closed {
                // Keeps the idle set ordered oldest-first for eviction.
                sandbox.touch();
                state.idle.push_back(sandbox);
                None
            } else {
                Some(sandbox)
            }
        };
        if let Some(mut sandbox) = rejected {
            if !healthy {
                self.metrics
                    .discarded_unhealthy
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(sandbox_id = %sandbox.id(), "released sandbox is unhealthy, disposing");
            }
            sandbox.dispose().await;
        }
        // The slot frees only once the sandbox is back in the idle set.
        drop(guard);
        self.publish_stats();
    }

    /// Acquire, execute, release.
    ///
    /// `Err` only for pool-level failures; every execution outcome is an
    /// [`ExecutionResult`].
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, PoolError> {
        let mut guard = self.acquire().await?;
        let result = guard.execute(request).await;
        self.release(guard).await;
        Ok(result)
    }

    /// Dispose idle sandboxes unused for longer than `idle_timeout`, oldest
    /// first, never going below `min_instances`. Returns how many were evicted.
    pub async fn evict_idle(&self) -> usize {
        let evicted: Vec<Sandbox> = {
            let mut state = lock(&self.state);
            let mut alive = state.alive();
            let mut evicted = Vec::new();
            while alive > self.config.min_instances {
                match state.idle.front() {
                    Some(oldest) if oldest.idle_for() > self.config.idle_timeout => {
                        if let Some(sandbox) = state.idle.pop_front() {
                            evicted.push(sandbox);
                            alive -= 1;
                        }
                    }
                    _ => break,
                }
            }
            evicted
        };

        let count = evicted.len();
        for mut sandbox in evicted {
            tracing::debug!(sandbox_id = %sandbox.id(), idle_ms = sandbox.idle_for().as_millis() as u64, "evicting idle sandbox");
            sandbox.dispose().await;
        }
        if count > 0 {
            self.metrics
                .evicted_idle
                .fetch_add(count as u64, Ordering::Relaxed);
            self.publish_stats();
        }
        count
    }

    /// Spawn idle sandboxes until `min_instances` are alive. Only uses free
    /// slots; never queues behind callers. Returns how many were created.
    pub async fn backfill(&self) -> Result<usize, PoolError> {
        let mut created = 0;
        loop {
            let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                break;
            };
            let reservation = {
                let mut state = lock(&self.state);
                if state.closed {
                    return Err(PoolError::Closed);
                }
                if state.alive() >= self.config.min_instances {
                    break;
                }
                SpawnReservation::new(&self.state, &mut state)
            };

            let spawned = self.spawn_sandbox().await;
            let rejected = {
                let mut state = lock(&self.state);
                reservation.settle(&mut state);
                let sandbox = spawned?;
                if state.closed {
                    Some(sandbox)
                } else {
                    state.idle.push_back(sandbox);
                    None
                }
            };
            drop(permit);
            if let Some(mut sandbox) = rejected {
                sandbox.dispose().await;
                return Err(PoolError::Closed);
            }
            created += 1;
        }
        if created > 0 {
            self.publish_stats();
        }
        Ok(created)
    }

    /// One maintenance round: idle eviction, then backfill.
    pub async fn maintain(&self) {
        let evicted = self.evict_idle().await;
        match self.backfill().await {
            Ok(created) if evicted + created > 0 => {
                tracing::debug!(evicted, created, "pool maintenance");
            }
            Ok(_) | Err(PoolError::Closed) => {}
            Err(e) => tracing::warn!(error = %e, "pool backfill failed"),
        }
    }

    /// Run [`maintain`](Self::maintain) every `reap_interval` until the pool is disposed.
    pub fn start_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        let interval = self.config.reap_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if pool.is_closed() {
                    break;
                }
                pool.maintain().await;
            }
        })
    }

    /// Current occupancy.
    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.state);
        PoolStats {
            available: state.idle.len(),
            in_use: state.in_use.len(),
            max: self.config.max_instances,
        }
    }

    /// Lifetime counters.
    pub fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.metrics
    }

    /// The pool's sizing.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Dispose every sandbox, idle or checked out, and refuse further
    /// acquisitions. Checked-out sandboxes are cancelled: their running
    /// executions end with a "sandbox is disposed" result. Idempotent.
    #[tracing::instrument(skip(self))]
    pub async fn dispose(&self) {
        let (idle, in_use) = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
            let idle: Vec<Sandbox> = state.idle.drain(..).collect();
            let in_use: Vec<CancellationToken> = state.in_use.values().cloned().collect();
            (idle, in_use)
        };
        self.slots.close();

        for token in &in_use {
            token.cancel();
        }
        let idle_count = idle.len();
        for mut sandbox in idle {
            sandbox.dispose().await;
        }
        tracing::info!(idle = idle_count, in_use = in_use.len(), "sandbox pool disposed");
        self.publish_stats();
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    async fn spawn_sandbox(&self) -> Result<Sandbox, PoolError> {
        let sandbox = Sandbox::create(self.sandbox_config.clone(), self.dispatcher.clone())
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "failed to spawn sandbox");
                PoolError::Spawn(e)
            })?;
        self.metrics.spawned.fetch_add(1, Ordering::Relaxed);
        Ok(sandbox)
    }

    async fn check_out(
        &self,
        mut sandbox: Sandbox,
        permit: OwnedSemaphorePermit,
    ) -> Result<PooledSandbox, PoolError> {
        let admitted = {
            let mut state = lock(&self.state);
            if !state.closed {
                state.in_use.insert(sandbox.id(), sandbox.cancellation_token());
            }
            !state.closed
        };
        if !admitted {
            sandbox.dispose().await;
            return Err(PoolError::Closed);
        }
        self.publish_stats();
        Ok(PooledSandbox {
            sandbox: Some(sandbox),
            state: self.state.clone(),
            _permit: permit,
            #[cfg(feature = "metrics")]
            prometheus: self.prometheus.clone(),
        })
    }

    fn publish_stats(&self) {
        #[cfg(feature = "metrics")]
        if let Some(m) = &self.prometheus {
            m.set_pool(self.stats());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::CapabilityTable;

    fn pool(config: PoolConfig) -> SandboxPool {
        let sandbox_config = SandboxConfig {
            worker_bin: Some("/nonexistent/codemode-worker".into()),
            ..SandboxConfig::default()
        };
        SandboxPool::new(config, sandbox_config, Arc::new(CapabilityTable::new())).unwrap()
    }

    #[test]
    fn config_rejects_min_above_max() {
        let err = PoolConfig::new(4, 2, 1000).unwrap_err();
        assert!(matches!(err, PoolError::InvalidConfig(_)), "got: {err}");
        assert!(PoolConfig::new(0, 0, 1000).is_err());
        assert!(PoolConfig::new(0, 3, 1000).is_ok());
        assert!(PoolConfig::new(3, 3, 0).is_ok());
    }

    #[test]
    fn config_from_overrides() {
        let overrides = PoolOverrides {
            min_instances: Some(0),
            max_instances: Some(3),
            acquire_timeout_ms: Some(50),
            ..Default::default()
        };
        let config = PoolConfig::from_overrides(&overrides).unwrap();
        assert_eq!(config.min_instances, 0);
        assert_eq!(config.max_instances, 3);
        assert_eq!(config.acquire_timeout, Duration::from_millis(50));
        assert_eq!(config.idle_timeout, PoolConfig::default().idle_timeout);

        let bad = PoolOverrides {
            min_instances: Some(9),
            ..Default::default()
        };
        assert!(PoolConfig::from_overrides(&bad).is_err());
    }

    #[test]
    fn new_pool_is_empty() {
        let pool = pool(PoolConfig::new(0, 3, 1000).unwrap());
        assert_eq!(
            pool.stats(),
            PoolStats {
                available: 0,
                in_use: 0,
                max: 3
            }
        );
        assert!(!pool.is_closed());
    }

    #[test]
    fn invalid_sandbox_config_is_rejected() {
        let sandbox_config = SandboxConfig {
            max_calls: 0,
            ..SandboxConfig::default()
        };
        let err = SandboxPool::new(
            PoolConfig::default(),
            sandbox_config,
            Arc::new(CapabilityTable::new()),
        )
        .unwrap_err();
        assert!(matches!(err, PoolError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_and_frees_the_slot() {
        let pool = pool(PoolConfig::new(0, 1, 1000).unwrap());
        for _ in 0..2 {
            let err = pool.acquire().await.unwrap_err();
            assert!(matches!(err, PoolError::Spawn(_)), "got: {err}");
        }
        assert_eq!(pool.stats().in_use, 0);
        assert_eq!(pool.metrics().spawned.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn initialize_with_zero_min_spawns_nothing() {
        let pool = pool(PoolConfig::new(0, 2, 1000).unwrap());
        assert_eq!(pool.initialize().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn acquire_after_dispose_is_closed() {
        let pool = pool(PoolConfig::new(0, 2, 1000).unwrap());
        pool.dispose().await;
        pool.dispose().await;
        assert!(pool.is_closed());
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
        assert!(matches!(pool.backfill().await, Ok(0) | Err(PoolError::Closed)));
    }

    #[tokio::test]
    async fn evict_on_empty_pool_is_noop() {
        let pool = pool(PoolConfig::new(0, 2, 0).unwrap());
        assert_eq!(pool.evict_idle().await, 0);
        pool.maintain().await;
    }
}
