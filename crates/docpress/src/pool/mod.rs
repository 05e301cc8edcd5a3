//! Bounded pool of office application instances.
//!
//! The pool never holds an application object itself. Each instance lives in
//! the apartment of the affinity worker that launched it; the pool tracks an
//! [`InstanceInfo`] (id, owning worker, timestamps, use count, process token)
//! and hands out [`InstanceLease`]s that route work to the owning worker.
//!
//! Capacity accounting: `live` counts idle, checked-out and launching
//! instances. It only decreases when an instance is destroyed or a launch
//! reservation is returned, and every decrease wakes one waiter.

mod lease;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;

pub use lease::{Abandoned, InstanceLease};
use lease::LeasePurpose;

use crate::backend::{ApplicationFactory, DocumentKind, InstanceId, NativeError, ProcessToken};
use crate::classify::ErrorClassifier;
use crate::cleanup::{ProcessReaper, reap_best_effort};
use crate::executor::{AffinityExecutor, ExecutorError, WorkerId};
use crate::lock_or_recover;

const GIB: u64 = 1024 * 1024 * 1024;

/// Conservative instance count: one per 2 GiB of memory and per 2 cores,
/// never fewer than one or more than three.
pub fn recommended_pool_size(total_memory_bytes: u64, cores: usize) -> usize {
    let by_memory = usize::try_from(total_memory_bytes / (2 * GIB)).unwrap_or(usize::MAX);
    let by_cores = cores / 2;
    by_memory.min(by_cores).clamp(1, 3)
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("no {kind} instance available after {waited:?} (capacity {capacity})")]
    Exhausted {
        kind: DocumentKind,
        capacity: usize,
        waited: Duration,
    },
    #[error("{kind} instance did not start within {timeout:?}")]
    LaunchTimeout { kind: DocumentKind, timeout: Duration },
    #[error("failed to launch {kind} instance: {source}")]
    Launch {
        kind: DocumentKind,
        source: NativeError,
    },
    #[error("pool is closed")]
    Closed,
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub kind: DocumentKind,
    pub capacity: usize,
    pub launch_timeout: Duration,
    pub launch_attempts: u32,
    pub launch_backoff: Duration,
    /// Recycle an instance after this many conversions.
    pub max_uses: Option<u64>,
    /// Decides which launch failures are worth another attempt.
    pub classifier: ErrorClassifier,
}

impl PoolConfig {
    pub fn new(kind: DocumentKind, capacity: usize) -> Self {
        Self {
            kind,
            capacity: capacity.max(1),
            launch_timeout: Duration::from_secs(60),
            launch_attempts: 2,
            launch_backoff: Duration::from_millis(500),
            max_uses: Some(200),
            classifier: ErrorClassifier::default(),
        }
    }

    pub fn with_launch_timeout(mut self, timeout: Duration) -> Self {
        self.launch_timeout = timeout;
        self
    }

    pub fn with_launch_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.launch_attempts = attempts.max(1);
        self.launch_backoff = backoff;
        self
    }

    pub fn with_max_uses(mut self, max_uses: Option<u64>) -> Self {
        self.max_uses = max_uses;
        self
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }
}

/// Pool-side record of one instance.
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub id: InstanceId,
    pub worker: WorkerId,
    pub created_at: Instant,
    pub last_used: Instant,
    pub uses: u64,
    pub token: ProcessToken,
}

impl InstanceInfo {
    fn new(id: InstanceId, worker: WorkerId, token: ProcessToken) -> Self {
        let now = Instant::now();
        Self {
            id,
            worker,
            created_at: now,
            last_used: now,
            uses: 0,
            token,
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub kind: DocumentKind,
    pub capacity: usize,
    pub live: usize,
    pub idle: usize,
    pub checked_out: usize,
    pub launching: usize,
    pub created: u64,
    pub destroyed: u64,
    pub closed: bool,
}

#[derive(Debug, Default)]
struct PoolState {
    /// Most recently released at the back.
    idle: VecDeque<InstanceInfo>,
    live: usize,
    checked_out: usize,
    launching: usize,
    closed: bool,
}

struct PoolInner {
    config: PoolConfig,
    executor: Arc<AffinityExecutor>,
    factory: Arc<dyn ApplicationFactory>,
    reaper: Arc<dyn ProcessReaper>,
    state: StdMutex<PoolState>,
    available: Notify,
    created: AtomicU64,
    destroyed: AtomicU64,
}

enum Take {
    Idle(InstanceInfo),
    Reserved(Reservation),
    Full,
}

#[derive(Clone)]
pub struct InstancePool {
    inner: Arc<PoolInner>,
}

impl InstancePool {
    pub fn new(
        config: PoolConfig,
        executor: Arc<AffinityExecutor>,
        factory: Arc<dyn ApplicationFactory>,
        reaper: Arc<dyn ProcessReaper>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                executor,
                factory,
                reaper,
                state: StdMutex::new(PoolState::default()),
                available: Notify::new(),
                created: AtomicU64::new(0),
                destroyed: AtomicU64::new(0),
            }),
        }
    }

    pub fn kind(&self) -> DocumentKind {
        self.inner.config.kind
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.capacity
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        lock_or_recover(&self.inner.state, "pool state")
    }

    fn take_or_reserve(&self) -> Result<Take, PoolError> {
        let mut state = self.state();
        if state.closed {
            return Err(PoolError::Closed);
        }
        if let Some(info) = state.idle.pop_back() {
            state.checked_out += 1;
            return Ok(Take::Idle(info));
        }
        if state.live < self.inner.config.capacity {
            state.live += 1;
            state.launching += 1;
            return Ok(Take::Reserved(Reservation {
                pool: self.clone(),
                armed: true,
            }));
        }
        Ok(Take::Full)
    }

    /// Check out an instance, launching one if there is spare capacity.
    ///
    /// Waits at most `timeout` for capacity. A launch in progress when the
    /// timeout passes is allowed to finish within its own launch timeout.
    pub async fn acquire(&self, timeout: Duration) -> Result<InstanceLease, PoolError> {
        let started = Instant::now();
        let deadline = crate::deadline_after(started, timeout);

        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.take_or_reserve()? {
                Take::Idle(info) => {
                    tracing::debug!(kind = %self.kind(), instance = %info.id, "Reusing idle instance");
                    return Ok(InstanceLease::new(self.clone(), info, LeasePurpose::Conversion));
                }
                Take::Reserved(reservation) => {
                    let info = self.launch(reservation, deadline).await?;
                    return Ok(InstanceLease::new(self.clone(), info, LeasePurpose::Conversion));
                }
                Take::Full => {}
            }

            let woke = tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), notified).await;
            if woke.is_err() {
                let waited = started.elapsed();
                tracing::debug!(kind = %self.kind(), ?waited, "Pool exhausted");
                return Err(PoolError::Exhausted {
                    kind: self.kind(),
                    capacity: self.capacity(),
                    waited,
                });
            }
        }
    }

    /// Idle instance or fresh reservation without waiting.
    pub async fn try_acquire(&self) -> Result<InstanceLease, PoolError> {
        match self.take_or_reserve()? {
            Take::Idle(info) => Ok(InstanceLease::new(self.clone(), info, LeasePurpose::Conversion)),
            Take::Reserved(reservation) => {
                let info = self.launch(reservation, Instant::now()).await?;
                Ok(InstanceLease::new(self.clone(), info, LeasePurpose::Conversion))
            }
            Take::Full => Err(PoolError::Exhausted {
                kind: self.kind(),
                capacity: self.capacity(),
                waited: Duration::ZERO,
            }),
        }
    }

    /// Launch into a reserved slot, retrying transient failures with
    /// exponential backoff while `retry_until` allows.
    async fn launch(
        &self,
        reservation: Reservation,
        retry_until: Instant,
    ) -> Result<InstanceInfo, PoolError> {
        let config = &self.inner.config;
        let mut backoff = config.launch_backoff;
        let mut attempt = 1;

        loop {
            let error = match self.launch_once().await {
                Ok(info) => {
                    reservation.fulfil();
                    return Ok(info);
                }
                Err(e) => e,
            };

            let retryable = match &error {
                PoolError::Launch { source, .. } => config.classifier.is_transient(source),
                PoolError::Executor(ExecutorError::WorkerLost(_)) => true,
                _ => false,
            };
            if !retryable
                || attempt >= config.launch_attempts
                || crate::deadline_after(Instant::now(), backoff) >= retry_until
            {
                tracing::warn!(kind = %config.kind, attempt, error = %error, "Instance launch failed");
                return Err(error);
            }

            tracing::info!(
                kind = %config.kind,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Instance launch failed, retrying"
            );
            tokio::time::sleep(backoff).await;
            backoff = backoff.saturating_mul(2);
            attempt += 1;
        }
    }

    async fn launch_once(&self) -> Result<InstanceInfo, PoolError> {
        let config = &self.inner.config;
        let executor = &self.inner.executor;
        let worker = executor.least_bound_worker().ok_or_else(|| {
            if executor.is_shutting_down() {
                ExecutorError::ShuttingDown
            } else {
                ExecutorError::WorkerLost(WorkerId(0))
            }
        })?;

        let id = InstanceId::new();
        let kind = config.kind;
        let factory = Arc::clone(&self.inner.factory);
        let guard = LaunchGuard {
            executor: Arc::clone(executor),
            worker,
            id,
            armed: true,
        };

        let launched = executor
            .submit_to(
                worker,
                Some(crate::deadline_after(Instant::now(), config.launch_timeout)),
                move |apartment| {
                    let app = factory.launch(kind)?;
                    let token = app.process_token();
                    apartment.insert(id, app);
                    Ok::<_, NativeError>(token)
                },
            )
            .await;

        match launched {
            Ok(Ok(token)) => {
                guard.disarm();
                self.inner.created.fetch_add(1, Ordering::Relaxed);
                tracing::info!(kind = %kind, instance = %id, %worker, pid = ?token.current(), "Instance created");
                Ok(InstanceInfo::new(id, worker, token))
            }
            Ok(Err(source)) => {
                guard.disarm();
                Err(PoolError::Launch { kind, source })
            }
            // Guard stays armed: the launch may still complete on the worker.
            Err(ExecutorError::DeadlineElapsed) => Err(PoolError::LaunchTimeout {
                kind,
                timeout: config.launch_timeout,
            }),
            Err(e) => {
                guard.disarm();
                Err(e.into())
            }
        }
    }

    /// Back into the idle queue, or destroyed if recycled or closed.
    fn restore(&self, mut info: InstanceInfo, purpose: LeasePurpose) {
        if purpose == LeasePurpose::Conversion {
            info.uses += 1;
            info.last_used = Instant::now();
        }
        let worn_out = self
            .inner
            .config
            .max_uses
            .is_some_and(|max| info.uses >= max);

        let mut state = self.state();
        state.checked_out -= 1;
        if state.closed || worn_out {
            state.live -= 1;
            drop(state);
            let reason = if worn_out { "max uses reached" } else { "pool closed" };
            self.retire(info, reason, false);
            return;
        }
        state.idle.push_back(info);
        drop(state);
        self.inner.available.notify_one();
    }

    /// Destroy a checked-out instance.
    fn destroy(&self, info: InstanceInfo, reason: &'static str, reap: bool) {
        {
            let mut state = self.state();
            state.checked_out -= 1;
            state.live -= 1;
        }
        self.retire(info, reason, reap);
    }

    /// Tear down an instance already removed from the counters.
    fn retire(&self, info: InstanceInfo, reason: &'static str, reap: bool) {
        self.inner.destroyed.fetch_add(1, Ordering::Relaxed);
        self.inner.available.notify_one();

        tracing::info!(
            kind = %self.kind(),
            instance = %info.id,
            worker = %info.worker,
            uses = info.uses,
            reason,
            "Instance evicted"
        );

        if reap && let Some(pid) = info.token.current() {
            reap_best_effort(self.inner.reaper.as_ref(), pid, &info.token);
        }

        let id = info.id;
        let worker = info.worker;
        let posted = self.inner.executor.post_to(worker, move |apartment| {
            if let Some(mut app) = apartment.remove(id) {
                if let Err(e) = app.quit() {
                    tracing::warn!(instance = %id, error = %e, "Failed to quit instance");
                }
            }
        });
        if let Err(e) = posted {
            tracing::debug!(instance = %id, %worker, error = %e, "Instance quit not queued");
        }
    }

    /// Destroy idle instances unused for longer than `max_idle_age`.
    pub fn evict_stale(&self, max_idle_age: Duration) -> usize {
        let stale: Vec<InstanceInfo> = {
            let mut state = self.state();
            let (stale, fresh): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut state.idle)
                .into_iter()
                .partition(|info| info.idle_for() > max_idle_age);
            state.idle = fresh;
            state.live -= stale.len();
            stale.into()
        };
        let count = stale.len();
        for info in stale {
            self.retire(info, "idle too long", false);
        }
        count
    }

    /// Destroy the oldest idle instances until at most `target_live` remain.
    pub fn trim_idle(&self, target_live: usize) -> usize {
        let trimmed: Vec<InstanceInfo> = {
            let mut state = self.state();
            let mut trimmed = Vec::new();
            while state.live > target_live {
                let Some(info) = state.idle.pop_front() else {
                    break;
                };
                state.live -= 1;
                trimmed.push(info);
            }
            trimmed
        };
        let count = trimmed.len();
        for info in trimmed {
            self.retire(info, "resource pressure", false);
        }
        count
    }

    pub fn idle_ids(&self) -> Vec<InstanceId> {
        self.state().idle.iter().map(|info| info.id).collect()
    }

    /// Take a specific idle instance out for a health probe.
    ///
    /// Returns `None` if it was checked out or destroyed in the meantime.
    pub fn checkout_for_probe(&self, id: InstanceId) -> Option<InstanceLease> {
        let info = {
            let mut state = self.state();
            let position = state.idle.iter().position(|info| info.id == id)?;
            let info = state.idle.remove(position)?;
            state.checked_out += 1;
            info
        };
        Some(InstanceLease::new(self.clone(), info, LeasePurpose::Probe))
    }

    /// Reject further acquires and destroy idle instances.
    ///
    /// Checked-out instances are destroyed when their lease is released.
    pub fn close(&self) {
        let idle: Vec<InstanceInfo> = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.live -= idle.len();
            idle
        };
        tracing::info!(kind = %self.kind(), idle = idle.len(), "Closing pool");
        for info in idle {
            self.retire(info, "pool closed", false);
        }
        self.inner.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state();
        PoolStats {
            kind: self.kind(),
            capacity: self.capacity(),
            live: state.live,
            idle: state.idle.len(),
            checked_out: state.checked_out,
            launching: state.launching,
            created: self.inner.created.load(Ordering::Relaxed),
            destroyed: self.inner.destroyed.load(Ordering::Relaxed),
            closed: state.closed,
        }
    }

    pub(crate) fn executor(&self) -> &Arc<AffinityExecutor> {
        &self.inner.executor
    }
}

/// Capacity held for an instance being launched.
///
/// Dropped without [`fulfil`](Self::fulfil) (launch failed or the acquiring
/// future was cancelled) the slot is given back.
struct Reservation {
    pool: InstancePool,
    armed: bool,
}

impl Reservation {
    fn fulfil(mut self) {
        self.armed = false;
        let mut state = self.pool.state();
        state.launching -= 1;
        state.checked_out += 1;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut state = self.pool.state();
            state.launching -= 1;
            state.live -= 1;
        }
        self.pool.inner.available.notify_one();
    }
}

/// Quits a launch that finishes after its caller stopped waiting.
///
/// Queued behind the launch on the same worker, so it runs after it.
struct LaunchGuard {
    executor: Arc<AffinityExecutor>,
    worker: WorkerId,
    id: InstanceId,
    armed: bool,
}

impl LaunchGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for LaunchGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let id = self.id;
        tracing::warn!(instance = %id, worker = %self.worker, "Abandoning launch - instance will be quit if it starts");
        let posted = self.executor.post_to(self.worker, move |apartment| {
            if let Some(mut app) = apartment.remove(id) {
                tracing::info!(instance = %id, "Quitting instance from abandoned launch");
                let _ = app.quit();
            }
        });
        if let Err(e) = posted {
            tracing::debug!(instance = %id, error = %e, "Launch cleanup not queued");
        }
    }
}
