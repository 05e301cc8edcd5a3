//! Exclusive checkout of one pooled instance.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use super::{InstanceInfo, InstancePool};
use crate::backend::{Application, InstanceId, NativeError, codes};
use crate::executor::{ExecutorError, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum LeasePurpose {
    Conversion,
    /// Health probe: does not count as a use or refresh the idle timer.
    Probe,
}

/// How an abandoned lease was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abandoned {
    /// The work never reached the instance; it went back to the pool.
    NotStarted,
    /// The work was running; the instance was destroyed and its process reaped.
    Evicted,
}

/// A checked-out instance.
///
/// Must end with [`release`](Self::release) or
/// [`evict_after_timeout`](Self::evict_after_timeout). Dropping it otherwise
/// destroys the instance and frees its capacity.
#[must_use = "release the lease or the instance is destroyed"]
pub struct InstanceLease {
    pool: InstancePool,
    info: InstanceInfo,
    purpose: LeasePurpose,
    settled: bool,
    /// Set by whichever comes first: the submitted work or [`abandon`](Self::abandon).
    claimed: Arc<AtomicBool>,
}

impl InstanceLease {
    pub(super) fn new(pool: InstancePool, info: InstanceInfo, purpose: LeasePurpose) -> Self {
        Self {
            pool,
            info,
            purpose,
            settled: false,
            claimed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn settle(&mut self) -> InstanceInfo {
        self.settled = true;
        self.info.clone()
    }

    pub fn info(&self) -> &InstanceInfo {
        &self.info
    }

    pub fn id(&self) -> InstanceId {
        self.info.id
    }

    pub fn worker(&self) -> WorkerId {
        self.info.worker
    }

    /// Run `work` against the instance on its owning worker.
    ///
    /// On [`ExecutorError::DeadlineElapsed`] the instance may still be busy;
    /// settle with [`abandon`](Self::abandon).
    pub async fn run<F, T>(&self, deadline: Instant, work: F) -> Result<Result<T, NativeError>, ExecutorError>
    where
        F: FnOnce(&mut dyn Application) -> Result<T, NativeError> + Send + 'static,
        T: Send + 'static,
    {
        let id = self.id();
        let claimed = Arc::clone(&self.claimed);
        self.pool
            .executor()
            .submit_to(self.worker(), Some(deadline), move |apartment| {
                if claimed.swap(true, Ordering::SeqCst) {
                    return Err(NativeError::new(
                        codes::RPC_E_CALL_REJECTED,
                        "lease abandoned before the work started",
                    ));
                }
                match apartment.get_mut(id) {
                    Some(app) => work(app),
                    None => Err(NativeError::new(
                        codes::RPC_E_DISCONNECTED,
                        format!("instance {} is not in its apartment", id),
                    )),
                }
            })
            .await
    }

    /// Return the instance. Unhealthy instances are destroyed, never reused.
    pub fn release(mut self, still_healthy: bool) {
        let info = self.settle();
        if still_healthy {
            self.pool.restore(info, self.purpose);
        } else {
            self.pool.destroy(info, "released unhealthy", false);
        }
    }

    /// Settle after the caller stopped waiting on [`run`](Self::run).
    ///
    /// If the work never started the instance is untouched and goes back to
    /// the pool. Otherwise it is evicted as in
    /// [`evict_after_timeout`](Self::evict_after_timeout).
    pub fn abandon(mut self) -> Abandoned {
        if self.claimed.swap(true, Ordering::SeqCst) {
            self.evict_after_timeout();
            Abandoned::Evicted
        } else {
            // Not a use: the instance never saw the work.
            let info = self.settle();
            self.pool.restore(info, LeasePurpose::Probe);
            Abandoned::NotStarted
        }
    }

    /// Destroy the instance and terminate its process.
    ///
    /// For work that outlived its deadline: the worker may still be inside a
    /// native call that only returns once the process is gone.
    pub fn evict_after_timeout(mut self) {
        let info = self.settle();
        self.pool.destroy(info, "timed out", true);
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        if !self.settled {
            tracing::error!(instance = %self.info.id, "InstanceLease dropped without release - destroying instance");
            let info = self.settle();
            self.pool.destroy(info, "lease dropped", false);
        }
    }
}
