//! Affinity executor: a fixed set of dedicated threads, one apartment each.
//!
//! Native application objects must only ever be touched from the thread that
//! created them. Each worker owns an [`Apartment`]; closures submitted to a
//! worker receive `&mut Apartment` and run there, sequentially, in
//! submission order. Results come back through a oneshot channel as an
//! awaitable [`Submission`].
//!
//! Threads are created once and never respawned. A panic inside a work item
//! kills its worker, marks the executor failed, and resolves every pending
//! and future submission for that worker to [`ExecutorError::WorkerLost`].

mod apartment;
mod worker;

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

pub use apartment::Apartment;
use worker::{Dispatch, WorkItem, WorkerShared};

use crate::lock_or_recover;

/// Index of an affinity worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct WorkerId(pub usize);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "apt-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    #[error("deadline elapsed before the work item completed")]
    DeadlineElapsed,
    #[error("worker {0} is gone")]
    WorkerLost(WorkerId),
    #[error("executor is shutting down")]
    ShuttingDown,
    #[error("no such worker: {0}")]
    UnknownWorker(WorkerId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub id: WorkerId,
    pub queued: usize,
    pub bound: usize,
    pub busy: bool,
    pub alive: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Workers that drained their queue and exited within the grace period.
    pub drained: usize,
    /// Workers still busy when the grace period expired; left running.
    pub detached: usize,
}

struct WorkerHandle {
    id: WorkerId,
    shared: Arc<WorkerShared>,
}

pub struct AffinityExecutor {
    workers: Vec<WorkerHandle>,
    /// Emptied on shutdown; dropping the senders lets workers drain and exit.
    senders: StdMutex<Vec<mpsc::UnboundedSender<WorkItem>>>,
    exits: StdMutex<Vec<oneshot::Receiver<()>>>,
    threads: StdMutex<Vec<JoinHandle<()>>>,
    abort: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
}

impl AffinityExecutor {
    /// Spawn `threads` dedicated workers (at least one).
    pub fn new(threads: usize) -> std::io::Result<Self> {
        let threads = threads.max(1);
        let abort = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(threads);
        let mut senders = Vec::with_capacity(threads);
        let mut exits = Vec::with_capacity(threads);
        let mut handles = Vec::with_capacity(threads);

        for index in 0..threads {
            let id = WorkerId(index);
            let (tx, rx) = mpsc::unbounded_channel();
            let (exit_tx, exit_rx) = oneshot::channel();
            let shared = Arc::new(WorkerShared::default());
            shared.alive.store(true, Ordering::Release);

            let thread_shared = Arc::clone(&shared);
            let thread_abort = Arc::clone(&abort);
            let thread_failed = Arc::clone(&failed);
            let handle = std::thread::Builder::new()
                .name(format!("docpress-{}", id))
                .spawn(move || {
                    worker::run(id, rx, thread_shared, thread_abort, thread_failed, exit_tx)
                })?;

            workers.push(WorkerHandle { id, shared });
            senders.push(tx);
            exits.push(exit_rx);
            handles.push(handle);
        }

        tracing::info!(threads, "Affinity executor started");

        Ok(Self {
            workers,
            senders: StdMutex::new(senders),
            exits: StdMutex::new(exits),
            threads: StdMutex::new(handles),
            abort,
            failed,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// True once any worker has died from a panicking work item.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        lock_or_recover(&self.senders, "executor senders").is_empty()
    }

    /// Submit to the live worker with the shortest queue.
    pub fn submit<F, T>(&self, work: F) -> Submission<T>
    where
        F: FnOnce(&mut Apartment) -> T + Send + 'static,
        T: Send + 'static,
    {
        match self.least_queued_worker() {
            Some(worker) => self.submit_to(worker, None, work),
            None if self.is_shutting_down() => Submission::failed(ExecutorError::ShuttingDown),
            None => Submission::failed(ExecutorError::WorkerLost(WorkerId(0))),
        }
    }

    /// Submit to a specific worker, optionally with a deadline.
    ///
    /// If the deadline passes before the worker reaches the item, the
    /// submission resolves to [`ExecutorError::DeadlineElapsed`] and the
    /// worker skips the item. An item that already started runs to
    /// completion; its result is discarded.
    pub fn submit_to<F, T>(&self, worker: WorkerId, deadline: Option<Instant>, work: F) -> Submission<T>
    where
        F: FnOnce(&mut Apartment) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task = Box::new(move |dispatch: Dispatch<'_>| {
            let result = match dispatch {
                Dispatch::Run(apartment) => Ok(work(apartment)),
                Dispatch::Skip(e) => Err(e),
            };
            let _ = tx.send(result);
        });

        match self.enqueue(worker, WorkItem { deadline, task }) {
            Ok(()) => Submission {
                worker,
                deadline,
                rx: Ok(rx),
            },
            Err(e) => Submission::failed(e),
        }
    }

    /// Fire-and-forget variant of [`submit_to`](Self::submit_to).
    pub fn post_to<F>(&self, worker: WorkerId, work: F) -> Result<(), ExecutorError>
    where
        F: FnOnce(&mut Apartment) + Send + 'static,
    {
        let task = Box::new(move |dispatch: Dispatch<'_>| {
            if let Dispatch::Run(apartment) = dispatch {
                work(apartment);
            }
        });
        self.enqueue(worker, WorkItem { deadline: None, task })
    }

    fn enqueue(&self, worker: WorkerId, item: WorkItem) -> Result<(), ExecutorError> {
        let handle = self
            .workers
            .get(worker.0)
            .ok_or(ExecutorError::UnknownWorker(worker))?;

        let sender = {
            let senders = lock_or_recover(&self.senders, "executor senders");
            senders.get(worker.0).cloned()
        };
        let Some(sender) = sender else {
            return Err(ExecutorError::ShuttingDown);
        };

        if !handle.shared.alive.load(Ordering::Acquire) {
            return Err(ExecutorError::WorkerLost(worker));
        }

        handle.shared.queued.fetch_add(1, Ordering::AcqRel);
        if sender.send(item).is_err() {
            handle.shared.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(ExecutorError::WorkerLost(worker));
        }
        Ok(())
    }

    fn live_workers(&self) -> impl Iterator<Item = &WorkerHandle> {
        self.workers
            .iter()
            .filter(|w| w.shared.alive.load(Ordering::Acquire))
    }

    /// Live worker with the fewest queued items; ties go to the lowest index.
    pub fn least_queued_worker(&self) -> Option<WorkerId> {
        self.live_workers()
            .min_by_key(|w| (w.shared.pending(), w.id))
            .map(|w| w.id)
    }

    /// Live worker with the fewest bound instances, then the lightest load,
    /// then the lowest index. Used to place new instances.
    pub fn least_bound_worker(&self) -> Option<WorkerId> {
        self.live_workers()
            .min_by_key(|w| (w.shared.bound.load(Ordering::Acquire), w.shared.pending(), w.id))
            .map(|w| w.id)
    }

    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        self.workers
            .iter()
            .map(|w| WorkerStats {
                id: w.id,
                queued: w.shared.queued.load(Ordering::Acquire),
                bound: w.shared.bound.load(Ordering::Acquire),
                busy: w.shared.busy.load(Ordering::Acquire),
                alive: w.shared.alive.load(Ordering::Acquire),
            })
            .collect()
    }

    /// Stop accepting work, let workers drain, wait up to `grace`.
    ///
    /// Workers still busy after `grace` are detached: their remaining queued
    /// items fail with [`ExecutorError::ShuttingDown`] and the thread exits
    /// once the running item returns. Calling this twice is a no-op.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        drop(std::mem::take(&mut *lock_or_recover(
            &self.senders,
            "executor senders",
        )));
        let exits = std::mem::take(&mut *lock_or_recover(&self.exits, "executor exits"));
        if exits.is_empty() {
            return ShutdownReport::default();
        }

        tracing::info!(grace_secs = grace.as_secs_f64(), "Affinity executor shutting down");

        let all_exited = futures::future::join_all(exits);
        if tokio::time::timeout(grace, all_exited).await.is_err() {
            tracing::warn!("Grace period elapsed - aborting queued work");
            self.abort.store(true, Ordering::Release);
        }

        let mut report = ShutdownReport::default();
        for worker in &self.workers {
            if worker.shared.alive.load(Ordering::Acquire) {
                tracing::warn!(worker = %worker.id, "Detaching busy worker");
                report.detached += 1;
            } else {
                report.drained += 1;
            }
        }

        let handles = std::mem::take(&mut *lock_or_recover(&self.threads, "executor threads"));
        for handle in handles {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }

        tracing::info!(
            drained = report.drained,
            detached = report.detached,
            "Affinity executor stopped"
        );
        report
    }
}

impl WorkerShared {
    /// Queue length plus the running item.
    fn pending(&self) -> usize {
        self.queued.load(Ordering::Acquire) + usize::from(self.busy.load(Ordering::Acquire))
    }
}

/// Awaitable result of a submitted work item.
#[must_use = "a submission does nothing useful unless awaited"]
pub struct Submission<T> {
    worker: WorkerId,
    deadline: Option<Instant>,
    rx: Result<oneshot::Receiver<Result<T, ExecutorError>>, ExecutorError>,
}

impl<T> Submission<T> {
    fn failed(error: ExecutorError) -> Self {
        Self {
            worker: WorkerId(0),
            deadline: None,
            rx: Err(error),
        }
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }
}

impl<T: Send + 'static> IntoFuture for Submission<T> {
    type Output = Result<T, ExecutorError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        let Submission {
            worker,
            deadline,
            rx,
        } = self;

        Box::pin(async move {
            let rx = rx?;
            let completion = async move {
                // Sender dropped without a result: the worker died mid-item or
                // exited with the item still queued.
                rx.await.unwrap_or(Err(ExecutorError::WorkerLost(worker)))
            };
            match deadline {
                Some(deadline) => {
                    tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), completion)
                        .await
                        .unwrap_or(Err(ExecutorError::DeadlineElapsed))
                }
                None => completion.await,
            }
        })
    }
}
