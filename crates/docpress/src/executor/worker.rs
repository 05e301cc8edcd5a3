//! Affinity worker thread loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use super::apartment::Apartment;
use super::{ExecutorError, WorkerId};

/// What a worker does with a dequeued item.
pub(super) enum Dispatch<'a> {
    Run(&'a mut Apartment),
    Skip(ExecutorError),
}

pub(super) type Task = Box<dyn FnOnce(Dispatch<'_>) + Send>;

pub(super) struct WorkItem {
    pub deadline: Option<Instant>,
    pub task: Task,
}

/// Counters shared between a worker thread and the executor.
#[derive(Debug, Default)]
pub(crate) struct WorkerShared {
    pub queued: AtomicUsize,
    pub bound: AtomicUsize,
    pub busy: AtomicBool,
    pub alive: AtomicBool,
}

/// Marks the worker dead on exit; a panicking exit fails the executor.
struct ExitGuard {
    id: WorkerId,
    shared: Arc<WorkerShared>,
    failed: Arc<AtomicBool>,
    exited: Option<oneshot::Sender<()>>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.shared.alive.store(false, Ordering::Release);
        if std::thread::panicking() {
            self.failed.store(true, Ordering::Release);
            tracing::error!(worker = %self.id, "Affinity worker died - executor marked failed");
        } else {
            tracing::debug!(worker = %self.id, "Affinity worker exited");
        }
        if let Some(tx) = self.exited.take() {
            let _ = tx.send(());
        }
    }
}

pub(super) fn run(
    id: WorkerId,
    mut rx: mpsc::UnboundedReceiver<WorkItem>,
    shared: Arc<WorkerShared>,
    abort: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    exited: oneshot::Sender<()>,
) {
    let _exit = ExitGuard {
        id,
        shared: Arc::clone(&shared),
        failed,
        exited: Some(exited),
    };
    let mut apartment = Apartment::new(id, Arc::clone(&shared));

    tracing::debug!(worker = %id, "Affinity worker started");

    while let Some(item) = rx.blocking_recv() {
        shared.queued.fetch_sub(1, Ordering::AcqRel);

        if abort.load(Ordering::Acquire) {
            (item.task)(Dispatch::Skip(ExecutorError::ShuttingDown));
            continue;
        }

        // The caller has already been told the deadline passed; running the
        // item now would touch an instance nobody is waiting on.
        if item.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            tracing::debug!(worker = %id, "Skipping expired work item");
            (item.task)(Dispatch::Skip(ExecutorError::DeadlineElapsed));
            continue;
        }

        shared.busy.store(true, Ordering::Release);
        (item.task)(Dispatch::Run(&mut apartment));
        shared.busy.store(false, Ordering::Release);
    }

    apartment.quit_all();
}
