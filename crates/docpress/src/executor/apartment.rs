//! Per-thread home for application instances.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use super::WorkerId;
use super::worker::WorkerShared;
use crate::backend::{Application, InstanceId};

/// Context owned by exactly one affinity worker thread.
///
/// Work items receive `&mut Apartment`; instances stored here can only be
/// reached by work running on the same thread.
pub struct Apartment {
    worker: WorkerId,
    shared: Arc<WorkerShared>,
    instances: HashMap<InstanceId, Box<dyn Application>>,
}

impl Apartment {
    pub(super) fn new(worker: WorkerId, shared: Arc<WorkerShared>) -> Self {
        Self {
            worker,
            shared,
            instances: HashMap::new(),
        }
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn insert(&mut self, id: InstanceId, app: Box<dyn Application>) {
        if let Some(mut previous) = self.instances.insert(id, app) {
            tracing::error!(worker = %self.worker, instance = %id, "Bug: instance id reused, quitting previous");
            let _ = previous.quit();
        } else {
            self.shared.bound.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn get_mut(&mut self, id: InstanceId) -> Option<&mut (dyn Application + 'static)> {
        self.instances.get_mut(&id).map(|app| app.as_mut())
    }

    pub fn remove(&mut self, id: InstanceId) -> Option<Box<dyn Application>> {
        let app = self.instances.remove(&id)?;
        self.shared.bound.fetch_sub(1, Ordering::AcqRel);
        Some(app)
    }

    pub fn contains(&self, id: InstanceId) -> bool {
        self.instances.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Quit every instance still living here.
    pub(super) fn quit_all(&mut self) {
        let ids: Vec<InstanceId> = self.instances.keys().copied().collect();
        for id in ids {
            if let Some(mut app) = self.remove(id) {
                match app.quit() {
                    Ok(()) => {
                        tracing::debug!(worker = %self.worker, instance = %id, "Quit instance on worker exit")
                    }
                    Err(e) => {
                        tracing::warn!(worker = %self.worker, instance = %id, error = %e, "Failed to quit instance on worker exit")
                    }
                }
            }
        }
    }
}
