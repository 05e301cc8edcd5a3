//! Scripted fake backend and reaper for unit tests.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::thread::ThreadId;
use std::time::Duration;

use crate::backend::{
    Application, ApplicationFactory, DocumentId, DocumentKind, NativeError, ProcessToken,
};
use crate::cleanup::{ProcessReaper, ReapError};

/// One scripted outcome for a native call.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Fail(u32),
    /// Block the worker, then succeed.
    Sleep(Duration),
    Panic,
}

fn perform(step: Option<Step>) -> Result<(), NativeError> {
    match step {
        None => Ok(()),
        Some(Step::Fail(code)) => Err(NativeError::new(code, "scripted failure")),
        Some(Step::Sleep(duration)) => {
            std::thread::sleep(duration);
            Ok(())
        }
        Some(Step::Panic) => panic!("scripted panic"),
    }
}

#[derive(Default)]
struct Script(StdMutex<VecDeque<Step>>);

impl Script {
    fn push(&self, steps: impl IntoIterator<Item = Step>) {
        self.0.lock().unwrap().extend(steps);
    }

    fn next(&self) -> Option<Step> {
        self.0.lock().unwrap().pop_front()
    }
}

#[derive(Default)]
struct Counters {
    availability_checks: AtomicUsize,
    launches: AtomicUsize,
    quits: AtomicUsize,
    probes: AtomicUsize,
    exports: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    affinity_violations: AtomicUsize,
}

pub(crate) struct FakeFactory {
    unavailable: AtomicBool,
    availability_delay: StdMutex<Duration>,
    launch: Script,
    next_pid: AtomicU32,
    counters: Arc<Counters>,
    shared: Arc<FakeShared>,
}

/// State the instances need back from the factory.
#[derive(Default)]
struct FakeShared {
    export: Script,
    probe: Script,
    export_delay: StdMutex<Duration>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            unavailable: AtomicBool::new(false),
            availability_delay: StdMutex::new(Duration::ZERO),
            launch: Script::default(),
            next_pid: AtomicU32::new(40_000),
            counters: Arc::new(Counters::default()),
            shared: Arc::new(FakeShared::default()),
        })
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Every availability check blocks for `delay` before answering.
    pub fn set_availability_delay(&self, delay: Duration) {
        *self.availability_delay.lock().unwrap() = delay;
    }

    pub fn script_launch(&self, steps: impl IntoIterator<Item = Step>) {
        self.launch.push(steps);
    }

    pub fn script_export(&self, steps: impl IntoIterator<Item = Step>) {
        self.shared.export.push(steps);
    }

    pub fn script_probe(&self, steps: impl IntoIterator<Item = Step>) {
        self.shared.probe.push(steps);
    }

    /// Every export blocks its worker for `delay` before its scripted step.
    pub fn set_export_delay(&self, delay: Duration) {
        *self.shared.export_delay.lock().unwrap() = delay;
    }

    pub fn availability_checks(&self) -> usize {
        self.counters.availability_checks.load(Ordering::SeqCst)
    }

    pub fn launches(&self) -> usize {
        self.counters.launches.load(Ordering::SeqCst)
    }

    pub fn quits(&self) -> usize {
        self.counters.quits.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.counters.probes.load(Ordering::SeqCst)
    }

    pub fn exports(&self) -> usize {
        self.counters.exports.load(Ordering::SeqCst)
    }

    /// Highest number of exports running at the same instant.
    pub fn max_concurrent_exports(&self) -> usize {
        self.counters.max_active.load(Ordering::SeqCst)
    }

    /// Calls made on an instance from a thread other than its creator.
    pub fn affinity_violations(&self) -> usize {
        self.counters.affinity_violations.load(Ordering::SeqCst)
    }
}

impl ApplicationFactory for FakeFactory {
    fn launch(&self, _kind: DocumentKind) -> Result<Box<dyn Application>, NativeError> {
        self.counters.launches.fetch_add(1, Ordering::SeqCst);
        perform(self.launch.next())?;
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeApplication {
            owner: std::thread::current().id(),
            token: ProcessToken::fixed(pid),
            next_document: 0,
            counters: Arc::clone(&self.counters),
            shared: Arc::clone(&self.shared),
            _not_send: PhantomData,
        }))
    }

    fn is_available(&self) -> bool {
        self.counters
            .availability_checks
            .fetch_add(1, Ordering::SeqCst);
        let delay = *self.availability_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        !self.unavailable.load(Ordering::SeqCst)
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }
}

struct FakeApplication {
    owner: ThreadId,
    token: ProcessToken,
    next_document: u64,
    counters: Arc<Counters>,
    shared: Arc<FakeShared>,
    _not_send: PhantomData<Rc<()>>,
}

impl FakeApplication {
    fn check_thread(&self) {
        if std::thread::current().id() != self.owner {
            self.counters
                .affinity_violations
                .fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct ActiveExport<'a>(&'a Counters);

impl<'a> ActiveExport<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let now = counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_active.fetch_max(now, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for ActiveExport<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Application for FakeApplication {
    fn process_token(&self) -> ProcessToken {
        self.token.clone()
    }

    fn probe(&mut self) -> Result<(), NativeError> {
        self.check_thread();
        self.counters.probes.fetch_add(1, Ordering::SeqCst);
        perform(self.shared.probe.next())
    }

    fn open(&mut self, _input: &Path) -> Result<DocumentId, NativeError> {
        self.check_thread();
        self.next_document += 1;
        Ok(DocumentId(self.next_document))
    }

    fn export_pdf(&mut self, _document: DocumentId, output: &Path) -> Result<(), NativeError> {
        self.check_thread();
        let _active = ActiveExport::enter(&self.counters);
        self.counters.exports.fetch_add(1, Ordering::SeqCst);

        let delay = *self.shared.export_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        perform(self.shared.export.next())?;
        let _ = std::fs::write(output, b"%PDF-1.7\n");
        Ok(())
    }

    fn close(&mut self, _document: DocumentId) -> Result<(), NativeError> {
        self.check_thread();
        Ok(())
    }

    fn quit(&mut self) -> Result<(), NativeError> {
        self.check_thread();
        self.counters.quits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingReaper {
    terminated: StdMutex<Vec<u32>>,
}

impl RecordingReaper {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn terminated(&self) -> Vec<u32> {
        self.terminated.lock().unwrap().clone()
    }
}

impl ProcessReaper for RecordingReaper {
    fn terminate(&self, pid: u32, _owner: &ProcessToken) -> Result<(), ReapError> {
        self.terminated.lock().unwrap().push(pid);
        Ok(())
    }
}
