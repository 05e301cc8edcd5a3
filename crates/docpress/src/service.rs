//! ConversionService: transport-agnostic conversion lifecycle.
//!
//! This service owns:
//! - The affinity executor and one instance pool per document kind
//! - One circuit breaker per document kind
//! - The availability check, error classifier and in-flight registry
//! - Shutdown coordination
//!
//! Transports (HTTP, CLI, embedding callers) delegate to [`ConversionService::convert`]
//! or the never-failing [`ConversionService::convert_document`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::availability::AvailabilityCheck;
use crate::backend::{ApplicationFactory, DocumentKind, InstanceId, codes, convert_on_instance};
use crate::breaker::{BreakerOpen, BreakerSnapshot, CircuitBreaker, CircuitState};
use crate::classify::{ErrorClassifier, FailureClass};
use crate::cleanup::ProcessReaper;
use crate::config::{ConfigError, ConvertConfig, check_conversion_timeout};
use crate::executor::{AffinityExecutor, ExecutorError, ShutdownReport, WorkerStats};
use crate::health::Health;
use crate::lock_or_recover;
use crate::monitor::{HealthCheckResult, HealthMonitor, MonitorConfig};
use crate::pool::{Abandoned, InstancePool, PoolConfig, PoolError, PoolStats};
use crate::registry::{ConversionPhase, ConversionRegistry};
use crate::resources::ResourceSampler;
use crate::version::VersionInfo;

/// Error taxonomy reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PoolExhausted,
    Timeout,
    TransientResourceError,
    DeterministicContentError,
    BreakerOpen,
    Unavailable,
    Cancelled,
    InvalidRequest,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::Timeout => "timeout",
            ErrorKind::TransientResourceError => "transient_resource_error",
            ErrorKind::DeterministicContentError => "deterministic_content_error",
            ErrorKind::BreakerOpen => "breaker_open",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidRequest => "invalid_request",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConvertError {
    #[error("no {kind} instance available: {source}")]
    PoolExhausted { kind: DocumentKind, source: PoolError },
    #[error("conversion timed out after {after:?}")]
    Timeout { after: Duration },
    #[error("transient office failure: {message}")]
    Transient { message: String, code: Option<u32> },
    #[error("document cannot be converted: {message}")]
    Deterministic { message: String, code: Option<u32> },
    #[error(transparent)]
    BreakerOpen(#[from] BreakerOpen),
    #[error("office automation unavailable: {0}")]
    Unavailable(String),
    #[error("conversion cancelled")]
    Cancelled,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ConvertError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConvertError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            ConvertError::Timeout { .. } => ErrorKind::Timeout,
            ConvertError::Transient { .. } => ErrorKind::TransientResourceError,
            ConvertError::Deterministic { .. } => ErrorKind::DeterministicContentError,
            ConvertError::BreakerOpen(_) => ErrorKind::BreakerOpen,
            ConvertError::Unavailable(_) => ErrorKind::Unavailable,
            ConvertError::Cancelled => ErrorKind::Cancelled,
            ConvertError::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }

    /// Whether this outcome says the office application is unhealthy.
    pub fn counts_toward_breaker(&self) -> bool {
        matches!(
            self,
            ConvertError::Timeout { .. } | ConvertError::Transient { .. }
        )
    }

    fn transient(message: impl Into<String>) -> Self {
        ConvertError::Transient {
            message: message.into(),
            code: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to start affinity workers: {0}")]
    Executor(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    /// Caller-supplied id; generated when absent.
    pub id: Option<String>,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    /// Overrides the configured conversion timeout.
    pub timeout: Option<Duration>,
}

impl ConversionRequest {
    pub fn new(input_path: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            id: None,
            input_path: input_path.into(),
            output_path: output_path.into(),
            timeout: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionOutput {
    pub request_id: String,
    pub kind: DocumentKind,
    pub output_path: PathBuf,
    pub instance: InstanceId,
    pub elapsed: Duration,
}

/// Flat outcome of [`ConversionService::convert_document`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversionResult {
    pub request_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub elapsed_ms: u64,
}

impl ConversionResult {
    pub fn from_outcome(
        request_id: String,
        outcome: &Result<ConversionOutput, ConvertError>,
        elapsed: Duration,
    ) -> Self {
        let elapsed_ms = elapsed.as_millis() as u64;
        match outcome {
            Ok(output) => Self {
                request_id,
                success: true,
                output_path: Some(output.output_path.clone()),
                error_kind: None,
                error_message: None,
                elapsed_ms,
            },
            Err(e) => Self {
                request_id,
                success: false,
                output_path: None,
                error_kind: Some(e.kind()),
                error_message: Some(e.to_string()),
                elapsed_ms,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    /// Turned away before reaching an instance.
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct ServiceStats {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    rejected: AtomicU64,
}

impl ServiceStats {
    fn record(&self, outcome: &Result<ConversionOutput, ConvertError>) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            Ok(_) => &self.succeeded,
            Err(e) => match e.kind() {
                ErrorKind::Timeout => &self.timed_out,
                ErrorKind::Cancelled => &self.cancelled,
                ErrorKind::TransientResourceError | ErrorKind::DeterministicContentError => {
                    &self.failed
                }
                ErrorKind::PoolExhausted
                | ErrorKind::BreakerOpen
                | ErrorKind::Unavailable
                | ErrorKind::InvalidRequest => &self.rejected,
            },
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of service health for transports to query.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: Health,
    pub pools: Vec<PoolStats>,
    pub breakers: Vec<BreakerSnapshot>,
    pub workers: Vec<WorkerStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<HealthCheckResult>,
    pub in_flight: usize,
    pub stats: StatsSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available: Option<bool>,
    pub version: VersionInfo,
}

impl HealthSnapshot {
    pub fn is_ready(&self) -> bool {
        self.status == Health::Ready
    }
}

struct KindRuntime {
    pool: InstancePool,
    breaker: CircuitBreaker,
}

pub struct ConversionService {
    config: ConvertConfig,
    executor: Arc<AffinityExecutor>,
    word_processor: KindRuntime,
    spreadsheet: KindRuntime,
    classifier: ErrorClassifier,
    availability: AvailabilityCheck,
    registry: Arc<ConversionRegistry>,
    stats: ServiceStats,
    last_check: StdMutex<Option<watch::Receiver<Option<HealthCheckResult>>>>,
    version: VersionInfo,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ConversionService {
    pub fn new(
        config: ConvertConfig,
        factory: Arc<dyn ApplicationFactory>,
        reaper: Arc<dyn ProcessReaper>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;

        let executor = Arc::new(AffinityExecutor::new(config.executor_threads())?);
        let classifier = ErrorClassifier::new(config.transient_codes.iter().copied());

        let runtime = |kind: DocumentKind, capacity: usize| KindRuntime {
            pool: InstancePool::new(
                PoolConfig::new(kind, capacity)
                    .with_launch_timeout(config.launch_timeout)
                    .with_launch_retry(config.launch_attempts, config.launch_backoff)
                    .with_max_uses(config.max_uses_per_instance)
                    .with_classifier(classifier.clone()),
                Arc::clone(&executor),
                Arc::clone(&factory),
                Arc::clone(&reaper),
            ),
            breaker: CircuitBreaker::new(kind.as_str(), config.office_breaker),
        };
        let word_processor = runtime(DocumentKind::WordProcessor, config.word_pool_size);
        let spreadsheet = runtime(DocumentKind::Spreadsheet, config.spreadsheet_pool_size);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tracing::info!(
            word_pool_size = config.word_pool_size,
            spreadsheet_pool_size = config.spreadsheet_pool_size,
            executor_threads = executor.worker_count(),
            backend = %factory.describe(),
            "Conversion service created"
        );

        Ok(Self {
            availability: AvailabilityCheck::new(
                Arc::clone(&factory),
                config.availability_ttl,
                config.availability_timeout,
            ),
            version: VersionInfo::new().with_backend(factory.describe()),
            config,
            executor,
            word_processor,
            spreadsheet,
            classifier,
            registry: ConversionRegistry::new(),
            stats: ServiceStats::default(),
            last_check: StdMutex::new(None),
            shutdown_tx,
            shutdown_rx,
        })
    }

    fn runtime(&self, kind: DocumentKind) -> &KindRuntime {
        match kind {
            DocumentKind::WordProcessor => &self.word_processor,
            DocumentKind::Spreadsheet => &self.spreadsheet,
        }
    }

    fn runtimes(&self) -> [&KindRuntime; 2] {
        [&self.word_processor, &self.spreadsheet]
    }

    pub fn config(&self) -> &ConvertConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConversionRegistry> {
        &self.registry
    }

    pub fn pool(&self, kind: DocumentKind) -> &InstancePool {
        &self.runtime(kind).pool
    }

    pub fn breaker(&self, kind: DocumentKind) -> &CircuitBreaker {
        &self.runtime(kind).breaker
    }

    /// Start the periodic health monitor over both pools.
    pub fn spawn_health_monitor(
        &self,
        sampler: Arc<dyn ResourceSampler>,
    ) -> tokio::task::JoinHandle<()> {
        let monitor = HealthMonitor::new(
            self.runtimes().iter().map(|rt| rt.pool.clone()).collect(),
            sampler,
            MonitorConfig {
                interval: self.config.health_check_interval,
                probe_timeout: self.config.probe_timeout,
                max_idle_age: self.config.max_idle_age,
                memory_limit_bytes: self.config.memory_limit_bytes,
                handle_limit: self.config.handle_limit,
                pressure_target: self.config.pressure_target,
            },
        );
        *lock_or_recover(&self.last_check, "last health check") = Some(monitor.subscribe());
        tokio::spawn(monitor.run(self.shutdown_rx()))
    }

    /// Refresh (if stale) and return the availability answer.
    pub async fn check_availability(&self) -> bool {
        self.availability.is_available().await
    }

    /// Convert one document. `cancel` aborts the conversion from outside.
    pub async fn convert(
        &self,
        request: ConversionRequest,
        cancel: CancellationToken,
    ) -> Result<ConversionOutput, ConvertError> {
        let started = Instant::now();
        let request_id = request
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let outcome = self
            .convert_inner(&request_id, &request, cancel, started)
            .await;
        self.stats.record(&outcome);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(output) => tracing::info!(
                request_id = %request_id,
                kind = %output.kind,
                instance = %output.instance,
                elapsed_ms,
                "Conversion succeeded"
            ),
            Err(e) if e.kind() == ErrorKind::Cancelled => {
                tracing::info!(request_id = %request_id, elapsed_ms, "Conversion cancelled")
            }
            Err(e) => tracing::warn!(
                request_id = %request_id,
                error_kind = %e.kind(),
                error = %e,
                elapsed_ms,
                "Conversion failed"
            ),
        }
        outcome
    }

    async fn convert_inner(
        &self,
        request_id: &str,
        request: &ConversionRequest,
        cancel: CancellationToken,
        started: Instant,
    ) -> Result<ConversionOutput, ConvertError> {
        let shutting_down = *self.shutdown_rx.borrow();
        if shutting_down {
            return Err(ConvertError::Unavailable(
                "service is shutting down".to_string(),
            ));
        }

        let input = &request.input_path;
        let kind = DocumentKind::from_path(input).ok_or_else(|| ConvertError::Deterministic {
            message: format!("unsupported document type: {}", input.display()),
            code: None,
        })?;
        if !input.is_file() {
            return Err(ConvertError::Deterministic {
                message: format!("input document not found: {}", input.display()),
                code: Some(codes::DOCUMENT_NOT_FOUND),
            });
        }
        if let Some(parent) = request.output_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.is_dir()
        {
            return Err(ConvertError::InvalidRequest(format!(
                "output directory does not exist: {}",
                parent.display()
            )));
        }
        let timeout = match request.timeout {
            Some(timeout) => check_conversion_timeout(timeout)
                .map_err(|e| ConvertError::InvalidRequest(e.to_string()))?,
            None => self.config.conversion_timeout,
        };

        // Registry cancellation must not cancel the caller's token.
        let cancel = cancel.child_token();
        let registration = self
            .registry
            .register(
                request_id.to_string(),
                kind,
                input.clone(),
                request.output_path.clone(),
                cancel.clone(),
            )
            .map_err(|e| ConvertError::InvalidRequest(e.to_string()))?;

        let runtime = self.runtime(kind);
        let ticket = runtime.breaker.try_enter()?;

        let available = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                ticket.neutral();
                return Err(ConvertError::Cancelled);
            }
            available = self.availability.is_available() => available,
        };
        if !available {
            ticket.neutral();
            return Err(ConvertError::Unavailable(
                "office application is not installed or cannot be launched".to_string(),
            ));
        }

        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                ticket.neutral();
                return Err(ConvertError::Cancelled);
            }
            acquired = runtime.pool.acquire(self.config.acquire_timeout) => acquired,
        };
        let lease = match acquired {
            Ok(lease) => lease,
            Err(e) => {
                let error = pool_error(kind, e);
                if error.counts_toward_breaker() {
                    ticket.failure();
                } else {
                    ticket.neutral();
                }
                return Err(error);
            }
        };

        registration.set_phase(ConversionPhase::Converting);
        let instance = lease.id();
        let deadline = crate::deadline_after(Instant::now(), timeout);

        let work = {
            let input = input.clone();
            let output = request.output_path.clone();
            let cancel = cancel.clone();
            move |app: &mut dyn crate::backend::Application| {
                if cancel.is_cancelled() {
                    return Err(crate::backend::NativeError::new(
                        codes::RPC_E_CALL_REJECTED,
                        "cancelled before start",
                    ));
                }
                convert_on_instance(app, &input, &output)
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcome = lease.run(deadline, work) => Some(outcome),
        };

        match outcome {
            None => {
                lease.abandon();
                ticket.neutral();
                Err(ConvertError::Cancelled)
            }
            Some(Ok(Ok(()))) => {
                lease.release(true);
                ticket.success();
                Ok(ConversionOutput {
                    request_id: request_id.to_string(),
                    kind,
                    output_path: request.output_path.clone(),
                    instance,
                    elapsed: started.elapsed(),
                })
            }
            Some(Ok(Err(native))) => match self.classifier.classify(&native) {
                FailureClass::Transient => {
                    lease.release(false);
                    ticket.failure();
                    Err(ConvertError::Transient {
                        message: native.message,
                        code: Some(native.code),
                    })
                }
                FailureClass::Deterministic => {
                    lease.release(true);
                    ticket.neutral();
                    Err(ConvertError::Deterministic {
                        message: native.message,
                        code: Some(native.code),
                    })
                }
            },
            Some(Err(ExecutorError::DeadlineElapsed)) => {
                match lease.abandon() {
                    Abandoned::Evicted => ticket.failure(),
                    // Queued behind another instance's work; this one is fine.
                    Abandoned::NotStarted => ticket.neutral(),
                }
                Err(ConvertError::Timeout { after: timeout })
            }
            Some(Err(ExecutorError::ShuttingDown)) => {
                lease.release(false);
                ticket.neutral();
                Err(ConvertError::Unavailable(
                    "service is shutting down".to_string(),
                ))
            }
            Some(Err(e @ (ExecutorError::WorkerLost(_) | ExecutorError::UnknownWorker(_)))) => {
                lease.release(false);
                ticket.failure();
                Err(ConvertError::transient(e.to_string()))
            }
        }
    }

    /// Convert without ever failing: every outcome becomes a [`ConversionResult`].
    pub async fn convert_document(
        &self,
        input: &Path,
        output: &Path,
        timeout: Option<Duration>,
    ) -> ConversionResult {
        let started = Instant::now();
        let request_id = uuid::Uuid::new_v4().to_string();
        let mut request = ConversionRequest::new(input, output).with_id(request_id.clone());
        request.timeout = timeout;

        let outcome = self.convert(request, CancellationToken::new()).await;
        ConversionResult::from_outcome(request_id, &outcome, started.elapsed())
    }

    pub fn cancel(&self, id: &str) -> bool {
        self.registry.cancel(id)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn health(&self) -> HealthSnapshot {
        let pools: Vec<PoolStats> = self.runtimes().iter().map(|rt| rt.pool.stats()).collect();
        let breakers: Vec<BreakerSnapshot> = self
            .runtimes()
            .iter()
            .map(|rt| rt.breaker.snapshot())
            .collect();
        let last_check = lock_or_recover(&self.last_check, "last health check")
            .as_ref()
            .and_then(|rx| rx.borrow().clone());
        let available = self.availability.cached();
        let stats = self.stats.snapshot();

        let status = if *self.shutdown_rx.borrow() {
            Health::ShuttingDown
        } else if self.executor.is_failed() {
            Health::Defunct
        } else if available == Some(false) {
            Health::Unavailable
        } else if breakers.iter().any(|b| b.state != CircuitState::Closed)
            || last_check.as_ref().is_some_and(|c| !c.healthy)
        {
            Health::Degraded
        } else if available.is_none() && last_check.is_none() && stats.total == 0 {
            Health::Unknown
        } else if pools
            .iter()
            .all(|p| p.live >= p.capacity && p.idle == 0)
        {
            Health::Busy
        } else {
            Health::Ready
        };

        HealthSnapshot {
            status,
            pools,
            breakers,
            workers: self.executor.worker_stats(),
            last_check,
            in_flight: self.registry.len(),
            stats,
            available,
            version: self.version.clone(),
        }
    }

    /// Stop accepting conversions, close the pools and stop the workers.
    ///
    /// In-flight conversions get the configured grace period; anything still
    /// running afterwards is cancelled.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.trigger_shutdown();
        tracing::info!(in_flight = self.registry.len(), "Conversion service shutting down");

        for runtime in self.runtimes() {
            runtime.pool.close();
        }
        let report = self.executor.shutdown(self.config.shutdown_grace).await;
        if report.detached > 0 {
            let cancelled = self.registry.cancel_all();
            tracing::warn!(cancelled, "Cancelled conversions still running after grace period");
        }
        report
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }
}

fn pool_error(kind: DocumentKind, error: PoolError) -> ConvertError {
    match error {
        PoolError::Exhausted { .. } => ConvertError::PoolExhausted {
            kind,
            source: error,
        },
        PoolError::Launch { ref source, .. } => ConvertError::Transient {
            message: error.to_string(),
            code: Some(source.code),
        },
        PoolError::LaunchTimeout { .. } => ConvertError::transient(error.to_string()),
        PoolError::Closed | PoolError::Executor(ExecutorError::ShuttingDown) => {
            ConvertError::Unavailable("service is shutting down".to_string())
        }
        PoolError::Executor(e) => ConvertError::transient(e.to_string()),
    }
}
