//! docpress: pooled, thread-affine office automation for document-to-PDF conversion.

mod health;
mod version;

pub mod availability;
pub mod backend;
pub mod breaker;
pub mod classify;
pub mod cleanup;
pub mod config;
pub mod executor;
pub mod monitor;
pub mod pool;
pub mod registry;
pub mod resources;
pub mod service;
pub mod transport;

#[cfg(test)]
mod test_support;

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub use backend::{Application, ApplicationFactory, DocumentKind, NativeError};
pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use classify::{ErrorClassifier, FailureClass};
pub use cleanup::{ProcessReaper, SignalReaper};
pub use config::{ConfigError, ConvertConfig, ServerConfig};
pub use executor::{AffinityExecutor, ExecutorError};
pub use health::Health;
pub use pool::{InstanceLease, InstancePool, PoolConfig, PoolError};
pub use registry::{ConversionRegistry, ConversionState};
pub use service::{
    ConversionRequest, ConversionResult, ConversionService, ConvertError, ErrorKind,
    HealthSnapshot, ServiceError,
};
pub use version::{DOCPRESS_VERSION, VersionInfo};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::error!(lock = what, "Mutex poisoned, recovering");
        poisoned.into_inner()
    })
}

/// `start + timeout` without overflow: timeouts are capped at [`config::MAX_TIMEOUT`].
pub(crate) fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout.min(config::MAX_TIMEOUT))
        .unwrap_or(start)
}
