//! Health status of the conversion service.

use serde::{Deserialize, Serialize};

/// Overall service health, derived from pools, breakers and the last check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    /// No health check has run yet
    #[default]
    Unknown,
    /// Accepting conversions with spare capacity
    Ready,
    /// Every pool slot is checked out
    Busy,
    /// A breaker is open or the last health check found problems
    Degraded,
    /// The office application is not installed or not launchable
    Unavailable,
    /// Shutdown in progress, new conversions rejected
    ShuttingDown,
    /// An affinity worker died; the executor cannot recover
    Defunct,
}

impl Health {
    /// Whether new conversions can be accepted at all.
    pub fn accepts_work(&self) -> bool {
        matches!(
            self,
            Health::Unknown | Health::Ready | Health::Busy | Health::Degraded
        )
    }
}
