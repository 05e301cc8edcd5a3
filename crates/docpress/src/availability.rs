//! Cached "is the office application installed" check.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use crate::backend::ApplicationFactory;
use crate::lock_or_recover;

pub struct AvailabilityCheck {
    ttl: Duration,
    timeout: Duration,
    factory: Arc<dyn ApplicationFactory>,
    cached: StdMutex<Option<(Instant, bool)>>,
    /// Held while a refresh runs so concurrent callers share its answer.
    refresh: tokio::sync::Mutex<()>,
}

impl AvailabilityCheck {
    pub fn new(factory: Arc<dyn ApplicationFactory>, ttl: Duration, timeout: Duration) -> Self {
        Self {
            ttl,
            timeout,
            factory,
            cached: StdMutex::new(None),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    /// Cached answer, refreshed on a blocking thread once the TTL expires.
    ///
    /// A check that does not answer within the timeout counts as unavailable.
    pub async fn is_available(&self) -> bool {
        if let Some(available) = self.cached() {
            return available;
        }

        let _refreshing = self.refresh.lock().await;
        if let Some(available) = self.cached() {
            return available;
        }

        let factory = Arc::clone(&self.factory);
        let check = tokio::task::spawn_blocking(move || factory.is_available());
        let available = match tokio::time::timeout(self.timeout, check).await {
            Ok(Ok(available)) => available,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Availability check panicked");
                false
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.timeout.as_secs_f64(),
                    "Availability check timed out"
                );
                false
            }
        };

        let previous = lock_or_recover(&self.cached, "availability")
            .replace((Instant::now(), available))
            .map(|(_, was)| was);
        if previous != Some(available) {
            if available {
                tracing::info!(backend = %self.factory.describe(), "Office application available");
            } else {
                tracing::warn!(backend = %self.factory.describe(), "Office application not available");
            }
        }
        available
    }

    /// Last answer if it is still fresh.
    pub fn cached(&self) -> Option<bool> {
        let cached = lock_or_recover(&self.cached, "availability");
        match *cached {
            Some((at, available)) if at.elapsed() < self.ttl => Some(available),
            _ => None,
        }
    }

    pub fn invalidate(&self) {
        lock_or_recover(&self.cached, "availability").take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeFactory;

    #[tokio::test]
    async fn caches_within_ttl() {
        let factory = FakeFactory::new();
        let check = AvailabilityCheck::new(factory.clone(), Duration::from_secs(60), Duration::from_secs(5));

        assert!(check.is_available().await);
        factory.set_available(false);
        assert!(check.is_available().await);
        assert_eq!(factory.availability_checks(), 1);

        check.invalidate();
        assert!(!check.is_available().await);
        assert_eq!(factory.availability_checks(), 2);
    }

    #[tokio::test]
    async fn expires_after_ttl() {
        let factory = FakeFactory::new();
        let check = AvailabilityCheck::new(factory.clone(), Duration::from_millis(20), Duration::from_secs(5));

        assert!(check.is_available().await);
        factory.set_available(false);
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(check.cached(), None);
        assert!(!check.is_available().await);
        assert_eq!(check.cached(), Some(false));
    }

    #[tokio::test]
    async fn slow_check_times_out_as_unavailable() {
        let factory = FakeFactory::new();
        factory.set_availability_delay(Duration::from_millis(500));
        let check =
            AvailabilityCheck::new(factory.clone(), Duration::from_secs(60), Duration::from_millis(50));

        let started = Instant::now();
        assert!(!check.is_available().await);
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(check.cached(), Some(false));
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_check() {
        let factory = FakeFactory::new();
        factory.set_availability_delay(Duration::from_millis(50));
        let check =
            AvailabilityCheck::new(factory.clone(), Duration::from_secs(60), Duration::from_secs(5));

        let results = futures::future::join_all((0..5).map(|_| check.is_available())).await;
        assert!(results.into_iter().all(|available| available));
        assert_eq!(factory.availability_checks(), 1);
    }
}
