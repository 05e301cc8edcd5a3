//! Periodic health monitoring of pooled instances.
//!
//! Each tick: evict idle instances past `max_idle_age`, probe every remaining
//! idle instance through its owning worker, sample process resources, and
//! trim pools under resource pressure. The latest result is published on a
//! watch channel for the health endpoint.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;

use crate::executor::ExecutorError;
use crate::pool::{Abandoned, InstancePool};
use crate::resources::{ResourceSampler, ResourceUsage};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub max_idle_age: Duration,
    pub memory_limit_bytes: Option<u64>,
    pub handle_limit: Option<u64>,
    /// Live instances per pool kept when limits are exceeded.
    pub pressure_target: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            max_idle_age: Duration::from_secs(600),
            memory_limit_bytes: None,
            handle_limit: Some(4096),
            pressure_target: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheckResult {
    pub checked_at: String,
    pub resource_count: u64,
    pub memory_bytes: u64,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub probed: usize,
    pub unhealthy: usize,
    pub evicted: usize,
}

pub struct HealthMonitor {
    pools: Vec<InstancePool>,
    sampler: Arc<dyn ResourceSampler>,
    config: MonitorConfig,
    latest: watch::Sender<Option<HealthCheckResult>>,
}

impl HealthMonitor {
    pub fn new(
        pools: Vec<InstancePool>,
        sampler: Arc<dyn ResourceSampler>,
        config: MonitorConfig,
    ) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            pools,
            sampler,
            config,
            latest,
        }
    }

    /// Receiver that always holds the most recent result.
    pub fn subscribe(&self) -> watch::Receiver<Option<HealthCheckResult>> {
        self.latest.subscribe()
    }

    /// Tick until `shutdown` turns true or its sender goes away.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.config.interval.as_secs_f64(),
            pools = self.pools.len(),
            "Health monitor starting"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; nothing is pooled yet.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Health monitor stopping");
                        break;
                    }
                }
            }
        }
    }

    /// One full check. Public so callers can force a check.
    pub async fn tick(&self) -> HealthCheckResult {
        let mut evicted = 0;
        let mut probed = 0;
        let mut unhealthy = 0;

        for pool in &self.pools {
            evicted += pool.evict_stale(self.config.max_idle_age);

            for id in pool.idle_ids() {
                let Some(lease) = pool.checkout_for_probe(id) else {
                    continue;
                };
                probed += 1;

                let deadline = crate::deadline_after(Instant::now(), self.config.probe_timeout);
                match lease.run(deadline, |app| app.probe()).await {
                    Ok(Ok(())) => lease.release(true),
                    Ok(Err(e)) => {
                        tracing::warn!(kind = %pool.kind(), instance = %id, error = %e, "Health probe failed");
                        unhealthy += 1;
                        lease.release(false);
                    }
                    Err(ExecutorError::DeadlineElapsed) => match lease.abandon() {
                        Abandoned::Evicted => {
                            tracing::warn!(kind = %pool.kind(), instance = %id, "Health probe timed out");
                            unhealthy += 1;
                        }
                        Abandoned::NotStarted => {
                            tracing::debug!(kind = %pool.kind(), instance = %id, "Health probe skipped, worker busy");
                        }
                    },
                    Err(e) => {
                        tracing::warn!(kind = %pool.kind(), instance = %id, error = %e, "Health probe not delivered");
                        unhealthy += 1;
                        lease.release(false);
                    }
                }
            }
        }

        let usage = match self.sampler.sample() {
            Ok(usage) => usage,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to sample resource usage");
                ResourceUsage::default()
            }
        };

        let reason = self.pressure_reason(&usage);
        if let Some(reason) = &reason {
            tracing::warn!(
                reason = %reason,
                target = self.config.pressure_target,
                "Resource limit exceeded - trimming idle instances"
            );
            for pool in &self.pools {
                evicted += pool.trim_idle(self.config.pressure_target);
            }
        }

        let result = HealthCheckResult {
            checked_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            resource_count: usage.handle_count,
            memory_bytes: usage.memory_bytes,
            healthy: reason.is_none() && unhealthy == 0,
            reason,
            probed,
            unhealthy,
            evicted,
        };

        if result.healthy {
            tracing::debug!(
                probed,
                evicted,
                handles = usage.handle_count,
                memory_bytes = usage.memory_bytes,
                "Health check passed"
            );
        } else {
            tracing::warn!(
                probed,
                unhealthy,
                evicted,
                handles = usage.handle_count,
                memory_bytes = usage.memory_bytes,
                "Health check found problems"
            );
        }

        self.latest.send_replace(Some(result.clone()));
        result
    }

    fn pressure_reason(&self, usage: &ResourceUsage) -> Option<String> {
        if let Some(limit) = self.config.memory_limit_bytes
            && usage.memory_bytes > limit
        {
            return Some(format!(
                "memory {} bytes exceeds limit {}",
                usage.memory_bytes, limit
            ));
        }
        if let Some(limit) = self.config.handle_limit
            && usage.handle_count > limit
        {
            return Some(format!(
                "{} open handles exceeds limit {}",
                usage.handle_count, limit
            ));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DocumentKind, codes};
    use crate::executor::AffinityExecutor;
    use crate::pool::PoolConfig;
    use crate::test_support::{FakeFactory, RecordingReaper, Step};
    use std::sync::Mutex as StdMutex;

    struct FixedSampler(StdMutex<ResourceUsage>);

    impl FixedSampler {
        fn new(handle_count: u64, memory_bytes: u64) -> Arc<Self> {
            Arc::new(Self(StdMutex::new(ResourceUsage {
                handle_count,
                memory_bytes,
            })))
        }
    }

    impl ResourceSampler for FixedSampler {
        fn sample(&self) -> std::io::Result<ResourceUsage> {
            Ok(*self.0.lock().unwrap())
        }
    }

    struct Fixture {
        factory: Arc<FakeFactory>,
        reaper: Arc<RecordingReaper>,
        pool: InstancePool,
    }

    async fn fixture(idle: usize) -> Fixture {
        let factory = FakeFactory::new();
        let reaper = RecordingReaper::new();
        let executor = Arc::new(AffinityExecutor::new(idle.max(1)).unwrap());
        let pool = InstancePool::new(
            PoolConfig::new(DocumentKind::WordProcessor, idle.max(1)),
            executor,
            factory.clone(),
            reaper.clone(),
        );
        let mut leases = Vec::new();
        for _ in 0..idle {
            leases.push(pool.acquire(Duration::from_secs(1)).await.unwrap());
        }
        for lease in leases {
            lease.release(true);
        }
        Fixture {
            factory,
            reaper,
            pool,
        }
    }

    fn monitor(pool: &InstancePool, sampler: Arc<dyn ResourceSampler>, config: MonitorConfig) -> HealthMonitor {
        HealthMonitor::new(vec![pool.clone()], sampler, config)
    }

    #[tokio::test]
    async fn healthy_instances_are_kept() {
        let f = fixture(2).await;
        let m = monitor(&f.pool, FixedSampler::new(10, 1024), MonitorConfig::default());

        let result = m.tick().await;
        assert!(result.healthy);
        assert_eq!((result.probed, result.unhealthy, result.evicted), (2, 0, 0));
        assert_eq!(f.pool.idle_ids().len(), 2);
        assert_eq!(f.factory.probes(), 2);
        assert_eq!(m.subscribe().borrow().as_ref(), Some(&result));
    }

    #[tokio::test]
    async fn failed_probe_evicts() {
        let f = fixture(2).await;
        f.factory.script_probe([Step::Fail(codes::RPC_E_DISCONNECTED)]);
        let m = monitor(&f.pool, FixedSampler::new(10, 1024), MonitorConfig::default());

        let result = m.tick().await;
        assert!(!result.healthy);
        assert_eq!(result.unhealthy, 1);
        assert_eq!(f.pool.stats().live, 1);
        assert!(f.reaper.terminated().is_empty());
    }

    #[tokio::test]
    async fn hung_probe_is_evicted_and_reaped() {
        let f = fixture(1).await;
        f.factory.script_probe([Step::Sleep(Duration::from_millis(200))]);
        let config = MonitorConfig {
            probe_timeout: Duration::from_millis(30),
            ..MonitorConfig::default()
        };
        let m = monitor(&f.pool, FixedSampler::new(10, 1024), config);

        let result = m.tick().await;
        assert_eq!(result.unhealthy, 1);
        assert_eq!(f.pool.stats().live, 0);
        assert_eq!(f.reaper.terminated().len(), 1);
    }

    #[tokio::test]
    async fn stale_instances_are_evicted() {
        let f = fixture(2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let config = MonitorConfig {
            max_idle_age: Duration::from_millis(10),
            ..MonitorConfig::default()
        };
        let m = monitor(&f.pool, FixedSampler::new(10, 1024), config);

        let result = m.tick().await;
        assert_eq!((result.evicted, result.probed), (2, 0));
        assert_eq!(f.pool.stats().live, 0);
    }

    #[tokio::test]
    async fn memory_pressure_trims_pool() {
        let f = fixture(3).await;
        let config = MonitorConfig {
            memory_limit_bytes: Some(1000),
            pressure_target: 1,
            ..MonitorConfig::default()
        };
        let m = monitor(&f.pool, FixedSampler::new(10, 5000), config);

        let result = m.tick().await;
        assert!(!result.healthy);
        assert_eq!(result.evicted, 2);
        assert_eq!(
            result.reason.as_deref(),
            Some("memory 5000 bytes exceeds limit 1000")
        );
        assert_eq!(f.pool.stats().live, 1);
    }

    #[tokio::test]
    async fn handle_pressure_reason() {
        let f = fixture(1).await;
        let config = MonitorConfig {
            handle_limit: Some(5),
            ..MonitorConfig::default()
        };
        let m = monitor(&f.pool, FixedSampler::new(9, 0), config);

        let result = m.tick().await;
        assert_eq!(result.reason.as_deref(), Some("9 open handles exceeds limit 5"));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let f = fixture(1).await;
        let config = MonitorConfig {
            interval: Duration::from_millis(10),
            ..MonitorConfig::default()
        };
        let m = monitor(&f.pool, FixedSampler::new(1, 1), config);
        let mut latest = m.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(m.run(shutdown_rx));
        latest.changed().await.unwrap();
        assert!(latest.borrow().is_some());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn result_serializes() {
        let result = HealthCheckResult {
            checked_at: "2026-01-01T00:00:00.000Z".to_string(),
            resource_count: 42,
            memory_bytes: 1024,
            healthy: true,
            reason: None,
            probed: 2,
            unhealthy: 0,
            evicted: 1,
        };
        insta::assert_json_snapshot!(result, @r#"
        {
          "checked_at": "2026-01-01T00:00:00.000Z",
          "resource_count": 42,
          "memory_bytes": 1024,
          "healthy": true,
          "probed": 2,
          "unhealthy": 0,
          "evicted": 1
        }
        "#);
    }
}
