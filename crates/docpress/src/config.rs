//! Typed configuration for the conversion core.
//!
//! Durations serialize as fractional seconds. [`ConvertConfig::from_env`]
//! reads `DOCPRESS_*` variables on top of the defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::breaker::BreakerConfig;
use crate::classify::DEFAULT_TRANSIENT_CODES;
use crate::pool::recommended_pool_size;
use crate::resources::{cpu_count, system_memory_bytes};

/// Fallback when total memory cannot be read: sized for one instance.
const UNKNOWN_MEMORY_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Longest accepted timeout of any kind.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Shortest per-request conversion timeout.
pub const MIN_CONVERSION_TIMEOUT: Duration = Duration::from_millis(10);

/// Accept a per-request conversion timeout only within
/// [`MIN_CONVERSION_TIMEOUT`]..=[`MAX_TIMEOUT`].
pub fn check_conversion_timeout(timeout: Duration) -> Result<Duration, ConfigError> {
    if (MIN_CONVERSION_TIMEOUT..=MAX_TIMEOUT).contains(&timeout) {
        Ok(timeout)
    } else {
        Err(invalid("timeout", format!("{:?}", timeout)))
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

fn invalid(key: &'static str, value: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertConfig {
    pub word_pool_size: usize,
    pub spreadsheet_pool_size: usize,
    /// Affinity threads; defaults to one per pool slot.
    pub executor_threads: Option<usize>,
    #[serde(with = "secs")]
    pub conversion_timeout: Duration,
    #[serde(with = "secs")]
    pub acquire_timeout: Duration,
    #[serde(with = "secs")]
    pub launch_timeout: Duration,
    pub launch_attempts: u32,
    #[serde(with = "secs")]
    pub launch_backoff: Duration,
    #[serde(with = "secs")]
    pub probe_timeout: Duration,
    #[serde(with = "secs")]
    pub health_check_interval: Duration,
    #[serde(with = "secs")]
    pub max_idle_age: Duration,
    pub max_uses_per_instance: Option<u64>,
    pub memory_limit_bytes: Option<u64>,
    pub handle_limit: Option<u64>,
    /// Live instances kept per pool when resource limits are exceeded.
    pub pressure_target: usize,
    #[serde(with = "secs")]
    pub availability_ttl: Duration,
    /// Longest wait for one availability check.
    #[serde(with = "secs")]
    pub availability_timeout: Duration,
    #[serde(with = "secs")]
    pub shutdown_grace: Duration,
    pub office_breaker: BreakerConfig,
    pub transient_codes: Vec<u32>,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        let pool = recommended_pool_size(
            system_memory_bytes().unwrap_or(UNKNOWN_MEMORY_BYTES),
            cpu_count(),
        );
        Self {
            word_pool_size: pool,
            spreadsheet_pool_size: pool,
            executor_threads: None,
            conversion_timeout: Duration::from_secs(120),
            acquire_timeout: Duration::from_secs(30),
            launch_timeout: Duration::from_secs(60),
            launch_attempts: 2,
            launch_backoff: Duration::from_millis(500),
            probe_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(30),
            max_idle_age: Duration::from_secs(600),
            max_uses_per_instance: Some(200),
            memory_limit_bytes: None,
            handle_limit: Some(4096),
            pressure_target: 1,
            availability_ttl: Duration::from_secs(300),
            availability_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(10),
            office_breaker: BreakerConfig::office(),
            transient_codes: DEFAULT_TRANSIENT_CODES.to_vec(),
        }
    }
}

impl ConvertConfig {
    pub fn with_pool_sizes(mut self, word_processor: usize, spreadsheet: usize) -> Self {
        self.word_pool_size = word_processor;
        self.spreadsheet_pool_size = spreadsheet;
        self
    }

    pub fn with_executor_threads(mut self, threads: usize) -> Self {
        self.executor_threads = Some(threads);
        self
    }

    pub fn with_conversion_timeout(mut self, timeout: Duration) -> Self {
        self.conversion_timeout = timeout;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_launch_timeout(mut self, timeout: Duration) -> Self {
        self.launch_timeout = timeout;
        self
    }

    pub fn with_launch_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.launch_attempts = attempts;
        self.launch_backoff = backoff;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_max_uses(mut self, max_uses: Option<u64>) -> Self {
        self.max_uses_per_instance = max_uses;
        self
    }

    pub fn with_office_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.office_breaker = breaker;
        self
    }

    pub fn with_availability_ttl(mut self, ttl: Duration) -> Self {
        self.availability_ttl = ttl;
        self
    }

    pub fn with_availability_timeout(mut self, timeout: Duration) -> Self {
        self.availability_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Affinity threads to start: explicit setting or one per pool slot.
    pub fn executor_threads(&self) -> usize {
        self.executor_threads
            .unwrap_or(self.word_pool_size + self.spreadsheet_pool_size)
            .max(1)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let get = |key: &'static str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(|v| (key, v))
        };

        if let Some((key, v)) = get("DOCPRESS_WORD_POOL_SIZE") {
            config.word_pool_size = parse(key, &v)?;
        }
        if let Some((key, v)) = get("DOCPRESS_SPREADSHEET_POOL_SIZE") {
            config.spreadsheet_pool_size = parse(key, &v)?;
        }
        if let Some((key, v)) = get("DOCPRESS_EXECUTOR_THREADS") {
            config.executor_threads = Some(parse(key, &v)?);
        }
        if let Some((key, v)) = get("DOCPRESS_CONVERSION_TIMEOUT_SECS") {
            config.conversion_timeout = parse_secs(key, &v)?;
        }
        if let Some((key, v)) = get("DOCPRESS_ACQUIRE_TIMEOUT_SECS") {
            config.acquire_timeout = parse_secs(key, &v)?;
        }
        if let Some((key, v)) = get("DOCPRESS_LAUNCH_TIMEOUT_SECS") {
            config.launch_timeout = parse_secs(key, &v)?;
        }
        if let Some((key, v)) = get("DOCPRESS_LAUNCH_ATTEMPTS") {
            config.launch_attempts = parse(key, &v)?;
        }
        if let Some((key, v)) = get("DOCPRESS_HEALTH_CHECK_INTERVAL_SECS") {
            config.health_check_interval = parse_secs(key, &v)?;
        }
        if let Some((key, v)) = get("DOCPRESS_PROBE_TIMEOUT_SECS") {
            config.probe_timeout = parse_secs(key, &v)?;
        }
        if let Some((key, v)) = get("DOCPRESS_MAX_IDLE_SECS") {
            config.max_idle_age = parse_secs(key, &v)?;
        }
        if let Some((key, v)) = get("DOCPRESS_AVAILABILITY_TIMEOUT_SECS") {
            config.availability_timeout = parse_secs(key, &v)?;
        }
        if let Some((key, v)) = get("DOCPRESS_MAX_USES") {
            let uses: u64 = parse(key, &v)?;
            config.max_uses_per_instance = (uses > 0).then_some(uses);
        }
        if let Some((key, v)) = get("DOCPRESS_MEMORY_LIMIT_MB") {
            let mb: u64 = parse(key, &v)?;
            let bytes = mb.checked_mul(1024 * 1024).ok_or_else(|| invalid(key, &v))?;
            config.memory_limit_bytes = (bytes > 0).then_some(bytes);
        }
        if let Some((key, v)) = get("DOCPRESS_HANDLE_LIMIT") {
            let limit: u64 = parse(key, &v)?;
            config.handle_limit = (limit > 0).then_some(limit);
        }
        if let Some((key, v)) = get("DOCPRESS_BREAKER_THRESHOLD") {
            config.office_breaker.failure_threshold = parse(key, &v)?;
        }
        if let Some((key, v)) = get("DOCPRESS_BREAKER_RECOVERY_SECS") {
            config.office_breaker.recovery_timeout = parse_secs(key, &v)?;
        }
        if let Some((key, v)) = get("DOCPRESS_TRANSIENT_CODES") {
            config.transient_codes = v
                .split(',')
                .map(|code| parse_code(key, code.trim()))
                .collect::<Result<_, _>>()?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.word_pool_size == 0 {
            return Err(invalid("word_pool_size", "0"));
        }
        if self.spreadsheet_pool_size == 0 {
            return Err(invalid("spreadsheet_pool_size", "0"));
        }
        if self.launch_attempts == 0 {
            return Err(invalid("launch_attempts", "0"));
        }
        if self.office_breaker.failure_threshold == 0 {
            return Err(invalid("office_breaker.failure_threshold", "0"));
        }
        for (key, value) in [
            ("conversion_timeout", self.conversion_timeout),
            ("acquire_timeout", self.acquire_timeout),
            ("launch_timeout", self.launch_timeout),
            ("probe_timeout", self.probe_timeout),
            ("health_check_interval", self.health_check_interval),
            ("availability_timeout", self.availability_timeout),
        ] {
            if value.is_zero() {
                return Err(invalid(key, "0"));
            }
        }
        for (key, value) in [
            ("conversion_timeout", self.conversion_timeout),
            ("acquire_timeout", self.acquire_timeout),
            ("launch_timeout", self.launch_timeout),
            ("launch_backoff", self.launch_backoff),
            ("probe_timeout", self.probe_timeout),
            ("health_check_interval", self.health_check_interval),
            ("availability_timeout", self.availability_timeout),
            ("shutdown_grace", self.shutdown_grace),
        ] {
            if value > MAX_TIMEOUT {
                return Err(invalid(key, format!("{:?}", value)));
            }
        }
        if self.conversion_timeout < MIN_CONVERSION_TIMEOUT {
            return Err(invalid(
                "conversion_timeout",
                format!("{:?}", self.conversion_timeout),
            ));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(key, value))
}

fn parse_secs(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let secs: f64 = parse(key, value)?;
    Duration::try_from_secs_f64(secs).map_err(|_| invalid(key, value))
}

/// Decimal or `0x`-prefixed hex.
fn parse_code(key: &'static str, value: &str) -> Result<u32, ConfigError> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
        None => value.parse(),
    };
    parsed.map_err(|_| invalid(key, value))
}

/// Serde adapter: `Duration` as fractional seconds.
pub(crate) mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Host and port for the HTTP transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Ignore SIGTERM and wait for `POST /shutdown`.
    pub await_explicit_shutdown: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            await_explicit_shutdown: false,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(host) = lookup("DOCPRESS_HOST").filter(|h| !h.is_empty()) {
            config.host = host;
        }
        if let Some(port) = lookup("DOCPRESS_PORT") {
            config.port = parse("DOCPRESS_PORT", port.trim())?;
        }
        if let Some(flag) = lookup("DOCPRESS_AWAIT_EXPLICIT_SHUTDOWN") {
            config.await_explicit_shutdown = matches!(
                flag.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes"
            );
        }
        Ok(config)
    }
}
