//! Configuration management for vetsync
//!
//! Handles loading and validation of `vetsync.toml`. Every section is
//! optional; missing sections fall back to defaults.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::admission::AdmissionConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::ConfigError;
use crate::logging::LogConfig;
use crate::priority::OperationClass;
use crate::retry::RetryPolicy;
use crate::token_bucket::BucketConfig;

/// Config file name looked up in the platform config directory.
pub const CONFIG_FILE_NAME: &str = "vetsync.toml";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub logging: LogConfig,

    /// Device-side settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Mutation queue settings
    #[serde(default)]
    pub queue: QueueConfig,

    /// Delivery backoff settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// Server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Circuit breakers, rate limits and admission
    #[serde(default)]
    pub resilience: ResilienceConfig,
}

impl Config {
    /// Load configuration.
    ///
    /// With an explicit path the file must exist. Without one, the platform
    /// config directory is consulted and defaults are used when no file is
    /// present there.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::FileNotFound(path.display().to_string()));
                }
                path.to_path_buf()
            }
            None => match default_config_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };

        let raw = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        let config = Self::from_toml(&raw)?;
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(raw).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed(e.to_string()))
    }

    /// Reject values that would disable a safety bound.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if self.queue.max_attempts == 0 {
            return invalid("queue.max_attempts must be >= 1");
        }
        if self.queue.max_payload_bytes == 0 {
            return invalid("queue.max_payload_bytes must be >= 1");
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return invalid("retry.initial_delay_ms must not exceed retry.max_delay_ms");
        }
        if !self.retry.backoff_factor.is_finite() || self.retry.backoff_factor < 1.0 {
            return invalid("retry.backoff_factor must be a finite number >= 1.0");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_percent) {
            return invalid("retry.jitter_percent must be within 0.0..=1.0");
        }
        if self.client.caller_id.trim().is_empty() {
            return invalid("client.caller_id must not be empty");
        }
        self.resilience.validate()
    }

    /// Path of the client queue database.
    #[must_use]
    pub fn queue_db_path(&self) -> PathBuf {
        self.client.data_dir.join("queue.db")
    }
}

/// Platform config file location, if a config directory exists.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("vetsync").join(CONFIG_FILE_NAME))
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vetsync")
}

// =============================================================================
// Client
// =============================================================================

/// Device-side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Directory holding the durable queue
    pub data_dir: PathBuf,
    /// Base URL of the mutation server
    pub server_url: String,
    /// Caller identity presented to the server's rate limiter
    pub caller_id: String,
    /// Per-delivery timeout; a timeout counts as a retryable failure
    pub request_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            server_url: "http://127.0.0.1:8787".to_string(),
            caller_id: "device-local".to_string(),
            request_timeout_ms: 15_000,
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Mutation queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Delivery attempts before an item is surfaced as failed
    pub max_attempts: u32,
    /// Largest accepted serialized payload
    pub max_payload_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_payload_bytes: 64 * 1024,
        }
    }
}

/// Delivery backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub jitter_percent: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 300_000,
            backoff_factor: 2.0,
            jitter_percent: 0.2,
        }
    }
}

impl RetryConfig {
    /// Build the backoff policy described by this section.
    #[must_use]
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.backoff_factor,
            self.jitter_percent,
        )
    }
}

// =============================================================================
// Server
// =============================================================================

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for the HTTP surface
    pub listen: String,
    /// Backing store database path
    pub db_path: PathBuf,
    /// Upper bound on a single store write, including admission wait
    pub request_timeout_ms: u64,
    /// Minimum age before an idempotency record may be purged
    pub ledger_retention_days: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8787".to_string(),
            db_path: default_data_dir().join("server.db"),
            request_timeout_ms: 10_000,
            ledger_retention_days: 30,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn ledger_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.ledger_retention_days) * 86_400)
    }
}

// =============================================================================
// Resilience
// =============================================================================

/// Serializable breaker thresholds for one operation class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Failures within the monitoring window that open the circuit
    pub failure_threshold: u32,
    pub monitoring_window_ms: u64,
    /// Time spent open before trial requests are allowed
    pub recovery_timeout_ms: u64,
    /// Trial requests admitted while half-open
    pub half_open_max_trials: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            monitoring_window_ms: 30_000,
            recovery_timeout_ms: 15_000,
            half_open_max_trials: 2,
        }
    }
}

impl BreakerSettings {
    #[must_use]
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(
            self.failure_threshold,
            Duration::from_millis(self.monitoring_window_ms),
            Duration::from_millis(self.recovery_timeout_ms),
            self.half_open_max_trials,
        )
    }
}

/// Circuit breaker defaults plus per-class overrides keyed by class name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerTable {
    pub default: BreakerSettings,
    pub classes: BTreeMap<String, BreakerSettings>,
}

impl Default for BreakerTable {
    fn default() -> Self {
        let background = BreakerSettings {
            failure_threshold: 3,
            ..BreakerSettings::default()
        };
        let mut classes = BTreeMap::new();
        classes.insert(OperationClass::Analytics.as_str().to_string(), background.clone());
        classes.insert(OperationClass::Batch.as_str().to_string(), background);
        Self {
            default: BreakerSettings::default(),
            classes,
        }
    }
}

/// Rate limit defaults plus per-class overrides keyed by class name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitTable {
    pub default: BucketConfig,
    pub classes: BTreeMap<String, BucketConfig>,
}

impl Default for RateLimitTable {
    fn default() -> Self {
        // Writes get a deeper bucket so a reconnecting device can flush its
        // backlog without tripping the limiter on the first few items.
        let writes = BucketConfig {
            capacity: 60.0,
            refill_rate: 20.0,
            start_empty: false,
        };
        let mut classes = BTreeMap::new();
        classes.insert(
            OperationClass::AdministrationWrite.as_str().to_string(),
            writes.clone(),
        );
        classes.insert(OperationClass::InventoryWrite.as_str().to_string(), writes);
        Self {
            default: BucketConfig {
                capacity: 30.0,
                refill_rate: 10.0,
                start_empty: false,
            },
            classes,
        }
    }
}

/// Resilience layer configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ResilienceConfig {
    pub breaker: BreakerTable,
    pub rate_limit: RateLimitTable,
    pub admission: AdmissionConfig,
}

fn positive_finite(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

impl ResilienceConfig {
    /// Breaker configuration for a class, honoring overrides.
    #[must_use]
    pub fn breaker_for(&self, class: OperationClass) -> CircuitBreakerConfig {
        self.breaker
            .classes
            .get(class.as_str())
            .unwrap_or(&self.breaker.default)
            .to_breaker_config()
    }

    /// Bucket configuration for a class, honoring overrides.
    #[must_use]
    pub fn bucket_for(&self, class: OperationClass) -> BucketConfig {
        self.rate_limit
            .classes
            .get(class.as_str())
            .unwrap_or(&self.rate_limit.default)
            .clone()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for name in self
            .breaker
            .classes
            .keys()
            .chain(self.rate_limit.classes.keys())
        {
            name.parse::<OperationClass>()
                .map_err(ConfigError::ValidationError)?;
        }
        for class in OperationClass::ALL {
            let bucket = self.bucket_for(class);
            if !positive_finite(bucket.capacity) || !positive_finite(bucket.refill_rate) {
                return Err(ConfigError::ValidationError(format!(
                    "rate limit for {class} must have finite, positive capacity and refill_rate"
                )));
            }
        }
        if self.admission.max_concurrent == 0 {
            return Err(ConfigError::ValidationError(
                "resilience.admission.max_concurrent must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.queue.max_attempts, 5);
        assert_eq!(config.resilience.admission.max_concurrent, 8);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config = Config::from_toml(
            r#"
            [queue]
            max_attempts = 3

            [resilience.admission]
            max_concurrent = 2
            queue_capacity = 4
            max_wait_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.queue.max_payload_bytes, 64 * 1024);
        assert_eq!(config.resilience.admission.max_concurrent, 2);
        assert_eq!(config.retry.initial_delay_ms, 1_000);
    }

    #[test]
    fn zero_attempts_rejected() {
        let err = Config::from_toml("[queue]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn inverted_delays_rejected() {
        let err =
            Config::from_toml("[retry]\ninitial_delay_ms = 10\nmax_delay_ms = 5\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn unknown_class_override_rejected() {
        let err = Config::from_toml(
            "[resilience.breaker.classes.telepathy]\nfailure_threshold = 2\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn class_overrides_apply() {
        let config = Config::from_toml(
            r#"
            [resilience.breaker.classes.administration_write]
            failure_threshold = 9
            recovery_timeout_ms = 1000
            "#,
        )
        .unwrap();
        let admin = config
            .resilience
            .breaker_for(OperationClass::AdministrationWrite);
        assert_eq!(admin.failure_threshold, 9);
        assert_eq!(admin.recovery_timeout, Duration::from_secs(1));

        let read = config.resilience.breaker_for(OperationClass::Read);
        assert_eq!(read.failure_threshold, 5);
        // Built-in override for batch survives a partial table.
        let batch = config.resilience.breaker_for(OperationClass::Batch);
        assert_eq!(batch.failure_threshold, 3);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = Config::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vetsync.toml");
        std::fs::write(&path, "[client]\ncaller_id = \"clinic-3\"\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.client.caller_id, "clinic-3");
    }

    #[test]
    fn toml_roundtrip() {
        let config = Config::default();
        let text = config.to_toml().unwrap();
        let back = Config::from_toml(&text).unwrap();
        assert_eq!(back.queue.max_attempts, config.queue.max_attempts);
        assert_eq!(back.server.listen, config.server.listen);
    }

    #[test]
    fn non_finite_rates_are_rejected() {
        for bucket in [
            "capacity = nan\nrefill_rate = 1.0",
            "capacity = 10.0\nrefill_rate = nan",
            "capacity = inf\nrefill_rate = 1.0",
        ] {
            let text = format!("[resilience.rate_limit.classes.read]\n{bucket}\n");
            let err = Config::from_toml(&text).unwrap_err();
            assert!(matches!(err, ConfigError::ValidationError(_)), "{bucket}: {err}");
        }

        let err = Config::from_toml("[retry]\nbackoff_factor = nan\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
