//! Download configuration.
//!
//! Every field has a default, so a YAML file only needs the values it changes:
//!
//! ```yaml
//! max_pixels: 4000000
//! concurrency: 4
//! retry:
//!   max_attempts: 3
//! ```

use crate::{DemError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default per-request pixel budget of the 3DEP export service.
pub const DEFAULT_MAX_PIXELS: u64 = 8_000_000;

/// Default streaming chunk size (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Settings for tiled downloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Pixel budget per request.
    pub max_pixels: u64,
    /// Maximum number of tiles in flight at once.
    pub concurrency: usize,
    /// Bytes read from the network per write.
    pub chunk_size: usize,
    /// Keep existing non-empty target files instead of downloading them again.
    pub skip_existing: bool,
    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Timeout for a whole request, body included, in seconds.
    pub request_timeout_secs: u64,
    /// Idle connections kept per host.
    pub max_connections_per_host: usize,
    /// User-Agent header sent with every request.
    pub user_agent: String,
    /// Retry schedule for transient failures.
    pub retry: RetryPolicy,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_pixels: DEFAULT_MAX_PIXELS,
            concurrency: 4,
            chunk_size: DEFAULT_CHUNK_SIZE,
            skip_existing: true,
            connect_timeout_secs: 10,
            request_timeout_secs: 600,
            max_connections_per_host: 4,
            user_agent: concat!("seamless-dem/", env!("CARGO_PKG_VERSION")).to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

impl FetchConfig {
    /// Parse a YAML document and validate it.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_pixels == 0 {
            return Err(DemError::Config("max_pixels must be at least 1".to_string()));
        }
        if self.concurrency == 0 {
            return Err(DemError::Config("concurrency must be at least 1".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(DemError::Config("chunk_size must be at least 1".to_string()));
        }
        if self.connect_timeout_secs == 0 || self.request_timeout_secs == 0 {
            return Err(DemError::Config("timeouts must be at least 1 second".to_string()));
        }
        self.retry.validate()
    }
}

/// Bounded exponential backoff for transient tile failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per tile, the first included.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds. Doubles on every retry.
    pub base_delay_ms: u64,
    /// Upper bound on a single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Add up to this fraction of the delay as random jitter.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// A policy with `max_attempts` and a fixed short delay, handy for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 1,
            jitter: 0.0,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(DemError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(DemError::Config(format!(
                "retry.jitter must be within [0, 1], got {}",
                self.jitter
            )));
        }
        Ok(())
    }

    /// Delay before retry number `retry` (1 for the first retry), without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry.saturating_sub(1));
        let millis = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// Delay before retry number `retry`, jitter included.
    pub fn delay<R: rand::Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter <= 0.0 {
            return base;
        }
        let extra = base.as_secs_f64() * self.jitter * rng.gen::<f64>();
        base + Duration::from_secs_f64(extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = FetchConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.skip_existing);
        assert_eq!(config.chunk_size, 1024 * 1024);
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
max_pixels: 4000000
concurrency: 8
retry:
  max_attempts: 3
"#;
        let config = FetchConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.max_pixels, 4_000_000);
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.retry.max_attempts, 3);
        // Unspecified values keep their defaults
        assert_eq!(config.retry.base_delay_ms, 500);
        assert!(config.skip_existing);
    }

    #[test]
    fn test_invalid_yaml_values() {
        assert!(matches!(
            FetchConfig::from_yaml_str("concurrency: 0"),
            Err(DemError::Config(_))
        ));
        assert!(matches!(
            FetchConfig::from_yaml_str("retry:\n  jitter: 2.0"),
            Err(DemError::Config(_))
        ));
        assert!(matches!(
            FetchConfig::from_yaml_str("concurrency: [1, 2]"),
            Err(DemError::Yaml(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fetch.yaml");
        std::fs::write(&path, "max_pixels: 1000\nskip_existing: false\n").unwrap();

        let config = FetchConfig::from_file(&path).unwrap();
        assert_eq!(config.max_pixels, 1000);
        assert!(!config.skip_existing);

        assert!(matches!(
            FetchConfig::from_file(dir.path().join("missing.yaml")),
            Err(DemError::Io(_))
        ));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay(1), Duration::from_millis(500));
        assert_eq!(policy.base_delay(2), Duration::from_millis(1000));
        assert_eq!(policy.base_delay(3), Duration::from_millis(2000));
        assert_eq!(policy.base_delay(20), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::default();
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let delay = policy.delay(2, &mut rng);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(1250));
        }
    }
}
