//! Configuration management for Ratewarden.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Result, WardenError};
use crate::ratelimit::{
    LimiterConfig, LimiterConfigBuilder, DEFAULT_BURST_WINDOW_MS, DEFAULT_MAX_PENALTY_MS,
    DEFAULT_MESSAGE, DEFAULT_PENALTY_MULTIPLIER, DEFAULT_STATUS_CODE,
};
use crate::tier::Environment;

/// Prefix of environment variable overrides, e.g.
/// `RATEWARDEN__STORAGE__BACKEND=shared`.
pub const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration for the Ratewarden service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Limit policy defaults
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Believe `x-authenticated-user`/`x-authenticated-tier` on incoming
    /// requests. Only enable behind a gateway that sets or strips them.
    #[serde(default)]
    pub trust_identity_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            trust_identity_headers: false,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Where counters live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Shared key-value backend with local fallback
    Shared,
    /// Process memory only
    #[default]
    Local,
}

/// Counter storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Connection URL of the shared backend, e.g. `redis://127.0.0.1:6379`
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Namespace prepended to every shared key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on a single shared-backend command
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// How long a failed shared backend is left alone before a retry
    #[serde(default = "default_retry_primary_after")]
    pub retry_primary_after_secs: u64,

    /// Interval between sweeps of expired local counters
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            operation_timeout_ms: default_operation_timeout(),
            retry_primary_after_secs: default_retry_primary_after(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl StorageConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn retry_primary_after(&self) -> Duration {
        Duration::from_secs(self.retry_primary_after_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

fn default_operation_timeout() -> u64 {
    250
}

fn default_retry_primary_after() -> u64 {
    30
}

fn default_sweep_interval() -> u64 {
    60
}

/// Policy knobs shared by every limiter the service builds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Selects the preset row
    #[serde(default)]
    pub environment: Environment,

    /// Rejection message
    #[serde(default = "default_message")]
    pub message: String,

    /// Rejection status
    #[serde(default = "default_status_code")]
    pub status_code: u16,

    #[serde(default = "default_burst_window")]
    pub burst_window_ms: i64,

    #[serde(default = "default_penalty_multiplier")]
    pub penalty_multiplier: f64,

    #[serde(default = "default_max_penalty")]
    pub max_penalty_ms: i64,

    #[serde(default)]
    pub skip_successful: bool,

    #[serde(default)]
    pub skip_failed: bool,

    /// How long a looked-up account tier is trusted
    #[serde(default = "default_tier_cache_ttl")]
    pub tier_cache_ttl_secs: u64,

    /// YAML file replacing the built-in presets
    #[serde(default)]
    pub presets_path: Option<String>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            message: default_message(),
            status_code: default_status_code(),
            burst_window_ms: default_burst_window(),
            penalty_multiplier: default_penalty_multiplier(),
            max_penalty_ms: default_max_penalty(),
            skip_successful: false,
            skip_failed: false,
            tier_cache_ttl_secs: default_tier_cache_ttl(),
            presets_path: None,
        }
    }
}

impl LimitsConfig {
    /// A builder for `max_requests` per `window` carrying these defaults.
    pub fn limiter_builder(&self, window: Duration, max_requests: u64) -> LimiterConfigBuilder {
        LimiterConfig::builder(window, max_requests)
            .message(self.message.clone())
            .status_code(self.status_code)
            .burst_window(Duration::from_millis(self.burst_window_ms.max(0) as u64))
            .penalty_multiplier(self.penalty_multiplier)
            .max_penalty(Duration::from_millis(self.max_penalty_ms.max(0) as u64))
            .skip_successful(self.skip_successful)
            .skip_failed(self.skip_failed)
    }

    pub fn tier_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.tier_cache_ttl_secs)
    }
}

fn default_message() -> String {
    DEFAULT_MESSAGE.to_string()
}

fn default_status_code() -> u16 {
    DEFAULT_STATUS_CODE
}

fn default_burst_window() -> i64 {
    DEFAULT_BURST_WINDOW_MS
}

fn default_penalty_multiplier() -> f64 {
    DEFAULT_PENALTY_MULTIPLIER
}

fn default_max_penalty() -> i64 {
    DEFAULT_MAX_PENALTY_MS
}

fn default_tier_cache_ttl() -> u64 {
    60
}

impl WardenConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: WardenConfig =
            serde_yaml::from_str(&contents).map_err(|e| WardenError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional YAML file layered under
    /// `RATEWARDEN__*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::new(path, ::config::FileFormat::Yaml));
        }
        let settings = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: WardenConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.storage.backend == StorageBackend::Shared && self.storage.redis_url.is_none() {
            return Err(WardenError::Config(
                "storage.redis_url is required for the shared backend".to_string(),
            ));
        }
        if self.storage.key_prefix.is_empty() {
            return Err(WardenError::Config("storage.key_prefix must not be empty".to_string()));
        }
        if self.storage.operation_timeout_ms == 0 {
            return Err(WardenError::Config(
                "storage.operation_timeout_ms must be positive".to_string(),
            ));
        }
        if self.storage.sweep_interval_secs == 0 {
            return Err(WardenError::Config(
                "storage.sweep_interval_secs must be positive".to_string(),
            ));
        }

        // Catch bad policy knobs here rather than when the first limiter is built.
        self.limits
            .limiter_builder(Duration::from_secs(60), 1)
            .build()
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = WardenConfig::default();
        assert_eq!(config.server.listen_addr.to_string(), "127.0.0.1:8080");
        assert!(!config.server.trust_identity_headers);
        assert_eq!(config.storage.backend, StorageBackend::Local);
        assert_eq!(config.storage.key_prefix, "ratelimit");
        assert_eq!(config.storage.operation_timeout(), Duration::from_millis(250));
        assert_eq!(config.limits.environment, Environment::Development);
        assert_eq!(config.limits.status_code, 429);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_file_partial_yaml() {
        let mut file = tempfile_path("partial");
        writeln!(
            file.1,
            "storage:\n  backend: shared\n  redis_url: redis://127.0.0.1:6379\nlimits:\n  environment: prod\n  skip_failed: true"
        )
        .unwrap();

        let config = WardenConfig::from_file(file.0.to_str().unwrap()).unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Shared);
        assert_eq!(config.storage.sweep_interval_secs, 60);
        assert_eq!(config.limits.environment, Environment::Production);
        assert!(config.limits.skip_failed);
        assert_eq!(config.server.listen_addr.port(), 8080);
        std::fs::remove_file(file.0).ok();
    }

    #[test]
    fn test_identity_header_trust_is_opt_in() {
        let mut file = tempfile_path("trust");
        writeln!(file.1, "server:\n  listen_addr: 0.0.0.0:9000").unwrap();
        let config = WardenConfig::from_file(file.0.to_str().unwrap()).unwrap();
        assert!(!config.server.trust_identity_headers);

        std::fs::write(&file.0, "server:\n  trust_identity_headers: true\n").unwrap();
        let config = WardenConfig::from_file(file.0.to_str().unwrap()).unwrap();
        assert!(config.server.trust_identity_headers);
        assert_eq!(config.server.listen_addr.port(), 8080);
        std::fs::remove_file(file.0).ok();
    }

    #[test]
    fn test_shared_backend_needs_url() {
        let mut config = WardenConfig::default();
        config.storage.backend = StorageBackend::Shared;
        assert!(matches!(config.validate(), Err(WardenError::Config(_))));
    }

    #[test]
    fn test_bad_policy_knobs_rejected() {
        let mut config = WardenConfig::default();
        config.limits.penalty_multiplier = 0.5;
        assert!(matches!(
            config.validate(),
            Err(WardenError::InvalidConfiguration(_))
        ));

        let mut config = WardenConfig::default();
        config.limits.status_code = 302;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_with_env_override() {
        let file = tempfile_path("layered");
        std::fs::write(&file.0, "limits:\n  status_code: 503\n").unwrap();

        std::env::set_var("RATEWARDEN__STORAGE__KEY_PREFIX", "edge");
        let config = WardenConfig::load(file.0.to_str()).unwrap();
        std::env::remove_var("RATEWARDEN__STORAGE__KEY_PREFIX");

        assert_eq!(config.limits.status_code, 503);
        assert_eq!(config.storage.key_prefix, "edge");
        std::fs::remove_file(file.0).ok();
    }

    #[test]
    fn test_limiter_builder_carries_defaults() {
        let limits = LimitsConfig {
            message: "calm down".to_string(),
            skip_successful: true,
            ..Default::default()
        };
        let config = limits
            .limiter_builder(Duration::from_secs(30), 10)
            .build()
            .unwrap();
        assert_eq!(config.message, "calm down");
        assert!(config.skip_successful);
        assert_eq!(config.window_ms, 30_000);
    }

    fn tempfile_path(name: &str) -> (std::path::PathBuf, std::fs::File) {
        let path = std::env::temp_dir().join(format!(
            "ratewarden-{}-{}.yaml",
            name,
            std::process::id()
        ));
        let file = std::fs::File::create(&path).unwrap();
        (path, file)
    }
}
