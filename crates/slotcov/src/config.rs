//! Coverage configuration
//!
//! Loaded from YAML, adjusted by `SLOTCOV_*` environment variables, or built
//! in code with [`CoverageConfig::builder`].
//!
//! ```yaml
//! project: calculator
//! data_dir: target/slotcov/data
//! registry_dir: target/slotcov/registry
//! per_test: true
//! flush_policy:
//!   mode: threaded
//!   millis: 1000
//! max_version_lag: 5
//! logging:
//!   filter: slotcov=debug
//!   json: false
//! ```

use crate::result::{CoverageError, CoverageResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Shortest flush interval honoured; shorter values are raised to this
pub const MIN_FLUSH_INTERVAL_MS: u64 = 200;

/// Environment variable overriding [`CoverageConfig::data_dir`]
pub const ENV_DATA_DIR: &str = "SLOTCOV_DATA_DIR";

/// Environment variable overriding [`CoverageConfig::per_test`]
pub const ENV_PER_TEST: &str = "SLOTCOV_PER_TEST";

/// Environment variable overriding the flush interval
pub const ENV_FLUSH_INTERVAL_MS: &str = "SLOTCOV_FLUSH_INTERVAL_MS";

/// When a session writes its data point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FlushPolicy {
    /// Only on explicit flush and at shutdown
    #[default]
    Directed,
    /// When a caller-driven `maybe_flush` finds the interval elapsed
    Interval {
        /// Minimum time between flushes
        millis: u64,
    },
    /// From a background thread every interval
    Threaded {
        /// Time between flushes
        millis: u64,
    },
}

impl FlushPolicy {
    /// Flush interval, clamped to [`MIN_FLUSH_INTERVAL_MS`]
    #[must_use]
    pub fn interval(self) -> Option<Duration> {
        match self {
            Self::Directed => None,
            Self::Interval { millis } | Self::Threaded { millis } => {
                Some(Duration::from_millis(millis.max(MIN_FLUSH_INTERVAL_MS)))
            }
        }
    }

    /// The same policy with its interval clamped
    #[must_use]
    pub fn clamped(self) -> Self {
        match self {
            Self::Directed => Self::Directed,
            Self::Interval { millis } => Self::Interval {
                millis: millis.max(MIN_FLUSH_INTERVAL_MS),
            },
            Self::Threaded { millis } => Self::Threaded {
                millis: millis.max(MIN_FLUSH_INTERVAL_MS),
            },
        }
    }

    fn with_millis(self, millis: u64) -> Self {
        match self {
            Self::Directed | Self::Interval { .. } => Self::Interval { millis },
            Self::Threaded { .. } => Self::Threaded { millis },
        }
    }
}

/// Tracing subscriber settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive, used when `RUST_LOG` is unset
    pub filter: String,
    /// Emit JSON lines instead of compact text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "slotcov=info".to_string(),
            json: false,
        }
    }
}

/// Coverage collection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverageConfig {
    /// Project identity; names registry and data point files
    pub project: String,
    /// Where data points are written
    pub data_dir: PathBuf,
    /// Where registry versions are stored
    pub registry_dir: PathBuf,
    /// Record per-test coverage
    pub per_test: bool,
    /// When to write data points
    pub flush_policy: FlushPolicy,
    /// Counter slots to reserve up front (the registry size wins if larger)
    pub initial_capacity: usize,
    /// Skip data points this many registry versions behind during merge
    pub max_version_lag: Option<u64>,
    /// Logging
    pub logging: LoggingConfig,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            project: "default".to_string(),
            data_dir: PathBuf::from(".slotcov/data"),
            registry_dir: PathBuf::from(".slotcov/registry"),
            per_test: true,
            flush_policy: FlushPolicy::Directed,
            initial_capacity: 0,
            max_version_lag: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl CoverageConfig {
    /// Create a builder for coverage config
    #[must_use]
    pub fn builder() -> CoverageConfigBuilder {
        CoverageConfigBuilder::default()
    }

    /// Parse YAML; missing keys take their defaults
    ///
    /// # Errors
    ///
    /// `Config` if the YAML does not parse or the project is empty.
    pub fn from_yaml_str(yaml: &str) -> CoverageResult<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml).map_err(|e| CoverageError::Config {
            message: format!("invalid coverage config: {e}"),
        })?;
        config.normalized()
    }

    /// Read and parse a YAML file
    ///
    /// # Errors
    ///
    /// I/O failure or any [`CoverageConfig::from_yaml_str`] error.
    pub fn from_yaml_file(path: &Path) -> CoverageResult<Self> {
        Self::from_yaml_str(&std::fs::read_to_string(path)?)
    }

    /// Apply `SLOTCOV_*` overrides from the process environment
    ///
    /// # Errors
    ///
    /// `Config` if a variable holds an unparseable value.
    pub fn apply_env_overrides(self) -> CoverageResult<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `SLOTCOV_*` overrides from an arbitrary lookup
    ///
    /// # Errors
    ///
    /// `Config` if a variable holds an unparseable value.
    pub fn apply_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> CoverageResult<Self> {
        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|v| !v.is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(value) = lookup(ENV_PER_TEST) {
            self.per_test = match value.trim().to_ascii_lowercase().as_str() {
                "on" | "true" | "1" => true,
                "off" | "false" | "none" | "0" => false,
                other => {
                    return Err(CoverageError::Config {
                        message: format!("{ENV_PER_TEST}: expected on|off, got {other:?}"),
                    })
                }
            };
        }
        if let Some(value) = lookup(ENV_FLUSH_INTERVAL_MS) {
            let millis: u64 = value.trim().parse().map_err(|_| CoverageError::Config {
                message: format!("{ENV_FLUSH_INTERVAL_MS}: expected milliseconds, got {value:?}"),
            })?;
            self.flush_policy = self.flush_policy.with_millis(millis);
        }
        self.normalized()
    }

    fn normalized(mut self) -> CoverageResult<Self> {
        if self.project.trim().is_empty() {
            return Err(CoverageError::Config {
                message: "project must not be empty".to_string(),
            });
        }
        self.flush_policy = self.flush_policy.clamped();
        Ok(self)
    }
}

/// Builder for coverage configuration
#[derive(Debug, Default)]
pub struct CoverageConfigBuilder {
    config: CoverageConfig,
}

impl CoverageConfigBuilder {
    /// Set the project identity
    #[must_use]
    pub fn project(mut self, project: &str) -> Self {
        self.config.project = project.to_string();
        self
    }

    /// Set the data point directory
    #[must_use]
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    /// Set the registry directory
    #[must_use]
    pub fn registry_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.registry_dir = dir.into();
        self
    }

    /// Enable per-test recording
    #[must_use]
    pub fn per_test(mut self, enabled: bool) -> Self {
        self.config.per_test = enabled;
        self
    }

    /// Set the flush policy
    #[must_use]
    pub fn flush_policy(mut self, policy: FlushPolicy) -> Self {
        self.config.flush_policy = policy;
        self
    }

    /// Reserve counter slots up front
    #[must_use]
    pub fn initial_capacity(mut self, slots: usize) -> Self {
        self.config.initial_capacity = slots;
        self
    }

    /// Set the merge staleness window
    #[must_use]
    pub fn max_version_lag(mut self, lag: u64) -> Self {
        self.config.max_version_lag = Some(lag);
        self
    }

    /// Set logging options
    #[must_use]
    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.config.logging = logging;
        self
    }

    /// Build the configuration
    ///
    /// An empty project falls back to `"default"`; intervals are clamped.
    #[must_use]
    pub fn build(mut self) -> CoverageConfig {
        if self.config.project.trim().is_empty() {
            self.config.project = CoverageConfig::default().project;
        }
        self.config.flush_policy = self.config.flush_policy.clamped();
        self.config
    }
}
