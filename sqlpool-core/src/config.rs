//! Loading [`PoolOptions`] from a TOML document.
//!
//! The settings live in a `[pool]` table. Every key is optional; keys left out keep the
//! value of the [`PoolOptions`] they are applied to. Durations are given in milliseconds.
//!
//! ```toml
//! [pool]
//! max-connections = 20
//! acquire-timeout-ms = 5000
//! # 0 disables the idle timeout
//! idle-timeout-ms = 0
//! default-isolation = "read-committed"
//! ```

use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::isolation_level::IsolationLevel;
use crate::pool::PoolOptions;

/// The `[pool]` table of a configuration file.
#[derive(Debug, Default, Clone, PartialEq, serde::Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PoolConfig {
    pub min_connections: Option<u32>,
    pub max_connections: Option<u32>,
    pub acquire_timeout_ms: Option<u64>,
    pub acquire_slow_threshold_ms: Option<u64>,
    pub fair: Option<bool>,

    /// `0` disables the idle timeout.
    pub idle_timeout_ms: Option<u64>,
    /// `0` disables the lifetime limit.
    pub max_lifetime_ms: Option<u64>,

    pub test_before_acquire: Option<bool>,
    pub validate_after_idle_ms: Option<u64>,
    pub test_while_idle: Option<bool>,
    pub validation_query: Option<String>,
    pub validation_timeout_ms: Option<u64>,

    /// `0` disables the per-connection statement cache.
    pub statement_cache_capacity: Option<usize>,
    pub trace_statements: Option<bool>,
    pub slow_statement_threshold_ms: Option<u64>,

    pub maintenance_interval_ms: Option<u64>,
    pub close_timeout_ms: Option<u64>,

    pub default_auto_commit: Option<bool>,
    pub default_isolation: Option<IsolationLevel>,
    pub default_read_only: Option<bool>,
    pub default_catalog: Option<String>,
    pub default_schema: Option<String>,
    pub default_network_timeout_ms: Option<u64>,
}

#[derive(serde::Deserialize)]
struct ConfigFile {
    #[serde(default)]
    pool: PoolConfig,
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

fn millis_or_disabled(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl PoolConfig {
    /// Parses the `[pool]` table of a TOML document. A document without one yields the
    /// empty configuration.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(toml)
            .map_err(|error| Error::config(error.to_string()))?;

        Ok(file.pool)
    }

    /// Reads and parses a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let toml = std::fs::read_to_string(path).map_err(|error| {
            Error::config(format!("failed to read {}: {error}", path.display()))
        })?;

        Self::from_toml_str(&toml)
    }

    /// Overrides the settings of `options` that this configuration sets.
    pub fn apply(self, mut options: PoolOptions) -> PoolOptions {
        if let Some(min) = self.min_connections {
            options = options.min_connections(min);
        }
        if let Some(max) = self.max_connections {
            options = options.max_connections(max);
        }
        if let Some(ms) = self.acquire_timeout_ms {
            options = options.acquire_timeout(millis(ms));
        }
        if let Some(ms) = self.acquire_slow_threshold_ms {
            options = options.acquire_slow_threshold(millis(ms));
        }
        if let Some(fair) = self.fair {
            options = options.fair(fair);
        }
        if let Some(ms) = self.idle_timeout_ms {
            options = options.idle_timeout(millis_or_disabled(ms));
        }
        if let Some(ms) = self.max_lifetime_ms {
            options = options.max_lifetime(millis_or_disabled(ms));
        }
        if let Some(test) = self.test_before_acquire {
            options = options.test_before_acquire(test);
        }
        if let Some(ms) = self.validate_after_idle_ms {
            options = options.validate_after_idle(millis(ms));
        }
        if let Some(test) = self.test_while_idle {
            options = options.test_while_idle(test);
        }
        if let Some(query) = self.validation_query {
            options = options.validation_query(query);
        }
        if let Some(ms) = self.validation_timeout_ms {
            options = options.validation_timeout(millis(ms));
        }
        if let Some(capacity) = self.statement_cache_capacity {
            options = options.statement_cache_capacity(capacity);
        }
        if let Some(trace) = self.trace_statements {
            options = options.trace_statements(trace);
        }
        if let Some(ms) = self.slow_statement_threshold_ms {
            options = options.slow_statement_threshold(millis(ms));
        }
        if let Some(ms) = self.maintenance_interval_ms {
            options = options.maintenance_interval(millis(ms));
        }
        if let Some(ms) = self.close_timeout_ms {
            options = options.close_timeout(millis(ms));
        }
        if let Some(auto_commit) = self.default_auto_commit {
            options = options.default_auto_commit(auto_commit);
        }
        if let Some(level) = self.default_isolation {
            options = options.default_isolation_level(level);
        }
        if let Some(read_only) = self.default_read_only {
            options = options.default_read_only(read_only);
        }
        if let Some(catalog) = self.default_catalog {
            options = options.default_catalog(catalog);
        }
        if let Some(schema) = self.default_schema {
            options = options.default_schema(schema);
        }
        if let Some(ms) = self.default_network_timeout_ms {
            options = options.default_network_timeout(millis(ms));
        }

        options
    }
}
