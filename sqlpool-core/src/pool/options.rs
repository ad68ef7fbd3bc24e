use std::fmt::{self, Debug, Formatter};
use std::time::Duration;

use log::LevelFilter;

use crate::connection::{Attribute, AttributeValue, Connect};
use crate::error::{Error, Result};
use crate::isolation_level::IsolationLevel;
use crate::pool::shared::SharedPool;
use crate::pool::Pool;

/// Configuration options/builder for constructing a [`Pool`].
///
/// See the source of [`Self::new()`] for the current defaults.
#[derive(Clone)]
pub struct PoolOptions {
    // general options
    pub(crate) min_connections: u32,
    pub(crate) max_connections: u32,
    pub(crate) acquire_timeout: Duration,
    pub(crate) acquire_slow_level: LevelFilter,
    pub(crate) acquire_slow_threshold: Duration,
    pub(crate) fair: bool,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) max_lifetime: Option<Duration>,

    // validation
    pub(crate) test_before_acquire: bool,
    pub(crate) validate_after_idle: Duration,
    pub(crate) test_while_idle: bool,
    pub(crate) validation_query: Option<String>,
    pub(crate) validation_timeout: Duration,

    // statements
    pub(crate) statement_cache_capacity: usize,
    pub(crate) trace_statements: bool,
    pub(crate) slow_statement_threshold: Duration,

    // background work and shutdown
    pub(crate) maintenance_interval: Duration,
    pub(crate) close_timeout: Duration,

    // attribute defaults; `None` means "whatever the first connection reports"
    pub(crate) default_auto_commit: Option<bool>,
    pub(crate) default_isolation: Option<IsolationLevel>,
    pub(crate) default_read_only: Option<bool>,
    pub(crate) default_catalog: Option<String>,
    pub(crate) default_schema: Option<String>,
    pub(crate) default_network_timeout: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolOptions {
    /// Create a new `PoolOptions` with some arbitrary, but sane, default values.
    ///
    /// See the source of this method for the current values.
    pub fn new() -> Self {
        Self {
            min_connections: 0,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            acquire_slow_level: LevelFilter::Warn,
            // Fast enough to catch problems (e.g. a full pool); slow enough
            // to not flag typical time to open a new connection.
            acquire_slow_threshold: Duration::from_secs(2),
            fair: true,
            idle_timeout: Some(Duration::from_secs(10 * 60)),
            max_lifetime: Some(Duration::from_secs(30 * 60)),
            test_before_acquire: true,
            validate_after_idle: Duration::from_millis(500),
            test_while_idle: false,
            validation_query: None,
            validation_timeout: Duration::from_secs(3),
            statement_cache_capacity: 100,
            trace_statements: false,
            slow_statement_threshold: Duration::from_secs(1),
            maintenance_interval: Duration::from_secs(30),
            close_timeout: Duration::from_secs(5),
            default_auto_commit: None,
            default_isolation: None,
            default_read_only: None,
            default_catalog: None,
            default_schema: None,
            default_network_timeout: None,
        }
    }

    /// Set the minimum number of connections that this pool should maintain at all times.
    ///
    /// When the pool size drops below this amount, new connections are established
    /// automatically by the background maintenance thread.
    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    /// Get the minimum number of connections to maintain at all times.
    pub fn get_min_connections(&self) -> u32 {
        self.min_connections
    }

    /// Set the maximum number of connections that this pool should maintain.
    ///
    /// Can be changed later with [`Pool::resize()`].
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Get the maximum number of connections that this pool should maintain.
    pub fn get_max_connections(&self) -> u32 {
        self.max_connections
    }

    /// Set the maximum amount of time to spend waiting for a connection in
    /// [`Pool::acquire()`].
    ///
    /// The timeout covers waiting, opening a new connection and validating an idle one.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Get the maximum amount of time to spend waiting for a connection in
    /// [`Pool::acquire()`].
    pub fn get_acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    /// Log excessive wait times for acquiring a connection at `level`.
    ///
    /// Set to `LevelFilter::Off` to disable.
    pub fn acquire_slow_level(mut self, level: LevelFilter) -> Self {
        self.acquire_slow_level = level;
        self
    }

    /// Set the threshold above which acquiring a connection is logged at
    /// [`acquire_slow_level`][Self::acquire_slow_level].
    pub fn acquire_slow_threshold(mut self, threshold: Duration) -> Self {
        self.acquire_slow_threshold = threshold;
        self
    }

    /// If `true` (the default), returned connections go to waiting callers in arrival order
    /// and a new caller never takes an idle connection while others are waiting.
    ///
    /// Capacity freed by closing a connection (or by [`Pool::resize`]/[`Pool::clear_all`])
    /// wakes waiters to retry instead; a waiter that loses that race queues again at the
    /// back.
    ///
    /// If `false`, any caller may grab an idle connection the moment it appears.
    pub fn fair(mut self, fair: bool) -> Self {
        self.fair = fair;
        self
    }

    /// Set a maximum idle duration for individual connections.
    ///
    /// Any connection that remains idle longer than this is closed by the maintenance
    /// thread.
    ///
    /// For usage-based database server billing, this can be a cost saver.
    pub fn idle_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.idle_timeout = timeout.into();
        self
    }

    /// Get the maximum idle duration for individual connections.
    pub fn get_idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Set the maximum lifetime of individual connections.
    ///
    /// Any connection with a lifetime greater than this will be closed instead of being
    /// returned to the idle queue.
    ///
    /// When set to `None`, all connections live until either reaped by [`idle_timeout`]
    /// or explicitly disconnected.
    ///
    /// [`idle_timeout`]: Self::idle_timeout
    pub fn max_lifetime(mut self, lifetime: impl Into<Option<Duration>>) -> Self {
        self.max_lifetime = lifetime.into();
        self
    }

    /// Get the maximum lifetime of individual connections.
    pub fn get_max_lifetime(&self) -> Option<Duration> {
        self.max_lifetime
    }

    /// If true, the health of a connection that sat idle for longer than
    /// [`validate_after_idle`][Self::validate_after_idle] will be verified before returning
    /// it from [`Pool::acquire()`].
    ///
    /// Connections failing validation are closed and replaced transparently.
    pub fn test_before_acquire(mut self, test: bool) -> Self {
        self.test_before_acquire = test;
        self
    }

    /// Skip validation on acquire for connections used more recently than this.
    pub fn validate_after_idle(mut self, threshold: Duration) -> Self {
        self.validate_after_idle = threshold;
        self
    }

    /// If true, the maintenance thread also validates idle connections on every sweep.
    pub fn test_while_idle(mut self, test: bool) -> Self {
        self.test_while_idle = test;
        self
    }

    /// Validate connections by executing this statement instead of asking the driver.
    pub fn validation_query(mut self, query: impl Into<String>) -> Self {
        self.validation_query = Some(query.into());
        self
    }

    /// Maximum time the driver may spend checking a connection.
    pub fn validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout = timeout;
        self
    }

    /// Sets the capacity of the per-connection prepared statement cache.
    ///
    /// A capacity of 0 disables the cache.
    pub fn statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.statement_cache_capacity = capacity;
        self
    }

    /// If true, statements left open by a borrower are closed when the connection is
    /// returned.
    pub fn trace_statements(mut self, trace: bool) -> Self {
        self.trace_statements = trace;
        self
    }

    /// Statements running longer than this are logged at `WARN`.
    pub fn slow_statement_threshold(mut self, threshold: Duration) -> Self {
        self.slow_statement_threshold = threshold;
        self
    }

    /// How often the maintenance thread sweeps idle connections.
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// How long [`Pool::close()`] waits for checked-out connections to be returned
    /// before closing them.
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Auto-commit mode every connection starts with and is reset to.
    pub fn default_auto_commit(mut self, auto_commit: bool) -> Self {
        self.default_auto_commit = Some(auto_commit);
        self
    }

    pub fn default_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.default_isolation = Some(level);
        self
    }

    pub fn default_read_only(mut self, read_only: bool) -> Self {
        self.default_read_only = Some(read_only);
        self
    }

    pub fn default_catalog(mut self, catalog: impl Into<String>) -> Self {
        self.default_catalog = Some(catalog.into());
        self
    }

    pub fn default_schema(mut self, schema: impl Into<String>) -> Self {
        self.default_schema = Some(schema.into());
        self
    }

    pub fn default_network_timeout(mut self, timeout: Duration) -> Self {
        self.default_network_timeout = Some(timeout);
        self
    }

    /// The configured default for `attribute`, if one was set.
    pub(crate) fn configured_default(&self, attribute: Attribute) -> Option<AttributeValue> {
        match attribute {
            Attribute::AutoCommit => self.default_auto_commit.map(AttributeValue::AutoCommit),
            Attribute::Isolation => self.default_isolation.map(AttributeValue::Isolation),
            Attribute::ReadOnly => self.default_read_only.map(AttributeValue::ReadOnly),
            Attribute::Catalog => self
                .default_catalog
                .clone()
                .map(|catalog| AttributeValue::Catalog(Some(catalog))),
            Attribute::Schema => self
                .default_schema
                .clone()
                .map(|schema| AttributeValue::Schema(Some(schema))),
            Attribute::NetworkTimeout => self
                .default_network_timeout
                .map(|timeout| AttributeValue::NetworkTimeout(Some(timeout))),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::config("`max_connections` must be at least 1"));
        }

        if self.min_connections > self.max_connections {
            return Err(Error::config(format!(
                "`min_connections` ({}) cannot exceed `max_connections` ({})",
                self.min_connections, self.max_connections
            )));
        }

        if self.maintenance_interval.is_zero() {
            return Err(Error::config("`maintenance_interval` must be non-zero"));
        }

        Ok(())
    }

    /// Create a new pool from this configuration and immediately open
    /// [`min_connections`][Self::min_connections] connections (at least one).
    ///
    /// Fails if any of those connections cannot be opened; the pool is closed again before
    /// returning the error.
    pub fn connect(self, connector: impl Connect) -> Result<Pool> {
        self.validate()?;

        let shared = SharedPool::new_arc(self, Box::new(connector));

        if let Err(error) = shared.init_min_connections() {
            shared.close();
            return Err(error);
        }

        shared.start()?;
        Ok(Pool(shared))
    }

    /// Create a new pool from this configuration.
    ///
    /// Note that **this does not immediately connect to the database**; this call only
    /// fails if the options are inconsistent.
    ///
    /// A connection will first be established either on the first call to
    /// [`Pool::acquire()`] or, if [`min_connections`][Self::min_connections] is nonzero,
    /// by the background maintenance thread.
    pub fn build(self, connector: impl Connect) -> Result<Pool> {
        self.validate()?;

        let shared = SharedPool::new_arc(self, Box::new(connector));
        shared.start()?;
        Ok(Pool(shared))
    }
}

impl Debug for PoolOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolOptions")
            .field("min_connections", &self.min_connections)
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("fair", &self.fair)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_lifetime", &self.max_lifetime)
            .field("test_before_acquire", &self.test_before_acquire)
            .field("test_while_idle", &self.test_while_idle)
            .field("validation_query", &self.validation_query)
            .field("statement_cache_capacity", &self.statement_cache_capacity)
            .field("trace_statements", &self.trace_statements)
            .field("maintenance_interval", &self.maintenance_interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_max_connections() {
        let err = PoolOptions::new().max_connections(0).validate().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn rejects_min_above_max() {
        let err = PoolOptions::new()
            .min_connections(5)
            .max_connections(2)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("cannot exceed"));
    }

    #[test]
    fn configured_defaults_map_to_attribute_values() {
        let options = PoolOptions::new()
            .default_auto_commit(false)
            .default_schema("audit");

        assert_eq!(
            options.configured_default(Attribute::AutoCommit),
            Some(AttributeValue::AutoCommit(false))
        );
        assert_eq!(
            options.configured_default(Attribute::Schema),
            Some(AttributeValue::Schema(Some("audit".into())))
        );
        assert_eq!(options.configured_default(Attribute::Catalog), None);
    }
}
