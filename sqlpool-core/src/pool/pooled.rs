use std::any::TypeId;
use std::fmt::{self, Debug, Display, Formatter};
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

use crate::cache::StatementCache;
use crate::closed::{ClosedConnection, ClosedStatement};
use crate::connection::{Attribute, AttributeValue, Capabilities, RawConnection, RawStatement};
use crate::error::{Error, Result};
use crate::proxy::statement::StatementShared;

/// Identifies one pooled connection for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Pool-visible state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 1,
    Using = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Idle,
            2 => ConnectionState::Using,
            _ => ConnectionState::Closed,
        }
    }
}

/// The value each attribute is restored to when a connection is returned.
#[derive(Debug)]
pub(crate) struct Defaults {
    values: Vec<AttributeValue>,
}

impl Defaults {
    /// `values` must hold one value per [`Attribute`], in [`Attribute::ALL`] order.
    pub(crate) fn new(values: Vec<AttributeValue>) -> Self {
        debug_assert_eq!(values.len(), Attribute::COUNT);
        Defaults { values }
    }

    pub(crate) fn get(&self, attribute: Attribute) -> &AttributeValue {
        &self.values[attribute.index()]
    }

    pub(crate) fn is_default(&self, value: &AttributeValue) -> bool {
        self.get(value.attribute()) == value
    }

    pub(crate) fn auto_commit(&self) -> bool {
        !matches!(self.get(Attribute::AutoCommit), AttributeValue::AutoCommit(false))
    }
}

/// A raw statement owned by a connection's statement cache.
///
/// The cache lends it to at most one statement handle at a time. The raw statement is
/// closed exactly once: on eviction if nobody holds it, otherwise when the holder detaches.
pub(crate) struct CachedStatement {
    inner: Mutex<CachedInner>,
}

struct CachedInner {
    raw: Box<dyn RawStatement>,
    leased: bool,
    evicted: bool,
}

impl CachedInner {
    fn close_raw(&mut self) {
        let mut raw = mem::replace(&mut self.raw, Box::new(ClosedStatement));

        if let Err(error) = raw.close() {
            tracing::debug!(target: "sqlpool::pool", %error, "error closing cached statement");
        }
    }
}

impl CachedStatement {
    pub(crate) fn new_leased(raw: Box<dyn RawStatement>) -> Arc<Self> {
        Arc::new(CachedStatement {
            inner: Mutex::new(CachedInner {
                raw,
                leased: true,
                evicted: false,
            }),
        })
    }

    pub(crate) fn try_lease(&self) -> bool {
        let mut inner = self.inner.lock();

        if inner.leased || inner.evicted {
            return false;
        }

        inner.leased = true;
        true
    }

    pub(crate) fn with_raw<R>(&self, f: impl FnOnce(&mut dyn RawStatement) -> R) -> R {
        f(self.inner.lock().raw.as_mut())
    }

    /// The statement handle holding this entry was closed.
    pub(crate) fn detach(&self) {
        let mut inner = self.inner.lock();
        inner.leased = false;

        if inner.evicted {
            inner.close_raw();
        }
    }

    /// The cache dropped this entry.
    pub(crate) fn evict(&self) {
        let mut inner = self.inner.lock();
        inner.evicted = true;

        if !inner.leased {
            inner.close_raw();
        }
    }
}

/// State of a pooled connection that is only touched by its current owner.
pub(crate) struct Live {
    pub(crate) raw: Box<dyn RawConnection>,
    pub(crate) statements: StatementCache<Arc<CachedStatement>>,
    changed: [bool; Attribute::COUNT],
    changed_count: usize,
}

impl Live {
    /// Records whether `attribute` now differs from its pool default.
    pub(crate) fn set_changed(&mut self, attribute: Attribute, changed: bool) {
        let flag = &mut self.changed[attribute.index()];

        if *flag != changed {
            *flag = changed;

            if changed {
                self.changed_count += 1;
            } else {
                self.changed_count -= 1;
            }
        }
    }

    pub(crate) fn is_changed(&self, attribute: Attribute) -> bool {
        self.changed[attribute.index()]
    }

    pub(crate) fn changed_count(&self) -> usize {
        self.changed_count
    }

    fn clear_changed(&mut self) {
        self.changed = [false; Attribute::COUNT];
        self.changed_count = 0;
    }
}

/// One connection managed by the pool.
pub(crate) struct PooledConnection {
    pub(crate) id: ConnectionId,
    state: AtomicU8,
    pub(crate) generation: u64,
    created_at: Instant,
    // nanoseconds since `created_at`
    last_access: AtomicU64,
    auto_commit: AtomicBool,
    commit_dirty: AtomicBool,
    pub(crate) defaults: Arc<Defaults>,
    pub(crate) capabilities: Capabilities,
    pub(crate) delegate_type: TypeId,
    live: Mutex<Live>,
    // `None` unless statement tracing is enabled
    open_statements: Option<Mutex<Vec<Weak<StatementShared>>>>,
}

pub(crate) struct PooledConfig {
    pub generation: u64,
    pub defaults: Arc<Defaults>,
    pub capabilities: Capabilities,
    pub statement_cache_capacity: usize,
    pub trace_statements: bool,
}

impl PooledConnection {
    /// Wraps a freshly opened connection. It starts out [`ConnectionState::Using`], owned by
    /// whoever opened it.
    pub(crate) fn new(raw: Box<dyn RawConnection>, config: PooledConfig) -> Self {
        let auto_commit = config.defaults.auto_commit();
        let delegate_type = raw.as_any().type_id();

        PooledConnection {
            id: ConnectionId::next(),
            state: AtomicU8::new(ConnectionState::Using as u8),
            generation: config.generation,
            created_at: Instant::now(),
            last_access: AtomicU64::new(0),
            auto_commit: AtomicBool::new(auto_commit),
            commit_dirty: AtomicBool::new(false),
            defaults: config.defaults,
            capabilities: config.capabilities,
            delegate_type,
            live: Mutex::new(Live {
                raw,
                statements: StatementCache::new(config.statement_cache_capacity),
                changed: [false; Attribute::COUNT],
                changed_count: 0,
            }),
            open_statements: config.trace_statements.then(|| Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// `Idle -> Using`; exactly one of several racing callers succeeds.
    pub(crate) fn try_lease(&self) -> bool {
        self.transition(ConnectionState::Idle, ConnectionState::Using)
    }

    /// `Using -> Idle`; fails if the connection was closed in the meantime.
    pub(crate) fn release_to_idle(&self) -> bool {
        self.transition(ConnectionState::Using, ConnectionState::Idle)
    }

    /// Moves to `Closed`, returning `true` for the caller that made the transition.
    pub(crate) fn mark_closed(&self) -> bool {
        self.state.swap(ConnectionState::Closed as u8, Ordering::AcqRel)
            != ConnectionState::Closed as u8
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn touch(&self) {
        let nanos = u64::try_from(self.created_at.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.last_access.store(nanos, Ordering::Release);
    }

    pub(crate) fn idle_for(&self) -> Duration {
        let last_access = Duration::from_nanos(self.last_access.load(Ordering::Acquire));
        self.created_at.elapsed().saturating_sub(last_access)
    }

    pub(crate) fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn auto_commit(&self) -> bool {
        self.auto_commit.load(Ordering::Acquire)
    }

    pub(crate) fn set_auto_commit(&self, auto_commit: bool) {
        self.auto_commit.store(auto_commit, Ordering::Release);

        if auto_commit {
            self.commit_dirty.store(false, Ordering::Release);
        }
    }

    pub(crate) fn is_commit_dirty(&self) -> bool {
        self.commit_dirty.load(Ordering::Acquire)
    }

    /// A statement executed on this connection.
    pub(crate) fn mark_executed(&self) {
        if !self.auto_commit() {
            self.commit_dirty.store(true, Ordering::Release);
        }
        self.touch();
    }

    /// A commit or rollback ended the current transaction.
    pub(crate) fn mark_transaction_ended(&self) {
        self.commit_dirty.store(false, Ordering::Release);
        self.touch();
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Live> {
        self.live.lock()
    }

    pub(crate) fn is_tracing_statements(&self) -> bool {
        self.open_statements.is_some()
    }

    pub(crate) fn register_statement(&self, statement: Weak<StatementShared>) {
        if let Some(open) = &self.open_statements {
            let mut open = open.lock();
            open.retain(|s| s.strong_count() > 0);
            open.push(statement);
        }
    }

    pub(crate) fn unregister_statement(&self, statement: &Weak<StatementShared>) {
        if let Some(open) = &self.open_statements {
            open.lock().retain(|s| !s.ptr_eq(statement) && s.strong_count() > 0);
        }
    }

    pub(crate) fn take_open_statements(&self) -> Vec<Weak<StatementShared>> {
        self.open_statements
            .as_ref()
            .map(|open| mem::take(&mut *open.lock()))
            .unwrap_or_default()
    }

    /// Restores the connection to its pool defaults before it is recycled.
    ///
    /// Uncommitted work is rolled back first, then only the attributes flagged as changed are
    /// reset. An untouched connection costs no driver calls beyond clearing warnings.
    pub(crate) fn reset_on_return(&self) -> Result<()> {
        let mut live = self.lock();

        if !self.auto_commit() && self.is_commit_dirty() {
            live.raw.rollback()?;
            self.commit_dirty.store(false, Ordering::Release);
        }

        if live.changed_count() > 0 {
            for attribute in Attribute::ALL {
                if !live.is_changed(attribute) {
                    continue;
                }

                let default = self.defaults.get(attribute);
                live.raw.set_attribute(default)?;

                if let AttributeValue::AutoCommit(auto_commit) = default {
                    self.set_auto_commit(*auto_commit);
                }
            }

            live.clear_changed();
        }

        live.raw.clear_warnings()?;
        drop(live);

        self.touch();
        Ok(())
    }

    /// Runs the validation probe, failing with [`Error::ResourceInvalid`] if the connection
    /// is not usable.
    pub(crate) fn validate(&self, query: Option<&str>, timeout: Duration) -> Result<()> {
        let mut live = self.lock();

        let valid = match query {
            Some(query) => {
                let mut statement = live.raw.create_statement()?;
                let executed = statement.execute(Some(query));
                let _ = statement.close();
                executed?;

                if !self.auto_commit() {
                    live.raw.rollback()?;
                }

                true
            }
            None if self.capabilities.contains(Capabilities::IS_VALID) => {
                live.raw.is_valid(timeout)?
            }
            None => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::ResourceInvalid)
        }
    }

    /// Closes the raw connection and every statement it cached.
    ///
    /// Must only be called by the caller that won [`mark_closed`][Self::mark_closed]. Waits for
    /// an in-flight operation by the current owner to finish; afterwards the owner sees
    /// [`Error::HandleClosed`].
    pub(crate) fn destroy(&self) {
        let mut live = self.lock();

        for statement in live.statements.drain() {
            statement.evict();
        }

        let mut raw = mem::replace(&mut live.raw, Box::new(ClosedConnection));
        drop(live);

        if !self.auto_commit() && self.is_commit_dirty() {
            let _ = raw.rollback();
        }

        if let Err(error) = raw.close() {
            tracing::debug!(
                target: "sqlpool::pool",
                connection_id = %self.id,
                %error,
                "error closing connection"
            );
        }
    }
}

impl Debug for PooledConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::connection::{RawResultSet, ResultDisposition};

    struct CountingStatement(Arc<AtomicUsize>);

    impl RawStatement for CountingStatement {
        fn execute(&mut self, _sql: Option<&str>) -> Result<bool> {
            Ok(false)
        }

        fn execute_update(&mut self, _sql: Option<&str>) -> Result<u64> {
            Ok(0)
        }

        fn execute_query(&mut self, _sql: Option<&str>) -> Result<Box<dyn RawResultSet>> {
            Err(Error::UnsupportedOperation("execute_query"))
        }

        fn result_set(&mut self) -> Result<Option<Box<dyn RawResultSet>>> {
            Ok(None)
        }

        fn update_count(&mut self) -> Result<Option<u64>> {
            Ok(None)
        }

        fn more_results(&mut self, _disposition: ResultDisposition) -> Result<bool> {
            Ok(false)
        }

        fn close(&mut self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn cached() -> (Arc<CachedStatement>, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        let entry = CachedStatement::new_leased(Box::new(CountingStatement(closes.clone())));
        (entry, closes)
    }

    #[test]
    fn evicting_an_idle_entry_closes_it() {
        let (entry, closes) = cached();
        entry.detach();
        assert_eq!(closes.load(Ordering::SeqCst), 0);

        entry.evict();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!entry.try_lease());
    }

    #[test]
    fn leased_entry_closes_when_detached() {
        let (entry, closes) = cached();
        assert!(!entry.try_lease());

        entry.evict();
        assert_eq!(closes.load(Ordering::SeqCst), 0);

        entry.detach();
        entry.detach();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn changed_count_tracks_flags() {
        let mut live = Live {
            raw: Box::new(ClosedConnection),
            statements: StatementCache::new(0),
            changed: [false; Attribute::COUNT],
            changed_count: 0,
        };

        live.set_changed(Attribute::ReadOnly, true);
        live.set_changed(Attribute::ReadOnly, true);
        live.set_changed(Attribute::Schema, true);
        assert_eq!(live.changed_count(), 2);

        live.set_changed(Attribute::ReadOnly, false);
        assert_eq!(live.changed_count(), 1);
        assert!(live.is_changed(Attribute::Schema));

        live.clear_changed();
        assert_eq!(live.changed_count(), 0);
        assert!(!live.is_changed(Attribute::Schema));
    }
}
