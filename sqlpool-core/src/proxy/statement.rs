use std::any::{type_name, Any, TypeId};
use std::fmt::{self, Debug, Formatter};
use std::mem;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use super::result_set::{PoolResultSet, ResultSetShared};
use super::Lease;
use crate::closed::ClosedStatement;
use crate::connection::{RawResultSet, RawStatement, ResultDisposition, StatementKind};
use crate::error::{Error, HandleKind, Result};
use crate::logger::StatementLogger;
use crate::pool::pooled::{CachedStatement, ConnectionId, PooledConnection};
use crate::value::Value;

/// Where a statement handle's driver statement lives.
pub(crate) enum Delegate {
    /// Created for this handle alone; closed with it.
    Owned(Box<dyn RawStatement>),
    /// Borrowed from the connection's statement cache; handed back on close.
    Cached(Arc<CachedStatement>),
    Closed,
}

impl Delegate {
    fn with<R>(&mut self, f: impl FnOnce(&mut dyn RawStatement) -> R) -> R {
        match self {
            Delegate::Owned(raw) => f(raw.as_mut()),
            Delegate::Cached(entry) => entry.with_raw(f),
            Delegate::Closed => f(&mut ClosedStatement),
        }
    }

    fn close(self) -> Result<()> {
        match self {
            Delegate::Owned(mut raw) => raw.close(),
            Delegate::Cached(entry) => {
                entry.detach();
                Ok(())
            }
            Delegate::Closed => Ok(()),
        }
    }
}

/// State shared by every handle to one statement.
pub(crate) struct StatementShared {
    this: Weak<StatementShared>,
    lease: Arc<Lease>,
    kind: StatementKind,
    sql: Option<Box<str>>,
    delegate_type: TypeId,
    slow_threshold: Duration,
    state: Mutex<StatementState>,
}

struct StatementState {
    delegate: Delegate,
    disposition: ResultDisposition,
    current: Option<Weak<ResultSetShared>>,
    // result sets kept open by `ResultDisposition::KeepCurrent`
    kept: Vec<Weak<ResultSetShared>>,
    // whether the owning connection tracks this statement
    registered: bool,
}

impl StatementState {
    fn close_current(&mut self) {
        if let Some(current) = self.current.take().and_then(|rs| rs.upgrade()) {
            current.close_from_statement();
        }
    }

    fn keep_current(&mut self) {
        self.kept.retain(|rs| rs.strong_count() > 0);
        self.kept.extend(self.current.take());
    }

    fn close_results(&mut self) {
        self.close_current();

        for kept in mem::take(&mut self.kept) {
            if let Some(kept) = kept.upgrade() {
                kept.close_from_statement();
            }
        }
    }
}

impl StatementShared {
    pub(crate) fn new(
        lease: Arc<Lease>,
        kind: StatementKind,
        sql: Option<&str>,
        mut delegate: Delegate,
        slow_threshold: Duration,
    ) -> Arc<Self> {
        let delegate_type = delegate.with(|raw| raw.as_any().type_id());
        let registered = lease.conn().is_tracing_statements();

        let statement = Arc::new_cyclic(|this| StatementShared {
            this: this.clone(),
            lease,
            kind,
            sql: sql.map(Into::into),
            delegate_type,
            slow_threshold,
            state: Mutex::new(StatementState {
                delegate,
                disposition: ResultDisposition::default(),
                current: None,
                kept: Vec::new(),
                registered,
            }),
        });

        if registered {
            statement.owner().register_statement(Arc::downgrade(&statement));
        }

        statement
    }

    fn owner(&self) -> &PooledConnection {
        self.lease.conn()
    }

    fn run<R>(&self, f: impl FnOnce(&mut StatementState) -> Result<R>) -> Result<R> {
        let _lease = self.lease.enter(HandleKind::Statement)?;
        let mut state = self.state.lock();
        f(&mut state)
    }

    /// Runs an execution on the driver statement. Results of the previous execution are
    /// closed first.
    fn executed<R>(
        &self,
        state: &mut StatementState,
        sql: Option<&str>,
        f: impl FnOnce(&mut dyn RawStatement) -> Result<R>,
    ) -> Result<R> {
        state.close_results();
        state.disposition = ResultDisposition::default();

        let logger = StatementLogger::new(sql.or(self.sql.as_deref()), self.slow_threshold);
        let output = state.delegate.with(f)?;

        let owner = self.owner();
        owner.mark_executed();
        logger.finish(owner.id);

        Ok(output)
    }

    fn open_result(&self, state: &mut StatementState, raw: Box<dyn RawResultSet>) -> PoolResultSet {
        match state.disposition {
            ResultDisposition::CloseCurrent => state.close_current(),
            ResultDisposition::KeepCurrent => state.keep_current(),
            ResultDisposition::CloseAll => state.close_results(),
        }

        let result_set = ResultSetShared::new(self.this.clone(), self.lease.clone(), raw);
        state.current = Some(Arc::downgrade(&result_set));

        PoolResultSet::new(result_set)
    }

    fn execute(&self, sql: Option<&str>) -> Result<bool> {
        self.run(|state| self.executed(state, sql, |raw| raw.execute(sql)))
    }

    fn execute_update(&self, sql: Option<&str>) -> Result<u64> {
        self.run(|state| self.executed(state, sql, |raw| raw.execute_update(sql)))
    }

    fn execute_query(&self, sql: Option<&str>) -> Result<PoolResultSet> {
        self.run(|state| {
            let raw = self.executed(state, sql, |raw| raw.execute_query(sql))?;
            Ok(self.open_result(state, raw))
        })
    }

    fn result_set(&self) -> Result<Option<PoolResultSet>> {
        self.run(|state| {
            if let Some(current) = state.current.as_ref().and_then(Weak::upgrade) {
                // the lease is already entered; `is_closed` would read-lock it again
                if !current.is_closed_raw() {
                    return Ok(Some(PoolResultSet::new(current)));
                }
            }

            match state.delegate.with(|raw| raw.result_set())? {
                Some(raw) => Ok(Some(self.open_result(state, raw))),
                None => Ok(None),
            }
        })
    }

    fn update_count(&self) -> Result<Option<u64>> {
        self.run(|state| state.delegate.with(|raw| raw.update_count()))
    }

    fn more_results(&self, disposition: ResultDisposition) -> Result<bool> {
        self.run(|state| {
            state.disposition = disposition;

            match disposition {
                ResultDisposition::CloseCurrent => state.close_current(),
                ResultDisposition::KeepCurrent => state.keep_current(),
                ResultDisposition::CloseAll => state.close_results(),
            }

            state.delegate.with(|raw| raw.more_results(disposition))
        })
    }

    fn bind(&self, index: usize, value: Value) -> Result<()> {
        self.run(|state| state.delegate.with(|raw| raw.bind(index, value)))
    }

    fn clear_parameters(&self) -> Result<()> {
        self.run(|state| state.delegate.with(|raw| raw.clear_parameters()))
    }

    fn with_raw<T: Any, R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        self.run(|state| {
            if matches!(state.delegate, Delegate::Closed) {
                return Err(Error::HandleClosed(HandleKind::Statement));
            }

            state.delegate.with(|raw| {
                raw.as_any_mut()
                    .downcast_mut::<T>()
                    .map(f)
                    .ok_or(Error::NotWrapper(type_name::<T>()))
            })
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self.state.lock().delegate, Delegate::Closed) || !self.lease.is_open()
    }

    /// Closes the statement, its open result sets, and its driver statement unless the
    /// connection's cache owns it.
    pub(crate) fn close(&self) -> Result<()> {
        let (delegate, results, registered) = {
            let mut state = self.state.lock();

            if matches!(state.delegate, Delegate::Closed) {
                return Ok(());
            }

            let mut results = mem::take(&mut state.kept);
            results.extend(state.current.take());

            (
                mem::replace(&mut state.delegate, Delegate::Closed),
                results,
                mem::replace(&mut state.registered, false),
            )
        };

        for result_set in results.iter().filter_map(Weak::upgrade) {
            result_set.close_from_statement();
        }

        let closed = delegate.close();

        if registered {
            self.owner().unregister_statement(&self.this);
        }

        closed
    }

    /// The owning connection is closing and has already dropped its registry.
    pub(crate) fn close_by_owner(&self) -> Result<()> {
        self.state.lock().registered = false;
        self.close()
    }

    /// Called by a result set closed through its own handle.
    pub(crate) fn forget_result(&self, result_set: &ResultSetShared) {
        let mut state = self.state.lock();

        if state
            .current
            .as_ref()
            .is_some_and(|current| std::ptr::eq(current.as_ptr(), result_set))
        {
            state.current = None;
        }

        state
            .kept
            .retain(|kept| !std::ptr::eq(kept.as_ptr(), result_set) && kept.strong_count() > 0);
    }
}

impl Drop for StatementShared {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            tracing::debug!(target: "sqlpool::proxy", %error, "error closing dropped statement");
        }
    }
}

macro_rules! impl_statement_handle {
    ($name:ident) => {
        impl $name {
            /// Returns the current result as a result set, if it is one.
            pub fn result_set(&mut self) -> Result<Option<PoolResultSet>> {
                self.0.result_set()
            }

            /// Returns the current result as an update count, if it is one.
            pub fn update_count(&mut self) -> Result<Option<u64>> {
                self.0.update_count()
            }

            /// Moves to the next result, handling open result sets according to
            /// `disposition`.
            pub fn more_results(&mut self, disposition: ResultDisposition) -> Result<bool> {
                self.0.more_results(disposition)
            }

            /// Closes this statement and every result set it opened.
            ///
            /// Closing an already closed statement is a no-op.
            pub fn close(&mut self) -> Result<()> {
                self.0.close()
            }

            pub fn is_closed(&self) -> bool {
                self.0.is_closed()
            }

            pub fn kind(&self) -> StatementKind {
                self.0.kind
            }

            /// The connection this statement was created on.
            pub fn connection_id(&self) -> ConnectionId {
                self.0.owner().id
            }

            /// `TypeId` of the driver statement behind this handle.
            pub fn delegate_type_id(&self) -> TypeId {
                self.0.delegate_type
            }

            pub fn is_wrapper_for<T: Any>(&self) -> bool {
                self.0.delegate_type == TypeId::of::<T>()
            }

            /// Runs `f` on the driver statement, if it is a `T`.
            pub fn with_raw<T: Any, R>(&mut self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
                self.0.with_raw(f)
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("connection_id", &self.0.owner().id)
                    .field("kind", &self.0.kind)
                    .field("sql", &self.0.sql)
                    .finish()
            }
        }
    };
}

/// A statement executing ad-hoc SQL on a pooled connection.
pub struct PoolStatement(Arc<StatementShared>);

impl PoolStatement {
    pub(crate) fn new(shared: Arc<StatementShared>) -> Self {
        PoolStatement(shared)
    }

    /// Executes `sql`, returning `true` if the first result is a result set.
    pub fn execute(&mut self, sql: &str) -> Result<bool> {
        self.0.execute(Some(sql))
    }

    /// Executes `sql`, returning the number of rows affected.
    pub fn execute_update(&mut self, sql: &str) -> Result<u64> {
        self.0.execute_update(Some(sql))
    }

    /// Executes `sql`, returning its rows.
    pub fn execute_query(&mut self, sql: &str) -> Result<PoolResultSet> {
        self.0.execute_query(Some(sql))
    }
}

impl_statement_handle!(PoolStatement);

/// A prepared or callable statement on a pooled connection.
///
/// Prepared statements may come from the connection's statement cache, in which case
/// closing the handle leaves the driver statement open for the next caller.
pub struct PoolPreparedStatement(Arc<StatementShared>);

impl PoolPreparedStatement {
    pub(crate) fn new(shared: Arc<StatementShared>) -> Self {
        PoolPreparedStatement(shared)
    }

    pub fn sql(&self) -> &str {
        self.0.sql.as_deref().unwrap_or_default()
    }

    /// Binds `value` to the parameter at `index` (1-based).
    pub fn bind(&mut self, index: usize, value: impl Into<Value>) -> Result<&mut Self> {
        self.0.bind(index, value.into())?;
        Ok(self)
    }

    pub fn clear_parameters(&mut self) -> Result<()> {
        self.0.clear_parameters()
    }

    pub fn execute(&mut self) -> Result<bool> {
        self.0.execute(None)
    }

    pub fn execute_update(&mut self) -> Result<u64> {
        self.0.execute_update(None)
    }

    pub fn execute_query(&mut self) -> Result<PoolResultSet> {
        self.0.execute_query(None)
    }
}

impl_statement_handle!(PoolPreparedStatement);
