use std::any::{type_name, Any, TypeId};
use std::fmt::{self, Debug, Formatter};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::statement::StatementShared;
use super::Lease;
use crate::closed::ClosedResultSet;
use crate::connection::RawResultSet;
use crate::error::{Error, HandleKind, Result};
use crate::value::Value;

pub(crate) struct ResultSetShared {
    statement: Weak<StatementShared>,
    lease: Arc<Lease>,
    delegate_type: TypeId,
    closed: AtomicBool,
    // `ClosedResultSet` once closed
    raw: Mutex<Box<dyn RawResultSet>>,
}

impl ResultSetShared {
    pub(crate) fn new(
        statement: Weak<StatementShared>,
        lease: Arc<Lease>,
        raw: Box<dyn RawResultSet>,
    ) -> Arc<Self> {
        Arc::new(ResultSetShared {
            statement,
            lease,
            delegate_type: raw.as_any().type_id(),
            closed: AtomicBool::new(false),
            raw: Mutex::new(raw),
        })
    }

    fn run<R>(&self, f: impl FnOnce(&mut dyn RawResultSet) -> Result<R>) -> Result<R> {
        let _lease = self.lease.enter(HandleKind::ResultSet)?;
        let mut raw = self.raw.lock();
        f(raw.as_mut())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.is_closed_raw() || !self.lease.is_open()
    }

    /// Whether this result set itself was closed, ignoring its connection.
    ///
    /// Safe to call while the lease is entered.
    pub(crate) fn is_closed_raw(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the driver result set. Returns `None` if it was already closed.
    fn close_raw(&self) -> Option<Result<()>> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return None;
        }

        let mut raw = mem::replace(&mut *self.raw.lock(), Box::new(ClosedResultSet));
        Some(raw.close())
    }

    fn close(&self) -> Result<()> {
        let Some(closed) = self.close_raw() else {
            return Ok(());
        };

        if let Some(statement) = self.statement.upgrade() {
            statement.forget_result(self);
        }

        closed
    }

    /// Closed by the statement that opened it, which already forgot about it.
    pub(crate) fn close_from_statement(&self) {
        if let Some(Err(error)) = self.close_raw() {
            tracing::debug!(target: "sqlpool::proxy", %error, "error closing result set");
        }
    }
}

impl Drop for ResultSetShared {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            tracing::debug!(target: "sqlpool::proxy", %error, "error closing dropped result set");
        }
    }
}

/// Rows produced by a statement on a pooled connection.
///
/// Closed when its statement re-executes, moves past it, or is closed, and when its
/// connection goes back to the pool.
pub struct PoolResultSet(Arc<ResultSetShared>);

impl PoolResultSet {
    pub(crate) fn new(shared: Arc<ResultSetShared>) -> Self {
        PoolResultSet(shared)
    }

    /// Advances to the next row, returning `false` once the rows are exhausted.
    pub fn next(&mut self) -> Result<bool> {
        self.0.run(|raw| raw.next())
    }

    /// Reads the value of `column` (1-based) in the current row.
    pub fn get(&mut self, column: usize) -> Result<Value> {
        self.0.run(|raw| raw.get(column))
    }

    pub fn close(&mut self) -> Result<()> {
        self.0.close()
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    pub fn delegate_type_id(&self) -> TypeId {
        self.0.delegate_type
    }

    pub fn is_wrapper_for<T: Any>(&self) -> bool {
        self.0.delegate_type == TypeId::of::<T>()
    }

    /// Runs `f` on the driver result set, if it is a `T`.
    pub fn with_raw<T: Any, R>(&mut self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        if self.0.is_closed_raw() {
            return Err(Error::HandleClosed(HandleKind::ResultSet));
        }

        self.0.run(|raw| {
            raw.as_any_mut()
                .downcast_mut::<T>()
                .map(f)
                .ok_or(Error::NotWrapper(type_name::<T>()))
        })
    }
}

impl Debug for PoolResultSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolResultSet")
            .field("closed", &self.is_closed())
            .finish()
    }
}
