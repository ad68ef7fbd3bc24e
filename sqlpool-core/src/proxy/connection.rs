use std::any::{type_name, Any, TypeId};
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::MutexGuard;

use super::statement::{Delegate, PoolPreparedStatement, PoolStatement, StatementShared};
use super::Lease;
use crate::connection::{Attribute, AttributeValue, StatementKind};
use crate::error::{Error, HandleKind, Result};
use crate::isolation_level::IsolationLevel;
use crate::pool::pooled::{CachedStatement, ConnectionId, Live, PooledConnection};
use crate::pool::shared::SharedPool;

/// A connection managed by a [`Pool`][crate::pool::Pool].
///
/// Will be returned to the pool on-drop. Before it is reused, uncommitted work is rolled
/// back and attributes changed through this handle are restored to the pool defaults.
pub struct PoolConnection {
    conn: Option<Arc<PooledConnection>>,
    lease: Arc<Lease>,
    pool: Arc<SharedPool>,
}

impl PoolConnection {
    pub(crate) fn new(conn: Arc<PooledConnection>, pool: Arc<SharedPool>) -> Self {
        PoolConnection {
            lease: Arc::new(Lease::new(conn.clone())),
            conn: Some(conn),
            pool,
        }
    }

    fn pooled(&self) -> Result<&Arc<PooledConnection>> {
        self.conn
            .as_ref()
            .ok_or(Error::HandleClosed(HandleKind::Connection))
    }

    fn live(&self) -> Result<(&PooledConnection, MutexGuard<'_, Live>)> {
        let conn = self.pooled()?;
        Ok((conn, conn.lock()))
    }

    /// The identifier of the pooled connection behind this handle.
    pub fn id(&self) -> ConnectionId {
        self.lease.conn().id
    }

    /// Returns `true` once this handle was closed, or the pool closed the connection.
    pub fn is_closed(&self) -> bool {
        self.conn.as_ref().is_none_or(|conn| conn.is_closed())
    }

    fn check_supported(conn: &PooledConnection, attribute: Attribute) -> Result<()> {
        match attribute.required_capability() {
            Some(required) if !conn.capabilities.contains(required) => {
                Err(Error::UnsupportedOperation(attribute.name()))
            }
            _ => Ok(()),
        }
    }

    /// Reads the current value of `attribute` from the driver.
    pub fn attribute(&mut self, attribute: Attribute) -> Result<AttributeValue> {
        let (conn, mut live) = self.live()?;
        Self::check_supported(conn, attribute)?;
        live.raw.attribute(attribute)
    }

    /// Changes an attribute of the connection.
    ///
    /// The pool remembers which attributes differ from their defaults and restores only
    /// those when the connection is returned. Auto-commit cannot be changed while the
    /// current transaction has uncommitted work.
    pub fn set_attribute(&mut self, value: AttributeValue) -> Result<()> {
        let (conn, mut live) = self.live()?;
        let attribute = value.attribute();
        Self::check_supported(conn, attribute)?;

        if attribute == Attribute::AutoCommit && conn.is_commit_dirty() {
            return Err(Error::AttributeResetForbidden);
        }

        live.raw.set_attribute(&value)?;

        if let AttributeValue::AutoCommit(auto_commit) = value {
            conn.set_auto_commit(auto_commit);
        }

        live.set_changed(attribute, !conn.defaults.is_default(&value));
        drop(live);

        conn.touch();
        Ok(())
    }

    /// The auto-commit mode, as last set through this pool.
    pub fn auto_commit(&self) -> Result<bool> {
        Ok(self.pooled()?.auto_commit())
    }

    pub fn set_auto_commit(&mut self, auto_commit: bool) -> Result<()> {
        self.set_attribute(AttributeValue::AutoCommit(auto_commit))
    }

    pub fn isolation_level(&mut self) -> Result<IsolationLevel> {
        match self.attribute(Attribute::Isolation)? {
            AttributeValue::Isolation(level) => Ok(level),
            other => Err(unexpected(other)),
        }
    }

    pub fn set_isolation_level(&mut self, level: IsolationLevel) -> Result<()> {
        self.set_attribute(AttributeValue::Isolation(level))
    }

    pub fn is_read_only(&mut self) -> Result<bool> {
        match self.attribute(Attribute::ReadOnly)? {
            AttributeValue::ReadOnly(read_only) => Ok(read_only),
            other => Err(unexpected(other)),
        }
    }

    pub fn set_read_only(&mut self, read_only: bool) -> Result<()> {
        self.set_attribute(AttributeValue::ReadOnly(read_only))
    }

    pub fn catalog(&mut self) -> Result<Option<String>> {
        match self.attribute(Attribute::Catalog)? {
            AttributeValue::Catalog(catalog) => Ok(catalog),
            other => Err(unexpected(other)),
        }
    }

    pub fn set_catalog(&mut self, catalog: Option<&str>) -> Result<()> {
        self.set_attribute(AttributeValue::Catalog(catalog.map(str::to_owned)))
    }

    pub fn schema(&mut self) -> Result<Option<String>> {
        match self.attribute(Attribute::Schema)? {
            AttributeValue::Schema(schema) => Ok(schema),
            other => Err(unexpected(other)),
        }
    }

    pub fn set_schema(&mut self, schema: Option<&str>) -> Result<()> {
        self.set_attribute(AttributeValue::Schema(schema.map(str::to_owned)))
    }

    pub fn network_timeout(&mut self) -> Result<Option<Duration>> {
        match self.attribute(Attribute::NetworkTimeout)? {
            AttributeValue::NetworkTimeout(timeout) => Ok(timeout),
            other => Err(unexpected(other)),
        }
    }

    pub fn set_network_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.set_attribute(AttributeValue::NetworkTimeout(timeout))
    }

    pub fn commit(&mut self) -> Result<()> {
        let (conn, mut live) = self.live()?;
        live.raw.commit()?;
        drop(live);

        conn.mark_transaction_ended();
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        let (conn, mut live) = self.live()?;
        live.raw.rollback()?;
        drop(live);

        conn.mark_transaction_ended();
        Ok(())
    }

    /// Asks the driver whether the connection is still usable.
    ///
    /// Returns `false` for a closed handle instead of an error.
    pub fn is_valid(&mut self, timeout: Duration) -> Result<bool> {
        if self.is_closed() {
            return Ok(false);
        }

        let (_, mut live) = self.live()?;
        live.raw.is_valid(timeout)
    }

    pub fn clear_warnings(&mut self) -> Result<()> {
        let (_, mut live) = self.live()?;
        live.raw.clear_warnings()
    }

    /// Creates a statement for executing ad-hoc SQL.
    pub fn create_statement(&mut self) -> Result<PoolStatement> {
        let (_, mut live) = self.live()?;
        let raw = live.raw.create_statement()?;
        drop(live);

        Ok(PoolStatement::new(self.statement(
            StatementKind::Plain,
            None,
            Delegate::Owned(raw),
        )))
    }

    /// Prepares `sql`, reusing a cached driver statement when one is free.
    pub fn prepare(&mut self, sql: &str) -> Result<PoolPreparedStatement> {
        self.prepare_kind(sql, StatementKind::Prepared)
    }

    /// Prepares a call to a stored procedure.
    pub fn prepare_call(&mut self, sql: &str) -> Result<PoolPreparedStatement> {
        self.prepare_kind(sql, StatementKind::Callable)
    }

    fn prepare_kind(&mut self, sql: &str, kind: StatementKind) -> Result<PoolPreparedStatement> {
        let (_, mut live) = self.live()?;

        let delegate = if live.statements.is_enabled() {
            let cached = live.statements.get(sql, kind).cloned();

            match cached {
                Some(entry) if entry.try_lease() => Delegate::Cached(entry),
                // already held by another open handle
                Some(_) => Delegate::Owned(live.raw.prepare(sql, kind)?),
                None => {
                    let entry = CachedStatement::new_leased(live.raw.prepare(sql, kind)?);

                    if let Some(evicted) = live.statements.insert(sql, kind, entry.clone()) {
                        evicted.evict();
                    }

                    Delegate::Cached(entry)
                }
            }
        } else {
            Delegate::Owned(live.raw.prepare(sql, kind)?)
        };

        drop(live);

        Ok(PoolPreparedStatement::new(self.statement(
            kind,
            Some(sql),
            delegate,
        )))
    }

    fn statement(
        &self,
        kind: StatementKind,
        sql: Option<&str>,
        delegate: Delegate,
    ) -> Arc<StatementShared> {
        StatementShared::new(
            self.lease.clone(),
            kind,
            sql,
            delegate,
            self.pool.options.slow_statement_threshold,
        )
    }

    /// Executes `sql` on a throwaway statement, returning the number of rows affected.
    pub fn execute(&mut self, sql: &str) -> Result<u64> {
        let mut statement = self.create_statement()?;
        let affected = statement.execute_update(sql);
        statement.close()?;
        affected
    }

    /// `TypeId` of the driver connection behind this handle.
    pub fn delegate_type_id(&self) -> TypeId {
        self.lease.conn().delegate_type
    }

    pub fn is_wrapper_for<T: Any>(&self) -> bool {
        self.delegate_type_id() == TypeId::of::<T>()
    }

    /// Runs `f` on the driver connection, if it is a `T`.
    ///
    /// Changes made this way bypass the pool's bookkeeping and are not reset on return.
    pub fn with_raw<T: Any, R>(&mut self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let (conn, mut live) = self.live()?;

        if conn.is_closed() {
            return Err(Error::HandleClosed(HandleKind::Connection));
        }

        live.raw
            .as_any_mut()
            .downcast_mut::<T>()
            .map(f)
            .ok_or(Error::NotWrapper(type_name::<T>()))
    }

    /// Returns the connection to the pool.
    ///
    /// Statements and result sets created through this handle are closed first. If the
    /// connection cannot be reset it is closed instead of being reused, and the error is
    /// returned. Closing an already closed handle is a no-op.
    pub fn close(&mut self) -> Result<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };

        self.lease.end();
        close_statements(&conn);

        // force-closed by the pool while checked out
        if conn.is_closed() {
            return Ok(());
        }

        match conn.reset_on_return() {
            Ok(()) => {
                self.pool.recycle(conn);
                Ok(())
            }
            Err(_) if conn.is_closed() => Ok(()),
            Err(error) => {
                self.pool.abandon_on_return(&conn);
                Err(error)
            }
        }
    }

    /// Closes the connection for good instead of returning it to the pool.
    ///
    /// The pool opens a replacement if it drops below its minimum size.
    pub fn evict(mut self) {
        if let Some(conn) = self.conn.take() {
            self.lease.end();
            close_statements(&conn);
            self.pool.destroy(&conn);
        }
    }
}

fn close_statements(conn: &PooledConnection) {
    for statement in conn.take_open_statements() {
        let Some(statement) = statement.upgrade() else {
            continue;
        };

        if let Err(error) = statement.close_by_owner() {
            tracing::debug!(
                target: "sqlpool::proxy",
                connection_id = %conn.id,
                %error,
                "error closing statement with its connection"
            );
        }
    }
}

fn unexpected(value: AttributeValue) -> Error {
    Error::driver(UnexpectedAttribute(value))
}

#[derive(Debug, thiserror::Error)]
#[error("driver returned a value for the wrong attribute: {0:?}")]
struct UnexpectedAttribute(AttributeValue);

/// Returns the connection to the pool.
impl Drop for PoolConnection {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            tracing::warn!(
                target: "sqlpool::proxy",
                connection_id = %self.id(),
                %error,
                "failed to return connection to the pool"
            );
        }
    }
}

impl Debug for PoolConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConnection")
            .field("id", &self.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
