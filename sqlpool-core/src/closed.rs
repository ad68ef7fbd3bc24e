//! Stand-ins for driver objects after their handle has been closed.
//!
//! Swapping one of these in for a closed delegate means every later call fails with
//! [`Error::HandleClosed`] without the handle re-checking its own state.

use std::any::Any;
use std::time::Duration;

use crate::connection::{
    Attribute, AttributeValue, Capabilities, RawConnection, RawResultSet, RawStatement,
    ResultDisposition, StatementKind,
};
use crate::error::{Error, HandleKind, Result};
use crate::value::Value;

#[derive(Debug, Default, Clone, Copy)]
pub struct ClosedConnection;

#[derive(Debug, Default, Clone, Copy)]
pub struct ClosedStatement;

#[derive(Debug, Default, Clone, Copy)]
pub struct ClosedResultSet;

#[inline]
fn closed<T>(kind: HandleKind) -> Result<T> {
    Err(Error::HandleClosed(kind))
}

impl RawConnection for ClosedConnection {
    fn name(&self) -> &str {
        "closed"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    fn attribute(&mut self, _attribute: Attribute) -> Result<AttributeValue> {
        closed(HandleKind::Connection)
    }

    fn set_attribute(&mut self, _value: &AttributeValue) -> Result<()> {
        closed(HandleKind::Connection)
    }

    fn commit(&mut self) -> Result<()> {
        closed(HandleKind::Connection)
    }

    fn rollback(&mut self) -> Result<()> {
        closed(HandleKind::Connection)
    }

    fn is_valid(&mut self, _timeout: Duration) -> Result<bool> {
        Ok(false)
    }

    fn clear_warnings(&mut self) -> Result<()> {
        closed(HandleKind::Connection)
    }

    fn create_statement(&mut self) -> Result<Box<dyn RawStatement>> {
        closed(HandleKind::Connection)
    }

    fn prepare(&mut self, _sql: &str, _kind: StatementKind) -> Result<Box<dyn RawStatement>> {
        closed(HandleKind::Connection)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl RawStatement for ClosedStatement {
    fn execute(&mut self, _sql: Option<&str>) -> Result<bool> {
        closed(HandleKind::Statement)
    }

    fn execute_update(&mut self, _sql: Option<&str>) -> Result<u64> {
        closed(HandleKind::Statement)
    }

    fn execute_query(&mut self, _sql: Option<&str>) -> Result<Box<dyn RawResultSet>> {
        closed(HandleKind::Statement)
    }

    fn result_set(&mut self) -> Result<Option<Box<dyn RawResultSet>>> {
        closed(HandleKind::Statement)
    }

    fn update_count(&mut self) -> Result<Option<u64>> {
        closed(HandleKind::Statement)
    }

    fn more_results(&mut self, _disposition: ResultDisposition) -> Result<bool> {
        closed(HandleKind::Statement)
    }

    fn bind(&mut self, _index: usize, _value: Value) -> Result<()> {
        closed(HandleKind::Statement)
    }

    fn clear_parameters(&mut self) -> Result<()> {
        closed(HandleKind::Statement)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl RawResultSet for ClosedResultSet {
    fn next(&mut self) -> Result<bool> {
        closed(HandleKind::ResultSet)
    }

    fn get(&mut self, _column: usize) -> Result<Value> {
        closed(HandleKind::ResultSet)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_operation_reports_the_closed_handle() {
        let mut conn = ClosedConnection;
        assert!(matches!(
            conn.commit(),
            Err(Error::HandleClosed(HandleKind::Connection))
        ));
        assert!(matches!(
            conn.prepare("SELECT 1", StatementKind::Prepared),
            Err(Error::HandleClosed(HandleKind::Connection))
        ));

        let mut stmt = ClosedStatement;
        assert!(matches!(
            stmt.execute(Some("SELECT 1")),
            Err(Error::HandleClosed(HandleKind::Statement))
        ));

        let mut rs = ClosedResultSet;
        assert!(matches!(
            rs.next(),
            Err(Error::HandleClosed(HandleKind::ResultSet))
        ));
    }

    #[test]
    fn closing_a_sentinel_is_a_no_op() {
        assert!(ClosedConnection.close().is_ok());
        assert!(ClosedStatement.close().is_ok());
        assert!(ClosedResultSet.close().is_ok());
    }
}
