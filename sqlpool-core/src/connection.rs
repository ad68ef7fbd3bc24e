//! The driver interface the pool manages.
//!
//! A driver exposes three object-safe traits: [`RawConnection`], [`RawStatement`] and
//! [`RawResultSet`]. The pool never interprets the protocol spoken by these objects; it only
//! calls the capabilities listed here.

use std::any::Any;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::isolation_level::IsolationLevel;
use crate::value::Value;

/// Opens new raw connections for a pool.
///
/// Implemented for any `Fn() -> Result<Box<dyn RawConnection>>` closure.
pub trait Connect: Send + Sync + 'static {
    fn connect(&self) -> Result<Box<dyn RawConnection>>;
}

impl<F> Connect for F
where
    F: Fn() -> Result<Box<dyn RawConnection>> + Send + Sync + 'static,
{
    fn connect(&self) -> Result<Box<dyn RawConnection>> {
        self()
    }
}

bitflags::bitflags! {
    /// Optional features of a driver, detected once per pool from its first connection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u8 {
        /// The driver supports getting and setting the current schema.
        const SCHEMA = 1;
        /// The driver supports a per-connection network timeout.
        const NETWORK_TIMEOUT = 1 << 1;
        /// The driver implements [`RawConnection::is_valid`].
        const IS_VALID = 1 << 2;
    }
}

/// A resettable connection attribute.
///
/// The pool tracks which of these a borrower changed and restores only those on return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    AutoCommit,
    Isolation,
    ReadOnly,
    Catalog,
    Schema,
    NetworkTimeout,
}

impl Attribute {
    pub const COUNT: usize = 6;

    pub const ALL: [Attribute; Attribute::COUNT] = [
        Attribute::AutoCommit,
        Attribute::Isolation,
        Attribute::ReadOnly,
        Attribute::Catalog,
        Attribute::Schema,
        Attribute::NetworkTimeout,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub(crate) fn required_capability(self) -> Option<Capabilities> {
        match self {
            Attribute::Schema => Some(Capabilities::SCHEMA),
            Attribute::NetworkTimeout => Some(Capabilities::NETWORK_TIMEOUT),
            _ => None,
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            Attribute::AutoCommit => "auto-commit",
            Attribute::Isolation => "isolation level",
            Attribute::ReadOnly => "read-only",
            Attribute::Catalog => "catalog",
            Attribute::Schema => "schema",
            Attribute::NetworkTimeout => "network timeout",
        }
    }
}

impl Display for Attribute {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The value of a connection [`Attribute`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AttributeValue {
    AutoCommit(bool),
    Isolation(IsolationLevel),
    ReadOnly(bool),
    Catalog(Option<String>),
    Schema(Option<String>),
    NetworkTimeout(Option<Duration>),
}

impl AttributeValue {
    pub fn attribute(&self) -> Attribute {
        match self {
            AttributeValue::AutoCommit(_) => Attribute::AutoCommit,
            AttributeValue::Isolation(_) => Attribute::Isolation,
            AttributeValue::ReadOnly(_) => Attribute::ReadOnly,
            AttributeValue::Catalog(_) => Attribute::Catalog,
            AttributeValue::Schema(_) => Attribute::Schema,
            AttributeValue::NetworkTimeout(_) => Attribute::NetworkTimeout,
        }
    }
}

/// How a statement was created; part of the statement cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Plain,
    Prepared,
    Callable,
}

/// What happens to open result sets when a statement moves on to its next result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ResultDisposition {
    /// Close the current result set.
    #[default]
    CloseCurrent,
    /// Keep the current result set open alongside the next one.
    KeepCurrent,
    /// Close the current result set and every result set kept before it.
    CloseAll,
}

/// A raw connection opened by a driver.
pub trait RawConnection: Send + 'static {
    /// The backend name, for diagnostics.
    fn name(&self) -> &str;

    /// Driver features beyond the required set.
    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    fn attribute(&mut self, attribute: Attribute) -> Result<AttributeValue>;

    fn set_attribute(&mut self, value: &AttributeValue) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    /// Checks if the connection is still usable, waiting at most `timeout`.
    fn is_valid(&mut self, timeout: Duration) -> Result<bool> {
        let _ = timeout;
        Err(Error::UnsupportedOperation("is_valid"))
    }

    fn clear_warnings(&mut self) -> Result<()> {
        Ok(())
    }

    fn create_statement(&mut self) -> Result<Box<dyn RawStatement>>;

    fn prepare(&mut self, sql: &str, kind: StatementKind) -> Result<Box<dyn RawStatement>>;

    /// Explicitly close this connection.
    fn close(&mut self) -> Result<()>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A raw statement created by a [`RawConnection`].
///
/// Methods taking `sql: Option<&str>` receive `Some` for plain statements and `None`
/// for prepared or callable statements, which execute their prepared text.
pub trait RawStatement: Send + 'static {
    /// Executes the statement, returning `true` if the first result is a result set.
    fn execute(&mut self, sql: Option<&str>) -> Result<bool>;

    fn execute_update(&mut self, sql: Option<&str>) -> Result<u64>;

    fn execute_query(&mut self, sql: Option<&str>) -> Result<Box<dyn RawResultSet>>;

    /// The current result as a result set, if it is one.
    fn result_set(&mut self) -> Result<Option<Box<dyn RawResultSet>>>;

    /// The current result as an update count, if it is one.
    fn update_count(&mut self) -> Result<Option<u64>>;

    /// Moves to the next result, returning `true` if it is a result set.
    fn more_results(&mut self, disposition: ResultDisposition) -> Result<bool>;

    fn bind(&mut self, index: usize, value: Value) -> Result<()> {
        let _ = (index, value);
        Err(Error::UnsupportedOperation("bind"))
    }

    fn clear_parameters(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A raw result set produced by a [`RawStatement`].
pub trait RawResultSet: Send + 'static {
    /// Advances to the next row, returning `false` past the last row.
    fn next(&mut self) -> Result<bool>;

    /// Reads a column of the current row. Columns are numbered from 1.
    fn get(&mut self, column: usize) -> Result<Value>;

    fn close(&mut self) -> Result<()>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_indices_follow_declaration_order() {
        for (i, attribute) in Attribute::ALL.iter().enumerate() {
            assert_eq!(attribute.index(), i);
        }
    }

    #[test]
    fn attribute_values_know_their_attribute() {
        let value = AttributeValue::Schema(Some("audit".into()));
        assert_eq!(value.attribute(), Attribute::Schema);
        assert_eq!(
            value.attribute().required_capability(),
            Some(Capabilities::SCHEMA)
        );
        assert_eq!(Attribute::ReadOnly.required_capability(), None);
    }
}
