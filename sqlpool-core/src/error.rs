//! Types for working with errors produced by sqlpool.

use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::result::Result as StdResult;
use std::time::Duration;

/// A specialized `Result` type for sqlpool.
pub type Result<T, E = Error> = StdResult<T, E>;

// Convenience type alias for usage within sqlpool.
pub type BoxDynError = Box<dyn StdError + 'static + Send + Sync>;

/// The kind of handle an operation was attempted on after it had been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Connection,
    Statement,
    ResultSet,
}

impl Display for HandleKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HandleKind::Connection => "connection",
            HandleKind::Statement => "statement",
            HandleKind::ResultSet => "result set",
        })
    }
}

/// Represents all the ways a method can fail within sqlpool.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Error returned from the database.
    #[error("error returned from database: {0}")]
    Database(Box<dyn DatabaseError>),

    /// Error communicating with the database backend.
    #[error("error communicating with the server: {0}")]
    Io(#[from] io::Error),

    /// Any other error reported by a driver.
    #[error("error reported by the driver: {0}")]
    Driver(#[source] BoxDynError),

    /// The pool options are inconsistent or could not be loaded.
    #[error("invalid pool configuration: {0}")]
    Configuration(Cow<'static, str>),

    /// [`Pool::acquire`] or a return was attempted after [`Pool::close`], or while
    /// [`Pool::clear_all`] was resetting the pool.
    ///
    /// [`Pool::acquire`]: crate::pool::Pool::acquire
    /// [`Pool::close`]: crate::pool::Pool::close
    /// [`Pool::clear_all`]: crate::pool::Pool::clear_all
    #[error("attempted to acquire a connection on a closed pool")]
    PoolClosed,

    /// No connection became available before the acquire deadline.
    #[error("pool timed out after {waited:?} while waiting for an open connection")]
    BorrowTimeout { waited: Duration },

    /// The waiting borrower was cancelled through its [`CancelToken`].
    ///
    /// [`CancelToken`]: crate::pool::CancelToken
    #[error("interrupted while waiting for a pooled connection")]
    BorrowInterrupted,

    /// The connection factory failed to open a new connection.
    #[error("failed to open a new connection: {0}")]
    ResourceCreationFailed(#[source] Box<Error>),

    /// A pooled connection failed its validation probe.
    #[error("pooled connection failed validation")]
    ResourceInvalid,

    /// An operation was attempted on a handle after it was closed.
    #[error("no operations allowed after {0} closed")]
    HandleClosed(HandleKind),

    /// Auto-commit was changed while a transaction had uncommitted work.
    #[error("execute `commit` or `rollback` before changing auto-commit")]
    AttributeResetForbidden,

    /// The driver does not support the requested operation.
    #[error("operation not supported by the driver: {0}")]
    UnsupportedOperation(&'static str),

    /// The wrapped driver object is not of the requested type.
    #[error("wrapped delegate is not an instance of `{0}`")]
    NotWrapper(&'static str),
}

impl Error {
    #[inline]
    pub fn config(err: impl Into<Cow<'static, str>>) -> Self {
        Error::Configuration(err.into())
    }

    #[inline]
    pub fn driver(err: impl StdError + Send + Sync + 'static) -> Self {
        Error::Driver(err.into())
    }

    /// Returns `true` if this error reports use of a closed handle.
    pub fn is_handle_closed(&self) -> bool {
        matches!(self, Error::HandleClosed(_))
    }
}

/// An error that was returned from the database.
pub trait DatabaseError: 'static + Send + Sync + StdError {
    /// The primary, human-readable error message.
    fn message(&self) -> &str;

    /// The (SQLSTATE) code for the error.
    fn code(&self) -> Option<Cow<'_, str>> {
        None
    }
}

impl<E> From<E> for Error
where
    E: DatabaseError,
{
    #[inline]
    fn from(error: E) -> Self {
        Error::Database(Box::new(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn handle_closed_names_the_handle() {
        let err = Error::HandleClosed(HandleKind::ResultSet);
        assert_eq!(err.to_string(), "no operations allowed after result set closed");
        assert!(err.is_handle_closed());
    }

    #[test]
    fn creation_failure_keeps_its_source() {
        let err = Error::ResourceCreationFailed(Box::new(Error::config("bad url")));
        let source = err.source().map(ToString::to_string);
        assert_eq!(
            source.as_deref(),
            Some("invalid pool configuration: bad url")
        );
    }
}
