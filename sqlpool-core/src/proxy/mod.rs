//! Handles lent out by the pool: connections, statements and result sets.
//!
//! Every handle wraps a driver object. Closing a handle closes the handles created through
//! it; once a [`PoolConnection`] is returned to the pool, any statement or result set still
//! held by the caller fails with [`Error::HandleClosed`] instead of reaching a connection
//! that now belongs to somebody else.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};

use crate::error::{Error, HandleKind, Result};
use crate::pool::pooled::PooledConnection;

pub use self::connection::PoolConnection;
pub use self::result_set::PoolResultSet;
pub use self::statement::{PoolPreparedStatement, PoolStatement};

mod connection;
mod result_set;
pub(crate) mod statement;

/// One checkout of a pooled connection, shared by every handle created during it.
///
/// Child handles hold the read lock for the duration of each driver call; ending the
/// lease takes the write lock, so it waits for in-flight calls and fails later ones.
/// A connection force-closed by the pool ends the lease as well.
pub(crate) struct Lease {
    open: RwLock<bool>,
    conn: Arc<PooledConnection>,
}

impl Lease {
    pub(crate) fn new(conn: Arc<PooledConnection>) -> Self {
        Lease {
            open: RwLock::new(true),
            conn,
        }
    }

    pub(crate) fn conn(&self) -> &Arc<PooledConnection> {
        &self.conn
    }

    pub(crate) fn enter(&self, kind: HandleKind) -> Result<RwLockReadGuard<'_, bool>> {
        let open = self.open.read();

        if *open && !self.conn.is_closed() {
            Ok(open)
        } else {
            Err(Error::HandleClosed(kind))
        }
    }

    pub(crate) fn end(&self) {
        *self.open.write() = false;
    }

    /// Never blocks behind a pending [`end`][Self::end], so it may be called by a thread that
    /// has already entered the lease.
    pub(crate) fn is_open(&self) -> bool {
        *self.open.read_recursive() && !self.conn.is_closed()
    }
}
