//! Provides the connection pool for blocking, thread-based database drivers.
//!
//! Opening a database connection for each and every operation is very wasteful and slow.
//! [`Pool`] keeps a bounded set of connections open and lends them out to callers on many
//! threads. A connection is returned to the pool when its [`PoolConnection`] handle is closed
//! or dropped; before it is reused, uncommitted work is rolled back and any attribute the
//! borrower changed is restored to the pool default.
//!
//! ### Fairness
//! With [`PoolOptions::fair`] enabled (the default), callers that have to wait are served in
//! the order they arrived, and a returned connection is handed straight to the oldest waiter.
//!
//! ### Statement handles
//! Statements and result sets created through a [`PoolConnection`] are closed with it, and
//! fail with [`Error::HandleClosed`][crate::error::Error::HandleClosed] once it is returned.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use self::shared::SharedPool;
use crate::connection::{Capabilities, Connect};
use crate::error::Result;
use crate::proxy::PoolConnection;

pub use self::borrower::CancelToken;
pub use self::options::PoolOptions;
pub use self::pooled::{ConnectionId, ConnectionState};

mod borrower;
mod maintainer;
mod options;
pub(crate) mod pooled;
pub(crate) mod shared;
mod size;

/// A pool of database connections.
///
/// Cloning a `Pool` is cheap; every clone refers to the same set of connections. The pool
/// is closed once [`close`][Pool::close] is called or the last reference to it (including
/// every checked-out connection) is dropped.
#[derive(Clone)]
pub struct Pool(pub(crate) Arc<SharedPool>);

/// Lifecycle of a [`Pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolState {
    /// Created but not yet started.
    Uninit = 0,
    /// Serving connections.
    Normal = 1,
    /// Closed for good.
    Closed = 2,
    /// Temporarily refusing new acquires while [`Pool::clear_all`] runs.
    Resting = 3,
}

impl PoolState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => PoolState::Uninit,
            1 => PoolState::Normal,
            3 => PoolState::Resting,
            _ => PoolState::Closed,
        }
    }
}

/// A point-in-time view of a pool's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub state: PoolState,
    /// Open connections plus connections being opened.
    pub size: u32,
    pub max_size: u32,
    pub idle: usize,
    pub in_use: usize,
    /// Callers currently blocked in [`Pool::acquire`].
    pub waiting: usize,
}

impl Pool {
    /// Returns a [`PoolOptions`] to configure a new connection pool.
    pub fn builder() -> PoolOptions {
        PoolOptions::new()
    }

    /// Creates a pool with the default configuration, opening one connection up-front.
    pub fn connect(connector: impl Connect) -> Result<Self> {
        PoolOptions::new().connect(connector)
    }

    /// Creates a pool with the default configuration without opening any connections.
    pub fn connect_lazy(connector: impl Connect) -> Result<Self> {
        PoolOptions::new().build(connector)
    }

    /// Retrieves a connection from the pool.
    ///
    /// Waits for at most the configured acquire timeout before returning
    /// [`Error::BorrowTimeout`][crate::error::Error::BorrowTimeout].
    pub fn acquire(&self) -> Result<PoolConnection> {
        self.acquire_timeout(self.0.options.acquire_timeout)
    }

    /// Retrieves a connection from the pool, waiting for at most `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<PoolConnection> {
        let conn = self.0.acquire(timeout, None)?;
        Ok(PoolConnection::new(conn, Arc::clone(&self.0)))
    }

    /// Retrieves a connection from the pool; the wait can be interrupted through `token`.
    pub fn acquire_with(&self, token: &CancelToken) -> Result<PoolConnection> {
        let conn = self.0.acquire(self.0.options.acquire_timeout, Some(token))?;
        Ok(PoolConnection::new(conn, Arc::clone(&self.0)))
    }

    /// Attempts to retrieve a connection from the pool if there is one available.
    ///
    /// Returns `None` immediately if there are no idle connections available in the pool.
    pub fn try_acquire(&self) -> Option<PoolConnection> {
        let conn = self.0.try_acquire()?;
        Some(PoolConnection::new(conn, Arc::clone(&self.0)))
    }

    /// Ends the use of a connection pool. Prevents any new connections
    /// and will close all idle connections.
    ///
    /// Connections still checked out are closed when returned, or after the configured
    /// close timeout at the latest. Waiting callers fail with
    /// [`Error::PoolClosed`][crate::error::Error::PoolClosed].
    ///
    /// Calling this more than once is a no-op.
    pub fn close(&self) {
        self.0.close();
    }

    /// Returns `true` if [`.close()`][Pool::close] has been called on the pool.
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    /// Closes every idle connection and replaces the pool's connections with fresh ones.
    ///
    /// With `force`, checked-out connections are closed immediately and their handles fail
    /// with [`Error::HandleClosed`][crate::error::Error::HandleClosed]; otherwise they are
    /// closed when returned.
    pub fn clear_all(&self, force: bool) -> Result<()> {
        self.0.clear_all(force)
    }

    /// Changes the maximum number of connections.
    ///
    /// Shrinking closes idle connections above the new maximum right away and checked-out
    /// ones when they are returned.
    pub fn resize(&self, max_connections: u32) -> Result<()> {
        self.0.resize(max_connections)
    }

    /// Returns the number of connections currently active. This includes idle connections.
    pub fn size(&self) -> u32 {
        self.0.size.current()
    }

    /// Returns the number of connections active and idle (not in use).
    pub fn num_idle(&self) -> usize {
        self.0.num_idle()
    }

    pub fn state(&self) -> PoolState {
        self.0.state()
    }

    /// Returns a point-in-time view of the pool's counters.
    pub fn snapshot(&self) -> PoolSnapshot {
        self.0.snapshot()
    }

    /// Driver capabilities, once the first connection has been opened.
    pub fn capabilities(&self) -> Option<Capabilities> {
        self.0.capabilities()
    }

    /// Returns the options used to create this pool.
    pub fn options(&self) -> &PoolOptions {
        &self.0.options
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();

        fmt.debug_struct("Pool")
            .field("state", &snapshot.state)
            .field("size", &snapshot.size)
            .field("num_idle", &snapshot.idle)
            .field("in_use", &snapshot.in_use)
            .field("options", &self.0.options)
            .finish()
    }
}
