#![doc = include_str!("../README.md")]

// Modules
pub use sqlpool_core::{closed, connection, error, isolation_level, pool, proxy, value};

#[cfg(feature = "toml")]
pub use sqlpool_core::config;

// Types
pub use sqlpool_core::{
    Attribute, AttributeValue, BoxDynError, CancelToken, Capabilities, Connect, DatabaseError,
    Error, HandleKind, IsolationLevel, Pool, PoolConnection, PoolOptions, PoolPreparedStatement,
    PoolResultSet, PoolSnapshot, PoolState, PoolStatement, RawConnection, RawResultSet,
    RawStatement, Result, ResultDisposition, StatementKind, Value,
};

#[cfg(feature = "toml")]
pub use sqlpool_core::PoolConfig;
