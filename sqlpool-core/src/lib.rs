//! Core of sqlpool, the blocking connection pool.
//!
//! This crate is not intended to be used directly; use `sqlpool` instead.

pub mod error;

#[macro_use]
mod logger;

mod cache;
pub mod closed;
pub mod connection;
pub mod isolation_level;
pub mod pool;
pub mod proxy;
pub mod value;

#[cfg(feature = "toml")]
pub mod config;

#[doc(inline)]
pub use self::{
    connection::{
        Attribute, AttributeValue, Capabilities, Connect, RawConnection, RawResultSet,
        RawStatement, ResultDisposition, StatementKind,
    },
    error::{BoxDynError, DatabaseError, Error, HandleKind, Result},
    isolation_level::IsolationLevel,
    pool::{CancelToken, Pool, PoolOptions, PoolSnapshot, PoolState},
    proxy::{PoolConnection, PoolPreparedStatement, PoolResultSet, PoolStatement},
    value::Value,
};

#[cfg(feature = "toml")]
#[doc(inline)]
pub use self::config::PoolConfig;
