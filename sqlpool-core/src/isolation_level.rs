use std::fmt::{self, Display, Formatter};

/// Transaction isolation level; controls the degree of locking that occurs
/// when selecting data.
///
/// See <https://en.wikipedia.org/wiki/Isolation_(database_systems)#Isolation_levels>.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "toml",
    derive(serde::Deserialize),
    serde(rename_all = "kebab-case")
)]
pub enum IsolationLevel {
    /// Transactions are not supported by the connection.
    None,

    /// The lowest isolation level. Dirty reads are allowed, so one transaction
    /// may see **not yet committed** changes made by other transactions.
    ReadUncommitted,

    /// A `SELECT` query will only see data that has been committed before the
    /// query began.
    ReadCommitted,

    /// A `SELECT` query will only see data committed before the transaction
    /// began.
    RepeatableRead,

    Serializable,
}

impl Display for IsolationLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IsolationLevel::None => "NONE",
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        })
    }
}
