//! An in-memory driver that records every call the pool makes.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use sqlpool::{
    Attribute, AttributeValue, Capabilities, Connect, Error, IsolationLevel, RawConnection,
    RawResultSet, RawStatement, Result, ResultDisposition, StatementKind, Value,
};

/// A driver call, tagged with the id of the object it was made on.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connected(u64),
    SetAttribute(u64, AttributeValue),
    Commit(u64),
    Rollback(u64),
    ClearWarnings(u64),
    Validated(u64),
    Prepared(u64, String),
    Executed(u64, String),
    StatementClosed(u64),
    ResultSetClosed(u64),
    Closed(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum MockError {
    #[error("connection refused")]
    ConnectionRefused,

    #[error("connection {0} is broken")]
    Broken(u64),

    #[error("statement returned no rows")]
    NoRows,

    #[error("rollback failed on connection {0}")]
    RollbackFailed(u64),
}

struct Shared {
    events: Mutex<Vec<Event>>,
    // ids are shared by connections, statements and result sets
    next_id: AtomicU64,
    connects: AtomicUsize,
    open: AtomicUsize,
    fail_connect: AtomicBool,
    fail_rollback: AtomicBool,
    // connections with an id up to this one are broken
    broken_up_to: AtomicU64,
    capabilities: Capabilities,
    connect_delay: Duration,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }

    fn is_broken(&self, conn: u64) -> bool {
        conn <= self.broken_up_to.load(Ordering::SeqCst)
    }
}

/// Opens [`MockConnection`]s and keeps a log of what was done with them.
#[derive(Clone)]
pub struct MockDriver(Arc<Shared>);

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    pub fn new() -> Self {
        Self::with_options(Capabilities::all(), Duration::ZERO)
    }

    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self::with_options(capabilities, Duration::ZERO)
    }

    /// Every connect sleeps for `delay` first.
    pub fn with_connect_delay(delay: Duration) -> Self {
        Self::with_options(Capabilities::all(), delay)
    }

    fn with_options(capabilities: Capabilities, connect_delay: Duration) -> Self {
        MockDriver(Arc::new(Shared {
            events: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            connects: AtomicUsize::new(0),
            open: AtomicUsize::new(0),
            fail_connect: AtomicBool::new(false),
            fail_rollback: AtomicBool::new(false),
            broken_up_to: AtomicU64::new(0),
            capabilities,
            connect_delay,
        }))
    }

    pub fn connector(&self) -> impl Connect {
        let driver = self.clone();
        move || driver.connect()
    }

    fn connect(&self) -> Result<Box<dyn RawConnection>> {
        if !self.0.connect_delay.is_zero() {
            thread::sleep(self.0.connect_delay);
        }

        if self.0.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::driver(MockError::ConnectionRefused));
        }

        let id = self.0.next_id();
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        self.0.open.fetch_add(1, Ordering::SeqCst);
        self.0.record(Event::Connected(id));

        Ok(Box::new(MockConnection {
            id,
            shared: self.0.clone(),
            auto_commit: true,
            isolation: IsolationLevel::ReadCommitted,
            read_only: false,
            catalog: Some("main".into()),
            schema: Some("public".into()),
            network_timeout: None,
            closed: false,
        }))
    }

    /// Makes subsequent connects fail.
    pub fn set_fail_connect(&self, fail: bool) {
        self.0.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Makes every rollback fail, including the one the pool issues when a connection returns.
    pub fn set_fail_rollback(&self, fail: bool) {
        self.0.fail_rollback.store(fail, Ordering::SeqCst);
    }

    /// Breaks every connection opened so far: validation fails and statements error.
    pub fn break_existing(&self) {
        let last = self.0.next_id.load(Ordering::SeqCst) - 1;
        self.0.broken_up_to.store(last, Ordering::SeqCst);
    }

    /// Number of successful connects.
    pub fn connects(&self) -> usize {
        self.0.connects.load(Ordering::SeqCst)
    }

    /// Connections opened and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.0.open.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.events.lock().clone()
    }

    pub fn count(&self, filter: impl Fn(&Event) -> bool) -> usize {
        self.0.events.lock().iter().filter(|event| filter(event)).count()
    }

    pub fn clear_events(&self) {
        self.0.events.lock().clear();
    }
}

pub struct MockConnection {
    id: u64,
    shared: Arc<Shared>,
    auto_commit: bool,
    isolation: IsolationLevel,
    read_only: bool,
    catalog: Option<String>,
    schema: Option<String>,
    network_timeout: Option<Duration>,
    closed: bool,
}

impl MockConnection {
    /// The driver-level id of this connection, as recorded in [`Event`]s.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn statement(&self, sql: Option<&str>) -> MockStatement {
        MockStatement {
            id: self.shared.next_id(),
            conn: self.id,
            shared: self.shared.clone(),
            sql: sql.map(str::to_owned),
            params: Vec::new(),
            results: VecDeque::new(),
        }
    }
}

impl RawConnection for MockConnection {
    fn name(&self) -> &str {
        "mock"
    }

    fn capabilities(&self) -> Capabilities {
        self.shared.capabilities
    }

    fn attribute(&mut self, attribute: Attribute) -> Result<AttributeValue> {
        Ok(match attribute {
            Attribute::AutoCommit => AttributeValue::AutoCommit(self.auto_commit),
            Attribute::Isolation => AttributeValue::Isolation(self.isolation),
            Attribute::ReadOnly => AttributeValue::ReadOnly(self.read_only),
            Attribute::Catalog => AttributeValue::Catalog(self.catalog.clone()),
            Attribute::Schema => AttributeValue::Schema(self.schema.clone()),
            Attribute::NetworkTimeout => AttributeValue::NetworkTimeout(self.network_timeout),
        })
    }

    fn set_attribute(&mut self, value: &AttributeValue) -> Result<()> {
        self.shared.record(Event::SetAttribute(self.id, value.clone()));

        match value {
            AttributeValue::AutoCommit(auto_commit) => self.auto_commit = *auto_commit,
            AttributeValue::Isolation(level) => self.isolation = *level,
            AttributeValue::ReadOnly(read_only) => self.read_only = *read_only,
            AttributeValue::Catalog(catalog) => self.catalog.clone_from(catalog),
            AttributeValue::Schema(schema) => self.schema.clone_from(schema),
            AttributeValue::NetworkTimeout(timeout) => self.network_timeout = *timeout,
        }

        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.shared.record(Event::Commit(self.id));
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.shared.record(Event::Rollback(self.id));

        if self.shared.fail_rollback.load(Ordering::SeqCst) {
            return Err(Error::driver(MockError::RollbackFailed(self.id)));
        }

        Ok(())
    }

    fn is_valid(&mut self, _timeout: Duration) -> Result<bool> {
        self.shared.record(Event::Validated(self.id));
        Ok(!self.shared.is_broken(self.id))
    }

    fn clear_warnings(&mut self) -> Result<()> {
        self.shared.record(Event::ClearWarnings(self.id));
        Ok(())
    }

    fn create_statement(&mut self) -> Result<Box<dyn RawStatement>> {
        Ok(Box::new(self.statement(None)))
    }

    fn prepare(&mut self, sql: &str, _kind: StatementKind) -> Result<Box<dyn RawStatement>> {
        self.shared.record(Event::Prepared(self.id, sql.to_owned()));
        Ok(Box::new(self.statement(Some(sql))))
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.shared.open.fetch_sub(1, Ordering::SeqCst);
            self.shared.record(Event::Closed(self.id));
        }

        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

enum MockResult {
    Rows(Vec<i64>),
    Count(u64),
}

/// Executes `;`-separated SQL. Each `SELECT` produces the rows `1..=3`, anything else an
/// update count of one.
pub struct MockStatement {
    id: u64,
    conn: u64,
    shared: Arc<Shared>,
    sql: Option<String>,
    params: Vec<(usize, Value)>,
    results: VecDeque<MockResult>,
}

impl MockStatement {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn params(&self) -> &[(usize, Value)] {
        &self.params
    }

    fn run(&mut self, sql: Option<&str>) -> Result<()> {
        if self.shared.is_broken(self.conn) {
            return Err(Error::driver(MockError::Broken(self.conn)));
        }

        let sql = sql.or(self.sql.as_deref()).unwrap_or_default().to_owned();

        self.results = sql
            .split(';')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                if part.to_ascii_uppercase().starts_with("SELECT") {
                    MockResult::Rows(vec![1, 2, 3])
                } else {
                    MockResult::Count(1)
                }
            })
            .collect();

        self.shared.record(Event::Executed(self.conn, sql));
        Ok(())
    }

    fn take_rows(&mut self) -> Option<Box<dyn RawResultSet>> {
        match self.results.front_mut() {
            Some(MockResult::Rows(rows)) => Some(Box::new(MockResultSet {
                id: self.shared.next_id(),
                shared: self.shared.clone(),
                rows: std::mem::take(rows).into(),
                current: None,
            })),
            _ => None,
        }
    }
}

impl RawStatement for MockStatement {
    fn execute(&mut self, sql: Option<&str>) -> Result<bool> {
        self.run(sql)?;
        Ok(matches!(self.results.front(), Some(MockResult::Rows(_))))
    }

    fn execute_update(&mut self, sql: Option<&str>) -> Result<u64> {
        self.run(sql)?;

        Ok(match self.results.front() {
            Some(MockResult::Count(count)) => *count,
            _ => 0,
        })
    }

    fn execute_query(&mut self, sql: Option<&str>) -> Result<Box<dyn RawResultSet>> {
        self.run(sql)?;
        self.take_rows()
            .ok_or_else(|| Error::driver(MockError::NoRows))
    }

    fn result_set(&mut self) -> Result<Option<Box<dyn RawResultSet>>> {
        Ok(self.take_rows())
    }

    fn update_count(&mut self) -> Result<Option<u64>> {
        Ok(match self.results.front() {
            Some(MockResult::Count(count)) => Some(*count),
            _ => None,
        })
    }

    fn more_results(&mut self, _disposition: ResultDisposition) -> Result<bool> {
        self.results.pop_front();
        Ok(matches!(self.results.front(), Some(MockResult::Rows(_))))
    }

    fn bind(&mut self, index: usize, value: Value) -> Result<()> {
        self.params.retain(|(i, _)| *i != index);
        self.params.push((index, value));
        Ok(())
    }

    fn clear_parameters(&mut self) -> Result<()> {
        self.params.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.shared.record(Event::StatementClosed(self.id));
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct MockResultSet {
    id: u64,
    shared: Arc<Shared>,
    rows: VecDeque<i64>,
    current: Option<i64>,
}

impl MockResultSet {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl RawResultSet for MockResultSet {
    fn next(&mut self) -> Result<bool> {
        self.current = self.rows.pop_front();
        Ok(self.current.is_some())
    }

    fn get(&mut self, column: usize) -> Result<Value> {
        match (column, self.current) {
            (1, Some(value)) => Ok(Value::Int(value)),
            _ => Ok(Value::Null),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.shared.record(Event::ResultSetClosed(self.id));
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
