use std::collections::HashSet;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use sqlpool::{
    AttributeValue, Capabilities, Error, HandleKind, IsolationLevel, ResultDisposition, Value,
};
use sqlpool_test::{options, pool, Event, MockConnection, MockDriver, MockStatement};

fn driver_id(conn: &mut sqlpool::PoolConnection) -> anyhow::Result<u64> {
    Ok(conn.with_raw::<MockConnection, _>(|raw| raw.id())?)
}

#[test]
fn it_fails_a_returned_connection_and_its_children() -> anyhow::Result<()> {
    let driver = MockDriver::new();
    let pool = pool(&driver, options())?;

    let mut conn = pool.acquire()?;
    let mut statement = conn.create_statement()?;
    let mut rows = statement.execute_query("SELECT id FROM users")?;
    let mut prepared = conn.prepare("SELECT id FROM users WHERE id = ?")?;

    conn.close()?;
    conn.close()?;

    assert!(conn.is_closed());
    assert!(matches!(
        conn.commit(),
        Err(Error::HandleClosed(HandleKind::Connection))
    ));
    assert!(matches!(
        conn.create_statement(),
        Err(Error::HandleClosed(HandleKind::Connection))
    ));
    assert!(matches!(
        statement.execute("SELECT 1"),
        Err(Error::HandleClosed(HandleKind::Statement))
    ));
    assert!(matches!(
        prepared.execute(),
        Err(Error::HandleClosed(HandleKind::Statement))
    ));
    assert!(matches!(
        rows.next(),
        Err(Error::HandleClosed(HandleKind::ResultSet))
    ));

    assert!(statement.is_closed());
    assert!(prepared.is_closed());
    assert!(rows.is_closed());
    assert!(!conn.is_valid(Duration::from_secs(1))?);

    // the connection itself went back to the pool
    assert_eq!(pool.num_idle(), 1);

    Ok(())
}

#[test]
fn it_rolls_back_uncommitted_work_and_restores_auto_commit() -> anyhow::Result<()> {
    let driver = MockDriver::new();
    let pool = pool(&driver, options().max_connections(1))?;

    let mut conn = pool.acquire()?;
    let id = driver_id(&mut conn)?;

    conn.set_auto_commit(false)?;
    conn.execute("INSERT INTO audit VALUES (1)")?;

    driver.clear_events();
    drop(conn);

    assert_eq!(
        driver.events(),
        vec![
            Event::Rollback(id),
            Event::SetAttribute(id, AttributeValue::AutoCommit(true)),
            Event::ClearWarnings(id),
        ]
    );

    let conn = pool.acquire()?;
    assert!(conn.auto_commit()?);

    Ok(())
}

#[test]
fn it_skips_resets_on_clean_returns() -> anyhow::Result<()> {
    let driver = MockDriver::new();
    let pool = pool(&driver, options().max_connections(2))?;

    driver.clear_events();

    for _ in 0..50 {
        let mut conn = pool.acquire()?;
        conn.execute("UPDATE counters SET n = n + 1")?;
    }

    assert_eq!(driver.count(|e| matches!(e, Event::SetAttribute(..))), 0);
    assert_eq!(driver.count(|e| matches!(e, Event::Rollback(_))), 0);

    Ok(())
}

#[test]
fn it_restores_only_changed_attributes() -> anyhow::Result<()> {
    let driver = MockDriver::new();
    let pool = pool(&driver, options())?;

    let mut conn = pool.acquire()?;
    let id = driver_id(&mut conn)?;

    conn.set_read_only(true)?;
    conn.set_schema(Some("audit"))?;
    // the pool default; nothing to restore
    conn.set_isolation_level(IsolationLevel::ReadCommitted)?;

    assert!(conn.is_read_only()?);
    assert_eq!(conn.schema()?.as_deref(), Some("audit"));

    driver.clear_events();
    drop(conn);

    let mut restored: Vec<_> = driver
        .events()
        .into_iter()
        .filter_map(|event| match event {
            Event::SetAttribute(conn, value) if conn == id => Some(value),
            _ => None,
        })
        .collect();
    restored.sort_by_key(|value| value.attribute().index());

    assert_eq!(
        restored,
        vec![
            AttributeValue::ReadOnly(false),
            AttributeValue::Schema(Some("public".into())),
        ]
    );

    Ok(())
}

#[test]
fn it_forbids_auto_commit_changes_with_uncommitted_work() -> anyhow::Result<()> {
    let driver = MockDriver::new();
    let pool = pool(&driver, options())?;

    let mut conn = pool.acquire()?;
    conn.set_auto_commit(false)?;
    conn.execute("DELETE FROM sessions")?;

    assert!(matches!(
        conn.set_auto_commit(true),
        Err(Error::AttributeResetForbidden)
    ));

    conn.commit()?;
    conn.set_auto_commit(true)?;
    assert!(conn.auto_commit()?);

    Ok(())
}

#[test]
fn it_applies_configured_defaults_to_new_connections() -> anyhow::Result<()> {
    let driver = MockDriver::new();
    let pool = pool(&driver, options().default_read_only(true))?;

    assert_eq!(
        driver.count(|e| matches!(e, Event::SetAttribute(_, AttributeValue::ReadOnly(true)))),
        1
    );

    let mut conn = pool.acquire()?;
    assert!(conn.is_read_only()?);

    // matches the default, so nothing is reset on return
    conn.set_read_only(true)?;
    driver.clear_events();
    drop(conn);

    assert_eq!(driver.count(|e| matches!(e, Event::SetAttribute(..))), 0);

    Ok(())
}

#[test]
fn it_rejects_attributes_the_driver_does_not_support() -> anyhow::Result<()> {
    let driver = MockDriver::with_capabilities(Capabilities::IS_VALID);
    let pool = pool(&driver, options())?;

    assert_eq!(pool.capabilities(), Some(Capabilities::IS_VALID));

    let mut conn = pool.acquire()?;
    assert!(matches!(
        conn.set_schema(Some("audit")),
        Err(Error::UnsupportedOperation(_))
    ));
    assert!(matches!(
        conn.network_timeout(),
        Err(Error::UnsupportedOperation(_))
    ));
    assert!(conn.is_valid(Duration::from_secs(1))?);

    Ok(())
}

#[test]
fn it_bounds_the_statement_cache_and_closes_evicted_statements_once() -> anyhow::Result<()> {
    let driver = MockDriver::new();
    let pool = pool(&driver, options().statement_cache_capacity(2))?;

    let mut conn = pool.acquire()?;

    for sql in ["SELECT 1", "SELECT 2", "SELECT 3"] {
        conn.prepare(sql)?.close()?;
    }

    // "SELECT 1" was least recently used
    assert_eq!(driver.count(|e| matches!(e, Event::StatementClosed(_))), 1);

    conn.prepare("SELECT 2")?.close()?;
    conn.prepare("SELECT 1")?.close()?;

    let prepared = |sql: &str| {
        driver.count(|e| matches!(e, Event::Prepared(_, text) if text == sql))
    };
    assert_eq!(prepared("SELECT 1"), 2);
    assert_eq!(prepared("SELECT 2"), 1);
    assert_eq!(prepared("SELECT 3"), 1);

    drop(conn);
    pool.close();

    let closed: Vec<u64> = driver
        .events()
        .into_iter()
        .filter_map(|event| match event {
            Event::StatementClosed(id) => Some(id),
            _ => None,
        })
        .collect();

    let unique: HashSet<_> = closed.iter().collect();
    assert_eq!(closed.len(), 4);
    assert_eq!(unique.len(), 4);

    Ok(())
}

#[test]
fn it_prepares_a_private_statement_when_the_cached_one_is_in_use() -> anyhow::Result<()> {
    let driver = MockDriver::new();
    let pool = pool(&driver, options())?;

    let mut conn = pool.acquire()?;
    let mut first = conn.prepare("SELECT 1")?;
    let mut second = conn.prepare("SELECT 1")?;

    assert_eq!(driver.count(|e| matches!(e, Event::Prepared(..))), 2);

    // not cached; closed right away
    second.close()?;
    assert_eq!(driver.count(|e| matches!(e, Event::StatementClosed(_))), 1);

    // cached; stays open for the next caller
    first.close()?;
    assert_eq!(driver.count(|e| matches!(e, Event::StatementClosed(_))), 1);

    conn.prepare("SELECT 1")?;
    assert_eq!(driver.count(|e| matches!(e, Event::Prepared(..))), 2);

    Ok(())
}

#[test]
fn it_closes_traced_statements_with_their_connection() -> anyhow::Result<()> {
    let driver = MockDriver::new();
    let pool = pool(&driver, options().trace_statements(true))?;

    let mut conn = pool.acquire()?;
    let mut statement = conn.create_statement()?;
    let rows = statement.execute_query("SELECT * FROM users")?;
    let prepared = conn.prepare("SELECT 1")?;

    driver.clear_events();
    conn.close()?;

    assert!(statement.is_closed());
    assert!(prepared.is_closed());
    assert!(rows.is_closed());

    assert_eq!(driver.count(|e| matches!(e, Event::ResultSetClosed(_))), 1);
    // the prepared statement stays in the cache
    assert_eq!(driver.count(|e| matches!(e, Event::StatementClosed(_))), 1);

    Ok(())
}

#[test]
fn it_closes_results_on_reexecute_and_with_the_statement() -> anyhow::Result<()> {
    let driver = MockDriver::new();
    let pool = pool(&driver, options())?;

    let mut conn = pool.acquire()?;
    let mut statement = conn.create_statement()?;

    let mut first = statement.execute_query("SELECT 1")?;
    assert!(first.next()?);
    assert_eq!(first.get(1)?, Value::Int(1));

    let mut second = statement.execute_query("SELECT 2")?;
    assert!(first.is_closed());
    assert!(!second.is_closed());

    // closing a result set leaves its statement open
    second.close()?;
    second.close()?;
    assert!(!statement.is_closed());

    let third = statement.execute_query("SELECT 3")?;
    statement.close()?;
    assert!(third.is_closed());
    assert_eq!(driver.count(|e| matches!(e, Event::ResultSetClosed(_))), 3);

    Ok(())
}

#[test]
fn it_applies_result_dispositions() -> anyhow::Result<()> {
    let driver = MockDriver::new();
    let pool = pool(&driver, options())?;

    let mut conn = pool.acquire()?;
    let mut statement = conn.create_statement()?;

    assert!(statement.execute("SELECT 1; SELECT 2; SELECT 3; UPDATE t SET x = 1")?);
    let mut first = statement.result_set()?.expect("first result");

    assert!(statement.more_results(ResultDisposition::KeepCurrent)?);
    let second = statement.result_set()?.expect("second result");
    assert!(!first.is_closed());

    assert!(statement.more_results(ResultDisposition::CloseCurrent)?);
    assert!(second.is_closed());
    assert!(!first.is_closed());
    assert!(first.next()?);

    let third = statement.result_set()?.expect("third result");

    assert!(!statement.more_results(ResultDisposition::CloseAll)?);
    assert!(third.is_closed());
    assert!(first.is_closed());
    assert_eq!(statement.update_count()?, Some(1));
    assert!(statement.result_set()?.is_none());

    Ok(())
}

#[test]
fn it_binds_parameters_on_prepared_statements() -> anyhow::Result<()> {
    let driver = MockDriver::new();
    let pool = pool(&driver, options())?;

    let mut conn = pool.acquire()?;
    let mut statement = conn.prepare("UPDATE users SET name = ? WHERE id = ?")?;

    statement.bind(1, "ferris")?.bind(2, 7)?;
    assert_eq!(statement.execute_update()?, 1);

    let params = statement.with_raw(|raw: &mut MockStatement| raw.params().to_vec())?;
    assert_eq!(
        params,
        vec![(1, Value::Text("ferris".into())), (2, Value::Int(7))]
    );

    statement.clear_parameters()?;
    assert_eq!(statement.with_raw(|raw: &mut MockStatement| raw.params().len())?, 0);

    Ok(())
}

#[test]
fn it_unwraps_only_open_handles_of_the_right_type() -> anyhow::Result<()> {
    let driver = MockDriver::new();
    let pool = pool(&driver, options())?;

    let mut conn = pool.acquire()?;
    assert!(conn.is_wrapper_for::<MockConnection>());
    assert!(!conn.is_wrapper_for::<MockStatement>());
    assert!(matches!(
        conn.with_raw(|_: &mut MockStatement| ()),
        Err(Error::NotWrapper(_))
    ));

    let mut statement = conn.create_statement()?;
    assert!(statement.is_wrapper_for::<MockStatement>());
    statement.close()?;

    assert!(statement.is_wrapper_for::<MockStatement>());
    assert!(matches!(
        statement.with_raw(|_: &mut MockStatement| ()),
        Err(Error::HandleClosed(HandleKind::Statement))
    ));

    conn.close()?;
    assert!(conn.is_wrapper_for::<MockConnection>());
    assert!(matches!(
        conn.with_raw(|_: &mut MockConnection| ()),
        Err(Error::HandleClosed(HandleKind::Connection))
    ));

    Ok(())
}

#[test]
fn it_evicts_a_connection_instead_of_returning_it() -> anyhow::Result<()> {
    let driver = MockDriver::new();
    let pool = pool(&driver, options())?;

    let conn = pool.acquire()?;
    conn.evict();

    assert_eq!(pool.size(), 0);
    assert_eq!(driver.open_connections(), 0);

    assert!(pool.acquire().is_ok());
    assert_eq!(driver.connects(), 2);

    Ok(())
}

#[test]
fn it_closes_a_connection_while_another_thread_reads_its_results() -> anyhow::Result<()> {
    let driver = MockDriver::new();
    let pool = pool(&driver, options().max_connections(1))?;

    for _ in 0..200 {
        let mut conn = pool.acquire()?;
        let mut statement = conn.create_statement()?;
        let rows = statement.execute_query("SELECT id FROM users")?;

        let reader = thread::spawn(move || {
            // keeps the current result set alive so `result_set` hands it out again
            let _rows = rows;
            while statement.result_set().is_ok() {}
            statement
        });

        let (done, closed) = mpsc::channel();
        let closer = thread::spawn(move || {
            let closed = conn.close();
            let _ = done.send(());
            closed
        });

        if closed.recv_timeout(Duration::from_secs(5)).is_err() {
            anyhow::bail!("closing the connection blocked behind a statement call");
        }

        closer.join().unwrap()?;

        let statement = reader.join().unwrap();
        assert!(statement.is_closed());
    }

    assert_eq!(driver.connects(), 1);

    Ok(())
}
