use std::io::Write;
use std::time::Duration;

use sqlpool::{AttributeValue, Error, IsolationLevel, PoolConfig};
use sqlpool_test::{options, pool, Event, MockDriver};

#[test]
fn it_builds_a_pool_from_a_config_file() -> anyhow::Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    writeln!(
        file,
        r#"
[pool]
min-connections = 2
max-connections = 3
acquire-timeout-ms = 250
idle-timeout-ms = 0
default-isolation = "serializable"
"#
    )?;

    let options = PoolConfig::from_file(file.path())?.apply(options());

    assert_eq!(options.get_min_connections(), 2);
    assert_eq!(options.get_max_connections(), 3);
    assert_eq!(options.get_acquire_timeout(), Duration::from_millis(250));
    assert_eq!(options.get_idle_timeout(), None);

    let driver = MockDriver::new();
    let pool = pool(&driver, options)?;

    assert_eq!(pool.size(), 2);
    assert_eq!(
        driver.count(|e| matches!(
            e,
            Event::SetAttribute(_, AttributeValue::Isolation(IsolationLevel::Serializable))
        )),
        2
    );

    let mut conn = pool.acquire()?;
    assert_eq!(conn.isolation_level()?, IsolationLevel::Serializable);

    Ok(())
}

#[test]
fn it_keeps_settings_the_file_leaves_out() -> anyhow::Result<()> {
    let config = PoolConfig::from_toml_str(
        r#"
[pool]
fair = false
"#,
    )?;

    let defaults = options();
    let options = config.apply(options());

    assert_eq!(options.get_max_connections(), defaults.get_max_connections());
    assert_eq!(options.get_acquire_timeout(), defaults.get_acquire_timeout());
    assert_eq!(options.get_idle_timeout(), defaults.get_idle_timeout());

    Ok(())
}

#[test]
fn it_reports_a_missing_file_as_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let error = PoolConfig::from_file(dir.path().join("sqlpool.toml")).unwrap_err();

    assert!(matches!(error, Error::Configuration(_)));
    assert!(error.to_string().contains("sqlpool.toml"));
}

#[test]
fn it_rejects_settings_the_pool_cannot_run_with() -> anyhow::Result<()> {
    let config = PoolConfig::from_toml_str(
        r#"
[pool]
min-connections = 4
max-connections = 2
"#,
    )?;

    let driver = MockDriver::new();
    let result = pool(&driver, config.apply(options()));

    let error = result.unwrap_err();
    assert!(matches!(
        error.downcast_ref::<Error>(),
        Some(Error::Configuration(_))
    ));
    assert_eq!(driver.connects(), 0);

    Ok(())
}
