use std::time::Duration;

use sqlpool::{Pool, PoolOptions};

pub use self::mock::{Event, MockConnection, MockDriver, MockError, MockResultSet, MockStatement};

mod mock;

pub fn setup_if_needed() {
    let _ = dotenvy::dotenv();
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Options suited to tests: short timeouts and no background churn.
pub fn options() -> PoolOptions {
    PoolOptions::new()
        .min_connections(0)
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .maintenance_interval(Duration::from_secs(3600))
        .close_timeout(Duration::from_millis(500))
}

// Make a new pool over `driver`
// Ensure [dotenvy] and [env_logger] have been setup
pub fn pool(driver: &MockDriver, options: PoolOptions) -> anyhow::Result<Pool> {
    setup_if_needed();

    Ok(options.connect(driver.connector())?)
}
