use std::io;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::shared::SharedPool;

/// Handle to the background thread that reaps idle connections and keeps the pool at its
/// minimum size.
pub(super) struct Maintainer {
    control: Arc<Control>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct Control {
    state: Mutex<ControlState>,
    cond: Condvar,
}

#[derive(Default)]
struct ControlState {
    stopped: bool,
    nudged: bool,
}

impl Maintainer {
    pub fn new() -> Self {
        Maintainer {
            control: Arc::new(Control {
                state: Mutex::new(ControlState::default()),
                cond: Condvar::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn spawn(&self, pool: &Arc<SharedPool>, interval: Duration) -> io::Result<()> {
        // the thread must not keep the pool alive
        let pool = Arc::downgrade(pool);
        let control = self.control.clone();

        let handle = thread::Builder::new()
            .name("sqlpool-maintainer".into())
            .spawn(move || run(pool, control, interval))?;

        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Run a sweep now instead of waiting for the next interval.
    pub fn nudge(&self) {
        self.control.state.lock().nudged = true;
        self.control.cond.notify_one();
    }

    /// Stops the thread and waits for an in-progress sweep to finish.
    pub fn stop(&self) {
        self.control.state.lock().stopped = true;
        self.control.cond.notify_one();

        if let Some(handle) = self.handle.lock().take() {
            // the last pool reference may be released by the maintainer itself
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn run(pool: Weak<SharedPool>, control: Arc<Control>, interval: Duration) {
    loop {
        {
            let mut state = control.state.lock();

            if !state.stopped && !state.nudged {
                control.cond.wait_for(&mut state, interval);
            }

            if state.stopped {
                break;
            }

            state.nudged = false;
        }

        let Some(pool) = pool.upgrade() else {
            break;
        };

        if pool.is_closed() {
            break;
        }

        if pool.is_normal() {
            sweep_idle(&pool);
            top_up(&pool);
        }
    }

    tracing::debug!(target: "sqlpool::maintainer", "maintenance thread exiting");
}

/// Inspects every connection currently idle, closing the ones that expired or fail the
/// idle validation probe.
///
/// Connections are claimed (`Idle -> Using`) before being inspected, so one taken by a
/// borrower in the meantime is simply skipped.
fn sweep_idle(pool: &SharedPool) {
    let options = &pool.options;

    for _ in 0..pool.num_idle() {
        let Some(conn) = pool.idle.pop() else {
            break;
        };

        if !conn.try_lease() {
            continue;
        }

        let idle_expired = options
            .idle_timeout
            .is_some_and(|timeout| conn.idle_for() > timeout)
            && pool.size.current() > options.min_connections;

        if idle_expired || pool.is_stale(&conn) {
            tracing::debug!(
                target: "sqlpool::maintainer",
                connection_id = %conn.id,
                idle_secs = conn.idle_for().as_secs_f64(),
                age_secs = conn.age().as_secs_f64(),
                "closing expired connection"
            );

            pool.destroy(&conn);
            continue;
        }

        if options.test_while_idle {
            if let Err(error) =
                conn.validate(options.validation_query.as_deref(), options.validation_timeout)
            {
                tracing::info!(
                    target: "sqlpool::maintainer",
                    %error,
                    connection_id = %conn.id,
                    "idle connection failed validation; closing it"
                );

                pool.destroy(&conn);
                continue;
            }
        }

        pool.hand_off(conn);
    }
}

/// Opens connections until the pool is back at its minimum size.
fn top_up(pool: &SharedPool) {
    let min = pool.options.min_connections.min(pool.size.max());

    while pool.is_normal() && pool.size.current() < min {
        let Some(guard) = pool.size.try_increase() else {
            break;
        };

        match pool.open(guard) {
            Ok(conn) => pool.recycle(conn),
            Err(error) => {
                tracing::warn!(
                    target: "sqlpool::maintainer",
                    %error,
                    "failed to open connection for minimum pool size"
                );
                break;
            }
        }
    }
}
