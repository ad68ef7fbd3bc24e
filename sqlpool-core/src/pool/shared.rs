use std::cmp;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use super::borrower::{Borrower, CancelToken, Outcome, Signal};
use super::maintainer::Maintainer;
use super::pooled::{ConnectionState, Defaults, PooledConfig, PooledConnection};
use super::size::{IncreaseGuard, PoolSize};
use super::{PoolOptions, PoolSnapshot, PoolState};
use crate::connection::{Attribute, AttributeValue, Capabilities, Connect, RawConnection};
use crate::error::{Error, Result};
use crate::isolation_level::IsolationLevel;
use crate::logger::level_filter_to_trace_level;

// How often `close()` checks whether checked-out connections came back.
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(10);

// Dead borrower slots tolerated in the waiter queue before it is compacted.
const WAITER_SLACK: usize = 32;

/// Driver facts detected from the first connection a pool opens.
struct DriverSetup {
    capabilities: Capabilities,
    defaults: Arc<Defaults>,
}

impl DriverSetup {
    fn detect(options: &PoolOptions, raw: &mut dyn RawConnection) -> Result<Self> {
        let capabilities = raw.capabilities();
        let mut values = Vec::with_capacity(Attribute::COUNT);

        for attribute in Attribute::ALL {
            let value = match options.configured_default(attribute) {
                Some(value) => value,
                None if attribute
                    .required_capability()
                    .is_some_and(|required| !capabilities.contains(required)) =>
                {
                    unset_default(attribute)
                }
                None => match raw.attribute(attribute) {
                    Ok(value) => value,
                    Err(Error::UnsupportedOperation(_)) => unset_default(attribute),
                    Err(error) => return Err(error),
                },
            };

            values.push(value);
        }

        Ok(DriverSetup {
            capabilities,
            defaults: Arc::new(Defaults::new(values)),
        })
    }
}

fn unset_default(attribute: Attribute) -> AttributeValue {
    match attribute {
        Attribute::AutoCommit => AttributeValue::AutoCommit(true),
        Attribute::Isolation => AttributeValue::Isolation(IsolationLevel::ReadCommitted),
        Attribute::ReadOnly => AttributeValue::ReadOnly(false),
        Attribute::Catalog => AttributeValue::Catalog(None),
        Attribute::Schema => AttributeValue::Schema(None),
        Attribute::NetworkTimeout => AttributeValue::NetworkTimeout(None),
    }
}

pub(crate) struct SharedPool {
    pub(crate) options: PoolOptions,
    connector: Box<dyn Connect>,
    state: AtomicU8,
    pub(super) size: PoolSize,
    pub(super) idle: SegQueue<Arc<PooledConnection>>,
    waiters: SegQueue<Arc<Borrower>>,
    // set while one thread compacts `waiters`
    pruning_waiters: AtomicBool,
    // borrowers between registering in `waiters` and leaving `Borrower::wait`
    num_waiting: AtomicUsize,
    // every open connection, idle or checked out
    all: Mutex<Vec<Arc<PooledConnection>>>,
    generation: AtomicU64,
    setup: OnceCell<DriverSetup>,
    maintainer: Maintainer,
    acquire_slow_level: Option<tracing::Level>,
}

impl SharedPool {
    pub(super) fn new_arc(options: PoolOptions, connector: Box<dyn Connect>) -> Arc<Self> {
        Arc::new(SharedPool {
            size: PoolSize::new(options.max_connections),
            acquire_slow_level: level_filter_to_trace_level(options.acquire_slow_level),
            options,
            connector,
            state: AtomicU8::new(PoolState::Uninit as u8),
            idle: SegQueue::new(),
            waiters: SegQueue::new(),
            pruning_waiters: AtomicBool::new(false),
            num_waiting: AtomicUsize::new(0),
            all: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            setup: OnceCell::new(),
            maintainer: Maintainer::new(),
        })
    }

    /// `Uninit -> Normal` and start the maintenance thread.
    pub(super) fn start(self: &Arc<Self>) -> Result<()> {
        if self
            .state
            .compare_exchange(
                PoolState::Uninit as u8,
                PoolState::Normal as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(Error::PoolClosed);
        }

        if let Err(error) = self.maintainer.spawn(self, self.options.maintenance_interval) {
            self.close();
            return Err(error.into());
        }

        Ok(())
    }

    pub(super) fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(super) fn is_normal(&self) -> bool {
        self.state() == PoolState::Normal
    }

    pub(super) fn is_closed(&self) -> bool {
        self.state() == PoolState::Closed
    }

    pub(super) fn capabilities(&self) -> Option<Capabilities> {
        self.setup.get().map(|setup| setup.capabilities)
    }

    /// Opens `min_connections` connections (at least one) before the pool starts.
    pub(super) fn init_min_connections(&self) -> Result<()> {
        let target = cmp::max(self.options.min_connections, 1);

        for _ in 0..target {
            let Some(guard) = self.size.try_increase() else {
                break;
            };

            let conn = self.open(guard)?;
            self.hand_off(conn);
        }

        Ok(())
    }

    /// Opens a new connection using capacity reserved by `guard`.
    pub(super) fn open(&self, guard: IncreaseGuard<'_>) -> Result<Arc<PooledConnection>> {
        let started = Instant::now();

        let mut raw = self
            .connector
            .connect()
            .map_err(|error| Error::ResourceCreationFailed(Box::new(error)))?;

        let setup = match self
            .setup
            .get_or_try_init(|| DriverSetup::detect(&self.options, raw.as_mut()))
        {
            Ok(setup) => setup,
            Err(error) => {
                let _ = raw.close();
                return Err(Error::ResourceCreationFailed(Box::new(error)));
            }
        };

        if let Err(error) = self.apply_configured_defaults(raw.as_mut(), setup.capabilities) {
            let _ = raw.close();
            return Err(Error::ResourceCreationFailed(Box::new(error)));
        }

        let conn = Arc::new(PooledConnection::new(
            raw,
            PooledConfig {
                generation: self.generation.load(Ordering::Acquire),
                defaults: setup.defaults.clone(),
                capabilities: setup.capabilities,
                statement_cache_capacity: self.options.statement_cache_capacity,
                trace_statements: self.options.trace_statements,
            },
        ));

        guard.commit();
        self.all.lock().push(conn.clone());
        conn.touch();

        tracing::debug!(
            target: "sqlpool::pool",
            connection_id = %conn.id,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "opened new connection"
        );

        Ok(conn)
    }

    fn apply_configured_defaults(
        &self,
        raw: &mut dyn RawConnection,
        capabilities: Capabilities,
    ) -> Result<()> {
        for attribute in Attribute::ALL {
            let supported = attribute
                .required_capability()
                .is_none_or(|required| capabilities.contains(required));

            if let (true, Some(value)) = (supported, self.options.configured_default(attribute)) {
                raw.set_attribute(&value)?;
            }
        }

        Ok(())
    }

    /// Checks out a connection, waiting up to `timeout` for one to become available.
    ///
    /// In a fair pool, connections handed over by returning borrowers go to waiters in
    /// arrival order. Released capacity is different: a waiter woken to retry (after a
    /// connection is closed, the pool is resized or cleared) competes for it without
    /// queueing behind new arrivals, but if it loses that race it registers again at the
    /// back of the line.
    pub(super) fn acquire(
        self: &Arc<Self>,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<Arc<PooledConnection>> {
        let started = Instant::now();
        let deadline = started
            .checked_add(timeout)
            .unwrap_or_else(|| started + Duration::from_secs(60 * 60 * 24 * 365));

        // set after a `Retry` signal so the woken borrower is not sent to the back of the line
        let mut retrying = false;

        loop {
            if !self.is_normal() {
                return Err(Error::PoolClosed);
            }

            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(Error::BorrowInterrupted);
            }

            let may_skip_line =
                retrying || !self.options.fair || self.num_waiting.load(Ordering::SeqCst) == 0;

            let (conn, fresh) = if let Some(conn) = may_skip_line.then(|| self.pop_idle()).flatten()
            {
                (conn, false)
            } else if let Some(guard) = may_skip_line.then(|| self.size.try_increase()).flatten() {
                match self.open(guard) {
                    Ok(conn) => (conn, true),
                    Err(error) => {
                        // the reserved capacity is free again
                        self.wake_one_retry();
                        return Err(error);
                    }
                }
            } else {
                match self.wait(deadline, started, cancel)? {
                    Some(conn) => (conn, false),
                    None => {
                        retrying = true;
                        continue;
                    }
                }
            };

            retrying = false;

            if conn.is_closed() {
                // destroyed by `clear_all(true)` while being handed over
                continue;
            }

            if !self.is_normal() {
                self.recycle(conn);
                return Err(Error::PoolClosed);
            }

            if fresh || self.check_on_acquire(&conn) {
                self.log_acquired(started, &conn);
                return Ok(conn);
            }
        }
    }

    pub(super) fn try_acquire(self: &Arc<Self>) -> Option<Arc<PooledConnection>> {
        if !self.is_normal() {
            return None;
        }

        if self.options.fair && self.num_waiting.load(Ordering::SeqCst) > 0 {
            return None;
        }

        let conn = self.pop_idle()?;

        if self.check_on_acquire(&conn) {
            Some(conn)
        } else {
            None
        }
    }

    /// Claims an idle connection, discarding any that have expired.
    fn pop_idle(&self) -> Option<Arc<PooledConnection>> {
        while let Some(conn) = self.idle.pop() {
            // lost a race with the maintainer or a clear; it is no longer idle
            if !conn.try_lease() {
                continue;
            }

            if self.is_stale(&conn) {
                self.destroy(&conn);
                continue;
            }

            return Some(conn);
        }

        None
    }

    /// Registers a borrower slot and waits for a connection or a signal.
    ///
    /// Returns `Ok(None)` if the caller should try again.
    fn wait(
        &self,
        deadline: Instant,
        started: Instant,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<Arc<PooledConnection>>> {
        self.prune_waiters();

        let borrower = Borrower::new();

        self.num_waiting.fetch_add(1, Ordering::SeqCst);
        self.waiters.push(borrower.clone());

        if let Some(token) = cancel {
            token.register(&borrower);
        }

        // re-check everything a producer may have missed while we were not yet registered
        if !self.is_normal() {
            borrower.signal(Signal::Closed);
        }

        self.dispatch_idle();

        if !self.size.is_full() {
            borrower.signal(Signal::Retry);
        }

        let outcome = borrower.wait(deadline);

        self.num_waiting.fetch_sub(1, Ordering::SeqCst);

        if let Some(token) = cancel {
            token.deregister();
        }

        match outcome {
            Outcome::Handed(conn) => Ok(Some(conn)),
            Outcome::Signaled(Signal::Retry) => Ok(None),
            Outcome::Signaled(Signal::Interrupted) => Err(Error::BorrowInterrupted),
            Outcome::Signaled(Signal::Closed) => Err(Error::PoolClosed),
            Outcome::TimedOut => Err(Error::BorrowTimeout {
                waited: started.elapsed(),
            }),
        }
    }

    /// Drops slots of borrowers that timed out or were cancelled while still queued.
    ///
    /// Live borrowers keep their relative order. One that is briefly out of the queue may
    /// miss a handoff; the caller re-dispatches idle connections right after registering.
    fn prune_waiters(&self) {
        let queued = self.waiters.len();

        if queued <= 2 * self.num_waiting.load(Ordering::SeqCst) + WAITER_SLACK {
            return;
        }

        if self.pruning_waiters.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut pruned = 0;

        for _ in 0..queued {
            let Some(borrower) = self.waiters.pop() else {
                break;
            };

            if borrower.is_waiting() {
                self.waiters.push(borrower);
            } else {
                pruned += 1;
            }
        }

        self.pruning_waiters.store(false, Ordering::Release);

        tracing::trace!(target: "sqlpool::pool", pruned, "pruned abandoned waiter slots");

        // a retry signal may have found no live borrower in the queue
        if !self.size.is_full() {
            self.wake_one_retry();
        }
    }

    fn check_on_acquire(&self, conn: &Arc<PooledConnection>) -> bool {
        if !self.options.test_before_acquire || conn.idle_for() < self.options.validate_after_idle
        {
            return true;
        }

        match conn.validate(
            self.options.validation_query.as_deref(),
            self.options.validation_timeout,
        ) {
            Ok(()) => true,
            Err(error) => {
                tracing::info!(
                    target: "sqlpool::pool",
                    %error,
                    connection_id = %conn.id,
                    "validation on acquire failed; closing connection"
                );

                self.destroy(conn);
                false
            }
        }
    }

    fn log_acquired(&self, started: Instant, conn: &PooledConnection) {
        let acquired_after = started.elapsed();

        let acquire_slow_level = self
            .acquire_slow_level
            .filter(|_| acquired_after > self.options.acquire_slow_threshold);

        if let Some(level) = acquire_slow_level {
            crate::private_tracing_dynamic_event!(
                target: "sqlpool::pool::acquire",
                level,
                connection_id = %conn.id,
                acquired_after_secs = acquired_after.as_secs_f64(),
                slow_acquire_threshold_secs = self.options.acquire_slow_threshold.as_secs_f64(),
                "acquired connection, but time to acquire exceeded slow threshold"
            );
        } else {
            tracing::trace!(
                target: "sqlpool::pool::acquire",
                connection_id = %conn.id,
                acquired_after_secs = acquired_after.as_secs_f64(),
                "acquired connection"
            );
        }
    }

    pub(super) fn is_stale(&self, conn: &PooledConnection) -> bool {
        conn.generation != self.generation.load(Ordering::Acquire)
            || self
                .options
                .max_lifetime
                .is_some_and(|lifetime| conn.age() > lifetime)
    }

    /// Gives a checked-out connection to the oldest waiting borrower.
    fn offer_to_waiter(&self, mut conn: Arc<PooledConnection>) -> Result<(), Arc<PooledConnection>> {
        while let Some(borrower) = self.waiters.pop() {
            match borrower.offer(conn) {
                Ok(()) => return Ok(()),
                // timed out, cancelled or already served
                Err(returned) => conn = returned,
            }
        }

        Err(conn)
    }

    fn push_idle(&self, conn: Arc<PooledConnection>) {
        if conn.release_to_idle() {
            self.idle.push(conn);
        }
    }

    /// Hands a checked-out connection to a waiter, or parks it in the idle queue.
    pub(super) fn hand_off(&self, conn: Arc<PooledConnection>) {
        if let Err(conn) = self.offer_to_waiter(conn) {
            self.push_idle(conn);

            // a borrower may have registered after we found the waiter queue empty
            if self.num_waiting.load(Ordering::SeqCst) > 0 {
                self.dispatch_idle();
            }
        }
    }

    /// Moves idle connections to waiting borrowers until one side runs out.
    fn dispatch_idle(&self) {
        while self.num_waiting.load(Ordering::SeqCst) > 0 {
            let Some(conn) = self.idle.pop() else {
                return;
            };

            if !conn.try_lease() {
                continue;
            }

            if self.is_stale(&conn) {
                self.destroy(&conn);
                continue;
            }

            if let Err(conn) = self.offer_to_waiter(conn) {
                self.push_idle(conn);
                return;
            }
        }
    }

    /// Takes back a connection whose borrower closed it after a successful reset.
    pub(crate) fn recycle(&self, conn: Arc<PooledConnection>) {
        if conn.is_closed() {
            return;
        }

        if !self.is_normal() || self.is_stale(&conn) || self.size.is_over_max() {
            self.destroy(&conn);
            return;
        }

        self.hand_off(conn);
    }

    /// Takes back a connection that could not be reset; it is closed instead of reused.
    pub(crate) fn abandon_on_return(&self, conn: &Arc<PooledConnection>) {
        tracing::debug!(
            target: "sqlpool::pool",
            connection_id = %conn.id,
            "abandoning connection that failed to reset"
        );

        self.destroy(conn);
    }

    /// Closes a connection for good and releases its capacity.
    ///
    /// Safe to call more than once or concurrently; only the first call has an effect.
    pub(crate) fn destroy(&self, conn: &Arc<PooledConnection>) {
        if !conn.mark_closed() {
            return;
        }

        self.all.lock().retain(|c| !Arc::ptr_eq(c, conn));
        conn.destroy();
        self.size.decrease();

        tracing::debug!(target: "sqlpool::pool", connection_id = %conn.id, "closed connection");

        if self.is_normal() {
            self.wake_one_retry();
        }
    }

    /// Capacity was released; let one waiter try to open a connection.
    fn wake_one_retry(&self) {
        if self.num_waiting.load(Ordering::SeqCst) == 0 {
            return;
        }

        while let Some(borrower) = self.waiters.pop() {
            if borrower.signal(Signal::Retry) {
                return;
            }
        }
    }

    fn wake_all(&self, signal: Signal) {
        while let Some(borrower) = self.waiters.pop() {
            borrower.signal(signal);
        }
    }

    fn connections(&self) -> Vec<Arc<PooledConnection>> {
        self.all.lock().clone()
    }

    /// Closes every idle connection and, with `force`, every checked-out one.
    ///
    /// Connections still checked out are closed when they come back. The maintenance thread
    /// refills the pool to its minimum size afterwards.
    pub(super) fn clear_all(&self, force: bool) -> Result<()> {
        match self.state.compare_exchange(
            PoolState::Normal as u8,
            PoolState::Resting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            // another clear is in progress
            Err(state) if state == PoolState::Resting as u8 => return Ok(()),
            Err(_) => return Err(Error::PoolClosed),
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        while let Some(conn) = self.idle.pop() {
            if conn.try_lease() {
                self.destroy(&conn);
            }
        }

        if force {
            for conn in self.connections() {
                if conn.state() == ConnectionState::Using {
                    self.destroy(&conn);
                }
            }
        }

        self.state
            .store(PoolState::Normal as u8, Ordering::Release);

        tracing::debug!(target: "sqlpool::pool", force, generation, "cleared all connections");

        self.wake_all(Signal::Retry);
        self.maintainer.nudge();

        Ok(())
    }

    pub(super) fn resize(&self, max_connections: u32) -> Result<()> {
        if max_connections == 0 {
            return Err(Error::config("`max_connections` must be at least 1"));
        }

        if max_connections < self.options.min_connections {
            return Err(Error::config(format!(
                "`max_connections` ({max_connections}) cannot be below `min_connections` ({})",
                self.options.min_connections
            )));
        }

        if self.is_closed() {
            return Err(Error::PoolClosed);
        }

        self.size.set_max(max_connections);

        while self.size.is_over_max() {
            let Some(conn) = self.idle.pop() else {
                break;
            };

            if conn.try_lease() {
                self.destroy(&conn);
            }
        }

        tracing::debug!(target: "sqlpool::pool", max_connections, "resized pool");

        // new capacity may be available for waiters
        if !self.size.is_full() {
            self.wake_all(Signal::Retry);
        }

        Ok(())
    }

    /// Closes the pool; idempotent.
    ///
    /// Waits up to `close_timeout` for checked-out connections to be returned, then closes
    /// whatever is still out.
    pub(super) fn close(&self) {
        if self.state.swap(PoolState::Closed as u8, Ordering::AcqRel) == PoolState::Closed as u8 {
            return;
        }

        self.maintainer.stop();
        self.wake_all(Signal::Closed);

        while let Some(conn) = self.idle.pop() {
            if conn.try_lease() {
                self.destroy(&conn);
            }
        }

        let deadline = Instant::now() + self.options.close_timeout;

        loop {
            let remaining = self.connections();

            if remaining.is_empty() {
                break;
            }

            if Instant::now() >= deadline {
                tracing::warn!(
                    target: "sqlpool::pool",
                    remaining = remaining.len(),
                    "connections not returned before close timeout; closing them"
                );

                for conn in remaining {
                    self.destroy(&conn);
                }

                break;
            }

            // connections in the idle queue are claimed by nobody else now
            while let Some(conn) = self.idle.pop() {
                if conn.try_lease() {
                    self.destroy(&conn);
                }
            }

            thread::sleep(CLOSE_POLL_INTERVAL);
        }

        tracing::debug!(target: "sqlpool::pool", "pool closed");
    }

    pub(super) fn snapshot(&self) -> PoolSnapshot {
        let (mut idle, mut in_use) = (0, 0);

        for conn in self.all.lock().iter() {
            match conn.state() {
                ConnectionState::Idle => idle += 1,
                ConnectionState::Using => in_use += 1,
                ConnectionState::Closed => {}
            }
        }

        PoolSnapshot {
            state: self.state(),
            size: self.size.current(),
            max_size: self.size.max(),
            idle,
            in_use,
            waiting: self.num_waiting.load(Ordering::SeqCst),
        }
    }

    pub(super) fn num_idle(&self) -> usize {
        self.idle.len()
    }
}

impl Drop for SharedPool {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Pool, PoolOptions};

    fn refusing() -> Result<Box<dyn RawConnection>> {
        Err(Error::PoolClosed)
    }

    #[test]
    fn timed_out_waiters_do_not_accumulate() -> Result<()> {
        let Pool(shared) = PoolOptions::new().max_connections(1).build(refusing)?;

        // look full without opening anything
        if let Some(guard) = shared.size.try_increase() {
            guard.commit();
        }

        for _ in 0..(4 * WAITER_SLACK) {
            let error = shared.acquire(Duration::from_millis(1), None).unwrap_err();
            assert!(matches!(error, Error::BorrowTimeout { .. }), "{error:?}");
        }

        assert!(shared.waiters.len() <= WAITER_SLACK + 1);
        assert_eq!(shared.num_waiting.load(Ordering::SeqCst), 0);

        Ok(())
    }
}
