use std::hint;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use super::pooled::PooledConnection;

// Polls of the ready flag before a waiter parks on the condvar.
const SPIN_LIMIT: u32 = 64;

/// A handoff cell for one waiting [`Pool::acquire`] call.
///
/// Exactly one transition out of [`Slot::Waiting`] succeeds: either a producer hands over a
/// connection or a signal, or the waiter itself gives up at its deadline. Anything offered
/// after that is handed back to the producer.
///
/// [`Pool::acquire`]: crate::pool::Pool::acquire
pub(in crate::pool) struct Borrower {
    ready: AtomicBool,
    slot: Mutex<Slot>,
    cond: Condvar,
}

enum Slot {
    Waiting,
    Handed(Arc<PooledConnection>),
    Signaled(Signal),
    Done,
}

/// Wakes a waiter without handing it a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(in crate::pool) enum Signal {
    /// Capacity was released; try to acquire again.
    Retry,
    /// The borrow was cancelled.
    Interrupted,
    /// The pool was closed.
    Closed,
}

pub(in crate::pool) enum Outcome {
    Handed(Arc<PooledConnection>),
    Signaled(Signal),
    TimedOut,
}

impl Borrower {
    pub fn new() -> Arc<Self> {
        Arc::new(Borrower {
            ready: AtomicBool::new(false),
            slot: Mutex::new(Slot::Waiting),
            cond: Condvar::new(),
        })
    }

    /// Returns `true` while no outcome has been decided for this borrower.
    pub fn is_waiting(&self) -> bool {
        !self.ready.load(Ordering::Acquire)
    }

    /// Hands `conn` to this borrower, or gives it back if the borrower is no longer waiting.
    pub fn offer(&self, conn: Arc<PooledConnection>) -> Result<(), Arc<PooledConnection>> {
        let mut slot = self.slot.lock();

        if !matches!(*slot, Slot::Waiting) {
            return Err(conn);
        }

        *slot = Slot::Handed(conn);
        self.wake();
        Ok(())
    }

    /// Wakes this borrower with `signal`; returns `false` if it was no longer waiting.
    pub fn signal(&self, signal: Signal) -> bool {
        let mut slot = self.slot.lock();

        if !matches!(*slot, Slot::Waiting) {
            return false;
        }

        *slot = Slot::Signaled(signal);
        self.wake();
        true
    }

    fn wake(&self) {
        self.ready.store(true, Ordering::Release);
        self.cond.notify_one();
    }

    /// Spin briefly, then park until an outcome is decided or `deadline` passes.
    pub fn wait(&self, deadline: Instant) -> Outcome {
        for _ in 0..SPIN_LIMIT {
            if self.ready.load(Ordering::Acquire) {
                break;
            }
            hint::spin_loop();
        }

        let mut slot = self.slot.lock();

        loop {
            match mem::replace(&mut *slot, Slot::Done) {
                Slot::Waiting => {}
                Slot::Handed(conn) => return Outcome::Handed(conn),
                Slot::Signaled(signal) => return Outcome::Signaled(signal),
                // `wait` is only called once per borrower
                Slot::Done => return Outcome::TimedOut,
            }

            // still waiting; put the marker back before parking
            *slot = Slot::Waiting;

            if Instant::now() >= deadline {
                *slot = Slot::Done;
                self.ready.store(true, Ordering::Release);
                return Outcome::TimedOut;
            }

            // N.B. may wake spuriously
            self.cond.wait_until(&mut slot, deadline);
        }
    }
}

/// Cancels a blocked [`Pool::acquire_with`] call from another thread.
///
/// A token can be cancelled once; every acquire using it afterwards fails immediately with
/// [`Error::BorrowInterrupted`].
///
/// [`Pool::acquire_with`]: crate::pool::Pool::acquire_with
/// [`Error::BorrowInterrupted`]: crate::error::Error::BorrowInterrupted
#[derive(Clone, Default)]
pub struct CancelToken(Arc<CancelInner>);

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    waiting: Mutex<Option<Weak<Borrower>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interrupt the borrower currently waiting on this token, if any.
    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::Release);

        if let Some(borrower) = self.0.waiting.lock().take().and_then(|w| w.upgrade()) {
            borrower.signal(Signal::Interrupted);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::Acquire)
    }

    pub(in crate::pool) fn register(&self, borrower: &Arc<Borrower>) {
        *self.0.waiting.lock() = Some(Arc::downgrade(borrower));

        // close the race with a `cancel()` that ran before registration
        if self.is_cancelled() {
            borrower.signal(Signal::Interrupted);
        }
    }

    pub(in crate::pool) fn deregister(&self) {
        self.0.waiting.lock().take();
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn times_out_without_a_producer() {
        let borrower = Borrower::new();
        let started = Instant::now();

        let outcome = borrower.wait(started + Duration::from_millis(50));

        assert!(matches!(outcome, Outcome::TimedOut));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(!borrower.is_waiting());
    }

    #[test]
    fn signal_after_timeout_is_refused() {
        let borrower = Borrower::new();
        let _ = borrower.wait(Instant::now());

        assert!(!borrower.signal(Signal::Retry));
    }

    #[test]
    fn only_the_first_signal_lands() {
        let borrower = Borrower::new();

        assert!(borrower.signal(Signal::Retry));
        assert!(!borrower.signal(Signal::Closed));

        let outcome = borrower.wait(Instant::now() + Duration::from_secs(1));
        assert!(matches!(outcome, Outcome::Signaled(Signal::Retry)));
    }

    #[test]
    fn signal_wakes_a_parked_waiter() {
        let borrower = Borrower::new();

        let waiter = {
            let borrower = borrower.clone();
            thread::spawn(move || borrower.wait(Instant::now() + Duration::from_secs(10)))
        };

        thread::sleep(Duration::from_millis(20));
        assert!(borrower.signal(Signal::Closed));

        let outcome = waiter.join().unwrap();
        assert!(matches!(outcome, Outcome::Signaled(Signal::Closed)));
    }

    #[test]
    fn cancel_interrupts_the_registered_borrower() {
        let token = CancelToken::new();
        let borrower = Borrower::new();
        token.register(&borrower);

        let canceller = {
            let token = token.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                token.cancel();
            })
        };

        let outcome = borrower.wait(Instant::now() + Duration::from_secs(10));
        canceller.join().unwrap();

        assert!(matches!(outcome, Outcome::Signaled(Signal::Interrupted)));
        assert!(token.is_cancelled());
    }

    #[test]
    fn registering_a_cancelled_token_interrupts_immediately() {
        let token = CancelToken::new();
        token.cancel();

        let borrower = Borrower::new();
        token.register(&borrower);

        let outcome = borrower.wait(Instant::now() + Duration::from_secs(10));
        assert!(matches!(outcome, Outcome::Signaled(Signal::Interrupted)));
    }
}
