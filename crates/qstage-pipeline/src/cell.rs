//! `StageCell<T>`: a lazily populated, write-once slot.
//!
//! Concurrency policy: callers serialize. The first caller to find the cell
//! empty produces the value with the lock released; every concurrent caller
//! blocks on a condvar and, once the value is published, receives the same
//! `Arc`.
//!
//! Failure policy is chosen per cell:
//! - [`FailurePolicy::Retry`]: a failed (or cancelled) production returns
//!   the cell to empty. The error goes to the producing caller only; a
//!   blocked waiter wakes up and attempts production itself.
//! - [`FailurePolicy::Poison`]: the first error is stored and handed (cloned)
//!   to every later caller. The producer never runs again.
//!
//! A producer that panics leaves the cell empty under either policy.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use qstage_core::error::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    #[default]
    Retry,
    Poison,
}

enum State<T> {
    Empty,
    Computing,
    Done(Arc<T>),
    Failed(qstage_core::error::Error),
}

pub struct StageCell<T> {
    name: &'static str,
    policy: FailurePolicy,
    state: Mutex<State<T>>,
    ready: Condvar,
}

impl<T> StageCell<T> {
    pub fn new(name: &'static str) -> Self {
        Self::with_policy(name, FailurePolicy::Retry)
    }

    pub fn with_policy(name: &'static str, policy: FailurePolicy) -> Self {
        Self {
            name,
            policy,
            state: Mutex::new(State::Empty),
            ready: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    // The state is always left consistent before a panic can unwind, so a
    // poisoned mutex is still safe to use.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The stored value, without triggering production.
    pub fn get(&self) -> Option<Arc<T>> {
        match &*self.lock() {
            State::Done(v) => Some(Arc::clone(v)),
            _ => None,
        }
    }

    pub fn is_populated(&self) -> bool {
        matches!(&*self.lock(), State::Done(_))
    }

    /// Return the stored value, producing it with `produce` if the cell is
    /// empty.
    pub fn get_or_try_init<F>(&self, produce: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        let mut state = self.lock();
        loop {
            match &*state {
                State::Done(v) => return Ok(Arc::clone(v)),
                State::Failed(e) => return Err(e.clone()),
                State::Computing => {
                    tracing::debug!(stage = self.name, "waiting for concurrent producer");
                    state = self
                        .ready
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                State::Empty => break,
            }
        }
        *state = State::Computing;
        drop(state);

        let guard = ResetOnUnwind { cell: self };
        let result = produce();
        std::mem::forget(guard);

        let mut state = self.lock();
        let out = match result {
            Ok(value) => {
                let value = Arc::new(value);
                *state = State::Done(Arc::clone(&value));
                Ok(value)
            }
            Err(e) => {
                *state = match self.policy {
                    FailurePolicy::Retry => State::Empty,
                    FailurePolicy::Poison => State::Failed(e.clone()),
                };
                Err(e)
            }
        };
        drop(state);
        self.ready.notify_all();
        out
    }
}

/// Puts a cell back to `Empty` if the producer unwinds.
struct ResetOnUnwind<'a, T> {
    cell: &'a StageCell<T>,
}

impl<T> Drop for ResetOnUnwind<'_, T> {
    fn drop(&mut self) {
        *self.cell.lock() = State::Empty;
        self.cell.ready.notify_all();
    }
}

impl<T> fmt::Debug for StageCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.lock() {
            State::Empty => "empty",
            State::Computing => "computing",
            State::Done(_) => "done",
            State::Failed(_) => "failed",
        };
        f.debug_struct("StageCell")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qstage_core::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn produces_once_and_shares_the_value() {
        let cell = StageCell::new("analysis");
        let calls = AtomicUsize::new(0);
        let produce = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![1, 2, 3])
        };
        let a = cell.get_or_try_init(produce).expect("first");
        let b = cell
            .get_or_try_init(|| -> Result<Vec<i32>> { panic!("must not run again") })
            .expect("second");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cell.is_populated());
    }

    #[test]
    fn retry_policy_reattempts_after_failure() {
        let cell: StageCell<u32> = StageCell::new("planning");
        let err = cell
            .get_or_try_init(|| Err(Error::Planning("no candidate".into())))
            .unwrap_err();
        assert!(matches!(err, Error::Planning(_)));
        assert!(!cell.is_populated());
        assert_eq!(*cell.get_or_try_init(|| Ok(7)).expect("retry"), 7);
    }

    #[test]
    fn poison_policy_returns_the_stored_error() {
        let cell: StageCell<u32> = StageCell::with_policy("prep", FailurePolicy::Poison);
        let _ = cell.get_or_try_init(|| Err(Error::Execution("boom".into())));
        let again = cell
            .get_or_try_init(|| Ok(1))
            .expect_err("poisoned cell never produces");
        assert_eq!(again, Error::Execution("boom".into()));
        assert!(cell.get().is_none());
    }

    #[test]
    fn panicking_producer_leaves_cell_empty() {
        let cell: Arc<StageCell<u32>> = Arc::new(StageCell::new("optimization"));
        let c = Arc::clone(&cell);
        let joined = thread::spawn(move || c.get_or_try_init(|| -> Result<u32> { panic!("producer") }))
            .join();
        assert!(joined.is_err());
        assert!(!cell.is_populated());
        assert_eq!(*cell.get_or_try_init(|| Ok(3)).expect("after panic"), 3);
    }

    #[test]
    fn concurrent_first_access_runs_producer_once() {
        let cell: Arc<StageCell<u64>> = Arc::new(StageCell::new("physical"));
        let calls = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = Arc::clone(&cell);
                let calls = Arc::clone(&calls);
                thread::spawn(move || {
                    cell.get_or_try_init(|| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        Ok(42)
                    })
                    .expect("value")
                })
            })
            .collect();
        let values: Vec<Arc<u64>> = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
    }
}
