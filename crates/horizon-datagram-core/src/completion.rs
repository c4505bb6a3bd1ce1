//! One-shot completion signals with any number of waiters.
//!
//! A [`Completion`] is resolved exactly once; the first call to
//! [`complete`](Completion::complete) wins and later values are discarded.
//! Waiters may block the current thread ([`wait`](Completion::wait),
//! [`wait_timeout`](Completion::wait_timeout)) or await it from async code
//! ([`wait_async`](Completion::wait_async)).
//!
//! # Example
//!
//! ```
//! use horizon_datagram_core::Completion;
//! use std::time::Duration;
//!
//! let done = Completion::<u32>::new();
//! let waiter = done.clone();
//!
//! let thread = std::thread::spawn(move || waiter.wait());
//!
//! assert!(done.complete(7));
//! assert!(!done.complete(8));
//! assert_eq!(thread.join().unwrap(), 7);
//! assert_eq!(done.wait_timeout(Duration::from_millis(1)), Some(7));
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

struct CompletionState<T> {
    value: Mutex<Option<T>>,
    condvar: Condvar,
    notify: Notify,
}

/// A one-shot, multi-waiter completion signal.
///
/// Cloning a `Completion` produces another handle to the same signal.
pub struct Completion<T> {
    inner: Arc<CompletionState<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Completion<T> {
    /// Create a new, unresolved completion.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CompletionState {
                value: Mutex::new(None),
                condvar: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Create a completion that is already resolved with `value`.
    pub fn completed(value: T) -> Self {
        let completion = Self::new();
        completion.complete(value);
        completion
    }

    /// Resolve the completion.
    ///
    /// Returns `true` if this call resolved it, `false` if it was already
    /// resolved (in which case `value` is dropped).
    pub fn complete(&self, value: T) -> bool {
        {
            let mut slot = self.inner.value.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            self.inner.condvar.notify_all();
        }
        self.inner.notify.notify_waiters();
        true
    }

    /// Check whether the completion has been resolved.
    pub fn is_complete(&self) -> bool {
        self.inner.value.lock().is_some()
    }

    /// Get the resolved value without waiting.
    pub fn get(&self) -> Option<T> {
        self.inner.value.lock().clone()
    }

    /// Block the current thread until the completion resolves.
    pub fn wait(&self) -> T {
        let mut slot = self.inner.value.lock();
        loop {
            if let Some(value) = slot.as_ref() {
                return value.clone();
            }
            self.inner.condvar.wait(&mut slot);
        }
    }

    /// Block the current thread until the completion resolves or the timeout
    /// elapses.
    ///
    /// Returns `None` if the timeout elapsed first.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.inner.value.lock();
        loop {
            if let Some(value) = slot.as_ref() {
                return Some(value.clone());
            }
            if self
                .inner
                .condvar
                .wait_until(&mut slot, deadline)
                .timed_out()
            {
                return slot.clone();
            }
        }
    }

    /// Wait asynchronously until the completion resolves.
    pub async fn wait_async(&self) -> T {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(value) = self.get() {
                return value;
            }
            notified.await;
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("value", &*self.inner.value.lock())
            .finish()
    }
}

static_assertions::assert_impl_all!(Completion<u64>: Send, Sync, Clone);

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_first_value_wins() {
        let completion = Completion::new();
        assert!(!completion.is_complete());
        assert!(completion.complete("first"));
        assert!(!completion.complete("second"));
        assert_eq!(completion.get(), Some("first"));
    }

    #[test]
    fn test_wait_timeout_elapses() {
        let completion = Completion::<i32>::new();
        assert_eq!(completion.wait_timeout(Duration::from_millis(20)), None);
    }

    #[test]
    fn test_multiple_waiters() {
        let completion = Completion::<i32>::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let c = completion.clone();
                thread::spawn(move || c.wait())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        completion.complete(42);

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), 42);
        }
    }

    #[test]
    fn test_completed_constructor() {
        let completion = Completion::completed(5u8);
        assert!(completion.is_complete());
        assert_eq!(completion.wait(), 5);
    }

    #[tokio::test]
    async fn test_wait_async() {
        let completion = Completion::<String>::new();
        let resolver = completion.clone();

        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            resolver.complete("done".to_string());
        });

        assert_eq!(completion.wait_async().await, "done");
    }
}
