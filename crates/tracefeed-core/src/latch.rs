//! One-shot broadcast latches for request lifecycle transitions.
//!
//! A [`TransitionLatch`] is opened exactly once. Threads may wait on it both
//! before and after it opens: waiters that arrive late observe the open state
//! and return immediately, which is what makes `wait_for_completion()` safe
//! against the complete-before-wait interleaving.
//!
//! Blocking waits use a mutex/condvar pair; async waiters ride a
//! `tokio::sync::watch` channel so they can be awaited from any runtime task
//! without blocking a worker thread.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;

// ---------------------------------------------------------------------------
// WaitError
// ---------------------------------------------------------------------------

/// Abrupt termination of a bounded wait, distinguishable from the normal
/// return of an unbounded wait.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// The transition did not occur within the allotted time.
    #[error("timed out after {0:?} waiting for request transition")]
    Timeout(Duration),
}

// ---------------------------------------------------------------------------
// TransitionLatch
// ---------------------------------------------------------------------------

/// A one-shot, broadcast-on-open latch.
///
/// Opening is idempotent; the first call releases every present and future
/// waiter.
#[derive(Debug)]
pub struct TransitionLatch {
    opened: Mutex<bool>,
    cvar: Condvar,
    notify: watch::Sender<bool>,
}

#[allow(clippy::missing_panics_doc)] // methods panic only on a poisoned mutex
impl TransitionLatch {
    /// Creates a closed latch.
    #[must_use]
    pub fn new() -> Self {
        let (notify, _rx) = watch::channel(false);
        Self {
            opened: Mutex::new(false),
            cvar: Condvar::new(),
            notify,
        }
    }

    /// Opens the latch, releasing all waiters. Subsequent calls are no-ops.
    pub fn open(&self) {
        let mut opened = self.opened.lock().unwrap();
        if !*opened {
            *opened = true;
            self.cvar.notify_all();
            let _ = self.notify.send(true);
        }
    }

    /// Returns `true` if the latch has been opened.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.opened.lock().unwrap()
    }

    /// Blocks the calling thread until the latch opens.
    ///
    /// Returns immediately if the latch is already open.
    pub fn wait(&self) {
        let mut opened = self.opened.lock().unwrap();
        while !*opened {
            opened = self.cvar.wait(opened).unwrap();
        }
    }

    /// Blocks until the latch opens or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// [`WaitError::Timeout`] if the latch did not open in time.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<(), WaitError> {
        let deadline = Instant::now() + timeout;
        let mut opened = self.opened.lock().unwrap();
        while !*opened {
            let now = Instant::now();
            if now >= deadline {
                return Err(WaitError::Timeout(timeout));
            }
            let (guard, _result) = self.cvar.wait_timeout(opened, deadline - now).unwrap();
            opened = guard;
        }
        Ok(())
    }

    /// Awaits the latch opening without blocking a thread.
    ///
    /// Resolves immediately if the latch is already open.
    pub async fn wait_async(&self) {
        let mut rx = self.notify.subscribe();
        // The sender lives in `self`, so `wait_for` cannot observe a closed
        // channel while this borrow is alive.
        let _ = rx.wait_for(|opened| *opened).await;
    }
}

impl Default for TransitionLatch {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_open_then_wait_returns_immediately() {
        let latch = TransitionLatch::new();
        latch.open();
        assert!(latch.is_open());
        latch.wait(); // must not block
        latch.wait_timeout(Duration::from_millis(1)).unwrap();
    }

    #[test]
    fn test_wait_then_open_releases_waiter() {
        let latch = Arc::new(TransitionLatch::new());
        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || {
                latch.wait();
            })
        };
        thread::sleep(Duration::from_millis(20));
        latch.open();
        waiter.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_expires() {
        let latch = TransitionLatch::new();
        let err = latch.wait_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, WaitError::Timeout(_)));
        assert!(!latch.is_open());
    }

    #[test]
    fn test_open_is_idempotent() {
        let latch = TransitionLatch::new();
        latch.open();
        latch.open();
        assert!(latch.is_open());
    }

    #[test]
    fn test_releases_multiple_waiters() {
        let latch = Arc::new(TransitionLatch::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let latch = Arc::clone(&latch);
                thread::spawn(move || latch.wait_timeout(Duration::from_secs(5)))
            })
            .collect();
        thread::sleep(Duration::from_millis(10));
        latch.open();
        for waiter in waiters {
            waiter.join().unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_wait_async_before_open() {
        let latch = Arc::new(TransitionLatch::new());
        let task = {
            let latch = Arc::clone(&latch);
            tokio::spawn(async move {
                latch.wait_async().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        latch.open();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_async_after_open() {
        let latch = TransitionLatch::new();
        latch.open();
        latch.wait_async().await; // must resolve immediately
    }
}
