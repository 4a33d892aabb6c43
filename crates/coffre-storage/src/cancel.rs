//! Cooperative cancellation for storage and daemon work.
//!
//! Every backend operation takes a [`CancelToken`]; a cancelled token makes
//! the operation fail promptly with `StorageError::Cancelled`. Tokens form a
//! tree: cancelling a parent cancels every child, while a child can be
//! cancelled on its own (one client connection going away must not take the
//! daemon down with it).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{StorageError, StorageResult};

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
    children: Mutex<Vec<Arc<Inner>>>,
}

impl Inner {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        // Wake sleepers before fanning out so waiters on this node return
        // without waiting on the children lock.
        let _guard = self.lock.lock().unwrap();
        self.cond.notify_all();
        drop(_guard);
        if let Ok(children) = self.children.lock() {
            for child in children.iter() {
                child.cancel();
            }
        }
    }
}

/// The listening half of a cancellation pair. Cloneable and cheap to pass
/// to every operation.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

/// The triggering half of a cancellation pair.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<Inner>,
}

/// Creates a fresh token/handle pair.
pub fn cancel_pair() -> (CancelToken, CancelHandle) {
    let inner = Arc::new(Inner::default());
    (
        CancelToken {
            inner: inner.clone(),
        },
        CancelHandle { inner },
    )
}

impl CancelToken {
    /// A token that can never be cancelled, for tests and one-shot tools.
    pub fn never() -> Self {
        cancel_pair().0
    }

    /// Whether cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Fails with [`StorageError::Cancelled`] if the token fired.
    pub fn check(&self) -> StorageResult<()> {
        if self.is_cancelled() {
            Err(StorageError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleeps up to `timeout`, returning early if cancelled. Returns true
    /// when the token fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock().unwrap();
        loop {
            if self.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (g, _res) = self
                .inner
                .cond
                .wait_timeout(guard, deadline - now)
                .unwrap();
            guard = g;
        }
    }

    /// Creates a child pair. The child fires when the parent fires or when
    /// its own handle is triggered; the parent is unaffected by the child.
    pub fn child(&self) -> (CancelToken, CancelHandle) {
        let child = Arc::new(Inner::default());
        if self.is_cancelled() {
            child.cancelled.store(true, Ordering::SeqCst);
        }
        self.inner.children.lock().unwrap().push(child.clone());
        (
            CancelToken {
                inner: child.clone(),
            },
            CancelHandle { inner: child },
        )
    }
}

impl CancelHandle {
    /// Triggers cancellation, waking sleepers and fanning out to children.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Whether cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_fresh_token_is_live() {
        let (token, _handle) = cancel_pair();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_cancel_fires_token() {
        let (token, handle) = cancel_pair();
        handle.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(StorageError::Cancelled)));
    }

    #[test]
    fn test_clone_observes_cancel() {
        let (token, handle) = cancel_pair();
        let clone = token.clone();
        handle.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_child_cancelled_by_parent() {
        let (token, handle) = cancel_pair();
        let (child, _child_handle) = token.child();
        handle.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_child_cancelled_independently() {
        let (token, _handle) = cancel_pair();
        let (child, child_handle) = token.child();
        child_handle.cancel();
        assert!(child.is_cancelled());
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_child_of_cancelled_parent_starts_cancelled() {
        let (token, handle) = cancel_pair();
        handle.cancel();
        let (child, _h) = token.child();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let (token, _handle) = cancel_pair();
        let start = Instant::now();
        let fired = token.wait_timeout(Duration::from_millis(30));
        assert!(!fired);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_wait_timeout_wakes_on_cancel() {
        let (token, handle) = cancel_pair();
        let waiter = std::thread::spawn(move || {
            let start = Instant::now();
            let fired = token.wait_timeout(Duration::from_secs(10));
            (fired, start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        handle.cancel();
        let (fired, elapsed) = waiter.join().unwrap();
        assert!(fired);
        assert!(elapsed < Duration::from_secs(5));
    }
}
