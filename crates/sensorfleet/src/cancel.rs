// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cooperative cancellation.
//!
//! Every long-running loop owns a clone of a [`CancellationToken`] and polls
//! it. Blocking waits go through [`CancellationToken::wait_timeout`], which
//! returns early as soon as the token is cancelled.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    condvar: Condvar,
}

/// Shared cancellation flag with a cancellable sleep.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// New, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel and wake every waiter. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        // Taking the lock orders the store before any waiter's re-check.
        let _guard = self.inner.lock.lock();
        self.inner.condvar.notify_all();
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Sleep for up to `timeout`.
    ///
    /// Returns `true` if the token was cancelled (before or during the wait),
    /// `false` if the full timeout elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }

        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock();
        while !self.is_cancelled() {
            if self
                .inner
                .condvar
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                return self.is_cancelled();
            }
        }
        true
    }
}

/// Join a worker thread, unless called from that very thread.
///
/// Teardown can be triggered from inside a worker (e.g. a watcher escalating
/// a fatal error); joining there would deadlock, so the handle is dropped
/// and the thread finishes on its own.
pub fn join_worker(handle: JoinHandle<()>, name: &str) {
    if handle.thread().id() == thread::current().id() {
        tracing::debug!("{} teardown requested from its own thread; not joining", name);
        return;
    }
    if handle.join().is_err() {
        tracing::error!("{} worker thread panicked", name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_times_out_when_not_cancelled() {
        let token = CancellationToken::new();
        let start = Instant::now();
        assert!(!token.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let token = CancellationToken::new();
        let waiter = token.clone();

        let handle = thread::spawn(move || {
            let start = Instant::now();
            let cancelled = waiter.wait_timeout(Duration::from_secs(10));
            (cancelled, start.elapsed())
        });

        thread::sleep(Duration::from_millis(20));
        token.cancel();

        let (cancelled, elapsed) = handle.join().expect("join");
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_wait_after_cancel_returns_immediately() {
        let token = CancellationToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert!(token.wait_timeout(Duration::from_secs(10)));
    }

    #[test]
    fn test_join_worker_joins_finished_thread() {
        let flag = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&flag);
        let handle = thread::spawn(move || f.store(true, Ordering::SeqCst));
        join_worker(handle, "test");
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_join_worker_from_own_thread_does_not_block() {
        let (handle_tx, handle_rx) = crossbeam::channel::bounded::<JoinHandle<()>>(1);
        let (done_tx, done_rx) = crossbeam::channel::bounded::<()>(1);

        let handle = thread::spawn(move || {
            if let Ok(own) = handle_rx.recv() {
                join_worker(own, "self-join");
            }
            let _ = done_tx.send(());
        });
        handle_tx.send(handle).expect("send handle");

        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
