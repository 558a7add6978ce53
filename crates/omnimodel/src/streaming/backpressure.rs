//! Bounded admission for concurrent token streams.
//!
//! A semaphore with an explicit FIFO waiter queue. `release` hands the
//! permit directly to the oldest waiter, so there is never a window where
//! capacity is exceeded or a freed slot sits idle while waiters exist.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

struct Inner {
    pending: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

pub struct BackpressureHandler {
    max_pending: usize,
    inner: Mutex<Inner>,
}

impl BackpressureHandler {
    pub fn new(max_pending: usize) -> Arc<Self> {
        Arc::new(Self {
            max_pending,
            inner: Mutex::new(Inner { pending: 0, waiters: VecDeque::new() }),
        })
    }

    /// Acquire a slot, suspending at the back of the waiter queue when the
    /// handler is at capacity. No built-in timeout; compose with the
    /// cancellation/timeout utilities if one is needed.
    pub async fn acquire(&self) {
        let rx = {
            let mut inner = self.inner.lock().unwrap();
            if inner.pending < self.max_pending {
                inner.pending += 1;
                return;
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(tx);
            rx
        };
        // The permit was transferred by release(); pending stays accounted.
        let _ = rx.await;
    }

    /// Release a slot. With waiters queued the permit transfers atomically
    /// to the oldest one; otherwise the pending count drops.
    pub fn release(&self) {
        let mut inner = self.inner.lock().unwrap();
        while let Some(tx) = inner.waiters.pop_front() {
            if tx.send(()).is_ok() {
                return;
            }
            // Waiter gave up (acquire future dropped); try the next one.
        }
        inner.pending = inner.pending.saturating_sub(1);
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().unwrap().pending
    }

    pub fn waiting(&self) -> usize {
        self.inner.lock().unwrap().waiters.len()
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }
}

/// Releases its slot when dropped. Lets stream wrappers tie a permit to
/// the stream's lifetime.
pub struct BackpressurePermit {
    handler: Arc<BackpressureHandler>,
}

impl BackpressurePermit {
    pub async fn acquire(handler: Arc<BackpressureHandler>) -> Self {
        handler.acquire().await;
        Self { handler }
    }
}

impl Drop for BackpressurePermit {
    fn drop(&mut self) {
        self.handler.release();
    }
}
