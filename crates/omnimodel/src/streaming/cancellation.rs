//! One-shot cooperative cancellation token.
//!
//! Producers poll `throw_if_cancelled` between items; consumers register
//! callbacks for prompt teardown. Registering after cancellation already
//! happened invokes the callback immediately, so notifications are never
//! missed.

use std::sync::{Arc, Mutex};

use crate::error::{Result, RuntimeError};

type CancelCallback = Box<dyn FnOnce() + Send>;

struct CancelState {
    cancelled: bool,
    callbacks: Vec<CancelCallback>,
}

#[derive(Clone)]
pub struct StreamCancellation {
    state: Arc<Mutex<CancelState>>,
}

impl StreamCancellation {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CancelState { cancelled: false, callbacks: Vec::new() })),
        }
    }

    /// Cancel the stream. Fires every registered callback once. Calling
    /// again is a no-op.
    pub fn cancel(&self) {
        let callbacks = {
            let mut state = self.state.lock().unwrap();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            std::mem::take(&mut state.callbacks)
        };
        for cb in callbacks {
            cb();
        }
    }

    /// Register a callback to run on cancellation. Invoked immediately if
    /// cancellation already occurred.
    pub fn on_cancel<F: FnOnce() + Send + 'static>(&self, callback: F) {
        let immediate = {
            let mut state = self.state.lock().unwrap();
            if state.cancelled {
                Some(callback)
            } else {
                state.callbacks.push(Box::new(callback));
                None
            }
        };
        if let Some(cb) = immediate {
            cb();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().unwrap().cancelled
    }

    /// Synchronous check for producers to stop promptly.
    pub fn throw_if_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(RuntimeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for StreamCancellation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_cancel_fires_registered_callback() {
        let token = StreamCancellation::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        token.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        token.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_double_cancel_is_noop() {
        let token = StreamCancellation::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        token.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        token.cancel();
        token.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_late_registration_fires_immediately() {
        let token = StreamCancellation::new();
        token.cancel();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        token.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_throw_if_cancelled() {
        let token = StreamCancellation::new();
        assert!(token.throw_if_cancelled().is_ok());
        token.cancel();
        assert!(matches!(token.throw_if_cancelled(), Err(RuntimeError::Cancelled)));
    }
}
