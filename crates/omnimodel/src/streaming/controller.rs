//! Push-based stream controller for token delivery.
//!
//! Single producer pushes items, single consumer pulls them one at a time.
//! The controller is the seam between an adapter's native streaming loop
//! and the async stream handed to the caller.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures_util::Stream;
use tokio::sync::Notify;

use crate::error::{Result, RuntimeError};

/// Lifecycle of a controller. Closed and Errored are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Closed,
    Errored,
}

struct Shared<T> {
    queue: VecDeque<T>,
    state: StreamState,
    error: Option<RuntimeError>,
}

/// Single-producer single-consumer push queue with explicit close, error
/// and cancel transitions.
pub struct StreamController<T> {
    shared: Mutex<Shared<T>>,
    notify: Notify,
}

impl<T> StreamController<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shared: Mutex::new(Shared {
                queue: VecDeque::new(),
                state: StreamState::Open,
                error: None,
            }),
            notify: Notify::new(),
        })
    }

    /// Push an item. Returns false (never panics, never errors) once the
    /// controller has left the Open state.
    pub fn push(&self, item: T) -> bool {
        let mut shared = self.shared.lock().unwrap();
        if shared.state != StreamState::Open {
            return false;
        }
        shared.queue.push_back(item);
        drop(shared);
        self.notify.notify_one();
        true
    }

    /// Producer-side close. Queued items remain drainable. Idempotent:
    /// has no effect after the stream left the Open state.
    pub fn close(&self) {
        let mut shared = self.shared.lock().unwrap();
        if shared.state != StreamState::Open {
            return;
        }
        shared.state = StreamState::Closed;
        drop(shared);
        self.notify.notify_one();
    }

    /// Producer-side error. The consumer observes the failure once, then
    /// the stream ends. Idempotent after any terminal transition.
    pub fn error(&self, err: RuntimeError) {
        let mut shared = self.shared.lock().unwrap();
        if shared.state != StreamState::Open {
            return;
        }
        shared.state = StreamState::Errored;
        shared.error = Some(err);
        drop(shared);
        self.notify.notify_one();
    }

    /// Consumer-side cancel: transitions to Closed and discards anything
    /// still queued. Subsequent pushes are silently dropped.
    pub fn cancel(&self) {
        let mut shared = self.shared.lock().unwrap();
        if shared.state == StreamState::Open {
            shared.state = StreamState::Closed;
        }
        shared.queue.clear();
        drop(shared);
        self.notify.notify_one();
    }

    pub fn state(&self) -> StreamState {
        self.shared.lock().unwrap().state
    }

    /// Pull the next item. `None` means the stream ended; an `Err` item is
    /// delivered exactly once when the producer errored.
    pub async fn next(&self) -> Option<Result<T>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut shared = self.shared.lock().unwrap();
                if let Some(item) = shared.queue.pop_front() {
                    return Some(Ok(item));
                }
                match shared.state {
                    StreamState::Open => {}
                    StreamState::Closed => return None,
                    StreamState::Errored => {
                        return shared.error.take().map(Err);
                    }
                }
            }
            notified.await;
        }
    }
}

impl<T: Send + 'static> StreamController<T> {
    /// Adapt the pull side into a `Stream` for composition with the
    /// transform utilities.
    pub fn into_stream(self: Arc<Self>) -> impl Stream<Item = Result<T>> + Send {
        async_stream::stream! {
            while let Some(item) = self.next().await {
                yield item;
            }
        }
    }
}
