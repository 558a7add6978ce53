//! Stream combinators used by the dispatch layer.
//!
//! `stream_with_timeout` bounds the gap between produced items; the map
//! and batch transforms are pure sequence operations.

use std::future::Future;
use std::time::Duration;

use futures_util::{Stream, StreamExt};

use crate::error::{Result, RuntimeError};

/// Wrap a fallible stream so that each individual "produce next item" step
/// must complete within `per_item`. The window resets on every produced
/// item. On expiry a Timeout error is yielded and the underlying stream is
/// dropped, which runs the producer's cleanup path. Native resource
/// release stays the adapter's unload responsibility.
pub fn stream_with_timeout<S, T>(
    stream: S,
    per_item: Duration,
) -> impl Stream<Item = Result<T>> + Send
where
    S: Stream<Item = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    async_stream::stream! {
        futures_util::pin_mut!(stream);
        loop {
            match tokio::time::timeout(per_item, stream.next()).await {
                Ok(Some(item)) => yield item,
                Ok(None) => break,
                Err(_) => {
                    yield Err(RuntimeError::Timeout {
                        waited_ms: per_item.as_millis() as u64,
                    });
                    break;
                }
            }
        }
    }
}

/// Map each item through a possibly-asynchronous function.
pub fn transform_stream<S, T, U, F, Fut>(stream: S, f: F) -> impl Stream<Item = U> + Send
where
    S: Stream<Item = T> + Send + 'static,
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Fut + Send + 'static,
    Fut: Future<Output = U> + Send,
{
    async_stream::stream! {
        futures_util::pin_mut!(stream);
        while let Some(item) = stream.next().await {
            yield f(item).await;
        }
    }
}

/// Batch items into fixed-size groups; a final partial group is flushed at
/// end of sequence.
pub fn buffer_stream<S, T>(stream: S, size: usize) -> impl Stream<Item = Vec<T>> + Send
where
    S: Stream<Item = T> + Send + 'static,
    T: Send + 'static,
{
    let size = size.max(1);
    async_stream::stream! {
        futures_util::pin_mut!(stream);
        let mut batch = Vec::with_capacity(size);
        while let Some(item) = stream.next().await {
            batch.push(item);
            if batch.len() == size {
                yield std::mem::replace(&mut batch, Vec::with_capacity(size));
            }
        }
        if !batch.is_empty() {
            yield batch;
        }
    }
}
