//! Streaming and flow-control primitives.
//!
//! These are the leaf concurrency types the dispatch layer composes:
//! a push/pull stream controller, FIFO-fair backpressure, a bounded token
//! ring, cooperative cancellation, and sequence transforms.

pub mod backpressure;
pub mod cancellation;
pub mod controller;
pub mod token_buffer;
pub mod transforms;

pub use backpressure::{BackpressureHandler, BackpressurePermit};
pub use cancellation::StreamCancellation;
pub use controller::{StreamController, StreamState};
pub use token_buffer::TokenBuffer;
pub use transforms::{buffer_stream, stream_with_timeout, transform_stream};
