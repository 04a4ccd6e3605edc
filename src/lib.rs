//! Viper Streams - WHATWG-style streams for the Viper runtime
//!
//! Viper Streams provides the flow-control engine behind web streams:
//! - ReadableStream: queued chunks pulled from an underlying source
//! - WritableStream: ordered writes into an underlying sink
//! - TransformStream: a writable side feeding a readable side
//! - pipe_to / pipe_through: moving chunks with backpressure, error and
//!   cancellation propagation
//!
//! Every stream is locked to at most one reader or writer. Operations return
//! eager [`Promise`]/[`Request`] handles; hooks of sources and sinks are
//! observed on the current Tokio runtime.

pub mod error;
pub mod hook;
pub mod pipe;
pub mod promise;
mod queue;
pub mod readable;
pub mod signal;
pub mod strategy;
pub mod transform;
pub mod writable;

// Re-export commonly used types
pub use error::{StreamError, StreamResult};
pub use hook::HookFuture;
pub use pipe::{PipeOptions, pipe_to};
pub use promise::{Promise, Request, Resolver};
pub use readable::{
    ReadableStream, ReadableStreamDefaultController, ReadableStreamDefaultReader,
    ReadableStreamState, UnderlyingSource, Values, ValuesOptions,
};
pub use signal::{AbortController, AbortSignal};
pub use strategy::{ByteLengthQueuingStrategy, CountQueuingStrategy, QueuingStrategy, SizeAlgorithm};
pub use transform::{
    IdentityTransformer, TransformStream, TransformStreamDefaultController, Transformer,
};
pub use writable::{
    UnderlyingSink, WritableStream, WritableStreamDefaultController, WritableStreamDefaultWriter,
    WritableStreamState,
};
