use super::ReadableInner;
use crate::error::{StreamError, StreamResult};
use std::{
    fmt,
    sync::{Arc, Weak},
};

/// Handle given to an underlying source for feeding its stream
///
/// Holds only a weak reference: a source that keeps its controller does not
/// keep the stream alive. Once the stream is dropped every operation fails
/// with [`StreamError::Detached`].
pub struct ReadableStreamDefaultController<T> {
    stream: Weak<ReadableInner<T>>,
}

impl<T> Clone for ReadableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            stream: Weak::clone(&self.stream),
        }
    }
}

impl<T> fmt::Debug for ReadableStreamDefaultController<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableStreamDefaultController")
            .field("attached", &(self.stream.strong_count() > 0))
            .finish()
    }
}

impl<T: Send + 'static> ReadableStreamDefaultController<T> {
    pub(crate) fn new(stream: Weak<ReadableInner<T>>) -> Self {
        Self { stream }
    }

    fn stream(&self) -> StreamResult<Arc<ReadableInner<T>>> {
        self.stream.upgrade().ok_or(StreamError::Detached)
    }

    /// highWaterMark minus queued size; `None` once errored, 0 once closed
    pub fn desired_size(&self) -> Option<f64> {
        self.stream.upgrade().and_then(|s| s.desired_size())
    }

    /// Queue a chunk, or hand it straight to the oldest pending read
    ///
    /// A failing size algorithm errors the stream and returns that error.
    pub fn enqueue(&self, chunk: T) -> StreamResult<()> {
        self.stream()?.enqueue(chunk)
    }

    /// Close once every queued chunk has been read
    pub fn close(&self) -> StreamResult<()> {
        self.stream()?.close_requested()
    }

    /// Error the stream, discarding queued chunks. No-op unless readable.
    pub fn error(&self, error: StreamError) {
        if let Ok(stream) = self.stream() {
            stream.error(error);
        }
    }

    pub(crate) fn stored_error(&self) -> Option<StreamError> {
        self.stream.upgrade().and_then(|s| s.core.lock().stored_error.clone())
    }

    pub(crate) fn has_backpressure(&self) -> bool {
        self.stream.upgrade().is_none_or(|s| s.has_backpressure())
    }
}
