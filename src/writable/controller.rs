use super::WritableInner;
use crate::error::StreamError;
use crate::signal::AbortSignal;
use std::{
    fmt,
    sync::{Arc, Weak},
};

/// Handle given to an underlying sink
///
/// Like the readable controller it only holds a weak reference to its stream.
pub struct WritableStreamDefaultController<T> {
    stream: Weak<WritableInner<T>>,
}

impl<T> Clone for WritableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            stream: Weak::clone(&self.stream),
        }
    }
}

impl<T> fmt::Debug for WritableStreamDefaultController<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritableStreamDefaultController")
            .field("attached", &(self.stream.strong_count() > 0))
            .finish()
    }
}

impl<T: Send + 'static> WritableStreamDefaultController<T> {
    pub(crate) fn new(stream: Weak<WritableInner<T>>) -> Self {
        Self { stream }
    }

    fn upgrade(&self) -> Option<Arc<WritableInner<T>>> {
        self.stream.upgrade()
    }

    /// Error the stream from the sink side
    ///
    /// Queued writes are rejected and the sink's `abort` hook is not called.
    /// No-op unless the stream is still writable.
    pub fn error(&self, error: StreamError) {
        if let Some(stream) = self.upgrade() {
            stream.error_if_needed(error);
        }
    }

    /// Signal fired when the stream is aborted, so a long write can bail out
    pub fn signal(&self) -> AbortSignal {
        match self.upgrade() {
            Some(stream) => stream.core.lock().abort_controller.signal(),
            None => AbortSignal::abort(StreamError::Detached),
        }
    }

    /// The stored error while the stream is erroring
    pub(crate) fn erroring_error(&self) -> Option<StreamError> {
        let stream = self.upgrade()?;
        let core = stream.core.lock();
        (core.state == super::State::Erroring).then(|| core.stored_error())
    }

    /// highWaterMark minus queued size; `None` once erroring
    pub fn desired_size(&self) -> Option<f64> {
        self.upgrade()
            .and_then(|stream| stream.core.lock().writer_desired_size())
    }
}
