use super::{ReadableInner, ReadableStreamState, ReaderSlot};
use crate::error::{StreamError, StreamResult};
use crate::promise::{Promise, Request};
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tracing::debug;

static NEXT_READER_ID: AtomicU64 = AtomicU64::new(1);

/// Exclusive reader of a [`ReadableStream`](super::ReadableStream)
///
/// Dropping the reader (or calling [`release_lock`](Self::release_lock))
/// unlocks the stream and rejects reads still waiting for a chunk. The lock
/// is also freed once the stream closes or errors; the reader then keeps
/// reporting that final state.
pub struct ReadableStreamDefaultReader<T> {
    stream: Option<Arc<ReadableInner<T>>>,
    id: u64,
    closed: Promise<()>,
}

impl<T> fmt::Debug for ReadableStreamDefaultReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableStreamDefaultReader")
            .field("id", &self.id)
            .field("closed", &self.closed)
            .finish()
    }
}

impl<T: Send + 'static> ReadableStreamDefaultReader<T> {
    pub(crate) fn acquire(stream: &Arc<ReadableInner<T>>) -> StreamResult<Self> {
        let mut core = stream.core.lock();
        if core.reader.is_some() {
            return Err(StreamError::Locked);
        }
        let id = NEXT_READER_ID.fetch_add(1, Ordering::Relaxed);
        let (closed, resolver) = Promise::new();
        match core.state {
            ReadableStreamState::Readable => {}
            ReadableStreamState::Closed => {
                resolver.resolve(());
            }
            ReadableStreamState::Errored => {
                resolver.reject(core.stored_error());
            }
        }
        core.reader = Some(ReaderSlot {
            id,
            read_requests: VecDeque::new(),
            closed: resolver,
        });
        debug!(reader = id, "reader acquired lock");
        Ok(Self {
            stream: Some(Arc::clone(stream)),
            id,
            closed,
        })
    }

    /// Next chunk, `None` once the stream is closed
    ///
    /// The request is registered immediately; requests made while the queue
    /// is empty are fulfilled in the order they were made.
    pub fn read(&self) -> Request<Option<T>> {
        match &self.stream {
            Some(stream) => stream.read(self.id),
            None => Request::ready(Err(StreamError::Released)),
        }
    }

    /// Cancel the stream; pending reads resolve as done
    pub fn cancel(&self, reason: StreamError) -> Promise<()> {
        match &self.stream {
            Some(stream) => stream.cancel(reason),
            None => Promise::rejected(StreamError::Released),
        }
    }

    /// Settles when the stream closes (fulfilled) or errors (rejected)
    pub fn closed(&self) -> Promise<()> {
        self.closed.clone()
    }

    /// Unlock the stream. Reads still waiting for a chunk are rejected.
    pub fn release_lock(self) {
        drop(self);
    }
}

impl<T> Drop for ReadableStreamDefaultReader<T> {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.release_reader(self.id);
        }
    }
}
