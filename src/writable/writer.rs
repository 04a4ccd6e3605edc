use super::{State, WritableInner, WriterSlot};
use crate::error::{StreamError, StreamResult};
use crate::promise::Promise;
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tracing::debug;

static NEXT_WRITER_ID: AtomicU64 = AtomicU64::new(1);

/// Exclusive writer of a [`WritableStream`](super::WritableStream)
///
/// Dropping the writer releases the lock. Writes already queued still reach
/// the sink. The lock is also freed once the stream is closed or errored;
/// the writer then keeps reporting that final state.
pub struct WritableStreamDefaultWriter<T> {
    stream: Option<Arc<WritableInner<T>>>,
    id: u64,
    closed: Promise<()>,
}

impl<T> fmt::Debug for WritableStreamDefaultWriter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritableStreamDefaultWriter")
            .field("id", &self.id)
            .field("closed", &self.closed)
            .finish()
    }
}

impl<T: Send + 'static> WritableStreamDefaultWriter<T> {
    pub(crate) fn acquire(stream: &Arc<WritableInner<T>>) -> StreamResult<Self> {
        let mut core = stream.core.lock();
        if core.writer.is_some() {
            return Err(StreamError::Locked);
        }
        let id = NEXT_WRITER_ID.fetch_add(1, Ordering::Relaxed);
        let (ready, ready_resolver) = Promise::new();
        let (closed, closed_resolver) = Promise::new();
        match core.state {
            State::Writable => {
                if core.close_queued_or_in_flight() || !core.backpressure {
                    ready_resolver.resolve(());
                }
            }
            State::Erroring => {
                ready_resolver.reject(core.stored_error());
            }
            State::Closed => {
                ready_resolver.resolve(());
                closed_resolver.resolve(());
            }
            State::Errored => {
                ready_resolver.reject(core.stored_error());
                closed_resolver.reject(core.stored_error());
            }
        }
        core.writer = Some(WriterSlot {
            id,
            ready,
            ready_resolver,
            closed_resolver,
        });
        debug!(writer = id, "writer acquired lock");
        Ok(Self {
            stream: Some(Arc::clone(stream)),
            id,
            closed,
        })
    }

    /// Fulfilled while the stream wants more data
    ///
    /// Backpressure swaps in a fresh pending promise, so call this again
    /// rather than holding on to an old one.
    pub fn ready(&self) -> Promise<()> {
        let Some(stream) = &self.stream else {
            return Promise::rejected(StreamError::Released);
        };
        let core = stream.core.lock();
        if let Some(slot) = core.writer.as_ref().filter(|w| w.id == self.id) {
            return slot.ready.clone();
        }
        match core.state {
            State::Closed => Promise::resolved(()),
            State::Errored => Promise::rejected(core.stored_error()),
            State::Writable | State::Erroring => Promise::rejected(StreamError::Released),
        }
    }

    /// Settles when the stream closes (fulfilled) or errors (rejected)
    pub fn closed(&self) -> Promise<()> {
        self.closed.clone()
    }

    /// highWaterMark minus queued size; `None` while erroring or errored
    pub fn desired_size(&self) -> StreamResult<Option<f64>> {
        let stream = self.stream.as_ref().ok_or(StreamError::Released)?;
        Ok(stream.core.lock().writer_desired_size())
    }

    /// Queue a chunk; the promise settles once the sink has handled it
    pub fn write(&self, chunk: T) -> Promise<()> {
        match &self.stream {
            Some(stream) => stream.write(self.id, chunk),
            None => Promise::rejected(StreamError::Released),
        }
    }

    /// Close after every queued write has completed
    pub fn close(&self) -> Promise<()> {
        let Some(stream) = &self.stream else {
            return Promise::rejected(StreamError::Released);
        };
        if stream.core.lock().close_queued_or_in_flight() {
            return Promise::rejected(StreamError::CloseRequested);
        }
        stream.close()
    }

    /// Abort the stream, discarding queued writes
    pub fn abort(&self, reason: StreamError) -> Promise<()> {
        match &self.stream {
            Some(stream) => stream.abort(reason),
            None => Promise::rejected(StreamError::Released),
        }
    }

    /// Close unless the stream is already closing, closed or errored
    ///
    /// Used when a pipe forwards the end of its source: an errored
    /// destination reports its stored error and an already closing one
    /// reports success.
    pub(crate) fn close_with_error_propagation(&self) -> Promise<()> {
        let Some(stream) = &self.stream else {
            return Promise::rejected(StreamError::Released);
        };
        {
            let core = stream.core.lock();
            if core.close_queued_or_in_flight() || core.state == State::Closed {
                return Promise::resolved(());
            }
            if core.state == State::Errored {
                return Promise::rejected(core.stored_error());
            }
        }
        stream.close()
    }

    /// Unlock the stream. Pending `ready`/`closed` promises reject.
    pub fn release_lock(self) {
        drop(self);
    }
}

impl<T> Drop for WritableStreamDefaultWriter<T> {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.release_writer(self.id);
        }
    }
}
