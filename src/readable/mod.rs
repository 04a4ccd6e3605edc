//! ReadableStream
//!
//! A readable stream owns one default controller (queue + strategy) and at
//! most one reader at a time. State only moves forward:
//! `Readable -> Closed` or `Readable -> Errored`.
//!
//! Underlying source hooks run without any internal lock held, so a hook may
//! freely call back into its controller.

mod controller;
mod iter;
mod reader;
mod tee;

pub use controller::ReadableStreamDefaultController;
pub use iter::{Values, ValuesOptions};
pub use reader::ReadableStreamDefaultReader;

use crate::error::{StreamError, StreamResult};
use crate::hook::{self, HookFuture};
use crate::pipe::{self, PipeOptions};
use crate::promise::{Promise, Request, Resolver, Responder};
use crate::queue::SizedQueue;
use crate::strategy::QueuingStrategy;
use crate::transform::TransformStream;
use crate::writable::WritableStream;
use parking_lot::Mutex;
use std::{collections::VecDeque, fmt, sync::Arc};
use tracing::{debug, trace};

/// Producer side of a readable stream
///
/// Every hook is optional. `start` runs once during construction, `pull`
/// whenever the stream wants more data, `cancel` at most once when a
/// consumer gives up.
pub trait UnderlyingSource<T>: Send + 'static {
    fn start(&mut self, _controller: &ReadableStreamDefaultController<T>) -> HookFuture {
        hook::done()
    }

    fn pull(&mut self, _controller: &ReadableStreamDefaultController<T>) -> HookFuture {
        hook::done()
    }

    fn cancel(&mut self, _reason: StreamError) -> HookFuture {
        hook::done()
    }
}

/// A source with no hooks; the stream is driven through its controller only
impl<T: Send + 'static> UnderlyingSource<T> for () {}

/// Readable stream states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadableStreamState {
    Readable,
    Closed,
    Errored,
}

/// The reader currently holding the lock, as seen from the stream
pub(crate) struct ReaderSlot<T> {
    pub(crate) id: u64,
    read_requests: VecDeque<Responder<Option<T>>>,
    closed: Resolver<()>,
}

/// Stream and controller state, guarded by one lock
pub(crate) struct ReadableCore<T> {
    state: ReadableStreamState,
    stored_error: Option<StreamError>,
    disturbed: bool,
    reader: Option<ReaderSlot<T>>,
    queue: SizedQueue<T>,
    strategy: QueuingStrategy<T>,
    high_water_mark: f64,
    close_requested: bool,
    started: bool,
    pulling: bool,
    pull_again: bool,
}

impl<T> ReadableCore<T> {
    fn can_close_or_enqueue(&self) -> bool {
        !self.close_requested && self.state == ReadableStreamState::Readable
    }

    /// Why the controller refuses to close or enqueue
    fn refusal(&self) -> StreamError {
        match self.state {
            _ if self.close_requested => StreamError::CloseRequested,
            ReadableStreamState::Closed => StreamError::Closed,
            _ => StreamError::InvalidState("readable stream is errored"),
        }
    }

    fn desired_size(&self) -> Option<f64> {
        match self.state {
            ReadableStreamState::Errored => None,
            ReadableStreamState::Closed => Some(0.0),
            ReadableStreamState::Readable => Some(self.high_water_mark - self.queue.total_size()),
        }
    }

    fn pending_reads(&self) -> usize {
        self.reader.as_ref().map_or(0, |r| r.read_requests.len())
    }

    fn should_call_pull(&self) -> bool {
        if !self.can_close_or_enqueue() || !self.started {
            return false;
        }
        if self.pending_reads() > 0 {
            return true;
        }
        self.desired_size().is_some_and(|size| size > 0.0)
    }

    /// Settling a terminal state also frees the lock
    fn close(&mut self) {
        debug_assert_eq!(self.state, ReadableStreamState::Readable);
        self.state = ReadableStreamState::Closed;
        debug!("readable stream closed");
        if let Some(reader) = self.reader.take() {
            for request in reader.read_requests {
                request.respond(Ok(None));
            }
            reader.closed.resolve(());
            debug!(reader = reader.id, "lock freed by close");
        }
    }

    fn error(&mut self, error: StreamError) {
        debug_assert_eq!(self.state, ReadableStreamState::Readable);
        debug!(%error, "readable stream errored");
        self.state = ReadableStreamState::Errored;
        self.stored_error = Some(error.clone());
        if let Some(reader) = self.reader.take() {
            for request in reader.read_requests {
                request.respond(Err(error.clone()));
            }
            reader.closed.reject(error);
            debug!(reader = reader.id, "lock freed by error");
        }
    }

    fn stored_error(&self) -> StreamError {
        self.stored_error
            .clone()
            .unwrap_or(StreamError::InvalidState("readable stream is errored"))
    }
}

pub(crate) struct ReadableInner<T> {
    core: Mutex<ReadableCore<T>>,
    source: Mutex<Option<Box<dyn UnderlyingSource<T>>>>,
}

impl<T> ReadableInner<T> {
    /// Drop the underlying source once it can no longer be called.
    /// Skipped while one of its own hooks is still running.
    fn release_source(&self) {
        if let Some(mut source) = self.source.try_lock() {
            source.take();
        }
    }

    pub(crate) fn mark_disturbed(&self) {
        self.core.lock().disturbed = true;
    }

    /// Detach the reader `id`, rejecting everything it still waits on
    pub(crate) fn release_reader(&self, id: u64) {
        let mut core = self.core.lock();
        let readable = core.state == ReadableStreamState::Readable;
        let Some(reader) = core.reader.take_if(|r| r.id == id) else {
            return;
        };
        for request in reader.read_requests {
            request.respond(Err(StreamError::Released));
        }
        if readable {
            reader.closed.reject(StreamError::Released);
        }
        debug!(reader = id, "reader released lock");
    }
}

impl<T: Send + 'static> ReadableInner<T> {
    pub(crate) fn controller(self: &Arc<Self>) -> ReadableStreamDefaultController<T> {
        ReadableStreamDefaultController::new(Arc::downgrade(self))
    }

    pub(crate) fn enqueue(self: &Arc<Self>, chunk: T) -> StreamResult<()> {
        let strategy = {
            let mut core = self.core.lock();
            if !core.can_close_or_enqueue() {
                return Err(core.refusal());
            }
            match core.reader.as_mut().and_then(|r| r.read_requests.pop_front()) {
                Some(request) => {
                    trace!("chunk handed to pending read");
                    request.respond(Ok(Some(chunk)));
                    None
                }
                None => Some((core.strategy.clone(), chunk)),
            }
        };
        if let Some((strategy, chunk)) = strategy {
            // The size algorithm may call back into this stream
            let size = match strategy.chunk_size(&chunk) {
                Ok(size) => size,
                Err(e) => {
                    self.error(e.clone());
                    return Err(e);
                }
            };
            let mut core = self.core.lock();
            if !core.can_close_or_enqueue() {
                return Err(core.refusal());
            }
            match core.reader.as_mut().and_then(|r| r.read_requests.pop_front()) {
                Some(request) => request.respond(Ok(Some(chunk))),
                None => {
                    core.queue.enqueue(chunk, size);
                    trace!(size, total = core.queue.total_size(), "chunk enqueued");
                }
            }
        }
        self.call_pull_if_needed();
        Ok(())
    }

    pub(crate) fn close_requested(self: &Arc<Self>) -> StreamResult<()> {
        {
            let mut core = self.core.lock();
            if !core.can_close_or_enqueue() {
                return Err(core.refusal());
            }
            core.close_requested = true;
            if !core.queue.is_empty() {
                trace!(queued = core.queue.len(), "close deferred until queue drains");
                return Ok(());
            }
            core.close();
        }
        self.release_source();
        Ok(())
    }

    /// Error the stream if it is still readable. No-op otherwise.
    pub(crate) fn error(self: &Arc<Self>, error: StreamError) {
        {
            let mut core = self.core.lock();
            if core.state != ReadableStreamState::Readable {
                return;
            }
            core.queue.reset();
            core.error(error);
        }
        self.release_source();
    }

    pub(crate) fn desired_size(&self) -> Option<f64> {
        self.core.lock().desired_size()
    }

    pub(crate) fn has_backpressure(&self) -> bool {
        !self.core.lock().should_call_pull()
    }

    pub(crate) fn call_pull_if_needed(self: &Arc<Self>) {
        {
            let mut core = self.core.lock();
            if !core.should_call_pull() {
                return;
            }
            if core.pulling {
                core.pull_again = true;
                return;
            }
            core.pulling = true;
        }
        let this = Arc::clone(self);
        hook::react(async move { this.run_pull().await });
    }

    async fn run_pull(self: Arc<Self>) {
        let controller = self.controller();
        let pulled = {
            let mut source = self.source.lock();
            match source.as_mut() {
                Some(source) => source.pull(&controller),
                None => hook::done(),
            }
        };
        trace!("pull requested");
        match pulled.await {
            Ok(()) => {
                let again = {
                    let mut core = self.core.lock();
                    core.pulling = false;
                    std::mem::take(&mut core.pull_again)
                };
                if again {
                    self.call_pull_if_needed();
                }
            }
            Err(e) => self.error(e),
        }
    }

    /// A read through reader `id`
    ///
    /// A reader whose lock was freed by the stream closing or erroring keeps
    /// observing that final state.
    pub(crate) fn read(self: &Arc<Self>, id: u64) -> Request<Option<T>> {
        let (request, closed) = {
            let mut core = self.core.lock();
            let attached = core.reader.as_ref().is_some_and(|r| r.id == id);
            match core.state {
                ReadableStreamState::Readable if !attached => {
                    return Request::ready(Err(StreamError::Released));
                }
                ReadableStreamState::Closed => {
                    core.disturbed = true;
                    return Request::ready(Ok(None));
                }
                ReadableStreamState::Errored => {
                    core.disturbed = true;
                    return Request::ready(Err(core.stored_error()));
                }
                ReadableStreamState::Readable => core.disturbed = true,
            }
            match core.queue.dequeue() {
                Some((chunk, _)) => {
                    trace!(total = core.queue.total_size(), "chunk dequeued");
                    let drained = core.close_requested && core.queue.is_empty();
                    if drained {
                        core.close();
                    }
                    (Request::ready(Ok(Some(chunk))), drained)
                }
                None => {
                    let (request, responder) = Request::new();
                    if let Some(reader) = core.reader.as_mut() {
                        reader.read_requests.push_back(responder);
                    }
                    (request, false)
                }
            }
        };
        if closed {
            self.release_source();
        } else {
            self.call_pull_if_needed();
        }
        request
    }

    pub(crate) fn cancel(self: &Arc<Self>, reason: StreamError) -> Promise<()> {
        {
            let mut core = self.core.lock();
            core.disturbed = true;
            match core.state {
                ReadableStreamState::Closed => return Promise::resolved(()),
                ReadableStreamState::Errored => return Promise::rejected(core.stored_error()),
                ReadableStreamState::Readable => {}
            }
            debug!(%reason, "readable stream cancelled");
            core.close();
            core.queue.reset();
        }
        // Taking the source makes the cancel hook fire at most once
        let source = self.source.lock().take();
        let cancelled = match source {
            Some(mut source) => source.cancel(reason),
            None => hook::done(),
        };
        let (promise, resolver) = Promise::new();
        hook::react(async move {
            resolver.settle_with(cancelled.await);
        });
        promise
    }
}

/// A readable stream of `T` chunks
///
/// Cloning yields another handle to the same stream.
pub struct ReadableStream<T> {
    pub(crate) inner: Arc<ReadableInner<T>>,
}

impl<T> Clone for ReadableStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for ReadableStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("ReadableStream")
            .field("state", &core.state)
            .field("locked", &core.reader.is_some())
            .field("queued", &core.queue.len())
            .finish()
    }
}

impl<T: Send + 'static> ReadableStream<T> {
    /// Create a stream over `source`, calling its `start` hook immediately
    pub fn new(
        source: impl UnderlyingSource<T>,
        strategy: QueuingStrategy<T>,
    ) -> StreamResult<Self> {
        let high_water_mark = strategy.validated_high_water_mark()?;
        Ok(Self::with_validated_strategy(Box::new(source), strategy, high_water_mark))
    }

    /// Create a stream with the default strategy (highWaterMark 1, size 1)
    pub fn from_source(source: impl UnderlyingSource<T>) -> Self {
        Self::with_validated_strategy(Box::new(source), QueuingStrategy::default(), 1.0)
    }

    pub(crate) fn with_validated_strategy(
        source: Box<dyn UnderlyingSource<T>>,
        strategy: QueuingStrategy<T>,
        high_water_mark: f64,
    ) -> Self {
        let inner = Arc::new(ReadableInner {
            core: Mutex::new(ReadableCore {
                state: ReadableStreamState::Readable,
                stored_error: None,
                disturbed: false,
                reader: None,
                queue: SizedQueue::new(),
                strategy,
                high_water_mark,
                close_requested: false,
                started: false,
                pulling: false,
                pull_again: false,
            }),
            source: Mutex::new(Some(source)),
        });

        let controller = inner.controller();
        let started = {
            let mut source = inner.source.lock();
            match source.as_mut() {
                Some(source) => source.start(&controller),
                None => hook::done(),
            }
        };
        let this = Arc::clone(&inner);
        hook::react(async move {
            match started.await {
                Ok(()) => {
                    this.core.lock().started = true;
                    this.call_pull_if_needed();
                }
                Err(e) => {
                    debug!(error = %e, "underlying source failed to start");
                    this.error(e);
                }
            }
        });

        Self { inner }
    }

    pub fn state(&self) -> ReadableStreamState {
        self.inner.core.lock().state
    }

    pub fn locked(&self) -> bool {
        self.inner.core.lock().reader.is_some()
    }

    /// Whether the stream has ever been read from or cancelled
    pub fn is_disturbed(&self) -> bool {
        self.inner.core.lock().disturbed
    }

    /// The stored error of an errored stream
    pub fn stored_error(&self) -> Option<StreamError> {
        self.inner.core.lock().stored_error.clone()
    }

    /// Lock the stream to a new reader
    pub fn get_reader(&self) -> StreamResult<ReadableStreamDefaultReader<T>> {
        ReadableStreamDefaultReader::acquire(&self.inner)
    }

    /// Cancel an unlocked stream
    pub fn cancel(&self, reason: StreamError) -> Promise<()> {
        if self.locked() {
            return Promise::rejected(StreamError::Locked);
        }
        self.inner.cancel(reason)
    }

    /// Pipe every chunk into `destination`; see [`PipeOptions`]
    pub fn pipe_to(&self, destination: &WritableStream<T>, options: PipeOptions) -> Promise<()> {
        pipe::pipe_to(self, destination, options)
    }

    /// Pipe into the writable side of `transform` and return its readable side
    pub fn pipe_through<O: Send + 'static>(
        &self,
        transform: &TransformStream<T, O>,
        options: PipeOptions,
    ) -> StreamResult<ReadableStream<O>> {
        if self.locked() || transform.writable().locked() {
            return Err(StreamError::Locked);
        }
        let piped = self.pipe_to(transform.writable(), options);
        hook::react(async move {
            if let Err(error) = piped.await {
                trace!(%error, "pipe_through pipe ended with error");
            }
        });
        Ok(transform.readable().clone())
    }

    /// Read every remaining chunk until the stream closes
    pub async fn collect(&self) -> StreamResult<Vec<T>> {
        let reader = self.get_reader()?;
        let mut chunks = Vec::new();
        while let Some(chunk) = reader.read().await? {
            chunks.push(chunk);
        }
        Ok(chunks)
    }
}

/// Source behind [`ReadableStream::from_iter`]
struct IterSource<T> {
    chunks: Vec<T>,
}

impl<T: Send + 'static> UnderlyingSource<T> for IterSource<T> {
    fn start(&mut self, controller: &ReadableStreamDefaultController<T>) -> HookFuture {
        for chunk in self.chunks.drain(..) {
            if let Err(e) = controller.enqueue(chunk) {
                return hook::fail(e);
            }
        }
        match controller.close() {
            Ok(()) => hook::done(),
            Err(e) => hook::fail(e),
        }
    }
}

impl<T: Send + 'static> FromIterator<T> for ReadableStream<T> {
    /// A closed stream pre-filled with every item
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::from_source(IterSource {
            chunks: iter.into_iter().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        next: u32,
        limit: u32,
        pulls: Arc<AtomicUsize>,
    }

    impl UnderlyingSource<u32> for Counting {
        fn pull(&mut self, controller: &ReadableStreamDefaultController<u32>) -> HookFuture {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            if self.next == self.limit {
                return match controller.close() {
                    Ok(()) => hook::done(),
                    Err(e) => hook::fail(e),
                };
            }
            self.next += 1;
            match controller.enqueue(self.next) {
                Ok(()) => hook::done(),
                Err(e) => hook::fail(e),
            }
        }
    }

    #[tokio::test]
    async fn test_from_iter_reads_in_order() {
        let stream: ReadableStream<u32> = (1..=3).collect();
        let reader = stream.get_reader().unwrap();
        assert_eq!(reader.read().await, Ok(Some(1)));
        assert_eq!(reader.read().await, Ok(Some(2)));
        assert_eq!(reader.read().await, Ok(Some(3)));
        assert_eq!(reader.read().await, Ok(None));
        assert_eq!(reader.read().await, Ok(None));
        assert_eq!(stream.state(), ReadableStreamState::Closed);
    }

    #[tokio::test]
    async fn test_pull_fills_to_high_water_mark() {
        let pulls = Arc::new(AtomicUsize::new(0));
        let stream = ReadableStream::new(
            Counting {
                next: 0,
                limit: 100,
                pulls: Arc::clone(&pulls),
            },
            QueuingStrategy::new(3.0),
        )
        .unwrap();

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        // Pulling stops once the queue reaches the highWaterMark
        assert_eq!(pulls.load(Ordering::SeqCst), 3);
        assert_eq!(stream.inner.desired_size(), Some(0.0));

        let reader = stream.get_reader().unwrap();
        assert_eq!(reader.read().await, Ok(Some(1)));
    }

    #[tokio::test]
    async fn test_pull_source_closes() {
        let stream = ReadableStream::from_source(Counting {
            next: 0,
            limit: 2,
            pulls: Arc::new(AtomicUsize::new(0)),
        });
        assert_eq!(stream.collect().await, Ok(vec![1, 2]));
    }

    #[tokio::test]
    async fn test_pending_reads_fulfilled_fifo() {
        let controller = Arc::new(Mutex::new(None));
        struct Capture(Arc<Mutex<Option<ReadableStreamDefaultController<&'static str>>>>);
        impl UnderlyingSource<&'static str> for Capture {
            fn start(
                &mut self,
                controller: &ReadableStreamDefaultController<&'static str>,
            ) -> HookFuture {
                *self.0.lock() = Some(controller.clone());
                hook::done()
            }
        }

        let stream = ReadableStream::from_source(Capture(Arc::clone(&controller)));
        let reader = stream.get_reader().unwrap();
        let first = reader.read();
        let second = reader.read();

        let controller = controller.lock().clone().unwrap();
        controller.enqueue("a").unwrap();
        controller.enqueue("b").unwrap();
        controller.close().unwrap();

        assert_eq!(first.await, Ok(Some("a")));
        assert_eq!(second.await, Ok(Some("b")));
        assert_eq!(reader.read().await, Ok(None));
        assert_eq!(reader.closed().await, Ok(()));
    }

    #[tokio::test]
    async fn test_size_failure_errors_stream() {
        let strategy = QueuingStrategy::new(1.0).with_size(|_: &u8| Err(StreamError::custom("size")));
        let stream = ReadableStream::new((), strategy).unwrap();
        let controller = stream.inner.controller();

        assert_eq!(controller.enqueue(1), Err(StreamError::custom("size")));
        assert_eq!(stream.state(), ReadableStreamState::Errored);
        assert_eq!(stream.stored_error(), Some(StreamError::custom("size")));

        let reader = stream.get_reader().unwrap();
        assert_eq!(reader.read().await, Err(StreamError::custom("size")));
        assert_eq!(reader.closed().await, Err(StreamError::custom("size")));
    }

    #[tokio::test]
    async fn test_size_algorithm_may_query_stream() {
        let slot: Arc<Mutex<Option<ReadableStreamDefaultController<u8>>>> = Arc::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let strategy = {
            let slot = Arc::clone(&slot);
            let seen = Arc::clone(&seen);
            QueuingStrategy::new(4.0).with_size(move |chunk: &u8| {
                let controller = slot.lock().clone();
                if let Some(controller) = controller {
                    seen.lock().push(controller.desired_size());
                }
                Ok(f64::from(*chunk))
            })
        };
        let stream = ReadableStream::new((), strategy).unwrap();
        let controller = stream.inner.controller();
        *slot.lock() = Some(controller.clone());

        controller.enqueue(1).unwrap();
        controller.enqueue(2).unwrap();
        assert_eq!(*seen.lock(), vec![Some(4.0), Some(3.0)]);
        assert_eq!(controller.desired_size(), Some(1.0));
    }

    #[tokio::test]
    async fn test_close_deferred_until_drained() {
        let stream = ReadableStream::<u8>::from_source(());
        let controller = stream.inner.controller();
        controller.enqueue(1).unwrap();
        controller.close().unwrap();
        assert_eq!(stream.state(), ReadableStreamState::Readable);
        assert_eq!(controller.enqueue(2), Err(StreamError::CloseRequested));

        let reader = stream.get_reader().unwrap();
        assert_eq!(reader.read().await, Ok(Some(1)));
        assert_eq!(stream.state(), ReadableStreamState::Closed);
        assert_eq!(controller.close(), Err(StreamError::Closed));
    }

    #[tokio::test]
    async fn test_error_is_idempotent() {
        let stream = ReadableStream::<u8>::from_source(());
        let controller = stream.inner.controller();
        controller.error(StreamError::custom("first"));
        controller.error(StreamError::custom("second"));
        assert_eq!(stream.stored_error(), Some(StreamError::custom("first")));
        assert_eq!(controller.desired_size(), None);
    }

    #[tokio::test]
    async fn test_failed_start_errors_stream() {
        struct Broken;
        impl UnderlyingSource<u8> for Broken {
            fn start(&mut self, _: &ReadableStreamDefaultController<u8>) -> HookFuture {
                hook::fail("start failed")
            }
        }
        let stream = ReadableStream::from_source(Broken);
        let reader = stream.get_reader().unwrap();
        assert_eq!(reader.read().await, Err(StreamError::custom("start failed")));
    }

    #[tokio::test]
    async fn test_failed_pull_errors_stream() {
        struct Broken;
        impl UnderlyingSource<u8> for Broken {
            fn pull(&mut self, _: &ReadableStreamDefaultController<u8>) -> HookFuture {
                hook::fail("pull failed")
            }
        }
        let stream = ReadableStream::from_source(Broken);
        let reader = stream.get_reader().unwrap();
        assert_eq!(reader.read().await, Err(StreamError::custom("pull failed")));
        assert_eq!(stream.state(), ReadableStreamState::Errored);
    }

    #[tokio::test]
    async fn test_stream_cancel_requires_unlocked() {
        let stream: ReadableStream<u8> = vec![1].into_iter().collect();
        let reader = stream.get_reader().unwrap();
        assert_eq!(stream.cancel(StreamError::Aborted).await, Err(StreamError::Locked));
        drop(reader);
        assert_eq!(stream.cancel(StreamError::Aborted).await, Ok(()));
        assert!(stream.is_disturbed());
    }

    #[test]
    fn test_invalid_strategy_rejected() {
        let result = ReadableStream::<u8>::new((), QueuingStrategy::new(-1.0));
        assert!(matches!(result, Err(StreamError::InvalidHighWaterMark(_))));
    }

    #[tokio::test]
    async fn test_read_after_close_is_done() {
        let stream = ReadableStream::<u8>::from_source(());
        let reader = stream.get_reader().unwrap();
        stream.inner.controller().close().unwrap();
        assert_eq!(reader.read().now_or_never(), Some(Ok(None)));
    }
}
