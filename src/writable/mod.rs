//! WritableStream
//!
//! State machine:
//! - `Writable --close()--> Closing --(queue drained, sink closed)--> Closed`
//! - `Writable|Closing --error/abort--> Erroring --(in-flight op settled)--> Errored`
//!
//! Writes are queued in the controller and handed to the underlying sink one
//! at a time; the next write only starts after the previous one settled.
//! Sink hooks run without any internal lock held.

mod controller;
mod writer;

pub use controller::WritableStreamDefaultController;
pub use writer::WritableStreamDefaultWriter;

use crate::error::{StreamError, StreamResult};
use crate::hook::{self, HookFuture};
use crate::promise::{Promise, Resolver};
use crate::queue::SizedQueue;
use crate::signal::AbortController;
use crate::strategy::QueuingStrategy;
use parking_lot::Mutex;
use std::{collections::VecDeque, fmt, sync::Arc};
use tracing::{debug, trace};

/// Consumer side of a writable stream
///
/// Every hook is optional. `start` runs once during construction; `write`
/// and `close` are never called before it settles, and never concurrently.
pub trait UnderlyingSink<T>: Send + 'static {
    fn start(&mut self, _controller: &WritableStreamDefaultController<T>) -> HookFuture {
        hook::done()
    }

    fn write(&mut self, _chunk: T, _controller: &WritableStreamDefaultController<T>) -> HookFuture {
        hook::done()
    }

    fn close(&mut self) -> HookFuture {
        hook::done()
    }

    fn abort(&mut self, _reason: StreamError) -> HookFuture {
        hook::done()
    }
}

/// A sink that accepts and discards everything
impl<T: Send + 'static> UnderlyingSink<T> for () {}

/// Writable stream states as observed from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritableStreamState {
    Writable,
    /// Writable, but `close()` has been requested
    Closing,
    Erroring,
    Closed,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Writable,
    Erroring,
    Closed,
    Errored,
}

enum WriteRecord<T> {
    Chunk(T),
    Close,
}

struct PendingAbort {
    promise: Promise<()>,
    resolver: Resolver<()>,
    reason: StreamError,
    was_already_erroring: bool,
}

/// The writer currently holding the lock, as seen from the stream
struct WriterSlot {
    id: u64,
    ready: Promise<()>,
    ready_resolver: Resolver<()>,
    closed_resolver: Resolver<()>,
}

impl WriterSlot {
    fn reject_ready(&mut self, error: StreamError) {
        if !self.ready_resolver.reject(error.clone()) {
            self.ready = Promise::rejected(error);
        }
    }
}

struct WritableCore<T> {
    state: State,
    stored_error: Option<StreamError>,
    writer: Option<WriterSlot>,
    write_requests: VecDeque<Resolver<()>>,
    in_flight_write: Option<Resolver<()>>,
    close_request: Option<Resolver<()>>,
    in_flight_close: Option<Resolver<()>>,
    pending_abort: Option<PendingAbort>,
    backpressure: bool,
    queue: SizedQueue<WriteRecord<T>>,
    in_flight_size: f64,
    strategy: QueuingStrategy<T>,
    high_water_mark: f64,
    started: bool,
    algorithms_cleared: bool,
    abort_controller: AbortController,
}

impl<T> WritableCore<T> {
    fn close_queued_or_in_flight(&self) -> bool {
        self.close_request.is_some() || self.in_flight_close.is_some()
    }

    fn has_operation_marked_in_flight(&self) -> bool {
        self.in_flight_write.is_some() || self.in_flight_close.is_some()
    }

    fn public_state(&self) -> WritableStreamState {
        match self.state {
            State::Writable if self.close_queued_or_in_flight() => WritableStreamState::Closing,
            State::Writable => WritableStreamState::Writable,
            State::Erroring => WritableStreamState::Erroring,
            State::Closed => WritableStreamState::Closed,
            State::Errored => WritableStreamState::Errored,
        }
    }

    fn queued_size(&self) -> f64 {
        self.queue.total_size() + self.in_flight_size
    }

    fn controller_desired_size(&self) -> f64 {
        self.high_water_mark - self.queued_size()
    }

    fn writer_desired_size(&self) -> Option<f64> {
        match self.state {
            State::Errored | State::Erroring => None,
            State::Closed => Some(0.0),
            State::Writable => Some(self.controller_desired_size()),
        }
    }

    fn stored_error(&self) -> StreamError {
        self.stored_error.clone().unwrap_or(StreamError::NotWritable)
    }

    fn update_backpressure(&mut self, backpressure: bool) {
        if backpressure == self.backpressure {
            return;
        }
        if let Some(writer) = self.writer.as_mut() {
            if backpressure {
                let (ready, resolver) = Promise::new();
                writer.ready = ready;
                writer.ready_resolver = resolver;
            } else {
                writer.ready_resolver.resolve(());
            }
        }
        trace!(backpressure, "writable backpressure changed");
        self.backpressure = backpressure;
    }

    /// Enter `Erroring`. Returns true when erroring can finish right away.
    fn start_erroring(&mut self, reason: StreamError) -> bool {
        debug_assert_eq!(self.state, State::Writable);
        debug!(%reason, "writable stream erroring");
        self.state = State::Erroring;
        self.stored_error = Some(reason.clone());
        if let Some(writer) = self.writer.as_mut() {
            writer.reject_ready(reason);
        }
        !self.has_operation_marked_in_flight() && self.started
    }

    /// Final step of erroring; frees the lock
    fn reject_close_and_closed_promise_if_needed(&mut self) {
        debug_assert_eq!(self.state, State::Errored);
        let error = self.stored_error();
        if let Some(close_request) = self.close_request.take() {
            close_request.reject(error.clone());
        }
        if let Some(writer) = self.writer.take() {
            writer.closed_resolver.reject(error);
            debug!(writer = writer.id, "lock freed by error");
        }
    }
}

pub(crate) struct WritableInner<T> {
    core: Mutex<WritableCore<T>>,
    sink: Mutex<Option<Box<dyn UnderlyingSink<T>>>>,
}

impl<T> WritableInner<T> {
    /// Drop the sink unless one of its hooks is running right now
    fn release_sink(&self) {
        if let Some(mut sink) = self.sink.try_lock() {
            sink.take();
        }
    }

    pub(crate) fn release_writer(&self, id: u64) {
        let mut core = self.core.lock();
        let Some(mut writer) = core.writer.take_if(|w| w.id == id) else {
            return;
        };
        writer.reject_ready(StreamError::Released);
        writer.closed_resolver.reject(StreamError::Released);
        debug!(writer = id, "writer released lock");
    }
}

impl<T: Send + 'static> WritableInner<T> {
    pub(crate) fn controller(self: &Arc<Self>) -> WritableStreamDefaultController<T> {
        WritableStreamDefaultController::new(Arc::downgrade(self))
    }

    pub(crate) fn abort(self: &Arc<Self>, reason: StreamError) -> Promise<()> {
        let signal = {
            let core = self.core.lock();
            if matches!(core.state, State::Closed | State::Errored) {
                return Promise::resolved(());
            }
            core.abort_controller.clone()
        };
        signal.abort(Some(reason.clone()));

        let (promise, finish) = {
            let mut core = self.core.lock();
            if matches!(core.state, State::Closed | State::Errored) {
                return Promise::resolved(());
            }
            if let Some(pending) = core.pending_abort.as_ref() {
                return pending.promise.clone();
            }
            let was_already_erroring = core.state == State::Erroring;
            let (promise, resolver) = Promise::new();
            core.pending_abort = Some(PendingAbort {
                promise: promise.clone(),
                resolver,
                reason: reason.clone(),
                was_already_erroring,
            });
            debug!(%reason, "writable stream aborted");
            let finish = !was_already_erroring && core.start_erroring(reason);
            (promise, finish)
        };
        if finish {
            self.finish_erroring();
        }
        promise
    }

    pub(crate) fn close(self: &Arc<Self>) -> Promise<()> {
        let promise = {
            let mut core = self.core.lock();
            match core.state {
                State::Closed => return Promise::rejected(StreamError::Closed),
                State::Errored => return Promise::rejected(StreamError::NotWritable),
                State::Writable | State::Erroring => {}
            }
            if core.close_queued_or_in_flight() {
                return Promise::rejected(StreamError::CloseRequested);
            }
            let (promise, resolver) = Promise::new();
            core.close_request = Some(resolver);
            if core.backpressure && core.state == State::Writable {
                if let Some(writer) = core.writer.as_ref() {
                    writer.ready_resolver.resolve(());
                }
            }
            core.queue.enqueue(WriteRecord::Close, 0.0);
            debug!("writable stream closing");
            promise
        };
        self.advance_queue_if_needed();
        promise
    }

    /// A write through writer `id`
    pub(crate) fn write(self: &Arc<Self>, id: u64, chunk: T) -> Promise<()> {
        // The size algorithm may call back into this stream
        let strategy = self.core.lock().strategy.clone();
        let size = match strategy.chunk_size(&chunk) {
            Ok(size) => size,
            Err(e) => {
                self.error_if_needed(e);
                1.0
            }
        };

        let promise = {
            let mut core = self.core.lock();
            let attached = core.writer.as_ref().is_some_and(|w| w.id == id);
            match core.state {
                // A writer freed by the stream's end still sees that end
                State::Errored => return Promise::rejected(core.stored_error()),
                State::Closed => return Promise::rejected(StreamError::Closed),
                _ if !attached => return Promise::rejected(StreamError::Released),
                State::Erroring => return Promise::rejected(core.stored_error()),
                State::Writable if core.close_queued_or_in_flight() => {
                    return Promise::rejected(StreamError::CloseRequested);
                }
                State::Writable => {}
            }
            let (promise, resolver) = Promise::new();
            core.write_requests.push_back(resolver);
            core.queue.enqueue(WriteRecord::Chunk(chunk), size);
            trace!(size, total = core.queued_size(), "write queued");
            let backpressure = core.controller_desired_size() <= 0.0;
            core.update_backpressure(backpressure);
            promise
        };
        self.advance_queue_if_needed();
        promise
    }

    /// Error the stream from the sink side. No-op unless writable.
    pub(crate) fn error_if_needed(self: &Arc<Self>, error: StreamError) {
        let finish = {
            let mut core = self.core.lock();
            if core.state != State::Writable {
                return;
            }
            core.algorithms_cleared = true;
            core.start_erroring(error)
        };
        self.release_sink();
        if finish {
            self.finish_erroring();
        }
    }

    fn deal_with_rejection(self: &Arc<Self>, error: StreamError) {
        let finish = {
            let mut core = self.core.lock();
            match core.state {
                State::Writable => core.start_erroring(error),
                _ => true,
            }
        };
        if finish {
            self.finish_erroring();
        }
    }

    fn finish_erroring(self: &Arc<Self>) {
        let (abort, skip_hook) = {
            let mut core = self.core.lock();
            debug_assert_eq!(core.state, State::Erroring);
            debug_assert!(!core.has_operation_marked_in_flight());
            core.state = State::Errored;
            core.queue.reset();
            core.in_flight_size = 0.0;
            let error = core.stored_error();
            debug!(%error, "writable stream errored");
            for request in core.write_requests.drain(..) {
                request.reject(error.clone());
            }
            let Some(abort) = core.pending_abort.take() else {
                core.reject_close_and_closed_promise_if_needed();
                return;
            };
            if abort.was_already_erroring {
                abort.resolver.reject(error);
                core.reject_close_and_closed_promise_if_needed();
                return;
            }
            (abort, std::mem::replace(&mut core.algorithms_cleared, true))
        };

        let sink = self.sink.lock().take();
        let aborted = match sink {
            Some(mut sink) if !skip_hook => sink.abort(abort.reason.clone()),
            _ => hook::done(),
        };
        let this = Arc::clone(self);
        hook::react(async move {
            let result = aborted.await;
            abort.resolver.settle_with(result);
            this.core.lock().reject_close_and_closed_promise_if_needed();
        });
    }

    fn advance_queue_if_needed(self: &Arc<Self>) {
        enum Next<T> {
            Idle,
            FinishErroring,
            Close,
            Write(T),
        }

        let next = {
            let mut core = self.core.lock();
            if !core.started || core.in_flight_write.is_some() {
                return;
            }
            match core.state {
                State::Closed | State::Errored => Next::Idle,
                State::Erroring => Next::FinishErroring,
                State::Writable => match core.queue.dequeue() {
                    None => Next::Idle,
                    Some((WriteRecord::Close, _)) => {
                        debug_assert!(core.queue.is_empty());
                        core.in_flight_close = core.close_request.take();
                        Next::Close
                    }
                    Some((WriteRecord::Chunk(chunk), size)) => {
                        core.in_flight_write = core.write_requests.pop_front();
                        core.in_flight_size = size;
                        Next::Write(chunk)
                    }
                },
            }
        };

        match next {
            Next::Idle => {}
            Next::FinishErroring => self.finish_erroring(),
            Next::Close => self.process_close(),
            Next::Write(chunk) => self.process_write(chunk),
        }
    }

    fn process_close(self: &Arc<Self>) {
        let closed = {
            let mut sink = self.sink.lock();
            let closed = match sink.as_mut() {
                Some(sink) => sink.close(),
                None => hook::done(),
            };
            sink.take();
            closed
        };
        self.core.lock().algorithms_cleared = true;
        let this = Arc::clone(self);
        hook::react(async move {
            match closed.await {
                Ok(()) => this.finish_in_flight_close(),
                Err(e) => this.finish_in_flight_close_with_error(e),
            }
        });
    }

    fn process_write(self: &Arc<Self>, chunk: T) {
        let controller = self.controller();
        trace!("sink write");
        let written = {
            let mut sink = self.sink.lock();
            match sink.as_mut() {
                Some(sink) => sink.write(chunk, &controller),
                None => hook::done(),
            }
        };
        let this = Arc::clone(self);
        hook::react(async move {
            match written.await {
                Ok(()) => {
                    {
                        let mut core = this.core.lock();
                        if let Some(request) = core.in_flight_write.take() {
                            request.resolve(());
                        }
                        core.in_flight_size = 0.0;
                        if !core.close_queued_or_in_flight() && core.state == State::Writable {
                            let backpressure = core.controller_desired_size() <= 0.0;
                            core.update_backpressure(backpressure);
                        }
                    }
                    this.advance_queue_if_needed();
                }
                Err(e) => {
                    {
                        let mut core = this.core.lock();
                        if core.state == State::Writable {
                            core.algorithms_cleared = true;
                        }
                        if let Some(request) = core.in_flight_write.take() {
                            request.reject(e.clone());
                        }
                        core.in_flight_size = 0.0;
                    }
                    this.release_sink();
                    this.deal_with_rejection(e);
                }
            }
        });
    }

    fn finish_in_flight_close(self: &Arc<Self>) {
        let mut core = self.core.lock();
        if let Some(request) = core.in_flight_close.take() {
            request.resolve(());
        }
        if core.state == State::Erroring {
            core.stored_error = None;
            if let Some(abort) = core.pending_abort.take() {
                abort.resolver.resolve(());
            }
        }
        core.state = State::Closed;
        debug!("writable stream closed");
        if let Some(writer) = core.writer.take() {
            writer.closed_resolver.resolve(());
            debug!(writer = writer.id, "lock freed by close");
        }
    }

    fn finish_in_flight_close_with_error(self: &Arc<Self>, error: StreamError) {
        {
            let mut core = self.core.lock();
            if let Some(request) = core.in_flight_close.take() {
                request.reject(error.clone());
            }
            if let Some(abort) = core.pending_abort.take() {
                abort.resolver.reject(error.clone());
            }
        }
        self.deal_with_rejection(error);
    }
}

/// A writable stream of `T` chunks
///
/// Cloning yields another handle to the same stream.
pub struct WritableStream<T> {
    pub(crate) inner: Arc<WritableInner<T>>,
}

impl<T> Clone for WritableStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for WritableStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("WritableStream")
            .field("state", &core.public_state())
            .field("locked", &core.writer.is_some())
            .field("queued", &core.queue.len())
            .finish()
    }
}

impl<T: Send + 'static> WritableStream<T> {
    /// Create a stream over `sink`, calling its `start` hook immediately
    pub fn new(sink: impl UnderlyingSink<T>, strategy: QueuingStrategy<T>) -> StreamResult<Self> {
        let high_water_mark = strategy.validated_high_water_mark()?;
        Ok(Self::with_validated_strategy(Box::new(sink), strategy, high_water_mark))
    }

    /// Create a stream with the default strategy (highWaterMark 1, size 1)
    pub fn from_sink(sink: impl UnderlyingSink<T>) -> Self {
        Self::with_validated_strategy(Box::new(sink), QueuingStrategy::default(), 1.0)
    }

    pub(crate) fn with_validated_strategy(
        sink: Box<dyn UnderlyingSink<T>>,
        strategy: QueuingStrategy<T>,
        high_water_mark: f64,
    ) -> Self {
        let inner = Arc::new(WritableInner {
            core: Mutex::new(WritableCore {
                state: State::Writable,
                stored_error: None,
                writer: None,
                write_requests: VecDeque::new(),
                in_flight_write: None,
                close_request: None,
                in_flight_close: None,
                pending_abort: None,
                backpressure: high_water_mark <= 0.0,
                queue: SizedQueue::new(),
                in_flight_size: 0.0,
                strategy,
                high_water_mark,
                started: false,
                algorithms_cleared: false,
                abort_controller: AbortController::new(),
            }),
            sink: Mutex::new(Some(sink)),
        });

        let controller = inner.controller();
        let started = {
            let mut sink = inner.sink.lock();
            match sink.as_mut() {
                Some(sink) => sink.start(&controller),
                None => hook::done(),
            }
        };
        let this = Arc::clone(&inner);
        hook::react(async move {
            let result = started.await;
            this.core.lock().started = true;
            match result {
                Ok(()) => this.advance_queue_if_needed(),
                Err(e) => {
                    debug!(error = %e, "underlying sink failed to start");
                    this.deal_with_rejection(e);
                }
            }
        });

        Self { inner }
    }

    pub fn state(&self) -> WritableStreamState {
        self.inner.core.lock().public_state()
    }

    pub fn locked(&self) -> bool {
        self.inner.core.lock().writer.is_some()
    }

    /// The stored error of an erroring or errored stream
    pub fn stored_error(&self) -> Option<StreamError> {
        self.inner.core.lock().stored_error.clone()
    }

    /// Lock the stream to a new writer
    pub fn get_writer(&self) -> StreamResult<WritableStreamDefaultWriter<T>> {
        WritableStreamDefaultWriter::acquire(&self.inner)
    }

    /// Abort an unlocked stream
    pub fn abort(&self, reason: StreamError) -> Promise<()> {
        if self.locked() {
            return Promise::rejected(StreamError::Locked);
        }
        self.inner.abort(reason)
    }

    /// Close an unlocked stream once queued writes are done
    pub fn close(&self) -> Promise<()> {
        if self.locked() {
            return Promise::rejected(StreamError::Locked);
        }
        self.inner.close()
    }

    pub(crate) fn close_queued_or_in_flight(&self) -> bool {
        self.inner.core.lock().close_queued_or_in_flight()
    }
}
