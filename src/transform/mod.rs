//! TransformStream: a writable input side bridged to a readable output side
//!
//! Writes reach the transformer only while the readable side wants data.
//! The bridge keeps one backpressure flag plus a promise that settles on its
//! next flip; a write arriving under backpressure waits on that promise.

use crate::error::{StreamError, StreamResult};
use crate::hook::{self, HookFuture};
use crate::promise::{Promise, Resolver};
use crate::readable::{ReadableStream, ReadableStreamDefaultController, UnderlyingSource};
use crate::strategy::QueuingStrategy;
use crate::writable::{UnderlyingSink, WritableStream, WritableStreamDefaultController};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::{fmt, marker::PhantomData, sync::Arc};
use tracing::{debug, trace};

/// Turns `I` chunks written to the writable side into `O` chunks on the
/// readable side
pub trait Transformer<I, O>: Send + 'static {
    fn start(&mut self, _controller: &TransformStreamDefaultController<O>) -> HookFuture {
        hook::done()
    }

    fn transform(&mut self, chunk: I, controller: &TransformStreamDefaultController<O>) -> HookFuture;

    /// Called once the writable side closes, before the readable side closes
    fn flush(&mut self, _controller: &TransformStreamDefaultController<O>) -> HookFuture {
        hook::done()
    }
}

/// Passes every chunk through unchanged
pub struct IdentityTransformer<T>(PhantomData<fn(T) -> T>);

impl<T> Default for IdentityTransformer<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T: Send + 'static> Transformer<T, T> for IdentityTransformer<T> {
    fn transform(&mut self, chunk: T, controller: &TransformStreamDefaultController<T>) -> HookFuture {
        match controller.enqueue(chunk) {
            Ok(()) => hook::done(),
            Err(e) => hook::fail(e),
        }
    }
}

struct Backpressure {
    flag: Option<bool>,
    change: Promise<()>,
    resolver: Option<Resolver<()>>,
}

type ErrorWritable = Arc<dyn Fn(StreamError) + Send + Sync>;

/// State both sides of one transform stream share
struct Bridge<O> {
    backpressure: Mutex<Backpressure>,
    readable: Mutex<Option<ReadableStreamDefaultController<O>>>,
    writable: Mutex<Option<ErrorWritable>>,
}

impl<O: Send + 'static> Bridge<O> {
    fn new() -> Self {
        let bridge = Self {
            backpressure: Mutex::new(Backpressure {
                flag: None,
                change: Promise::resolved(()),
                resolver: None,
            }),
            readable: Mutex::new(None),
            writable: Mutex::new(None),
        };
        bridge.set_backpressure(true);
        bridge
    }

    fn readable(&self) -> Option<ReadableStreamDefaultController<O>> {
        self.readable.lock().clone()
    }

    /// Flip the flag, settling the old change promise and installing a new one
    fn set_backpressure(&self, backpressure: bool) {
        let previous = {
            let mut state = self.backpressure.lock();
            let (change, resolver) = Promise::new();
            state.flag = Some(backpressure);
            state.change = change;
            state.resolver.replace(resolver)
        };
        trace!(backpressure, "transform backpressure changed");
        if let Some(previous) = previous {
            previous.resolve(());
        }
    }

    /// The change promise to wait on, if writes are currently blocked
    fn blocked_on(&self) -> Option<Promise<()>> {
        let state = self.backpressure.lock();
        (state.flag == Some(true)).then(|| state.change.clone())
    }

    fn change_promise(&self) -> Promise<()> {
        self.backpressure.lock().change.clone()
    }

    /// Error both sides
    fn error(&self, error: StreamError) {
        if let Some(readable) = self.readable() {
            readable.error(error.clone());
        }
        self.error_writable_and_unblock_write(error);
    }

    fn error_writable_and_unblock_write(&self, error: StreamError) {
        debug!(%error, "transform stream erroring writable side");
        let error_writable = self.writable.lock().clone();
        if let Some(error_writable) = error_writable {
            error_writable(error);
        }
        if self.backpressure.lock().flag == Some(true) {
            self.set_backpressure(false);
        }
    }
}

/// Handle given to a [`Transformer`] for producing output
pub struct TransformStreamDefaultController<O> {
    bridge: Arc<Bridge<O>>,
}

impl<O> Clone for TransformStreamDefaultController<O> {
    fn clone(&self) -> Self {
        Self {
            bridge: Arc::clone(&self.bridge),
        }
    }
}

impl<O> fmt::Debug for TransformStreamDefaultController<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformStreamDefaultController")
            .finish_non_exhaustive()
    }
}

impl<O: Send + 'static> TransformStreamDefaultController<O> {
    /// Desired size of the readable side
    pub fn desired_size(&self) -> Option<f64> {
        self.bridge.readable().and_then(|r| r.desired_size())
    }

    /// Push a chunk to the readable side
    ///
    /// Fails if the readable side no longer accepts chunks. A failing size
    /// algorithm errors the writable side too.
    pub fn enqueue(&self, chunk: O) -> StreamResult<()> {
        let readable = self.bridge.readable().ok_or(StreamError::Detached)?;
        if let Err(e) = readable.enqueue(chunk) {
            if let Some(stored) = readable.stored_error() {
                self.bridge.error_writable_and_unblock_write(stored.clone());
                return Err(stored);
            }
            return Err(e);
        }
        let backpressure = readable.has_backpressure();
        if backpressure && self.bridge.backpressure.lock().flag != Some(true) {
            self.bridge.set_backpressure(true);
        }
        Ok(())
    }

    /// Error both sides
    pub fn error(&self, error: StreamError) {
        self.bridge.error(error);
    }

    /// Close the readable side and error the writable side
    pub fn terminate(&self) {
        debug!("transform stream terminated");
        if let Some(readable) = self.bridge.readable() {
            // Already closed or errored is fine here
            let _ = readable.close();
        }
        self.bridge
            .error_writable_and_unblock_write(StreamError::TransformTerminated);
    }
}

struct TransformSink<I, O> {
    bridge: Arc<Bridge<O>>,
    transformer: Arc<Mutex<Box<dyn Transformer<I, O>>>>,
    controller: TransformStreamDefaultController<O>,
    started: Resolver<()>,
}

impl<I: Send + 'static, O: Send + 'static> TransformSink<I, O> {
    fn perform_transform(
        bridge: Arc<Bridge<O>>,
        transformer: Arc<Mutex<Box<dyn Transformer<I, O>>>>,
        controller: TransformStreamDefaultController<O>,
        chunk: I,
    ) -> HookFuture {
        let transformed = transformer.lock().transform(chunk, &controller);
        async move {
            if let Err(e) = transformed.await {
                bridge.error(e.clone());
                return Err(e);
            }
            Ok(())
        }
        .boxed()
    }
}

impl<I: Send + 'static, O: Send + 'static> UnderlyingSink<I> for TransformSink<I, O> {
    fn start(&mut self, controller: &WritableStreamDefaultController<I>) -> HookFuture {
        let writable = controller.clone();
        *self.bridge.writable.lock() = Some(Arc::new(move |error| writable.error(error)));

        let started = self.transformer.lock().start(&self.controller);
        let resolver = self.started.clone();
        async move {
            let result = started.await;
            resolver.settle_with(result.clone());
            result
        }
        .boxed()
    }

    fn write(&mut self, chunk: I, controller: &WritableStreamDefaultController<I>) -> HookFuture {
        let bridge = Arc::clone(&self.bridge);
        let transformer = Arc::clone(&self.transformer);
        let transform_controller = self.controller.clone();
        let Some(change) = self.bridge.blocked_on() else {
            return Self::perform_transform(bridge, transformer, transform_controller, chunk);
        };

        trace!("transform write waiting for readable demand");
        let writable = controller.clone();
        async move {
            change.await?;
            if let Some(error) = writable.erroring_error() {
                return Err(error);
            }
            Self::perform_transform(bridge, transformer, transform_controller, chunk).await
        }
        .boxed()
    }

    fn close(&mut self) -> HookFuture {
        let flushed = self.transformer.lock().flush(&self.controller);
        let bridge = Arc::clone(&self.bridge);
        async move {
            if let Err(e) = flushed.await {
                bridge.error(e.clone());
                return Err(e);
            }
            let Some(readable) = bridge.readable() else {
                return Ok(());
            };
            if let Some(error) = readable.stored_error() {
                return Err(error);
            }
            // Terminated from inside flush: nothing left to close
            let _ = readable.close();
            Ok(())
        }
        .boxed()
    }

    fn abort(&mut self, reason: StreamError) -> HookFuture {
        self.bridge.error(reason);
        hook::done()
    }
}

struct TransformSource<O> {
    bridge: Arc<Bridge<O>>,
    started: Promise<()>,
}

impl<O: Send + 'static> UnderlyingSource<O> for TransformSource<O> {
    fn start(&mut self, controller: &ReadableStreamDefaultController<O>) -> HookFuture {
        *self.bridge.readable.lock() = Some(controller.clone());
        let started = self.started.clone();
        async move { started.await }.boxed()
    }

    fn pull(&mut self, _controller: &ReadableStreamDefaultController<O>) -> HookFuture {
        self.bridge.set_backpressure(false);
        let change = self.bridge.change_promise();
        async move { change.await }.boxed()
    }

    fn cancel(&mut self, reason: StreamError) -> HookFuture {
        self.bridge.error_writable_and_unblock_write(reason);
        hook::done()
    }
}

/// A writable side of `I` chunks feeding a readable side of `O` chunks
pub struct TransformStream<I, O> {
    readable: ReadableStream<O>,
    writable: WritableStream<I>,
}

impl<I, O> Clone for TransformStream<I, O> {
    fn clone(&self) -> Self {
        Self {
            readable: self.readable.clone(),
            writable: self.writable.clone(),
        }
    }
}

impl<I, O> fmt::Debug for TransformStream<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformStream")
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .finish()
    }
}

impl<I: Send + 'static, O: Send + 'static> TransformStream<I, O> {
    pub fn new(
        transformer: impl Transformer<I, O>,
        writable_strategy: QueuingStrategy<I>,
        readable_strategy: QueuingStrategy<O>,
    ) -> StreamResult<Self> {
        let writable_high_water_mark = writable_strategy.validated_high_water_mark()?;
        let readable_high_water_mark = readable_strategy.validated_high_water_mark()?;
        Ok(Self::bridge(
            Box::new(transformer),
            (writable_strategy, writable_high_water_mark),
            (readable_strategy, readable_high_water_mark),
        ))
    }

    /// Default strategies: writable highWaterMark 1, readable highWaterMark 0
    pub fn from_transformer(transformer: impl Transformer<I, O>) -> Self {
        Self::bridge(
            Box::new(transformer),
            (QueuingStrategy::default(), 1.0),
            (QueuingStrategy::new(0.0), 0.0),
        )
    }

    fn bridge(
        transformer: Box<dyn Transformer<I, O>>,
        (writable_strategy, writable_high_water_mark): (QueuingStrategy<I>, f64),
        (readable_strategy, readable_high_water_mark): (QueuingStrategy<O>, f64),
    ) -> Self {
        let bridge = Arc::new(Bridge::new());
        let (started, started_resolver) = Promise::new();
        // The readable side comes first so the transformer's start can enqueue
        let readable = ReadableStream::with_validated_strategy(
            Box::new(TransformSource {
                bridge: Arc::clone(&bridge),
                started,
            }),
            readable_strategy,
            readable_high_water_mark,
        );
        let writable = WritableStream::with_validated_strategy(
            Box::new(TransformSink {
                bridge: Arc::clone(&bridge),
                transformer: Arc::new(Mutex::new(transformer)),
                controller: TransformStreamDefaultController { bridge },
                started: started_resolver,
            }),
            writable_strategy,
            writable_high_water_mark,
        );
        Self { readable, writable }
    }

    pub fn readable(&self) -> &ReadableStream<O> {
        &self.readable
    }

    pub fn writable(&self) -> &WritableStream<I> {
        &self.writable
    }
}

impl<T: Send + 'static> TransformStream<T, T> {
    /// A pass-through transform stream
    pub fn identity() -> Self {
        Self::from_transformer(IdentityTransformer::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readable::ReadableStreamState;
    use crate::writable::WritableStreamState;

    struct Doubler;

    impl Transformer<u32, String> for Doubler {
        fn transform(&mut self, chunk: u32, controller: &TransformStreamDefaultController<String>) -> HookFuture {
            let result = controller
                .enqueue(chunk.to_string())
                .and_then(|()| controller.enqueue(chunk.to_string()));
            match result {
                Ok(()) => hook::done(),
                Err(e) => hook::fail(e),
            }
        }

        fn flush(&mut self, controller: &TransformStreamDefaultController<String>) -> HookFuture {
            match controller.enqueue("end".to_string()) {
                Ok(()) => hook::done(),
                Err(e) => hook::fail(e),
            }
        }
    }

    async fn settle() {
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_transform_and_flush() {
        let transform = TransformStream::new(
            Doubler,
            QueuingStrategy::new(1.0),
            QueuingStrategy::new(16.0),
        )
        .unwrap();
        let writer = transform.writable().get_writer().unwrap();
        let _ = writer.write(1);
        let _ = writer.write(2);
        let closed = writer.close();

        let output = transform.readable().collect().await.unwrap();
        assert_eq!(output, vec!["1", "1", "2", "2", "end"]);
        assert_eq!(closed.await, Ok(()));
    }

    #[tokio::test]
    async fn test_write_waits_for_readable_demand() {
        let transform = TransformStream::<u32, u32>::new(
            IdentityTransformer::default(),
            QueuingStrategy::new(1.0),
            QueuingStrategy::new(2.0),
        )
        .unwrap();
        let writer = transform.writable().get_writer().unwrap();
        let reader = transform.readable().get_reader().unwrap();

        let first = writer.write(1);
        let second = writer.write(2);
        let third = writer.write(3);
        settle().await;
        assert!(first.is_fulfilled());
        assert!(second.is_fulfilled());
        assert!(third.is_pending());

        assert_eq!(reader.read().await, Ok(Some(1)));
        assert_eq!(third.await, Ok(()));
        assert_eq!(reader.read().await, Ok(Some(2)));
        assert_eq!(reader.read().await, Ok(Some(3)));
    }

    #[tokio::test]
    async fn test_identity_blocks_until_read() {
        let transform = TransformStream::<u32, u32>::identity();
        let writer = transform.writable().get_writer().unwrap();
        let written = writer.write(7);
        settle().await;
        assert!(written.is_pending());

        let reader = transform.readable().get_reader().unwrap();
        assert_eq!(reader.read().await, Ok(Some(7)));
        assert_eq!(written.await, Ok(()));
    }

    #[tokio::test]
    async fn test_transform_error_errors_both_sides() {
        struct Failing;
        impl Transformer<u32, u32> for Failing {
            fn transform(&mut self, _: u32, _: &TransformStreamDefaultController<u32>) -> HookFuture {
                hook::fail("bad chunk")
            }
        }

        let transform = TransformStream::from_transformer(Failing);
        let writer = transform.writable().get_writer().unwrap();
        let reader = transform.readable().get_reader().unwrap();
        let read = reader.read();

        assert_eq!(writer.write(1).await, Err(StreamError::custom("bad chunk")));
        assert_eq!(read.await, Err(StreamError::custom("bad chunk")));
        assert_eq!(writer.closed().await, Err(StreamError::custom("bad chunk")));
        assert_eq!(transform.readable().state(), ReadableStreamState::Errored);
    }

    #[tokio::test]
    async fn test_readable_cancel_errors_writable() {
        let transform = TransformStream::<u32, u32>::identity();
        let writer = transform.writable().get_writer().unwrap();
        let blocked = writer.write(1);
        settle().await;

        transform
            .readable()
            .cancel(StreamError::custom("not interested"))
            .await
            .unwrap();
        assert_eq!(blocked.await, Err(StreamError::custom("not interested")));
        assert_eq!(transform.writable().state(), WritableStreamState::Errored);
    }

    #[tokio::test]
    async fn test_writable_abort_errors_readable() {
        let transform = TransformStream::<u32, u32>::identity();
        let reader = transform.readable().get_reader().unwrap();
        transform
            .writable()
            .abort(StreamError::custom("stop"))
            .await
            .unwrap();
        assert_eq!(reader.read().await, Err(StreamError::custom("stop")));
    }

    #[tokio::test]
    async fn test_terminate() {
        struct FirstOnly;
        impl Transformer<u32, u32> for FirstOnly {
            fn transform(&mut self, chunk: u32, controller: &TransformStreamDefaultController<u32>) -> HookFuture {
                let _ = controller.enqueue(chunk);
                controller.terminate();
                hook::done()
            }
        }

        let transform = TransformStream::new(
            FirstOnly,
            QueuingStrategy::new(1.0),
            QueuingStrategy::new(4.0),
        )
        .unwrap();
        let writer = transform.writable().get_writer().unwrap();
        let _ = writer.write(1);
        assert_eq!(transform.readable().collect().await, Ok(vec![1]));
        assert_eq!(writer.closed().await, Err(StreamError::TransformTerminated));
        assert_eq!(writer.write(2).await, Err(StreamError::TransformTerminated));
    }

    #[tokio::test]
    async fn test_failed_flush_errors_both_sides() {
        struct FailingFlush;
        impl Transformer<u32, u32> for FailingFlush {
            fn transform(&mut self, chunk: u32, controller: &TransformStreamDefaultController<u32>) -> HookFuture {
                match controller.enqueue(chunk) {
                    Ok(()) => hook::done(),
                    Err(e) => hook::fail(e),
                }
            }

            fn flush(&mut self, _: &TransformStreamDefaultController<u32>) -> HookFuture {
                hook::fail("flush failed")
            }
        }

        let transform = TransformStream::from_transformer(FailingFlush);
        let writer = transform.writable().get_writer().unwrap();
        let reader = transform.readable().get_reader().unwrap();
        let error = StreamError::custom("flush failed");

        assert_eq!(writer.close().await, Err(error.clone()));
        assert_eq!(writer.closed().await, Err(error.clone()));
        assert_eq!(reader.closed().await, Err(error.clone()));
        assert_eq!(reader.read().await, Err(error.clone()));
        assert_eq!(transform.writable().state(), WritableStreamState::Errored);
        assert_eq!(transform.writable().stored_error(), Some(error.clone()));
        assert_eq!(transform.readable().stored_error(), Some(error));
    }

    #[tokio::test]
    async fn test_terminate_during_flush() {
        struct TailThenStop;
        impl Transformer<u32, u32> for TailThenStop {
            fn transform(&mut self, chunk: u32, controller: &TransformStreamDefaultController<u32>) -> HookFuture {
                match controller.enqueue(chunk) {
                    Ok(()) => hook::done(),
                    Err(e) => hook::fail(e),
                }
            }

            fn flush(&mut self, controller: &TransformStreamDefaultController<u32>) -> HookFuture {
                let _ = controller.enqueue(99);
                controller.terminate();
                hook::done()
            }
        }

        let transform = TransformStream::new(
            TailThenStop,
            QueuingStrategy::new(1.0),
            QueuingStrategy::new(4.0),
        )
        .unwrap();
        let writer = transform.writable().get_writer().unwrap();
        let _ = writer.write(1);

        // The close already in flight wins over the terminate error
        assert_eq!(writer.close().await, Ok(()));
        assert_eq!(writer.closed().await, Ok(()));
        assert_eq!(transform.writable().state(), WritableStreamState::Closed);
        assert_eq!(transform.writable().stored_error(), None);
        assert_eq!(transform.readable().collect().await, Ok(vec![1, 99]));
        assert_eq!(transform.readable().state(), ReadableStreamState::Closed);
    }

    #[test]
    fn test_invalid_strategy() {
        let result = TransformStream::<u32, u32>::new(
            IdentityTransformer::default(),
            QueuingStrategy::new(-1.0),
            QueuingStrategy::new(0.0),
        );
        assert!(matches!(result, Err(StreamError::InvalidHighWaterMark(_))));
    }
}
