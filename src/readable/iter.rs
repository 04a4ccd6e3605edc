//! Async iteration over a readable stream

use super::{ReadableStream, ReadableStreamDefaultReader};
use crate::error::{StreamError, StreamResult};
use crate::promise::{Promise, Request};
use futures_util::Stream;
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// Options for [`ReadableStream::values`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ValuesOptions {
    /// Leave the stream uncancelled when iteration stops early
    pub prevent_cancel: bool,
}

/// A `futures` stream of chunks that holds the reader lock while iterating
///
/// Iteration ends when the stream closes, yielding a final error item if it
/// errors. Either way the lock is released. Dropping the iterator early
/// cancels the stream unless `prevent_cancel` was set.
pub struct Values<T: Send + 'static> {
    reader: Option<ReadableStreamDefaultReader<T>>,
    pending: Option<Request<Option<T>>>,
    prevent_cancel: bool,
}

impl<T: Send + 'static> Values<T> {
    /// Stop iterating: cancel the stream (unless `prevent_cancel`) and unlock it
    pub fn cancel(mut self, reason: StreamError) -> Promise<()> {
        self.finish(reason)
    }

    fn finish(&mut self, reason: StreamError) -> Promise<()> {
        self.pending = None;
        match self.reader.take() {
            Some(reader) if !self.prevent_cancel => reader.cancel(reason),
            _ => Promise::resolved(()),
        }
    }
}

impl<T: Send + 'static> Stream for Values<T> {
    type Item = StreamResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        let Some(reader) = this.reader.as_ref() else {
            return Poll::Ready(None);
        };
        let pending = this.pending.get_or_insert_with(|| reader.read());
        let result = match Pin::new(pending).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result,
        };
        this.pending = None;
        match result {
            Ok(Some(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Ok(None) => {
                this.reader = None;
                Poll::Ready(None)
            }
            Err(e) => {
                this.reader = None;
                Poll::Ready(Some(Err(e)))
            }
        }
    }
}

impl<T: Send + 'static> Drop for Values<T> {
    fn drop(&mut self) {
        if self.reader.is_some() {
            drop(self.finish(StreamError::Aborted));
        }
    }
}

impl<T: Send + 'static> ReadableStream<T> {
    /// Iterate over the chunks; locks the stream until iteration ends
    pub fn values(&self, options: ValuesOptions) -> StreamResult<Values<T>> {
        Ok(Values {
            reader: Some(self.get_reader()?),
            pending: None,
            prevent_cancel: options.prevent_cancel,
        })
    }

    /// [`values`](Self::values) with default options
    pub fn into_stream(self) -> StreamResult<Values<T>> {
        self.values(ValuesOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readable::ReadableStreamState;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_iterates_until_close() {
        let stream: ReadableStream<u8> = vec![4, 5, 6].into_iter().collect();
        let chunks: Vec<_> = stream.clone().into_stream().unwrap().collect().await;
        assert_eq!(chunks, vec![Ok(4), Ok(5), Ok(6)]);
        assert!(!stream.locked());
    }

    #[tokio::test]
    async fn test_early_drop_cancels() {
        let stream: ReadableStream<u8> = vec![1, 2, 3].into_iter().collect();
        {
            let mut values = stream.values(ValuesOptions::default()).unwrap();
            assert_eq!(values.next().await, Some(Ok(1)));
        }
        assert!(!stream.locked());
        assert_eq!(stream.state(), ReadableStreamState::Closed);
        assert_eq!(stream.get_reader().unwrap().read().await, Ok(None));
    }

    #[tokio::test]
    async fn test_prevent_cancel_keeps_remaining_chunks() {
        let stream: ReadableStream<u8> = vec![1, 2, 3].into_iter().collect();
        let mut values = stream
            .values(ValuesOptions {
                prevent_cancel: true,
            })
            .unwrap();
        assert_eq!(values.next().await, Some(Ok(1)));
        values.cancel(StreamError::Aborted).await.unwrap();

        assert_eq!(stream.collect().await, Ok(vec![2, 3]));
    }

    #[tokio::test]
    async fn test_error_ends_iteration() {
        let stream = ReadableStream::<u8>::from_source(());
        let controller = stream.inner.controller();
        controller.enqueue(1).unwrap();
        controller.error(StreamError::custom("broken"));

        let mut values = stream.values(ValuesOptions::default()).unwrap();
        assert_eq!(values.next().await, Some(Err(StreamError::custom("broken"))));
        assert_eq!(values.next().await, None);
        assert!(!stream.locked());
    }
}
