//! Piping a readable stream into a writable stream
//!
//! The pipe locks both ends, then repeats: wait for `ready`, read one chunk,
//! write it and wait for the write. Only one write is ever outstanding.
//! Whatever ends the loop (abort signal, an error on either side, the source
//! closing or the destination already closing) is turned into one shutdown
//! action, after which both locks are released and the pipe settles.

use crate::error::{StreamError, StreamResult};
use crate::hook;
use crate::promise::Promise;
use crate::readable::{ReadableStream, ReadableStreamDefaultReader, ReadableStreamState};
use crate::signal::AbortSignal;
use crate::writable::{WritableStream, WritableStreamDefaultWriter, WritableStreamState};
use std::{convert::Infallible, future::Future};
use tracing::{debug, trace};

/// Options for [`ReadableStream::pipe_to`]
#[derive(Debug, Clone, Default)]
pub struct PipeOptions {
    /// Leave the destination open when the source closes
    pub prevent_close: bool,
    /// Do not abort the destination when the source errors
    pub prevent_abort: bool,
    /// Do not cancel the source when the destination errors or closes
    pub prevent_cancel: bool,
    /// Stops the pipe when fired
    pub signal: Option<AbortSignal>,
}

impl PipeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prevent_close(mut self, prevent_close: bool) -> Self {
        self.prevent_close = prevent_close;
        self
    }

    pub fn prevent_abort(mut self, prevent_abort: bool) -> Self {
        self.prevent_abort = prevent_abort;
        self
    }

    pub fn prevent_cancel(mut self, prevent_cancel: bool) -> Self {
        self.prevent_cancel = prevent_cancel;
        self
    }

    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Why the pipe stopped
#[derive(Debug)]
enum Event {
    Aborted(StreamError),
    SourceErrored(StreamError),
    DestErrored(StreamError),
    SourceClosed,
    DestClosing,
}

struct Pipe<T> {
    source: ReadableStream<T>,
    dest: WritableStream<T>,
    reader: ReadableStreamDefaultReader<T>,
    writer: WritableStreamDefaultWriter<T>,
    options: PipeOptions,
    pending_write: Option<Promise<()>>,
}

async fn rejection(promise: Promise<()>) -> StreamError {
    match promise.await {
        Err(error) => error,
        Ok(()) => std::future::pending().await,
    }
}

async fn fired(signal: Option<Promise<StreamError>>) -> StreamError {
    match signal {
        Some(fired) => match fired.await {
            Ok(reason) | Err(reason) => reason,
        },
        None => std::future::pending().await,
    }
}

impl<T: Send + 'static> Pipe<T> {
    async fn run(mut self) -> StreamResult<()> {
        let event = match self.initial_event() {
            Some(event) => event,
            None => self.pump().await,
        };
        debug!(?event, "pipe shutting down");
        self.shut_down(event).await
    }

    fn dest_closing(&self) -> bool {
        self.dest.close_queued_or_in_flight() || self.dest.state() == WritableStreamState::Closed
    }

    /// Conditions that hold before a single chunk moves
    fn initial_event(&self) -> Option<Event> {
        if let Some(reason) = self.options.signal.as_ref().and_then(AbortSignal::reason) {
            return Some(Event::Aborted(reason));
        }
        let source_closed = self.reader.closed();
        if let Some(error) = source_closed.error() {
            return Some(Event::SourceErrored(error));
        }
        if let Some(error) = self.writer.closed().error() {
            return Some(Event::DestErrored(error));
        }
        if source_closed.is_fulfilled() {
            return Some(Event::SourceClosed);
        }
        if self.dest_closing() {
            return Some(Event::DestClosing);
        }
        None
    }

    /// Run `work` unless something ends the pipe first
    ///
    /// Errors are checked before the work itself so a failed stream always
    /// wins over a chunk that became available at the same time.
    async fn until<F: Future>(&self, work: F) -> Result<F::Output, Event> {
        let signal = self.options.signal.as_ref().map(AbortSignal::aborted);
        tokio::select! {
            biased;
            reason = fired(signal) => Err(Event::Aborted(reason)),
            error = rejection(self.reader.closed()) => Err(Event::SourceErrored(error)),
            error = rejection(self.writer.closed()) => Err(Event::DestErrored(error)),
            output = work => Ok(output),
        }
    }

    /// Wait for whatever ends the pipe
    async fn next_event(&self) -> Event {
        match self.until(std::future::pending::<Infallible>()).await {
            Err(event) => event,
            Ok(never) => match never {},
        }
    }

    async fn pump(&mut self) -> Event {
        loop {
            if self.dest_closing() {
                return Event::DestClosing;
            }

            match self.until(self.writer.ready()).await {
                Err(event) => return event,
                // The destination is erroring; its closed promise reports why
                Ok(Err(_)) => return self.next_event().await,
                Ok(Ok(())) => {}
            }

            let chunk = match self.until(self.reader.read()).await {
                Err(event) => return event,
                Ok(Ok(Some(chunk))) => chunk,
                Ok(Ok(None)) => return Event::SourceClosed,
                Ok(Err(error)) => return Event::SourceErrored(error),
            };

            trace!("pipe forwarding chunk");
            let written = self.writer.write(chunk);
            self.pending_write = Some(written.clone());
            match self.until(written).await {
                Err(event) => return event,
                Ok(Err(_)) => return self.next_event().await,
                Ok(Ok(())) => self.pending_write = None,
            }
        }
    }

    async fn shut_down(mut self, event: Event) -> StreamResult<()> {
        // Chunks already read still reach a destination that can take them
        if self.dest.state() == WritableStreamState::Writable {
            if let Some(write) = self.pending_write.take() {
                let _ = write.await;
            }
        }

        let PipeOptions {
            prevent_close,
            prevent_abort,
            prevent_cancel,
            ..
        } = self.options;
        let mut actions = Vec::new();
        let outcome = match event {
            Event::Aborted(reason) => {
                let dest_state = self.dest.state();
                if !prevent_abort
                    && matches!(dest_state, WritableStreamState::Writable | WritableStreamState::Closing)
                {
                    actions.push(self.writer.abort(reason.clone()));
                }
                if !prevent_cancel && self.source.state() == ReadableStreamState::Readable {
                    actions.push(self.reader.cancel(reason.clone()));
                }
                Err(reason)
            }
            Event::SourceErrored(error) => {
                if !prevent_abort {
                    actions.push(self.writer.abort(error.clone()));
                }
                Err(error)
            }
            Event::DestErrored(error) => {
                if !prevent_cancel {
                    actions.push(self.reader.cancel(error.clone()));
                }
                Err(error)
            }
            Event::SourceClosed => {
                if !prevent_close {
                    actions.push(self.writer.close_with_error_propagation());
                }
                Ok(())
            }
            Event::DestClosing => {
                let error = StreamError::ClosingPropagatedBackward;
                if !prevent_cancel {
                    actions.push(self.reader.cancel(error.clone()));
                }
                Err(error)
            }
        };

        let mut failed = None;
        for action in actions {
            if let Err(error) = action.await {
                debug!(%error, "pipe shutdown action failed");
                failed.get_or_insert(error);
            }
        }
        match (outcome, failed) {
            // A destination that fails to close reports its own error
            (Ok(()), Some(error)) => Err(error),
            (outcome, _) => outcome,
        }
    }
}

/// Pipe `source` into `dest`
///
/// Both streams must be unlocked. The returned promise settles after both
/// locks have been released: fulfilled when every chunk was written and the
/// destination closed (or `prevent_close` was set), rejected otherwise.
pub fn pipe_to<T: Send + 'static>(
    source: &ReadableStream<T>,
    dest: &WritableStream<T>,
    options: PipeOptions,
) -> Promise<()> {
    if source.locked() || dest.locked() {
        return Promise::rejected(StreamError::Locked);
    }
    let reader = match source.get_reader() {
        Ok(reader) => reader,
        Err(error) => return Promise::rejected(error),
    };
    let writer = match dest.get_writer() {
        Ok(writer) => writer,
        Err(error) => return Promise::rejected(error),
    };
    source.inner.mark_disturbed();
    debug!("pipe started");

    let pipe = Pipe {
        source: source.clone(),
        dest: dest.clone(),
        reader,
        writer,
        options,
        pending_write: None,
    };
    let (promise, resolver) = Promise::new();
    hook::react(async move {
        // Dropping the pipe releases both locks before anyone sees the result
        let result = pipe.run().await;
        resolver.settle_with(result);
    });
    promise
}
