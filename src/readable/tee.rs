//! Teeing: one source, two independently consumed branches

use super::{ReadableStream, ReadableStreamDefaultController, ReadableStreamDefaultReader, UnderlyingSource};
use crate::error::{StreamError, StreamResult};
use crate::hook::{self, HookFuture};
use crate::promise::{Promise, Resolver};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

struct TeeState<T> {
    reader: ReadableStreamDefaultReader<T>,
    reading: bool,
    read_again: bool,
    canceled: [bool; 2],
    reasons: [Option<StreamError>; 2],
    branches: [Option<ReadableStreamDefaultController<T>>; 2],
    cancelled: Resolver<()>,
}

impl<T: Send + 'static> TeeState<T> {
    fn live_branches(&self) -> Vec<ReadableStreamDefaultController<T>> {
        (0..2)
            .filter(|&i| !self.canceled[i])
            .filter_map(|i| self.branches[i].clone())
            .collect()
    }
}

struct TeeBranch<T> {
    state: Arc<Mutex<TeeState<T>>>,
    cancel_promise: Promise<()>,
    index: usize,
}

impl<T: Clone + Send + 'static> TeeBranch<T> {
    /// Read chunks for both branches until no branch asked for another
    async fn pump(state: Arc<Mutex<TeeState<T>>>) {
        loop {
            let request = state.lock().reader.read();
            match request.await {
                Ok(Some(chunk)) => {
                    let branches = state.lock().live_branches();
                    for branch in branches {
                        // A branch that closed or errored on its own just skips the chunk
                        let _ = branch.enqueue(chunk.clone());
                    }
                }
                Ok(None) => {
                    let branches = state.lock().live_branches();
                    for branch in branches {
                        let _ = branch.close();
                    }
                    state.lock().cancelled.resolve(());
                    return;
                }
                Err(e) => {
                    // The closed watcher errors the branches
                    debug!(error = %e, "tee source read failed");
                    return;
                }
            }

            let mut guard = state.lock();
            if guard.read_again {
                guard.read_again = false;
            } else {
                guard.reading = false;
                return;
            }
        }
    }
}

impl<T: Clone + Send + 'static> UnderlyingSource<T> for TeeBranch<T> {
    fn start(&mut self, controller: &ReadableStreamDefaultController<T>) -> HookFuture {
        self.state.lock().branches[self.index] = Some(controller.clone());
        hook::done()
    }

    fn pull(&mut self, _controller: &ReadableStreamDefaultController<T>) -> HookFuture {
        {
            let mut state = self.state.lock();
            if state.reading {
                state.read_again = true;
                return hook::done();
            }
            state.reading = true;
        }
        Self::pump(Arc::clone(&self.state)).map(Ok).boxed()
    }

    fn cancel(&mut self, reason: StreamError) -> HookFuture {
        let source_cancelled = {
            let mut state = self.state.lock();
            state.canceled[self.index] = true;
            state.reasons[self.index] = Some(reason);
            if state.canceled.iter().all(|&c| c) {
                let reasons = state.reasons.iter().flatten().cloned().collect();
                debug!("both tee branches cancelled; cancelling source");
                Some((state.reader.cancel(StreamError::Multiple(reasons)), state.cancelled.clone()))
            } else {
                None
            }
        };
        if let Some((cancelled, resolver)) = source_cancelled {
            hook::react(async move {
                resolver.settle_with(cancelled.await);
            });
        }
        let cancel_promise = self.cancel_promise.clone();
        async move { cancel_promise.await }.boxed()
    }
}

impl<T: Clone + Send + 'static> ReadableStream<T> {
    /// Split into two branches that each see every chunk
    ///
    /// The source stays locked until it closes or errors, and is only
    /// cancelled once both branches are cancelled.
    pub fn tee(&self) -> StreamResult<(ReadableStream<T>, ReadableStream<T>)> {
        let reader = self.get_reader()?;
        let source_closed = reader.closed();
        let (cancel_promise, cancelled) = Promise::new();
        let state = Arc::new(Mutex::new(TeeState {
            reader,
            reading: false,
            read_again: false,
            canceled: [false; 2],
            reasons: [None, None],
            branches: [None, None],
            cancelled,
        }));

        let branch = |index| {
            ReadableStream::from_source(TeeBranch {
                state: Arc::clone(&state),
                cancel_promise: cancel_promise.clone(),
                index,
            })
        };
        let branches = (branch(0), branch(1));

        let watched = Arc::downgrade(&state);
        hook::react(async move {
            if let Err(error) = source_closed.await {
                let Some(state) = watched.upgrade() else {
                    return;
                };
                let state = state.lock();
                for branch in state.branches.iter().flatten() {
                    branch.error(error.clone());
                }
                state.cancelled.resolve(());
            }
        });

        Ok(branches)
    }
}
