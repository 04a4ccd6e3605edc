//! Hook futures and promise reactions
//!
//! Underlying sources, sinks and transformers answer every hook with a
//! [`HookFuture`]. A hook that fails synchronously returns an already-failed
//! future, so both failure modes take the same path.

use crate::error::{StreamError, StreamResult};
use futures_util::future::{self, BoxFuture, FutureExt};
use std::future::Future;

/// Outcome of an underlying source/sink/transformer hook
pub type HookFuture = BoxFuture<'static, StreamResult<()>>;

/// A hook that completed successfully
pub fn done() -> HookFuture {
    future::ready(Ok(())).boxed()
}

/// A hook that failed
pub fn fail(error: impl Into<StreamError>) -> HookFuture {
    future::ready(Err(error.into())).boxed()
}

/// Schedule a continuation on the current Tokio runtime
///
/// Without a runtime the continuation is polled once in place; anything it
/// still waits on is dropped.
pub(crate) fn react<F>(continuation: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(continuation);
        }
        Err(_) => {
            if continuation.now_or_never().is_none() {
                tracing::warn!("stream reaction dropped: no Tokio runtime available");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_done_and_fail() {
        assert_eq!(done().await, Ok(()));
        assert_eq!(fail("nope").await, Err(StreamError::custom("nope")));
    }

    #[tokio::test]
    async fn test_react_runs_on_runtime() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        react(async move {
            let _ = tx.send(5);
        });
        assert_eq!(rx.await.unwrap(), 5);
    }

    #[test]
    fn test_react_without_runtime_polls_once() {
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        react(async move {
            let _ = tx.send(1);
        });
        assert_eq!(rx.try_recv().unwrap(), 1);
    }
}
