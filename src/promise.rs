//! Eager promise handles
//!
//! Every stream operation registers its effect when called and hands back a
//! handle that settles later. Two flavours exist:
//! - [`Promise`] is shared: it can be cloned, awaited by many parties and
//!   inspected without awaiting. Used for `closed`, `ready`, writes and pipes.
//! - [`Request`] is single-consumer, so read results do not require `Clone`.

use crate::error::{StreamError, StreamResult};
use parking_lot::Mutex;
use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
};
use tokio::sync::oneshot;

enum Slot<T> {
    Pending(Vec<Waker>),
    Fulfilled(T),
    Rejected(StreamError),
}

/// A settle-once value shared between a [`Resolver`] and any number of waiters
pub struct Promise<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

/// The settling side of a [`Promise`]
pub struct Resolver<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T> Promise<T> {
    /// Create a pending promise and its resolver
    pub fn new() -> (Promise<T>, Resolver<T>) {
        let slot = Arc::new(Mutex::new(Slot::Pending(Vec::new())));
        (
            Promise {
                slot: Arc::clone(&slot),
            },
            Resolver { slot },
        )
    }

    pub fn resolved(value: T) -> Self {
        Promise {
            slot: Arc::new(Mutex::new(Slot::Fulfilled(value))),
        }
    }

    pub fn rejected(error: StreamError) -> Self {
        Promise {
            slot: Arc::new(Mutex::new(Slot::Rejected(error))),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.slot.lock(), Slot::Pending(_))
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(*self.slot.lock(), Slot::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(*self.slot.lock(), Slot::Rejected(_))
    }

    /// The rejection reason, if the promise was rejected
    pub fn error(&self) -> Option<StreamError> {
        match &*self.slot.lock() {
            Slot::Rejected(e) => Some(e.clone()),
            _ => None,
        }
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.slot.lock() {
            Slot::Pending(_) => "pending",
            Slot::Fulfilled(_) => "fulfilled",
            Slot::Rejected(_) => "rejected",
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

impl<T: Clone> Future for Promise<T> {
    type Output = StreamResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.lock();
        match &mut *slot {
            Slot::Pending(wakers) => {
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
            Slot::Fulfilled(v) => Poll::Ready(Ok(v.clone())),
            Slot::Rejected(e) => Poll::Ready(Err(e.clone())),
        }
    }
}

impl<T> Resolver<T> {
    /// Fulfill the promise. Returns false if it was already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Slot::Fulfilled(value))
    }

    /// Reject the promise. Returns false if it was already settled.
    pub fn reject(&self, error: StreamError) -> bool {
        self.settle(Slot::Rejected(error))
    }

    fn settle(&self, outcome: Slot<T>) -> bool {
        let wakers = {
            let mut slot = self.slot.lock();
            match &mut *slot {
                Slot::Pending(wakers) => {
                    let wakers = std::mem::take(wakers);
                    *slot = outcome;
                    wakers
                }
                _ => return false,
            }
        };
        // Registration order
        for waker in wakers {
            waker.wake();
        }
        true
    }
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Resolver {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl Resolver<()> {
    /// Settle with a unit value or an error
    pub fn settle_with(&self, result: StreamResult<()>) -> bool {
        match result {
            Ok(()) => self.resolve(()),
            Err(e) => self.reject(e),
        }
    }
}

/// A pending request with exactly one consumer
pub struct Request<T> {
    rx: oneshot::Receiver<StreamResult<T>>,
}

/// The settling side of a [`Request`]
pub struct Responder<T> {
    tx: oneshot::Sender<StreamResult<T>>,
}

impl<T> Request<T> {
    pub fn new() -> (Request<T>, Responder<T>) {
        let (tx, rx) = oneshot::channel();
        (Request { rx }, Responder { tx })
    }

    /// A request that is already settled
    pub fn ready(result: StreamResult<T>) -> Self {
        let (request, responder) = Self::new();
        responder.respond(result);
        request
    }
}

impl<T> Future for Request<T> {
    type Output = StreamResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Responder dropped without answering: the owning stream is gone
            Poll::Ready(Err(_)) => Poll::Ready(Err(StreamError::Detached)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request").finish_non_exhaustive()
    }
}

impl<T> Responder<T> {
    pub fn respond(self, result: StreamResult<T>) {
        // The consumer may have dropped its handle; the effect already happened
        let _ = self.tx.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    #[tokio::test]
    async fn test_promise_settles_once() {
        let (promise, resolver) = Promise::<u32>::new();
        assert!(promise.is_pending());
        assert!(resolver.resolve(7));
        assert!(!resolver.reject(StreamError::Aborted));
        assert_eq!(promise.clone().await, Ok(7));
        assert_eq!(promise.await, Ok(7));
    }

    #[tokio::test]
    async fn test_promise_wakes_waiters() {
        let (promise, resolver) = Promise::<()>::new();
        let waiter = tokio::spawn(promise.clone());
        tokio::task::yield_now().await;
        resolver.reject(StreamError::custom("boom"));
        assert_eq!(waiter.await.unwrap(), Err(StreamError::custom("boom")));
        assert!(promise.is_rejected());
        assert_eq!(promise.error(), Some(StreamError::custom("boom")));
    }

    #[test]
    fn test_request_ready() {
        let request = Request::ready(Ok(Some(3)));
        assert_eq!(request.now_or_never(), Some(Ok(Some(3))));
    }

    #[test]
    fn test_request_detached() {
        let (request, responder) = Request::<u8>::new();
        drop(responder);
        assert_eq!(request.now_or_never(), Some(Err(StreamError::Detached)));
    }
}
