//! AbortController / AbortSignal
//!
//! Cooperative cancellation for pipes and writable sinks. A signal fires at
//! most once; observers see the reason through [`AbortSignal::aborted`].

use crate::error::StreamError;
use crate::promise::{Promise, Resolver};
use parking_lot::Mutex;
use std::sync::Arc;

struct SignalState {
    reason: Option<StreamError>,
    resolver: Resolver<StreamError>,
}

/// Read-only view of an abort request
#[derive(Clone)]
pub struct AbortSignal {
    state: Arc<Mutex<SignalState>>,
    fired: Promise<StreamError>,
}

impl AbortSignal {
    fn new() -> Self {
        let (fired, resolver) = Promise::new();
        Self {
            state: Arc::new(Mutex::new(SignalState {
                reason: None,
                resolver,
            })),
            fired,
        }
    }

    /// A signal that is already aborted with `reason`
    pub fn abort(reason: StreamError) -> Self {
        let signal = Self::new();
        signal.fire(reason);
        signal
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().reason.is_some()
    }

    pub fn reason(&self) -> Option<StreamError> {
        self.state.lock().reason.clone()
    }

    /// Resolves with the abort reason once the signal fires
    pub fn aborted(&self) -> Promise<StreamError> {
        self.fired.clone()
    }

    fn fire(&self, reason: StreamError) -> bool {
        let resolver = {
            let mut state = self.state.lock();
            if state.reason.is_some() {
                return false;
            }
            state.reason = Some(reason.clone());
            state.resolver.clone()
        };
        tracing::debug!(%reason, "abort signal fired");
        resolver.resolve(reason)
    }
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortSignal")
            .field("reason", &self.reason())
            .finish()
    }
}

/// Owner of an [`AbortSignal`]
#[derive(Debug, Clone)]
pub struct AbortController {
    signal: AbortSignal,
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            signal: AbortSignal::new(),
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Fire the signal. Only the first call has an effect.
    pub fn abort(&self, reason: Option<StreamError>) {
        self.signal.fire(reason.unwrap_or(StreamError::Aborted));
    }
}
