//! Recording sources and sinks shared by the scenario tests

#![allow(dead_code)]

use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use viper_streams::{
    HookFuture, ReadableStreamDefaultController, StreamError, UnderlyingSink, UnderlyingSource,
    WritableStreamDefaultController, hook,
};

#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Write(u32),
    Close,
    Abort(StreamError),
}

/// Sink that records every hook call and checks that writes never overlap
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<SinkEvent>>>,
    writing: Arc<Mutex<bool>>,
    overlapped: Arc<Mutex<bool>>,
    delay: Option<Duration>,
}

impl RecordingSink {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().clone()
    }

    pub fn writes(&self) -> Vec<u32> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SinkEvent::Write(chunk) => Some(chunk),
                _ => None,
            })
            .collect()
    }

    pub fn aborts(&self) -> Vec<StreamError> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SinkEvent::Abort(reason) => Some(reason),
                _ => None,
            })
            .collect()
    }

    pub fn overlapped(&self) -> bool {
        *self.overlapped.lock()
    }
}

impl UnderlyingSink<u32> for RecordingSink {
    fn write(&mut self, chunk: u32, _: &WritableStreamDefaultController<u32>) -> HookFuture {
        self.events.lock().push(SinkEvent::Write(chunk));
        {
            let mut writing = self.writing.lock();
            if *writing {
                *self.overlapped.lock() = true;
            }
            *writing = true;
        }
        let writing = Arc::clone(&self.writing);
        let delay = self.delay;
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            *writing.lock() = false;
            Ok(())
        })
    }

    fn close(&mut self) -> HookFuture {
        self.events.lock().push(SinkEvent::Close);
        hook::done()
    }

    fn abort(&mut self, reason: StreamError) -> HookFuture {
        self.events.lock().push(SinkEvent::Abort(reason));
        hook::done()
    }
}

/// Source driven by the test through its controller
#[derive(Clone, Default)]
pub struct ManualSource {
    controller: Arc<Mutex<Option<ReadableStreamDefaultController<u32>>>>,
    cancels: Arc<Mutex<Vec<StreamError>>>,
}

impl ManualSource {
    pub fn controller(&self) -> ReadableStreamDefaultController<u32> {
        match self.controller.lock().clone() {
            Some(controller) => controller,
            None => panic!("source not started"),
        }
    }

    pub fn cancels(&self) -> Vec<StreamError> {
        self.cancels.lock().clone()
    }
}

impl UnderlyingSource<u32> for ManualSource {
    fn start(&mut self, controller: &ReadableStreamDefaultController<u32>) -> HookFuture {
        *self.controller.lock() = Some(controller.clone());
        hook::done()
    }

    fn cancel(&mut self, reason: StreamError) -> HookFuture {
        self.cancels.lock().push(reason);
        hook::done()
    }
}

/// Let spawned stream reactions run
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}
