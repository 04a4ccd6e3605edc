//! Queuing strategies
//!
//! A strategy pairs a highWaterMark with a size algorithm. Streams compare the
//! total queued size against the highWaterMark to decide on backpressure.

use crate::error::{StreamError, StreamResult};
use std::{fmt, sync::Arc};

/// Computes the size of a chunk. May fail, which errors the stream.
pub type SizeAlgorithm<T> = Arc<dyn Fn(&T) -> StreamResult<f64> + Send + Sync>;

/// highWaterMark plus size algorithm for one side of a stream
pub struct QueuingStrategy<T> {
    /// Threshold in size units (default: 1)
    pub high_water_mark: f64,
    /// Per-chunk size (default: every chunk counts as 1)
    pub size: Option<SizeAlgorithm<T>>,
}

impl<T> Default for QueuingStrategy<T> {
    fn default() -> Self {
        Self {
            high_water_mark: 1.0,
            size: None,
        }
    }
}

impl<T> Clone for QueuingStrategy<T> {
    fn clone(&self) -> Self {
        Self {
            high_water_mark: self.high_water_mark,
            size: self.size.clone(),
        }
    }
}

impl<T> fmt::Debug for QueuingStrategy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuingStrategy")
            .field("high_water_mark", &self.high_water_mark)
            .field("size", &self.size.as_ref().map(|_| "custom"))
            .finish()
    }
}

impl<T> QueuingStrategy<T> {
    pub fn new(high_water_mark: f64) -> Self {
        Self {
            high_water_mark,
            size: None,
        }
    }

    pub fn with_high_water_mark(mut self, high_water_mark: f64) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }

    pub fn with_size<F>(mut self, size: F) -> Self
    where
        F: Fn(&T) -> StreamResult<f64> + Send + Sync + 'static,
    {
        self.size = Some(Arc::new(size));
        self
    }

    /// Validated highWaterMark
    pub(crate) fn validated_high_water_mark(&self) -> StreamResult<f64> {
        let hwm = self.high_water_mark;
        if hwm.is_nan() || hwm < 0.0 {
            return Err(StreamError::InvalidHighWaterMark(hwm.to_string()));
        }
        Ok(hwm)
    }

    /// Run the size algorithm and reject sizes a queue cannot hold
    pub(crate) fn chunk_size(&self, chunk: &T) -> StreamResult<f64> {
        let size = match &self.size {
            Some(size) => size(chunk)?,
            None => 1.0,
        };
        if !size.is_finite() || size < 0.0 {
            return Err(StreamError::InvalidChunkSize(size.to_string()));
        }
        Ok(size)
    }
}

/// Counts every chunk as 1
pub struct CountQueuingStrategy;

impl CountQueuingStrategy {
    pub fn new<T>(high_water_mark: f64) -> QueuingStrategy<T> {
        QueuingStrategy::new(high_water_mark).with_size(|_| Ok(1.0))
    }
}

/// Measures chunks by their byte length
pub struct ByteLengthQueuingStrategy;

impl ByteLengthQueuingStrategy {
    pub fn new<T: AsRef<[u8]>>(high_water_mark: f64) -> QueuingStrategy<T> {
        QueuingStrategy::new(high_water_mark).with_size(|chunk: &T| Ok(chunk.as_ref().len() as f64))
    }
}
