pub mod error;
pub mod pipe;
pub mod promise;
pub mod queue;
pub mod readable;
pub mod reader;
pub mod transform;
pub mod writable;

// Re-export main types
pub use error::*;
pub use pipe::*;
pub use promise::*;
pub use queue::*;
pub use readable::*;
pub use reader::*;
pub use transform::*;
pub use writable::*;

pub type StreamResult<T> = Result<T, StreamError>;

/// Decides what a chunk costs and when a queue is full enough to push back.
///
/// Both methods may fail; a failure errors the stream that consulted the
/// strategy and is reported to whoever triggered the consultation.
pub trait QueuingStrategy<T> {
    /// Return the size of the chunk
    fn size(&self, chunk: &T) -> StreamResult<f64>;
    /// Whether a queue holding `queue_size` worth of chunks should apply backpressure
    fn should_apply_backpressure(&self, queue_size: f64) -> StreamResult<bool>;
}

fn validate_high_water_mark(high_water_mark: f64) -> StreamResult<f64> {
    if high_water_mark.is_nan() {
        return Err(StreamError::type_error("highWaterMark must be a number."));
    }
    if high_water_mark < 0.0 {
        return Err(StreamError::range_error("highWaterMark must be nonnegative."));
    }
    Ok(high_water_mark)
}

/// Count-based strategy: every chunk costs 1
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CountQueuingStrategy {
    high_water_mark: f64,
}

impl CountQueuingStrategy {
    pub fn new(high_water_mark: f64) -> StreamResult<Self> {
        Ok(Self {
            high_water_mark: validate_high_water_mark(high_water_mark)?,
        })
    }

    /// Caller guarantees `high_water_mark` is a nonnegative number.
    pub(crate) const fn with_valid_high_water_mark(high_water_mark: f64) -> Self {
        Self { high_water_mark }
    }

    pub fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

impl<T> QueuingStrategy<T> for CountQueuingStrategy {
    fn size(&self, _chunk: &T) -> StreamResult<f64> {
        Ok(1.0)
    }

    fn should_apply_backpressure(&self, queue_size: f64) -> StreamResult<bool> {
        Ok(queue_size > self.high_water_mark)
    }
}

/// Chunks whose cost is their length in bytes
pub trait ByteLength {
    fn byte_length(&self) -> usize;
}

impl ByteLength for Vec<u8> {
    fn byte_length(&self) -> usize {
        self.len()
    }
}

impl ByteLength for Box<[u8]> {
    fn byte_length(&self) -> usize {
        self.len()
    }
}

impl ByteLength for String {
    fn byte_length(&self) -> usize {
        self.len()
    }
}

impl ByteLength for &[u8] {
    fn byte_length(&self) -> usize {
        self.len()
    }
}

impl ByteLength for &str {
    fn byte_length(&self) -> usize {
        self.len()
    }
}

/// Byte length strategy for types with known byte sizes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ByteLengthQueuingStrategy {
    high_water_mark: f64,
}

impl ByteLengthQueuingStrategy {
    pub fn new(high_water_mark: f64) -> StreamResult<Self> {
        Ok(Self {
            high_water_mark: validate_high_water_mark(high_water_mark)?,
        })
    }

    pub fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

impl<T: ByteLength> QueuingStrategy<T> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &T) -> StreamResult<f64> {
        Ok(chunk.byte_length() as f64)
    }

    fn should_apply_backpressure(&self, queue_size: f64) -> StreamResult<bool> {
        Ok(queue_size > self.high_water_mark)
    }
}
