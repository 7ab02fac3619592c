use std::{borrow::Cow, error::Error, fmt, sync::Arc};
use thiserror::Error;

/// Every failure a stream can report.
///
/// `Type` and `Range` cover misuse and validation; `Other` carries errors
/// raised by sources, sinks, strategies and transformers. Two `Other` values
/// compare equal only when they share the same allocation, so an error can be
/// traced back to the exact instance that errored a stream.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    #[error("{0}")]
    Type(Cow<'static, str>),
    #[error("{0}")]
    Range(Cow<'static, str>),
    #[error("size must be a finite, non-NaN number, got {0}")]
    InvalidSize(f64),
    #[error("Stream operation was canceled")]
    Canceled,
    #[error("Stream was aborted{}", reason_suffix(.0))]
    Aborted(Option<String>),
    #[error("{0}")]
    Other(Arc<dyn Error + Send + Sync>),
}

impl StreamError {
    pub fn type_error(msg: impl Into<Cow<'static, str>>) -> Self {
        StreamError::Type(msg.into())
    }

    pub fn range_error(msg: impl Into<Cow<'static, str>>) -> Self {
        StreamError::Range(msg.into())
    }

    /// Wrap any error type into `StreamError`
    pub fn other<E>(e: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        StreamError::Other(Arc::new(e))
    }

    /// Wrap a boxed error
    pub fn other_boxed(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }

    pub fn is_type_error(&self) -> bool {
        matches!(self, StreamError::Type(_))
    }

    pub fn is_range_error(&self) -> bool {
        matches!(self, StreamError::Range(_))
    }
}

impl PartialEq for StreamError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (StreamError::Type(a), StreamError::Type(b)) => a == b,
            (StreamError::Range(a), StreamError::Range(b)) => a == b,
            (StreamError::InvalidSize(a), StreamError::InvalidSize(b)) => {
                a.to_bits() == b.to_bits()
            }
            (StreamError::Canceled, StreamError::Canceled) => true,
            (StreamError::Aborted(a), StreamError::Aborted(b)) => a == b,
            (StreamError::Other(a), StreamError::Other(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason
        .as_deref()
        .map(|r| format!(": {r}"))
        .unwrap_or_default()
}

#[derive(Debug)]
struct SimpleError(String);

impl fmt::Display for SimpleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for SimpleError {}

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        StreamError::Other(Arc::new(SimpleError(s.to_string())))
    }
}

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        StreamError::Other(Arc::new(SimpleError(s)))
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        StreamError::Other(Arc::new(e))
    }
}

impl From<Box<dyn Error + Send + Sync>> for StreamError {
    fn from(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }
}

/// Macro for users to add direct `From` implementations for their error types.
/// This allows using `?` directly inside hooks without `.map_err(StreamError::other)`.
///
/// # Example
/// ```rust
/// use whatwg_streams_draft::impl_stream_error_from;
///
/// #[derive(Debug)]
/// struct DecodeError;
/// impl std::fmt::Display for DecodeError {
///     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
///         f.write_str("decode failed")
///     }
/// }
/// impl std::error::Error for DecodeError {}
///
/// impl_stream_error_from!(DecodeError);
/// ```
#[macro_export]
macro_rules! impl_stream_error_from {
    ($($error_type:ty),* $(,)?) => {
        $(
            impl From<$error_type> for $crate::StreamError {
                fn from(e: $error_type) -> Self {
                    $crate::StreamError::Other(std::sync::Arc::new(e))
                }
            }
        )*
    };
}
