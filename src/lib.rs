//! Readable, writable and transform streams with explicit backpressure.
//!
//! Streams are driven by user-supplied hooks ([`ReadableSource`],
//! [`WritableSink`], [`Transformer`]) and by a [`platform::Spawner`] that runs
//! the continuations scheduled once a hook's future settles. Everything is
//! single-threaded.
//!
//! ```
//! use futures::executor::LocalPool;
//! use whatwg_streams_draft::{ReadableState, ReadableStream};
//!
//! let mut pool = LocalPool::new();
//! let stream = ReadableStream::from_vec(vec![1, 2, 3])
//!     .spawn_with(pool.spawner().into())
//!     .unwrap();
//!
//! pool.run_until_stalled();
//! let mut chunks = Vec::new();
//! while stream.state() == ReadableState::Readable {
//!     chunks.push(stream.read().unwrap());
//!     pool.run_until_stalled();
//! }
//! assert_eq!(chunks, vec![1, 2, 3]);
//! assert_eq!(stream.state(), ReadableState::Closed);
//! ```

pub mod platform;
pub mod streams;

pub use streams::*;
