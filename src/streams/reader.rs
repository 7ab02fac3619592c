use super::{
    StreamResult,
    error::StreamError,
    promise::Promise,
    readable::{ReadableState, ReadableStream},
};
use crate::platform::SharedPtr;
use futures::Stream;
use std::{
    cell::RefCell,
    fmt,
    pin::Pin,
    task::{Context, Poll},
};

/// Reader-side copies of the stream's observable state, swapped in while the
/// lock is held.
pub(crate) struct ReaderMirror {
    pub(crate) state: ReadableState,
    pub(crate) ready: Promise,
    pub(crate) closed: Promise,
}

pub(crate) type ReaderSlot = RefCell<ReaderMirror>;

impl ReaderMirror {
    pub(crate) fn new(stream_state: ReadableState) -> Self {
        let ready = if stream_state == ReadableState::Waiting {
            Promise::pending()
        } else {
            Promise::resolved()
        };
        Self {
            state: stream_state,
            ready,
            closed: Promise::pending(),
        }
    }

    pub(crate) fn close(&mut self) {
        if self.state == ReadableState::Waiting {
            self.ready.resolve();
        }
        self.closed.resolve();
        self.state = ReadableState::Closed;
    }
}

// ----------- Exclusive Reader -----------

/// Holds the lock on a [`ReadableStream`].
///
/// While active, the stream itself reports `Waiting` and refuses direct
/// reads; this reader sees the real state instead. Releasing the lock (or
/// dropping the reader) hands the stream back and closes the reader.
pub struct ExclusiveReader<T: 'static> {
    stream: ReadableStream<T>,
    slot: SharedPtr<ReaderSlot>,
    // `ready` awaited by `poll_next`
    waiting: Option<Promise>,
    error_yielded: bool,
}

impl<T: 'static> ExclusiveReader<T> {
    pub fn new(stream: ReadableStream<T>) -> StreamResult<Self> {
        let slot = stream.acquire_reader()?;
        Ok(Self {
            stream,
            slot,
            waiting: None,
            error_yielded: false,
        })
    }

    /// Whether this reader still holds the lock.
    pub fn is_active(&self) -> bool {
        self.stream.is_locked_by(&self.slot)
    }

    pub fn state(&self) -> ReadableState {
        self.slot.borrow().state
    }

    pub fn ready(&self) -> Promise {
        self.slot.borrow().ready.clone()
    }

    pub fn closed(&self) -> Promise {
        self.slot.borrow().closed.clone()
    }

    pub fn read(&self) -> StreamResult<T> {
        if !self.is_active() {
            return Err(StreamError::type_error(
                "This stream reader has released its lock on the stream and can no longer be used",
            ));
        }
        self.stream.read_internal()
    }

    /// Cancel the underlying stream. An inactive reader just hands back its
    /// `closed` promise.
    pub fn cancel(&self, reason: Option<StreamError>) -> Promise {
        if !self.is_active() {
            return self.closed();
        }
        self.stream.cancel_internal(reason)
    }

    pub fn release_lock(&self) {
        self.stream.release_reader(&self.slot);
    }
}

impl<T: 'static> Drop for ExclusiveReader<T> {
    fn drop(&mut self) {
        self.release_lock();
    }
}

impl<T: 'static> fmt::Debug for ExclusiveReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExclusiveReader")
            .field("state", &self.state())
            .field("active", &self.is_active())
            .finish()
    }
}

// ----------- Stream Trait Implementation -----------

/// Yields chunks until the stream closes. An errored stream yields its
/// error once, then ends.
impl<T: 'static> Stream for ExclusiveReader<T> {
    type Item = StreamResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match this.state() {
                ReadableState::Readable => return Poll::Ready(Some(this.read())),
                ReadableState::Closed => return Poll::Ready(None),
                ReadableState::Errored => {
                    if this.error_yielded {
                        return Poll::Ready(None);
                    }
                    this.error_yielded = true;
                    return match this.closed().outcome() {
                        Some(Err(error)) => Poll::Ready(Some(Err(error))),
                        _ => Poll::Ready(None),
                    };
                }
                ReadableState::Waiting => {
                    // every return to Waiting installs a fresh pending ready
                    match this.ready().poll_retained(&mut this.waiting, cx) {
                        Poll::Ready(_) => continue,
                        Poll::Pending => return Poll::Pending,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::readable::{ReadableSource, ReadableStreamDefaultController};
    use futures::{StreamExt, executor::LocalPool, future};
    use std::future::Future;

    struct Push(SharedPtr<RefCell<Option<ReadableStreamDefaultController<i32>>>>);

    impl ReadableSource<i32> for Push {
        fn start(
            &mut self,
            controller: ReadableStreamDefaultController<i32>,
        ) -> StreamResult<impl Future<Output = StreamResult<()>> + 'static> {
            *self.0.borrow_mut() = Some(controller);
            Ok(future::ready(Ok(())))
        }
    }

    fn push_stream(
        pool: &LocalPool,
    ) -> (ReadableStream<i32>, ReadableStreamDefaultController<i32>) {
        let cell = SharedPtr::new(RefCell::new(None));
        let stream = ReadableStream::builder(Push(cell.clone()))
            .strategy(crate::streams::CountQueuingStrategy::new(10.0).unwrap())
            .spawn_with(pool.spawner().into())
            .unwrap();
        let controller = cell.borrow().clone().unwrap();
        (stream, controller)
    }

    #[test]
    fn locked_stream_looks_waiting_to_everyone_else() {
        let pool = LocalPool::new();
        let (stream, controller) = push_stream(&pool);
        controller.enqueue(1).unwrap();
        assert_eq!(stream.state(), ReadableState::Readable);

        let reader = stream.get_reader().unwrap();
        assert!(stream.is_locked());
        assert_eq!(stream.state(), ReadableState::Waiting);
        assert!(stream.ready().is_pending());
        assert_eq!(reader.state(), ReadableState::Readable);
        assert!(reader.ready().is_fulfilled());

        assert!(stream.read().unwrap_err().is_type_error());
        assert!(stream.cancel(None).is_rejected());
        assert!(stream.get_reader().unwrap_err().is_type_error());

        assert_eq!(reader.read().unwrap(), 1);
        assert_eq!(reader.state(), ReadableState::Waiting);
    }

    #[test]
    fn releasing_restores_the_stream_and_closes_the_reader() {
        let pool = LocalPool::new();
        let (stream, controller) = push_stream(&pool);
        controller.enqueue(1).unwrap();

        let reader = stream.get_reader().unwrap();
        let stream_ready = stream.ready();
        reader.release_lock();

        assert!(!reader.is_active());
        assert_eq!(reader.state(), ReadableState::Closed);
        assert!(reader.closed().is_fulfilled());
        assert!(stream_ready.is_fulfilled());
        assert_eq!(stream.state(), ReadableState::Readable);
        assert_eq!(stream.read().unwrap(), 1);

        assert!(reader.read().unwrap_err().is_type_error());
        assert!(reader.cancel(None).ptr_eq(&reader.closed()));
        reader.release_lock();
    }

    #[test]
    fn stream_closing_under_the_lock_closes_and_detaches_the_reader() {
        let pool = LocalPool::new();
        let (stream, controller) = push_stream(&pool);
        let reader = stream.get_reader().unwrap();
        let reader_ready = reader.ready();

        controller.close();

        assert!(reader_ready.is_fulfilled());
        assert!(reader.closed().is_fulfilled());
        assert!(!reader.is_active());
        assert!(!stream.is_locked());
        assert_eq!(stream.state(), ReadableState::Closed);
        assert!(stream.ready().is_fulfilled());
    }

    #[test]
    fn stream_erroring_under_the_lock_rejects_the_reader() {
        let pool = LocalPool::new();
        let (stream, controller) = push_stream(&pool);
        let reader = stream.get_reader().unwrap();
        let error: StreamError = "fatal".into();

        controller.error(error.clone());

        assert_eq!(reader.state(), ReadableState::Errored);
        assert!(reader.ready().is_fulfilled());
        assert_eq!(reader.closed().outcome(), Some(Err(error.clone())));
        assert!(!stream.is_locked());
        assert_eq!(stream.state(), ReadableState::Errored);
        assert!(stream.ready().is_fulfilled());
        assert!(stream.get_reader().unwrap_err() == error);
    }

    #[test]
    fn reader_cancel_cancels_the_stream() {
        let mut pool = LocalPool::new();
        let (stream, controller) = push_stream(&pool);
        controller.enqueue(1).unwrap();
        let reader = stream.get_reader().unwrap();

        let canceled = reader.cancel(None);
        pool.run_until_stalled();

        assert_eq!(canceled.outcome(), Some(Ok(())));
        assert_eq!(stream.state(), ReadableState::Closed);
        assert_eq!(reader.state(), ReadableState::Closed);
    }

    #[test]
    fn cannot_lock_a_closed_stream() {
        let pool = LocalPool::new();
        let (stream, controller) = push_stream(&pool);
        controller.close();
        assert!(stream.get_reader().unwrap_err().is_type_error());
    }

    #[test]
    fn dropping_the_reader_releases_the_lock() {
        let pool = LocalPool::new();
        let (stream, _controller) = push_stream(&pool);

        let reader = stream.get_reader().unwrap();
        drop(reader);
        assert!(!stream.is_locked());
        assert!(stream.get_reader().is_ok());
    }

    #[test]
    fn reader_stream_yields_until_close() {
        let mut pool = LocalPool::new();
        let stream = ReadableStream::from_vec(vec![1, 2, 3])
            .spawn_with(pool.spawner().into())
            .unwrap();
        let reader = stream.get_reader().unwrap();

        let chunks: Vec<_> = pool.run_until(reader.collect::<Vec<_>>());
        assert_eq!(chunks, vec![Ok(1), Ok(2), Ok(3)]);
    }

    #[test]
    fn reader_stream_reports_error_once() {
        let mut pool = LocalPool::new();
        let (stream, controller) = push_stream(&pool);
        let mut reader = stream.get_reader().unwrap();
        let error: StreamError = "fatal".into();

        controller.enqueue(1).unwrap();
        assert_eq!(pool.run_until(reader.next()), Some(Ok(1)));

        controller.error(error.clone());
        assert_eq!(pool.run_until(reader.next()), Some(Err(error.clone())));
        assert_eq!(pool.run_until(reader.next()), None);

        assert_eq!(reader.state(), ReadableState::Errored);
        assert_eq!(stream.state(), ReadableState::Errored);
        assert_eq!(reader.closed().outcome(), Some(Err(error)));
    }
}
