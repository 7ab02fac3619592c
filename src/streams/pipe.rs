//! Piping a readable stream into anything that looks like a writable stream.
//!
//! The pipe locks the source with an [`ExclusiveReader`] and moves chunks
//! synchronously for as long as the source is readable and the destination is
//! writable. Whenever either side has to wait, the pipe parks on a race of
//! the relevant promises and re-runs the same loop once one of them settles.

use super::{
    error::StreamError,
    promise::Promise,
    readable::{ReadableState, ReadableStream},
    reader::ExclusiveReader,
    writable::{WritableState, WritableStream},
};
use crate::platform::{SharedPtr, Spawner};
use std::future::Future;
use tracing::{debug, trace};

/// What `pipe_to` needs from a destination. [`WritableStream`] implements
/// it; test doubles and adapters can too.
pub trait PipeDestination<T>: 'static {
    fn state(&self) -> WritableState;
    fn ready(&self) -> Promise;
    fn closed(&self) -> Promise;
    fn write(&self, chunk: T) -> Promise;
    fn close(&self) -> Promise;
    fn abort(&self, reason: StreamError) -> Promise;
}

impl<T: 'static> PipeDestination<T> for WritableStream<T> {
    fn state(&self) -> WritableState {
        WritableStream::state(self)
    }

    fn ready(&self) -> Promise {
        WritableStream::ready(self)
    }

    fn closed(&self) -> Promise {
        WritableStream::closed(self)
    }

    fn write(&self, chunk: T) -> Promise {
        WritableStream::write(self, chunk)
    }

    fn close(&self) -> Promise {
        WritableStream::close(self)
    }

    fn abort(&self, reason: StreamError) -> Promise {
        WritableStream::abort(self, reason)
    }
}

/// Options for piping a stream
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamPipeOptions {
    /// Leave the destination open when the source closes.
    pub prevent_close: bool,
    /// Leave the destination alone when the source errors.
    pub prevent_abort: bool,
    /// Leave the source alone when the destination errors or closes.
    pub prevent_cancel: bool,
}

/// A writable half and a readable half, as accepted by
/// [`ReadableStream::pipe_through`].
pub trait ReadableWritablePair<I: 'static> {
    type Output: 'static;
    type Writable: PipeDestination<I>;

    fn into_parts(self) -> (Self::Writable, ReadableStream<Self::Output>);
}

impl<I, O, W> ReadableWritablePair<I> for (W, ReadableStream<O>)
where
    I: 'static,
    O: 'static,
    W: PipeDestination<I>,
{
    type Output = O;
    type Writable = W;

    fn into_parts(self) -> (W, ReadableStream<O>) {
        self
    }
}

struct Pipe<T: 'static, D> {
    reader: ExclusiveReader<T>,
    dest: D,
    options: StreamPipeOptions,
    result: Promise,
    spawner: Spawner,
}

pub(crate) fn pipe_to<T, D>(source: &ReadableStream<T>, dest: D, options: StreamPipeOptions) -> Promise
where
    T: 'static,
    D: PipeDestination<T>,
{
    let reader = match source.get_reader() {
        Ok(reader) => reader,
        Err(error) => return Promise::rejected(error),
    };

    let pipe = SharedPtr::new(Pipe {
        reader,
        dest,
        options,
        result: Promise::pending(),
        spawner: source.spawner().clone(),
    });
    debug!(?options, "pipe started");
    Pipe::drive(&pipe);
    pipe.result.clone()
}

impl<T: 'static, D: PipeDestination<T>> Pipe<T, D> {
    fn drive(pipe: &SharedPtr<Self>) {
        loop {
            if pipe.result.is_settled() {
                return;
            }

            let source_state = pipe.reader.state();
            match source_state {
                ReadableState::Errored => {
                    let closed = pipe.reader.closed();
                    Self::after(pipe, closed, |pipe, outcome| {
                        pipe.abort_dest(outcome.err().unwrap_or_else(|| {
                            StreamError::type_error("source errored without a reason")
                        }));
                    });
                    return;
                }
                ReadableState::Closed => {
                    pipe.close_dest();
                    return;
                }
                ReadableState::Readable | ReadableState::Waiting => {}
            }

            let source_readable = source_state == ReadableState::Readable;
            match pipe.dest.state() {
                WritableState::Writable if source_readable => {
                    match pipe.reader.read() {
                        Ok(chunk) => {
                            let _ = pipe.dest.write(chunk);
                        }
                        Err(error) => {
                            pipe.abort_dest(error);
                            return;
                        }
                    }
                    continue;
                }
                WritableState::Writable => {
                    Self::retry_after(pipe, Promise::race(pipe.reader.ready(), pipe.dest.closed()));
                }
                WritableState::Waiting if source_readable => {
                    Self::retry_after(pipe, Promise::race(pipe.reader.closed(), pipe.dest.ready()));
                }
                WritableState::Waiting => {
                    Self::retry_after(pipe, Promise::race(pipe.reader.ready(), pipe.dest.ready()));
                }
                WritableState::Errored => {
                    let closed = pipe.dest.closed();
                    Self::after(pipe, closed, |pipe, outcome| {
                        pipe.cancel_source(outcome.err().unwrap_or_else(|| {
                            StreamError::type_error("destination errored without a reason")
                        }));
                    });
                }
                WritableState::Closing | WritableState::Closed => {
                    pipe.cancel_source(StreamError::type_error(
                        "destination is closing or closed and cannot be piped to anymore",
                    ));
                }
            }
            return;
        }
    }

    /// Re-run the loop once `wait` settles, whichever way it settles.
    fn retry_after<F>(pipe: &SharedPtr<Self>, wait: F)
    where
        F: Future<Output = Result<(), StreamError>> + 'static,
    {
        trace!("pipe waiting");
        let pipe_ref = SharedPtr::clone(pipe);
        pipe.spawner.spawn(async move {
            let _ = wait.await;
            Self::drive(&pipe_ref);
        });
    }

    /// Run `then` with the outcome of `promise`, right away if it is settled.
    fn after<F>(pipe: &SharedPtr<Self>, promise: Promise, then: F)
    where
        F: FnOnce(&Self, Result<(), StreamError>) + 'static,
    {
        if let Some(outcome) = promise.outcome() {
            then(&**pipe, outcome);
            return;
        }
        let pipe_ref = SharedPtr::clone(pipe);
        pipe.spawner.spawn(async move {
            let outcome = promise.await;
            then(&*pipe_ref, outcome);
        });
    }

    fn cancel_source(&self, reason: StreamError) {
        debug!(%reason, "pipe canceling source");
        if self.options.prevent_cancel {
            self.reader.release_lock();
        } else {
            let _ = self.reader.cancel(Some(reason.clone()));
        }
        self.result.reject(reason);
    }

    fn close_dest(&self) {
        debug!("pipe source closed");
        self.reader.release_lock();
        if self.options.prevent_close {
            self.result.resolve();
            return;
        }

        let closing = self.dest.close();
        match closing.outcome() {
            Some(outcome) => {
                self.result.settle(outcome);
            }
            None => {
                let result = self.result.clone();
                self.spawner.spawn(async move {
                    result.settle(closing.await);
                });
            }
        }
    }

    fn abort_dest(&self, reason: StreamError) {
        debug!(%reason, "pipe aborting destination");
        self.reader.release_lock();
        if !self.options.prevent_abort {
            let _ = self.dest.abort(reason.clone());
        }
        self.result.reject(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::{
        CountQueuingStrategy, StreamResult,
        readable::{ReadableSource, ReadableStreamDefaultController},
    };
    use futures::{executor::LocalPool, future};
    use std::cell::{Cell, RefCell};

    struct Push {
        controller: SharedPtr<RefCell<Option<ReadableStreamDefaultController<i32>>>>,
        canceled_with: SharedPtr<RefCell<Option<Option<StreamError>>>>,
    }

    impl ReadableSource<i32> for Push {
        fn start(
            &mut self,
            controller: ReadableStreamDefaultController<i32>,
        ) -> StreamResult<impl Future<Output = StreamResult<()>> + 'static> {
            *self.controller.borrow_mut() = Some(controller);
            Ok(future::ready(Ok(())))
        }

        fn cancel(
            &mut self,
            reason: Option<StreamError>,
        ) -> impl Future<Output = StreamResult<()>> + 'static {
            *self.canceled_with.borrow_mut() = Some(reason);
            future::ready(Ok(()))
        }
    }

    struct Source {
        stream: ReadableStream<i32>,
        controller: ReadableStreamDefaultController<i32>,
        canceled_with: SharedPtr<RefCell<Option<Option<StreamError>>>>,
    }

    fn source(pool: &LocalPool) -> Source {
        let controller = SharedPtr::new(RefCell::new(None));
        let canceled_with = SharedPtr::new(RefCell::new(None));
        let stream = ReadableStream::builder(Push {
            controller: controller.clone(),
            canceled_with: canceled_with.clone(),
        })
        .strategy(CountQueuingStrategy::new(100.0).unwrap())
        .spawn_with(pool.spawner().into())
        .unwrap();
        let controller = controller.borrow().clone().unwrap();
        Source {
            stream,
            controller,
            canceled_with,
        }
    }

    /// Destination double whose state the test drives by hand.
    #[derive(Clone)]
    struct FakeDest {
        state: SharedPtr<Cell<WritableState>>,
        ready: SharedPtr<RefCell<Promise>>,
        closed: Promise,
        written: SharedPtr<RefCell<Vec<i32>>>,
        calls: SharedPtr<RefCell<Vec<String>>>,
    }

    impl FakeDest {
        fn new() -> Self {
            Self {
                state: SharedPtr::new(Cell::new(WritableState::Writable)),
                ready: SharedPtr::new(RefCell::new(Promise::resolved())),
                closed: Promise::pending(),
                written: SharedPtr::new(RefCell::new(Vec::new())),
                calls: SharedPtr::new(RefCell::new(Vec::new())),
            }
        }

        fn start_waiting(&self) {
            self.state.set(WritableState::Waiting);
            *self.ready.borrow_mut() = Promise::pending();
        }

        fn become_writable(&self) {
            self.state.set(WritableState::Writable);
            self.ready.borrow().resolve();
        }

        fn fail(&self, error: StreamError) {
            self.state.set(WritableState::Errored);
            self.closed.reject(error);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    impl PipeDestination<i32> for FakeDest {
        fn state(&self) -> WritableState {
            self.state.get()
        }

        fn ready(&self) -> Promise {
            self.ready.borrow().clone()
        }

        fn closed(&self) -> Promise {
            self.closed.clone()
        }

        fn write(&self, chunk: i32) -> Promise {
            self.written.borrow_mut().push(chunk);
            Promise::resolved()
        }

        fn close(&self) -> Promise {
            self.calls.borrow_mut().push("close".to_string());
            self.state.set(WritableState::Closed);
            self.closed.resolve();
            self.closed.clone()
        }

        fn abort(&self, reason: StreamError) -> Promise {
            self.calls.borrow_mut().push(format!("abort {reason}"));
            self.fail(reason);
            Promise::resolved()
        }
    }

    #[test]
    fn pipes_everything_then_closes_the_destination() {
        let pool = LocalPool::new();
        let src = source(&pool);
        for n in 1..=3 {
            src.controller.enqueue(n).unwrap();
        }
        src.controller.close();
        let dest = FakeDest::new();

        let piped = src.stream.pipe_to(dest.clone(), StreamPipeOptions::default());

        assert_eq!(*dest.written.borrow(), vec![1, 2, 3]);
        assert_eq!(dest.calls(), vec!["close"]);
        assert_eq!(piped.outcome(), Some(Ok(())));
        assert_eq!(src.stream.state(), ReadableState::Closed);
    }

    #[test]
    fn prevent_close_leaves_the_destination_open() {
        let pool = LocalPool::new();
        let src = source(&pool);
        src.controller.enqueue(1).unwrap();
        src.controller.close();
        let dest = FakeDest::new();

        let options = StreamPipeOptions {
            prevent_close: true,
            ..Default::default()
        };
        let piped = src.stream.pipe_to(dest.clone(), options);

        assert!(dest.calls().is_empty());
        assert_eq!(dest.state(), WritableState::Writable);
        assert_eq!(piped.outcome(), Some(Ok(())));
    }

    #[test]
    fn waits_for_chunks_and_for_destination_readiness() {
        let mut pool = LocalPool::new();
        let src = source(&pool);
        let dest = FakeDest::new();

        let piped = src.stream.pipe_to(dest.clone(), StreamPipeOptions::default());
        assert!(src.stream.is_locked());
        pool.run_until_stalled();
        assert!(dest.written.borrow().is_empty());

        src.controller.enqueue(1).unwrap();
        pool.run_until_stalled();
        assert_eq!(*dest.written.borrow(), vec![1]);

        dest.start_waiting();
        src.controller.enqueue(2).unwrap();
        pool.run_until_stalled();
        assert_eq!(*dest.written.borrow(), vec![1]);

        dest.become_writable();
        pool.run_until_stalled();
        assert_eq!(*dest.written.borrow(), vec![1, 2]);

        src.controller.close();
        pool.run_until_stalled();
        assert_eq!(piped.outcome(), Some(Ok(())));
        assert!(!src.stream.is_locked());
    }

    #[test]
    fn both_sides_waiting_resumes_on_either() {
        let mut pool = LocalPool::new();
        let src = source(&pool);
        let dest = FakeDest::new();
        dest.start_waiting();

        let _piped = src.stream.pipe_to(dest.clone(), StreamPipeOptions::default());
        pool.run_until_stalled();

        dest.become_writable();
        pool.run_until_stalled();
        src.controller.enqueue(7).unwrap();
        pool.run_until_stalled();
        assert_eq!(*dest.written.borrow(), vec![7]);
    }

    #[test]
    fn both_sides_waiting_resumes_when_destination_ready_rejects() {
        let mut pool = LocalPool::new();
        let src = source(&pool);
        let dest = FakeDest::new();
        dest.start_waiting();

        let piped = src.stream.pipe_to(dest.clone(), StreamPipeOptions::default());
        pool.run_until_stalled();
        assert!(piped.is_pending());

        let error: StreamError = "destination gave up".into();
        dest.state.set(WritableState::Errored);
        dest.closed.reject(error.clone());
        dest.ready.borrow().reject(error.clone());
        pool.run_until_stalled();

        assert_eq!(piped.outcome(), Some(Err(error.clone())));
        assert_eq!(*src.canceled_with.borrow(), Some(Some(error)));
        assert!(!src.stream.is_locked());
    }

    #[test]
    fn long_running_pipe_keeps_one_waiter_on_destination_closed() {
        let mut pool = LocalPool::new();
        let src = source(&pool);
        let dest = WritableStream::<i32>::builder(())
            .strategy(CountQueuingStrategy::new(1000.0).unwrap())
            .spawn_with(pool.spawner().into())
            .unwrap();

        let piped = src.stream.pipe_to(dest.clone(), StreamPipeOptions::default());
        for n in 0..500 {
            src.controller.enqueue(n).unwrap();
            pool.run_until_stalled();
        }
        assert_eq!(dest.closed().listener_count(), 1);

        src.controller.close();
        pool.run_until_stalled();
        assert_eq!(piped.outcome(), Some(Ok(())));
        assert_eq!(dest.closed().listener_count(), 0);
    }

    #[test]
    fn source_error_aborts_the_destination() {
        let mut pool = LocalPool::new();
        let src = source(&pool);
        let dest = FakeDest::new();
        let error: StreamError = "source broke".into();

        let piped = src.stream.pipe_to(dest.clone(), StreamPipeOptions::default());
        pool.run_until_stalled();

        src.controller.error(error.clone());
        pool.run_until_stalled();

        assert_eq!(dest.calls(), vec!["abort source broke"]);
        assert_eq!(piped.outcome(), Some(Err(error)));
    }

    #[test]
    fn prevent_abort_only_rejects_the_pipe() {
        let mut pool = LocalPool::new();
        let src = source(&pool);
        let dest = FakeDest::new();
        let error: StreamError = "source broke".into();

        let options = StreamPipeOptions {
            prevent_abort: true,
            ..Default::default()
        };
        let piped = src.stream.pipe_to(dest.clone(), options);
        src.controller.error(error.clone());
        pool.run_until_stalled();

        assert!(dest.calls().is_empty());
        assert_eq!(piped.outcome(), Some(Err(error)));
    }

    #[test]
    fn destination_error_cancels_the_source() {
        let mut pool = LocalPool::new();
        let src = source(&pool);
        src.controller.enqueue(1).unwrap();
        let dest = FakeDest::new();
        let error: StreamError = "dest broke".into();
        dest.fail(error.clone());

        let piped = src.stream.pipe_to(dest.clone(), StreamPipeOptions::default());
        pool.run_until_stalled();

        assert_eq!(piped.outcome(), Some(Err(error.clone())));
        assert_eq!(*src.canceled_with.borrow(), Some(Some(error)));
        assert_eq!(src.stream.state(), ReadableState::Closed);
    }

    #[test]
    fn prevent_cancel_releases_the_source_instead() {
        let pool = LocalPool::new();
        let src = source(&pool);
        src.controller.enqueue(1).unwrap();
        let dest = FakeDest::new();
        dest.fail("dest broke".into());

        let options = StreamPipeOptions {
            prevent_cancel: true,
            ..Default::default()
        };
        let piped = src.stream.pipe_to(dest, options);

        assert!(piped.is_rejected());
        assert!(src.canceled_with.borrow().is_none());
        assert!(!src.stream.is_locked());
        assert_eq!(src.stream.read().unwrap(), 1);
    }

    #[test]
    fn closing_destination_cancels_with_a_type_error() {
        let pool = LocalPool::new();
        let src = source(&pool);
        let dest = FakeDest::new();
        dest.state.set(WritableState::Closing);

        let piped = src.stream.pipe_to(dest, StreamPipeOptions::default());

        assert!(piped.outcome().unwrap().unwrap_err().is_type_error());
        let canceled_with = src.canceled_with.borrow().clone().flatten();
        assert!(canceled_with.unwrap().is_type_error());
    }

    #[test]
    fn finished_source_wins_over_a_closing_destination() {
        let mut pool = LocalPool::new();
        let src = source(&pool);
        let dest = FakeDest::new();

        let piped = src.stream.pipe_to(dest.clone(), StreamPipeOptions::default());
        pool.run_until_stalled();

        dest.state.set(WritableState::Closing);
        src.controller.close();
        pool.run_until_stalled();

        assert_eq!(dest.calls(), vec!["close"]);
        assert_eq!(piped.outcome(), Some(Ok(())));
    }

    #[test]
    fn locked_source_rejects_the_pipe() {
        let pool = LocalPool::new();
        let src = source(&pool);
        let _reader = src.stream.get_reader().unwrap();

        let piped = src.stream.pipe_to(FakeDest::new(), StreamPipeOptions::default());
        assert!(piped.outcome().unwrap().unwrap_err().is_type_error());
    }

    #[test]
    fn tuples_work_as_pipe_through_pairs() {
        let mut pool = LocalPool::new();
        let src = source(&pool);
        let relay = source(&pool);
        src.controller.enqueue(5).unwrap();
        src.controller.close();
        let dest = FakeDest::new();

        let out = src
            .stream
            .pipe_through((dest.clone(), relay.stream.clone()), StreamPipeOptions::default());
        pool.run_until_stalled();

        assert!(out.closed().ptr_eq(&relay.stream.closed()));
        assert_eq!(*dest.written.borrow(), vec![5]);
    }
}
