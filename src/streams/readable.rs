use super::{
    CountQueuingStrategy, QueuingStrategy, StreamResult,
    error::StreamError,
    pipe::{self, PipeDestination, ReadableWritablePair, StreamPipeOptions},
    promise::Promise,
    queue::QueueWithSizes,
    reader::{ExclusiveReader, ReaderMirror, ReaderSlot},
};
use crate::platform::{BoxedStrategy, PlatformBoxFuture, SharedPtr, Spawner, WeakPtr};
use futures::{FutureExt, future};
use std::{cell::RefCell, fmt, future::Future, marker::PhantomData};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadableState {
    Waiting,
    Readable,
    Closed,
    Errored,
}

// ----------- Source Trait -----------

/// Underlying source feeding a [`ReadableStream`].
///
/// Every hook is optional. The body of a hook runs synchronously when the
/// stream invokes it; the future it returns is driven by the stream's spawner
/// and its outcome is what the stream reacts to. `()` is a source with no
/// hooks at all.
pub trait ReadableSource<T: 'static>: 'static {
    /// Called once during construction. An `Err` here aborts construction.
    fn start(
        &mut self,
        controller: ReadableStreamDefaultController<T>,
    ) -> StreamResult<impl Future<Output = StreamResult<()>> + 'static> {
        let _ = controller;
        Ok(future::ready(Ok(())))
    }

    /// Called whenever the stream wants more data. Never called again until
    /// the previously returned future settles.
    fn pull(
        &mut self,
        controller: ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + 'static {
        let _ = controller;
        future::ready(Ok(()))
    }

    fn cancel(
        &mut self,
        reason: Option<StreamError>,
    ) -> impl Future<Output = StreamResult<()>> + 'static {
        let _ = reason;
        future::ready(Ok(()))
    }
}

impl<T: 'static> ReadableSource<T> for () {}

type HookFuture = PlatformBoxFuture<'static, StreamResult<()>>;

trait DynReadableSource<T: 'static> {
    fn start_dyn(&mut self, controller: ReadableStreamDefaultController<T>)
    -> StreamResult<HookFuture>;
    fn pull_dyn(&mut self, controller: ReadableStreamDefaultController<T>) -> HookFuture;
    fn cancel_dyn(&mut self, reason: Option<StreamError>) -> HookFuture;
}

impl<T: 'static, S: ReadableSource<T>> DynReadableSource<T> for S {
    fn start_dyn(
        &mut self,
        controller: ReadableStreamDefaultController<T>,
    ) -> StreamResult<HookFuture> {
        self.start(controller).map(FutureExt::boxed_local)
    }

    fn pull_dyn(&mut self, controller: ReadableStreamDefaultController<T>) -> HookFuture {
        self.pull(controller).boxed_local()
    }

    fn cancel_dyn(&mut self, reason: Option<StreamError>) -> HookFuture {
        self.cancel(reason).boxed_local()
    }
}

// ----------- Controller -----------

/// Capability handed to the source: enqueue, close and error.
///
/// Holds the stream weakly. Once every handle to the stream is gone,
/// `enqueue` fails and `close`/`error` do nothing.
pub struct ReadableStreamDefaultController<T: 'static> {
    stream: WeakPtr<ReadableStreamShared<T>>,
}

impl<T: 'static> Clone for ReadableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
        }
    }
}

impl<T: 'static> ReadableStreamDefaultController<T> {
    fn stream(&self) -> Option<ReadableStream<T>> {
        self.stream.upgrade().map(|shared| ReadableStream { shared })
    }

    /// Queue a chunk. `Ok(true)` means the strategy wants more data,
    /// `Ok(false)` means backpressure applies.
    pub fn enqueue(&self, chunk: T) -> StreamResult<bool> {
        match self.stream() {
            Some(stream) => stream.enqueue(chunk),
            None => Err(StreamError::type_error("the stream has been dropped")),
        }
    }

    /// Close once the queue drains. Ignored unless waiting or readable.
    pub fn close(&self) {
        if let Some(stream) = self.stream() {
            stream.close_requested();
        }
    }

    pub fn error(&self, error: StreamError) {
        if let Some(stream) = self.stream() {
            stream.error(error);
        }
    }

    /// The state outside callers currently observe, `None` once the stream is dropped.
    pub fn state(&self) -> Option<ReadableState> {
        self.stream().map(|stream| stream.state())
    }
}

impl<T: 'static> fmt::Debug for ReadableStreamDefaultController<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableStreamDefaultController")
            .field("state", &self.state())
            .finish()
    }
}

// ----------- Inner State -----------
struct ReadableStreamInner<T> {
    state: ReadableState,
    queue: QueueWithSizes<T>,
    draining: bool,
    started: bool,
    pull_scheduled: bool,
    pulling: Option<Promise>,
    ready: Promise,
    closed: Promise,
    reader: Option<SharedPtr<ReaderSlot>>,
    stored_error: Option<StreamError>,
}

impl<T> ReadableStreamInner<T> {
    fn new() -> Self {
        Self {
            state: ReadableState::Waiting,
            queue: QueueWithSizes::new(),
            draining: false,
            started: false,
            pull_scheduled: false,
            pulling: None,
            ready: Promise::pending(),
            closed: Promise::pending(),
            reader: None,
            stored_error: None,
        }
    }

    fn get_stored_error(&self) -> StreamError {
        self.stored_error
            .clone()
            .unwrap_or_else(|| StreamError::type_error("Stream is errored"))
    }

    fn mark_readable(&mut self) {
        match &self.reader {
            Some(reader) => {
                let mut reader = reader.borrow_mut();
                reader.ready.resolve();
                reader.state = ReadableState::Readable;
            }
            None => {
                self.ready.resolve();
            }
        }
        self.state = ReadableState::Readable;
        debug!("readable stream became readable");
    }

    fn mark_waiting(&mut self) {
        match &self.reader {
            Some(reader) => {
                let mut reader = reader.borrow_mut();
                reader.ready = Promise::pending();
                reader.state = ReadableState::Waiting;
            }
            None => {
                self.ready = Promise::pending();
            }
        }
        self.state = ReadableState::Waiting;
        debug!("readable stream is waiting for chunks");
    }

    fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.borrow_mut().close();
            // ready was held back while the lock was active
            self.ready.resolve();
        } else if self.state == ReadableState::Waiting {
            self.ready.resolve();
        }
        self.closed.resolve();
        self.state = ReadableState::Closed;
        debug!("readable stream closed");
    }

    fn error(&mut self, error: StreamError) {
        if matches!(self.state, ReadableState::Closed | ReadableState::Errored) {
            return;
        }
        self.queue.clear();

        if let Some(reader) = self.reader.take() {
            let mut reader = reader.borrow_mut();
            reader.ready.resolve();
            reader.closed.reject(error.clone());
            reader.state = ReadableState::Errored;
            self.ready.resolve();
        } else if self.state == ReadableState::Waiting {
            self.ready.resolve();
        }

        self.closed.reject(error.clone());
        debug!(%error, "readable stream errored");
        self.stored_error = Some(error);
        self.state = ReadableState::Errored;
    }
}

struct ReadableStreamShared<T: 'static> {
    inner: RefCell<ReadableStreamInner<T>>,
    source: RefCell<Box<dyn DynReadableSource<T>>>,
    strategy: BoxedStrategy<T>,
    spawner: Spawner,
}

// ----------- Main ReadableStream -----------

/// A readable stream. Cloning yields another handle to the same stream.
pub struct ReadableStream<T: 'static> {
    shared: SharedPtr<ReadableStreamShared<T>>,
}

impl<T: 'static> Clone for ReadableStream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: SharedPtr::clone(&self.shared),
        }
    }
}

impl<T: 'static> fmt::Debug for ReadableStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.borrow();
        f.debug_struct("ReadableStream")
            .field("state", &inner.state)
            .field("queued", &inner.queue.len())
            .field("draining", &inner.draining)
            .field("locked", &inner.reader.is_some())
            .finish()
    }
}

impl<T: 'static> ReadableStream<T> {
    /// Returns a builder for this readable stream
    pub fn builder<Source: ReadableSource<T>>(
        source: Source,
    ) -> ReadableStreamBuilder<T, Source> {
        ReadableStreamBuilder::new(source)
    }

    fn new_inner(
        source: Box<dyn DynReadableSource<T>>,
        strategy: BoxedStrategy<T>,
        spawner: Spawner,
    ) -> StreamResult<Self> {
        let stream = Self {
            shared: SharedPtr::new(ReadableStreamShared {
                inner: RefCell::new(ReadableStreamInner::new()),
                source: RefCell::new(source),
                strategy,
                spawner,
            }),
        };

        let start = match stream
            .invoke_source(|source, controller| source.start_dyn(controller))
            .and_then(|start| start)
        {
            Ok(start) => start,
            Err(error) => {
                warn!(%error, "readable source start failed");
                return Err(error);
            }
        };

        let this = stream.clone();
        stream.shared.spawner.spawn(async move {
            let stream = this;
            match start.await {
                Ok(()) => {
                    stream.shared.inner.borrow_mut().started = true;
                    trace!("readable source started");
                    let _ = stream.call_pull();
                }
                Err(error) => {
                    warn!(%error, "readable source start rejected");
                    stream.error(error);
                }
            }
        });

        Ok(stream)
    }

    fn downgrade(&self) -> WeakPtr<ReadableStreamShared<T>> {
        SharedPtr::downgrade(&self.shared)
    }

    fn controller(&self) -> ReadableStreamDefaultController<T> {
        ReadableStreamDefaultController {
            stream: self.downgrade(),
        }
    }

    pub(crate) fn spawner(&self) -> &Spawner {
        &self.shared.spawner
    }

    /// Run a source hook. Fails if another hook body is still on the stack.
    fn invoke_source<R, F>(&self, call: F) -> StreamResult<R>
    where
        F: FnOnce(&mut dyn DynReadableSource<T>, ReadableStreamDefaultController<T>) -> R,
    {
        let controller = self.controller();
        match self.shared.source.try_borrow_mut() {
            Ok(mut source) => Ok(call(&mut **source, controller)),
            Err(_) => Err(StreamError::type_error(
                "underlying source is already running a hook",
            )),
        }
    }

    fn invoke_source_hook<F>(&self, call: F) -> HookFuture
    where
        F: FnOnce(&mut dyn DynReadableSource<T>, ReadableStreamDefaultController<T>) -> HookFuture,
    {
        self.invoke_source(call)
            .unwrap_or_else(|error| future::ready(Err(error)).boxed_local())
    }

    // ----------- Public surface -----------

    /// State as seen from outside. A locked stream always reports `Waiting`.
    pub fn state(&self) -> ReadableState {
        let inner = self.shared.inner.borrow();
        if inner.reader.is_some() {
            ReadableState::Waiting
        } else {
            inner.state
        }
    }

    pub fn ready(&self) -> Promise {
        self.shared.inner.borrow().ready.clone()
    }

    pub fn closed(&self) -> Promise {
        self.shared.inner.borrow().closed.clone()
    }

    pub fn is_locked(&self) -> bool {
        self.shared.inner.borrow().reader.is_some()
    }

    /// Take the next chunk. Only valid while `Readable` and unlocked.
    pub fn read(&self) -> StreamResult<T> {
        if self.is_locked() {
            return Err(StreamError::type_error(
                "This stream is locked to a single exclusive reader and cannot be read from directly",
            ));
        }
        self.read_internal()
    }

    pub fn cancel(&self, reason: Option<StreamError>) -> Promise {
        if self.is_locked() {
            return Promise::rejected(StreamError::type_error(
                "This stream is locked to a single exclusive reader and cannot be cancelled directly",
            ));
        }
        self.cancel_internal(reason)
    }

    pub fn get_reader(&self) -> StreamResult<ExclusiveReader<T>> {
        ExclusiveReader::new(self.clone())
    }

    /// Pipe every chunk into `dest`. See [`pipe`](super::pipe) for the protocol.
    pub fn pipe_to<D>(&self, dest: D, options: StreamPipeOptions) -> Promise
    where
        D: PipeDestination<T>,
    {
        pipe::pipe_to(self, dest, options)
    }

    /// Pipe into the writable half of `pair` and hand back its readable half.
    pub fn pipe_through<P>(&self, pair: P, options: StreamPipeOptions) -> ReadableStream<P::Output>
    where
        P: ReadableWritablePair<T>,
    {
        let (writable, readable) = pair.into_parts();
        let _ = self.pipe_to(writable, options);
        readable
    }

    // ----------- Abstract operations -----------

    pub(crate) fn enqueue(&self, chunk: T) -> StreamResult<bool> {
        {
            let inner = self.shared.inner.borrow();
            match inner.state {
                ReadableState::Errored => return Err(inner.get_stored_error()),
                ReadableState::Closed => return Err(StreamError::type_error("stream is closed")),
                _ => {}
            }
            if inner.draining {
                return Err(StreamError::type_error("stream is draining"));
            }
        }

        let size = match self.shared.strategy.size(&chunk) {
            Ok(size) => size,
            Err(error) => {
                warn!(%error, "queuing strategy size failed");
                self.error(error.clone());
                return Err(error);
            }
        };

        let enqueued = self.shared.inner.borrow_mut().queue.enqueue(chunk, size);
        if let Err(error) = enqueued {
            warn!(%error, "rejected chunk size");
            self.error(error.clone());
            return Err(error);
        }

        let backpressure = self.should_apply_backpressure()?;

        let mut inner = self.shared.inner.borrow_mut();
        if inner.state == ReadableState::Waiting {
            inner.mark_readable();
        }
        Ok(!backpressure)
    }

    pub(crate) fn close_requested(&self) {
        let mut inner = self.shared.inner.borrow_mut();
        match inner.state {
            ReadableState::Waiting => inner.close(),
            ReadableState::Readable => {
                inner.draining = true;
                debug!("readable stream draining");
            }
            ReadableState::Closed | ReadableState::Errored => {}
        }
    }

    pub(crate) fn error(&self, error: StreamError) {
        self.shared.inner.borrow_mut().error(error);
    }

    fn should_apply_backpressure(&self) -> StreamResult<bool> {
        let queue_size = self.shared.inner.borrow().queue.total_size();
        self.shared
            .strategy
            .should_apply_backpressure(queue_size)
            .map_err(|error| {
                warn!(%error, "queuing strategy backpressure check failed");
                self.error(error.clone());
                error
            })
    }

    /// Read bypassing the lock check. Used directly by the active reader.
    pub(crate) fn read_internal(&self) -> StreamResult<T> {
        let chunk = {
            let mut inner = self.shared.inner.borrow_mut();
            match inner.state {
                ReadableState::Waiting => {
                    return Err(StreamError::type_error("no chunks available (yet)"));
                }
                ReadableState::Closed => {
                    return Err(StreamError::type_error("stream has already been consumed"));
                }
                ReadableState::Errored => return Err(inner.get_stored_error()),
                ReadableState::Readable => {}
            }

            let Some(chunk) = inner.queue.dequeue() else {
                return Err(StreamError::type_error("no chunks available (yet)"));
            };
            if inner.queue.is_empty() {
                if inner.draining {
                    inner.close();
                } else {
                    inner.mark_waiting();
                }
            }
            chunk
        };

        // A strategy failure here has already errored the stream; the chunk
        // was dequeued before it, so it is still handed out.
        if let Err(error) = self.call_pull() {
            debug!(%error, "pull after read failed");
        }
        Ok(chunk)
    }

    /// Cancel bypassing the lock check. Used directly by the active reader.
    pub(crate) fn cancel_internal(&self, reason: Option<StreamError>) -> Promise {
        {
            let mut inner = self.shared.inner.borrow_mut();
            if matches!(inner.state, ReadableState::Closed | ReadableState::Errored) {
                return inner.closed.clone();
            }
            inner.queue.clear();
            inner.close();
        }
        debug!("readable stream canceled");

        let hook = self.invoke_source_hook(|source, _| source.cancel_dyn(reason));
        let result = Promise::pending();
        let settle = result.clone();
        self.shared.spawner.spawn(async move {
            settle.settle(hook.await);
        });
        result
    }

    pub(crate) fn call_pull(&self) -> StreamResult<()> {
        let in_flight = {
            let mut inner = self.shared.inner.borrow_mut();
            if inner.draining
                || !inner.started
                || matches!(inner.state, ReadableState::Closed | ReadableState::Errored)
                || inner.pull_scheduled
            {
                return Ok(());
            }
            let in_flight = inner.pulling.clone();
            if in_flight.is_some() {
                inner.pull_scheduled = true;
            }
            in_flight
        };

        if let Some(pulling) = in_flight {
            trace!("pull in flight, scheduling another");
            let stream = self.clone();
            self.shared.spawner.spawn(async move {
                if pulling.await.is_ok() {
                    stream.shared.inner.borrow_mut().pull_scheduled = false;
                    let _ = stream.call_pull();
                }
            });
            return Ok(());
        }

        if self.should_apply_backpressure()? {
            return Ok(());
        }

        let pulling = Promise::pending();
        self.shared.inner.borrow_mut().pulling = Some(pulling.clone());
        trace!("calling source pull");
        let hook = self.invoke_source_hook(|source, controller| source.pull_dyn(controller));

        let stream = self.clone();
        self.shared.spawner.spawn(async move {
            let result = hook.await;
            match &result {
                Ok(()) => stream.shared.inner.borrow_mut().pulling = None,
                Err(error) => {
                    warn!(%error, "readable source pull failed");
                    stream.error(error.clone());
                }
            }
            pulling.settle(result);
        });
        Ok(())
    }

    // ----------- Lock bookkeeping for ExclusiveReader -----------

    pub(crate) fn acquire_reader(&self) -> StreamResult<SharedPtr<ReaderSlot>> {
        let mut inner = self.shared.inner.borrow_mut();
        if inner.reader.is_some() {
            return Err(StreamError::type_error(
                "This stream has already been locked for exclusive reading by another reader",
            ));
        }
        match inner.state {
            ReadableState::Errored => return Err(inner.get_stored_error()),
            ReadableState::Closed => {
                return Err(StreamError::type_error(
                    "The stream has already been closed, so a reader cannot be acquired.",
                ));
            }
            ReadableState::Waiting | ReadableState::Readable => {}
        }

        // A locked stream looks like it is waiting, so its own ready starts over.
        if inner.state == ReadableState::Readable {
            inner.ready = Promise::pending();
        }

        let slot = SharedPtr::new(RefCell::new(ReaderMirror::new(inner.state)));
        inner.reader = Some(SharedPtr::clone(&slot));
        debug!("readable stream locked");
        Ok(slot)
    }

    pub(crate) fn is_locked_by(&self, slot: &SharedPtr<ReaderSlot>) -> bool {
        self.shared
            .inner
            .borrow()
            .reader
            .as_ref()
            .is_some_and(|reader| SharedPtr::ptr_eq(reader, slot))
    }

    pub(crate) fn release_reader(&self, slot: &SharedPtr<ReaderSlot>) {
        let mut inner = self.shared.inner.borrow_mut();
        let active = inner
            .reader
            .as_ref()
            .is_some_and(|reader| SharedPtr::ptr_eq(reader, slot));
        if !active {
            return;
        }

        slot.borrow_mut().close();
        if inner.state == ReadableState::Readable {
            inner.ready.resolve();
        }
        inner.reader = None;
        debug!("readable stream lock released");
    }
}

// ----------- Example Source Implementation -----------

/// Pull source that enqueues one item per pull and closes when exhausted.
pub struct IteratorSource<I> {
    iter: I,
}

impl<I> IteratorSource<I> {
    pub fn new(iter: I) -> Self {
        Self { iter }
    }
}

impl<I, T> ReadableSource<T> for IteratorSource<I>
where
    I: Iterator<Item = T> + 'static,
    T: 'static,
{
    fn pull(
        &mut self,
        controller: ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + 'static {
        let result = match self.iter.next() {
            Some(item) => controller.enqueue(item).map(|_| ()),
            None => {
                controller.close();
                Ok(())
            }
        };
        future::ready(result)
    }
}

// ----------- Builder Pattern Implementation -----------
pub struct ReadableStreamBuilder<T: 'static, Source> {
    source: Source,
    strategy: BoxedStrategy<T>,
    _phantom: PhantomData<T>,
}

impl<T: 'static, Source: ReadableSource<T>> ReadableStreamBuilder<T, Source> {
    fn new(source: Source) -> Self {
        Self {
            source,
            strategy: Box::new(CountQueuingStrategy::with_valid_high_water_mark(1.0)),
            _phantom: PhantomData,
        }
    }

    pub fn strategy<S: QueuingStrategy<T> + 'static>(mut self, s: S) -> Self {
        self.strategy = Box::new(s);
        self
    }

    pub(crate) fn boxed_strategy(mut self, strategy: BoxedStrategy<T>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Build the stream, scheduling continuations with `spawn_fn`.
    /// Fails if the source's `start` hook fails synchronously.
    pub fn spawn<F, R>(self, spawn_fn: F) -> StreamResult<ReadableStream<T>>
    where
        F: Fn(PlatformBoxFuture<'static, ()>) -> R + 'static,
    {
        self.spawn_with(Spawner::new(spawn_fn))
    }

    pub fn spawn_with(self, spawner: Spawner) -> StreamResult<ReadableStream<T>> {
        ReadableStream::new_inner(Box::new(self.source), self.strategy, spawner)
    }
}

impl<T: 'static> ReadableStreamBuilder<T, IteratorSource<std::vec::IntoIter<T>>> {
    /// Create a builder from a Vec
    pub fn from_vec(vec: Vec<T>) -> Self {
        Self::new(IteratorSource::new(vec.into_iter()))
    }
}

impl<T: 'static, I> ReadableStreamBuilder<T, IteratorSource<I>>
where
    I: Iterator<Item = T> + 'static,
{
    /// Create a builder from an Iterator
    pub fn from_iterator(iter: I) -> Self {
        Self::new(IteratorSource::new(iter))
    }
}

impl<T: 'static> ReadableStream<T> {
    /// Create from Vec - shortcut for ReadableStreamBuilder::from_vec()
    pub fn from_vec(vec: Vec<T>) -> ReadableStreamBuilder<T, IteratorSource<std::vec::IntoIter<T>>> {
        ReadableStreamBuilder::from_vec(vec)
    }

    /// Create from Iterator - shortcut for ReadableStreamBuilder::from_iterator()
    pub fn from_iterator<I>(iter: I) -> ReadableStreamBuilder<T, IteratorSource<I>>
    where
        I: Iterator<Item = T> + 'static,
    {
        ReadableStreamBuilder::from_iterator(iter)
    }
}
