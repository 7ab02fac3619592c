use super::{
    CountQueuingStrategy, QueuingStrategy, StreamResult, error::StreamError, promise::Promise,
    queue::QueueWithSizes,
};
use crate::platform::{BoxedStrategy, PlatformBoxFuture, SharedPtr, Spawner, WeakPtr};
use futures::{FutureExt, Sink, future};
use std::{
    cell::RefCell,
    fmt,
    future::Future,
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll},
};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritableState {
    Writable,
    Waiting,
    Closing,
    Closed,
    Errored,
}

// ----------- Sink Trait -----------

/// Underlying sink consuming a [`WritableStream`].
///
/// The stream hands the sink one chunk at a time and waits for the returned
/// future before sending the next. Every hook is optional; `()` accepts and
/// discards everything.
pub trait WritableSink<T: 'static>: 'static {
    /// Called once during construction. Writes queue up until the returned
    /// future resolves. An `Err` (immediate or from the future) errors the stream.
    fn start(
        &mut self,
        controller: WritableStreamDefaultController,
    ) -> StreamResult<impl Future<Output = StreamResult<()>> + 'static> {
        let _ = controller;
        Ok(future::ready(Ok(())))
    }

    fn write(&mut self, chunk: T) -> impl Future<Output = StreamResult<()>> + 'static {
        let _ = chunk;
        future::ready(Ok(()))
    }

    fn close(&mut self) -> impl Future<Output = StreamResult<()>> + 'static {
        future::ready(Ok(()))
    }

    /// Defaults to [`close`](WritableSink::close).
    fn abort(&mut self, reason: StreamError) -> impl Future<Output = StreamResult<()>> + 'static {
        let _ = reason;
        self.close()
    }
}

impl<T: 'static> WritableSink<T> for () {}

type HookFuture = PlatformBoxFuture<'static, StreamResult<()>>;

trait DynWritableSink<T: 'static> {
    fn start_dyn(&mut self, controller: WritableStreamDefaultController)
    -> StreamResult<HookFuture>;
    fn write_dyn(&mut self, chunk: T) -> HookFuture;
    fn close_dyn(&mut self) -> HookFuture;
    fn abort_dyn(&mut self, reason: StreamError) -> HookFuture;
}

impl<T: 'static, S: WritableSink<T>> DynWritableSink<T> for S {
    fn start_dyn(
        &mut self,
        controller: WritableStreamDefaultController,
    ) -> StreamResult<HookFuture> {
        self.start(controller).map(FutureExt::boxed_local)
    }

    fn write_dyn(&mut self, chunk: T) -> HookFuture {
        self.write(chunk).boxed_local()
    }

    fn close_dyn(&mut self) -> HookFuture {
        self.close().boxed_local()
    }

    fn abort_dyn(&mut self, reason: StreamError) -> HookFuture {
        self.abort(reason).boxed_local()
    }
}

// ----------- Controller -----------

trait ErrorTarget {
    fn error(&self, error: StreamError);
    fn state(&self) -> WritableState;
}

/// Lets the sink error its stream from outside a hook.
#[derive(Clone)]
pub struct WritableStreamDefaultController {
    stream: WeakPtr<dyn ErrorTarget>,
}

impl WritableStreamDefaultController {
    /// No-op once the stream is closed, errored or dropped.
    pub fn error(&self, error: StreamError) {
        if let Some(stream) = self.stream.upgrade() {
            stream.error(error);
        }
    }

    pub fn state(&self) -> Option<WritableState> {
        self.stream.upgrade().map(|stream| stream.state())
    }
}

impl fmt::Debug for WritableStreamDefaultController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritableStreamDefaultController")
            .field("state", &self.state())
            .finish()
    }
}

// ----------- Inner State -----------

enum WriteRecord<T> {
    Chunk {
        chunk: Option<T>,
        settlement: Promise,
    },
    Close,
}

struct WritableStreamInner<T> {
    state: WritableState,
    queue: QueueWithSizes<WriteRecord<T>>,
    started: Promise,
    writing: bool,
    ready: Promise,
    closed: Promise,
    stored_error: Option<StreamError>,
    last_write: Option<Promise>,
}

impl<T> WritableStreamInner<T> {
    fn new() -> Self {
        Self {
            state: WritableState::Writable,
            queue: QueueWithSizes::new(),
            started: Promise::pending(),
            writing: false,
            ready: Promise::resolved(),
            closed: Promise::pending(),
            stored_error: None,
            last_write: None,
        }
    }

    fn get_stored_error(&self) -> StreamError {
        self.stored_error
            .clone()
            .unwrap_or_else(|| StreamError::type_error("Stream is errored"))
    }

    fn error(&mut self, error: StreamError) {
        if matches!(self.state, WritableState::Closed | WritableState::Errored) {
            return;
        }

        for record in self.queue.drain() {
            if let WriteRecord::Chunk { settlement, .. } = record {
                settlement.reject(error.clone());
            }
        }

        if self.state == WritableState::Waiting {
            self.ready.resolve();
        }
        self.closed.reject(error.clone());
        debug!(%error, "writable stream errored");
        self.stored_error = Some(error);
        self.state = WritableState::Errored;
    }
}

struct WritableStreamShared<T: 'static> {
    inner: RefCell<WritableStreamInner<T>>,
    sink: RefCell<Box<dyn DynWritableSink<T>>>,
    strategy: BoxedStrategy<T>,
    spawner: Spawner,
}

impl<T: 'static> ErrorTarget for WritableStreamShared<T> {
    fn error(&self, error: StreamError) {
        self.inner.borrow_mut().error(error);
    }

    fn state(&self) -> WritableState {
        self.inner.borrow().state
    }
}

enum Head<T> {
    Write(T, Promise),
    Close,
}

// ----------- Main WritableStream -----------

/// A writable stream. Cloning yields another handle to the same stream;
/// writes from every handle share one FIFO queue.
pub struct WritableStream<T: 'static> {
    shared: SharedPtr<WritableStreamShared<T>>,
    // promise the `Sink` impl is parked on, per handle
    sink_wait: Option<Promise>,
}

impl<T: 'static> Clone for WritableStream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: SharedPtr::clone(&self.shared),
            sink_wait: None,
        }
    }
}

impl<T: 'static> fmt::Debug for WritableStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.borrow();
        f.debug_struct("WritableStream")
            .field("state", &inner.state)
            .field("queued", &inner.queue.len())
            .field("writing", &inner.writing)
            .finish()
    }
}

impl<T: 'static> WritableStream<T> {
    /// Returns a builder for this writable stream
    pub fn builder<Sink: WritableSink<T>>(sink: Sink) -> WritableStreamBuilder<T, Sink> {
        WritableStreamBuilder::new(sink)
    }

    fn new_inner(
        sink: Box<dyn DynWritableSink<T>>,
        strategy: BoxedStrategy<T>,
        spawner: Spawner,
    ) -> StreamResult<Self> {
        let stream = Self {
            shared: SharedPtr::new(WritableStreamShared {
                inner: RefCell::new(WritableStreamInner::new()),
                sink: RefCell::new(sink),
                strategy,
                spawner,
            }),
            sink_wait: None,
        };

        stream.sync_state_with_queue()?;

        let started = stream.shared.inner.borrow().started.clone();
        let start = stream
            .invoke_sink(|sink, controller| sink.start_dyn(controller))
            .and_then(|start| start);
        match start {
            Ok(start) => {
                let this = stream.clone();
                stream.shared.spawner.spawn(async move {
                    let result = start.await;
                    match &result {
                        Ok(()) => trace!("writable sink started"),
                        Err(error) => {
                            warn!(%error, "writable sink start failed");
                            this.error(error.clone());
                        }
                    }
                    started.settle(result);
                });
            }
            Err(error) => {
                warn!(%error, "writable sink start failed");
                stream.error(error.clone());
                started.reject(error);
            }
        }

        Ok(stream)
    }

    fn controller(&self) -> WritableStreamDefaultController {
        let weak = SharedPtr::downgrade(&self.shared);
        let stream: WeakPtr<dyn ErrorTarget> = weak;
        WritableStreamDefaultController { stream }
    }

    /// Run a sink hook. Fails if another hook body is still on the stack.
    fn invoke_sink<R, F>(&self, call: F) -> StreamResult<R>
    where
        F: FnOnce(&mut dyn DynWritableSink<T>, WritableStreamDefaultController) -> R,
    {
        let controller = self.controller();
        match self.shared.sink.try_borrow_mut() {
            Ok(mut sink) => Ok(call(&mut **sink, controller)),
            Err(_) => Err(StreamError::type_error(
                "underlying sink is already running a hook",
            )),
        }
    }

    fn invoke_sink_hook<F>(&self, call: F) -> HookFuture
    where
        F: FnOnce(&mut dyn DynWritableSink<T>) -> HookFuture,
    {
        self.invoke_sink(|sink, _| call(sink))
            .unwrap_or_else(|error| future::ready(Err(error)).boxed_local())
    }

    // ----------- Public surface -----------

    pub fn state(&self) -> WritableState {
        self.shared.inner.borrow().state
    }

    pub fn ready(&self) -> Promise {
        self.shared.inner.borrow().ready.clone()
    }

    pub fn closed(&self) -> Promise {
        self.shared.inner.borrow().closed.clone()
    }

    /// Queue `chunk`. The returned promise settles once the sink has
    /// accepted it, or rejects if the stream errors first.
    pub fn write(&self, chunk: T) -> Promise {
        {
            let inner = self.shared.inner.borrow();
            match inner.state {
                WritableState::Closing => {
                    return Promise::rejected(StreamError::type_error(
                        "cannot write while stream is closing",
                    ));
                }
                WritableState::Closed => {
                    return Promise::rejected(StreamError::type_error(
                        "cannot write after stream is closed",
                    ));
                }
                WritableState::Errored => return Promise::rejected(inner.get_stored_error()),
                WritableState::Writable | WritableState::Waiting => {}
            }
        }

        let size = match self.shared.strategy.size(&chunk) {
            Ok(size) => size,
            Err(error) => {
                warn!(%error, "queuing strategy size failed");
                self.error(error.clone());
                return Promise::rejected(error);
            }
        };

        let settlement = Promise::pending();
        let record = WriteRecord::Chunk {
            chunk: Some(chunk),
            settlement: settlement.clone(),
        };
        let enqueued = self.shared.inner.borrow_mut().queue.enqueue(record, size);
        if let Err(error) = enqueued {
            warn!(%error, "rejected chunk size");
            self.error(error.clone());
            return Promise::rejected(error);
        }
        self.shared.inner.borrow_mut().last_write = Some(settlement.clone());

        if let Err(error) = self.sync_state_with_queue() {
            warn!(%error, "queuing strategy backpressure check failed");
            self.error(error);
            return settlement;
        }

        self.call_or_schedule_advance();
        settlement
    }

    /// Close once every queued write has reached the sink. Returns `closed`.
    pub fn close(&self) -> Promise {
        let closed = {
            let mut inner = self.shared.inner.borrow_mut();
            match inner.state {
                WritableState::Closing => {
                    return Promise::rejected(StreamError::type_error(
                        "cannot close an already-closing stream",
                    ));
                }
                WritableState::Closed => {
                    return Promise::rejected(StreamError::type_error(
                        "cannot close an already-closed stream",
                    ));
                }
                WritableState::Errored => return Promise::rejected(inner.get_stored_error()),
                WritableState::Waiting => {
                    inner.ready.resolve();
                }
                WritableState::Writable => {}
            }

            inner.state = WritableState::Closing;
            if let Err(error) = inner.queue.enqueue(WriteRecord::Close, 0.0) {
                return Promise::rejected(error);
            }
            debug!("writable stream closing");
            inner.closed.clone()
        };

        self.call_or_schedule_advance();
        closed
    }

    /// Error the stream with `reason` right away, then tell the sink.
    pub fn abort(&self, reason: StreamError) -> Promise {
        {
            let inner = self.shared.inner.borrow();
            match inner.state {
                WritableState::Closed => return Promise::resolved(),
                WritableState::Errored => return Promise::rejected(inner.get_stored_error()),
                _ => {}
            }
        }

        debug!(%reason, "writable stream aborted");
        self.error(reason.clone());

        let hook = self.invoke_sink_hook(|sink| sink.abort_dyn(reason));
        let result = Promise::pending();
        let settle = result.clone();
        self.shared.spawner.spawn(async move {
            settle.settle(hook.await);
        });
        result
    }

    // ----------- Abstract operations -----------

    pub(crate) fn error(&self, error: StreamError) {
        self.shared.inner.borrow_mut().error(error);
    }

    fn sync_state_with_queue(&self) -> StreamResult<()> {
        let (state, queue_size) = {
            let inner = self.shared.inner.borrow();
            (inner.state, inner.queue.total_size())
        };
        if !matches!(state, WritableState::Writable | WritableState::Waiting) {
            return Ok(());
        }

        let backpressure = self.shared.strategy.should_apply_backpressure(queue_size)?;

        let mut inner = self.shared.inner.borrow_mut();
        match (backpressure, inner.state) {
            (true, WritableState::Writable) => {
                inner.state = WritableState::Waiting;
                inner.ready = Promise::pending();
                debug!(queue_size, "writable stream is waiting");
            }
            (false, WritableState::Waiting) => {
                inner.state = WritableState::Writable;
                inner.ready.resolve();
                debug!(queue_size, "writable stream became writable");
            }
            _ => {}
        }
        Ok(())
    }

    fn call_or_schedule_advance(&self) {
        let started = self.shared.inner.borrow().started.clone();
        if started.is_fulfilled() {
            self.advance_queue();
        } else if started.is_pending() {
            let stream = self.clone();
            self.shared.spawner.spawn(async move {
                if started.await.is_ok() {
                    stream.advance_queue();
                }
            });
        }
    }

    fn advance_queue(&self) {
        let head = {
            let mut inner = self.shared.inner.borrow_mut();
            if inner.queue.is_empty() || inner.writing {
                return;
            }
            let head = match inner.queue.peek_mut() {
                Some(WriteRecord::Close) => Head::Close,
                Some(WriteRecord::Chunk { chunk, settlement }) => match chunk.take() {
                    Some(chunk) => Head::Write(chunk, settlement.clone()),
                    None => return,
                },
                None => return,
            };
            match head {
                Head::Close => {
                    debug_assert_eq!(inner.state, WritableState::Closing);
                    inner.queue.dequeue();
                    debug_assert!(inner.queue.is_empty(), "close must be the last record");
                }
                Head::Write(..) => inner.writing = true,
            }
            head
        };

        match head {
            Head::Close => self.close_sink(),
            Head::Write(chunk, settlement) => self.write_to_sink(chunk, settlement),
        }
    }

    fn write_to_sink(&self, chunk: T, settlement: Promise) {
        trace!("writing chunk to sink");
        let hook = self.invoke_sink_hook(|sink| sink.write_dyn(chunk));
        let stream = self.clone();
        self.shared.spawner.spawn(async move {
            if let Err(error) = hook.await {
                warn!(%error, "writable sink write failed");
                stream.error(error);
                return;
            }

            {
                let mut inner = stream.shared.inner.borrow_mut();
                if inner.state == WritableState::Errored {
                    return;
                }
                inner.writing = false;
            }
            settlement.resolve();
            stream.shared.inner.borrow_mut().queue.dequeue();

            if let Err(error) = stream.sync_state_with_queue() {
                warn!(%error, "queuing strategy backpressure check failed");
                stream.error(error);
                return;
            }
            stream.advance_queue();
        });
    }

    fn close_sink(&self) {
        trace!("closing sink");
        let hook = self.invoke_sink_hook(|sink| sink.close_dyn());
        let stream = self.clone();
        self.shared.spawner.spawn(async move {
            if let Err(error) = hook.await {
                warn!(%error, "writable sink close failed");
                stream.error(error);
                return;
            }

            let mut inner = stream.shared.inner.borrow_mut();
            if inner.state == WritableState::Errored {
                return;
            }
            inner.closed.resolve();
            inner.state = WritableState::Closed;
            debug!("writable stream closed");
        });
    }
}

// ----------- Sink Trait Implementation -----------

/// `poll_ready` honours backpressure, `poll_flush` waits for the most
/// recent write, `poll_close` closes and waits for `closed`.
impl<T: 'static> Sink<T> for WritableStream<T> {
    type Error = StreamError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        let this = self.get_mut();
        loop {
            let (state, ready) = {
                let inner = this.shared.inner.borrow();
                match inner.state {
                    WritableState::Errored => return Poll::Ready(Err(inner.get_stored_error())),
                    state => (state, inner.ready.clone()),
                }
            };
            match state {
                WritableState::Writable => return Poll::Ready(Ok(())),
                WritableState::Closing | WritableState::Closed => {
                    return Poll::Ready(Err(StreamError::type_error(
                        "cannot write to a closing or closed stream",
                    )));
                }
                _ => match ready.poll_retained(&mut this.sink_wait, cx) {
                    Poll::Ready(_) => continue,
                    Poll::Pending => return Poll::Pending,
                },
            }
        }
    }

    fn start_send(self: Pin<&mut Self>, item: T) -> StreamResult<()> {
        match self.write(item).outcome() {
            Some(Err(error)) => Err(error),
            _ => Ok(()),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        let this = self.get_mut();
        let last_write = {
            let inner = this.shared.inner.borrow();
            if inner.state == WritableState::Errored {
                return Poll::Ready(Err(inner.get_stored_error()));
            }
            inner.last_write.clone()
        };
        match last_write {
            Some(last_write) => last_write.poll_retained(&mut this.sink_wait, cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        let this = self.get_mut();
        if matches!(this.state(), WritableState::Writable | WritableState::Waiting) {
            let _ = this.close();
        }
        this.closed().poll_retained(&mut this.sink_wait, cx)
    }
}

// ----------- Builder Pattern Implementation -----------
pub struct WritableStreamBuilder<T: 'static, Sink> {
    sink: Sink,
    strategy: BoxedStrategy<T>,
    _phantom: PhantomData<T>,
}

impl<T: 'static, Sink: WritableSink<T>> WritableStreamBuilder<T, Sink> {
    fn new(sink: Sink) -> Self {
        Self {
            sink,
            strategy: Box::new(CountQueuingStrategy::with_valid_high_water_mark(0.0)),
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

    /// Build the stream, scheduling continuations with `spawn_fn`. Only the
    /// initial backpressure check can fail here; start failures error the
    /// returned stream instead.
    pub fn spawn<F, R>(self, spawn_fn: F) -> StreamResult<WritableStream<T>>
    where
        F: Fn(PlatformBoxFuture<'static, ()>) -> R + 'static,
    {
        self.spawn_with(Spawner::new(spawn_fn))
    }

    pub fn spawn_with(self, spawner: Spawner) -> StreamResult<WritableStream<T>> {
        WritableStream::new_inner(Box::new(self.sink), self.strategy, spawner)
    }
}
