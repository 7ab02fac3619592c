use super::{
    error::StreamError,
    pipe::ReadableWritablePair,
    promise::Promise,
    readable::{ReadableSource, ReadableState, ReadableStream, ReadableStreamDefaultController},
    writable::{WritableSink, WritableStream, WritableStreamDefaultController},
    CountQueuingStrategy, QueuingStrategy, StreamResult,
};
use crate::platform::{BoxedStrategy, PlatformBoxFuture, SharedPtr, Spawner};
use futures::future;
use std::{
    cell::{Cell, RefCell},
    fmt,
    future::Future,
    marker::PhantomData,
};
use tracing::{trace, warn};

/// User logic sitting between the writable and readable halves of a
/// [`TransformStream`].
///
/// `transform` is handed one chunk at a time and must eventually call
/// [`TransformStreamDefaultController::done`]; the next chunk is not
/// delivered before that. Returning `Err` errors both halves.
pub trait Transformer<I: 'static, O: 'static>: 'static {
    fn transform(&mut self, chunk: I, controller: TransformStreamDefaultController<O>)
    -> StreamResult<()>;

    /// Runs when the writable half closes. Closes the readable half by default.
    fn flush(&mut self, controller: TransformStreamDefaultController<O>) -> StreamResult<()> {
        controller.close();
        Ok(())
    }
}

impl<I, O, F> Transformer<I, O> for F
where
    I: 'static,
    O: 'static,
    F: FnMut(I, TransformStreamDefaultController<O>) -> StreamResult<()> + 'static,
{
    fn transform(
        &mut self,
        chunk: I,
        controller: TransformStreamDefaultController<O>,
    ) -> StreamResult<()> {
        self(chunk, controller)
    }
}

/// Passes every chunk through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTransformer;

impl IdentityTransformer {
    pub fn new() -> Self {
        Self
    }
}

impl<T: 'static> Transformer<T, T> for IdentityTransformer {
    fn transform(
        &mut self,
        chunk: T,
        controller: TransformStreamDefaultController<T>,
    ) -> StreamResult<()> {
        controller.enqueue(chunk)?;
        controller.done();
        Ok(())
    }
}

// ----------- Shared bookkeeping -----------

#[derive(Default)]
struct TransformFlags {
    transforming: Cell<bool>,
    chunk_pending: Cell<bool>,
    write_done: RefCell<Option<Promise>>,
    writable: RefCell<Option<WritableStreamDefaultController>>,
}

impl TransformFlags {
    fn done(&self) {
        self.transforming.set(false);
        self.chunk_pending.set(false);
        if let Some(write_done) = self.write_done.borrow_mut().take() {
            write_done.resolve();
        }
        trace!("transform done");
    }

    fn error_writable(&self, error: StreamError) {
        if let Some(writable) = self.writable.borrow().as_ref() {
            writable.error(error);
        }
    }
}

// ----------- Controller -----------

/// Capability handed to a [`Transformer`]: push output, close or error the
/// readable half, and signal that the current chunk is finished.
pub struct TransformStreamDefaultController<O: 'static> {
    readable: ReadableStreamDefaultController<O>,
    flags: SharedPtr<TransformFlags>,
}

impl<O: 'static> Clone for TransformStreamDefaultController<O> {
    fn clone(&self) -> Self {
        Self {
            readable: self.readable.clone(),
            flags: SharedPtr::clone(&self.flags),
        }
    }
}

impl<O: 'static> TransformStreamDefaultController<O> {
    pub fn enqueue(&self, chunk: O) -> StreamResult<bool> {
        self.readable.enqueue(chunk)
    }

    pub fn close(&self) {
        self.readable.close();
    }

    /// Error both halves with the same error.
    pub fn error(&self, error: StreamError) {
        self.flags.error_writable(error.clone());
        self.readable.error(error);
    }

    /// The current chunk is fully handled: settle its write and accept the next one.
    pub fn done(&self) {
        self.flags.done();
    }
}

impl<O: 'static> fmt::Debug for TransformStreamDefaultController<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformStreamDefaultController")
            .field("readable", &self.readable.state())
            .field("transforming", &self.flags.transforming.get())
            .finish()
    }
}

struct TransformCore<I, O: 'static, Tr> {
    transformer: RefCell<Tr>,
    chunk: RefCell<Option<I>>,
    flags: SharedPtr<TransformFlags>,
    readable: RefCell<Option<ReadableStreamDefaultController<O>>>,
}

impl<I: 'static, O: 'static, Tr: Transformer<I, O>> TransformCore<I, O, Tr> {
    fn controller(&self) -> Option<TransformStreamDefaultController<O>> {
        let readable = self.readable.borrow().clone()?;
        Some(TransformStreamDefaultController {
            readable,
            flags: SharedPtr::clone(&self.flags),
        })
    }

    fn error_both(&self, error: StreamError) {
        self.flags.error_writable(error.clone());
        if let Some(readable) = self.readable.borrow().as_ref() {
            readable.error(error);
        }
    }

    fn maybe_do_transform(&self) {
        if self.flags.transforming.get() {
            return;
        }
        let Some(controller) = self.controller() else {
            return;
        };
        let Some(chunk) = self.chunk.borrow_mut().take() else {
            return;
        };

        self.flags.transforming.set(true);
        trace!("transforming chunk");
        let result = match self.transformer.try_borrow_mut() {
            Ok(mut transformer) => transformer.transform(chunk, controller),
            Err(_) => Err(StreamError::type_error("transformer is already running")),
        };
        if let Err(error) = result {
            warn!(%error, "transform failed");
            self.flags.transforming.set(false);
            self.error_both(error);
        }
    }

    fn flush(&self) -> StreamResult<()> {
        let Some(controller) = self.controller() else {
            return Ok(());
        };
        match self.transformer.try_borrow_mut() {
            Ok(mut transformer) => transformer.flush(controller),
            Err(_) => Err(StreamError::type_error("transformer is already running")),
        }
    }
}

// ----------- Halves -----------

struct TransformSink<I, O: 'static, Tr> {
    core: SharedPtr<TransformCore<I, O, Tr>>,
}

impl<I: 'static, O: 'static, Tr: Transformer<I, O>> WritableSink<I> for TransformSink<I, O, Tr> {
    fn start(
        &mut self,
        controller: WritableStreamDefaultController,
    ) -> StreamResult<impl Future<Output = StreamResult<()>> + 'static> {
        *self.core.flags.writable.borrow_mut() = Some(controller);
        Ok(future::ready(Ok(())))
    }

    fn write(&mut self, chunk: I) -> impl Future<Output = StreamResult<()>> + 'static {
        let core = &self.core;
        *core.chunk.borrow_mut() = Some(chunk);
        core.flags.chunk_pending.set(true);

        let write_done = Promise::pending();
        *core.flags.write_done.borrow_mut() = Some(write_done.clone());

        let readable_state = core
            .readable
            .borrow()
            .as_ref()
            .and_then(ReadableStreamDefaultController::state);
        if readable_state == Some(ReadableState::Waiting) {
            core.maybe_do_transform();
        }
        write_done
    }

    fn close(&mut self) -> impl Future<Output = StreamResult<()>> + 'static {
        let result = self.core.flush();
        if let Err(error) = &result {
            warn!(%error, "flush failed");
            self.core.error_both(error.clone());
        }
        future::ready(result)
    }
}

struct TransformSource<I, O: 'static, Tr> {
    core: SharedPtr<TransformCore<I, O, Tr>>,
}

impl<I: 'static, O: 'static, Tr: Transformer<I, O>> ReadableSource<O>
    for TransformSource<I, O, Tr>
{
    fn start(
        &mut self,
        controller: ReadableStreamDefaultController<O>,
    ) -> StreamResult<impl Future<Output = StreamResult<()>> + 'static> {
        *self.core.readable.borrow_mut() = Some(controller);
        Ok(future::ready(Ok(())))
    }

    fn pull(
        &mut self,
        _controller: ReadableStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>> + 'static {
        if self.core.flags.chunk_pending.get() {
            self.core.maybe_do_transform();
        }
        future::ready(Ok(()))
    }
}

// ----------- Main TransformStream -----------

/// A writable half feeding a readable half through a [`Transformer`].
pub struct TransformStream<I: 'static, O: 'static> {
    writable: WritableStream<I>,
    readable: ReadableStream<O>,
}

impl<I: 'static, O: 'static> TransformStream<I, O> {
    pub fn builder<Tr: Transformer<I, O>>(transformer: Tr) -> TransformStreamBuilder<I, O, Tr> {
        TransformStreamBuilder::new(transformer)
    }

    pub fn writable(&self) -> &WritableStream<I> {
        &self.writable
    }

    pub fn readable(&self) -> &ReadableStream<O> {
        &self.readable
    }

    pub fn split(self) -> (ReadableStream<O>, WritableStream<I>) {
        (self.readable, self.writable)
    }
}

impl<I: 'static, O: 'static> Clone for TransformStream<I, O> {
    fn clone(&self) -> Self {
        Self {
            writable: self.writable.clone(),
            readable: self.readable.clone(),
        }
    }
}

impl<I: 'static, O: 'static> fmt::Debug for TransformStream<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformStream")
            .field("writable", &self.writable)
            .field("readable", &self.readable)
            .finish()
    }
}

impl<I: 'static, O: 'static> ReadableWritablePair<I> for TransformStream<I, O> {
    type Output = O;
    type Writable = WritableStream<I>;

    fn into_parts(self) -> (WritableStream<I>, ReadableStream<O>) {
        (self.writable, self.readable)
    }
}

// ----------- Builder Pattern Implementation -----------
pub struct TransformStreamBuilder<I: 'static, O: 'static, Tr> {
    transformer: Tr,
    writable_strategy: BoxedStrategy<I>,
    readable_strategy: BoxedStrategy<O>,
    _phantom: PhantomData<(I, O)>,
}

impl<I: 'static, O: 'static, Tr: Transformer<I, O>> TransformStreamBuilder<I, O, Tr> {
    fn new(transformer: Tr) -> Self {
        Self {
            transformer,
            writable_strategy: Box::new(CountQueuingStrategy::with_valid_high_water_mark(0.0)),
            readable_strategy: Box::new(CountQueuingStrategy::with_valid_high_water_mark(1.0)),
            _phantom: PhantomData,
        }
    }

    pub fn writable_strategy<S: QueuingStrategy<I> + 'static>(mut self, s: S) -> Self {
        self.writable_strategy = Box::new(s);
        self
    }

    pub fn readable_strategy<S: QueuingStrategy<O> + 'static>(mut self, s: S) -> Self {
        self.readable_strategy = Box::new(s);
        self
    }

    pub fn spawn<F, R>(self, spawn_fn: F) -> StreamResult<TransformStream<I, O>>
    where
        F: Fn(PlatformBoxFuture<'static, ()>) -> R + 'static,
    {
        self.spawn_with(Spawner::new(spawn_fn))
    }

    pub fn spawn_with(self, spawner: Spawner) -> StreamResult<TransformStream<I, O>> {
        let core = SharedPtr::new(TransformCore {
            transformer: RefCell::new(self.transformer),
            chunk: RefCell::new(None),
            flags: SharedPtr::new(TransformFlags::default()),
            readable: RefCell::new(None),
        });

        let writable = WritableStream::builder(TransformSink {
            core: SharedPtr::clone(&core),
        })
        .boxed_strategy(self.writable_strategy)
        .spawn_with(spawner.clone())?;

        let readable = ReadableStream::builder(TransformSource { core })
            .boxed_strategy(self.readable_strategy)
            .spawn_with(spawner)?;

        Ok(TransformStream { writable, readable })
    }
}
