#![allow(dead_code)]

use std::{cell::RefCell, future::Future, rc::Rc};
use whatwg_streams_draft::{StreamResult, WritableSink};

/// Route stream logs to the test writer. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Sink that records every chunk it is handed.
pub struct Collect<T>(pub Rc<RefCell<Vec<T>>>);

impl<T> Clone for Collect<T> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<T> Collect<T> {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(Vec::new())))
    }
}

impl<T: Clone> Collect<T> {
    pub fn chunks(&self) -> Vec<T> {
        self.0.borrow().clone()
    }
}

impl<T: 'static> WritableSink<T> for Collect<T> {
    fn write(&mut self, chunk: T) -> impl Future<Output = StreamResult<()>> + 'static {
        self.0.borrow_mut().push(chunk);
        futures::future::ready(Ok(()))
    }
}
