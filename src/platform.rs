//! Platform type aliases and the spawn handle
//!
//! Streams are single-threaded: every handle is `Rc`-based and every hook
//! future is a local future. Nothing here requires `Send` or `Sync`.

use futures::{
    executor::LocalSpawner,
    future::LocalBoxFuture,
    task::LocalSpawnExt,
};
use std::future::Future;
use tracing::warn;

pub use std::rc::Rc as SharedPtr;
pub use std::rc::Weak as WeakPtr;

/// Boxed local future used for type-erased hook results.
pub type PlatformBoxFuture<'a, T> = LocalBoxFuture<'a, T>;

/// Boxed queuing strategy trait object.
pub type BoxedStrategy<T> = Box<dyn crate::streams::QueuingStrategy<T> + 'static>;

/// Handle used to schedule continuations that run after a hook settles.
///
/// Built from any spawn function, e.g. `tokio::task::spawn_local` or a
/// closure around `futures::executor::LocalSpawner`.
#[derive(Clone)]
pub struct Spawner(SharedPtr<dyn Fn(PlatformBoxFuture<'static, ()>)>);

impl Spawner {
    pub fn new<F, R>(spawn_fn: F) -> Self
    where
        F: Fn(PlatformBoxFuture<'static, ()>) -> R + 'static,
    {
        Self(SharedPtr::new(move |fut| {
            let _ = spawn_fn(fut);
        }))
    }

    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + 'static,
    {
        (self.0)(Box::pin(fut))
    }
}

impl From<LocalSpawner> for Spawner {
    fn from(spawner: LocalSpawner) -> Self {
        Self::new(move |fut| {
            if let Err(error) = spawner.spawn_local(fut) {
                warn!(%error, "executor is shut down, continuation dropped");
            }
        })
    }
}

impl std::fmt::Debug for Spawner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Spawner")
    }
}
