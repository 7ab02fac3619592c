use super::{StreamResult, error::StreamError};
use crate::platform::SharedPtr;
use futures::future::{self, Either, FutureExt};
use std::{
    cell::RefCell,
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
};

// ----------- WakerSet -----------

/// Wakers keyed by the promise handle that registered them, so a handle
/// dropped before settlement can take its waker back out.
#[derive(Default)]
struct WakerSet {
    next_key: usize,
    wakers: Vec<(usize, Waker)>,
}

impl WakerSet {
    fn register(&mut self, key: Option<usize>, waker: &Waker) -> usize {
        if let Some(key) = key {
            if let Some((_, registered)) = self.wakers.iter_mut().find(|(k, _)| *k == key) {
                if !registered.will_wake(waker) {
                    *registered = waker.clone();
                }
                return key;
            }
        }
        let key = self.next_key;
        self.next_key += 1;
        self.wakers.push((key, waker.clone()));
        key
    }

    fn remove(&mut self, key: usize) {
        self.wakers.retain(|(k, _)| *k != key);
    }

    fn take(&mut self) -> Vec<Waker> {
        std::mem::take(&mut self.wakers)
            .into_iter()
            .map(|(_, waker)| waker)
            .collect()
    }

    fn len(&self) -> usize {
        self.wakers.len()
    }
}

struct Slot {
    outcome: Option<StreamResult<()>>,
    wakers: WakerSet,
}

/// Handle to a single-shot settlement cell.
///
/// Clones share the cell, so a stream can hand out the same `ready` or
/// `closed` promise to every caller until the state transition that replaces
/// it. Awaiting a promise yields its outcome; awaiting it again (or a clone)
/// yields the same outcome.
pub struct Promise {
    slot: SharedPtr<RefCell<Slot>>,
    listener: Option<usize>,
}

impl Promise {
    fn from_slot(slot: Slot) -> Self {
        Self {
            slot: SharedPtr::new(RefCell::new(slot)),
            listener: None,
        }
    }

    pub fn pending() -> Self {
        Self::from_slot(Slot {
            outcome: None,
            wakers: WakerSet::default(),
        })
    }

    pub fn resolved() -> Self {
        Self::settled(Ok(()))
    }

    pub fn rejected(error: StreamError) -> Self {
        Self::settled(Err(error))
    }

    pub fn settled(outcome: StreamResult<()>) -> Self {
        Self::from_slot(Slot {
            outcome: Some(outcome),
            wakers: WakerSet::default(),
        })
    }

    /// True when both handles refer to the same cell.
    pub fn ptr_eq(&self, other: &Promise) -> bool {
        SharedPtr::ptr_eq(&self.slot, &other.slot)
    }

    pub fn is_settled(&self) -> bool {
        self.slot.borrow().outcome.is_some()
    }

    pub fn is_pending(&self) -> bool {
        !self.is_settled()
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self.slot.borrow().outcome, Some(Ok(())))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.slot.borrow().outcome, Some(Err(_)))
    }

    /// Outcome without waiting, `None` while pending.
    pub fn outcome(&self) -> Option<StreamResult<()>> {
        self.slot.borrow().outcome.clone()
    }

    pub(crate) fn resolve(&self) -> bool {
        self.settle(Ok(()))
    }

    pub(crate) fn reject(&self, error: StreamError) -> bool {
        self.settle(Err(error))
    }

    /// Settle the cell. Returns `false` and leaves the outcome untouched if it
    /// was already settled.
    pub(crate) fn settle(&self, outcome: StreamResult<()>) -> bool {
        let wakers = {
            let mut slot = self.slot.borrow_mut();
            if slot.outcome.is_some() {
                return false;
            }
            slot.outcome = Some(outcome);
            slot.wakers.take()
        };
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// Poll `self` through `held`, keeping the registered handle alive between
    /// polls. For poll-based callers that re-fetch the promise on every call.
    pub(crate) fn poll_retained(
        self,
        held: &mut Option<Promise>,
        cx: &mut Context<'_>,
    ) -> Poll<StreamResult<()>> {
        let promise = match held.take() {
            Some(previous) if previous.ptr_eq(&self) => held.insert(previous),
            _ => held.insert(self),
        };
        let poll = Pin::new(promise).poll(cx);
        if poll.is_ready() {
            *held = None;
        }
        poll
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.slot.borrow().wakers.len()
    }

    /// Settles with whichever of `a` or `b` settles first; `a` wins ties.
    pub fn race(a: Promise, b: Promise) -> impl Future<Output = StreamResult<()>> {
        future::select(a, b).map(|either| match either {
            Either::Left((outcome, _)) | Either::Right((outcome, _)) => outcome,
        })
    }
}

/// A clone shares the cell but not the waker registration.
impl Clone for Promise {
    fn clone(&self) -> Self {
        Self {
            slot: SharedPtr::clone(&self.slot),
            listener: None,
        }
    }
}

impl Drop for Promise {
    fn drop(&mut self) {
        if let Some(key) = self.listener.take() {
            if let Ok(mut slot) = self.slot.try_borrow_mut() {
                slot.wakers.remove(key);
            }
        }
    }
}

impl Future for Promise {
    type Output = StreamResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut slot = this.slot.borrow_mut();
        if let Some(outcome) = &slot.outcome {
            return Poll::Ready(outcome.clone());
        }
        this.listener = Some(slot.wakers.register(this.listener, cx.waker()));
        Poll::Pending
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.slot.borrow().outcome {
            None => f.write_str("Promise(pending)"),
            Some(Ok(())) => f.write_str("Promise(fulfilled)"),
            Some(Err(e)) => write!(f, "Promise(rejected: {e})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn clones_share_identity_and_outcome() {
        let promise = Promise::pending();
        let clone = promise.clone();

        assert!(promise.ptr_eq(&clone));
        assert!(!promise.ptr_eq(&Promise::pending()));
        assert!(clone.is_pending());

        assert!(promise.resolve());
        assert!(clone.is_fulfilled());
        assert_eq!(block_on(clone), Ok(()));
    }

    #[test]
    fn settles_only_once() {
        let promise = Promise::pending();
        let err: StreamError = "first".into();

        assert!(promise.reject(err.clone()));
        assert!(!promise.resolve());
        assert_eq!(promise.outcome(), Some(Err(err)));
    }

    #[test]
    fn wakes_waiters_on_settlement() {
        let mut pool = futures::executor::LocalPool::new();
        let promise = Promise::pending();
        let seen = SharedPtr::new(RefCell::new(None));

        let waiter = promise.clone();
        let seen_clone = seen.clone();
        futures::task::LocalSpawnExt::spawn_local(&pool.spawner(), async move {
            *seen_clone.borrow_mut() = Some(waiter.await);
        })
        .unwrap();

        pool.run_until_stalled();
        assert!(seen.borrow().is_none());

        promise.resolve();
        pool.run_until_stalled();
        assert_eq!(*seen.borrow(), Some(Ok(())));
    }

    #[test]
    fn repolling_one_handle_keeps_one_registration() {
        let promise = Promise::pending();
        let mut waiter = promise.clone();
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());

        for _ in 0..3 {
            assert!(Pin::new(&mut waiter).poll(&mut cx).is_pending());
        }
        assert_eq!(promise.listener_count(), 1);

        drop(waiter);
        assert_eq!(promise.listener_count(), 0);
    }

    #[test]
    fn losing_side_of_a_race_deregisters() {
        let mut pool = futures::executor::LocalPool::new();
        let long_lived = Promise::pending();

        for _ in 0..100 {
            let short = Promise::pending();
            let race = Promise::race(short.clone(), long_lived.clone());
            futures::task::LocalSpawnExt::spawn_local(&pool.spawner(), async move {
                let _ = race.await;
            })
            .unwrap();
            pool.run_until_stalled();
            assert_eq!(long_lived.listener_count(), 1);

            short.resolve();
            pool.run_until_stalled();
        }
        assert_eq!(long_lived.listener_count(), 0);
    }

    #[test]
    fn poll_retained_reuses_the_held_handle() {
        let promise = Promise::pending();
        let mut held = None;
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());

        for _ in 0..3 {
            assert!(promise.clone().poll_retained(&mut held, &mut cx).is_pending());
        }
        assert_eq!(promise.listener_count(), 1);

        promise.resolve();
        assert_eq!(promise.clone().poll_retained(&mut held, &mut cx), Poll::Ready(Ok(())));
        assert!(held.is_none());
    }

    #[test]
    fn race_takes_the_first_settlement() {
        let a = Promise::pending();
        let b = Promise::rejected("b".into());
        assert!(block_on(Promise::race(a, b)).is_err());

        let a = Promise::resolved();
        let b = Promise::rejected("b".into());
        assert_eq!(block_on(Promise::race(a, b)), Ok(()));
    }
}
