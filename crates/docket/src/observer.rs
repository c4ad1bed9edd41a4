//! Multi-subscriber change hooks.
//!
//! Subscribers choose a [Delivery]. `Immediate` subscribers see every change
//! as it happens. `AfterCommit` subscribers get their events buffered while
//! the history batches work (an open transaction, or an undo/redo replay);
//! the buffer is coalesced into one event and flushed when the batch commits,
//! or discarded when it rolls back.

use std::{
    collections::{btree_map::Entry, BTreeMap},
    fmt::Debug,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;

use crate::history::History;

pub type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Delivery {
    #[default]
    Immediate,
    /// Regard the in-progress transaction: deliver once, after it commits.
    AfterCommit,
}

/// Folds a later event into an earlier one while delivery is deferred.
pub trait Coalesce {
    fn coalesce(&mut self, later: Self);
}

/// Buffered deliveries the history flushes or discards at the end of a batch.
pub(crate) trait DeferredDelivery: Send + Sync {
    fn flush(&self);
    fn discard(&self);
}

struct Subscriber<E> {
    callback: Callback<E>,
    delivery: Delivery,
}

struct ObserverState<E> {
    subscribers: BTreeMap<usize, Subscriber<E>>,
    pending: BTreeMap<usize, E>,
    next_subscriber_id: usize,
    queued: bool,
}

struct ObserverSet<E> {
    state: Mutex<ObserverState<E>>,
}

pub struct Observers<E> {
    inner: Arc<ObserverSet<E>>,
}

impl<E> Debug for Observers<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Observers")
            .field("subscribers", &state.subscribers.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl<E> Default for Observers<E>
where
    E: Coalesce + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Observers<E>
where
    E: Coalesce + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ObserverSet {
                state: Mutex::new(ObserverState {
                    subscribers: BTreeMap::new(),
                    pending: BTreeMap::new(),
                    next_subscriber_id: 0,
                    queued: false,
                }),
            }),
        }
    }

    pub fn subscribe(
        &self,
        delivery: Delivery,
        callback: impl Fn(&E) + Send + Sync + 'static,
    ) -> Subscription {
        let mut state = self.inner.state.lock();
        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;
        state.subscribers.insert(
            id,
            Subscriber {
                callback: Arc::new(callback),
                delivery,
            },
        );
        drop(state);

        let set: Weak<ObserverSet<E>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(set) = set.upgrade() {
                let mut state = set.state.lock();
                state.subscribers.remove(&id);
                state.pending.remove(&id);
            }
        })
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Notifies subscribers of a committed mutation.
    ///
    /// No lock is held while callbacks run, so callbacks may read the node
    /// that emitted the event or (un)subscribe.
    pub fn emit(&self, event: E, history: Option<&History>) {
        let batching = history.map(|h| h.is_batching()).unwrap_or(false);
        let mut immediate: Vec<Callback<E>> = Vec::new();
        let mut enqueue = false;
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if state.subscribers.is_empty() {
                return;
            }

            for (id, sub) in state.subscribers.iter() {
                if batching && sub.delivery == Delivery::AfterCommit {
                    match state.pending.entry(*id) {
                        Entry::Vacant(v) => {
                            v.insert(event.clone());
                        }
                        Entry::Occupied(mut o) => o.get_mut().coalesce(event.clone()),
                    }
                } else {
                    immediate.push(sub.callback.clone());
                }
            }

            if !state.pending.is_empty() && !state.queued {
                state.queued = true;
                enqueue = true;
            }
        }

        if enqueue {
            if let Some(history) = history {
                history.defer(self.inner.clone());
            }
        }

        for callback in immediate {
            callback(&event);
        }
    }
}

impl<E> DeferredDelivery for ObserverSet<E>
where
    E: Send + Sync + 'static,
{
    fn flush(&self) {
        let ready: Vec<(Callback<E>, E)> = {
            let mut state = self.state.lock();
            state.queued = false;
            let pending = std::mem::take(&mut state.pending);
            pending
                .into_iter()
                .filter_map(|(id, event)| {
                    state
                        .subscribers
                        .get(&id)
                        .map(|sub| (sub.callback.clone(), event))
                })
                .collect()
        };

        for (callback, event) in ready {
            callback(&event);
        }
    }

    fn discard(&self) {
        let mut state = self.state.lock();
        state.queued = false;
        state.pending.clear();
    }
}

/// Keeps a subscription alive. Dropping it unsubscribes.
#[must_use]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

impl Subscription {
    fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Keeps the callback registered for as long as the emitter lives.
    pub fn detach(mut self) {
        self.unsubscribe.take();
    }

    pub fn unsubscribe(self) {
        drop(self)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}
