//! Per-path subscription registry
//!
//! A `Watchpoint` remembers which event categories every subscriber of one
//! watched path asked for, keeps the union of those requests up to date so a
//! backend knows what to ask the OS for, and fans incoming events out to the
//! matching subscribers without ever blocking on a slow one.

use std::collections::hash_map::{Entry, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use crate::event::{Event, EventDiff, EventInfo, RECURSIVE};

/// Process-unique identity of a subscriber handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Sending half of a subscription. Clones share the same identity, so a
/// clone can be used to remove what the original added.
pub struct Subscriber<T> {
    id: SubscriberId,
    sender: SyncSender<T>,
}

impl<T> Subscriber<T> {
    /// Create a handle backed by a bounded queue of `capacity` events.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero: a rendezvous queue would make every
    /// non-blocking send fail.
    pub fn channel(capacity: usize) -> (Self, Receiver<T>) {
        assert!(capacity > 0, "subscriber queue capacity must be greater than 0");
        let (sender, receiver) = mpsc::sync_channel(capacity);
        let subscriber = Self {
            id: SubscriberId::next(),
            sender,
        };
        (subscriber, receiver)
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            sender: self.sender.clone(),
        }
    }
}

impl<T> fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber").field("id", &self.id).finish()
    }
}

struct Slot<T> {
    sender: SyncSender<T>,
    mask: Event,
}

/// Subscription registry of a single watch point.
///
/// There is no locking inside: `add`/`del` need `&mut self` and `dispatch`
/// needs `&self`. Whoever owns the watch point is responsible for excluding
/// mutations while a dispatch runs; [`SharedWatchpoint`] does that with one
/// `RwLock` per watch point.
pub struct Watchpoint<T> {
    subscribers: HashMap<SubscriberId, Slot<T>>,
    /// Union of every subscriber mask and the recursive aggregate. May carry
    /// the recursive marker.
    total: Event,
    /// Synthetic entry collecting recursive interest that a non-recursive
    /// backend has to emulate. Always carries the marker when present.
    recursive: Option<Event>,
}

impl<T> Default for Watchpoint<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Watchpoint<T> {
    pub fn new() -> Self {
        Self {
            subscribers: HashMap::new(),
            total: Event::empty(),
            recursive: None,
        }
    }

    /// What `add` would do to the aggregate for `event`, without touching
    /// any state.
    pub fn diff(&self, event: Event) -> EventDiff {
        let event = event.stripped();
        if self.total.contains(event) {
            return EventDiff::Unchanged;
        }
        EventDiff::between(self.total, self.total.union(event))
    }

    /// Register `event` for `subscriber`, merging with anything it already
    /// asked for.
    ///
    /// # Panics
    ///
    /// Panics if `event` is empty.
    pub fn add(&mut self, subscriber: &Subscriber<T>, event: Event) -> EventDiff {
        assert!(!event.is_empty(), "cannot subscribe {} to an empty event mask", subscriber.id);

        let slot = self.subscribers.entry(subscriber.id).or_insert_with(|| Slot {
            sender: subscriber.sender.clone(),
            mask: Event::empty(),
        });
        slot.mask.insert(event);
        self.grow(event)
    }

    /// Like `add`, but the subscriber also receives events that only matter
    /// to recursive watchers (see `dispatch`).
    ///
    /// # Panics
    ///
    /// Panics if `event` is empty.
    pub fn add_subtree(&mut self, subscriber: &Subscriber<T>, event: Event) -> EventDiff {
        assert!(!event.stripped().is_empty(), "cannot subscribe {} to an empty event mask", subscriber.id);
        self.add(subscriber, event.with_recursive())
    }

    /// Drop `event` from `subscriber`. A subscriber left with an empty mask
    /// is forgotten. The aggregate is rebuilt from scratch, another
    /// subscriber may still need the removed categories.
    pub fn del(&mut self, subscriber: &Subscriber<T>, event: Event) -> EventDiff {
        if let Entry::Occupied(mut slot) = self.subscribers.entry(subscriber.id) {
            slot.get_mut().mask.remove(event);
            if slot.get().mask.is_empty() {
                slot.remove();
            }
        }
        self.recompute()
    }

    /// Inverse of `add_subtree`. The recursive marker goes away together with
    /// the last real category, so the subscriber does not linger.
    pub fn del_subtree(&mut self, subscriber: &Subscriber<T>, event: Event) -> EventDiff {
        let event = match self.subscribers.get(&subscriber.id) {
            Some(slot) => with_trailing_marker(slot.mask, event),
            None => event,
        };
        self.del(subscriber, event)
    }

    /// Record recursive interest in `event` on the synthetic recursive entry.
    ///
    /// # Panics
    ///
    /// Panics if `event` is empty.
    pub fn add_recursive(&mut self, event: Event) -> EventDiff {
        assert!(!event.stripped().is_empty(), "cannot add an empty recursive event mask");

        let event = event.with_recursive();
        let mask = self.recursive.get_or_insert(RECURSIVE);
        mask.insert(event);
        self.grow(event)
    }

    pub fn del_recursive(&mut self, event: Event) -> EventDiff {
        if let Some(mask) = self.recursive {
            let left = mask.difference(with_trailing_marker(mask, event));
            self.recursive = if left.is_empty() { None } else { Some(left) };
        }
        self.recompute()
    }

    /// Aggregate of all requests, without the recursive marker.
    pub fn total(&self) -> Event {
        self.total.stripped()
    }

    /// Whether any recursive interest (synthetic or from a subtree
    /// subscriber) is active.
    pub fn is_recursive(&self) -> bool {
        self.total.has_recursive()
    }

    /// Raw mask of the synthetic recursive entry, marker included.
    pub fn recursive_mask(&self) -> Option<Event> {
        self.recursive
    }

    pub fn mask_of(&self, subscriber: &Subscriber<T>) -> Option<Event> {
        self.subscribers.get(&subscriber.id).map(|slot| slot.mask.stripped())
    }

    pub fn is_subtree(&self, subscriber: &Subscriber<T>) -> bool {
        self.subscribers
            .get(&subscriber.id)
            .map_or(false, |slot| slot.mask.has_recursive())
    }

    /// Number of real subscribers.
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    /// True once nothing, real or synthetic, is registered. The watch point
    /// can then be dropped.
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty() && self.recursive.is_none()
    }

    fn grow(&mut self, event: Event) -> EventDiff {
        let old = self.total;
        self.total = old.union(event);
        self.report(old)
    }

    fn recompute(&mut self) -> EventDiff {
        let old = self.total;
        let base = self.recursive.unwrap_or(Event::empty());
        self.total = self
            .subscribers
            .values()
            .fold(base, |total, slot| total.union(slot.mask));
        self.report(old)
    }

    fn report(&self, old: Event) -> EventDiff {
        let diff = EventDiff::between(old, self.total);
        if let EventDiff::Changed { old, new } = diff {
            tracing::debug!("Watch point mask changed: {:?} -> {:?}", old, new);
        }
        diff
    }
}

impl<T: EventInfo + Clone> Watchpoint<T> {
    /// Hand `info` to every subscriber whose mask covers its categories.
    ///
    /// With `recursive_only` set the event comes from below the watched
    /// directory of a backend that cannot filter subtrees itself, so only
    /// subtree subscribers get it. Sends never block: a full or closed queue
    /// loses the event for that subscriber alone. Returns how many
    /// subscribers received it.
    ///
    /// An event carrying no category reaches nobody, even though every mask
    /// trivially contains the empty set. A recursive marker on `info` itself
    /// is ignored; only `recursive_only` restricts delivery to subtrees.
    pub fn dispatch(&self, info: &T, recursive_only: bool) -> usize {
        let mut event = info.event().stripped();
        if event.is_empty() {
            return 0;
        }
        if recursive_only {
            event = event.with_recursive();
        }
        if !self.total.contains(event) {
            return 0;
        }

        let mut delivered = 0;
        for (id, slot) in &self.subscribers {
            if !slot.mask.contains(event) {
                continue;
            }
            match slot.sender.try_send(info.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::trace!("Subscriber {} is too slow, dropping event", id);
                }
                Err(TrySendError::Disconnected(_)) => {
                    tracing::trace!("Subscriber {} hung up, dropping event", id);
                }
            }
        }
        delivered
    }
}

/// `event` extended with the recursive marker when removing it from `mask`
/// would leave the marker on its own.
fn with_trailing_marker(mask: Event, event: Event) -> Event {
    if event.with_recursive().contains(mask) {
        event.with_recursive()
    } else {
        event
    }
}

/// A watch point guarded by its own lock, for sharing between the thread
/// that manages subscriptions and the backend thread that dispatches.
///
/// Mutations take the write half, dispatch the read half: dispatches run
/// concurrently with each other but never with an add or del.
pub struct SharedWatchpoint<T> {
    inner: RwLock<Watchpoint<T>>,
}

impl<T> Default for SharedWatchpoint<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SharedWatchpoint<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Watchpoint::new()),
        }
    }

    // The registry is consistent between calls, a panic elsewhere while the
    // lock was held cannot leave it half-updated.
    pub fn read(&self) -> RwLockReadGuard<'_, Watchpoint<T>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Watchpoint<T>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: EventInfo + Clone> SharedWatchpoint<T> {
    pub fn dispatch(&self, info: &T, recursive_only: bool) -> usize {
        self.read().dispatch(info, recursive_only)
    }
}
