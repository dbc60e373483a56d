use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use anyhow::{Context, Result};
use notify::{RecursiveMode, Watcher};
use crate::event::{Event, EventDiff, FsEvent};
use crate::watchpoint::{SharedWatchpoint, Subscriber, SubscriberId, Watchpoint};

/// Watches one directory through `notify` and fans its events out to any
/// number of subscribers.
pub struct PathWatcher {
    inner: Arc<Inner>,
}

struct Inner {
    root: PathBuf,
    watchpoint: Arc<SharedWatchpoint<FsEvent>>,
    backend: Mutex<Backend>,
}

struct Backend {
    watcher: Box<dyn Watcher + Send>,
    armed: Option<RecursiveMode>,
    /// Categories each recursive subscription contributed to the synthetic
    /// recursive entry.
    recursive: HashMap<SubscriberId, Event>,
}

/// Receiving end of one subscription, returned by [`PathWatcher::subscribe`].
///
/// Dropping it releases the subscription like [`PathWatcher::unsubscribe`],
/// logging instead of returning a backend error.
pub struct Subscription {
    /// Empty once released.
    owner: Weak<Inner>,
    subscriber: Subscriber<FsEvent>,
    receiver: Receiver<FsEvent>,
    events: Event,
    recursive: bool,
}

impl PathWatcher {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let root = path
            .as_ref()
            .canonicalize()
            .with_context(|| format!("Failed to resolve watch path {}", path.as_ref().display()))?;

        let watchpoint = Arc::new(SharedWatchpoint::new());
        let dispatch_to = Arc::clone(&watchpoint);
        let route_root = root.clone();

        // Runs on the backend thread; only ever takes the read half of the lock.
        let watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                Ok(event) => route(&dispatch_to, &route_root, event),
                Err(err) => tracing::error!("File watcher error: {}", err),
            }
        })
        .context("Failed to create file system watcher")?;

        Ok(Self::with_watcher(root, watchpoint, Box::new(watcher)))
    }

    fn with_watcher(
        root: PathBuf,
        watchpoint: Arc<SharedWatchpoint<FsEvent>>,
        watcher: Box<dyn Watcher + Send>,
    ) -> Self {
        let inner = Inner {
            root,
            watchpoint,
            backend: Mutex::new(Backend {
                watcher,
                armed: None,
                recursive: HashMap::new(),
            }),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn watchpoint(&self) -> &SharedWatchpoint<FsEvent> {
        &self.inner.watchpoint
    }

    /// Start delivering `events` to a new subscriber with room for
    /// `capacity` undelivered events. A recursive subscription also sees
    /// changes anywhere below the root.
    ///
    /// If the backend refuses the new watch the subscription is rolled back
    /// and the previous watch is restored.
    ///
    /// # Panics
    ///
    /// Panics if `events` is empty or `capacity` is zero.
    pub fn subscribe(&self, events: Event, recursive: bool, capacity: usize) -> Result<Subscription> {
        let (subscriber, receiver) = Subscriber::channel(capacity);
        let inner = &self.inner;
        let mut backend = inner.lock_backend();

        let (diff, mode) = {
            let mut wp = inner.watchpoint.write();
            if let EventDiff::Changed { old, new } = wp.diff(events) {
                tracing::debug!(
                    "Subscriber {} widens {} from {:?} to {:?}",
                    subscriber.id(),
                    inner.root.display(),
                    old,
                    new
                );
            }
            let diff = if recursive {
                let own = wp.add_subtree(&subscriber, events);
                backend.recursive.insert(subscriber.id(), events);
                merge(own, wp.add_recursive(events))
            } else {
                wp.add(&subscriber, events)
            };
            (diff, desired_mode(&wp))
        };

        let mut subscription = Subscription {
            owner: Arc::downgrade(inner),
            subscriber,
            receiver,
            events,
            recursive,
        };
        if let Err(err) = backend.rearm(&inner.root, diff, mode) {
            // Released here; dropping it must not touch the backend lock again.
            subscription.owner = Weak::new();
            let mode = inner.release(&mut backend, &subscription);
            if let Err(restore) = backend.rearm(&inner.root, EventDiff::Unchanged, mode) {
                tracing::error!("Failed to restore watch on {}: {:#}", inner.root.display(), restore);
            }
            tracing::debug!("Rolled back subscriber {}, watch mode now {:?}", subscription.id(), backend.armed);
            return Err(err);
        }
        Ok(subscription)
    }

    /// Stop delivering to `subscription`. Unwatches the root once nobody is
    /// left. A subscription of another watcher is released from that one.
    pub fn unsubscribe(&self, mut subscription: Subscription) -> Result<()> {
        if !Weak::ptr_eq(&subscription.owner, &Arc::downgrade(&self.inner)) {
            return Ok(());
        }
        subscription.owner = Weak::new();
        self.inner.unsubscribe(&subscription)
    }
}

impl Inner {
    fn lock_backend(&self) -> MutexGuard<'_, Backend> {
        self.backend.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unsubscribe(&self, subscription: &Subscription) -> Result<()> {
        let mut backend = self.lock_backend();
        let before = self.watchpoint.read().total();
        let mode = self.release(&mut backend, subscription);
        let diff = EventDiff::between(before, self.watchpoint.read().total());
        backend.rearm(&self.root, diff, mode)
    }

    fn release(&self, backend: &mut Backend, subscription: &Subscription) -> Option<RecursiveMode> {
        let mut wp = self.watchpoint.write();
        if subscription.recursive {
            wp.del_subtree(&subscription.subscriber, subscription.events);
            backend.recursive.remove(&subscription.id());

            // Categories another recursive subscription still needs stay.
            let needed = backend
                .recursive
                .values()
                .fold(Event::empty(), |acc, events| acc | *events);
            let unneeded = subscription.events.difference(needed);
            if !unneeded.is_empty() {
                wp.del_recursive(unneeded);
            }
        } else {
            wp.del(&subscription.subscriber, subscription.events);
        }
        desired_mode(&wp)
    }
}

impl Backend {
    /// Bring the OS-level watch in line with the registry. `notify` reports
    /// every category, so a new watch is only needed when the recursion
    /// mode changes or the watch point becomes (non-)empty. When the new
    /// watch fails the previous one is put back before the error returns.
    fn rearm(&mut self, root: &Path, diff: EventDiff, mode: Option<RecursiveMode>) -> Result<()> {
        if mode == self.armed {
            if let EventDiff::Changed { new, .. } = diff {
                tracing::debug!("Aggregate for {} is now {:?}, watch unchanged", root.display(), new);
            }
            return Ok(());
        }

        let previous = self.armed.take();
        if previous.is_some() {
            self.watcher
                .unwatch(root)
                .with_context(|| format!("Failed to stop watching {}", root.display()))?;
        }
        if let Some(mode) = mode {
            if let Err(err) = self.watcher.watch(root, mode) {
                if let Some(previous) = previous {
                    match self.watcher.watch(root, previous) {
                        Ok(()) => self.armed = Some(previous),
                        Err(restore) => {
                            tracing::error!("Failed to restore watch on {}: {}", root.display(), restore)
                        }
                    }
                }
                return Err(err).with_context(|| format!("Failed to start watching {}", root.display()));
            }
            self.armed = Some(mode);
        }

        tracing::debug!("Re-armed watch on {}: {:?}", root.display(), self.armed);
        Ok(())
    }
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.subscriber.id()
    }

    pub fn events(&self) -> Event {
        self.events
    }

    pub fn is_recursive(&self) -> bool {
        self.recursive
    }

    pub fn try_recv(&self) -> Result<FsEvent, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv(&self) -> Result<FsEvent, RecvError> {
        self.receiver.recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<FsEvent, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(owner) = self.owner.upgrade() else {
            return;
        };
        if let Err(err) = owner.unsubscribe(self) {
            tracing::warn!("Failed to release subscriber {}: {:#}", self.id(), err);
        }
    }
}

fn desired_mode(wp: &Watchpoint<FsEvent>) -> Option<RecursiveMode> {
    if wp.is_empty() {
        None
    } else if wp.recursive_mask().is_some() {
        Some(RecursiveMode::Recursive)
    } else {
        Some(RecursiveMode::NonRecursive)
    }
}

/// Fold two consecutive diffs into the overall transition.
fn merge(first: EventDiff, second: EventDiff) -> EventDiff {
    match (first, second) {
        (EventDiff::Unchanged, diff) | (diff, EventDiff::Unchanged) => diff,
        (EventDiff::Changed { old, .. }, EventDiff::Changed { new, .. }) => EventDiff::between(old, new),
    }
}

/// Number of path components `path` lies below `root`, `None` outside it.
fn depth_below(root: &Path, path: &Path) -> Option<usize> {
    path.strip_prefix(root).ok().map(|rest| rest.components().count())
}

fn route(watchpoint: &SharedWatchpoint<FsEvent>, root: &Path, event: notify::Event) {
    let categories = Event::from_kind(&event.kind);
    if categories.is_empty() {
        return;
    }

    for path in event.paths {
        let Some(depth) = depth_below(root, &path) else {
            continue;
        };
        // Anything deeper than a direct child only concerns recursive subscribers.
        let recursive_only = depth > 1;
        let delivered = watchpoint.dispatch(&FsEvent::new(path, categories), recursive_only);
        tracing::trace!("Dispatched {:?} to {} subscribers", categories, delivered);
    }
}
