use std::path::{Path, PathBuf};
use std::time::SystemTime;
use bitflags::bitflags;
use notify::event::ModifyKind;
use notify::EventKind;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Categories of filesystem changes a subscriber can ask for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Event: u32 {
        /// File or directory was created.
        const CREATE   = 1 << 0;
        /// File contents were written.
        const WRITE    = 1 << 1;
        /// File or directory was removed.
        const REMOVE   = 1 << 2;
        /// File or directory was renamed or moved.
        const RENAME   = 1 << 3;
        /// Permissions, timestamps or other metadata changed.
        const METADATA = 1 << 4;
    }
}

/// Internal marker for recursive interest. Never part of a mask handed back
/// to callers.
pub(crate) const RECURSIVE: Event = Event::from_bits_retain(1 << 31);

impl Event {
    /// Map a backend event kind onto the categories above. Kinds we have no
    /// category for (access, unknown) map to the empty mask.
    pub fn from_kind(kind: &EventKind) -> Event {
        match kind {
            EventKind::Create(_) => Event::CREATE,
            EventKind::Modify(ModifyKind::Metadata(_)) => Event::METADATA,
            EventKind::Modify(ModifyKind::Name(_)) => Event::RENAME,
            EventKind::Modify(_) => Event::WRITE,
            EventKind::Remove(_) => Event::REMOVE,
            EventKind::Access(_) | EventKind::Any | EventKind::Other => Event::empty(),
        }
    }

    pub(crate) fn with_recursive(self) -> Event {
        self.union(RECURSIVE)
    }

    pub(crate) fn stripped(self) -> Event {
        self.difference(RECURSIVE)
    }

    pub(crate) fn has_recursive(self) -> bool {
        self.contains(RECURSIVE)
    }
}

/// How the aggregate mask of a watch point moved after one add or remove.
///
/// Both masks are stripped of the recursive marker. A backend only has to
/// re-issue its OS-level watch for `Changed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDiff {
    Unchanged,
    Changed { old: Event, new: Event },
}

impl EventDiff {
    pub(crate) fn between(old: Event, new: Event) -> Self {
        let (old, new) = (old.stripped(), new.stripped());
        if old == new {
            EventDiff::Unchanged
        } else {
            EventDiff::Changed { old, new }
        }
    }

    /// Categories present in the new mask but not in the old one.
    pub fn event(&self) -> Event {
        match *self {
            EventDiff::Unchanged => Event::empty(),
            EventDiff::Changed { old, new } => new.difference(old),
        }
    }

    pub fn is_changed(&self) -> bool {
        matches!(self, EventDiff::Changed { .. })
    }

    /// The aggregate after the change, if there was one.
    pub fn new_mask(&self) -> Option<Event> {
        match *self {
            EventDiff::Unchanged => None,
            EventDiff::Changed { new, .. } => Some(new),
        }
    }
}

/// Anything that can be dispatched through a watch point.
pub trait EventInfo {
    fn event(&self) -> Event;
}

/// A single change observed on disk, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FsEvent {
    pub path: PathBuf,
    pub event: Event,
    pub timestamp: SystemTime,
}

impl FsEvent {
    pub fn new(path: PathBuf, event: Event) -> Self {
        Self {
            path,
            event,
            timestamp: SystemTime::now(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventInfo for FsEvent {
    fn event(&self) -> Event {
        self.event
    }
}
