//! The end-of-tick queue: which file's tick controller runs next.
//!
//! One entry per open coordinated file, kept sorted by deadline. The host
//! library owns a single queue and calls [`EotQueue::enter`] and
//! [`EotQueue::exit`] from its API guard; on the idle↔busy transitions the
//! queue reports whether the earliest deadline has passed. The host then
//! drains due entries with [`EotQueue::pop_due`], runs each file's tick
//! controller, and re-inserts the file at its new deadline. Controllers
//! always move their deadline into the future, so the drain terminates and
//! every file makes progress as long as the host is called at all.
//!
//! The head's deadline and role are cached on the queue so the per-call
//! entry hook can poll without walking the entries.

use crate::clock::Timespec;
use crate::Tick;

/// Process-unique identity the host assigns to an open file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Writer,
    Reader,
}

/// One scheduled end-of-tick.
#[derive(Clone, Copy, Debug)]
pub struct EotEntry {
    pub file: FileId,
    pub role: Role,
    pub tick: Tick,
    pub deadline: Timespec,
}

/// Deadline-ordered queue of open files.
#[derive(Default)]
pub struct EotQueue {
    /// Ascending by deadline; the head is `entries[0]`. The number of open
    /// files is small, linear scans are fine here.
    entries: Vec<EotEntry>,
    entry_count: u32,
    next_deadline: Option<Timespec>,
    writer_active: bool,
}

impl EotQueue {
    pub fn new() -> Self {
        EotQueue::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Schedule a file. Scans tail-to-head for the last entry at or before
    /// the new deadline and inserts after it, which keeps files with equal
    /// deadlines in insertion order.
    pub fn insert(&mut self, entry: EotEntry) {
        let mut at = 0;
        for (i, existing) in self.entries.iter().enumerate().rev() {
            if existing.deadline <= entry.deadline {
                at = i + 1;
                break;
            }
        }
        self.entries.insert(at, entry);
        self.refresh_head();
    }

    /// Unschedule a file, e.g. on close.
    pub fn remove(&mut self, file: FileId) -> Option<EotEntry> {
        let at = self.entries.iter().position(|entry| entry.file == file)?;
        let entry = self.entries.remove(at);
        self.refresh_head();
        Some(entry)
    }

    /// The file with the earliest deadline.
    pub fn head(&self) -> Option<&EotEntry> {
        self.entries.first()
    }

    /// Cached copy of the head's deadline.
    pub fn next_deadline(&self) -> Option<Timespec> {
        self.next_deadline
    }

    /// Whether the head entry belongs to a writer.
    pub fn writer_active(&self) -> bool {
        self.writer_active
    }

    /// Take the head if its deadline has passed. The caller runs the file's
    /// tick controller and re-inserts at the new deadline.
    pub fn pop_due(&mut self, now: Timespec) -> Option<EotEntry> {
        if !self.due(now) {
            return None;
        }
        let entry = self.entries.remove(0);
        self.refresh_head();
        Some(entry)
    }

    /// Library-entry hook. Returns whether the caller should drain, which is
    /// only ever the case on the idle→busy transition.
    pub fn enter(&mut self, now: Timespec) -> bool {
        self.entry_count += 1;
        self.entry_count == 1 && self.due(now)
    }

    /// Library-exit hook, the counterpart of [`EotQueue::enter`].
    pub fn exit(&mut self, now: Timespec) -> bool {
        debug_assert!(self.entry_count > 0);
        self.entry_count = self.entry_count.saturating_sub(1);
        self.entry_count == 0 && self.due(now)
    }

    fn due(&self, now: Timespec) -> bool {
        self.next_deadline.map_or(false, |deadline| deadline <= now)
    }

    fn refresh_head(&mut self) {
        self.next_deadline = self.entries.first().map(|entry| entry.deadline);
        self.writer_active = matches!(
            self.entries.first(),
            Some(EotEntry {
                role: Role::Writer,
                ..
            })
        );
    }
}
