//! Dirty inode membership queues of a writeback context.
//!
//! ```text
//!   mark_dirty ──▶ dirty ──┐
//!                          ├── queue_io ──▶ io ──▶ pop_io ──▶ writer
//!   partial ────▶ more_io ─┘                                    │
//!   timestamps ─▶ dirty_time ─ (sync / expired) ──▶ io          │
//!                                                               ▼
//!                                 requeue: clean │ partial │ redirtied
//! ```
//!
//! Every queued inode appears in exactly one queue. An inode handed to the
//! writer is in no queue until it is requeued; if it gets dirtied again in
//! the meantime it is simply queued afresh and the requeue merges into that
//! entry.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use hashbrown::HashMap;

/// Inode number
pub type InodeId = u64;

/// A dirty inode as tracked by the queues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyInode {
    /// Inode number
    pub inode: InodeId,
    /// Dirty pages attached
    pub pages: u64,
    /// When the inode was first dirtied
    pub dirtied_at_ms: u64,
    /// Only timestamps are dirty
    pub time_only: bool,
}

/// Queue an inode sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Dirty, waiting to be picked
    Dirty,
    /// Picked for the current pass
    Io,
    /// Partially written, retried next pass
    MoreIo,
    /// Only timestamps dirty
    DirtyTime,
}

/// Queue lengths
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueLens {
    pub dirty: usize,
    pub io: usize,
    pub more_io: usize,
    pub dirty_time: usize,
}

/// The four inode queues plus a membership index
#[derive(Debug, Default)]
pub struct InodeQueues {
    dirty: VecDeque<InodeId>,
    io: VecDeque<InodeId>,
    more_io: VecDeque<InodeId>,
    dirty_time: VecDeque<InodeId>,
    index: HashMap<InodeId, (DirtyInode, QueueKind)>,
}

impl InodeQueues {
    /// Empty queues
    pub fn new() -> Self {
        Self::default()
    }

    fn queue_mut(&mut self, kind: QueueKind) -> &mut VecDeque<InodeId> {
        match kind {
            QueueKind::Dirty => &mut self.dirty,
            QueueKind::Io => &mut self.io,
            QueueKind::MoreIo => &mut self.more_io,
            QueueKind::DirtyTime => &mut self.dirty_time,
        }
    }

    fn unqueue(&mut self, inode: InodeId, kind: QueueKind) {
        let queue = self.queue_mut(kind);
        if let Some(pos) = queue.iter().position(|&i| i == inode) {
            queue.remove(pos);
        }
    }

    fn push(&mut self, entry: DirtyInode, kind: QueueKind) {
        self.queue_mut(kind).push_back(entry.inode);
        self.index.insert(entry.inode, (entry, kind));
    }

    /// Attach `pages` dirty pages to `inode`.
    ///
    /// Returns `true` if the inode was not queued before.
    pub fn mark_dirty(&mut self, inode: InodeId, pages: u64, now_ms: u64) -> bool {
        match self.index.get_mut(&inode) {
            Some((entry, kind)) => {
                entry.pages += pages;
                if entry.time_only && pages > 0 {
                    entry.time_only = false;
                    entry.dirtied_at_ms = now_ms;
                    let was = *kind;
                    *kind = QueueKind::Dirty;
                    self.unqueue(inode, was);
                    self.dirty.push_back(inode);
                }
                false
            },
            None => {
                self.push(
                    DirtyInode {
                        inode,
                        pages,
                        dirtied_at_ms: now_ms,
                        time_only: pages == 0,
                    },
                    if pages == 0 {
                        QueueKind::DirtyTime
                    } else {
                        QueueKind::Dirty
                    },
                );
                true
            },
        }
    }

    /// Mark only the timestamps of `inode` dirty
    pub fn mark_dirty_time(&mut self, inode: InodeId, now_ms: u64) -> bool {
        self.mark_dirty(inode, 0, now_ms)
    }

    /// Move eligible inodes onto the io queue.
    ///
    /// `more_io` is always spliced. Dirty inodes move if dirtied at or before
    /// `cutoff` (all of them for `None`); timestamp-only inodes move only if
    /// `time_cutoff` is given and they are at least that old.
    pub fn queue_io(&mut self, cutoff: Option<u64>, time_cutoff: Option<u64>) -> usize {
        let mut moved = 0;
        while let Some(inode) = self.more_io.pop_front() {
            self.retag(inode, QueueKind::Io);
            moved += 1;
        }
        moved += self.move_expired(QueueKind::Dirty, cutoff.unwrap_or(u64::MAX));
        if let Some(time_cutoff) = time_cutoff {
            moved += self.move_expired(QueueKind::DirtyTime, time_cutoff);
        }
        moved
    }

    fn move_expired(&mut self, from: QueueKind, cutoff: u64) -> usize {
        let mut moved = 0;
        // Queues are in dirtying order.
        while let Some(&inode) = self.queue_mut(from).front() {
            let expired = self
                .index
                .get(&inode)
                .map_or(true, |(entry, _)| entry.dirtied_at_ms <= cutoff);
            if !expired {
                break;
            }
            self.queue_mut(from).pop_front();
            self.retag(inode, QueueKind::Io);
            moved += 1;
        }
        moved
    }

    fn retag(&mut self, inode: InodeId, kind: QueueKind) {
        if let Some((_, k)) = self.index.get_mut(&inode) {
            *k = kind;
            self.queue_mut(kind).push_back(inode);
        }
    }

    /// Take the next inode of the io queue off the queues
    pub fn pop_io(&mut self) -> Option<DirtyInode> {
        while let Some(inode) = self.io.pop_front() {
            if let Some((entry, _)) = self.index.remove(&inode) {
                return Some(entry);
            }
        }
        None
    }

    /// Put a popped inode back on `kind`, merging into any entry queued since
    pub fn requeue(&mut self, entry: DirtyInode, kind: QueueKind) {
        match self.index.get_mut(&entry.inode) {
            Some((queued, _)) => {
                queued.pages += entry.pages;
                queued.dirtied_at_ms = queued.dirtied_at_ms.min(entry.dirtied_at_ms);
            },
            None => self.push(entry, kind),
        }
    }

    /// Drop `inode` from whichever queue holds it
    pub fn remove(&mut self, inode: InodeId) -> Option<DirtyInode> {
        let (entry, kind) = self.index.remove(&inode)?;
        self.unqueue(inode, kind);
        Some(entry)
    }

    /// Queue holding `inode`
    pub fn kind_of(&self, inode: InodeId) -> Option<QueueKind> {
        self.index.get(&inode).map(|(_, kind)| *kind)
    }

    /// Tracked state of `inode`
    pub fn get(&self, inode: InodeId) -> Option<&DirtyInode> {
        self.index.get(&inode).map(|(entry, _)| entry)
    }

    /// Whether any inode has dirty data (timestamp-only inodes excluded)
    pub fn has_dirty_io(&self) -> bool {
        !self.dirty.is_empty() || !self.io.is_empty() || !self.more_io.is_empty()
    }

    /// Whether nothing is queued at all
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Whether timestamp-only inodes older than `cutoff` are waiting
    pub fn has_expired_time(&self, cutoff: u64) -> bool {
        self.dirty_time
            .front()
            .and_then(|inode| self.index.get(inode))
            .is_some_and(|(entry, _)| entry.dirtied_at_ms <= cutoff)
    }

    /// Whether dirty inodes older than `cutoff` are waiting
    pub fn has_expired(&self, cutoff: u64) -> bool {
        !self.more_io.is_empty()
            || self
                .dirty
                .front()
                .and_then(|inode| self.index.get(inode))
                .is_some_and(|(entry, _)| entry.dirtied_at_ms <= cutoff)
    }

    /// Queue lengths
    pub fn lens(&self) -> QueueLens {
        QueueLens {
            dirty: self.dirty.len(),
            io: self.io.len(),
            more_io: self.more_io.len(),
            dirty_time: self.dirty_time.len(),
        }
    }

    /// Dirty pages attached to queued inodes
    pub fn dirty_pages(&self) -> u64 {
        self.index.values().map(|(entry, _)| entry.pages).sum()
    }

    /// Empty every queue, returning the inodes with their queue
    pub fn take_all(&mut self) -> Vec<(DirtyInode, QueueKind)> {
        let mut out = Vec::with_capacity(self.index.len());
        for kind in [
            QueueKind::Io,
            QueueKind::MoreIo,
            QueueKind::Dirty,
            QueueKind::DirtyTime,
        ] {
            let queue = core::mem::take(self.queue_mut(kind));
            for inode in queue {
                if let Some((entry, _)) = self.index.remove(&inode) {
                    out.push((entry, kind));
                }
            }
        }
        out
    }

    /// Adopt inodes taken from another context's queues
    pub fn absorb(&mut self, inodes: Vec<(DirtyInode, QueueKind)>) {
        for (entry, kind) in inodes {
            let kind = match kind {
                QueueKind::Io | QueueKind::MoreIo => QueueKind::MoreIo,
                other => other,
            };
            self.requeue(entry, kind);
        }
    }
}
