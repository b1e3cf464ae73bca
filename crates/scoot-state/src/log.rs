use std::collections::BTreeMap;

use tokio::sync::Mutex;

use scoot_types::LogIndex;

/// One decided slot: the index and the command bytes it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub index: LogIndex,
    pub command: Vec<u8>,
}

struct LogInner {
    /// Sparse index → entry map; in-flight slots leave gaps and truncated
    /// prefixes leave nothing.
    entries: BTreeMap<LogIndex, LogEntry>,
    /// Smallest index not yet handed to a proposal.
    next_index: LogIndex,
    /// Highest index known committed.
    commit_index: LogIndex,
    /// Highest index whose effect is captured by the current snapshot.
    stored_index: LogIndex,
}

/// In-memory replicated log with commit/snapshot watermarks.
///
/// Invariant: `stored_index <= commit_index < next_index`; entries at or
/// below `stored_index` may have been truncated away. All operations go
/// through a single mutex; throughput is bounded by consensus latency, not
/// by log contention.
pub struct ReplicatedLog {
    inner: Mutex<LogInner>,
}

impl ReplicatedLog {
    pub fn new() -> Self {
        ReplicatedLog {
            inner: Mutex::new(LogInner {
                entries: BTreeMap::new(),
                next_index: 0,
                commit_index: -1,
                stored_index: -1,
            }),
        }
    }

    /// Store `command` at `index`, raising the allocation and commit
    /// watermarks past it. Idempotent for a slot that has not been
    /// truncated.
    pub async fn append(&self, index: LogIndex, command: Vec<u8>) {
        let mut g = self.inner.lock().await;
        g.entries.insert(index, LogEntry { index, command });
        if index >= g.next_index {
            g.next_index = index + 1;
        }
        if index > g.commit_index {
            g.commit_index = index;
        }
    }

    /// `None` iff the slot was never appended or already truncated.
    pub async fn entry(&self, index: LogIndex) -> Option<LogEntry> {
        self.inner.lock().await.entries.get(&index).cloned()
    }

    /// All stored entries with `index >= start`, in index order.
    pub async fn entries_from(&self, start: LogIndex) -> Vec<LogEntry> {
        let g = self.inner.lock().await;
        g.entries.range(start..).map(|(_, e)| e.clone()).collect()
    }

    /// Reserve the next free slot: returns the current `next_index` and
    /// increments it atomically.
    pub async fn take_next_index(&self) -> LogIndex {
        let mut g = self.inner.lock().await;
        let index = g.next_index;
        g.next_index += 1;
        index
    }

    pub async fn next_index(&self) -> LogIndex {
        self.inner.lock().await.next_index
    }

    pub async fn commit_index(&self) -> LogIndex {
        self.inner.lock().await.commit_index
    }

    pub async fn stored_index(&self) -> LogIndex {
        self.inner.lock().await.stored_index
    }

    pub async fn set_next_index(&self, index: LogIndex) {
        self.inner.lock().await.next_index = index;
    }

    pub async fn set_commit_index(&self, index: LogIndex) {
        self.inner.lock().await.commit_index = index;
    }

    pub async fn set_stored_index(&self, index: LogIndex) {
        self.inner.lock().await.stored_index = index;
    }

    /// Truncate the prefix `[stored_index, up_to_index]` and advance
    /// `stored_index` to `up_to_index + 1`. The caller must already hold a
    /// snapshot covering the removed range.
    pub async fn purge(&self, up_to_index: LogIndex) {
        let mut g = self.inner.lock().await;
        let from = g.stored_index;
        for i in from..=up_to_index {
            g.entries.remove(&i);
        }
        g.stored_index = up_to_index + 1;
    }
}

impl Default for ReplicatedLog {
    fn default() -> Self {
        Self::new()
    }
}
