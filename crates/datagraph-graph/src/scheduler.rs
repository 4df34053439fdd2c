use datagraph_core::{DataGraphError, Identifier};
use rustc_hash::FxHashSet;
use tracing::trace;

pub type EdgeKey = (Identifier, String);

/// Counters for canonical flush scheduling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Edges newly queued for a flush.
    pub scheduled: u64,
    /// Schedule requests absorbed by an already-queued edge.
    pub coalesced: u64,
    /// Edges actually flushed.
    pub flushed: u64,
    /// Flush passes that had work to do.
    pub flushes: u64,
    /// Edges whose flush returned an error.
    pub failed: u64,
}

/// An edge whose flush stopped part way; its current state may be partially
/// applied.
#[derive(Debug)]
pub struct FlushFailure {
    pub owner: Identifier,
    pub field: String,
    pub error: DataGraphError,
}

impl FlushFailure {
    /// `"type:lid.field"` form used in logs and errors.
    pub fn edge(&self) -> String {
        format!("{}.{}", self.owner, self.field)
    }

    /// Folds a batch of failures into one error, or `None` if empty.
    pub fn into_error(failures: Vec<FlushFailure>) -> Option<DataGraphError> {
        let count = failures.len();
        let first = failures.into_iter().next()?;
        Some(DataGraphError::FlushFailed {
            edge: first.edge(),
            count,
            source: Box::new(first.error),
        })
    }
}

/// Pending canonical flushes, at most one entry per edge, drained at the turn
/// boundary in scheduling order.
#[derive(Debug, Default)]
pub struct FlushQueue {
    pending: Vec<EdgeKey>,
    queued: FxHashSet<EdgeKey>,
    stats: FlushStats,
}

impl FlushQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the edge was already queued this turn.
    pub fn schedule(&mut self, owner: &Identifier, field: &str) -> bool {
        let key = (owner.clone(), field.to_string());
        if self.queued.contains(&key) {
            self.stats.coalesced += 1;
            return false;
        }
        trace!("schedule flush {}.{}", owner, field);
        self.queued.insert(key.clone());
        self.pending.push(key);
        self.stats.scheduled += 1;
        true
    }

    pub fn is_scheduled(&self, owner: &Identifier, field: &str) -> bool {
        self.queued.contains(&(owner.clone(), field.to_string()))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn drain(&mut self) -> Vec<EdgeKey> {
        self.queued.clear();
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn record_flush(&mut self, edges: usize) {
        self.stats.flushes += 1;
        self.stats.flushed += edges as u64;
    }

    pub(crate) fn record_failure(&mut self) {
        self.stats.failed += 1;
    }

    /// Moves every entry for `abandoned` onto `kept`, dropping duplicates.
    pub fn rename(&mut self, abandoned: &Identifier, kept: &Identifier) {
        let pending = std::mem::take(&mut self.pending);
        self.queued.clear();
        for (owner, field) in pending {
            let owner = if owner == *abandoned {
                kept.clone()
            } else {
                owner
            };
            let key = (owner, field);
            if self.queued.insert(key.clone()) {
                self.pending.push(key);
            }
        }
    }

    pub fn purge(&mut self, identifier: &Identifier) {
        self.pending.retain(|(owner, _)| owner != identifier);
        self.queued.retain(|(owner, _)| owner != identifier);
    }

    pub fn stats(&self) -> FlushStats {
        self.stats
    }
}
