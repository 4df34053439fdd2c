//! Reachability-based teardown of unloaded resources.
//!
//! An unloaded resource is only released together with everything it can
//! reach through the relationship graph, and only once nothing in that
//! component is still in use: every member with cached data must itself have
//! been unloaded, and none may hold an outstanding [`Store::retain`] handle.
//! Identifiers known only as relationship references carry no data and never
//! hold a component. Until then the unloaded node stays addressable and waits.

use crate::entry::CacheEntry;
use crate::store::Store;
use datagraph_core::{DataGraphError, Identifier, NotificationKind, Result};
use rustc_hash::FxHashMap;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    /// Every identifier reachable from the start, start first.
    pub component: Vec<Identifier>,
    pub released: bool,
    /// Retained or still-loaded identifiers that kept the component alive.
    pub blocked_by: Vec<Identifier>,
}

/// Entries of released resources, readable for a configured number of turns
/// after the turn that released them.
#[derive(Debug, Default)]
pub struct DestroyedCache {
    entries: FxHashMap<Identifier, DestroyedEntry>,
}

#[derive(Debug)]
struct DestroyedEntry {
    entry: CacheEntry,
    released_in: u64,
    turns_left: u32,
}

impl DestroyedCache {
    pub fn insert(&mut self, identifier: Identifier, entry: CacheEntry, turn: u64, retention: u32) {
        if retention > 0 {
            self.entries.insert(
                identifier,
                DestroyedEntry {
                    entry,
                    released_in: turn,
                    turns_left: retention,
                },
            );
        }
    }

    pub fn get(&self, identifier: &Identifier) -> Option<&CacheEntry> {
        self.entries.get(identifier).map(|destroyed| &destroyed.entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ends `turn`. Entries released during it are not aged yet.
    pub fn age(&mut self, turn: u64) {
        self.entries.retain(|_, destroyed| {
            if destroyed.released_in == turn {
                return true;
            }
            destroyed.turns_left -= 1;
            destroyed.turns_left > 0
        });
    }
}

impl Store {
    /// Unloads a resource's data and tears down its component if nothing in
    /// it is still in use.
    pub fn unload(&mut self, identifier: &Identifier) -> Result<TeardownReport> {
        if identifier.is_forgotten() {
            return Err(DataGraphError::InvariantViolation(format!(
                "{} was already destroyed",
                identifier
            )));
        }
        self.cache.unload(identifier);
        self.unloaded.insert(identifier.clone());
        self.graph.mark_inverse_dematerialized(identifier);
        self.notifier.notify(identifier, NotificationKind::State, None);
        debug!("Unloaded {}", identifier);
        let report = self.try_teardown(identifier)?;
        self.end_turn()?;
        Ok(report)
    }

    /// Drops one handle taken with [`Store::retain`]. When the last handle of
    /// an identifier goes away, a waiting unload in its component is retried.
    pub fn release(&mut self, identifier: &Identifier) -> Result<Option<TeardownReport>> {
        match self.live.get_mut(identifier) {
            Some(count) if *count > 1 => {
                *count -= 1;
                return Ok(None);
            }
            Some(_) => {
                self.live.remove(identifier);
            }
            None => {
                return Err(DataGraphError::InvariantViolation(format!(
                    "{} has no live handle to release",
                    identifier
                )))
            }
        }

        let component = self.graph.connected_component(identifier);
        let Some(waiting) = component.iter().find(|i| self.unloaded.contains(*i)).cloned() else {
            return Ok(None);
        };
        let report = self.try_teardown(&waiting)?;
        self.end_turn()?;
        Ok(Some(report))
    }

    pub fn is_retained(&self, identifier: &Identifier) -> bool {
        self.live.contains_key(identifier)
    }

    /// Retained, or holding data that was never unloaded.
    fn is_in_use(&self, identifier: &Identifier) -> bool {
        self.live.contains_key(identifier)
            || (!self.unloaded.contains(identifier) && self.cache.entry(identifier).is_some())
    }

    pub(crate) fn try_teardown(&mut self, start: &Identifier) -> Result<TeardownReport> {
        let component = self.graph.connected_component(start);
        let blocked_by: Vec<Identifier> = component
            .iter()
            .filter(|identifier| self.is_in_use(identifier))
            .cloned()
            .collect();
        if !blocked_by.is_empty() {
            debug!(
                "Teardown of {} blocked by {} identifier(s) in use",
                start,
                blocked_by.len()
            );
            return Ok(TeardownReport {
                component,
                released: false,
                blocked_by,
            });
        }

        let retention = self.config.destroyed_retention_turns;
        let turn = self.turns();
        for identifier in &component {
            self.graph.release(identifier);
            if let Some(entry) = self.cache.remove(identifier) {
                self.destroyed
                    .insert(identifier.clone(), entry, turn, retention);
            }
            self.unloaded.remove(identifier);
            if !identifier.is_forgotten() {
                self.identifiers.forget(identifier)?;
            }
            self.notifier
                .notify(identifier, NotificationKind::Identity, None);
        }
        info!(
            "Released {} identifier(s) reachable from {}",
            component.len(),
            start.lid()
        );
        Ok(TeardownReport {
            component,
            released: true,
            blocked_by: Vec::new(),
        })
    }
}
