//! Per-resource attribute state and lifecycle flags.

use crate::entry::{overlay, CacheEntry, ChangedAttribute};
use datagraph_core::{
    Attributes, DataGraphError, Identifier, RecordStateLookup, Result, ValidationError,
};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{debug, trace};

/// Outcome of [`ResourceCache::push_data`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushOutcome {
    pub changed_keys: Vec<String>,
    /// The entry was a new record and is now confirmed.
    pub cleared_new: bool,
}

/// Outcome of [`ResourceCache::rollback_attrs`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackOutcome {
    pub dirty_keys: Vec<String>,
    /// A local delete was undone.
    pub undeleted: bool,
    /// A never-saved record was discarded.
    pub discarded_new: bool,
}

#[derive(Debug, Default)]
pub struct ResourceCache {
    entries: FxHashMap<Identifier, CacheEntry>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, identifier: &Identifier) -> Option<&CacheEntry> {
        self.entries.get(identifier)
    }

    /// Registers a client-created record whose initial attributes are local
    /// edits.
    pub fn create(&mut self, identifier: &Identifier, attributes: Attributes) {
        self.entries
            .insert(identifier.clone(), CacheEntry::new_record(attributes));
    }

    /// Merges confirmed attributes. With `calculate_changes` the keys whose
    /// visible value changed are returned.
    pub fn push_data(
        &mut self,
        identifier: &Identifier,
        attributes: Option<&Attributes>,
        calculate_changes: bool,
    ) -> PushOutcome {
        let entry = self.entries.entry(identifier.clone()).or_default();
        let changed_keys = match attributes {
            Some(attributes) if calculate_changes => entry.changed_keys(attributes),
            _ => Vec::new(),
        };
        match attributes {
            Some(attributes) => entry.merge_remote(attributes),
            None => {
                entry.remote_attrs.get_or_insert_with(Attributes::new);
            }
        }
        entry.drop_redundant_local();
        let cleared_new = std::mem::take(&mut entry.is_new);
        trace!(
            "pushed {} attribute(s) into {} ({} changed)",
            attributes.map_or(0, Attributes::len),
            identifier,
            changed_keys.len()
        );
        PushOutcome {
            changed_keys,
            cleared_new,
        }
    }

    /// Records a local edit, or clears it when `value` equals what the
    /// resource would otherwise show.
    pub fn set_attr(&mut self, identifier: &Identifier, key: &str, value: Value) -> Result<()> {
        let entry = self.entries.entry(identifier.clone()).or_default();
        if entry.is_deleted {
            let reason = if entry.is_deletion_committed {
                "its deletion was committed"
            } else {
                "it is deleted"
            };
            return Err(DataGraphError::InvariantViolation(format!(
                "cannot set '{}' on {}: {}",
                key, identifier, reason
            )));
        }
        if entry.visible_non_local(key) == Some(&value) {
            if let Some(local) = entry.local_attrs.as_mut() {
                local.remove(key);
            }
        } else {
            entry
                .local_attrs
                .get_or_insert_with(Attributes::new)
                .insert(key.to_string(), value);
        }
        Ok(())
    }

    /// Visible value without schema defaults.
    pub fn get_attr(&self, identifier: &Identifier, key: &str) -> Option<&Value> {
        self.entries.get(identifier)?.get(key)
    }

    pub fn changed_attrs(&self, identifier: &Identifier) -> Vec<ChangedAttribute> {
        self.entries
            .get(identifier)
            .map(CacheEntry::changed_attrs)
            .unwrap_or_default()
    }

    pub fn has_changed_attrs(&self, identifier: &Identifier) -> bool {
        self.entries
            .get(identifier)
            .is_some_and(CacheEntry::has_changed_attrs)
    }

    pub fn errors(&self, identifier: &Identifier) -> Vec<ValidationError> {
        self.entries
            .get(identifier)
            .map(|entry| entry.errors.clone())
            .unwrap_or_default()
    }

    pub fn is_deletion_committed(&self, identifier: &Identifier) -> bool {
        self.entries
            .get(identifier)
            .is_some_and(|entry| entry.is_deletion_committed)
    }

    pub fn mark_deleted(&mut self, identifier: &Identifier) -> Result<()> {
        let entry = self.entries.entry(identifier.clone()).or_default();
        if entry.is_deletion_committed {
            return Err(DataGraphError::InvariantViolation(format!(
                "{} is already deleted",
                identifier
            )));
        }
        entry.is_deleted = true;
        Ok(())
    }

    /// Moves local edits into the in-flight bucket.
    pub fn will_commit(&mut self, identifier: &Identifier) -> Result<()> {
        let entry = self.existing_mut(identifier)?;
        if let Some(local) = entry.local_attrs.take() {
            overlay(entry.inflight_attrs.get_or_insert_with(Attributes::new), &local);
        }
        Ok(())
    }

    /// Settles a commit; `attributes` are the values the server returned.
    /// Returns the keys whose visible value changed.
    pub fn did_commit(
        &mut self,
        identifier: &Identifier,
        attributes: Option<&Attributes>,
    ) -> Result<Vec<String>> {
        let entry = self.existing_mut(identifier)?;
        if entry.is_deleted {
            entry.is_deletion_committed = true;
        }
        entry.is_new = false;
        let changed = attributes
            .map(|attributes| entry.changed_keys(attributes))
            .unwrap_or_default();
        if let Some(inflight) = entry.inflight_attrs.take() {
            entry.merge_remote(&inflight);
        } else {
            entry.remote_attrs.get_or_insert_with(Attributes::new);
        }
        if let Some(attributes) = attributes {
            entry.merge_remote(attributes);
        }
        entry.errors.clear();
        entry.drop_redundant_local();
        debug!("Committed {} ({} changed attribute(s))", identifier, changed.len());
        Ok(changed)
    }

    /// Returns in-flight values to the local bucket; edits made after the
    /// commit started win.
    pub fn commit_was_rejected(
        &mut self,
        identifier: &Identifier,
        errors: Vec<ValidationError>,
    ) -> Result<()> {
        let entry = self.existing_mut(identifier)?;
        if let Some(mut restored) = entry.inflight_attrs.take() {
            if let Some(local) = entry.local_attrs.take() {
                overlay(&mut restored, &local);
            }
            entry.local_attrs = Some(restored);
        }
        entry.errors = errors;
        Ok(())
    }

    pub fn rollback_attrs(&mut self, identifier: &Identifier) -> Result<RollbackOutcome> {
        let entry = self.existing_mut(identifier)?;
        let dirty_keys = entry.dirty_keys();
        entry.local_attrs = None;
        entry.inflight_attrs = None;
        entry.errors.clear();

        let mut outcome = RollbackOutcome {
            dirty_keys,
            ..Default::default()
        };
        if entry.is_new {
            outcome.discarded_new = !entry.is_deleted;
            entry.is_deleted = true;
        } else if entry.is_deleted && !entry.is_deletion_committed {
            entry.is_deleted = false;
            outcome.undeleted = true;
        }
        Ok(outcome)
    }

    /// Moves `abandoned`'s entry onto `kept`.
    pub fn merge(&mut self, kept: &Identifier, abandoned: &Identifier) {
        let Some(abandoned_entry) = self.entries.remove(abandoned) else {
            return;
        };
        match self.entries.get_mut(kept) {
            Some(entry) => entry.absorb(abandoned_entry),
            None => {
                self.entries.insert(kept.clone(), abandoned_entry);
            }
        }
        trace!("merged cache entry {} into {}", abandoned.lid(), kept.lid());
    }

    /// Empties the buckets but keeps the entry addressable.
    pub fn unload(&mut self, identifier: &Identifier) {
        if let Some(entry) = self.entries.get_mut(identifier) {
            entry.clear();
        }
    }

    pub fn remove(&mut self, identifier: &Identifier) -> Option<CacheEntry> {
        self.entries.remove(identifier)
    }

    fn existing_mut(&mut self, identifier: &Identifier) -> Result<&mut CacheEntry> {
        self.entries
            .get_mut(identifier)
            .ok_or_else(|| DataGraphError::RecordNotFound(identifier.to_string()))
    }
}

impl RecordStateLookup for ResourceCache {
    fn is_new(&self, identifier: &Identifier) -> bool {
        self.entries.get(identifier).is_some_and(|entry| entry.is_new)
    }

    fn is_deleted(&self, identifier: &Identifier) -> bool {
        self.entries
            .get(identifier)
            .is_some_and(|entry| entry.is_deleted)
    }

    fn is_empty(&self, identifier: &Identifier) -> bool {
        self.entries.get(identifier).map_or(true, CacheEntry::is_empty)
    }
}
