use datagraph_core::{Attributes, ValidationError};
use serde_json::Value;

/// One attribute that differs from its confirmed value.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangedAttribute {
    pub key: String,
    pub old: Value,
    pub new: Value,
}

/// Attribute state of a single resource.
///
/// Three buckets hold the attribute values: `remote` (confirmed by the
/// server), `inflight` (sent in a commit that has not settled) and `local`
/// (edited but not yet committed). A lookup reads `local` first, then
/// `inflight`, then `remote`. A bucket that is `None` has never held data,
/// which is different from an empty bucket.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheEntry {
    pub remote_attrs: Option<Attributes>,
    pub local_attrs: Option<Attributes>,
    pub inflight_attrs: Option<Attributes>,
    pub errors: Vec<ValidationError>,
    pub is_new: bool,
    pub is_deleted: bool,
    pub is_deletion_committed: bool,
}

impl CacheEntry {
    pub fn new_record(attributes: Attributes) -> Self {
        Self {
            local_attrs: Some(attributes),
            is_new: true,
            ..Default::default()
        }
    }

    /// No bucket has ever received data.
    pub fn is_empty(&self) -> bool {
        self.remote_attrs.is_none() && self.local_attrs.is_none() && self.inflight_attrs.is_none()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.local_attrs
            .as_ref()
            .and_then(|local| local.get(key))
            .or_else(|| self.visible_non_local(key))
    }

    /// Value the resource would show if its local edits were discarded.
    pub fn visible_non_local(&self, key: &str) -> Option<&Value> {
        self.inflight_attrs
            .as_ref()
            .and_then(|inflight| inflight.get(key))
            .or_else(|| self.remote_attrs.as_ref().and_then(|remote| remote.get(key)))
    }

    pub fn has_changed_attrs(&self) -> bool {
        self.local_attrs.as_ref().is_some_and(|local| !local.is_empty())
            || self
                .inflight_attrs
                .as_ref()
                .is_some_and(|inflight| !inflight.is_empty())
    }

    /// In-flight and local values against the confirmed ones, local winning.
    pub fn changed_attrs(&self) -> Vec<ChangedAttribute> {
        let mut pending = self.inflight_attrs.clone().unwrap_or_default();
        if let Some(local) = &self.local_attrs {
            overlay(&mut pending, local);
        }
        pending
            .into_iter()
            .map(|(key, new)| {
                let old = self
                    .remote_attrs
                    .as_ref()
                    .and_then(|remote| remote.get(&key))
                    .cloned()
                    .unwrap_or(Value::Null);
                ChangedAttribute { key, old, new }
            })
            .collect()
    }

    /// Keys of `updates` whose value differs from what was visible before,
    /// skipping keys shadowed by a local edit.
    pub fn changed_keys(&self, updates: &Attributes) -> Vec<String> {
        updates
            .iter()
            .filter(|(key, _)| {
                !self
                    .local_attrs
                    .as_ref()
                    .is_some_and(|local| local.contains_key(key.as_str()))
            })
            .filter(|(key, value)| self.visible_non_local(key) != Some(*value))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Keys with a local or in-flight value.
    pub fn dirty_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for bucket in [&self.inflight_attrs, &self.local_attrs].into_iter().flatten() {
            for key in bucket.keys() {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }
        keys
    }

    /// Drops local edits that match the value they would fall back to.
    pub fn drop_redundant_local(&mut self) {
        let Some(mut local) = self.local_attrs.take() else {
            return;
        };
        local.retain(|key, value| self.visible_non_local(key) != Some(&*value));
        self.local_attrs = Some(local);
    }

    pub fn merge_remote(&mut self, updates: &Attributes) {
        overlay(self.remote_attrs.get_or_insert_with(Attributes::new), updates);
    }

    /// Folds `abandoned` under `self`: per bucket `self` wins on conflicts.
    pub fn absorb(&mut self, abandoned: CacheEntry) {
        self.remote_attrs = union(abandoned.remote_attrs, self.remote_attrs.take());
        self.inflight_attrs = union(abandoned.inflight_attrs, self.inflight_attrs.take());
        self.local_attrs = union(abandoned.local_attrs, self.local_attrs.take());
        self.is_new = self.is_new && abandoned.is_new;
        self.is_deleted = self.is_deleted || abandoned.is_deleted;
        self.is_deletion_committed = self.is_deletion_committed || abandoned.is_deletion_committed;
        self.errors.extend(abandoned.errors);
    }

    /// Clears every attribute bucket. Lifecycle flags stay.
    pub fn clear(&mut self) {
        self.remote_attrs = None;
        self.local_attrs = None;
        self.inflight_attrs = None;
        self.errors.clear();
    }
}

pub(crate) fn overlay(base: &mut Attributes, top: &Attributes) {
    for (key, value) in top {
        base.insert(key.clone(), value.clone());
    }
}

/// `lower ∪ upper` with `upper` winning; `None` only if both are.
fn union(lower: Option<Attributes>, upper: Option<Attributes>) -> Option<Attributes> {
    match (lower, upper) {
        (Some(mut lower), Some(upper)) => {
            overlay(&mut lower, &upper);
            Some(lower)
        }
        (lower, upper) => upper.or(lower),
    }
}
