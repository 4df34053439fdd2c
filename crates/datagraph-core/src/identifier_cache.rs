//! Identity cache: one stable [`Identifier`] per logical resource.
//!
//! Every identifier is registered under its `lid` and, once known, under its
//! `(type, id)` pair. Discovering that two registered identifiers describe the
//! same resource produces a merge; the outcome is returned to the caller as
//! [`IdentifierUpdate::Merged`] so that state keyed by the abandoned handle
//! can be migrated.

use crate::identifier::{Identifier, ResourceRef};
use crate::{DataGraphError, Result};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};
use uuid::Uuid;

pub const DEFAULT_LID_PREFIX: &str = "@lid:";

/// Generates the `lid` for identifiers minted without one.
pub trait LidGenerator: Send + Sync {
    fn generate(&self, type_name: &str, id: Option<&str>) -> String;
}

/// `@lid:{type}-{id}` when an id is known, `@lid:{uuid}` otherwise.
#[derive(Debug, Clone)]
pub struct DefaultLidGenerator {
    prefix: String,
}

impl DefaultLidGenerator {
    pub fn new<P: Into<String>>(prefix: P) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn random(&self) -> String {
        format!("{}{}", self.prefix, Uuid::new_v4())
    }
}

impl Default for DefaultLidGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_LID_PREFIX)
    }
}

impl LidGenerator for DefaultLidGenerator {
    fn generate(&self, type_name: &str, id: Option<&str>) -> String {
        match id {
            Some(id) => format!("{}{}-{}", self.prefix, type_name, id),
            None => self.random(),
        }
    }
}

/// Picks the surviving identifier when two handles turn out to describe the
/// same resource. Returning `None` is a fatal configuration error.
pub trait MergePolicy: Send + Sync {
    fn choose(
        &self,
        updating: &Identifier,
        existing: &Identifier,
        data: &ResourceRef,
    ) -> Option<Identifier>;
}

/// Keeps the identifier whose id matches the incoming data; ties go to the
/// identifier that was already registered.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreferMatchingId;

impl MergePolicy for PreferMatchingId {
    fn choose(
        &self,
        updating: &Identifier,
        existing: &Identifier,
        data: &ResourceRef,
    ) -> Option<Identifier> {
        let target = data.id.as_deref();
        let updating_matches = target.is_some() && updating.id().as_deref() == target;
        let existing_matches = target.is_some() && existing.id().as_deref() == target;
        match (updating_matches, existing_matches) {
            (true, false) => Some(updating.clone()),
            _ => Some(existing.clone()),
        }
    }
}

/// Result of [`IdentifierCache::update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentifierUpdate {
    Updated(Identifier),
    Merged {
        kept: Identifier,
        abandoned: Identifier,
    },
}

impl IdentifierUpdate {
    /// The identifier callers should hold on to from now on.
    pub fn identifier(&self) -> &Identifier {
        match self {
            IdentifierUpdate::Updated(identifier) => identifier,
            IdentifierUpdate::Merged { kept, .. } => kept,
        }
    }

    pub fn is_merge(&self) -> bool {
        matches!(self, IdentifierUpdate::Merged { .. })
    }
}

#[derive(Debug, Default)]
struct RegisteredKeys {
    lids: Vec<String>,
    ids: Vec<String>,
}

pub struct IdentifierCache {
    lids: FxHashMap<String, Identifier>,
    ids: FxHashMap<String, FxHashMap<String, Identifier>>,
    keys: FxHashMap<Identifier, RegisteredKeys>,
    merges: Vec<(Identifier, Identifier)>,
    generator: Box<dyn LidGenerator>,
    merge_policy: Box<dyn MergePolicy>,
}

impl Default for IdentifierCache {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentifierCache {
    pub fn new() -> Self {
        Self::with_hooks(
            Box::new(DefaultLidGenerator::default()),
            Box::new(PreferMatchingId),
        )
    }

    pub fn with_hooks(generator: Box<dyn LidGenerator>, merge_policy: Box<dyn MergePolicy>) -> Self {
        Self {
            lids: FxHashMap::default(),
            ids: FxHashMap::default(),
            keys: FxHashMap::default(),
            merges: Vec::new(),
            generator,
            merge_policy,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, identifier: &Identifier) -> bool {
        self.keys.contains_key(identifier)
    }

    /// Merges performed since the last call, as `(kept, abandoned)`. Merges can
    /// happen inside [`IdentifierCache::get_or_create`] as well as
    /// [`IdentifierCache::update`]; owners of identifier-keyed state drain
    /// this after every call.
    pub fn take_merges(&mut self) -> Vec<(Identifier, Identifier)> {
        std::mem::take(&mut self.merges)
    }

    pub fn peek(&self, resource: &ResourceRef) -> Result<Option<Identifier>> {
        if let Some(lid) = resource.lid.as_deref() {
            if let Some(found) = self.lids.get(lid) {
                Self::check_type(found, resource)?;
                return Ok(Some(found.clone()));
            }
        }
        if let Some(id) = resource.id.as_deref() {
            let found = self
                .ids
                .get(resource.type_name.as_str())
                .and_then(|by_id| by_id.get(id));
            return Ok(found.cloned());
        }
        Ok(None)
    }

    pub fn get_or_create(&mut self, resource: &ResourceRef) -> Result<Identifier> {
        if let Some(lid) = resource.lid.as_deref() {
            if let Some(found) = self.lids.get(lid).cloned() {
                Self::check_type(&found, resource)?;
                let needs_id = match (resource.id.as_deref(), found.id()) {
                    (Some(incoming), Some(current)) => incoming != current,
                    (Some(_), None) => true,
                    _ => false,
                };
                if needs_id {
                    let by_id = ResourceRef {
                        type_name: resource.type_name.clone(),
                        id: resource.id.clone(),
                        lid: None,
                    };
                    return Ok(self.update(&found, &by_id)?.identifier().clone());
                }
                return Ok(found);
            }
        }

        if let Some(id) = resource.id.as_deref() {
            let found = self
                .ids
                .get(resource.type_name.as_str())
                .and_then(|by_id| by_id.get(id))
                .cloned();
            if let Some(found) = found {
                if let Some(lid) = resource.lid.as_deref() {
                    // unseen lid for a known id becomes an alias of that identifier
                    self.register_lid(&found, lid.to_string());
                }
                return Ok(found);
            }
        }

        let lid = match resource.lid.clone() {
            Some(lid) => lid,
            None => {
                let generated = self
                    .generator
                    .generate(&resource.type_name, resource.id.as_deref());
                if self.lids.contains_key(&generated) {
                    DefaultLidGenerator::default().random()
                } else {
                    generated
                }
            }
        };
        Ok(self.mint(&resource.type_name, resource.id.clone(), lid))
    }

    /// Mints an identifier for a client-originated resource. The lid is always
    /// fresh, even when an id is supplied.
    pub fn create_for_new_record(&mut self, type_name: &str, id: Option<&str>) -> Result<Identifier> {
        if let Some(id) = id {
            if let Some(existing) = self.ids.get(type_name).and_then(|by_id| by_id.get(id)) {
                return Err(DataGraphError::IdentityConflict(format!(
                    "cannot create a new '{}' with id '{}': already registered as {}",
                    type_name,
                    id,
                    existing.lid()
                )));
            }
        }
        let mut lid = self.generator.generate(type_name, None);
        while self.lids.contains_key(&lid) {
            lid = DefaultLidGenerator::default().random();
        }
        Ok(self.mint(type_name, id.map(str::to_string), lid))
    }

    /// Applies new id/lid information to `identifier`, merging with another
    /// registered identifier when the data says they are the same resource.
    pub fn update(&mut self, identifier: &Identifier, data: &ResourceRef) -> Result<IdentifierUpdate> {
        if identifier.is_forgotten() {
            return Err(DataGraphError::IdentifierForgotten(identifier.to_string()));
        }
        if data.type_name != identifier.type_name() {
            return Err(DataGraphError::IdentityConflict(format!(
                "cannot change type of {} to '{}'",
                identifier, data.type_name
            )));
        }

        if let Some(lid) = data.lid.as_deref() {
            if lid != identifier.lid() {
                match self.lids.get(lid).cloned() {
                    Some(other) if other != *identifier => {
                        return self.merge(identifier, &other, data);
                    }
                    Some(_) => {}
                    None => {
                        return Err(DataGraphError::IdentityConflict(format!(
                            "cannot change lid of {} to '{}'",
                            identifier, lid
                        )));
                    }
                }
            }
        }

        if let Some(id) = data.id.as_deref() {
            let existing = self
                .ids
                .get(identifier.type_name())
                .and_then(|by_id| by_id.get(id))
                .cloned();
            match existing {
                Some(other) if other != *identifier => return self.merge(identifier, &other, data),
                Some(_) => {}
                None => {
                    if let Some(previous) = identifier.id() {
                        warn!(
                            "Identifier {} already had id '{}'; also registering id '{}'",
                            identifier.lid(),
                            previous,
                            id
                        );
                    }
                    identifier.set_id(id.to_string());
                    self.register_id(identifier, id.to_string());
                }
            }
        }

        Ok(IdentifierUpdate::Updated(identifier.clone()))
    }

    pub fn forget(&mut self, identifier: &Identifier) -> Result<()> {
        if identifier.is_forgotten() {
            return Err(DataGraphError::InvariantViolation(format!(
                "identifier {} was already forgotten",
                identifier.lid()
            )));
        }
        if let Some(keys) = self.keys.remove(identifier) {
            for lid in keys.lids {
                self.lids.remove(&lid);
            }
            if let Some(by_id) = self.ids.get_mut(identifier.type_name()) {
                for id in keys.ids {
                    by_id.remove(&id);
                }
                if by_id.is_empty() {
                    self.ids.remove(identifier.type_name());
                }
            }
        }
        identifier.mark_forgotten();
        trace!("Forgot identifier {}", identifier.lid());
        Ok(())
    }

    fn merge(
        &mut self,
        updating: &Identifier,
        existing: &Identifier,
        data: &ResourceRef,
    ) -> Result<IdentifierUpdate> {
        let kept = self
            .merge_policy
            .choose(updating, existing, data)
            .ok_or_else(|| DataGraphError::MergeUnresolved {
                first: updating.to_string(),
                second: existing.to_string(),
            })?;
        let abandoned = if kept == *updating {
            existing.clone()
        } else if kept == *existing {
            updating.clone()
        } else {
            return Err(DataGraphError::InvariantViolation(format!(
                "merge policy returned {} which is neither {} nor {}",
                kept, updating, existing
            )));
        };

        let moved = self.keys.remove(&abandoned).unwrap_or_default();
        for lid in moved.lids {
            self.lids.insert(lid.clone(), kept.clone());
            self.keys.entry(kept.clone()).or_default().lids.push(lid);
        }
        if let Some(by_id) = self.ids.get_mut(kept.type_name()) {
            for id in &moved.ids {
                by_id.insert(id.clone(), kept.clone());
            }
        }
        self.keys
            .entry(kept.clone())
            .or_default()
            .ids
            .extend(moved.ids);

        if let Some(id) = data.id.as_deref() {
            if kept.id().as_deref() != Some(id) {
                kept.set_id(id.to_string());
            }
            self.register_id(&kept, id.to_string());
        }

        abandoned.mark_forgotten();
        self.merges.push((kept.clone(), abandoned.clone()));
        debug!(
            "Merged identifier {} into {} ({})",
            abandoned.lid(),
            kept.lid(),
            kept
        );
        Ok(IdentifierUpdate::Merged { kept, abandoned })
    }

    fn mint(&mut self, type_name: &str, id: Option<String>, lid: String) -> Identifier {
        let identifier = Identifier::mint(type_name, id.clone(), lid.clone());
        self.register_lid(&identifier, lid);
        if let Some(id) = id {
            self.register_id(&identifier, id);
        }
        trace!("Minted identifier {:?}", identifier);
        identifier
    }

    fn register_lid(&mut self, identifier: &Identifier, lid: String) {
        if self.lids.contains_key(&lid) {
            return;
        }
        self.lids.insert(lid.clone(), identifier.clone());
        self.keys.entry(identifier.clone()).or_default().lids.push(lid);
    }

    fn register_id(&mut self, identifier: &Identifier, id: String) {
        let by_id = self.ids.entry(identifier.type_name().to_string()).or_default();
        by_id.insert(id.clone(), identifier.clone());
        let keys = self.keys.entry(identifier.clone()).or_default();
        if !keys.ids.contains(&id) {
            keys.ids.push(id);
        }
    }

    fn check_type(found: &Identifier, resource: &ResourceRef) -> Result<()> {
        if found.type_name() != resource.type_name {
            return Err(DataGraphError::IdentityConflict(format!(
                "lid '{}' belongs to type '{}', not '{}'",
                found.lid(),
                found.type_name(),
                resource.type_name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_type_and_id_resolve_to_one_identifier() {
        let mut cache = IdentifierCache::new();
        let a = cache.get_or_create(&ResourceRef::new("user", "1")).unwrap();
        let b = cache.get_or_create(&ResourceRef::new("user", "1")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.lid(), "@lid:user-1");

        let by_lid = cache
            .get_or_create(&ResourceRef::from_lid("user", "@lid:user-1"))
            .unwrap();
        assert_eq!(a, by_lid);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn different_types_do_not_collide() {
        let mut cache = IdentifierCache::new();
        let user = cache.get_or_create(&ResourceRef::new("user", "1")).unwrap();
        let post = cache.get_or_create(&ResourceRef::new("post", "1")).unwrap();
        assert_ne!(user, post);
    }

    #[test]
    fn peek_never_generates() {
        let mut cache = IdentifierCache::new();
        assert!(cache.peek(&ResourceRef::new("user", "1")).unwrap().is_none());
        assert!(cache.is_empty());
        let a = cache.get_or_create(&ResourceRef::new("user", "1")).unwrap();
        assert_eq!(cache.peek(&ResourceRef::new("user", "1")).unwrap(), Some(a));
    }

    #[test]
    fn new_records_get_fresh_lids() {
        let mut cache = IdentifierCache::new();
        let a = cache.create_for_new_record("user", None).unwrap();
        let b = cache.create_for_new_record("user", None).unwrap();
        assert_ne!(a.lid(), b.lid());
        assert!(a.lid().starts_with(DEFAULT_LID_PREFIX));
        assert!(a.id().is_none());
    }

    #[test]
    fn new_record_with_taken_id_is_a_conflict() {
        let mut cache = IdentifierCache::new();
        cache.get_or_create(&ResourceRef::new("user", "1")).unwrap();
        let err = cache.create_for_new_record("user", Some("1")).unwrap_err();
        assert!(matches!(err, DataGraphError::IdentityConflict(_)));
    }

    #[test]
    fn update_assigns_id_once() {
        let mut cache = IdentifierCache::new();
        let a = cache.create_for_new_record("user", None).unwrap();
        let outcome = cache.update(&a, &ResourceRef::new("user", "9")).unwrap();
        assert_eq!(outcome, IdentifierUpdate::Updated(a.clone()));
        assert_eq!(a.id().as_deref(), Some("9"));
        assert_eq!(cache.peek(&ResourceRef::new("user", "9")).unwrap(), Some(a));
    }

    #[test]
    fn update_with_owned_id_merges() {
        let mut cache = IdentifierCache::new();
        let existing = cache.get_or_create(&ResourceRef::new("user", "5")).unwrap();
        let fresh = cache.create_for_new_record("user", None).unwrap();

        let outcome = cache.update(&fresh, &ResourceRef::new("user", "5")).unwrap();
        match outcome {
            IdentifierUpdate::Merged { kept, abandoned } => {
                assert_eq!(kept, existing);
                assert_eq!(abandoned, fresh);
            }
            other => panic!("expected merge, got {:?}", other),
        }
        assert!(fresh.is_forgotten());
        assert!(!existing.is_forgotten());
        // the abandoned lid now resolves to the survivor
        let via_old_lid = cache
            .peek(&ResourceRef::from_lid("user", fresh.lid()))
            .unwrap();
        assert_eq!(via_old_lid, Some(existing.clone()));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.take_merges(), vec![(existing, fresh)]);
        assert!(cache.take_merges().is_empty());
    }

    #[test]
    fn lid_lookup_with_owned_id_merges_and_is_logged() {
        let mut cache = IdentifierCache::new();
        let owner = cache.get_or_create(&ResourceRef::new("user", "5")).unwrap();
        let fresh = cache.create_for_new_record("user", None).unwrap();

        let resolved = cache
            .get_or_create(&ResourceRef::new("user", "5").with_lid(fresh.lid()))
            .unwrap();
        assert_eq!(resolved, owner);
        assert!(fresh.is_forgotten());
        assert_eq!(cache.take_merges(), vec![(owner, fresh)]);
    }

    #[test]
    fn merge_policy_returning_none_is_fatal() {
        struct Undecided;
        impl MergePolicy for Undecided {
            fn choose(&self, _: &Identifier, _: &Identifier, _: &ResourceRef) -> Option<Identifier> {
                None
            }
        }
        let mut cache =
            IdentifierCache::with_hooks(Box::new(DefaultLidGenerator::default()), Box::new(Undecided));
        cache.get_or_create(&ResourceRef::new("user", "5")).unwrap();
        let fresh = cache.create_for_new_record("user", None).unwrap();
        let err = cache.update(&fresh, &ResourceRef::new("user", "5")).unwrap_err();
        assert!(matches!(err, DataGraphError::MergeUnresolved { .. }));
    }

    #[test]
    fn changing_type_or_lid_is_rejected() {
        let mut cache = IdentifierCache::new();
        let a = cache.get_or_create(&ResourceRef::new("user", "1")).unwrap();
        assert!(cache.update(&a, &ResourceRef::new("post", "1")).is_err());
        let unknown_lid = ResourceRef::new("user", "1").with_lid("@lid:somewhere-else");
        assert!(cache.update(&a, &unknown_lid).is_err());
    }

    #[test]
    fn reassigning_id_keeps_both_keys() {
        let mut cache = IdentifierCache::new();
        let a = cache.get_or_create(&ResourceRef::new("user", "1")).unwrap();
        cache.update(&a, &ResourceRef::new("user", "2")).unwrap();
        assert_eq!(a.id().as_deref(), Some("2"));
        assert_eq!(cache.peek(&ResourceRef::new("user", "1")).unwrap(), Some(a.clone()));
        assert_eq!(cache.peek(&ResourceRef::new("user", "2")).unwrap(), Some(a));
    }

    #[test]
    fn forget_removes_every_key_and_rejects_double_forget() {
        let mut cache = IdentifierCache::new();
        let a = cache.get_or_create(&ResourceRef::new("user", "1")).unwrap();
        cache.forget(&a).unwrap();
        assert!(a.is_forgotten());
        assert!(cache.peek(&ResourceRef::new("user", "1")).unwrap().is_none());
        assert!(cache.peek(&ResourceRef::from_lid("user", a.lid())).unwrap().is_none());
        assert!(matches!(
            cache.forget(&a),
            Err(DataGraphError::InvariantViolation(_))
        ));

        let b = cache.get_or_create(&ResourceRef::new("user", "1")).unwrap();
        assert_ne!(a, b);
        assert!(matches!(
            cache.update(&a, &ResourceRef::new("user", "1")),
            Err(DataGraphError::IdentifierForgotten(_))
        ));
    }

    #[test]
    fn lid_lookup_with_wrong_type_conflicts() {
        let mut cache = IdentifierCache::new();
        let a = cache.create_for_new_record("user", None).unwrap();
        let err = cache
            .get_or_create(&ResourceRef::from_lid("post", a.lid()))
            .unwrap_err();
        assert!(matches!(err, DataGraphError::IdentityConflict(_)));
    }
}
