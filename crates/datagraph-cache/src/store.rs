//! The record cache facade: identity, attributes, relationships and
//! notifications behind one `&mut` API.
//!
//! Every public mutating call is a turn. At the end of a top-level turn (or of
//! the outermost [`Store::batch`]) pending canonical flushes run once and the
//! relationship notifications they produce are delivered.

use crate::entry::{CacheEntry, ChangedAttribute};
use crate::resource_cache::ResourceCache;
use crate::teardown::DestroyedCache;
use datagraph_core::{
    Attributes, DataGraphError, DefaultLidGenerator, Document, DocumentData, Identifier, IdentifierCache,
    MergePolicy, Notification, NotificationKind, NotificationSink, Notifier, PreferMatchingId,
    RecordStateLookup, RelationshipData, RelationshipPayload, ResourceDocument, ResourceRef,
    Result, SchemaService, StoreConfig, ValidationError,
};
use datagraph_graph::{
    CanonicalUpdate, FetchedRelationship, FlushFailure, FlushStats, Graph, GraphOperation,
    LoadCompletion, LoadDecision, LoadTicket, RelationshipFetcher, RelationshipSnapshot,
    ResolvedData,
};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

pub type SharedStore = Arc<Mutex<Store>>;

pub struct Store {
    pub(crate) config: StoreConfig,
    pub(crate) schema: Arc<dyn SchemaService>,
    pub(crate) identifiers: IdentifierCache,
    pub(crate) cache: ResourceCache,
    pub(crate) graph: Graph,
    pub(crate) notifier: Notifier,
    /// Outstanding `retain` handles per identifier.
    pub(crate) live: FxHashMap<Identifier, usize>,
    pub(crate) unloaded: FxHashSet<Identifier>,
    pub(crate) destroyed: DestroyedCache,
    batch_depth: usize,
    turns: u64,
}

impl Store {
    pub fn new(schema: Arc<dyn SchemaService>) -> Self {
        Self::with_config(schema, StoreConfig::default())
    }

    pub fn with_config(schema: Arc<dyn SchemaService>, config: StoreConfig) -> Self {
        Self::with_merge_policy(schema, config, Box::new(PreferMatchingId))
    }

    pub fn with_merge_policy(
        schema: Arc<dyn SchemaService>,
        config: StoreConfig,
        merge_policy: Box<dyn MergePolicy>,
    ) -> Self {
        let identifiers = IdentifierCache::with_hooks(
            Box::new(DefaultLidGenerator::new(config.lid_prefix.clone())),
            merge_policy,
        );
        Self {
            notifier: Notifier::new(config.notification_buffer),
            graph: Graph::new(schema.clone()),
            identifiers,
            cache: ResourceCache::new(),
            live: FxHashMap::default(),
            unloaded: FxHashSet::default(),
            destroyed: DestroyedCache::default(),
            batch_depth: 0,
            turns: 0,
            schema,
            config,
        }
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    pub fn identifiers(&self) -> &IdentifierCache {
        &self.identifiers
    }

    /// Completed turns, i.e. turn-boundary flushes run so far.
    pub fn turns(&self) -> u64 {
        self.turns
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    pub fn add_sink(&mut self, sink: Arc<dyn NotificationSink>) {
        self.notifier.add_sink(sink);
    }

    pub fn flush_stats(&self) -> FlushStats {
        self.graph.flush_stats()
    }

    // ---- turns ----

    /// Runs `f` as a single turn: flushes and relationship notifications are
    /// deferred until the outermost batch returns. An error from `f` takes
    /// precedence over one from the closing flush.
    pub fn batch<R>(&mut self, f: impl FnOnce(&mut Store) -> Result<R>) -> Result<R> {
        self.batch_depth += 1;
        let result = f(self);
        self.batch_depth -= 1;
        let closed = self.end_turn();
        let value = result?;
        closed?;
        Ok(value)
    }

    /// Runs pending canonical flushes now and closes the turn. The turn is
    /// closed even when an edge fails to flush; the first failure is returned.
    pub fn flush(&mut self) -> Result<FlushStats> {
        let before = self.graph.flush_stats();
        let after = self.graph.flush(&self.cache);
        self.emit_relationship_changes();
        self.destroyed.age(self.turns);
        self.turns += 1;
        if after.flushed > before.flushed {
            debug!(
                "Turn {} flushed {} edge(s)",
                self.turns,
                after.flushed - before.flushed
            );
        }
        match FlushFailure::into_error(self.graph.take_flush_failures()) {
            Some(error) => {
                error!("Turn {} left edges unflushed: {}", self.turns, error);
                Err(error)
            }
            None => Ok(after),
        }
    }

    pub(crate) fn end_turn(&mut self) -> Result<()> {
        if self.batch_depth == 0 && self.config.auto_flush {
            self.flush()?;
        }
        Ok(())
    }

    fn emit_relationship_changes(&mut self) {
        for (owner, field) in self.graph.take_changes() {
            if !owner.is_forgotten() {
                self.notifier
                    .notify(&owner, NotificationKind::Relationships, Some(&field));
            }
        }
    }

    // ---- identity ----

    /// Resolves a reference to its identifier, creating one if needed.
    pub fn identifier_for(&mut self, resource: &ResourceRef) -> Result<Identifier> {
        let identifier = self.resolve(resource)?;
        self.end_turn()?;
        Ok(identifier)
    }

    pub fn peek_identifier(&self, resource: &ResourceRef) -> Result<Option<Identifier>> {
        self.identifiers.peek(resource)
    }

    /// Assigns new identity data; returns the identifier to use from now on.
    pub fn update_identifier(
        &mut self,
        identifier: &Identifier,
        data: &ResourceRef,
    ) -> Result<Identifier> {
        Self::ensure_live(identifier)?;
        let update = self.identifiers.update(identifier, data)?;
        self.propagate_merges()?;
        self.end_turn()?;
        Ok(update.identifier().clone())
    }

    fn resolve(&mut self, resource: &ResourceRef) -> Result<Identifier> {
        if !self.schema.has_type(&resource.type_name) {
            return Err(DataGraphError::UnknownType(resource.type_name.clone()));
        }
        let identifier = self.identifiers.get_or_create(resource)?;
        self.propagate_merges()?;
        Ok(identifier)
    }

    /// Moves every piece of state keyed by an abandoned identifier onto its
    /// survivor.
    fn propagate_merges(&mut self) -> Result<()> {
        for (kept, abandoned) in self.identifiers.take_merges() {
            self.cache.merge(&kept, &abandoned);
            self.graph.merge(&kept, &abandoned)?;
            if let Some(handles) = self.live.remove(&abandoned) {
                *self.live.entry(kept.clone()).or_default() += handles;
            }
            if self.unloaded.remove(&abandoned) && !self.unloaded.contains(&kept) {
                self.unloaded.insert(kept.clone());
            }
            info!("Merged {} into {}", abandoned.lid(), kept);
            self.notifier.notify(&kept, NotificationKind::Identity, None);
        }
        Ok(())
    }

    fn ensure_live(identifier: &Identifier) -> Result<()> {
        if identifier.is_forgotten() {
            return Err(DataGraphError::IdentifierForgotten(identifier.to_string()));
        }
        Ok(())
    }

    // ---- pushing confirmed data ----

    /// Pushes one confirmed resource.
    pub fn push(&mut self, resource: ResourceDocument) -> Result<Identifier> {
        let identifier = self.push_resource(resource)?;
        self.end_turn()?;
        Ok(identifier)
    }

    /// Pushes primary and included resources as a single turn. Returns the
    /// identifiers of the primary data.
    pub fn push_document(&mut self, document: Document) -> Result<Vec<Identifier>> {
        let primary = match &document.data {
            DocumentData::Many(docs) => docs.len(),
            DocumentData::One(doc) => usize::from(doc.is_some()),
        };
        self.batch(|store| {
            let mut identifiers = Vec::new();
            for resource in document.into_resources() {
                identifiers.push(store.push_resource(resource)?);
            }
            identifiers.truncate(primary);
            Ok(identifiers)
        })
    }

    fn push_resource(&mut self, resource: ResourceDocument) -> Result<Identifier> {
        if let Some(attributes) = &resource.attributes {
            for key in attributes.keys() {
                self.attribute_default(&resource.type_name, key)?;
            }
        }
        let identifier = self.resolve(&resource.resource_ref())?;
        if self.cache.is_deletion_committed(&identifier) {
            warn!("Ignoring push for deleted resource {}", identifier);
            return Ok(identifier);
        }

        let outcome = self
            .cache
            .push_data(&identifier, resource.attributes.as_ref(), true);
        self.unloaded.remove(&identifier);
        for key in &outcome.changed_keys {
            self.notifier
                .notify(&identifier, NotificationKind::Attributes, Some(key));
        }
        if outcome.cleared_new {
            self.notifier.notify(&identifier, NotificationKind::State, None);
        }

        if let Some(relationships) = resource.relationships {
            for (field, payload) in relationships {
                self.push_relationship(&identifier, &field, payload)?;
            }
        }
        Ok(identifier)
    }

    fn push_relationship(
        &mut self,
        owner: &Identifier,
        field: &str,
        payload: RelationshipPayload,
    ) -> Result<()> {
        let value = self.resolve_payload(payload)?;
        self.graph.apply(GraphOperation::UpdateRelationship {
            record: owner.clone(),
            field: field.to_string(),
            value,
        })
    }

    fn resolve_payload(&mut self, payload: RelationshipPayload) -> Result<CanonicalUpdate> {
        let link = payload.related_link().map(str::to_string);
        let data = match payload.data {
            None => None,
            Some(RelationshipData::One(member)) => Some(ResolvedData::One(
                member.map(|member| self.resolve(&member)).transpose()?,
            )),
            Some(RelationshipData::Many(members)) => Some(ResolvedData::Many(
                members
                    .iter()
                    .map(|member| self.resolve(member))
                    .collect::<Result<Vec<_>>>()?,
            )),
        };
        Ok(CanonicalUpdate {
            data,
            link,
            meta: payload.meta,
        })
    }

    // ---- record lifecycle ----

    /// Creates a client-side record. Initial attributes are local edits.
    pub fn create_record(
        &mut self,
        type_name: &str,
        id: Option<&str>,
        attributes: Attributes,
    ) -> Result<Identifier> {
        if !self.schema.has_type(type_name) {
            return Err(DataGraphError::UnknownType(type_name.to_string()));
        }
        for key in attributes.keys() {
            self.attribute_default(type_name, key)?;
        }
        let identifier = self.identifiers.create_for_new_record(type_name, id)?;
        self.cache.create(&identifier, attributes);
        debug!("Created record {}", identifier);
        self.notifier.notify(&identifier, NotificationKind::State, None);
        self.end_turn()?;
        Ok(identifier)
    }

    /// Marks a record deleted locally and removes it from its counterparts'
    /// current relationships.
    pub fn delete_record(&mut self, identifier: &Identifier) -> Result<()> {
        Self::ensure_live(identifier)?;
        self.cache.mark_deleted(identifier)?;
        self.graph.apply(GraphOperation::DeleteRecord {
            record: identifier.clone(),
            committed: false,
            is_new: self.cache.is_new(identifier),
        })?;
        self.notifier.notify(identifier, NotificationKind::State, None);
        self.emit_relationship_changes();
        self.end_turn()?;
        Ok(())
    }

    pub fn is_new(&self, identifier: &Identifier) -> bool {
        self.cache.is_new(identifier)
    }

    pub fn is_deleted(&self, identifier: &Identifier) -> bool {
        self.cache.is_deleted(identifier)
    }

    pub fn is_empty(&self, identifier: &Identifier) -> bool {
        RecordStateLookup::is_empty(&self.cache, identifier)
    }

    pub fn is_deletion_committed(&self, identifier: &Identifier) -> bool {
        self.cache.is_deletion_committed(identifier)
    }

    // ---- attributes ----

    /// Visible value of `key`, falling back to the schema default and then
    /// `null`.
    pub fn get_attr(&self, identifier: &Identifier, key: &str) -> Result<Value> {
        Self::ensure_live(identifier)?;
        let default = self.attribute_default(identifier.type_name(), key)?;
        Ok(self
            .cache
            .get_attr(identifier, key)
            .cloned()
            .or(default)
            .unwrap_or(Value::Null))
    }

    pub fn set_attr(&mut self, identifier: &Identifier, key: &str, value: Value) -> Result<()> {
        Self::ensure_live(identifier)?;
        self.attribute_default(identifier.type_name(), key)?;
        self.cache.set_attr(identifier, key, value)?;
        self.notifier
            .notify(identifier, NotificationKind::Attributes, Some(key));
        self.end_turn()?;
        Ok(())
    }

    pub fn changed_attrs(&self, identifier: &Identifier) -> Vec<ChangedAttribute> {
        self.cache.changed_attrs(identifier)
    }

    pub fn has_changed_attrs(&self, identifier: &Identifier) -> bool {
        self.cache.has_changed_attrs(identifier)
    }

    pub fn errors(&self, identifier: &Identifier) -> Vec<ValidationError> {
        self.cache.errors(identifier)
    }

    /// Discards local and in-flight edits. Undoes a local delete; a record
    /// that was never saved is discarded instead.
    pub fn rollback_attrs(&mut self, identifier: &Identifier) -> Result<Vec<String>> {
        Self::ensure_live(identifier)?;
        let outcome = self.cache.rollback_attrs(identifier)?;
        for key in &outcome.dirty_keys {
            self.notifier
                .notify(identifier, NotificationKind::Attributes, Some(key));
        }
        if outcome.undeleted {
            self.graph.restore_record(identifier)?;
            self.notifier.notify(identifier, NotificationKind::State, None);
        }
        if outcome.discarded_new {
            self.graph.apply(GraphOperation::DeleteRecord {
                record: identifier.clone(),
                committed: false,
                is_new: true,
            })?;
            self.notifier.notify(identifier, NotificationKind::State, None);
        }
        self.emit_relationship_changes();
        self.end_turn()?;
        Ok(outcome.dirty_keys)
    }

    /// Effective default for `key`, or an error for undeclared keys in strict
    /// mode.
    fn attribute_default(&self, type_name: &str, key: &str) -> Result<Option<Value>> {
        match self.schema.attribute(type_name, key)? {
            Some(def) => Ok(def.default_value),
            None if self.config.strict_attributes => {
                Err(DataGraphError::unknown_field(type_name, key))
            }
            None => Ok(None),
        }
    }

    // ---- commits ----

    pub fn will_commit(&mut self, identifier: &Identifier) -> Result<()> {
        Self::ensure_live(identifier)?;
        self.cache.will_commit(identifier)?;
        self.end_turn()?;
        Ok(())
    }

    /// Settles a successful save. `data` is the server's echo of the record,
    /// if any; an `id` in it is assigned before anything else.
    pub fn did_commit(
        &mut self,
        identifier: &Identifier,
        data: Option<ResourceDocument>,
    ) -> Result<Identifier> {
        Self::ensure_live(identifier)?;
        self.batch(|store| {
            let mut identifier = identifier.clone();
            if let Some(doc) = &data {
                if doc.type_name != identifier.type_name() {
                    return Err(DataGraphError::IdentityConflict(format!(
                        "commit for {} returned type '{}'",
                        identifier, doc.type_name
                    )));
                }
                if let Some(attributes) = &doc.attributes {
                    for key in attributes.keys() {
                        store.attribute_default(&doc.type_name, key)?;
                    }
                }
                if doc.id.is_some() {
                    let update = store.identifiers.update(&identifier, &doc.resource_ref())?;
                    store.propagate_merges()?;
                    identifier = update.identifier().clone();
                }
            }

            let was_deleted = store.cache.is_deleted(&identifier);
            let attributes = data.as_ref().and_then(|doc| doc.attributes.as_ref());
            let changed = store.cache.did_commit(&identifier, attributes)?;
            for key in &changed {
                store
                    .notifier
                    .notify(&identifier, NotificationKind::Attributes, Some(key));
            }
            store.notifier.notify(&identifier, NotificationKind::State, None);

            if was_deleted {
                store.graph.apply(GraphOperation::DeleteRecord {
                    record: identifier.clone(),
                    committed: true,
                    is_new: false,
                })?;
                store.emit_relationship_changes();
            } else if let Some(relationships) = data.and_then(|doc| doc.relationships) {
                for (field, payload) in relationships {
                    store.push_relationship(&identifier, &field, payload)?;
                }
            }
            Ok(identifier)
        })
    }

    pub fn commit_was_rejected(
        &mut self,
        identifier: &Identifier,
        errors: Vec<ValidationError>,
    ) -> Result<()> {
        Self::ensure_live(identifier)?;
        self.cache.commit_was_rejected(identifier, errors)?;
        self.notifier.notify(identifier, NotificationKind::Errors, None);
        self.end_turn()?;
        Ok(())
    }

    // ---- relationships ----

    pub fn get_relationship_data(&self, owner: &Identifier, field: &str) -> Result<RelationshipSnapshot> {
        Self::ensure_live(owner)?;
        self.graph.get_relationship(owner, field)
    }

    /// Applies confirmed relationship state for one field.
    pub fn update_relationship(
        &mut self,
        owner: &Identifier,
        field: &str,
        payload: RelationshipPayload,
    ) -> Result<()> {
        Self::ensure_live(owner)?;
        self.push_relationship(owner, field, payload)?;
        self.end_turn()?;
        Ok(())
    }

    pub fn replace_related_record(
        &mut self,
        owner: &Identifier,
        field: &str,
        value: Option<Identifier>,
    ) -> Result<()> {
        self.apply_local(GraphOperation::ReplaceRelatedRecord {
            record: owner.clone(),
            field: field.to_string(),
            value,
        })
    }

    pub fn replace_related_records(
        &mut self,
        owner: &Identifier,
        field: &str,
        value: Vec<Identifier>,
    ) -> Result<()> {
        self.apply_local(GraphOperation::ReplaceRelatedRecords {
            record: owner.clone(),
            field: field.to_string(),
            value,
        })
    }

    pub fn add_to_related_records(
        &mut self,
        owner: &Identifier,
        field: &str,
        value: Vec<Identifier>,
        index: Option<usize>,
    ) -> Result<()> {
        self.apply_local(GraphOperation::AddToRelatedRecords {
            record: owner.clone(),
            field: field.to_string(),
            value,
            index,
        })
    }

    pub fn remove_from_related_records(
        &mut self,
        owner: &Identifier,
        field: &str,
        value: Vec<Identifier>,
    ) -> Result<()> {
        self.apply_local(GraphOperation::RemoveFromRelatedRecords {
            record: owner.clone(),
            field: field.to_string(),
            value,
        })
    }

    fn apply_local(&mut self, op: GraphOperation) -> Result<()> {
        if let GraphOperation::ReplaceRelatedRecord {
            value: Some(member),
            ..
        } = &op
        {
            Self::ensure_live(member)?;
        }
        if let GraphOperation::ReplaceRelatedRecords { value, .. }
        | GraphOperation::AddToRelatedRecords { value, .. }
        | GraphOperation::RemoveFromRelatedRecords { value, .. } = &op
        {
            for member in value {
                Self::ensure_live(member)?;
            }
        }
        self.graph.apply(op)?;
        self.emit_relationship_changes();
        self.end_turn()?;
        Ok(())
    }

    /// Discards local relationship edits on every field of `owner`.
    pub fn rollback_relationships(&mut self, owner: &Identifier) -> Result<()> {
        Self::ensure_live(owner)?;
        self.graph.rollback_relationships(owner, &self.cache)?;
        self.emit_relationship_changes();
        self.end_turn()?;
        Ok(())
    }

    // ---- loading ----

    /// Decides whether `owner.field` must be fetched; a returned ticket
    /// supersedes any earlier one for the same edge.
    pub fn begin_relationship_load(
        &mut self,
        owner: &Identifier,
        field: &str,
        force: bool,
    ) -> Result<LoadDecision> {
        Self::ensure_live(owner)?;
        self.graph.begin_load(owner, field, force, &self.cache)
    }

    /// Applies the transport's answer for `ticket`. Stale successes are
    /// dropped; failures are always returned to the caller.
    pub fn complete_relationship_load(
        &mut self,
        ticket: &LoadTicket,
        result: anyhow::Result<FetchedRelationship>,
    ) -> Result<LoadCompletion> {
        match result {
            Ok(fetched) => {
                if self.graph.finish_load(ticket, true) == LoadCompletion::Stale {
                    debug!(
                        "Dropping stale load for {}.{} (token {})",
                        ticket.owner, ticket.field, ticket.token
                    );
                    return Ok(LoadCompletion::Stale);
                }
                self.batch(|store| -> Result<()> {
                    for resource in fetched.included {
                        store.push_resource(resource)?;
                    }
                    store.push_relationship(&ticket.owner, &ticket.field, fetched.relationship)
                })?;
                Ok(LoadCompletion::Applied)
            }
            Err(source) => {
                if self.graph.finish_load(ticket, false) == LoadCompletion::Stale {
                    warn!(
                        "Stale load for {}.{} failed: {}",
                        ticket.owner, ticket.field, source
                    );
                }
                Err(DataGraphError::LoadFailed {
                    owner: ticket.owner.to_string(),
                    field: ticket.field.clone(),
                    source,
                })
            }
        }
    }

    /// Loads `owner.field` through `fetcher` when needed and returns the
    /// resulting relationship.
    pub async fn load_relationship(
        &mut self,
        owner: &Identifier,
        field: &str,
        force: bool,
        fetcher: &dyn RelationshipFetcher,
    ) -> Result<RelationshipSnapshot> {
        if let LoadDecision::Fetch(ticket) = self.begin_relationship_load(owner, field, force)? {
            let result = fetcher.fetch(ticket.request.clone()).await;
            self.complete_relationship_load(&ticket, result)?;
        }
        self.get_relationship_data(owner, field)
    }

    pub fn force_reload(&mut self, owner: &Identifier, field: &str) -> Result<()> {
        Self::ensure_live(owner)?;
        self.graph.force_reload(owner, field)
    }

    // ---- handles ----

    /// Registers a live external handle; a retained identifier blocks the
    /// teardown of its component.
    pub fn retain(&mut self, identifier: &Identifier) -> Result<()> {
        Self::ensure_live(identifier)?;
        *self.live.entry(identifier.clone()).or_default() += 1;
        Ok(())
    }

    pub fn peek_destroyed(&self, identifier: &Identifier) -> Option<&CacheEntry> {
        self.destroyed.get(identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datagraph_core::{InMemorySchema, RelationshipDef, TypeSchema};

    fn manual_store() -> Store {
        let schema = InMemorySchema::new()
            .with_type(
                TypeSchema::new("user")
                    .relationship(RelationshipDef::has_many("posts", "post").inverse("author")),
            )
            .with_type(
                TypeSchema::new("post")
                    .relationship(RelationshipDef::belongs_to("author", "user").inverse("posts")),
            );
        Store::with_config(
            Arc::new(schema),
            StoreConfig {
                auto_flush: false,
                ..Default::default()
            },
        )
    }

    #[test]
    fn flush_reports_failed_edges_and_closes_the_turn() {
        let mut store = manual_store();
        let user = store
            .push(ResourceDocument::new("user", "1").with_relationship(
                "posts",
                RelationshipPayload::many(vec![
                    ResourceRef::new("post", "1"),
                    ResourceRef::new("post", "2"),
                ]),
            ))
            .unwrap();
        let gone = store.identifier_for(&ResourceRef::new("post", "1")).unwrap();
        store.identifiers.forget(&gone).unwrap();
        let turns = store.turns();

        let err = store.flush().unwrap_err();
        assert!(matches!(
            err,
            DataGraphError::FlushFailed { count: 1, ref edge, .. } if edge.ends_with(".posts")
        ));
        assert_eq!(store.turns(), turns + 1);
        assert_eq!(store.flush_stats().failed, 1);
        assert_eq!(store.graph().pending_flushes(), 0);

        // nothing left to fail
        assert!(store.flush().is_ok());
        let kept = store.identifier_for(&ResourceRef::new("post", "2")).unwrap();
        assert_eq!(
            store.get_relationship_data(&kept, "author").unwrap().members(),
            vec![user]
        );
    }
}
