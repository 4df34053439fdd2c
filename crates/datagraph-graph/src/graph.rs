use crate::edge::{
    is_implicit_field, parse_implicit_field, EdgeDefinition, EdgeKind, EdgeState, OrderedSet,
    RelationshipEdge,
};
use crate::operations::{CanonicalUpdate, GraphOperation, ResolvedData};
use crate::scheduler::{EdgeKey, FlushFailure, FlushQueue, FlushStats};
use datagraph_core::{DataGraphError, Identifier, RecordStateLookup, Result, SchemaService};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace, warn};

#[derive(Debug, Default)]
pub(crate) struct NodeEdges {
    pub(crate) explicit: FxHashMap<String, RelationshipEdge>,
    pub(crate) implicit: FxHashMap<String, RelationshipEdge>,
}

impl NodeEdges {
    fn get(&self, field: &str) -> Option<&RelationshipEdge> {
        if is_implicit_field(field) {
            self.implicit.get(field)
        } else {
            self.explicit.get(field)
        }
    }

    fn get_mut(&mut self, field: &str) -> Option<&mut RelationshipEdge> {
        if is_implicit_field(field) {
            self.implicit.get_mut(field)
        } else {
            self.explicit.get_mut(field)
        }
    }

    fn iter(&self) -> impl Iterator<Item = &RelationshipEdge> {
        self.explicit.values().chain(self.implicit.values())
    }
}

/// Read-only view of one relationship as consumers see it.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipSnapshot {
    /// Current members; `None` until any data is known.
    pub data: Option<ResolvedData>,
    pub link: Option<String>,
    pub meta: Option<Value>,
    pub state: EdgeState,
}

impl RelationshipSnapshot {
    pub fn members(&self) -> Vec<Identifier> {
        match &self.data {
            Some(ResolvedData::Many(many)) => many.clone(),
            Some(ResolvedData::One(one)) => one.iter().cloned().collect(),
            None => Vec::new(),
        }
    }
}

/// Relationship graph: every `(identifier, field)` edge with canonical and
/// current membership, inverses kept symmetric.
///
/// Current-state operations apply to both sides immediately. Canonical
/// operations apply to both sides' canonical state and queue the touched edges
/// for a flush that brings current state in line at the turn boundary.
pub struct Graph {
    schema: Arc<dyn SchemaService>,
    pub(crate) nodes: FxHashMap<Identifier, NodeEdges>,
    definitions: FxHashMap<(String, String), Arc<EdgeDefinition>>,
    pub(crate) queue: FlushQueue,
    changed: Vec<EdgeKey>,
    changed_set: FxHashSet<EdgeKey>,
    failures: Vec<FlushFailure>,
}

impl Graph {
    pub fn new(schema: Arc<dyn SchemaService>) -> Self {
        Self {
            schema,
            nodes: FxHashMap::default(),
            definitions: FxHashMap::default(),
            queue: FlushQueue::new(),
            changed: Vec::new(),
            changed_set: FxHashSet::default(),
            failures: Vec::new(),
        }
    }

    pub fn schema(&self) -> &Arc<dyn SchemaService> {
        &self.schema
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn has_edges(&self, identifier: &Identifier) -> bool {
        self.nodes.contains_key(identifier)
    }

    pub fn edge(&self, owner: &Identifier, field: &str) -> Option<&RelationshipEdge> {
        self.nodes.get(owner)?.get(field)
    }

    /// Explicit fields with an edge on `owner`.
    pub fn fields(&self, owner: &Identifier) -> Vec<String> {
        self.nodes
            .get(owner)
            .map(|node| node.explicit.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pending_flushes(&self) -> usize {
        self.queue.len()
    }

    pub fn flush_stats(&self) -> FlushStats {
        self.queue.stats()
    }

    /// Edge flushes that failed since the last call.
    pub fn take_flush_failures(&mut self) -> Vec<FlushFailure> {
        std::mem::take(&mut self.failures)
    }

    /// Explicit edges whose visible value changed since the last call, in the
    /// order they first changed.
    pub fn take_changes(&mut self) -> Vec<EdgeKey> {
        self.changed_set.clear();
        std::mem::take(&mut self.changed)
    }

    pub fn get_relationship(&self, owner: &Identifier, field: &str) -> Result<RelationshipSnapshot> {
        if let Some(edge) = self.edge(owner, field) {
            if edge.is_implicit() {
                return Err(DataGraphError::unknown_field(owner.type_name(), field));
            }
            return Ok(Self::snapshot(edge));
        }
        if is_implicit_field(field) {
            return Err(DataGraphError::unknown_field(owner.type_name(), field));
        }
        self.schema.relationship(owner.type_name(), field)?;
        Ok(RelationshipSnapshot {
            data: None,
            link: None,
            meta: None,
            state: EdgeState {
                is_empty: true,
                ..Default::default()
            },
        })
    }

    fn snapshot(edge: &RelationshipEdge) -> RelationshipSnapshot {
        let data = edge.state.has_any_data.then(|| match edge.definition.kind {
            EdgeKind::BelongsTo => ResolvedData::One(edge.current_one().cloned()),
            EdgeKind::HasMany | EdgeKind::Implicit => ResolvedData::Many(edge.current_members()),
        });
        RelationshipSnapshot {
            data,
            link: edge.link.clone(),
            meta: edge.meta.clone(),
            state: edge.state,
        }
    }

    pub fn apply(&mut self, op: GraphOperation) -> Result<()> {
        let record = op.record().clone();
        if record.is_forgotten() {
            return Err(DataGraphError::IdentifierForgotten(record.to_string()));
        }
        trace!("graph op {} on {}", op.name(), record);
        match op {
            GraphOperation::UpdateRelationship {
                record,
                field,
                value,
            } => {
                self.public_definition(&record, &field)?;
                self.update_relationship(&record, &field, value)
            }
            GraphOperation::ReplaceRelatedRecord {
                record,
                field,
                value,
            } => {
                let def = self.public_definition(&record, &field)?;
                if def.kind != EdgeKind::BelongsTo {
                    return Err(Self::shape_error(&def, "expected a list of members"));
                }
                if let Some(member) = &value {
                    self.check_member(&def, member)?;
                }
                self.begin_local_edit(&record, &field)?;
                self.set_current_one(&record, &field, value)
            }
            GraphOperation::ReplaceRelatedRecords {
                record,
                field,
                value,
            } => {
                let def = self.public_definition(&record, &field)?;
                if def.kind != EdgeKind::HasMany {
                    return Err(Self::shape_error(&def, "expected a single member"));
                }
                for member in &value {
                    self.check_member(&def, member)?;
                }
                self.begin_local_edit(&record, &field)?;
                self.set_current_many(&record, &field, value)
            }
            GraphOperation::AddToRelatedRecords {
                record,
                field,
                value,
                index,
            } => {
                let def = self.public_definition(&record, &field)?;
                if def.kind != EdgeKind::HasMany {
                    return Err(Self::shape_error(&def, "cannot add to a to-one relationship"));
                }
                for member in &value {
                    self.check_member(&def, member)?;
                }
                self.edge_mut(&record, &field)?.state.has_any_data = true;
                for (offset, member) in value.iter().enumerate() {
                    self.add_current(&record, &field, member, index.map(|i| i + offset))?;
                }
                Ok(())
            }
            GraphOperation::RemoveFromRelatedRecords {
                record,
                field,
                value,
            } => {
                let def = self.public_definition(&record, &field)?;
                if def.kind != EdgeKind::HasMany {
                    return Err(Self::shape_error(
                        &def,
                        "cannot remove from a to-one relationship",
                    ));
                }
                for member in &value {
                    self.remove_current(&record, &field, member)?;
                }
                Ok(())
            }
            GraphOperation::DeleteRecord {
                record,
                committed,
                is_new,
            } => self.delete_record(&record, committed, is_new),
        }
    }

    /// Applies confirmed relationship state.
    pub fn update_relationship(
        &mut self,
        owner: &Identifier,
        field: &str,
        update: CanonicalUpdate,
    ) -> Result<()> {
        let def = self.definition(owner.type_name(), field)?;
        if let Some(data) = &update.data {
            match (data, def.is_many()) {
                (ResolvedData::Many(members), true) => {
                    for member in members {
                        self.check_member(&def, member)?;
                    }
                }
                (ResolvedData::One(member), false) => {
                    if let Some(member) = member {
                        self.check_member(&def, member)?;
                    }
                }
                (ResolvedData::Many(_), false) => {
                    return Err(Self::shape_error(&def, "expected a single member or null"))
                }
                (ResolvedData::One(_), true) => {
                    return Err(Self::shape_error(&def, "expected a list of members"))
                }
            }
        }

        let (link_changed, has_any_data) = {
            let edge = self.edge_mut(owner, field)?;
            if let Some(meta) = update.meta {
                edge.meta = Some(meta);
            }
            let mut link_changed = false;
            if let Some(link) = update.link {
                if edge.link.as_deref() != Some(link.as_str()) {
                    edge.link = Some(link);
                    edge.pending_load = None;
                    link_changed = true;
                }
            }
            edge.state.has_failed_load_attempt = false;
            (link_changed, edge.state.has_any_data)
        };

        let data = match update.data {
            Some(data) => Some(data),
            // a synchronous relationship without data is known to be empty
            None if !def.is_async && !has_any_data && !def.is_implicit() => Some(if def.is_many() {
                ResolvedData::Many(Vec::new())
            } else {
                ResolvedData::One(None)
            }),
            None => None,
        };

        match data {
            Some(data) => {
                let is_empty = data.is_empty();
                match data {
                    ResolvedData::Many(members) => self.set_canonical_many(owner, field, members)?,
                    ResolvedData::One(member) => self.set_canonical_one(owner, field, member)?,
                }
                let edge = self.edge_mut(owner, field)?;
                edge.state.has_received_data = true;
                edge.state.has_any_data = true;
                edge.state.is_stale = false;
                edge.state.has_dematerialized_inverse = false;
                edge.state.is_empty = is_empty;
                edge.state.will_sync = true;
                self.queue.schedule(owner, field);
            }
            None if link_changed => {
                self.edge_mut(owner, field)?.state.is_stale = true;
            }
            None => {}
        }
        Ok(())
    }

    /// Runs every queued flush. Relationship changes are collected and only
    /// visible through [`Graph::take_changes`] once all edges are flushed.
    /// An edge that fails does not stop the others; its error is kept for
    /// [`Graph::take_flush_failures`].
    pub fn flush(&mut self, state: &dyn RecordStateLookup) -> FlushStats {
        let mut flushed = 0usize;
        while !self.queue.is_empty() {
            for (owner, field) in self.queue.drain() {
                if owner.is_forgotten() {
                    continue;
                }
                match self.flush_edge(&owner, &field, state) {
                    Ok(true) => flushed += 1,
                    Ok(false) => {}
                    Err(error) => {
                        warn!("Flush of {}.{} failed: {}", owner, field, error);
                        self.queue.record_failure();
                        self.failures.push(FlushFailure {
                            owner,
                            field,
                            error,
                        });
                    }
                }
            }
        }
        if flushed > 0 {
            self.queue.record_flush(flushed);
            debug!("Flushed {} relationship edges", flushed);
        }
        self.queue.stats()
    }

    fn flush_edge(
        &mut self,
        owner: &Identifier,
        field: &str,
        state: &dyn RecordStateLookup,
    ) -> Result<bool> {
        let (is_many, canonical, current) = {
            let Some(edge) = self.edge_existing_mut(owner, field) else {
                return Ok(false);
            };
            edge.state.will_sync = false;
            (
                edge.definition.is_many(),
                edge.canonical_members(),
                edge.current_members(),
            )
        };
        // a locally deleted owner keeps its own edges untouched for rollback
        if state.is_deleted(owner) {
            return Ok(false);
        }
        let owner_is_new = state.is_new(owner);

        if is_many {
            let canonical_set = OrderedSet::from_members(canonical.iter().cloned());
            let mut target: Vec<Identifier> = canonical
                .into_iter()
                .filter(|m| !state.is_deleted(m))
                .collect();
            for member in current {
                if canonical_set.contains(&member) || state.is_deleted(&member) {
                    continue;
                }
                if owner_is_new || state.is_new(&member) {
                    target.push(member);
                }
            }
            self.set_current_many(owner, field, target)?;
        } else {
            let canonical = canonical.into_iter().next().filter(|m| !state.is_deleted(m));
            let current = current.into_iter().next();
            let retain = canonical.is_none()
                && current
                    .as_ref()
                    .is_some_and(|c| (owner_is_new || state.is_new(c)) && !state.is_deleted(c));
            if !retain {
                self.set_current_one(owner, field, canonical)?;
            }
        }
        trace!("flushed {}.{}", owner, field);
        Ok(true)
    }

    /// Resets every explicit edge of `owner` to its canonical state.
    pub fn rollback_relationships(
        &mut self,
        owner: &Identifier,
        state: &dyn RecordStateLookup,
    ) -> Result<()> {
        let Some(node) = self.nodes.get(owner) else {
            return Ok(());
        };
        let edges: Vec<(String, bool, Vec<Identifier>)> = node
            .explicit
            .values()
            .map(|edge| {
                (
                    edge.field().to_string(),
                    edge.definition.is_many(),
                    edge.canonical_members(),
                )
            })
            .collect();
        for (field, is_many, canonical) in edges {
            let canonical: Vec<Identifier> = canonical
                .into_iter()
                .filter(|m| !state.is_deleted(m))
                .collect();
            if is_many {
                self.set_current_many(owner, &field, canonical)?;
            } else {
                self.set_current_one(owner, &field, canonical.into_iter().next())?;
            }
        }
        Ok(())
    }

    fn delete_record(&mut self, record: &Identifier, committed: bool, is_new: bool) -> Result<()> {
        let Some(node) = self.nodes.get(record) else {
            return Ok(());
        };
        let edges: Vec<(Option<String>, Vec<Identifier>)> = node
            .iter()
            .map(|edge| (edge.definition.inverse.clone(), edge.all_members()))
            .collect();

        let drop_everything = committed || is_new;
        for (inverse, members) in edges {
            let Some(inverse) = inverse else {
                continue;
            };
            for member in members {
                if member == *record {
                    continue;
                }
                let mut touched = false;
                if let Some(edge) = self.edge_existing_mut(&member, &inverse) {
                    touched = edge.drop_current(record);
                    if drop_everything {
                        edge.drop_canonical(record);
                    }
                }
                if touched {
                    self.touch(&member, &inverse);
                }
            }
        }

        if drop_everything {
            if let Some(node) = self.nodes.remove(record) {
                for field in node.explicit.keys() {
                    self.touch(record, field);
                }
            }
            self.queue.purge(record);
        }
        debug!(
            "Deleted {} from graph (committed={}, new={})",
            record, committed, is_new
        );
        Ok(())
    }

    /// Puts a locally deleted record back into its counterparts' current state.
    pub fn restore_record(&mut self, record: &Identifier) -> Result<()> {
        let Some(node) = self.nodes.get(record) else {
            return Ok(());
        };
        let edges: Vec<(Option<String>, Vec<Identifier>)> = node
            .iter()
            .map(|edge| (edge.definition.inverse.clone(), edge.current_members()))
            .collect();
        for (inverse, members) in edges {
            let Some(inverse) = inverse else {
                continue;
            };
            for member in members {
                let edge = self.edge_mut(&member, &inverse)?;
                edge.state.has_any_data = true;
                if edge.insert_current(record.clone(), None) {
                    self.touch(&member, &inverse);
                }
            }
        }
        Ok(())
    }

    /// Moves every edge of `abandoned` onto `kept` and rewrites inverse
    /// references, including queued flushes.
    pub fn merge(&mut self, kept: &Identifier, abandoned: &Identifier) -> Result<()> {
        if let Some(node) = self.nodes.remove(abandoned) {
            for edge in node.iter() {
                let Some(inverse) = edge.definition.inverse.as_deref() else {
                    continue;
                };
                for member in edge.all_members() {
                    let member = if member == *abandoned {
                        kept.clone()
                    } else {
                        member
                    };
                    if let Some(mirror) = self.edge_existing_mut(&member, inverse) {
                        mirror.swap_member(abandoned, kept);
                    }
                }
            }

            // to-one conflicts: the survivor's value wins, the loser's mirror drops kept
            let mut unlink: Vec<(Identifier, String, bool)> = Vec::new();
            let kept_node = self.nodes.entry(kept.clone()).or_default();
            let NodeEdges { explicit, implicit } = node;
            for (field, mut edge) in explicit.into_iter().chain(implicit) {
                edge.identifier = kept.clone();
                edge.swap_member(abandoned, kept);
                let target = if edge.is_implicit() {
                    &mut kept_node.implicit
                } else {
                    &mut kept_node.explicit
                };
                match target.get_mut(&field) {
                    Some(existing) => {
                        if let Some(inverse) = edge.definition.inverse.clone() {
                            if let (Some(a), Some(b)) = (existing.canonical_one(), edge.canonical_one()) {
                                if a != b {
                                    unlink.push((b.clone(), inverse.clone(), true));
                                }
                            }
                            if let (Some(a), Some(b)) = (existing.current_one(), edge.current_one()) {
                                if a != b {
                                    unlink.push((b.clone(), inverse, false));
                                }
                            }
                        }
                        existing.absorb(edge);
                    }
                    None => {
                        target.insert(field, edge);
                    }
                }
            }
            for (member, inverse, canonical) in unlink {
                if let Some(mirror) = self.edge_existing_mut(&member, &inverse) {
                    if canonical {
                        mirror.drop_canonical(kept);
                    } else {
                        mirror.drop_current(kept);
                    }
                }
            }
        }

        self.queue.rename(abandoned, kept);
        let changed = std::mem::take(&mut self.changed);
        self.changed_set.clear();
        for (owner, field) in changed {
            let owner = if owner == *abandoned {
                kept.clone()
            } else {
                owner
            };
            self.touch(&owner, &field);
        }
        debug!("Merged graph state of {} into {}", abandoned.lid(), kept.lid());
        Ok(())
    }

    /// Identifiers directly related to `identifier` through any edge.
    pub fn neighbours(&self, identifier: &Identifier) -> Vec<Identifier> {
        let Some(node) = self.nodes.get(identifier) else {
            return Vec::new();
        };
        let mut out = OrderedSet::new();
        for edge in node.iter() {
            for member in edge.all_members() {
                if member != *identifier {
                    out.push(member);
                }
            }
        }
        out.to_vec()
    }

    /// Breadth-first over current and canonical membership of explicit and
    /// implicit edges. The start is always first.
    pub fn connected_component(&self, start: &Identifier) -> Vec<Identifier> {
        let mut visited: FxHashSet<Identifier> = FxHashSet::default();
        let mut order = Vec::new();
        let mut queue = VecDeque::new();
        visited.insert(start.clone());
        queue.push_back(start.clone());
        while let Some(current) = queue.pop_front() {
            for next in self.neighbours(&current) {
                if visited.insert(next.clone()) {
                    queue.push_back(next);
                }
            }
            order.push(current);
        }
        order
    }

    /// Flags async edges that point back at `identifier` so the next access
    /// refetches.
    pub fn mark_inverse_dematerialized(&mut self, identifier: &Identifier) {
        let Some(node) = self.nodes.get(identifier) else {
            return;
        };
        let mirrors: Vec<(Identifier, String)> = node
            .iter()
            .filter_map(|edge| {
                edge.definition
                    .inverse
                    .clone()
                    .map(|inverse| (edge.all_members(), inverse))
            })
            .flat_map(|(members, inverse)| members.into_iter().map(move |m| (m, inverse.clone())))
            .collect();
        for (member, inverse) in mirrors {
            if let Some(edge) = self.edge_existing_mut(&member, &inverse) {
                if edge.definition.is_async {
                    edge.state.has_dematerialized_inverse = true;
                }
            }
        }
    }

    /// Drops every edge of `identifier` without notifying.
    pub fn release(&mut self, identifier: &Identifier) {
        if let Some(node) = self.nodes.remove(identifier) {
            for edge in node.iter() {
                let Some(inverse) = edge.definition.inverse.as_deref() else {
                    continue;
                };
                for member in edge.all_members() {
                    if let Some(mirror) = self.edge_existing_mut(&member, inverse) {
                        mirror.drop_current(identifier);
                        mirror.drop_canonical(identifier);
                    }
                }
            }
        }
        self.queue.purge(identifier);
        self.changed.retain(|(owner, _)| owner != identifier);
        self.changed_set.retain(|(owner, _)| owner != identifier);
        trace!("released graph node {}", identifier.lid());
    }

    // ---- canonical mechanics ----

    fn add_canonical(
        &mut self,
        owner: &Identifier,
        field: &str,
        member: &Identifier,
        index: Option<usize>,
    ) -> Result<()> {
        let def = self.definition(owner.type_name(), field)?;
        self.check_member(&def, member)?;
        let previous = {
            let edge = self.edge_mut(owner, field)?;
            if edge.has_canonical(member) {
                return Ok(());
            }
            let previous = edge.canonical_one().cloned();
            edge.insert_canonical(member.clone(), index);
            edge.state.will_sync = true;
            previous
        };
        self.queue.schedule(owner, field);
        if let Some(inverse) = def.inverse.as_deref() {
            if let Some(previous) = previous {
                self.remove_canonical(&previous, inverse, owner)?;
            }
            self.add_canonical(member, inverse, owner, None)?;
        }
        Ok(())
    }

    fn remove_canonical(&mut self, owner: &Identifier, field: &str, member: &Identifier) -> Result<()> {
        let def = self.definition(owner.type_name(), field)?;
        let Some(edge) = self.edge_existing_mut(owner, field) else {
            return Ok(());
        };
        if !edge.drop_canonical(member) {
            return Ok(());
        }
        edge.state.will_sync = true;
        self.queue.schedule(owner, field);
        if let Some(inverse) = def.inverse.as_deref() {
            self.remove_canonical(member, inverse, owner)?;
        }
        Ok(())
    }

    fn set_canonical_one(
        &mut self,
        owner: &Identifier,
        field: &str,
        member: Option<Identifier>,
    ) -> Result<()> {
        match member {
            Some(member) => self.add_canonical(owner, field, &member, None),
            None => {
                let previous = self.edge_mut(owner, field)?.canonical_one().cloned();
                match previous {
                    Some(previous) => self.remove_canonical(owner, field, &previous),
                    None => Ok(()),
                }
            }
        }
    }

    fn set_canonical_many(
        &mut self,
        owner: &Identifier,
        field: &str,
        members: Vec<Identifier>,
    ) -> Result<()> {
        let target = OrderedSet::from_members(members);
        let existing = self.edge_mut(owner, field)?.canonical_members();
        for member in existing {
            if !target.contains(&member) {
                self.remove_canonical(owner, field, &member)?;
            }
        }
        for (index, member) in target.iter().enumerate() {
            let present = self.edge_mut(owner, field)?.has_canonical(member);
            if present {
                self.edge_mut(owner, field)?.move_canonical(member, index);
            } else {
                self.add_canonical(owner, field, member, Some(index))?;
            }
        }
        Ok(())
    }

    // ---- current mechanics ----

    fn add_current(
        &mut self,
        owner: &Identifier,
        field: &str,
        member: &Identifier,
        index: Option<usize>,
    ) -> Result<()> {
        let def = self.definition(owner.type_name(), field)?;
        self.check_member(&def, member)?;
        let previous = {
            let edge = self.edge_mut(owner, field)?;
            if edge.has_current(member) {
                return Ok(());
            }
            let previous = edge.current_one().cloned();
            edge.insert_current(member.clone(), index);
            edge.state.has_any_data = true;
            previous
        };
        self.touch(owner, field);
        if let Some(inverse) = def.inverse.as_deref() {
            if let Some(previous) = previous {
                self.remove_current(&previous, inverse, owner)?;
            }
            self.add_current(member, inverse, owner, None)?;
        }
        Ok(())
    }

    fn remove_current(&mut self, owner: &Identifier, field: &str, member: &Identifier) -> Result<()> {
        let def = self.definition(owner.type_name(), field)?;
        let Some(edge) = self.edge_existing_mut(owner, field) else {
            return Ok(());
        };
        if !edge.drop_current(member) {
            return Ok(());
        }
        self.touch(owner, field);
        if let Some(inverse) = def.inverse.as_deref() {
            self.remove_current(member, inverse, owner)?;
        }
        Ok(())
    }

    fn set_current_one(
        &mut self,
        owner: &Identifier,
        field: &str,
        member: Option<Identifier>,
    ) -> Result<()> {
        let previous = {
            let edge = self.edge_mut(owner, field)?;
            edge.state.has_any_data = true;
            edge.current_one().cloned()
        };
        match (member, previous) {
            (Some(member), _) => self.add_current(owner, field, &member, None),
            (None, Some(previous)) => self.remove_current(owner, field, &previous),
            (None, None) => Ok(()),
        }
    }

    fn set_current_many(
        &mut self,
        owner: &Identifier,
        field: &str,
        members: Vec<Identifier>,
    ) -> Result<()> {
        let target = OrderedSet::from_members(members);
        let existing = {
            let edge = self.edge_mut(owner, field)?;
            edge.state.has_any_data = true;
            edge.current_members()
        };
        for member in existing {
            if !target.contains(&member) {
                self.remove_current(owner, field, &member)?;
            }
        }
        for (index, member) in target.iter().enumerate() {
            let present = self.edge_mut(owner, field)?.has_current(member);
            if present {
                if self.edge_mut(owner, field)?.move_current(member, index) {
                    self.touch(owner, field);
                }
            } else {
                self.add_current(owner, field, member, Some(index))?;
            }
        }
        Ok(())
    }

    // ---- plumbing ----

    fn begin_local_edit(&mut self, owner: &Identifier, field: &str) -> Result<()> {
        let edge = self.edge_mut(owner, field)?;
        if edge.pending_load.take().is_some() {
            debug!("Local edit of {}.{} supersedes pending load", owner, field);
        }
        Ok(())
    }

    fn touch(&mut self, owner: &Identifier, field: &str) {
        if is_implicit_field(field) {
            return;
        }
        let key = (owner.clone(), field.to_string());
        if self.changed_set.insert(key.clone()) {
            self.changed.push(key);
        }
    }

    fn public_definition(&mut self, owner: &Identifier, field: &str) -> Result<Arc<EdgeDefinition>> {
        if is_implicit_field(field) {
            return Err(DataGraphError::unknown_field(owner.type_name(), field));
        }
        self.definition(owner.type_name(), field)
    }

    pub(crate) fn definition(&mut self, type_name: &str, field: &str) -> Result<Arc<EdgeDefinition>> {
        let key = (type_name.to_string(), field.to_string());
        if let Some(def) = self.definitions.get(&key) {
            return Ok(def.clone());
        }
        let def = match parse_implicit_field(field) {
            Some((owner_type, source_field)) => {
                let source = self.definition(owner_type, source_field)?;
                EdgeDefinition::implicit(type_name, &source)
            }
            None => {
                let rel = self.schema.relationship(type_name, field)?;
                EdgeDefinition::explicit(type_name, &rel)
            }
        };
        let def = Arc::new(def);
        self.definitions.insert(key, def.clone());
        Ok(def)
    }

    pub(crate) fn edge_mut(&mut self, owner: &Identifier, field: &str) -> Result<&mut RelationshipEdge> {
        if owner.is_forgotten() {
            return Err(DataGraphError::IdentifierForgotten(owner.to_string()));
        }
        let def = self.definition(owner.type_name(), field)?;
        let node = self.nodes.entry(owner.clone()).or_default();
        let edges = if def.is_implicit() {
            &mut node.implicit
        } else {
            &mut node.explicit
        };
        Ok(edges
            .entry(field.to_string())
            .or_insert_with(|| RelationshipEdge::new(owner.clone(), def)))
    }

    pub(crate) fn edge_existing_mut(
        &mut self,
        owner: &Identifier,
        field: &str,
    ) -> Option<&mut RelationshipEdge> {
        self.nodes.get_mut(owner)?.get_mut(field)
    }

    fn check_member(&self, def: &EdgeDefinition, member: &Identifier) -> Result<()> {
        if member.is_forgotten() {
            return Err(DataGraphError::IdentifierForgotten(member.to_string()));
        }
        if def.is_implicit() || member.type_name() == def.related_type {
            return Ok(());
        }
        if def.is_polymorphic
            && self
                .schema
                .is_polymorphic_compatible(member.type_name(), &def.related_type)
        {
            return Ok(());
        }
        Err(DataGraphError::PolymorphicTypeMismatch {
            type_name: def.owner_type.clone(),
            field: def.field.clone(),
            expected: def.related_type.clone(),
            actual: member.type_name().to_string(),
        })
    }

    fn shape_error(def: &EdgeDefinition, reason: &str) -> DataGraphError {
        DataGraphError::InvalidRelationshipData {
            type_name: def.owner_type.clone(),
            field: def.field.clone(),
            reason: reason.to_string(),
        }
    }
}
