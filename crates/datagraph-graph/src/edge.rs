use datagraph_core::{Identifier, RelationshipDef, RelationshipKind};
use rustc_hash::FxHashSet;
use serde_json::Value;
use std::sync::Arc;

pub const IMPLICIT_PREFIX: &str = "__implicit:";

/// Name of the implicit back-reference edge that `owner_type.field` creates
/// on its members.
pub fn implicit_field_name(owner_type: &str, field: &str) -> String {
    format!("{}{}:{}", IMPLICIT_PREFIX, owner_type, field)
}

pub fn is_implicit_field(field: &str) -> bool {
    field.starts_with(IMPLICIT_PREFIX)
}

/// Splits `__implicit:{owner_type}:{field}` into its parts.
pub fn parse_implicit_field(field: &str) -> Option<(&str, &str)> {
    field.strip_prefix(IMPLICIT_PREFIX)?.split_once(':')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    BelongsTo,
    HasMany,
    Implicit,
}

impl From<RelationshipKind> for EdgeKind {
    fn from(kind: RelationshipKind) -> Self {
        match kind {
            RelationshipKind::BelongsTo => EdgeKind::BelongsTo,
            RelationshipKind::HasMany => EdgeKind::HasMany,
        }
    }
}

/// Resolved metadata for one `(owner_type, field)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeDefinition {
    pub owner_type: String,
    pub field: String,
    pub kind: EdgeKind,
    pub related_type: String,
    /// Field on the member that points back here. For an inverse-less
    /// relationship this is the implicit edge name.
    pub inverse: Option<String>,
    pub is_async: bool,
    pub is_polymorphic: bool,
}

impl EdgeDefinition {
    pub fn explicit(owner_type: &str, def: &RelationshipDef) -> Self {
        let inverse = def
            .inverse
            .clone()
            .or_else(|| Some(implicit_field_name(owner_type, &def.name)));
        Self {
            owner_type: owner_type.to_string(),
            field: def.name.clone(),
            kind: def.kind.into(),
            related_type: def.type_name.clone(),
            inverse,
            is_async: def.is_async,
            is_polymorphic: def.is_polymorphic,
        }
    }

    /// Back-reference edge living on `member_type` for `source.field`.
    pub fn implicit(member_type: &str, source: &EdgeDefinition) -> Self {
        Self {
            owner_type: member_type.to_string(),
            field: implicit_field_name(&source.owner_type, &source.field),
            kind: EdgeKind::Implicit,
            related_type: source.owner_type.clone(),
            inverse: Some(source.field.clone()),
            is_async: false,
            is_polymorphic: true,
        }
    }

    pub fn is_implicit(&self) -> bool {
        self.kind == EdgeKind::Implicit
    }

    pub fn is_many(&self) -> bool {
        self.kind != EdgeKind::BelongsTo
    }
}

/// Insertion-ordered set of identifiers.
#[derive(Debug, Clone, Default)]
pub struct OrderedSet {
    items: Vec<Identifier>,
    index: FxHashSet<Identifier>,
}

impl OrderedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_members<I: IntoIterator<Item = Identifier>>(members: I) -> Self {
        let mut set = Self::new();
        for member in members {
            set.push(member);
        }
        set
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, member: &Identifier) -> bool {
        self.index.contains(member)
    }

    pub fn position(&self, member: &Identifier) -> Option<usize> {
        if !self.contains(member) {
            return None;
        }
        self.items.iter().position(|m| m == member)
    }

    pub fn push(&mut self, member: Identifier) -> bool {
        self.insert(member, None)
    }

    /// Inserts at `index` (clamped), or appends. No-op if already present.
    pub fn insert(&mut self, member: Identifier, index: Option<usize>) -> bool {
        if !self.index.insert(member.clone()) {
            return false;
        }
        match index {
            Some(i) if i < self.items.len() => self.items.insert(i, member),
            _ => self.items.push(member),
        }
        true
    }

    pub fn remove(&mut self, member: &Identifier) -> Option<usize> {
        if !self.index.remove(member) {
            return None;
        }
        let position = self.items.iter().position(|m| m == member)?;
        self.items.remove(position);
        Some(position)
    }

    /// Moves an existing member to `index` (clamped).
    pub fn move_to(&mut self, member: &Identifier, index: usize) -> bool {
        let Some(from) = self.position(member) else {
            return false;
        };
        let item = self.items.remove(from);
        let to = index.min(self.items.len());
        self.items.insert(to, item);
        from != to
    }

    /// Swaps `old` for `new` in place. When `new` is already present `old`
    /// is just dropped.
    pub fn replace(&mut self, old: &Identifier, new: Identifier) -> bool {
        if !self.contains(old) {
            return false;
        }
        if self.contains(&new) {
            self.remove(old);
            return true;
        }
        if let Some(position) = self.items.iter().position(|m| m == old) {
            self.index.remove(old);
            self.index.insert(new.clone());
            self.items[position] = new;
        }
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &Identifier> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[Identifier] {
        &self.items
    }

    pub fn to_vec(&self) -> Vec<Identifier> {
        self.items.clone()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.index.clear();
    }
}

impl PartialEq for OrderedSet {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Membership {
    One {
        canonical_state: Option<Identifier>,
        current_state: Option<Identifier>,
    },
    Many {
        canonical_members: OrderedSet,
        members: OrderedSet,
    },
}

impl Membership {
    fn for_kind(kind: EdgeKind) -> Self {
        match kind {
            EdgeKind::BelongsTo => Membership::One {
                canonical_state: None,
                current_state: None,
            },
            EdgeKind::HasMany | EdgeKind::Implicit => Membership::Many {
                canonical_members: OrderedSet::new(),
                members: OrderedSet::new(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EdgeState {
    pub has_received_data: bool,
    pub has_any_data: bool,
    pub is_stale: bool,
    pub is_empty: bool,
    pub has_dematerialized_inverse: bool,
    pub has_failed_load_attempt: bool,
    pub should_force_reload: bool,
    pub will_sync: bool,
}

/// One `(owner, field)` relationship with its canonical and current views.
#[derive(Debug, Clone)]
pub struct RelationshipEdge {
    pub identifier: Identifier,
    pub definition: Arc<EdgeDefinition>,
    pub membership: Membership,
    pub state: EdgeState,
    pub link: Option<String>,
    pub meta: Option<Value>,
    pub(crate) load_generation: u64,
    pub(crate) pending_load: Option<u64>,
}

impl RelationshipEdge {
    pub fn new(identifier: Identifier, definition: Arc<EdgeDefinition>) -> Self {
        let membership = Membership::for_kind(definition.kind);
        Self {
            identifier,
            definition,
            membership,
            state: EdgeState {
                is_empty: true,
                ..Default::default()
            },
            link: None,
            meta: None,
            load_generation: 0,
            pending_load: None,
        }
    }

    pub fn field(&self) -> &str {
        &self.definition.field
    }

    pub fn is_implicit(&self) -> bool {
        self.definition.is_implicit()
    }

    pub fn has_pending_load(&self) -> bool {
        self.pending_load.is_some()
    }

    pub fn canonical_members(&self) -> Vec<Identifier> {
        match &self.membership {
            Membership::One {
                canonical_state, ..
            } => canonical_state.iter().cloned().collect(),
            Membership::Many {
                canonical_members, ..
            } => canonical_members.to_vec(),
        }
    }

    pub fn current_members(&self) -> Vec<Identifier> {
        match &self.membership {
            Membership::One { current_state, .. } => current_state.iter().cloned().collect(),
            Membership::Many { members, .. } => members.to_vec(),
        }
    }

    /// Canonical and current members, each once.
    pub fn all_members(&self) -> Vec<Identifier> {
        let mut all = OrderedSet::from_members(self.current_members());
        for member in self.canonical_members() {
            all.push(member);
        }
        all.to_vec()
    }

    pub fn has_canonical(&self, member: &Identifier) -> bool {
        match &self.membership {
            Membership::One {
                canonical_state, ..
            } => canonical_state.as_ref() == Some(member),
            Membership::Many {
                canonical_members, ..
            } => canonical_members.contains(member),
        }
    }

    pub fn has_current(&self, member: &Identifier) -> bool {
        match &self.membership {
            Membership::One { current_state, .. } => current_state.as_ref() == Some(member),
            Membership::Many { members, .. } => members.contains(member),
        }
    }

    pub fn canonical_one(&self) -> Option<&Identifier> {
        match &self.membership {
            Membership::One {
                canonical_state, ..
            } => canonical_state.as_ref(),
            Membership::Many { .. } => None,
        }
    }

    pub fn current_one(&self) -> Option<&Identifier> {
        match &self.membership {
            Membership::One { current_state, .. } => current_state.as_ref(),
            Membership::Many { .. } => None,
        }
    }

    pub(crate) fn insert_canonical(&mut self, member: Identifier, index: Option<usize>) -> bool {
        match &mut self.membership {
            Membership::One {
                canonical_state, ..
            } => {
                if canonical_state.as_ref() == Some(&member) {
                    return false;
                }
                *canonical_state = Some(member);
                true
            }
            Membership::Many {
                canonical_members, ..
            } => canonical_members.insert(member, index),
        }
    }

    pub(crate) fn drop_canonical(&mut self, member: &Identifier) -> bool {
        match &mut self.membership {
            Membership::One {
                canonical_state, ..
            } => {
                if canonical_state.as_ref() != Some(member) {
                    return false;
                }
                *canonical_state = None;
                true
            }
            Membership::Many {
                canonical_members, ..
            } => canonical_members.remove(member).is_some(),
        }
    }

    pub(crate) fn insert_current(&mut self, member: Identifier, index: Option<usize>) -> bool {
        match &mut self.membership {
            Membership::One { current_state, .. } => {
                if current_state.as_ref() == Some(&member) {
                    return false;
                }
                *current_state = Some(member);
                true
            }
            Membership::Many { members, .. } => members.insert(member, index),
        }
    }

    pub(crate) fn drop_current(&mut self, member: &Identifier) -> bool {
        match &mut self.membership {
            Membership::One { current_state, .. } => {
                if current_state.as_ref() != Some(member) {
                    return false;
                }
                *current_state = None;
                true
            }
            Membership::Many { members, .. } => members.remove(member).is_some(),
        }
    }

    pub(crate) fn move_canonical(&mut self, member: &Identifier, index: usize) -> bool {
        match &mut self.membership {
            Membership::Many {
                canonical_members, ..
            } => canonical_members.move_to(member, index),
            Membership::One { .. } => false,
        }
    }

    pub(crate) fn move_current(&mut self, member: &Identifier, index: usize) -> bool {
        match &mut self.membership {
            Membership::Many { members, .. } => members.move_to(member, index),
            Membership::One { .. } => false,
        }
    }

    /// Replaces `old` with `new` in both views without touching inverses.
    pub(crate) fn swap_member(&mut self, old: &Identifier, new: &Identifier) -> bool {
        match &mut self.membership {
            Membership::One {
                canonical_state,
                current_state,
            } => {
                let mut changed = false;
                for slot in [canonical_state, current_state] {
                    if slot.as_ref() == Some(old) {
                        *slot = Some(new.clone());
                        changed = true;
                    }
                }
                changed
            }
            Membership::Many {
                canonical_members,
                members,
            } => {
                let a = canonical_members.replace(old, new.clone());
                let b = members.replace(old, new.clone());
                a || b
            }
        }
    }

    /// Folds another edge for the same field into this one. Members already
    /// here keep their position; a set to-one value wins.
    pub(crate) fn absorb(&mut self, other: RelationshipEdge) {
        match (&mut self.membership, other.membership) {
            (
                Membership::One {
                    canonical_state,
                    current_state,
                },
                Membership::One {
                    canonical_state: other_canonical,
                    current_state: other_current,
                },
            ) => {
                if canonical_state.is_none() {
                    *canonical_state = other_canonical;
                }
                if current_state.is_none() {
                    *current_state = other_current;
                }
            }
            (
                Membership::Many {
                    canonical_members,
                    members,
                },
                Membership::Many {
                    canonical_members: other_canonical,
                    members: other_members,
                },
            ) => {
                for member in other_canonical.iter() {
                    canonical_members.push(member.clone());
                }
                for member in other_members.iter() {
                    members.push(member.clone());
                }
            }
            _ => {}
        }
        let s = &mut self.state;
        let o = other.state;
        s.has_received_data |= o.has_received_data;
        s.has_any_data |= o.has_any_data;
        s.is_stale |= o.is_stale;
        s.has_dematerialized_inverse |= o.has_dematerialized_inverse;
        s.has_failed_load_attempt |= o.has_failed_load_attempt;
        s.should_force_reload |= o.should_force_reload;
        s.will_sync |= o.will_sync;
        let empty = self.canonical_members().is_empty() && self.current_members().is_empty();
        self.state.is_empty = empty;
        if self.link.is_none() {
            self.link = other.link;
        }
        if self.meta.is_none() {
            self.meta = other.meta;
        }
    }
}
