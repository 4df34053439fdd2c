use crate::identifier::Identifier;

/// Lifecycle facts about a resource, answered by whoever owns attribute state.
/// The relationship graph consults this during flushes and loads.
pub trait RecordStateLookup {
    fn is_new(&self, identifier: &Identifier) -> bool;

    fn is_deleted(&self, identifier: &Identifier) -> bool;

    /// No attribute bucket has ever been populated (or all were cleared).
    fn is_empty(&self, identifier: &Identifier) -> bool;
}
