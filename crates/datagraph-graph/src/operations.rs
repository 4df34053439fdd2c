use datagraph_core::Identifier;
use serde_json::Value;

/// Relationship data after its references have been resolved to identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedData {
    One(Option<Identifier>),
    Many(Vec<Identifier>),
}

impl ResolvedData {
    pub fn is_empty(&self) -> bool {
        match self {
            ResolvedData::One(one) => one.is_none(),
            ResolvedData::Many(many) => many.is_empty(),
        }
    }
}

/// Confirmed relationship payload. `data: None` means the payload carried no
/// `data` member at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalUpdate {
    pub data: Option<ResolvedData>,
    pub link: Option<String>,
    pub meta: Option<Value>,
}

impl CanonicalUpdate {
    pub fn one(member: Option<Identifier>) -> Self {
        Self {
            data: Some(ResolvedData::One(member)),
            ..Default::default()
        }
    }

    pub fn many(members: Vec<Identifier>) -> Self {
        Self {
            data: Some(ResolvedData::Many(members)),
            ..Default::default()
        }
    }

    pub fn link<L: Into<String>>(link: L) -> Self {
        Self {
            link: Some(link.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GraphOperation {
    /// Confirmed state from the server.
    UpdateRelationship {
        record: Identifier,
        field: String,
        value: CanonicalUpdate,
    },
    ReplaceRelatedRecord {
        record: Identifier,
        field: String,
        value: Option<Identifier>,
    },
    ReplaceRelatedRecords {
        record: Identifier,
        field: String,
        value: Vec<Identifier>,
    },
    AddToRelatedRecords {
        record: Identifier,
        field: String,
        value: Vec<Identifier>,
        index: Option<usize>,
    },
    RemoveFromRelatedRecords {
        record: Identifier,
        field: String,
        value: Vec<Identifier>,
    },
    DeleteRecord {
        record: Identifier,
        committed: bool,
        is_new: bool,
    },
}

impl GraphOperation {
    pub fn record(&self) -> &Identifier {
        match self {
            GraphOperation::UpdateRelationship { record, .. }
            | GraphOperation::ReplaceRelatedRecord { record, .. }
            | GraphOperation::ReplaceRelatedRecords { record, .. }
            | GraphOperation::AddToRelatedRecords { record, .. }
            | GraphOperation::RemoveFromRelatedRecords { record, .. }
            | GraphOperation::DeleteRecord { record, .. } => record,
        }
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            GraphOperation::UpdateRelationship { field, .. }
            | GraphOperation::ReplaceRelatedRecord { field, .. }
            | GraphOperation::ReplaceRelatedRecords { field, .. }
            | GraphOperation::AddToRelatedRecords { field, .. }
            | GraphOperation::RemoveFromRelatedRecords { field, .. } => Some(field),
            GraphOperation::DeleteRecord { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            GraphOperation::UpdateRelationship { .. } => "updateRelationship",
            GraphOperation::ReplaceRelatedRecord { .. } => "replaceRelatedRecord",
            GraphOperation::ReplaceRelatedRecords { .. } => "replaceRelatedRecords",
            GraphOperation::AddToRelatedRecords { .. } => "addToRelatedRecords",
            GraphOperation::RemoveFromRelatedRecords { .. } => "removeFromRelatedRecords",
            GraphOperation::DeleteRecord { .. } => "deleteRecord",
        }
    }
}
