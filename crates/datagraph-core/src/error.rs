use crate::config::ConfigError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataGraphError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Unknown resource type: {0}")]
    UnknownType(String),

    #[error("Unknown field '{field}' on resource type '{type_name}'")]
    UnknownField { type_name: String, field: String },

    #[error(
        "Polymorphic type mismatch on {type_name}.{field}: expected '{expected}', got '{actual}'"
    )]
    PolymorphicTypeMismatch {
        type_name: String,
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid relationship data for {type_name}.{field}: {reason}")]
    InvalidRelationshipData {
        type_name: String,
        field: String,
        reason: String,
    },

    #[error("Identity conflict: {0}")]
    IdentityConflict(String),

    #[error("Merge policy could not choose a survivor between '{first}' and '{second}'")]
    MergeUnresolved { first: String, second: String },

    #[error("Identifier has been forgotten: {0}")]
    IdentifierForgotten(String),

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Relationship load failed for {owner}.{field}: {source}")]
    LoadFailed {
        owner: String,
        field: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Flush failed for {count} edge(s), first {edge}: {source}")]
    FlushFailed {
        edge: String,
        count: usize,
        #[source]
        source: Box<DataGraphError>,
    },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl DataGraphError {
    pub fn unknown_field(type_name: &str, field: &str) -> Self {
        DataGraphError::UnknownField {
            type_name: type_name.to_string(),
            field: field.to_string(),
        }
    }

    /// True for the fail-fast schema class of errors.
    pub fn is_schema_violation(&self) -> bool {
        matches!(
            self,
            DataGraphError::UnknownType(_)
                | DataGraphError::UnknownField { .. }
                | DataGraphError::PolymorphicTypeMismatch { .. }
                | DataGraphError::InvalidRelationshipData { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DataGraphError>;
