//! Error taxonomy for item state operations

use crate::id::{ItemId, PropertyId};

/// Result type for item state operations
pub type Result<T> = std::result::Result<T, StateError>;

/// Errors raised by the state layers, the reconciler and the persistence backends
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Identifier unknown to every layer and provider
    #[error("Item not found: {0}")]
    NotFound(ItemId),

    /// The base of an overlay moved since the shadow was cloned
    #[error("Item state is stale: {0}")]
    Stale(ItemId),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// An incompatible item is already present
    #[error("Item exists: {0}")]
    ItemExists(String),

    #[error("Unresolved references: {}", format_ids(.0))]
    UnresolvedReference(Vec<PropertyId>),

    #[error("Referential integrity violation: {0}")]
    ReferentialIntegrity(String),

    #[error("Value format error: {0}")]
    ValueFormat(String),

    /// Fatal setup error, e.g. colliding identifier ranges
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StateError {
    /// Whether the caller should discard its overlay and retry
    pub fn is_stale(&self) -> bool {
        matches!(self, StateError::Stale(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound(_))
    }
}

impl From<bincode::Error> for StateError {
    fn from(e: bincode::Error) -> Self {
        StateError::Serialization(e.to_string())
    }
}

impl From<sled::Error> for StateError {
    fn from(e: sled::Error) -> Self {
        StateError::Persistence(e.to_string())
    }
}

fn format_ids(ids: &[PropertyId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
