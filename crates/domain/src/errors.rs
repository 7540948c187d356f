//! Error types for the entity model.
//!
//! These errors describe problems converting between entity structs, rows and
//! projections. Query and persistence errors live in the infrastructure crate
//! and wrap [`EntityError`] when a mapping step fails.

use crate::value::FieldType;

/// Entity mapping errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EntityError {
    /// A field required by the entity was absent from the row
    #[error("Missing field: {field}")]
    MissingField {
        /// Property name
        field: &'static str,
    },

    /// A field held a value of the wrong type
    #[error("Type mismatch for field {field}: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Property name
        field: &'static str,
        /// Declared column type
        expected: FieldType,
        /// The value actually found
        actual: String,
    },

    /// A projection received the wrong number or kind of columns
    #[error("Projection error: {0}")]
    Projection(String),

    /// The entity failed an invariant check before persisting
    #[error("Invalid entity {entity}: {message}")]
    Invalid {
        /// Entity name
        entity: &'static str,
        /// What was wrong
        message: String,
    },
}

impl EntityError {
    /// Get the error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MissingField { .. } => "MISSING_FIELD",
            Self::TypeMismatch { .. } => "TYPE_MISMATCH",
            Self::Projection(_) => "PROJECTION_ERROR",
            Self::Invalid { .. } => "INVALID_ENTITY",
        }
    }
}

/// Result type for entity mapping
pub type EntityResult<T> = Result<T, EntityError>;
