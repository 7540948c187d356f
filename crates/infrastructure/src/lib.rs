//! Infrastructure layer for the declarative repository
//!
//! This crate provides:
//! - Stores: an in-memory engine and PostgreSQL (sqlx)
//! - The session (unit of work) with its identity map and staged writes
//! - The query engine: method-name derivation, explicit query text, criteria
//! - Paging (page with count, slice without) and bulk mutations
//! - Repositories for `Member` and `Team`
//!
//! ## Architecture
//!
//! Repositories never talk to a store directly. Every operation goes through a
//! [`session::Session`], which flushes staged writes before queries, keeps one
//! transaction open on its store connection and hands compiled statements to
//! the store.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use datajpa_infrastructure::{
//!     repositories::{CrudRepository, MemberRepository, SessionMemberRepository},
//!     session::SessionFactory,
//!     store::MemoryStore,
//! };
//!
//! let factory = SessionFactory::new(MemoryStore::shared());
//! let session = factory.open();
//! let members = SessionMemberRepository::new(session.clone());
//!
//! members.save(Member::with_age("AAA", 10)).await?;
//! let found = members.find_by_username_and_age_greater_than("AAA", 5).await?;
//! session.commit().await?;
//! ```

pub mod database;
pub mod mutation;
pub mod paging;
pub mod query;
pub mod repositories;
pub mod session;
pub mod store;

use datajpa_domain::EntityError;

// Re-export commonly used types
pub use database::{DatabaseConfig, DatabasePool};
pub use mutation::InvalidationPolicy;
pub use query::{Arguments, LockMode, QueryDescriptor, QueryModel, ResultShape};
pub use repositories::{
    CrudRepository, EntityRepository, MemberRepository, PlainMemberRepository,
    PlainTeamRepository, SessionMemberRepository, SessionTeamRepository, TeamRepository,
};
pub use session::{QueryResult, ResultRow, RowMapper, Session, SessionFactory, SessionStatistics};
pub use store::{MemoryStore, PgStore, Store};

pub type Result<T> = std::result::Result<T, Error>;

/// Infrastructure-level errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Entity, row or query target does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Declared and supplied parameters disagree
    #[error("Parameter mismatch: {0}")]
    ParameterMismatch(String),

    /// Sort key does not resolve against the entity
    #[error("Invalid sort field '{field}' for {entity}")]
    InvalidSortField { entity: String, field: String },

    /// Property path does not resolve against the entity
    #[error("Invalid field reference '{path}' for {entity}")]
    InvalidFieldReference { entity: String, path: String },

    /// Malformed method name, query text or query model
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// A single-result query returned more than one row
    #[error("Incorrect result size: expected at most {expected}, got {actual}")]
    IncorrectResultSize { expected: usize, actual: usize },

    /// A lock could not be acquired within the lock timeout
    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    /// A lock request was refused outright (no-wait, deadlock, serialization)
    #[error("Lock conflict: {0}")]
    LockConflict(String),

    /// An update or delete matched no row at the expected version
    #[error("Stale data: {entity} {id} was changed or removed concurrently")]
    StaleData { entity: &'static str, id: i64 },

    /// Store rejected a write (duplicate key, NOT NULL, foreign key)
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// Session can no longer be used for anything but rollback
    #[error("Transaction inactive: {0}")]
    TransactionInactive(String),

    /// Row to entity mapping errors
    #[error("Mapping error: {0}")]
    Mapping(#[from] EntityError),

    /// Database errors from sqlx
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(String),
}

impl Error {
    /// Whether a caller may retry the whole transaction.
    ///
    /// The session itself never retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::LockTimeout(_) | Error::LockConflict(_) | Error::Connection(_) => true,
            Error::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }

    /// Stable code for logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NOT_FOUND",
            Error::ParameterMismatch(_) => "PARAMETER_MISMATCH",
            Error::InvalidSortField { .. } => "INVALID_SORT_FIELD",
            Error::InvalidFieldReference { .. } => "INVALID_FIELD_REFERENCE",
            Error::InvalidQuery(_) => "INVALID_QUERY",
            Error::IncorrectResultSize { .. } => "INCORRECT_RESULT_SIZE",
            Error::LockTimeout(_) => "LOCK_TIMEOUT",
            Error::LockConflict(_) => "LOCK_CONFLICT",
            Error::StaleData { .. } => "STALE_DATA",
            Error::Constraint(_) => "CONSTRAINT_VIOLATION",
            Error::TransactionInactive(_) => "TRANSACTION_INACTIVE",
            Error::Mapping(_) => "MAPPING_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Configuration(_) => "CONFIGURATION_ERROR",
            Error::Connection(_) => "CONNECTION_ERROR",
        }
    }

    pub(crate) fn invalid_field(entity: &str, path: &str) -> Self {
        Error::InvalidFieldReference {
            entity: entity.to_string(),
            path: path.to_string(),
        }
    }

    pub(crate) fn invalid_sort(entity: &str, field: &str) -> Self {
        Error::InvalidSortField {
            entity: entity.to_string(),
            field: field.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::LockTimeout("member 1".to_string()).is_retryable());
        assert!(Error::Database(sqlx::Error::PoolTimedOut).is_retryable());

        assert!(!Error::NotFound("test".to_string()).is_retryable());
        assert!(!Error::StaleData { entity: "Team", id: 1 }.is_retryable());
        assert!(!Error::Database(sqlx::Error::RowNotFound).is_retryable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::invalid_sort("Member", "nope").error_code(), "INVALID_SORT_FIELD");
        assert_eq!(
            Error::Mapping(EntityError::MissingField { field: "age" }).error_code(),
            "MAPPING_ERROR"
        );
        assert_eq!(
            Error::invalid_field("Member", "team.nope").to_string(),
            "Invalid field reference 'team.nope' for Member"
        );
    }
}
