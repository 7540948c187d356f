//! Data JPA Study Domain Types
//!
//! This crate provides the entity model for the repository layer: typed
//! identifiers, row/value conversion, schema metadata, and the `Member` and
//! `Team` entities with their read models.
//!
//! ## Architecture
//!
//! - **identifiers**: Strongly-typed numeric identifiers
//! - **value**: Scalar values and flattened rows exchanged with stores
//! - **schema**: Table mapping metadata consumed by the query engine
//! - **entity**: The `Entity` contract, audit timestamps and projections
//! - **member** / **team**: Concrete entities
//! - **errors**: Entity mapping errors
//!
//! ## Usage
//!
//! ```rust
//! use datajpa_domain::{Entity, Member, Team, TeamId};
//!
//! let mut team = Team::new("teamA");
//! team.assign_id(TeamId::new(1));
//!
//! let member = Member::with_team("member1", 10, &team);
//! assert_eq!(member.team_id, Some(TeamId::new(1)));
//! assert!(member.id().is_none());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod entity;
pub mod errors;
pub mod identifiers;
pub mod member;
pub mod schema;
pub mod team;
pub mod value;

// Re-export commonly used types
pub use entity::{AuditFields, Entity, Projection, CREATED_DATE, UPDATED_DATE};
pub use errors::{EntityError, EntityResult};
pub use identifiers::{EntityId, MemberId, TeamId};
pub use member::{Member, MemberDto, MemberWithTeam, UsernameOnly, MEMBER_SCHEMA};
pub use schema::{AssociationDef, EntitySchema, FieldDef, FieldKind, SchemaRegistry};
pub use team::{Team, TEAM_SCHEMA};
pub use value::{FieldType, Row, Value};

/// Registry containing every entity of this crate.
pub fn default_registry() -> SchemaRegistry {
    SchemaRegistry::new().with(&MEMBER_SCHEMA).with(&TEAM_SCHEMA)
}
