//! Testing utilities for the repository layer
//!
//! This crate provides:
//! - Fixtures for members and teams with realistic data
//! - Builders for entities with specific field values
//! - A manual clock for pinning audit timestamps
//! - PostgreSQL test database setup
//!
//! # Examples
//!
//! ```
//! use datajpa_testing::{builders::*, fixtures::*};
//!
//! let team = create_test_team();
//! let member = MemberBuilder::new()
//!     .with_username("member1")
//!     .with_age(10)
//!     .build();
//! assert_eq!(member.age, 10);
//! assert!(team.id.is_none());
//! ```

pub mod builders;
pub mod clock;
pub mod database;
pub mod fixtures;

// Re-export commonly used types
pub use builders::*;
pub use clock::ManualClock;
pub use database::TestDatabase;
pub use fixtures::*;

// Re-export testing dependencies for convenience
pub use fake;
pub use proptest;
