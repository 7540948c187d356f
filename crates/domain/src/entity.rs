//! The entity contract and explicit lifecycle callbacks.
//!
//! Entities are plain structs. Mapping to and from [`Row`]s is written by hand
//! in each `Entity` impl, and the audit timestamps are maintained by
//! [`Entity::pre_persist`] / [`Entity::pre_update`], which the session invokes
//! from its save path.

use crate::errors::{EntityError, EntityResult};
use crate::identifiers::EntityId;
use crate::schema::EntitySchema;
use crate::value::{Row, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Row field holding the creation timestamp.
pub const CREATED_DATE: &str = "created_date";

/// Row field holding the last-update timestamp.
pub const UPDATED_DATE: &str = "updated_date";

/// System-managed audit timestamps shared by every entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFields {
    /// Set once, when the entity is first persisted
    pub created_date: Option<DateTime<Utc>>,
    /// Refreshed whenever an update is staged
    pub updated_date: Option<DateTime<Utc>>,
}

impl AuditFields {
    /// Stamp both timestamps for a new entity.
    pub fn on_persist(&mut self, now: DateTime<Utc>) {
        self.created_date = Some(now);
        self.updated_date = Some(now);
    }

    /// Refresh the update timestamp; `created_date` is never touched.
    pub fn on_update(&mut self, now: DateTime<Utc>) {
        self.updated_date = Some(now);
    }

    /// Append the audit columns to a row.
    pub fn write_to(&self, row: Row) -> Row {
        row.with(CREATED_DATE, self.created_date)
            .with(UPDATED_DATE, self.updated_date)
    }

    /// Read the audit columns from a row.
    pub fn read_from(row: &Row) -> EntityResult<Self> {
        Ok(Self {
            created_date: row.opt_timestamp(CREATED_DATE)?,
            updated_date: row.opt_timestamp(UPDATED_DATE)?,
        })
    }
}

/// A persistable record with a surrogate identity.
///
/// Identity is `None` until the session assigns one on first persist and
/// must never change afterwards; `assign_id` is only called for entities
/// whose `id()` is `None`.
pub trait Entity: Clone + Debug + Send + Sync + 'static {
    /// Typed identifier
    type Id: EntityId;

    /// Table mapping for this entity.
    fn schema() -> &'static EntitySchema;

    /// Current identity, if persisted.
    fn id(&self) -> Option<Self::Id>;

    /// Assign the identity handed out by the store sequence.
    fn assign_id(&mut self, id: Self::Id);

    /// Audit timestamps.
    fn audit(&self) -> &AuditFields;

    /// Mutable audit timestamps.
    fn audit_mut(&mut self) -> &mut AuditFields;

    /// Flatten into a row keyed by schema field name (version excluded).
    fn to_row(&self) -> Row;

    /// Rebuild from a row produced by a store.
    fn from_row(row: &Row) -> EntityResult<Self>;

    /// Invariant check run before an insert or update is staged.
    fn validate(&self) -> EntityResult<()> {
        Ok(())
    }

    /// Called by the save path before an insert is staged.
    fn pre_persist(&mut self, now: DateTime<Utc>) {
        self.audit_mut().on_persist(now);
    }

    /// Called by the save path before an update is staged.
    fn pre_update(&mut self, now: DateTime<Utc>) {
        self.audit_mut().on_update(now);
    }

    /// The raw key, if persisted.
    fn raw_id(&self) -> Option<i64> {
        self.id().map(EntityId::raw)
    }
}

/// A value built directly from selected columns, bypassing entity hydration.
pub trait Projection: Sized + Send + 'static {
    /// Build from column values in select-list order.
    fn from_values(values: Vec<Value>) -> EntityResult<Self>;
}

fn single(values: Vec<Value>) -> EntityResult<Value> {
    let count = values.len();
    let mut iter = values.into_iter();
    match (iter.next(), count) {
        (Some(value), 1) => Ok(value),
        _ => Err(EntityError::Projection(format!(
            "expected 1 column, got {}",
            count
        ))),
    }
}

impl Projection for String {
    fn from_values(values: Vec<Value>) -> EntityResult<Self> {
        match single(values)? {
            Value::Text(s) => Ok(s),
            other => Err(EntityError::Projection(format!(
                "expected text column, got {}",
                other
            ))),
        }
    }
}

impl Projection for Option<String> {
    fn from_values(values: Vec<Value>) -> EntityResult<Self> {
        match single(values)? {
            Value::Null => Ok(None),
            Value::Text(s) => Ok(Some(s)),
            other => Err(EntityError::Projection(format!(
                "expected text column, got {}",
                other
            ))),
        }
    }
}

impl Projection for i64 {
    fn from_values(values: Vec<Value>) -> EntityResult<Self> {
        match single(values)? {
            Value::Int(v) => Ok(v),
            other => Err(EntityError::Projection(format!(
                "expected int column, got {}",
                other
            ))),
        }
    }
}

impl Projection for Vec<Value> {
    fn from_values(values: Vec<Value>) -> EntityResult<Self> {
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_audit_lifecycle() {
        let created = Utc::now();
        let mut audit = AuditFields::default();
        audit.on_persist(created);
        assert_eq!(audit.created_date, Some(created));
        assert_eq!(audit.updated_date, Some(created));

        let later = created + Duration::seconds(5);
        audit.on_update(later);
        assert_eq!(audit.created_date, Some(created));
        assert_eq!(audit.updated_date, Some(later));
    }

    #[test]
    fn test_audit_row_round_trip() {
        let mut audit = AuditFields::default();
        audit.on_persist(Utc::now());
        let row = audit.write_to(Row::new());
        assert_eq!(AuditFields::read_from(&row).unwrap(), audit);
    }

    #[test]
    fn test_scalar_projections() {
        assert_eq!(
            String::from_values(vec![Value::from("AAA")]).unwrap(),
            "AAA"
        );
        assert_eq!(i64::from_values(vec![Value::from(3)]).unwrap(), 3);
        assert!(String::from_values(vec![]).is_err());
        assert!(String::from_values(vec![Value::from(1)]).is_err());
    }
}
