//! Bulk update and delete.
//!
//! A bulk statement bypasses the identity map. Staged writes are flushed
//! first so the statement sees them; afterwards the session applies the
//! caller's [`InvalidationPolicy`].

use crate::query::{Arguments, QueryKind, QueryModel};
use crate::session::unit_of_work::UnitOfWork;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

/// What happens to managed entities after a bulk statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationPolicy {
    /// Nothing is evicted. Managed entities of the affected type keep their
    /// pre-statement state until the caller clears the session.
    #[default]
    Manual,
    /// Evict every managed entity of the affected type
    EvictAffectedType,
    /// Detach everything
    ClearSession,
}

/// Which bulk statement a caller asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BulkKind {
    Update,
    Delete,
}

impl BulkKind {
    pub(crate) fn of(model: &QueryModel) -> Option<Self> {
        match model.kind {
            QueryKind::Update(_) => Some(Self::Update),
            QueryKind::Delete => Some(Self::Delete),
            QueryKind::Select | QueryKind::Count => None,
        }
    }
}

#[instrument(skip(uow, model, args), fields(session = %uow.id(), entity = %model.entity))]
pub(crate) async fn execute_bulk(
    uow: &mut UnitOfWork,
    model: &QueryModel,
    args: &Arguments,
    expected: BulkKind,
    policy: InvalidationPolicy,
) -> Result<u64> {
    if BulkKind::of(model) != Some(expected) {
        return Err(Error::InvalidQuery(format!(
            "expected a bulk {:?} statement on {}",
            expected, model.entity
        )));
    }

    let schema = uow.compiler().schema(&model.entity)?;
    let query = uow.compiler().compile(model, args)?;
    let affected = uow.bulk(&query).await?;

    match policy {
        InvalidationPolicy::Manual => {
            let managed = uow.managed_count(schema);
            if managed > 0 {
                debug!(managed, "Managed entities may be stale after bulk statement");
            }
        }
        InvalidationPolicy::EvictAffectedType => {
            let evicted = uow.evict_all(schema);
            debug!(evicted, "Evicted entities of the affected type");
        }
        InvalidationPolicy::ClearSession => uow.clear(),
    }

    info!(affected, ?policy, "Bulk statement executed");
    Ok(affected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_kind_of_model() {
        assert_eq!(
            BulkKind::of(&QueryModel::update("Member").increment("age", 1)),
            Some(BulkKind::Update)
        );
        assert_eq!(BulkKind::of(&QueryModel::delete("Member")), Some(BulkKind::Delete));
        assert_eq!(BulkKind::of(&QueryModel::select("Member")), None);
    }

    #[test]
    fn test_policy_serde() {
        let policy: InvalidationPolicy = serde_json::from_str("\"evict_affected_type\"").unwrap();
        assert_eq!(policy, InvalidationPolicy::EvictAffectedType);
        assert_eq!(InvalidationPolicy::default(), InvalidationPolicy::Manual);
    }
}
