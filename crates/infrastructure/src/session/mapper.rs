//! Result row mapping.

use datajpa_domain::{Entity, EntityError, EntityResult, Projection, Row, Value};

/// A result row after the session has resolved it.
///
/// Entity rows have passed through the identity map: already-managed
/// entities come back in their session state. Column rows are untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultRow {
    /// One row per selected entity; `None` for an unmatched left join
    Entities(Vec<Option<Row>>),
    /// Projected column values in select-list order
    Values(Vec<Value>),
}

enum MapFn<T> {
    Entities(fn(&[Option<Row>]) -> EntityResult<T>),
    Values(fn(Vec<Value>) -> EntityResult<T>),
}

/// Turns result rows into `T`.
pub struct RowMapper<T> {
    map: MapFn<T>,
}

impl<T> RowMapper<T> {
    pub(crate) fn map(&self, row: ResultRow) -> EntityResult<T> {
        match (&self.map, row) {
            (MapFn::Entities(f), ResultRow::Entities(rows)) => f(&rows),
            (MapFn::Values(f), ResultRow::Values(values)) => f(values),
            (MapFn::Entities(_), ResultRow::Values(_)) => Err(EntityError::Projection(
                "query selects columns but an entity result was requested".to_string(),
            )),
            (MapFn::Values(_), ResultRow::Entities(_)) => Err(EntityError::Projection(
                "query selects entities but a projection was requested".to_string(),
            )),
        }
    }
}

fn root_row(rows: &[Option<Row>]) -> EntityResult<&Row> {
    rows.first()
        .and_then(Option::as_ref)
        .ok_or_else(|| EntityError::Projection("result row has no root entity".to_string()))
}

impl<E: Entity> RowMapper<E> {
    /// Hydrate the root entity.
    pub fn entity() -> Self {
        Self {
            map: MapFn::Entities(|rows| E::from_row(root_row(rows)?)),
        }
    }
}

impl<P: Projection> RowMapper<P> {
    /// Build a projection from the selected columns.
    pub fn projection() -> Self {
        Self {
            map: MapFn::Values(P::from_values),
        }
    }
}

impl<R: Entity, A: Entity> RowMapper<(R, Option<A>)> {
    /// Root entity plus the entity of its first fetch join.
    pub fn fetch_joined() -> Self {
        Self {
            map: MapFn::Entities(|rows| {
                let root = R::from_row(root_row(rows)?)?;
                let associated = match rows.get(1) {
                    Some(Some(row)) => Some(A::from_row(row)?),
                    _ => None,
                };
                Ok((root, associated))
            }),
        }
    }
}
