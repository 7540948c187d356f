//! Compiled statements.
//!
//! A [`CompiledQuery`] carries the same statement twice: as PostgreSQL text
//! with `$n` placeholders for [`crate::store::PgStore`], and as a structured
//! [`Plan`] that [`crate::store::MemoryStore`] interprets.

use super::descriptor::LockMode;
use super::model::{AssignOp, JoinKind};
use super::predicate::Predicate;
use datajpa_common::SortDirection;
use datajpa_domain::{AssociationDef, EntitySchema, FieldDef, FieldType, Value};
use std::fmt;
use std::time::Duration;

/// A field of one source (root or join) of a statement.
#[derive(Debug, Clone, Copy)]
pub struct ColumnRef {
    /// Index into the statement's sources; 0 is the root
    pub source: usize,
    pub field: &'static FieldDef,
}

impl PartialEq for ColumnRef {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && std::ptr::eq(self.field, other.field)
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.source, self.field.column)
    }
}

/// A many-to-one join from an earlier source.
#[derive(Debug, Clone)]
pub struct JoinPlan {
    pub parent: usize,
    pub association: &'static AssociationDef,
    pub target: &'static EntitySchema,
    pub kind: JoinKind,
}

/// What a select emits per row.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// Every column of each listed source, in schema field order
    Entities(Vec<usize>),
    /// Individual columns
    Columns(Vec<ColumnRef>),
    /// A single count; `distinct` counts distinct root identities
    Count { distinct: bool },
}

#[derive(Debug, Clone)]
pub struct SelectPlan {
    pub root: &'static EntitySchema,
    pub joins: Vec<JoinPlan>,
    pub filter: Option<Predicate<ColumnRef>>,
    pub output: Output,
    pub distinct: bool,
    pub order: Vec<(ColumnRef, SortDirection)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub lock: LockMode,
    pub lock_timeout: Option<Duration>,
}

impl SelectPlan {
    /// Schema of source `index`.
    pub fn source_schema(&self, index: usize) -> &'static EntitySchema {
        if index == 0 {
            self.root
        } else {
            self.joins[index - 1].target
        }
    }
}

/// Single-row write staged by the session.
#[derive(Debug, Clone)]
pub struct RowWrite {
    pub schema: &'static EntitySchema,
    pub id: i64,
    /// Field values; empty for deletes
    pub values: Vec<(&'static FieldDef, Value)>,
    /// Version the row must still have, when optimistic locking applies
    pub expected_version: Option<i64>,
}

/// `SET` clause of a bulk update; the value is `params[param]`.
#[derive(Debug, Clone)]
pub struct PlannedAssignment {
    pub field: &'static FieldDef,
    pub op: AssignOp,
    pub param: usize,
}

#[derive(Debug, Clone)]
pub struct BulkPlan {
    pub schema: &'static EntitySchema,
    pub filter: Option<Predicate<ColumnRef>>,
    /// Empty for bulk deletes
    pub assignments: Vec<PlannedAssignment>,
}

#[derive(Debug, Clone)]
pub enum Plan {
    Select(SelectPlan),
    Insert(RowWrite),
    Update(RowWrite),
    Delete(RowWrite),
    BulkUpdate(BulkPlan),
    BulkDelete(BulkPlan),
}

/// Statement category, used by statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Select,
    Count,
    Insert,
    Update,
    Delete,
    BulkUpdate,
    BulkDelete,
}

impl Plan {
    pub fn kind(&self) -> StatementKind {
        match self {
            Plan::Select(select) if matches!(select.output, Output::Count { .. }) => {
                StatementKind::Count
            }
            Plan::Select(_) => StatementKind::Select,
            Plan::Insert(_) => StatementKind::Insert,
            Plan::Update(_) => StatementKind::Update,
            Plan::Delete(_) => StatementKind::Delete,
            Plan::BulkUpdate(_) => StatementKind::BulkUpdate,
            Plan::BulkDelete(_) => StatementKind::BulkDelete,
        }
    }
}

/// One bound parameter with the column type it is compared against.
#[derive(Debug, Clone, PartialEq)]
pub struct BindParam {
    pub value: Value,
    pub ty: FieldType,
}

/// Column groups of a select result.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultLayout {
    /// One group of `schema.fields` per entity, in order
    Entities(Vec<&'static EntitySchema>),
    /// Individual columns of these types
    Columns(Vec<FieldType>),
    /// A single integer
    Count,
    /// Affected-row count of a write
    Affected,
}

impl ResultLayout {
    /// Column types in result order.
    pub fn column_types(&self) -> Vec<FieldType> {
        match self {
            Self::Entities(schemas) => schemas
                .iter()
                .flat_map(|s| s.fields.iter().map(|f| f.ty))
                .collect(),
            Self::Columns(types) => types.clone(),
            Self::Count => vec![FieldType::Int],
            Self::Affected => Vec::new(),
        }
    }
}

/// A statement ready for a store.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<BindParam>,
    pub plan: Plan,
    pub layout: ResultLayout,
}

impl CompiledQuery {
    pub fn kind(&self) -> StatementKind {
        self.plan.kind()
    }

    /// Value of bind parameter `index`.
    pub fn param(&self, index: usize) -> &Value {
        self.params
            .get(index)
            .map(|p| &p.value)
            .unwrap_or(&Value::Null)
    }
}

/// Result of executing one statement.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    /// Selected rows, columns ordered per [`ResultLayout`]
    Rows(Vec<Vec<Value>>),
    /// Rows written
    Affected(u64),
}
