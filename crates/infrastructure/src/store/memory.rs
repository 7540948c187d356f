//! In-memory store.
//!
//! Tables are shared by every connection of a store and keyed by identity.
//! Writes take exclusive row locks that are held until commit or rollback;
//! reads see the latest written state (read uncommitted) and only lock rows
//! when the statement asks for it. Each connection keeps an undo log that
//! rollback replays in reverse. Sequences are never rolled back.

use super::locks::{LockKind, LockManager};
use super::{Connection, Store};
use crate::query::plan::{BindParam, BulkPlan, ColumnRef, Output, RowWrite, SelectPlan};
use crate::query::predicate::Condition;
use crate::query::{AssignOp, CompiledQuery, JoinKind, LockMode, Operator, ParamRef, Plan, Predicate, QueryOutcome};
use crate::{Error, Result};
use async_trait::async_trait;
use datajpa_domain::{EntitySchema, FieldKind, Value};
use indexmap::IndexMap;
use parking_lot::Mutex;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

static NULL: Value = Value::Null;

type StoredRow = IndexMap<&'static str, Value>;

#[derive(Debug, Default)]
struct Table {
    rows: BTreeMap<i64, StoredRow>,
    /// Foreign-key field -> key -> referencing row ids
    foreign_keys: HashMap<&'static str, BTreeMap<i64, BTreeSet<i64>>>,
}

impl Table {
    fn index(&mut self, schema: &EntitySchema, id: i64, row: &StoredRow) {
        for field in schema.fields.iter().filter(|f| f.kind == FieldKind::ForeignKey) {
            if let Some(key) = row.get(field.name).and_then(Value::as_int) {
                self.foreign_keys
                    .entry(field.name)
                    .or_default()
                    .entry(key)
                    .or_default()
                    .insert(id);
            }
        }
    }

    fn unindex(&mut self, schema: &EntitySchema, id: i64, row: &StoredRow) {
        for field in schema.fields.iter().filter(|f| f.kind == FieldKind::ForeignKey) {
            let Some(key) = row.get(field.name).and_then(Value::as_int) else {
                continue;
            };
            if let Some(index) = self.foreign_keys.get_mut(field.name) {
                if let Some(ids) = index.get_mut(&key) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        index.remove(&key);
                    }
                }
            }
        }
    }

    /// Insert or replace a row, returning the previous one.
    fn put(&mut self, schema: &EntitySchema, id: i64, row: StoredRow) -> Option<StoredRow> {
        let previous = self.take(schema, id);
        self.index(schema, id, &row);
        self.rows.insert(id, row);
        previous
    }

    fn take(&mut self, schema: &EntitySchema, id: i64) -> Option<StoredRow> {
        let row = self.rows.remove(&id)?;
        self.unindex(schema, id, &row);
        Some(row)
    }

    /// Rows whose `field` references `key`, in identity order.
    fn referencing(&self, field: &str, key: i64) -> Vec<&StoredRow> {
        self.foreign_keys
            .get(field)
            .and_then(|index| index.get(&key))
            .map(|ids| ids.iter().filter_map(|id| self.rows.get(id)).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct Tables {
    tables: HashMap<&'static str, Table>,
    sequences: HashMap<&'static str, i64>,
}

impl Tables {
    fn table_mut(&mut self, schema: &'static EntitySchema) -> &mut Table {
        self.tables.entry(schema.table).or_default()
    }
}

#[derive(Debug)]
enum Undo {
    Inserted {
        schema: &'static EntitySchema,
        id: i64,
    },
    Updated {
        schema: &'static EntitySchema,
        id: i64,
        before: StoredRow,
    },
    Deleted {
        schema: &'static EntitySchema,
        id: i64,
        row: StoredRow,
    },
}

#[derive(Debug, Default)]
struct Shared {
    data: Mutex<Tables>,
    locks: LockManager,
    connections: AtomicU64,
}

/// Store keeping every table in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new empty store behind an `Arc`, ready for a session factory.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Rows currently stored for `schema`, including uncommitted writes.
    pub fn row_count(&self, schema: &EntitySchema) -> usize {
        self.shared
            .data
            .lock()
            .tables
            .get(schema.table)
            .map_or(0, |t| t.rows.len())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self, lock_timeout: Duration) -> Result<Box<dyn Connection>> {
        let id = self.shared.connections.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        debug!(connection = id, "Memory transaction started");

        Ok(Box::new(MemoryConnection {
            id,
            shared: self.shared.clone(),
            lock_timeout,
            undo: Vec::new(),
            active: true,
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Convert a LIKE pattern (`%`, `_`, `\` escapes) to an anchored regex.
fn like_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() + 6);
    regex.push_str("(?s)^");

    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            '\\' => match chars.next() {
                Some(escaped) => regex.push_str(&regex::escape(&escaped.to_string())),
                None => regex.push_str(&regex::escape("\\")),
            },
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
    }

    regex.push('$');
    regex
}

type Tuple<'a> = [Option<&'a StoredRow>];

fn column<'a>(tuple: &Tuple<'a>, column: &ColumnRef) -> &'a Value {
    tuple[column.source]
        .and_then(|row| row.get(column.field.name))
        .unwrap_or(&NULL)
}

/// Predicate evaluation with SQL three-valued logic; `None` is unknown.
struct Evaluator<'q> {
    params: &'q [BindParam],
    patterns: HashMap<usize, Regex>,
}

impl<'q> Evaluator<'q> {
    fn new(params: &'q [BindParam], filter: Option<&Predicate<ColumnRef>>) -> Result<Self> {
        let mut patterns = HashMap::new();
        if let Some(filter) = filter {
            let mut failure = None;
            filter.for_each_condition(&mut |c| {
                if !c.op.is_pattern() {
                    return;
                }
                if let Some(ParamRef::Index(i)) = c.param {
                    let Some(pattern) = params.get(i).and_then(|p| p.value.as_text()) else {
                        return;
                    };
                    match Regex::new(&like_to_regex(pattern)) {
                        Ok(regex) => {
                            patterns.insert(i, regex);
                        }
                        Err(e) => failure = Some(e),
                    }
                }
            });
            if let Some(e) = failure {
                return Err(Error::InvalidQuery(format!("invalid LIKE pattern: {}", e)));
            }
        }
        Ok(Self { params, patterns })
    }

    fn param<'a>(&'a self, param: &'a Option<ParamRef>) -> &'a Value {
        match param {
            Some(ParamRef::Index(i)) => self.params.get(*i).map_or(&NULL, |p| &p.value),
            Some(ParamRef::Literal(value)) => value,
            _ => &NULL,
        }
    }

    fn eval(&self, predicate: &Predicate<ColumnRef>, tuple: &Tuple<'_>) -> Option<bool> {
        match predicate {
            Predicate::And(items) => {
                let mut unknown = false;
                for item in items {
                    match self.eval(item, tuple) {
                        Some(false) => return Some(false),
                        None => unknown = true,
                        Some(true) => {}
                    }
                }
                if unknown {
                    None
                } else {
                    Some(true)
                }
            }
            Predicate::Or(items) => {
                let mut unknown = false;
                for item in items {
                    match self.eval(item, tuple) {
                        Some(true) => return Some(true),
                        None => unknown = true,
                        Some(false) => {}
                    }
                }
                if unknown {
                    None
                } else {
                    Some(false)
                }
            }
            Predicate::Condition(c) => self.condition(c, tuple),
        }
    }

    fn condition(&self, c: &Condition<ColumnRef>, tuple: &Tuple<'_>) -> Option<bool> {
        let value = column(tuple, &c.path);
        let param = self.param(&c.param);

        match c.op {
            Operator::Equals => value.compare(param).map(|o| o == Ordering::Equal),
            Operator::NotEquals => value.compare(param).map(|o| o != Ordering::Equal),
            Operator::GreaterThan => value.compare(param).map(|o| o == Ordering::Greater),
            Operator::GreaterThanEqual => value.compare(param).map(|o| o != Ordering::Less),
            Operator::LessThan => value.compare(param).map(|o| o == Ordering::Less),
            Operator::LessThanEqual => value.compare(param).map(|o| o != Ordering::Greater),
            Operator::In => in_list(value, param),
            Operator::NotIn => in_list(value, param).map(|found| !found),
            Operator::Like
            | Operator::StartingWith
            | Operator::EndingWith
            | Operator::Containing => self.like(c, value),
            Operator::NotLike => self.like(c, value).map(|matched| !matched),
            Operator::IsNull => Some(value.is_null()),
            Operator::IsNotNull => Some(!value.is_null()),
            Operator::True => Some(value.as_bool() == Some(true)),
            Operator::False => Some(value.as_bool() == Some(false)),
        }
    }

    fn like(&self, c: &Condition<ColumnRef>, value: &Value) -> Option<bool> {
        let text = value.as_text()?;
        let Some(ParamRef::Index(i)) = c.param else {
            return None;
        };
        self.patterns.get(&i).map(|regex| regex.is_match(text))
    }
}

fn in_list(value: &Value, list: &Value) -> Option<bool> {
    if value.is_null() {
        return None;
    }
    let mut unknown = false;
    for item in list.as_list()? {
        match value.compare(item) {
            Some(Ordering::Equal) => return Some(true),
            Some(_) => {}
            None => unknown = true,
        }
    }
    if unknown {
        None
    } else {
        Some(false)
    }
}

struct Selected {
    rows: Vec<Vec<Value>>,
    root_ids: Vec<i64>,
}

/// A `root.fk = value` conjunct the foreign-key index can answer.
fn indexed_key<'p>(plan: &'p SelectPlan, evaluator: &Evaluator<'_>) -> Option<(&'p str, i64)> {
    let conjuncts: Vec<&Predicate<ColumnRef>> = match plan.filter.as_ref()? {
        Predicate::And(items) => items.iter().collect(),
        other => vec![other],
    };
    conjuncts.into_iter().find_map(|p| match p {
        Predicate::Condition(c)
            if c.path.source == 0
                && c.path.field.kind == FieldKind::ForeignKey
                && c.op == Operator::Equals =>
        {
            evaluator
                .param(&c.param)
                .as_int()
                .map(|key| (c.path.field.name, key))
        }
        _ => None,
    })
}

fn run_select(data: &Tables, plan: &SelectPlan, evaluator: &Evaluator<'_>) -> Selected {
    let id_field = plan.root.id_field().name;
    let root_id = |tuple: &Tuple<'_>| {
        tuple[0]
            .and_then(|row| row.get(id_field))
            .and_then(Value::as_int)
            .unwrap_or_default()
    };

    let roots: Vec<&StoredRow> = match data.tables.get(plan.root.table) {
        None => Vec::new(),
        Some(table) => match indexed_key(plan, evaluator) {
            Some((field, key)) => table.referencing(field, key),
            None => table.rows.values().collect(),
        },
    };

    let mut tuples: Vec<Vec<Option<&StoredRow>>> =
        roots.into_iter().map(|row| vec![Some(row)]).collect();

    for join in &plan.joins {
        let target = data.tables.get(join.target.table);
        tuples = tuples
            .into_iter()
            .filter_map(|mut tuple| {
                let joined = tuple[join.parent]
                    .and_then(|row| row.get(join.association.foreign_key))
                    .and_then(Value::as_int)
                    .and_then(|key| target.and_then(|t| t.rows.get(&key)));
                match (joined, join.kind) {
                    (None, JoinKind::Inner) => None,
                    (row, _) => {
                        tuple.push(row);
                        Some(tuple)
                    }
                }
            })
            .collect();
    }

    if let Some(filter) = &plan.filter {
        tuples.retain(|tuple| evaluator.eval(filter, tuple) == Some(true));
    }

    if let Output::Count { distinct } = plan.output {
        let count = if distinct {
            tuples.iter().map(|t| root_id(t.as_slice())).collect::<BTreeSet<_>>().len()
        } else {
            tuples.len()
        };
        return Selected {
            rows: vec![vec![Value::Int(count as i64)]],
            root_ids: Vec::new(),
        };
    }

    tuples.sort_by(|a, b| {
        for (col, direction) in &plan.order {
            let ordering = column(a, col).sort_cmp(column(b, col));
            let ordering = if direction.is_descending() {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });

    let mut projected: Vec<(i64, Vec<Value>)> = tuples
        .iter()
        .map(|tuple| {
            let values = match &plan.output {
                Output::Entities(sources) => sources
                    .iter()
                    .flat_map(|source| {
                        let row = tuple[*source];
                        plan.source_schema(*source).fields.iter().map(move |f| {
                            row.and_then(|r| r.get(f.name)).cloned().unwrap_or(Value::Null)
                        })
                    })
                    .collect(),
                Output::Columns(columns) => {
                    columns.iter().map(|c| column(tuple, c).clone()).collect()
                }
                Output::Count { .. } => Vec::new(),
            };
            (root_id(tuple.as_slice()), values)
        })
        .collect();

    if plan.distinct {
        let mut seen: Vec<Vec<Value>> = Vec::new();
        projected.retain(|(_, values)| {
            if seen.contains(values) {
                false
            } else {
                seen.push(values.clone());
                true
            }
        });
    }

    let offset = plan.offset.unwrap_or(0) as usize;
    let limit = plan.limit.map_or(usize::MAX, |l| l as usize);
    let (root_ids, rows) = projected.into_iter().skip(offset).take(limit).unzip();

    Selected { rows, root_ids }
}

fn check_not_null(schema: &EntitySchema, row: &StoredRow) -> Result<()> {
    match schema
        .fields
        .iter()
        .find(|f| !f.nullable && row.get(f.name).map_or(true, Value::is_null))
    {
        Some(field) => Err(Error::Constraint(format!(
            "null value in column \"{}\" of relation \"{}\"",
            field.column, schema.table
        ))),
        None => Ok(()),
    }
}

fn bump_version(schema: &EntitySchema, row: &mut StoredRow) {
    if let Some(version) = schema.version_field() {
        let next = row.get(version.name).and_then(Value::as_int).unwrap_or(0) + 1;
        row.insert(version.name, Value::Int(next));
    }
}

fn version_matches(schema: &EntitySchema, row: &StoredRow, expected: Option<i64>) -> bool {
    match (expected, schema.version_field()) {
        (Some(expected), Some(version)) => row.get(version.name) == Some(&Value::Int(expected)),
        _ => true,
    }
}

/// One transaction against a [`MemoryStore`].
struct MemoryConnection {
    id: u64,
    shared: Arc<Shared>,
    lock_timeout: Duration,
    undo: Vec<Undo>,
    active: bool,
}

impl MemoryConnection {
    async fn lock(
        &self,
        schema: &'static EntitySchema,
        id: i64,
        kind: LockKind,
        timeout: Duration,
    ) -> Result<()> {
        self.shared
            .locks
            .acquire(self.id, (schema.table, id), kind, timeout)
            .await
    }

    async fn select(&mut self, plan: &SelectPlan, params: &[BindParam]) -> Result<QueryOutcome> {
        let evaluator = Evaluator::new(params, plan.filter.as_ref())?;
        let selected = {
            let data = self.shared.data.lock();
            run_select(&data, plan, &evaluator)
        };

        let kind = match plan.lock {
            LockMode::None => return Ok(QueryOutcome::Rows(selected.rows)),
            LockMode::PessimisticRead => LockKind::Shared,
            LockMode::PessimisticWrite => LockKind::Exclusive,
        };

        let timeout = plan.lock_timeout.unwrap_or(self.lock_timeout);
        for id in &selected.root_ids {
            self.lock(plan.root, *id, kind, timeout).await?;
        }

        // Rows may have changed while waiting.
        let data = self.shared.data.lock();
        Ok(QueryOutcome::Rows(run_select(&data, plan, &evaluator).rows))
    }

    async fn insert(&mut self, write: &RowWrite) -> Result<u64> {
        let schema = write.schema;
        self.lock(schema, write.id, LockKind::Exclusive, self.lock_timeout)
            .await?;

        let mut row = StoredRow::new();
        for field in schema.fields {
            let value = match field.kind {
                FieldKind::Id => Value::Int(write.id),
                FieldKind::Version => Value::Int(0),
                _ => write
                    .values
                    .iter()
                    .find(|(f, _)| f.name == field.name)
                    .map_or(Value::Null, |(_, v)| v.clone()),
            };
            row.insert(field.name, value);
        }
        check_not_null(schema, &row)?;

        let mut data = self.shared.data.lock();
        let table = data.table_mut(schema);
        if table.rows.contains_key(&write.id) {
            return Err(Error::Constraint(format!(
                "duplicate key {} in relation \"{}\"",
                write.id, schema.table
            )));
        }
        table.put(schema, write.id, row);
        self.undo.push(Undo::Inserted {
            schema,
            id: write.id,
        });
        Ok(1)
    }

    async fn update(&mut self, write: &RowWrite) -> Result<u64> {
        let schema = write.schema;
        self.lock(schema, write.id, LockKind::Exclusive, self.lock_timeout)
            .await?;

        let mut data = self.shared.data.lock();
        let table = data.table_mut(schema);
        let Some(current) = table.rows.get(&write.id) else {
            return Ok(0);
        };
        if !version_matches(schema, current, write.expected_version) {
            return Ok(0);
        }

        let mut row = current.clone();
        for (field, value) in &write.values {
            row.insert(field.name, value.clone());
        }
        bump_version(schema, &mut row);
        check_not_null(schema, &row)?;

        if let Some(before) = table.put(schema, write.id, row) {
            self.undo.push(Undo::Updated {
                schema,
                id: write.id,
                before,
            });
        }
        Ok(1)
    }

    async fn delete(&mut self, write: &RowWrite) -> Result<u64> {
        let schema = write.schema;
        self.lock(schema, write.id, LockKind::Exclusive, self.lock_timeout)
            .await?;

        let mut data = self.shared.data.lock();
        let table = data.table_mut(schema);
        match table.rows.get(&write.id) {
            Some(current) if version_matches(schema, current, write.expected_version) => {}
            _ => return Ok(0),
        }

        if let Some(row) = table.take(schema, write.id) {
            self.undo.push(Undo::Deleted {
                schema,
                id: write.id,
                row,
            });
        }
        Ok(1)
    }

    async fn bulk(&mut self, plan: &BulkPlan, params: &[BindParam], delete: bool) -> Result<u64> {
        let schema = plan.schema;
        let evaluator = Evaluator::new(params, plan.filter.as_ref())?;
        let matches = |row: &StoredRow| match &plan.filter {
            Some(filter) => evaluator.eval(filter, &[Some(row)]) == Some(true),
            None => true,
        };

        let candidates: Vec<i64> = {
            let data = self.shared.data.lock();
            data.tables
                .get(schema.table)
                .map(|t| {
                    t.rows
                        .iter()
                        .filter(|(_, row)| matches(row))
                        .map(|(id, _)| *id)
                        .collect()
                })
                .unwrap_or_default()
        };

        for id in &candidates {
            self.lock(schema, *id, LockKind::Exclusive, self.lock_timeout)
                .await?;
        }

        let mut data = self.shared.data.lock();
        let table = data.table_mut(schema);
        let mut affected = 0;

        for id in candidates {
            let Some(row) = table.rows.get(&id).cloned() else {
                continue;
            };
            if !matches(&row) {
                continue;
            }

            if delete {
                if let Some(row) = table.take(schema, id) {
                    self.undo.push(Undo::Deleted { schema, id, row });
                    affected += 1;
                }
                continue;
            }

            let mut updated = row.clone();
            let mut changed = false;
            for assignment in &plan.assignments {
                let current = row.get(assignment.field.name).unwrap_or(&NULL);
                let argument = params.get(assignment.param).map_or(&NULL, |p| &p.value);
                let next = match assignment.op {
                    AssignOp::Set => argument.clone(),
                    AssignOp::Add | AssignOp::Subtract => {
                        match (current.as_int(), argument.as_int()) {
                            (Some(a), Some(b)) => {
                                let result = if assignment.op == AssignOp::Add {
                                    a.checked_add(b)
                                } else {
                                    a.checked_sub(b)
                                };
                                Value::Int(result.ok_or_else(|| {
                                    Error::Constraint(format!(
                                        "{} out of range",
                                        assignment.field.column
                                    ))
                                })?)
                            }
                            _ => Value::Null,
                        }
                    }
                };
                if &next != current {
                    changed = true;
                }
                updated.insert(assignment.field.name, next);
            }

            if !changed {
                continue;
            }
            bump_version(schema, &mut updated);
            check_not_null(schema, &updated)?;
            table.put(schema, id, updated);
            self.undo.push(Undo::Updated {
                schema,
                id,
                before: row,
            });
            affected += 1;
        }

        Ok(affected)
    }

    fn undo_all(&mut self) {
        let mut data = self.shared.data.lock();
        while let Some(entry) = self.undo.pop() {
            match entry {
                Undo::Inserted { schema, id } => {
                    data.table_mut(schema).take(schema, id);
                }
                Undo::Updated { schema, id, before } => {
                    data.table_mut(schema).put(schema, id, before);
                }
                Undo::Deleted { schema, id, row } => {
                    data.table_mut(schema).put(schema, id, row);
                }
            }
        }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.active {
            Ok(())
        } else {
            Err(Error::TransactionInactive(format!(
                "memory connection {} already ended",
                self.id
            )))
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn next_id(&mut self, schema: &'static EntitySchema) -> Result<i64> {
        self.ensure_active()?;
        let mut data = self.shared.data.lock();
        let sequence = data.sequences.entry(schema.table).or_insert(0);
        *sequence += 1;
        Ok(*sequence)
    }

    #[instrument(skip(self, query), fields(connection = self.id, kind = ?query.kind()))]
    async fn execute(&mut self, query: &CompiledQuery) -> Result<QueryOutcome> {
        self.ensure_active()?;
        let params = query.params.as_slice();

        match &query.plan {
            Plan::Select(plan) => self.select(plan, params).await,
            Plan::Insert(write) => self.insert(write).await.map(QueryOutcome::Affected),
            Plan::Update(write) => self.update(write).await.map(QueryOutcome::Affected),
            Plan::Delete(write) => self.delete(write).await.map(QueryOutcome::Affected),
            Plan::BulkUpdate(plan) => self
                .bulk(plan, params, false)
                .await
                .map(QueryOutcome::Affected),
            Plan::BulkDelete(plan) => self
                .bulk(plan, params, true)
                .await
                .map(QueryOutcome::Affected),
        }
    }

    async fn commit(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.undo.clear();
        self.active = false;
        self.shared.locks.release_all(self.id);
        debug!(connection = self.id, "Memory transaction committed");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.undo_all();
        self.active = false;
        self.shared.locks.release_all(self.id);
        debug!(connection = self.id, "Memory transaction rolled back");
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if self.active {
            warn!(connection = self.id, "Memory transaction dropped without commit, rolling back");
            self.undo_all();
            self.shared.locks.release_all(self.id);
        }
    }
}
