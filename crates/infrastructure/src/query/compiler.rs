//! Query compilation: resolves a [`QueryModel`] against the schema registry
//! and binds its arguments.
//!
//! Output is a [`CompiledQuery`] holding PostgreSQL text and the equivalent
//! [`Plan`]. Everything that can be checked without a round trip is checked
//! here: unknown entities and paths, sort keys, parameter count and types.

use super::descriptor::Arguments;
use super::model::{AssignOp, Assignment, JoinKind, JoinSpec, QueryKind, QueryModel, Selection};
use super::plan::{
    BindParam, BulkPlan, ColumnRef, CompiledQuery, JoinPlan, Output, Plan, PlannedAssignment,
    ResultLayout, RowWrite, SelectPlan,
};
use super::predicate::{Condition, Operator, ParamRef, Predicate};
use crate::{Error, Result};
use datajpa_domain::{AssociationDef, EntitySchema, FieldKind, FieldType, SchemaRegistry, Value};
use std::collections::BTreeSet;

/// Compiles query models and single-row writes.
#[derive(Debug, Clone)]
pub struct QueryCompiler {
    registry: SchemaRegistry,
}

impl QueryCompiler {
    pub fn new(registry: SchemaRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Look up an entity by name.
    pub fn schema(&self, entity: &str) -> Result<&'static EntitySchema> {
        self.registry
            .get(entity)
            .ok_or_else(|| Error::InvalidQuery(format!("unknown entity '{}'", entity)))
    }

    /// Compile a model with its invocation arguments.
    pub fn compile(&self, model: &QueryModel, args: &Arguments) -> Result<CompiledQuery> {
        let schema = self.schema(&model.entity)?;
        compile_model(schema, model, args)
    }

    /// Select one entity by identity.
    pub fn find_by_id(&self, schema: &'static EntitySchema, id: i64) -> Result<CompiledQuery> {
        let model = QueryModel::select(schema.name)
            .filter(Predicate::eq(schema.id_field().name, id));
        compile_model(schema, &model, &Arguments::new())
    }

    /// `INSERT` of every field in `write`, with the version starting at 0.
    pub fn insert(&self, write: RowWrite) -> CompiledQuery {
        let schema = write.schema;
        let mut columns = Vec::new();
        let mut values = Vec::new();
        let mut params = Vec::new();

        for (field, value) in &write.values {
            params.push(BindParam {
                value: value.clone(),
                ty: field.ty,
            });
            columns.push(field.column);
            values.push(format!("${}", params.len()));
        }
        if let Some(version) = schema.version_field() {
            columns.push(version.column);
            values.push("0".to_string());
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            schema.table,
            columns.join(", "),
            values.join(", ")
        );

        CompiledQuery {
            sql,
            params,
            plan: Plan::Insert(write),
            layout: ResultLayout::Affected,
        }
    }

    /// `UPDATE` of one row by identity, bumping its version.
    ///
    /// Identity and creation timestamp are never rewritten.
    pub fn update(&self, mut write: RowWrite) -> CompiledQuery {
        let schema = write.schema;
        write
            .values
            .retain(|(field, _)| !matches!(field.kind, FieldKind::Id | FieldKind::CreatedAt));

        let mut params = Vec::new();
        let mut sets = Vec::new();
        for (field, value) in &write.values {
            params.push(BindParam {
                value: value.clone(),
                ty: field.ty,
            });
            sets.push(format!("{} = ${}", field.column, params.len()));
        }
        if let Some(version) = schema.version_field() {
            sets.push(format!("{0} = {0} + 1", version.column));
        }

        let filter = identity_filter(&write, &mut params);
        let sql = format!("UPDATE {} SET {} WHERE {}", schema.table, sets.join(", "), filter);

        CompiledQuery {
            sql,
            params,
            plan: Plan::Update(write),
            layout: ResultLayout::Affected,
        }
    }

    /// `DELETE` of one row by identity.
    pub fn delete(&self, write: RowWrite) -> CompiledQuery {
        let mut params = Vec::new();
        let filter = identity_filter(&write, &mut params);
        let sql = format!("DELETE FROM {} WHERE {}", write.schema.table, filter);

        CompiledQuery {
            sql,
            params,
            plan: Plan::Delete(write),
            layout: ResultLayout::Affected,
        }
    }
}

fn identity_filter(write: &RowWrite, params: &mut Vec<BindParam>) -> String {
    let schema = write.schema;
    params.push(BindParam {
        value: Value::Int(write.id),
        ty: FieldType::Int,
    });
    let mut filter = format!("{} = ${}", schema.id_field().column, params.len());

    if let (Some(expected), Some(version)) = (write.expected_version, schema.version_field()) {
        params.push(BindParam {
            value: Value::Int(expected),
            ty: FieldType::Int,
        });
        filter.push_str(&format!(" AND {} = ${}", version.column, params.len()));
    }
    filter
}

fn compile_model(
    schema: &'static EntitySchema,
    model: &QueryModel,
    args: &Arguments,
) -> Result<CompiledQuery> {
    check_arguments(model, args)?;

    let scope = Scope::new(schema, model.alias.as_deref());
    let binder = Binder {
        args,
        params: Vec::new(),
    };

    match &model.kind {
        QueryKind::Select | QueryKind::Count => compile_select(model, scope, binder),
        QueryKind::Update(assignments) => compile_bulk(model, assignments, scope, binder),
        QueryKind::Delete => compile_bulk(model, &[], scope, binder),
    }
}

/// Declared placeholders must match the supplied arguments exactly.
fn check_arguments(model: &QueryModel, args: &Arguments) -> Result<()> {
    let mut positions = BTreeSet::new();
    let mut names = BTreeSet::new();
    for param in model.param_refs() {
        match param {
            ParamRef::Index(i) => {
                positions.insert(*i);
            }
            ParamRef::Named(name) => {
                names.insert(name.as_str());
            }
            ParamRef::Literal(_) => {}
        }
    }

    if !positions.is_empty() && !names.is_empty() {
        return Err(Error::InvalidQuery(
            "named and positional parameters cannot be mixed".to_string(),
        ));
    }
    if let Some(gap) = (0..positions.len()).find(|i| !positions.contains(i)) {
        return Err(Error::InvalidQuery(format!(
            "positional parameter ?{} is not referenced",
            gap + 1
        )));
    }

    let supplied = args.positional().len();
    if supplied != positions.len() {
        return Err(Error::ParameterMismatch(format!(
            "query declares {} positional parameters, {} supplied",
            positions.len(),
            supplied
        )));
    }
    if let Some(missing) = names.iter().find(|n| args.get_named(n).is_none()) {
        return Err(Error::ParameterMismatch(format!(
            "no argument bound for :{}",
            missing
        )));
    }
    if let Some(extra) = args
        .named_values()
        .keys()
        .find(|n| !names.contains(n.as_str()))
    {
        return Err(Error::ParameterMismatch(format!(
            "argument :{} is not declared by the query",
            extra
        )));
    }
    Ok(())
}

struct Source {
    schema: &'static EntitySchema,
    aliases: Vec<String>,
}

enum Resolved {
    Column(ColumnRef),
    Entity(usize),
}

/// Sources of one statement: the root plus its joins, de-duplicated per
/// (parent, association).
struct Scope {
    root: &'static EntitySchema,
    sources: Vec<Source>,
    joins: Vec<JoinPlan>,
}

impl Scope {
    fn new(root: &'static EntitySchema, alias: Option<&str>) -> Self {
        Self {
            root,
            sources: vec![Source {
                schema: root,
                aliases: alias.map(str::to_string).into_iter().collect(),
            }],
            joins: Vec::new(),
        }
    }

    fn join(
        &mut self,
        parent: usize,
        association: &'static AssociationDef,
        kind: JoinKind,
        alias: Option<&str>,
    ) -> usize {
        let existing = self
            .joins
            .iter()
            .position(|j| j.parent == parent && std::ptr::eq(j.association, association));

        let index = match existing {
            Some(position) => position + 1,
            None => {
                let target = association.target_schema();
                self.joins.push(JoinPlan {
                    parent,
                    association,
                    target,
                    kind,
                });
                self.sources.push(Source {
                    schema: target,
                    aliases: Vec::new(),
                });
                self.sources.len() - 1
            }
        };

        if let Some(alias) = alias {
            let aliases = &mut self.sources[index].aliases;
            if !aliases.iter().any(|a| a == alias) {
                aliases.push(alias.to_string());
            }
        }
        index
    }

    /// Source a path starts from, and how many segments that consumed.
    fn start(&self, first: &str) -> (usize, usize) {
        self.sources
            .iter()
            .position(|s| s.aliases.iter().any(|a| a == first))
            .map_or((0, 0), |source| (source, 1))
    }

    fn add_join(&mut self, spec: &JoinSpec) -> Result<usize> {
        let segments: Vec<&str> = spec.path.split('.').collect();
        let (mut current, consumed) = self.start(segments[0]);
        let rest = &segments[consumed..];
        if rest.is_empty() {
            return Err(Error::InvalidQuery(format!(
                "join path '{}' names no association",
                spec.path
            )));
        }

        for (i, segment) in rest.iter().enumerate() {
            let schema = self.sources[current].schema;
            let association = schema
                .association(segment)
                .ok_or_else(|| Error::invalid_field(self.root.name, &spec.path))?;
            let last = i + 1 == rest.len();
            current = if last {
                self.join(current, association, spec.kind, spec.alias.as_deref())
            } else {
                self.join(current, association, JoinKind::Inner, None)
            };
        }
        Ok(current)
    }

    /// Resolve a property path, adding implicit inner joins for traversed
    /// associations. A path ending at an association means its foreign key.
    fn resolve(&mut self, path: &str) -> Option<Resolved> {
        let segments: Vec<&str> = path.split('.').collect();
        let (mut current, consumed) = self.start(segments[0]);
        let rest = &segments[consumed..];
        if rest.is_empty() {
            return Some(Resolved::Entity(current));
        }

        for (i, segment) in rest.iter().enumerate() {
            let schema = self.sources[current].schema;
            if i + 1 == rest.len() {
                if let Some(field) = schema.field(segment) {
                    return Some(Resolved::Column(ColumnRef {
                        source: current,
                        field,
                    }));
                }
                let association = schema.association(segment)?;
                let field = schema.field(association.foreign_key)?;
                return Some(Resolved::Column(ColumnRef {
                    source: current,
                    field,
                }));
            }
            let association = schema.association(segment)?;
            current = self.join(current, association, JoinKind::Inner, None);
        }
        None
    }

    fn column(&mut self, path: &str) -> Result<ColumnRef> {
        match self.resolve(path) {
            Some(Resolved::Column(column)) => Ok(column),
            Some(Resolved::Entity(source)) => Ok(ColumnRef {
                source,
                field: self.sources[source].schema.id_field(),
            }),
            None => Err(Error::invalid_field(self.root.name, path)),
        }
    }
}

struct Binder<'a> {
    args: &'a Arguments,
    params: Vec<BindParam>,
}

impl Binder<'_> {
    fn lookup(&self, param: &ParamRef) -> Result<Value> {
        let value = match param {
            ParamRef::Index(i) => self.args.get_positional(*i),
            ParamRef::Named(name) => self.args.get_named(name),
            ParamRef::Literal(value) => Some(value),
        };
        value
            .cloned()
            .ok_or_else(|| Error::ParameterMismatch(format!("no argument bound for {}", param)))
    }

    /// Append a bind parameter, returning its index.
    fn push(&mut self, value: Value, ty: FieldType) -> usize {
        self.params.push(BindParam { value, ty });
        self.params.len() - 1
    }
}

fn mismatch(param: &ParamRef, path: &str, expected: &str, value: &Value) -> Error {
    Error::ParameterMismatch(format!(
        "{} for '{}' expects {}, got {}",
        param, path, expected, value
    ))
}

/// Escape LIKE metacharacters so `value` matches literally.
fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn bind_condition(
    condition: Condition<String>,
    scope: &mut Scope,
    binder: &mut Binder<'_>,
) -> Result<Condition<ColumnRef>> {
    let column = scope.column(&condition.path)?;
    let ty = column.field.ty;
    let path = condition.path.as_str();
    let op = condition.op;

    let Some(param) = condition.param else {
        if matches!(op, Operator::True | Operator::False) && ty != FieldType::Bool {
            return Err(Error::InvalidQuery(format!(
                "'{}' is not a boolean property",
                path
            )));
        }
        if op.arity() > 0 {
            return Err(Error::InvalidQuery(format!("{} on '{}' needs a value", op, path)));
        }
        return Ok(Condition {
            path: column,
            op,
            param: None,
        });
    };

    let value = binder.lookup(&param)?;
    let (op, value) = match op {
        Operator::Equals if value.is_null() => (Operator::IsNull, None),
        Operator::NotEquals if value.is_null() => (Operator::IsNotNull, None),
        Operator::In | Operator::NotIn => {
            let items = value
                .as_list()
                .ok_or_else(|| mismatch(&param, path, "a list", &value))?;
            if let Some(bad) = items.iter().find(|v| !v.is_compatible_with(ty)) {
                return Err(mismatch(&param, path, &ty.to_string(), bad));
            }
            (op, Some(value))
        }
        _ if op.is_pattern() => {
            let text = match (&value, ty) {
                (Value::Text(text), FieldType::Text) => text,
                _ => return Err(mismatch(&param, path, "text", &value)),
            };
            let pattern = match op {
                Operator::StartingWith => format!("{}%", escape_like(text)),
                Operator::EndingWith => format!("%{}", escape_like(text)),
                Operator::Containing => format!("%{}%", escape_like(text)),
                _ => text.clone(),
            };
            let op = if op == Operator::NotLike {
                Operator::NotLike
            } else {
                Operator::Like
            };
            (op, Some(Value::Text(pattern)))
        }
        _ if op.arity() == 0 => {
            return Err(Error::InvalidQuery(format!("{} on '{}' takes no value", op, path)))
        }
        _ => {
            if !value.is_compatible_with(ty) {
                return Err(mismatch(&param, path, &ty.to_string(), &value));
            }
            (op, Some(value))
        }
    };

    Ok(Condition {
        path: column,
        op,
        param: value.map(|v| ParamRef::Index(binder.push(v, ty))),
    })
}

fn bind_filter(
    model: &QueryModel,
    scope: &mut Scope,
    binder: &mut Binder<'_>,
) -> Result<Option<Predicate<ColumnRef>>> {
    model
        .filter
        .clone()
        .map(|filter| filter.try_map(&mut |c| bind_condition(c, scope, binder)))
        .transpose()
}

fn compile_select(
    model: &QueryModel,
    mut scope: Scope,
    mut binder: Binder<'_>,
) -> Result<CompiledQuery> {
    let counting = matches!(model.kind, QueryKind::Count);
    if model.lock.is_locking() && (counting || model.distinct) {
        return Err(Error::InvalidQuery(
            "row locks cannot be combined with count or distinct".to_string(),
        ));
    }

    let mut fetched = Vec::new();
    for spec in &model.joins {
        let source = scope.add_join(spec)?;
        if spec.fetch && !counting && !fetched.contains(&source) {
            fetched.push(source);
        }
    }

    let output = if counting {
        Output::Count {
            distinct: model.distinct,
        }
    } else {
        match &model.selection {
            Selection::Entity => Output::Entities(std::iter::once(0).chain(fetched).collect()),
            selection => {
                let paths = selection.paths().unwrap_or_default();
                let mut entities = Vec::new();
                let mut columns = Vec::new();
                for path in paths {
                    match scope.resolve(path) {
                        Some(Resolved::Entity(source)) => entities.push(source),
                        Some(Resolved::Column(column)) => columns.push(column),
                        None => return Err(Error::invalid_field(scope.root.name, path)),
                    }
                }
                match (entities.is_empty(), columns.is_empty()) {
                    (false, true) => {
                        for source in fetched {
                            if !entities.contains(&source) {
                                entities.push(source);
                            }
                        }
                        Output::Entities(entities)
                    }
                    (true, false) if fetched.is_empty() => Output::Columns(columns),
                    (true, false) => {
                        return Err(Error::InvalidQuery(
                            "fetch joins need the owning entity in the select list".to_string(),
                        ))
                    }
                    _ => {
                        return Err(Error::InvalidQuery(
                            "cannot select entities and properties together".to_string(),
                        ))
                    }
                }
            }
        }
    };

    let filter = bind_filter(model, &mut scope, &mut binder)?;

    let mut order = Vec::new();
    for o in model.sort.orders() {
        match scope.resolve(&o.property) {
            Some(Resolved::Column(column)) => order.push((column, o.direction)),
            _ => return Err(Error::invalid_sort(scope.root.name, &o.property)),
        }
    }

    let plan = SelectPlan {
        root: scope.root,
        joins: scope.joins,
        filter,
        output,
        distinct: model.distinct,
        order,
        limit: model.limit,
        offset: model.offset,
        lock: model.lock,
        lock_timeout: model.lock_timeout,
    };

    let layout = match &plan.output {
        Output::Entities(sources) => {
            ResultLayout::Entities(sources.iter().map(|s| plan.source_schema(*s)).collect())
        }
        Output::Columns(columns) => ResultLayout::Columns(columns.iter().map(|c| c.field.ty).collect()),
        Output::Count { .. } => ResultLayout::Count,
    };

    Ok(CompiledQuery {
        sql: sql::select(&plan),
        params: binder.params,
        plan: Plan::Select(plan),
        layout,
    })
}

fn compile_bulk(
    model: &QueryModel,
    assignments: &[Assignment],
    mut scope: Scope,
    mut binder: Binder<'_>,
) -> Result<CompiledQuery> {
    if !model.joins.is_empty() {
        return Err(Error::InvalidQuery(
            "bulk statements cannot declare joins".to_string(),
        ));
    }

    if matches!(model.kind, QueryKind::Update(_)) && assignments.is_empty() {
        return Err(Error::InvalidQuery(
            "bulk update needs at least one assignment".to_string(),
        ));
    }

    let schema = scope.root;
    let mut planned = Vec::new();
    for assignment in assignments {
        let field = match scope.resolve(&assignment.path) {
            Some(Resolved::Column(column)) if column.source == 0 => column.field,
            _ => return Err(Error::invalid_field(schema.name, &assignment.path)),
        };
        if !field.is_assignable() {
            return Err(Error::InvalidQuery(format!(
                "'{}' cannot be assigned by a bulk update",
                assignment.path
            )));
        }

        let value = binder.lookup(&assignment.param)?;
        let valid = match assignment.op {
            AssignOp::Set => value.is_compatible_with(field.ty),
            AssignOp::Add | AssignOp::Subtract => {
                field.ty == FieldType::Int && value.as_int().is_some()
            }
        };
        if !valid {
            return Err(mismatch(
                &assignment.param,
                &assignment.path,
                &field.ty.to_string(),
                &value,
            ));
        }

        planned.push(PlannedAssignment {
            field,
            op: assignment.op,
            param: binder.push(value, field.ty),
        });
    }

    let filter = bind_filter(model, &mut scope, &mut binder)?;
    if !scope.joins.is_empty() {
        return Err(Error::InvalidQuery(
            "bulk statements cannot traverse associations".to_string(),
        ));
    }

    let plan = BulkPlan {
        schema,
        filter,
        assignments: planned,
    };
    let (sql, plan) = match model.kind {
        QueryKind::Update(_) => (sql::bulk_update(&plan), Plan::BulkUpdate(plan)),
        _ => (sql::bulk_delete(&plan), Plan::BulkDelete(plan)),
    };

    Ok(CompiledQuery {
        sql,
        params: binder.params,
        plan,
        layout: ResultLayout::Affected,
    })
}

/// PostgreSQL rendering of compiled plans.
mod sql {
    use super::super::descriptor::LockMode;
    use super::super::model::{AssignOp, JoinKind};
    use super::super::plan::{BulkPlan, ColumnRef, Output, PlannedAssignment, SelectPlan};
    use super::super::predicate::{Operator, ParamRef, Predicate};
    use datajpa_common::SortDirection;
    use datajpa_domain::EntitySchema;

    fn alias(schema: &EntitySchema, index: usize) -> String {
        let initial = schema.table.chars().next().unwrap_or('t');
        format!("{}{}", initial, index)
    }

    fn column(aliases: &[String], column: &ColumnRef) -> String {
        format!("{}.{}", aliases[column.source], column.field.column)
    }

    fn predicate(aliases: &[String], predicate_tree: &Predicate<ColumnRef>) -> String {
        match predicate_tree {
            Predicate::And(items) | Predicate::Or(items) if items.is_empty() => {
                if matches!(predicate_tree, Predicate::And(_)) {
                    "TRUE".to_string()
                } else {
                    "FALSE".to_string()
                }
            }
            Predicate::And(items) => group(aliases, items, " AND "),
            Predicate::Or(items) => group(aliases, items, " OR "),
            Predicate::Condition(c) => {
                let col = column(aliases, &c.path);
                let param = match &c.param {
                    Some(ParamRef::Index(i)) => format!("${}", i + 1),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                match c.op {
                    Operator::Equals => format!("{} = {}", col, param),
                    Operator::NotEquals => format!("{} <> {}", col, param),
                    Operator::GreaterThan => format!("{} > {}", col, param),
                    Operator::GreaterThanEqual => format!("{} >= {}", col, param),
                    Operator::LessThan => format!("{} < {}", col, param),
                    Operator::LessThanEqual => format!("{} <= {}", col, param),
                    Operator::In => format!("{} = ANY({})", col, param),
                    Operator::NotIn => format!("NOT ({} = ANY({}))", col, param),
                    Operator::Like
                    | Operator::StartingWith
                    | Operator::EndingWith
                    | Operator::Containing => format!("{} LIKE {}", col, param),
                    Operator::NotLike => format!("{} NOT LIKE {}", col, param),
                    Operator::IsNull => format!("{} IS NULL", col),
                    Operator::IsNotNull => format!("{} IS NOT NULL", col),
                    Operator::True => format!("{} IS TRUE", col),
                    Operator::False => format!("{} IS FALSE", col),
                }
            }
        }
    }

    fn group(aliases: &[String], items: &[Predicate<ColumnRef>], separator: &str) -> String {
        let parts: Vec<String> = items.iter().map(|p| predicate(aliases, p)).collect();
        format!("({})", parts.join(separator))
    }

    pub(super) fn select(plan: &SelectPlan) -> String {
        let aliases: Vec<String> = (0..=plan.joins.len())
            .map(|i| alias(plan.source_schema(i), i))
            .collect();

        let mut sql = String::from("SELECT ");
        match &plan.output {
            Output::Count { distinct } => {
                let id = format!("{}.{}", aliases[0], plan.root.id_field().column);
                if *distinct {
                    sql.push_str(&format!("COUNT(DISTINCT {})", id));
                } else {
                    sql.push_str(&format!("COUNT({})", id));
                }
            }
            output => {
                if plan.distinct {
                    sql.push_str("DISTINCT ");
                }
                let columns: Vec<String> = match output {
                    Output::Entities(sources) => sources
                        .iter()
                        .flat_map(|s| {
                            let alias = &aliases[*s];
                            plan.source_schema(*s)
                                .fields
                                .iter()
                                .map(move |f| format!("{}.{}", alias, f.column))
                        })
                        .collect(),
                    Output::Columns(columns) => {
                        columns.iter().map(|c| column(&aliases, c)).collect()
                    }
                    Output::Count { .. } => Vec::new(),
                };
                sql.push_str(&columns.join(", "));
            }
        }

        sql.push_str(&format!(" FROM {} {}", plan.root.table, aliases[0]));
        for (i, join) in plan.joins.iter().enumerate() {
            let keyword = match join.kind {
                JoinKind::Inner => "INNER JOIN",
                JoinKind::Left => "LEFT JOIN",
            };
            let parent = plan.source_schema(join.parent);
            let foreign_key = parent
                .field(join.association.foreign_key)
                .map_or(join.association.foreign_key, |f| f.column);
            sql.push_str(&format!(
                " {} {} {} ON {}.{} = {}.{}",
                keyword,
                join.target.table,
                aliases[i + 1],
                aliases[i + 1],
                join.target.id_field().column,
                aliases[join.parent],
                foreign_key
            ));
        }

        if let Some(filter) = &plan.filter {
            sql.push_str(" WHERE ");
            sql.push_str(&predicate(&aliases, filter));
        }

        if !plan.order.is_empty() {
            let orders: Vec<String> = plan
                .order
                .iter()
                .map(|(c, direction)| {
                    let keyword = match direction {
                        SortDirection::Asc => "ASC",
                        SortDirection::Desc => "DESC",
                    };
                    format!("{} {}", column(&aliases, c), keyword)
                })
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&orders.join(", "));
        }

        if let Some(limit) = plan.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if let Some(offset) = plan.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }

        match plan.lock {
            LockMode::None => {}
            LockMode::PessimisticRead => sql.push_str(&format!(" FOR SHARE OF {}", aliases[0])),
            LockMode::PessimisticWrite => {
                sql.push_str(&format!(" FOR UPDATE OF {}", aliases[0]))
            }
        }

        sql
    }

    fn assigned_value(aliases: &[String], assignment: &PlannedAssignment) -> String {
        let current = format!("{}.{}", aliases[0], assignment.field.column);
        let param = format!("${}", assignment.param + 1);
        match assignment.op {
            AssignOp::Set => param,
            AssignOp::Add => format!("{} + {}", current, param),
            AssignOp::Subtract => format!("{} - {}", current, param),
        }
    }

    pub(super) fn bulk_update(plan: &BulkPlan) -> String {
        let aliases = vec![alias(plan.schema, 0)];

        let mut sets: Vec<String> = plan
            .assignments
            .iter()
            .map(|a| format!("{} = {}", a.field.column, assigned_value(&aliases, a)))
            .collect();
        if let Some(version) = plan.schema.version_field() {
            sets.push(format!("{0} = {1}.{0} + 1", version.column, aliases[0]));
        }

        let guard: Vec<String> = plan
            .assignments
            .iter()
            .map(|a| {
                format!(
                    "{}.{} IS DISTINCT FROM {}",
                    aliases[0],
                    a.field.column,
                    assigned_value(&aliases, a)
                )
            })
            .collect();

        let mut conditions = Vec::new();
        if let Some(filter) = &plan.filter {
            conditions.push(predicate(&aliases, filter));
        }
        if !guard.is_empty() {
            conditions.push(format!("({})", guard.join(" OR ")));
        }

        let mut sql = format!(
            "UPDATE {} AS {} SET {}",
            plan.schema.table,
            aliases[0],
            sets.join(", ")
        );
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql
    }

    pub(super) fn bulk_delete(plan: &BulkPlan) -> String {
        let aliases = vec![alias(plan.schema, 0)];
        let mut sql = format!("DELETE FROM {} AS {}", plan.schema.table, aliases[0]);
        if let Some(filter) = &plan.filter {
            sql.push_str(" WHERE ");
            sql.push_str(&predicate(&aliases, filter));
        }
        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use crate::query::descriptor::LockMode;
    use crate::query::explicit;
    use crate::query::plan::StatementKind;
    use datajpa_common::Sort;
    use datajpa_domain::{default_registry, MEMBER_SCHEMA};

    fn compiler() -> QueryCompiler {
        QueryCompiler::new(default_registry())
    }

    fn compile_text(text: &str, args: &Arguments) -> Result<CompiledQuery> {
        compiler().compile(&explicit::parse(text)?, args)
    }

    #[test]
    fn test_select_with_named_parameters() {
        let args = Arguments::new().named("username", "AAA").named("age", 10);
        let compiled = compile_text(
            "select m from Member m where m.username = :username and m.age = :age",
            &args,
        )
        .unwrap();

        assert_eq!(
            compiled.sql,
            "SELECT m0.member_id, m0.username, m0.age, m0.team_id, m0.created_date, \
             m0.updated_date, m0.version FROM member m0 \
             WHERE (m0.username = $1 AND m0.age = $2)"
        );
        assert_eq!(compiled.params.len(), 2);
        assert_eq!(compiled.params[0].value, Value::from("AAA"));
        assert_eq!(compiled.params[1].ty, FieldType::Int);
        assert_eq!(compiled.layout, ResultLayout::Entities(vec![&MEMBER_SCHEMA]));
    }

    #[test]
    fn test_constructor_projection_joins_once() {
        let compiled = compile_text(
            "select new MemberDto(m.id, m.username, t.name) from Member m join m.team t \
             where t.name = :name and m.team.name = :name",
            &Arguments::new().named("name", "teamA"),
        )
        .unwrap();

        let Plan::Select(plan) = &compiled.plan else {
            panic!("expected a select plan");
        };
        assert_eq!(plan.joins.len(), 1);
        assert_eq!(
            compiled.layout,
            ResultLayout::Columns(vec![FieldType::Int, FieldType::Text, FieldType::Text])
        );
        assert!(compiled
            .sql
            .contains("FROM member m0 INNER JOIN team t1 ON t1.team_id = m0.team_id"));
    }

    #[test]
    fn test_fetch_join_hydrates_both_entities() {
        let mut model = QueryModel::select("Member");
        model.apply_hints(&crate::query::QueryHints {
            fetch: vec!["team".to_string()],
            ..Default::default()
        });
        let compiled = compiler().compile(&model, &Arguments::new()).unwrap();

        assert!(compiled.sql.contains("LEFT JOIN team t1"));
        match &compiled.layout {
            ResultLayout::Entities(schemas) => assert_eq!(schemas.len(), 2),
            other => panic!("unexpected layout {:?}", other),
        }
    }

    #[test]
    fn test_implicit_join_from_property_path() {
        let model =
            QueryModel::select("Member").filter(Predicate::eq("team.name", "teamA"));
        let compiled = compiler().compile(&model, &Arguments::new()).unwrap();
        assert!(compiled.sql.contains("INNER JOIN team t1"));
        assert!(compiled.sql.ends_with("WHERE t1.name = $1"));
    }

    #[test]
    fn test_association_path_means_foreign_key() {
        let model = QueryModel::select("Member").filter(Predicate::is_null("team"));
        let compiled = compiler().compile(&model, &Arguments::new()).unwrap();
        assert!(compiled.sql.ends_with("WHERE m0.team_id IS NULL"));
    }

    #[test]
    fn test_null_equality_becomes_is_null() {
        let compiled = compile_text(
            "select m from Member m where m.team_id = ?1",
            &args![Value::Null],
        )
        .unwrap();
        assert!(compiled.sql.ends_with("WHERE m0.team_id IS NULL"));
        assert!(compiled.params.is_empty());
    }

    #[test]
    fn test_starting_with_escapes_pattern() {
        let model = QueryModel::select("Member").filter(Predicate::starts_with("username", "50%_"));
        let compiled = compiler().compile(&model, &Arguments::new()).unwrap();
        assert!(compiled.sql.ends_with("m0.username LIKE $1"));
        assert_eq!(compiled.params[0].value, Value::from("50\\%\\_%"));
    }

    #[test]
    fn test_in_binds_list() {
        let compiled = compile_text(
            "select m from Member m where m.username in :names",
            &Arguments::new().named("names", vec!["AAA", "BBB"]),
        )
        .unwrap();
        assert!(compiled.sql.ends_with("m0.username = ANY($1)"));

        let err = compile_text(
            "select m from Member m where m.username in :names",
            &Arguments::new().named("names", "AAA"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::ParameterMismatch(_)));
    }

    #[test]
    fn test_parameter_count_mismatch() {
        let text = "select m from Member m where m.username = ?1 and m.age > ?2";
        assert!(matches!(
            compile_text(text, &args!["AAA"]),
            Err(Error::ParameterMismatch(_))
        ));
        assert!(matches!(
            compile_text(text, &args!["AAA", 10, 20]),
            Err(Error::ParameterMismatch(_))
        ));
        assert!(compile_text(text, &args!["AAA", 10]).is_ok());
    }

    #[test]
    fn test_named_parameter_mismatch() {
        let text = "select m from Member m where m.username = :username";
        assert!(matches!(
            compile_text(text, &Arguments::new()),
            Err(Error::ParameterMismatch(_))
        ));
        assert!(matches!(
            compile_text(
                text,
                &Arguments::new().named("username", "a").named("age", 1)
            ),
            Err(Error::ParameterMismatch(_))
        ));
        assert!(matches!(
            compile_text(text, &args!["a"]),
            Err(Error::ParameterMismatch(_))
        ));
    }

    #[test]
    fn test_parameter_type_mismatch() {
        let err = compile_text(
            "select m from Member m where m.age = :age",
            &Arguments::new().named("age", "ten"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::ParameterMismatch(_)));
    }

    #[test]
    fn test_unknown_references() {
        let err = compile_text(
            "select m from Member m where m.nickname = :n",
            &Arguments::new().named("n", "x"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidFieldReference { .. }));

        let model = QueryModel::select("Member").order_by(Sort::asc("nickname"));
        let err = compiler().compile(&model, &Arguments::new()).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidSortField { ref field, .. } if field == "nickname"
        ));

        let err = compile_text("select x from Ghost x", &Arguments::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidQuery(_)));
    }

    #[test]
    fn test_count_and_window() {
        let mut model = QueryModel::select("Member")
            .filter(Predicate::eq("age", 10))
            .order_by(Sort::desc("username"))
            .limit(3);
        model.offset = Some(6);

        let data = compiler().compile(&model, &Arguments::new()).unwrap();
        assert!(data.sql.ends_with("ORDER BY m0.username DESC LIMIT 3 OFFSET 6"));

        let count = compiler()
            .compile(&model.count_model(), &Arguments::new())
            .unwrap();
        assert_eq!(
            count.sql,
            "SELECT COUNT(m0.member_id) FROM member m0 WHERE m0.age = $1"
        );
        assert_eq!(count.kind(), StatementKind::Count);
    }

    #[test]
    fn test_lock_clause() {
        let mut model = QueryModel::select("Member").filter(Predicate::eq("username", "AAA"));
        model.lock = LockMode::PessimisticWrite;
        let compiled = compiler().compile(&model, &Arguments::new()).unwrap();
        assert!(compiled.sql.ends_with("FOR UPDATE OF m0"));

        let mut count = model.count_model();
        count.lock = LockMode::PessimisticRead;
        assert!(matches!(
            compiler().compile(&count, &Arguments::new()),
            Err(Error::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_bulk_update_has_change_guard() {
        let compiled = compile_text(
            "update Member m set m.age = m.age + 1 where m.age >= :age",
            &Arguments::new().named("age", 20),
        )
        .unwrap();

        assert_eq!(
            compiled.sql,
            "UPDATE member AS m0 SET age = m0.age + $1, version = m0.version + 1 \
             WHERE m0.age >= $2 AND (m0.age IS DISTINCT FROM m0.age + $1)"
        );
        assert_eq!(compiled.kind(), StatementKind::BulkUpdate);
    }

    #[test]
    fn test_bulk_rejections() {
        let err = compile_text(
            "update Member m set m.age = 1 where m.team.name = 'teamA'",
            &Arguments::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidQuery(_)));

        let err = compile_text("update Member m set m.version = 1", &Arguments::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidQuery(_)));

        let compiled =
            compile_text("delete from Member m where m.age < 0", &Arguments::new()).unwrap();
        assert_eq!(compiled.sql, "DELETE FROM member AS m0 WHERE m0.age < $1");
    }

    #[test]
    fn test_row_writes() {
        let compiler = compiler();
        let values = MEMBER_SCHEMA
            .fields
            .iter()
            .filter(|f| f.kind != FieldKind::Version)
            .map(|f| {
                let value = match f.name {
                    "id" => Value::from(1),
                    "username" => Value::from("AAA"),
                    "age" => Value::from(10),
                    _ => Value::Null,
                };
                (f, value)
            })
            .collect::<Vec<_>>();

        let write = RowWrite {
            schema: &MEMBER_SCHEMA,
            id: 1,
            values,
            expected_version: None,
        };

        let insert = compiler.insert(write.clone());
        assert_eq!(
            insert.sql,
            "INSERT INTO member (member_id, username, age, team_id, created_date, updated_date, version) \
             VALUES ($1, $2, $3, $4, $5, $6, 0)"
        );

        let update = compiler.update(write.clone());
        assert_eq!(
            update.sql,
            "UPDATE member SET username = $1, age = $2, team_id = $3, updated_date = $4, \
             version = version + 1 WHERE member_id = $5"
        );

        let delete = compiler.delete(RowWrite {
            values: Vec::new(),
            expected_version: Some(3),
            ..write
        });
        assert_eq!(delete.sql, "DELETE FROM member WHERE member_id = $1 AND version = $2");
    }

    #[test]
    fn test_find_by_id() {
        let compiled = compiler().find_by_id(&MEMBER_SCHEMA, 7).unwrap();
        assert!(compiled.sql.ends_with("WHERE m0.member_id = $1"));
        assert_eq!(compiled.params[0].value, Value::from(7));
    }
}
