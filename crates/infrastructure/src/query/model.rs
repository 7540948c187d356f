//! Query model: the intermediate form every query source is turned into.
//!
//! Derived method names, explicit text and criteria builders all produce a
//! [`QueryModel`]. Paths are still unresolved strings here; the compiler
//! resolves them against the schema.

use super::descriptor::{LockMode, QueryHints};
use super::predicate::{ParamRef, Predicate};
use datajpa_common::Sort;
use datajpa_domain::Value;
use std::time::Duration;

/// Statement kind.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryKind {
    Select,
    /// `count(root)`; `distinct` counts distinct identities
    Count,
    Update(Vec<Assignment>),
    Delete,
}

/// What a select returns per row.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Selection {
    /// The root entity, plus fetch-joined associations
    #[default]
    Entity,
    /// Individual property paths
    Paths(Vec<String>),
    /// `new Name(paths...)`; the name is informational
    Constructor { name: String, paths: Vec<String> },
}

impl Selection {
    /// Selected paths, if the selection is narrowed.
    pub fn paths(&self) -> Option<&[String]> {
        match self {
            Self::Entity => None,
            Self::Paths(paths) | Self::Constructor { paths, .. } => Some(paths),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

/// An explicit join on an association path.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinSpec {
    /// Association path, possibly alias-qualified (`m.team`)
    pub path: String,
    pub alias: Option<String>,
    pub kind: JoinKind,
    /// Whether the joined entity is hydrated with the root
    pub fetch: bool,
}

/// How a bulk update changes a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    /// `field = value`
    Set,
    /// `field = field + value`
    Add,
    /// `field = field - value`
    Subtract,
}

/// One `SET` clause of a bulk update.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub path: String,
    pub op: AssignOp,
    pub param: ParamRef,
}

/// Unresolved query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryModel {
    /// Root entity name
    pub entity: String,
    /// Root alias used in explicit text
    pub alias: Option<String>,
    pub kind: QueryKind,
    pub selection: Selection,
    pub distinct: bool,
    pub joins: Vec<JoinSpec>,
    pub filter: Option<Predicate<String>>,
    pub sort: Sort,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub lock: LockMode,
    pub lock_timeout: Option<Duration>,
}

impl QueryModel {
    fn new(entity: &str, kind: QueryKind) -> Self {
        Self {
            entity: entity.to_string(),
            alias: None,
            kind,
            selection: Selection::Entity,
            distinct: false,
            joins: Vec::new(),
            filter: None,
            sort: Sort::unsorted(),
            limit: None,
            offset: None,
            lock: LockMode::None,
            lock_timeout: None,
        }
    }

    pub fn select(entity: &str) -> Self {
        Self::new(entity, QueryKind::Select)
    }

    pub fn count(entity: &str) -> Self {
        Self::new(entity, QueryKind::Count)
    }

    pub fn update(entity: &str) -> Self {
        Self::new(entity, QueryKind::Update(Vec::new()))
    }

    pub fn delete(entity: &str) -> Self {
        Self::new(entity, QueryKind::Delete)
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    /// AND `predicate` into the filter.
    pub fn filter(mut self, predicate: Predicate<String>) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
        self
    }

    pub fn join(mut self, path: &str, kind: JoinKind) -> Self {
        self.joins.push(JoinSpec {
            path: path.to_string(),
            alias: None,
            kind,
            fetch: false,
        });
        self
    }

    pub fn fetch_join(mut self, path: &str) -> Self {
        self.add_fetch(path);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn select_paths(mut self, paths: &[&str]) -> Self {
        self.selection = Selection::Paths(paths.iter().map(|p| p.to_string()).collect());
        self
    }

    pub fn order_by(mut self, sort: Sort) -> Self {
        self.sort = self.sort.and(sort);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// `SET path = value` with an inline value.
    pub fn set(self, path: &str, value: impl Into<Value>) -> Self {
        self.assign(path, AssignOp::Set, ParamRef::Literal(value.into()))
    }

    /// `SET path = path + value` with an inline value.
    pub fn increment(self, path: &str, value: impl Into<Value>) -> Self {
        self.assign(path, AssignOp::Add, ParamRef::Literal(value.into()))
    }

    /// Add a `SET` clause; ignored for non-update models.
    pub fn assign(mut self, path: &str, op: AssignOp, param: ParamRef) -> Self {
        if let QueryKind::Update(assignments) = &mut self.kind {
            assignments.push(Assignment {
                path: path.to_string(),
                op,
                param,
            });
        }
        self
    }

    fn add_fetch(&mut self, path: &str) {
        let existing = self
            .joins
            .iter_mut()
            .find(|j| j.path == path || j.path.split('.').last() == Some(path));
        match existing {
            Some(join) => {
                join.fetch = true;
            }
            None => self.joins.push(JoinSpec {
                path: path.to_string(),
                alias: None,
                kind: JoinKind::Left,
                fetch: true,
            }),
        }
    }

    /// Merge descriptor hints into the model.
    pub fn apply_hints(&mut self, hints: &QueryHints) {
        for path in &hints.fetch {
            self.add_fetch(path);
        }
        if hints.lock.is_locking() {
            self.lock = hints.lock;
        }
        if hints.lock_timeout.is_some() {
            self.lock_timeout = hints.lock_timeout;
        }
    }

    /// Every parameter reference in filter and assignment order.
    pub fn param_refs(&self) -> Vec<&ParamRef> {
        let mut refs = Vec::new();
        if let QueryKind::Update(assignments) = &self.kind {
            refs.extend(assignments.iter().map(|a| &a.param));
        }
        if let Some(filter) = &self.filter {
            filter.for_each_condition(&mut |c| {
                if let Some(p) = &c.param {
                    refs.push(p);
                }
            });
        }
        refs
    }

    /// The count statement matching this select.
    ///
    /// Sort, window and lock are dropped. Fetch joins are dropped unless an
    /// alias makes them referenceable, in which case they become plain joins.
    pub fn count_model(&self) -> QueryModel {
        let joins = self
            .joins
            .iter()
            .filter(|j| !j.fetch || j.alias.is_some())
            .map(|j| JoinSpec {
                fetch: false,
                ..j.clone()
            })
            .collect();

        QueryModel {
            entity: self.entity.clone(),
            alias: self.alias.clone(),
            kind: QueryKind::Count,
            selection: Selection::Entity,
            distinct: self.distinct,
            joins,
            filter: self.filter.clone(),
            sort: Sort::unsorted(),
            limit: None,
            offset: None,
            lock: LockMode::None,
            lock_timeout: None,
        }
    }

    pub fn is_select(&self) -> bool {
        matches!(self.kind, QueryKind::Select)
    }

    pub fn is_bulk(&self) -> bool {
        matches!(self.kind, QueryKind::Update(_) | QueryKind::Delete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datajpa_common::Sort;

    #[test]
    fn test_count_model_drops_fetch_sort_and_window() {
        let model = QueryModel::select("Member")
            .fetch_join("team")
            .filter(Predicate::eq("age", 10))
            .order_by(Sort::desc("username"))
            .limit(3);

        let count = model.count_model();
        assert_eq!(count.kind, QueryKind::Count);
        assert!(count.joins.is_empty());
        assert!(count.sort.is_unsorted());
        assert_eq!(count.limit, None);
        assert_eq!(count.filter, model.filter);
    }

    #[test]
    fn test_fetch_hint_reuses_explicit_join() {
        let mut model = QueryModel::select("Member").alias("m").join("m.team", JoinKind::Left);
        model.apply_hints(&QueryHints {
            fetch: vec!["team".to_string()],
            ..QueryHints::default()
        });
        assert_eq!(model.joins.len(), 1);
        assert!(model.joins[0].fetch);
    }

    #[test]
    fn test_param_refs_in_order() {
        let model = QueryModel::update("Member")
            .increment("age", 1)
            .filter(Predicate::named("age", super::super::Operator::GreaterThanEqual, "age"));

        let refs = model.param_refs();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0], &ParamRef::Literal(Value::from(1)));
        assert_eq!(refs[1], &ParamRef::Named("age".to_string()));
    }
}
