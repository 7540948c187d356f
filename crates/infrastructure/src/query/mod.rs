//! Query engine.
//!
//! Three front ends produce one intermediate form:
//!
//! - [`derivation`]: method names such as `findByUsernameAndAgeGreaterThan`
//! - [`explicit`]: query text (`select m from Member m where ...`)
//! - criteria: a [`QueryModel`] built in code
//!
//! The [`compiler`] resolves the model against entity schemas and binds the
//! invocation arguments, producing a [`CompiledQuery`] that any
//! [`crate::store::Store`] can execute.

pub mod compiler;
pub mod derivation;
pub mod descriptor;
pub mod explicit;
pub mod model;
pub mod plan;
pub mod predicate;

pub use compiler::QueryCompiler;
pub use derivation::{DerivedQuery, Subject};
pub use descriptor::{Arguments, LockMode, QueryDescriptor, QueryHints, QuerySource, ResultShape};
pub use model::{AssignOp, JoinKind, QueryKind, QueryModel, Selection};
pub use plan::{BindParam, CompiledQuery, Plan, QueryOutcome, ResultLayout, RowWrite, StatementKind};
pub use predicate::{Operator, ParamRef, Predicate};

use crate::{Error, Result};
use datajpa_domain::EntitySchema;

/// A descriptor turned into a model, with hints and static sort applied.
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    pub model: QueryModel,
    /// What the caller does with the matches. Bulk models ignore it.
    pub subject: Subject,
}

fn subject_of(model: &QueryModel) -> Subject {
    match model.kind {
        QueryKind::Count => Subject::Count,
        _ => Subject::Find,
    }
}

/// Resolve a descriptor issued by a repository of `schema`.
pub fn prepare(descriptor: &QueryDescriptor, schema: &'static EntitySchema) -> Result<PreparedQuery> {
    let (mut model, subject) = match &descriptor.source {
        QuerySource::Derived(method) => {
            let derived = DerivedQuery::parse(method, schema)?;
            let subject = derived.subject;
            (derived.into_model(schema), subject)
        }
        QuerySource::Text(text) => {
            let model = explicit::parse(text)?;
            let subject = subject_of(&model);
            (model, subject)
        }
        QuerySource::Criteria(model) => (model.clone(), subject_of(model)),
    };

    if let Some(paths) = &descriptor.projection {
        if !model.is_select() {
            return Err(Error::InvalidQuery(
                "projections apply to select queries only".to_string(),
            ));
        }
        model.selection = Selection::Paths(paths.clone());
    }

    model.sort = model.sort.and(descriptor.sort.clone());
    model.apply_hints(&descriptor.hints);

    Ok(PreparedQuery { model, subject })
}

/// The count statement paired with a page query.
///
/// Uses the descriptor's explicit count text when present, otherwise derives
/// one from the data model.
pub fn count_model_for(descriptor: &QueryDescriptor, data: &QueryModel) -> Result<QueryModel> {
    match &descriptor.count_query {
        Some(text) => {
            let model = explicit::parse(text)?;
            if model.kind != QueryKind::Count {
                return Err(Error::InvalidQuery(format!(
                    "count query must select count(...): '{}'",
                    text
                )));
            }
            Ok(model)
        }
        None => Ok(data.count_model()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datajpa_common::Sort;
    use datajpa_domain::MEMBER_SCHEMA;

    #[test]
    fn test_prepare_derived_with_hints() {
        let descriptor = QueryDescriptor::derived("findByAge")
            .sorted(Sort::desc("username"))
            .fetch("team");

        let prepared = prepare(&descriptor, &MEMBER_SCHEMA).unwrap();
        assert_eq!(prepared.subject, Subject::Find);
        assert_eq!(prepared.model.joins.len(), 1);
        assert!(prepared.model.joins[0].fetch);
        assert_eq!(prepared.model.sort, Sort::desc("username"));
    }

    #[test]
    fn test_prepare_projection() {
        let descriptor = QueryDescriptor::derived("findByUsername").project(&["username"]);
        let prepared = prepare(&descriptor, &MEMBER_SCHEMA).unwrap();
        assert_eq!(
            prepared.model.selection,
            Selection::Paths(vec!["username".to_string()])
        );

        let bulk = QueryDescriptor::text("delete from Member m").project(&["username"]);
        assert!(matches!(
            prepare(&bulk, &MEMBER_SCHEMA),
            Err(Error::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_count_query_override() {
        let descriptor = QueryDescriptor::text("select m from Member m left join m.team t")
            .count_query("select count(m.username) from Member m");
        let data = prepare(&descriptor, &MEMBER_SCHEMA).unwrap().model;

        let count = count_model_for(&descriptor, &data).unwrap();
        assert_eq!(count.kind, QueryKind::Count);
        assert!(count.joins.is_empty());

        let bad = QueryDescriptor::text("select m from Member m").count_query("select m from Member m");
        assert!(count_model_for(&bad, &data).is_err());
    }
}
