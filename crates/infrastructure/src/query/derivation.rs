//! Method-name query derivation.
//!
//! A method name such as `findTop3ByUsernameAndAgeGreaterThanOrderByAgeDesc`
//! (or its snake_case form) is split into words and parsed into a
//! [`DerivedQuery`]: subject, predicate tree and static ordering. Nothing here
//! knows about SQL.
//!
//! Property words are resolved against the schema: the whole run of words
//! first (`team_id`), then an association prefix plus a property of its target
//! (`team` + `name`). Field names that themselves contain the words `and` or
//! `or` cannot be expressed.

use super::model::{QueryModel, Selection};
use super::predicate::{Condition, Operator, ParamRef, Predicate};
use crate::{Error, Result};
use datajpa_common::{Order, Sort, SortDirection};
use datajpa_domain::EntitySchema;
use once_cell::sync::Lazy;
use regex::Regex;

static LIMIT_QUALIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(top|first)(\d*)$").unwrap()
});

/// Operation implied by the leading verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    /// `find`, `read`, `get`, `query`, `search`, `stream`
    Find,
    Count,
    Exists,
    /// `delete`, `remove`: load matches, then remove each
    Delete,
}

/// Parsed method name.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedQuery {
    pub subject: Subject,
    pub distinct: bool,
    /// `TopN` / `FirstN`
    pub limit: Option<u64>,
    pub predicate: Option<Predicate<String>>,
    pub sort: Sort,
    /// Positional arguments the method takes
    pub parameter_count: usize,
}

impl DerivedQuery {
    /// Parse `method` against the root `schema`.
    pub fn parse(method: &str, schema: &'static EntitySchema) -> Result<Self> {
        let words = split_words(method);
        let verb = words
            .first()
            .ok_or_else(|| Error::InvalidQuery("empty method name".to_string()))?;

        let subject = match verb.as_str() {
            "find" | "read" | "get" | "query" | "search" | "stream" => Subject::Find,
            "count" => Subject::Count,
            "exists" => Subject::Exists,
            "delete" | "remove" => Subject::Delete,
            other => {
                return Err(Error::InvalidQuery(format!(
                    "'{}' does not start with a query verb (got '{}')",
                    method, other
                )))
            }
        };

        let order_at = find_pair(&words, "order", "by");
        let by_at = words
            .iter()
            .enumerate()
            .position(|(i, w)| w == "by" && (i == 0 || words[i - 1] != "order"))
            .filter(|&i| order_at.map_or(true, |o| i < o));

        let subject_end = by_at.or(order_at).unwrap_or(words.len());
        let (distinct, limit) = parse_qualifiers(&words[1..subject_end]);

        let criteria_end = order_at.unwrap_or(words.len());
        let mut parameter_count = 0;
        let predicate = match by_at {
            // `findTop3ByOrderByAgeDesc`: `By` directly followed by `OrderBy`
            Some(at) if order_at == Some(at + 1) => None,
            Some(at) => Some(parse_predicate(
                method,
                &words[at + 1..criteria_end],
                schema,
                &mut parameter_count,
            )?),
            None => None,
        };

        let sort = match order_at {
            Some(at) => parse_order(method, &words[at + 2..], schema)?,
            None => Sort::unsorted(),
        };

        Ok(Self {
            subject,
            distinct,
            limit,
            predicate,
            sort,
            parameter_count,
        })
    }

    /// The query model for this method.
    pub fn into_model(self, schema: &'static EntitySchema) -> QueryModel {
        let mut model = match self.subject {
            Subject::Count => QueryModel::count(schema.name),
            Subject::Exists => {
                let mut model = QueryModel::select(schema.name);
                model.selection = Selection::Paths(vec![schema.id_field().name.to_string()]);
                model.limit = Some(1);
                model
            }
            Subject::Find | Subject::Delete => QueryModel::select(schema.name),
        };

        model.distinct = self.distinct;
        model.filter = self.predicate;
        model.sort = self.sort;
        if let Some(limit) = self.limit {
            model.limit = Some(limit);
        }
        model
    }
}

/// Split camelCase or snake_case into lowercase words.
///
/// Digits stay attached to the word they follow (`Top3` -> `top3`).
pub fn split_words(method: &str) -> Vec<String> {
    if method.contains('_') {
        return method
            .split('_')
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();
    }

    let chars: Vec<char> = method.chars().collect();
    let mut words = Vec::new();
    let mut current = String::new();

    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() && !current.is_empty() {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if !prev.is_uppercase() || next_is_lower {
                words.push(std::mem::take(&mut current));
            }
        }
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn find_pair(words: &[String], first: &str, second: &str) -> Option<usize> {
    words
        .windows(2)
        .position(|pair| pair[0] == first && pair[1] == second)
}

fn parse_qualifiers(words: &[String]) -> (bool, Option<u64>) {
    let mut distinct = false;
    let mut limit = None;

    for word in words {
        if word == "distinct" {
            distinct = true;
        } else if let Some(caps) = LIMIT_QUALIFIER.captures(word) {
            let n = caps
                .get(2)
                .and_then(|m| m.as_str().parse::<u64>().ok())
                .unwrap_or(1);
            limit = Some(n);
        }
    }

    (distinct, limit)
}

/// Keyword suffixes, matched against the end of a clause.
const KEYWORDS: &[(&[&str], Operator)] = &[
    (&["greater", "than", "equal"], Operator::GreaterThanEqual),
    (&["less", "than", "equal"], Operator::LessThanEqual),
    (&["greater", "than"], Operator::GreaterThan),
    (&["less", "than"], Operator::LessThan),
    (&["after"], Operator::GreaterThan),
    (&["before"], Operator::LessThan),
    (&["not", "null"], Operator::IsNotNull),
    (&["null"], Operator::IsNull),
    (&["not", "in"], Operator::NotIn),
    (&["in"], Operator::In),
    (&["not", "like"], Operator::NotLike),
    (&["like"], Operator::Like),
    (&["starting", "with"], Operator::StartingWith),
    (&["starts", "with"], Operator::StartingWith),
    (&["ending", "with"], Operator::EndingWith),
    (&["ends", "with"], Operator::EndingWith),
    (&["containing"], Operator::Containing),
    (&["contains"], Operator::Containing),
    (&["true"], Operator::True),
    (&["false"], Operator::False),
    (&["not"], Operator::NotEquals),
    (&["equals"], Operator::Equals),
    (&["is"], Operator::Equals),
];

fn split_keyword(words: &[String]) -> (&[String], Operator) {
    let best = KEYWORDS
        .iter()
        .filter(|(kw, _)| {
            kw.len() < words.len()
                && words[words.len() - kw.len()..]
                    .iter()
                    .zip(kw.iter())
                    .all(|(w, k)| w == k)
        })
        .max_by_key(|(kw, _)| kw.len());

    match best {
        Some((kw, op)) => {
            let mut end = words.len() - kw.len();
            // `Is` before another keyword is noise: `AgeIsGreaterThan`
            if end > 1 && words[end - 1] == "is" && !(kw.len() == 1 && kw[0] == "is") {
                end -= 1;
            }
            (&words[..end], *op)
        }
        None => (words, Operator::Equals),
    }
}

/// Resolve property words to a dotted path.
pub fn resolve_property(words: &[String], schema: &'static EntitySchema) -> Option<String> {
    if words.is_empty() {
        return None;
    }

    let joined = words.join("_");
    if schema.field(&joined).is_some() || schema.association(&joined).is_some() {
        return Some(joined);
    }

    for split in (1..words.len()).rev() {
        let prefix = words[..split].join("_");
        if let Some(association) = schema.association(&prefix) {
            if let Some(rest) = resolve_property(&words[split..], association.target_schema()) {
                return Some(format!("{}.{}", association.name, rest));
            }
        }
    }

    None
}

fn parse_predicate(
    method: &str,
    words: &[String],
    schema: &'static EntitySchema,
    parameter_count: &mut usize,
) -> Result<Predicate<String>> {
    let mut groups = Vec::new();

    for group in words.split(|w| w == "or") {
        let mut clauses = Vec::new();
        for clause in group.split(|w| w == "and") {
            if clause.is_empty() {
                return Err(Error::InvalidQuery(format!(
                    "'{}' has an empty criteria clause",
                    method
                )));
            }

            let (property, op) = split_keyword(clause);
            let path = resolve_property(property, schema)
                .ok_or_else(|| Error::invalid_field(schema.name, &property.join("_")))?;

            let param = if op.arity() == 1 {
                let index = *parameter_count;
                *parameter_count += 1;
                Some(ParamRef::Index(index))
            } else {
                None
            };

            clauses.push(Predicate::Condition(Condition { path, op, param }));
        }
        groups.push(if clauses.len() == 1 {
            clauses.remove(0)
        } else {
            Predicate::And(clauses)
        });
    }

    Ok(if groups.len() == 1 {
        groups.remove(0)
    } else {
        Predicate::Or(groups)
    })
}

fn parse_order(method: &str, words: &[String], schema: &'static EntitySchema) -> Result<Sort> {
    let mut orders = Vec::new();
    let mut pending: Vec<String> = Vec::new();

    let mut flush = |pending: &mut Vec<String>, direction: SortDirection| -> Result<()> {
        if pending.is_empty() {
            return Err(Error::InvalidQuery(format!(
                "'{}' has a sort direction without a property",
                method
            )));
        }
        let path = resolve_property(pending, schema)
            .ok_or_else(|| Error::invalid_sort(schema.name, &pending.join("_")))?;
        orders.push(Order::new(path, direction));
        pending.clear();
        Ok(())
    };

    for word in words {
        match word.as_str() {
            "asc" => flush(&mut pending, SortDirection::Asc)?,
            "desc" => flush(&mut pending, SortDirection::Desc)?,
            _ => pending.push(word.clone()),
        }
    }
    if !pending.is_empty() {
        flush(&mut pending, SortDirection::Asc)?;
    }

    if orders.is_empty() {
        return Err(Error::InvalidQuery(format!(
            "'{}' has an empty OrderBy clause",
            method
        )));
    }
    Ok(Sort::from(orders))
}
