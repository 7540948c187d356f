//! Predicate tree shared by derived, explicit and criteria queries.
//!
//! `P` is the path type: unresolved property paths (`String`) in a
//! [`super::QueryModel`], resolved [`super::plan::ColumnRef`]s in a compiled plan.

use datajpa_domain::Value;
use std::fmt;

/// Comparison operator of a predicate leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanEqual,
    LessThan,
    LessThanEqual,
    In,
    NotIn,
    Like,
    NotLike,
    StartingWith,
    EndingWith,
    Containing,
    IsNull,
    IsNotNull,
    True,
    False,
}

impl Operator {
    /// Number of parameters the operator consumes.
    pub fn arity(&self) -> usize {
        match self {
            Self::IsNull | Self::IsNotNull | Self::True | Self::False => 0,
            _ => 1,
        }
    }

    /// Whether the operator matches text patterns.
    pub fn is_pattern(&self) -> bool {
        matches!(
            self,
            Self::Like | Self::NotLike | Self::StartingWith | Self::EndingWith | Self::Containing
        )
    }

    /// Whether the parameter is a list.
    pub fn takes_list(&self) -> bool {
        matches!(self, Self::In | Self::NotIn)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Equals => "=",
            Self::NotEquals => "<>",
            Self::GreaterThan => ">",
            Self::GreaterThanEqual => ">=",
            Self::LessThan => "<",
            Self::LessThanEqual => "<=",
            Self::In => "IN",
            Self::NotIn => "NOT IN",
            Self::Like => "LIKE",
            Self::NotLike => "NOT LIKE",
            Self::StartingWith => "STARTING WITH",
            Self::EndingWith => "ENDING WITH",
            Self::Containing => "CONTAINING",
            Self::IsNull => "IS NULL",
            Self::IsNotNull => "IS NOT NULL",
            Self::True => "IS TRUE",
            Self::False => "IS FALSE",
        };
        f.write_str(s)
    }
}

/// Where a predicate leaf gets its value from.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamRef {
    /// 0-based positional argument (`?1` is index 0)
    Index(usize),
    /// Named argument (`:username`)
    Named(String),
    /// Inline value
    Literal(Value),
}

impl fmt::Display for ParamRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "?{}", i + 1),
            Self::Named(name) => write!(f, ":{}", name),
            Self::Literal(v) => write!(f, "{}", v),
        }
    }
}

/// A single comparison against one entity field.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition<P> {
    pub path: P,
    pub op: Operator,
    /// `None` exactly when `op.arity() == 0`
    pub param: Option<ParamRef>,
}

/// Boolean combination of conditions.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate<P> {
    And(Vec<Predicate<P>>),
    Or(Vec<Predicate<P>>),
    Condition(Condition<P>),
}

impl<P> Predicate<P> {
    /// A leaf comparing `path` with `param`.
    pub fn condition(path: impl Into<P>, op: Operator, param: Option<ParamRef>) -> Self {
        Self::Condition(Condition {
            path: path.into(),
            op,
            param,
        })
    }

    /// Conjunction, flattening nested `And`s.
    pub fn and(self, other: Predicate<P>) -> Self {
        match (self, other) {
            (Self::And(mut left), Self::And(right)) => {
                left.extend(right);
                Self::And(left)
            }
            (Self::And(mut left), right) => {
                left.push(right);
                Self::And(left)
            }
            (left, right) => Self::And(vec![left, right]),
        }
    }

    /// Disjunction, flattening nested `Or`s.
    pub fn or(self, other: Predicate<P>) -> Self {
        match (self, other) {
            (Self::Or(mut left), Self::Or(right)) => {
                left.extend(right);
                Self::Or(left)
            }
            (Self::Or(mut left), right) => {
                left.push(right);
                Self::Or(left)
            }
            (left, right) => Self::Or(vec![left, right]),
        }
    }

    /// Visit every leaf in evaluation order.
    pub fn for_each_condition<'a, F>(&'a self, f: &mut F)
    where
        F: FnMut(&'a Condition<P>),
    {
        match self {
            Self::And(items) | Self::Or(items) => {
                for item in items {
                    item.for_each_condition(f);
                }
            }
            Self::Condition(c) => f(c),
        }
    }

    /// Rebuild the tree with every leaf transformed by `f`.
    pub fn try_map<Q, E, F>(self, f: &mut F) -> Result<Predicate<Q>, E>
    where
        F: FnMut(Condition<P>) -> Result<Condition<Q>, E>,
    {
        Ok(match self {
            Self::And(items) => Predicate::And(
                items
                    .into_iter()
                    .map(|p| p.try_map(f))
                    .collect::<Result<_, _>>()?,
            ),
            Self::Or(items) => Predicate::Or(
                items
                    .into_iter()
                    .map(|p| p.try_map(f))
                    .collect::<Result<_, _>>()?,
            ),
            Self::Condition(c) => Predicate::Condition(f(c)?),
        })
    }
}

/// Builders for criteria queries, binding inline values.
impl Predicate<String> {
    fn literal(path: &str, op: Operator, value: impl Into<Value>) -> Self {
        Self::condition(path, op, Some(ParamRef::Literal(value.into())))
    }

    pub fn eq(path: &str, value: impl Into<Value>) -> Self {
        Self::literal(path, Operator::Equals, value)
    }

    pub fn ne(path: &str, value: impl Into<Value>) -> Self {
        Self::literal(path, Operator::NotEquals, value)
    }

    pub fn gt(path: &str, value: impl Into<Value>) -> Self {
        Self::literal(path, Operator::GreaterThan, value)
    }

    pub fn ge(path: &str, value: impl Into<Value>) -> Self {
        Self::literal(path, Operator::GreaterThanEqual, value)
    }

    pub fn lt(path: &str, value: impl Into<Value>) -> Self {
        Self::literal(path, Operator::LessThan, value)
    }

    pub fn le(path: &str, value: impl Into<Value>) -> Self {
        Self::literal(path, Operator::LessThanEqual, value)
    }

    pub fn like(path: &str, pattern: &str) -> Self {
        Self::literal(path, Operator::Like, pattern)
    }

    pub fn starts_with(path: &str, prefix: &str) -> Self {
        Self::literal(path, Operator::StartingWith, prefix)
    }

    pub fn is_in<T: Into<Value>>(path: &str, values: Vec<T>) -> Self {
        Self::literal(path, Operator::In, values)
    }

    pub fn is_null(path: &str) -> Self {
        Self::condition(path, Operator::IsNull, None)
    }

    pub fn is_not_null(path: &str) -> Self {
        Self::condition(path, Operator::IsNotNull, None)
    }

    /// Leaf bound to a named argument instead of an inline value.
    pub fn named(path: &str, op: Operator, name: &str) -> Self {
        Self::condition(path, op, Some(ParamRef::Named(name.to_string())))
    }
}

impl<P: fmt::Display> fmt::Display for Predicate<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And(items) | Self::Or(items) => {
                let sep = if matches!(self, Self::And(_)) { " AND " } else { " OR " };
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(sep)?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Self::Condition(c) => match &c.param {
                Some(p) => write!(f, "{} {} {}", c.path, c.op, p),
                None => write!(f, "{} {}", c.path, c.op),
            },
        }
    }
}
