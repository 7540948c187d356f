//! Query descriptors and their arguments.

use super::model::QueryModel;
use datajpa_common::Sort;
use datajpa_domain::Value;
use indexmap::IndexMap;
use std::time::Duration;

/// Where the query comes from.
#[derive(Debug, Clone)]
pub enum QuerySource {
    /// Method name such as `findByUsernameAndAgeGreaterThan`
    Derived(String),
    /// Explicit query text
    Text(String),
    /// Query model built in code
    Criteria(QueryModel),
}

/// Shape of the result a descriptor produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultShape {
    /// One value (count, exists, aggregate)
    Scalar,
    /// All matching rows
    #[default]
    List,
    /// Zero or one row; more is an error
    OptionalSingle,
    /// A window plus total count
    Page,
    /// A window plus has-next flag
    Slice,
}

/// Row lock requested by a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    #[default]
    None,
    /// `FOR SHARE`
    PessimisticRead,
    /// `FOR UPDATE`
    PessimisticWrite,
}

impl LockMode {
    /// Whether any row lock is requested.
    pub fn is_locking(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Execution hints.
#[derive(Debug, Clone, Default)]
pub struct QueryHints {
    /// Associations loaded by the same statement (left fetch join)
    pub fetch: Vec<String>,
    /// Row lock mode
    pub lock: LockMode,
    /// Lock wait override; zero means fail immediately
    pub lock_timeout: Option<Duration>,
    /// Loaded entities are not tracked for updates
    pub read_only: bool,
}

/// Everything needed to run one repository query.
#[derive(Debug, Clone)]
pub struct QueryDescriptor {
    pub source: QuerySource,
    pub shape: ResultShape,
    /// Static ordering, applied before any page request ordering
    pub sort: Sort,
    pub hints: QueryHints,
    /// Explicit count text for page queries over explicit text
    pub count_query: Option<String>,
    /// Narrowed select list for derived and criteria queries
    pub projection: Option<Vec<String>>,
}

impl QueryDescriptor {
    fn new(source: QuerySource) -> Self {
        Self {
            source,
            shape: ResultShape::List,
            sort: Sort::unsorted(),
            hints: QueryHints::default(),
            count_query: None,
            projection: None,
        }
    }

    /// Descriptor derived from a method name.
    pub fn derived(method: impl Into<String>) -> Self {
        Self::new(QuerySource::Derived(method.into()))
    }

    /// Descriptor over explicit query text.
    pub fn text(query: impl Into<String>) -> Self {
        Self::new(QuerySource::Text(query.into()))
    }

    /// Descriptor over a query model.
    pub fn criteria(model: QueryModel) -> Self {
        Self::new(QuerySource::Criteria(model))
    }

    pub fn with_shape(mut self, shape: ResultShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn sorted(mut self, sort: Sort) -> Self {
        self.sort = sort;
        self
    }

    /// Load `association` with the same statement.
    pub fn fetch(mut self, association: impl Into<String>) -> Self {
        self.hints.fetch.push(association.into());
        self
    }

    pub fn lock(mut self, mode: LockMode) -> Self {
        self.hints.lock = mode;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.hints.lock_timeout = Some(timeout);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.hints.read_only = true;
        self
    }

    pub fn count_query(mut self, query: impl Into<String>) -> Self {
        self.count_query = Some(query.into());
        self
    }

    /// Select only these property paths.
    pub fn project(mut self, paths: &[&str]) -> Self {
        self.projection = Some(paths.iter().map(|p| p.to_string()).collect());
        self
    }
}

/// Ordered positional and named arguments of one invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    positional: Vec<Value>,
    named: IndexMap<String, Value>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Bind a named argument.
    pub fn named(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.named.insert(name.into(), value.into());
        self
    }

    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    pub fn named_values(&self) -> &IndexMap<String, Value> {
        &self.named
    }

    pub fn get_positional(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    pub fn get_named(&self, name: &str) -> Option<&Value> {
        self.named.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }
}

impl<T: Into<Value>> FromIterator<T> for Arguments {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            positional: iter.into_iter().map(Into::into).collect(),
            named: IndexMap::new(),
        }
    }
}

/// Positional [`Arguments`] from a list of values.
#[macro_export]
macro_rules! args {
    () => { $crate::query::Arguments::new() };
    ($($value:expr),+ $(,)?) => {
        $crate::query::Arguments::new()$(.arg($value))+
    };
}
