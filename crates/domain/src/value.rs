//! Scalar values and rows exchanged between entities and stores.
//!
//! A [`Row`] is the flattened form of an entity keyed by schema field name.
//! Stores never see entity structs, only rows and [`Value`]s.

use crate::errors::EntityError;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Column type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// 64-bit signed integer
    Int,
    /// UTF-8 text
    Text,
    /// Boolean
    Bool,
    /// UTC timestamp
    Timestamp,
}

impl FieldType {
    /// PostgreSQL column type used for DDL.
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Int => "BIGINT",
            Self::Text => "TEXT",
            Self::Bool => "BOOLEAN",
            Self::Timestamp => "TIMESTAMPTZ",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int => write!(f, "int"),
            Self::Text => write!(f, "text"),
            Self::Bool => write!(f, "bool"),
            Self::Timestamp => write!(f, "timestamp"),
        }
    }
}

/// A single scalar (or list, for `IN` parameters) value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Timestamp value
    Timestamp(DateTime<Utc>),
    /// Text value
    Text(String),
    /// List of values, only valid as an `IN` parameter
    List(Vec<Value>),
}

impl Value {
    /// Whether this is SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The scalar type of this value, if it has one.
    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            Self::Int(_) => Some(FieldType::Int),
            Self::Text(_) => Some(FieldType::Text),
            Self::Bool(_) => Some(FieldType::Bool),
            Self::Timestamp(_) => Some(FieldType::Timestamp),
            Self::Null | Self::List(_) => None,
        }
    }

    /// Whether this value may be stored in (or compared with) a field of `ty`.
    ///
    /// NULL is compatible with every type.
    pub fn is_compatible_with(&self, ty: FieldType) -> bool {
        match self {
            Self::Null => true,
            Self::List(_) => false,
            other => other.field_type() == Some(ty),
        }
    }

    /// Integer content, if any.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Text content, if any.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Boolean content, if any.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Timestamp content, if any.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    /// List content, if any.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// SQL-style comparison: `None` when either side is NULL or the types differ.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Timestamp(a), Self::Timestamp(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Total order used for sorting: NULLs sort last in ascending order.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self.is_null(), other.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => self.compare(other).unwrap_or(Ordering::Equal),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            Self::Text(v) => write!(f, "'{}'", v),
            Self::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Self::Text(v.clone())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

/// Flattened entity state keyed by schema field name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row(IndexMap<&'static str, Value>);

impl Row {
    /// Create an empty row.
    pub fn new() -> Self {
        Self(IndexMap::new())
    }

    /// Builder-style insert.
    pub fn with(mut self, field: &'static str, value: impl Into<Value>) -> Self {
        self.0.insert(field, value.into());
        self
    }

    /// Set a field, returning the previous value.
    pub fn set(&mut self, field: &'static str, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field, value.into())
    }

    /// Get a field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Whether the row contains `field`.
    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// Iterate fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Value)> {
        self.0.iter().map(|(k, v)| (*k, v))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the row has no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn required(&self, field: &'static str) -> Result<&Value, EntityError> {
        self.0
            .get(field)
            .ok_or(EntityError::MissingField { field })
    }

    fn mismatch(field: &'static str, expected: FieldType, actual: &Value) -> EntityError {
        EntityError::TypeMismatch {
            field,
            expected,
            actual: actual.to_string(),
        }
    }

    /// Required non-null integer field.
    pub fn int(&self, field: &'static str) -> Result<i64, EntityError> {
        let value = self.required(field)?;
        value
            .as_int()
            .ok_or_else(|| Self::mismatch(field, FieldType::Int, value))
    }

    /// Nullable integer field.
    pub fn opt_int(&self, field: &'static str) -> Result<Option<i64>, EntityError> {
        match self.0.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_int()
                .map(Some)
                .ok_or_else(|| Self::mismatch(field, FieldType::Int, value)),
        }
    }

    /// Required non-null text field.
    pub fn text(&self, field: &'static str) -> Result<String, EntityError> {
        let value = self.required(field)?;
        value
            .as_text()
            .map(str::to_string)
            .ok_or_else(|| Self::mismatch(field, FieldType::Text, value))
    }

    /// Nullable text field.
    pub fn opt_text(&self, field: &'static str) -> Result<Option<String>, EntityError> {
        match self.0.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_text()
                .map(|s| Some(s.to_string()))
                .ok_or_else(|| Self::mismatch(field, FieldType::Text, value)),
        }
    }

    /// Nullable timestamp field.
    pub fn opt_timestamp(
        &self,
        field: &'static str,
    ) -> Result<Option<DateTime<Utc>>, EntityError> {
        match self.0.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_timestamp()
                .map(Some)
                .ok_or_else(|| Self::mismatch(field, FieldType::Timestamp, value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from(10), Value::Int(10));
        assert_eq!(Value::from("AAA"), Value::Text("AAA".to_string()));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(
            Value::from(vec!["a", "b"]),
            Value::List(vec![Value::from("a"), Value::from("b")])
        );
    }

    #[test]
    fn test_compare_is_sql_like() {
        assert_eq!(Value::from(1).compare(&Value::from(2)), Some(Ordering::Less));
        assert_eq!(Value::Null.compare(&Value::from(2)), None);
        assert_eq!(Value::from("a").compare(&Value::from(2)), None);
    }

    #[test]
    fn test_nulls_sort_last() {
        let mut values = vec![Value::Null, Value::from(3), Value::from(1)];
        values.sort_by(|a, b| a.sort_cmp(b));
        assert_eq!(values, vec![Value::from(1), Value::from(3), Value::Null]);
    }

    #[test]
    fn test_row_accessors() {
        let row = Row::new()
            .with("username", "member1")
            .with("age", 10)
            .with("team_id", Value::Null);

        assert_eq!(row.text("username").unwrap(), "member1");
        assert_eq!(row.int("age").unwrap(), 10);
        assert_eq!(row.opt_int("team_id").unwrap(), None);
        assert!(matches!(
            row.int("username"),
            Err(EntityError::TypeMismatch { field: "username", .. })
        ));
        assert!(matches!(
            row.text("missing"),
            Err(EntityError::MissingField { field: "missing" })
        ));
    }
}
