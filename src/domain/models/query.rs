//! Structural query surface over experiment and trial documents.
//!
//! A query maps dotted field paths to matchers; all filters must hold.
//! Adapters translate the same structure into their native form, and
//! [`Query::matches`] is the reference evaluation used in memory.

use std::cmp::Ordering;

use serde_json::Value;

use super::document::{lookup, Document, ID_FIELD};

/// Condition on a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum Matcher {
    /// Field equals the value. `Eq(Null)` matches a missing or null field.
    Eq(Value),
    /// Field equals one of the values.
    In(Vec<Value>),
    /// Field is strictly less than the value (numbers or strings).
    Lt(Value),
    /// Field is strictly greater than the value (numbers or strings).
    Gt(Value),
}

impl Matcher {
    /// Evaluate against a resolved field value.
    pub fn matches(&self, field: Option<&Value>) -> bool {
        match self {
            Self::Eq(Value::Null) => matches!(field, None | Some(Value::Null)),
            Self::Eq(expected) => field.is_some_and(|v| values_equal(v, expected)),
            Self::In(options) => field.is_some_and(|v| options.iter().any(|o| values_equal(v, o))),
            Self::Lt(bound) => {
                field.and_then(|v| compare_values(v, bound)) == Some(Ordering::Less)
            }
            Self::Gt(bound) => {
                field.and_then(|v| compare_values(v, bound)) == Some(Ordering::Greater)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Result ordering; ties are always broken by `_id` ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub field: String,
    pub order: SortOrder,
}

/// Conjunction of field filters with optional ordering and limit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<(String, Matcher)>,
    pub sort: Option<Sort>,
    pub limit: Option<usize>,
}

impl Query {
    /// Empty query: matches everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Query for a single record by id.
    pub fn by_id(id: impl Into<String>) -> Self {
        Self::new().eq(ID_FIELD, Value::String(id.into()))
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), Matcher::Eq(value.into())));
        self
    }

    pub fn is_in<V: Into<Value>>(
        mut self,
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.filters.push((field.into(), Matcher::In(values)));
        self
    }

    pub fn lt(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), Matcher::Lt(value.into())));
        self
    }

    pub fn gt(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), Matcher::Gt(value.into())));
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort = Some(Sort { field: field.into(), order });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Append the filters of `other`; ordering and limit of `self` are kept.
    pub fn and(mut self, other: Self) -> Self {
        self.filters.extend(other.filters);
        self
    }

    /// Drop ordering and limit, keeping only the filters.
    pub fn filters_only(&self) -> Self {
        Self { filters: self.filters.clone(), sort: None, limit: None }
    }

    /// Whether every filter holds for `doc`.
    pub fn matches(&self, doc: &Document) -> bool {
        self.filters
            .iter()
            .all(|(path, matcher)| matcher.matches(lookup(doc, path)))
    }

    /// Order two documents by this query's sort, then by `_id`.
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        let by_field = self.sort.as_ref().map_or(Ordering::Equal, |sort| {
            let ord = compare_optional(lookup(a, &sort.field), lookup(b, &sort.field));
            match sort.order {
                SortOrder::Ascending => ord,
                SortOrder::Descending => ord.reverse(),
            }
        });
        by_field.then_with(|| compare_optional(a.get(ID_FIELD), b.get(ID_FIELD)))
    }
}

/// JSON equality where `1` and `1.0` are the same number.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Order numbers numerically and strings lexicographically.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

// Missing and null sort first, as SQL NULLs do in ascending order.
fn compare_optional(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
    }
}
