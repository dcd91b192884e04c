//! Metadata filters applied during search.
//!
//! `must` conditions are AND-ed and `must_not` conditions are AND-NOT-ed.
//! A condition on a missing field never matches. Integers and floats compare
//! numerically with each other; text compares lexicographically; booleans
//! only support equality.

use crate::{Metadata, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    In,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub op: FilterOp,
    /// Operand for every operator except `In`.
    #[serde(default)]
    pub value: Option<Value>,
    /// Operands for `In`.
    #[serde(default)]
    pub values: Vec<Value>,
}

impl Condition {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: Some(value.into()),
            values: Vec::new(),
        }
    }

    pub fn one_of(field: impl Into<String>, values: impl IntoIterator<Item = Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::In,
            value: None,
            values: values.into_iter().collect(),
        }
    }

    fn holds(&self, metadata: &Metadata) -> bool {
        let Some(actual) = metadata.get(&self.field) else {
            return false;
        };
        if self.op == FilterOp::In {
            return self.values.iter().any(|v| values_equal(actual, v));
        }
        let Some(expected) = &self.value else {
            return false;
        };
        match self.op {
            FilterOp::Eq => values_equal(actual, expected),
            FilterOp::Ne => !values_equal(actual, expected),
            FilterOp::Gt => compare(actual, expected) == Some(Ordering::Greater),
            FilterOp::Lt => compare(actual, expected) == Some(Ordering::Less),
            FilterOp::Gte => compare(actual, expected).is_some_and(|o| o != Ordering::Less),
            FilterOp::Lte => compare(actual, expected).is_some_and(|o| o != Ordering::Greater),
            FilterOp::In => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilter {
    #[serde(default)]
    pub must: Vec<Condition>,
    #[serde(default)]
    pub must_not: Vec<Condition>,
}

impl MetadataFilter {
    /// Shorthand for a single equality condition.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::default().and(Condition::new(field, FilterOp::Eq, value))
    }

    pub fn and(mut self, condition: Condition) -> Self {
        self.must.push(condition);
        self
    }

    pub fn and_not(mut self, condition: Condition) -> Self {
        self.must_not.push(condition);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.must.is_empty() && self.must_not.is_empty()
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.must.iter().all(|c| c.holds(metadata))
            && !self.must_not.iter().any(|c| c.holds(metadata))
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Integer(i) => Some(*i as f64),
        Value::Number(f) => Some(*f),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => x == y,
        (Value::Text(x), Value::Text(y)) => x == y,
        (Value::Boolean(x), Value::Boolean(y)) => x == y,
        _ => match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => Some(x.cmp(y)),
        (Value::Text(x), Value::Text(y)) => Some(x.cmp(y)),
        _ => as_number(a)?.partial_cmp(&as_number(b)?),
    }
}
