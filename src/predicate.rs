//! Field-predicate builder (spec §4.5): a closed set of operators evaluated
//! against a dotted path into the context bag, used by Choice branches and
//! Conditional guards.

use crate::error::EngineError;
use serde_json::Value;
use std::collections::HashMap;

/// The closed operator set. Aliases collapse onto a single canonical variant
/// at parse time so evaluation never has to special-case spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Exists,
    NotExists,
    Empty,
    NotEmpty,
    Equals,
    NotEquals,
    GreaterThan,
    GreaterEqual,
    LessThan,
    LessEqual,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
}

impl Operator {
    /// Parse an operator name, including its aliases. Unknown names are a
    /// `ConfigurationError`, never a predicate that evaluates to false
    /// (spec §4.5 edge cases).
    pub fn parse(name: &str) -> Result<Self, EngineError> {
        Ok(match name {
            "exists" => Operator::Exists,
            "not_exists" | "notExists" => Operator::NotExists,
            "empty" => Operator::Empty,
            "not_empty" | "notEmpty" => Operator::NotEmpty,
            "equals" | "eq" | "==" => Operator::Equals,
            "not_equals" | "ne" | "!=" => Operator::NotEquals,
            "greater_than" | "gt" | ">" => Operator::GreaterThan,
            "greater_equal" | "gte" | ">=" => Operator::GreaterEqual,
            "less_than" | "lt" | "<" => Operator::LessThan,
            "less_equal" | "lte" | "<=" => Operator::LessEqual,
            "contains" => Operator::Contains,
            "not_contains" | "notContains" => Operator::NotContains,
            "starts_with" | "startsWith" => Operator::StartsWith,
            "ends_with" | "endsWith" => Operator::EndsWith,
            "in" => Operator::In,
            "not_in" | "notIn" => Operator::NotIn,
            other => {
                return Err(EngineError::configuration(format!(
                    "unknown predicate operator '{other}'"
                )));
            }
        })
    }
}

/// A single field predicate: `field <operator> value`. `value` is unused by
/// the unary operators (`exists`/`not_exists`/`empty`/`not_empty`).
#[derive(Debug, Clone)]
pub struct FieldPredicate {
    pub field: String,
    pub operator: Operator,
    pub value: Option<Value>,
}

impl FieldPredicate {
    pub fn new(field: impl Into<String>, operator: Operator, value: Option<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    pub fn build(field: impl Into<String>, operator: &str, value: Option<Value>) -> Result<Self, EngineError> {
        Ok(Self::new(field, Operator::parse(operator)?, value))
    }

    /// Evaluate against a flattened data map (typically an
    /// `ExecutionContext` bag snapshot or template data). Type-incompatible
    /// comparisons evaluate to `false`, never an error (spec §4.5).
    pub fn evaluate(&self, data: &HashMap<String, Value>) -> bool {
        let resolved = resolve_path(&self.field, data);

        match self.operator {
            Operator::Exists => resolved.is_some(),
            Operator::NotExists => resolved.is_none(),
            Operator::Empty => is_empty(resolved),
            Operator::NotEmpty => !is_empty(resolved),
            Operator::Equals => match (resolved, &self.value) {
                (Some(a), Some(b)) => values_equal(a, b),
                _ => false,
            },
            Operator::NotEquals => match (resolved, &self.value) {
                (Some(a), Some(b)) => !values_equal(a, b),
                (None, _) => true,
                _ => false,
            },
            Operator::GreaterThan => compare_numeric(resolved, &self.value).map(|o| o.is_gt()).unwrap_or(false),
            Operator::GreaterEqual => compare_numeric(resolved, &self.value).map(|o| o.is_ge()).unwrap_or(false),
            Operator::LessThan => compare_numeric(resolved, &self.value).map(|o| o.is_lt()).unwrap_or(false),
            Operator::LessEqual => compare_numeric(resolved, &self.value).map(|o| o.is_le()).unwrap_or(false),
            Operator::Contains => contains(resolved.as_ref(), self.value.as_ref()),
            Operator::NotContains => !contains(resolved.as_ref(), self.value.as_ref()),
            Operator::StartsWith => str_relation(resolved.as_ref(), self.value.as_ref(), |s, t| s.starts_with(t)),
            Operator::EndsWith => str_relation(resolved.as_ref(), self.value.as_ref(), |s, t| s.ends_with(t)),
            Operator::In => membership(resolved.as_ref(), self.value.as_ref()),
            Operator::NotIn => !membership(resolved.as_ref(), self.value.as_ref()),
        }
    }
}

fn resolve_path(path: &str, data: &HashMap<String, Value>) -> Option<Value> {
    let mut parts = path.split('.');
    let root = parts.next()?;
    let mut current = data.get(root)?.clone();
    for segment in parts {
        current = current.as_object()?.get(segment)?.clone();
    }
    Some(current)
}

fn is_empty(value: Option<Value>) -> bool {
    match value {
        None => true,
        Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(m)) => m.is_empty(),
        Some(Value::Bool(b)) => !b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f == 0.0).unwrap_or(false),
    }
}

/// Equality with the coercions spec §4.5 calls out: numeric strings compare
/// against numbers, and `"true"`/`"false"` strings compare against booleans.
/// Falls back to strict equality for everything else.
fn values_equal(a: Value, b: &Value) -> bool {
    if &a == b {
        return true;
    }
    if let Some(bool_cmp) = as_bool(&a).zip(as_bool(b)).map(|(x, y)| x == y) {
        return bool_cmp;
    }
    if let Some(num_cmp) = as_f64(&a).zip(as_f64(b)).map(|(x, y)| x == y) {
        return num_cmp;
    }
    false
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

/// Numeric comparison. Returns `None` (→ false) when either side isn't
/// coercible to a number — type-incompatible compares never error.
fn compare_numeric(resolved: Option<Value>, target: &Option<Value>) -> Option<std::cmp::Ordering> {
    let a = as_f64(resolved.as_ref()?)?;
    let b = as_f64(target.as_ref()?)?;
    a.partial_cmp(&b)
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn contains(resolved: Option<&Value>, target: Option<&Value>) -> bool {
    match (resolved, target) {
        (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
        (Some(Value::Array(arr)), Some(needle)) => arr.contains(needle),
        _ => false,
    }
}

fn str_relation(
    resolved: Option<&Value>,
    target: Option<&Value>,
    rel: fn(&str, &str) -> bool,
) -> bool {
    match (resolved, target) {
        (Some(Value::String(s)), Some(Value::String(t))) => rel(s.as_str(), t.as_str()),
        _ => false,
    }
}

fn membership(resolved: Option<&Value>, target: Option<&Value>) -> bool {
    match (resolved, target) {
        (Some(needle), Some(Value::Array(haystack))) => haystack.contains(needle),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data() -> HashMap<String, Value> {
        let mut m = HashMap::new();
        m.insert("age".to_string(), json!(30));
        m.insert("name".to_string(), json!("Ada"));
        m.insert("tags".to_string(), json!(["admin", "beta"]));
        m.insert("bio".to_string(), json!(""));
        m
    }

    #[test]
    fn unknown_operator_is_configuration_error() {
        assert!(Operator::parse("wat").is_err());
    }

    #[test]
    fn exists_and_not_exists() {
        let d = data();
        assert!(FieldPredicate::new("age", Operator::Exists, None).evaluate(&d));
        assert!(FieldPredicate::new("missing", Operator::NotExists, None).evaluate(&d));
    }

    #[test]
    fn empty_checks_string() {
        let d = data();
        assert!(FieldPredicate::new("bio", Operator::Empty, None).evaluate(&d));
        assert!(FieldPredicate::new("name", Operator::NotEmpty, None).evaluate(&d));
    }

    #[test]
    fn empty_treats_zero_and_false_as_empty() {
        let mut d = data();
        d.insert("count".to_string(), json!(0));
        d.insert("active".to_string(), json!(false));
        assert!(FieldPredicate::new("count", Operator::Empty, None).evaluate(&d));
        assert!(FieldPredicate::new("active", Operator::Empty, None).evaluate(&d));
        assert!(FieldPredicate::new("age", Operator::NotEmpty, None).evaluate(&d));
    }

    #[test]
    fn numeric_comparison_aliases() {
        let d = data();
        let p = FieldPredicate::build("age", "gte", Some(json!(30))).unwrap();
        assert!(p.evaluate(&d));
        let p = FieldPredicate::build("age", ">", Some(json!(40))).unwrap();
        assert!(!p.evaluate(&d));
    }

    #[test]
    fn equals_coerces_numeric_and_boolean_strings() {
        let mut d = data();
        d.insert("active".to_string(), json!(true));
        assert!(FieldPredicate::new("age", Operator::Equals, Some(json!("30"))).evaluate(&d));
        assert!(FieldPredicate::new("active", Operator::Equals, Some(json!("true"))).evaluate(&d));
        assert!(!FieldPredicate::new("active", Operator::Equals, Some(json!("false"))).evaluate(&d));
    }

    #[test]
    fn type_incompatible_compare_is_false_not_error() {
        let d = data();
        let p = FieldPredicate::new("name", Operator::GreaterThan, Some(json!(5)));
        assert!(!p.evaluate(&d));
    }

    #[test]
    fn contains_and_in() {
        let d = data();
        assert!(FieldPredicate::new("tags", Operator::Contains, Some(json!("admin"))).evaluate(&d));
        assert!(FieldPredicate::new(
            "name",
            Operator::In,
            Some(json!(["Ada", "Grace"]))
        )
        .evaluate(&d));
    }

    #[test]
    fn starts_with_and_ends_with() {
        let d = data();
        assert!(FieldPredicate::new("name", Operator::StartsWith, Some(json!("Ad"))).evaluate(&d));
        assert!(FieldPredicate::new("name", Operator::EndsWith, Some(json!("da"))).evaluate(&d));
    }
}
