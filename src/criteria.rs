//! Criteria evaluator.
//!
//! A [`Criteria`] is a pair of rule lists: every rule in `All` must hold and,
//! if `Any` is non-empty, at least one rule in `Any` must hold. Rules compare a
//! field of a JSON record against a literal.
//!
//! The JSON shape is the one verifiers submit:
//!
//! ```json
//! { "All": [ { "Field": "age", "Type": "greater", "value": 18 } ], "Any": [] }
//! ```
//!
//! Fields may be dotted paths (`DOB.year`) into nested objects.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::fmt;
use tracing::debug;

/// A data record the criteria are evaluated against.
pub type Record = serde_json::Map<String, Value>;

/// Comparison operator of a [`Rule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    /// Deep equality (numbers compare by value).
    Equal,
    /// Record value is numerically greater than the rule value.
    Greater,
    /// Record value is numerically less than the rule value.
    Less,
    /// Record value is a member of the rule's array value.
    In,
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Equal => "equal",
            Self::Greater => "greater",
            Self::Less => "less",
            Self::In => "in",
        };
        f.write_str(s)
    }
}

/// A single `(field, operator, value)` comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    /// Record field, possibly a dotted path.
    #[serde(rename = "Field")]
    pub field: String,
    /// Comparison to apply.
    #[serde(rename = "Type")]
    pub op: Comparison,
    /// Literal to compare against.
    pub value: Value,
}

impl Rule {
    /// Create a rule.
    #[must_use]
    pub fn new(field: impl Into<String>, op: Comparison, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Check the rule's own operand shape, independent of any record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Criteria`] if `greater`/`less` carry a non-numeric
    /// value or `in` carries a non-array value.
    pub fn validate(&self) -> Result<()> {
        if self.field.is_empty() {
            return Err(Error::Criteria("rule field must not be empty".to_string()));
        }
        match self.op {
            Comparison::Greater | Comparison::Less if !self.value.is_number() => {
                Err(Error::Criteria(format!(
                    "{} on {} needs a numeric value, got {}",
                    self.op, self.field, self.value
                )))
            }
            Comparison::In if !self.value.is_array() => Err(Error::Criteria(format!(
                "in on {} needs an array value, got {}",
                self.field, self.value
            ))),
            _ => Ok(()),
        }
    }

    /// Apply the rule to a record.
    ///
    /// A missing field is a non-match, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Criteria`] when the operands have incompatible types.
    pub fn check(&self, record: &Record) -> Result<bool> {
        let Some(actual) = resolve(record, &self.field) else {
            return Ok(false);
        };

        match self.op {
            Comparison::Equal => Ok(values_equal(actual, &self.value)),
            Comparison::Greater => {
                Ok(self.numeric_order(actual)? == Ordering::Greater)
            }
            Comparison::Less => Ok(self.numeric_order(actual)? == Ordering::Less),
            Comparison::In => {
                let Value::Array(members) = &self.value else {
                    return Err(Error::Criteria(format!(
                        "in on {} needs an array value",
                        self.field
                    )));
                };
                Ok(members.iter().any(|m| values_equal(actual, m)))
            }
        }
    }

    /// Apply the rule, treating type errors as a non-match.
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        self.check(record).unwrap_or_else(|e| {
            debug!(field = %self.field, op = %self.op, "rule not applicable: {e}");
            false
        })
    }

    fn numeric_order(&self, actual: &Value) -> Result<Ordering> {
        if let (Value::Number(lhs), Value::Number(rhs)) = (actual, &self.value) {
            if let Some(order) = integer_order(lhs, rhs) {
                return Ok(order);
            }
        }
        let (Some(lhs), Some(rhs)) = (actual.as_f64(), self.value.as_f64()) else {
            return Err(Error::Criteria(format!(
                "{} on {} compares non-numeric operands ({actual} vs {})",
                self.op, self.field, self.value
            )));
        };
        lhs.partial_cmp(&rhs)
            .ok_or_else(|| Error::Criteria(format!("{} on {} is unordered", self.op, self.field)))
    }
}

/// A named rule-set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Criteria {
    /// Optional display name.
    #[serde(rename = "Name", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Conjunction; vacuously true when empty.
    #[serde(rename = "All", default)]
    pub all: Vec<Rule>,
    /// Disjunction; vacuously true when empty.
    #[serde(rename = "Any", default)]
    pub any: Vec<Rule>,
}

impl Criteria {
    /// Criteria with only an `All` list.
    #[must_use]
    pub fn all(rules: Vec<Rule>) -> Self {
        Self {
            all: rules,
            ..Self::default()
        }
    }

    /// Criteria with only an `Any` list.
    #[must_use]
    pub fn any(rules: Vec<Rule>) -> Self {
        Self {
            any: rules,
            ..Self::default()
        }
    }

    /// Attach a display name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Validate every rule's operand shape.
    ///
    /// # Errors
    ///
    /// Returns the first rule error found.
    pub fn validate(&self) -> Result<()> {
        self.all.iter().chain(&self.any).try_for_each(Rule::validate)
    }

    /// Evaluate against a record. Rules that cannot be applied count as
    /// non-matching, so a partial or malformed record yields `false`.
    #[must_use]
    pub fn evaluate(&self, record: &Record) -> bool {
        let all = self.all.iter().all(|rule| rule.matches(record));
        let any = self.any.is_empty() || self.any.iter().any(|rule| rule.matches(record));
        all && any
    }

    /// Strict evaluation that surfaces type errors.
    ///
    /// A definite answer wins over an error regardless of rule order: one
    /// failing `All` rule or one matching `Any` rule decides the result even
    /// if other rules hit type errors.
    ///
    /// # Errors
    ///
    /// Returns an [`Error::Criteria`] when the result hinges on a rule that
    /// could not be applied.
    pub fn check(&self, record: &Record) -> Result<bool> {
        let mut pending = None;
        for rule in &self.all {
            match rule.check(record) {
                Ok(true) => {}
                Ok(false) => return Ok(false),
                Err(e) => {
                    pending.get_or_insert(e);
                }
            }
        }

        let mut any_error = None;
        let mut any = self.any.is_empty();
        for rule in &self.any {
            match rule.check(record) {
                Ok(true) => {
                    any = true;
                    break;
                }
                Ok(false) => {}
                Err(e) => {
                    any_error.get_or_insert(e);
                }
            }
        }

        match (pending, any, any_error) {
            (_, false, None) => Ok(false),
            (Some(e), _, _) => Err(e),
            (None, true, _) => Ok(true),
            (None, false, Some(e)) => Err(e),
            (None, false, None) => Ok(false),
        }
    }
}

/// Evaluate `criteria` against `record`.
#[must_use]
pub fn evaluate(criteria: &Criteria, record: &Record) -> bool {
    criteria.evaluate(record)
}

/// Parse a record from JSON bytes. The top level must be an object.
///
/// # Errors
///
/// Returns an error if the bytes are not a JSON object.
pub fn parse_record(bytes: &[u8]) -> Result<Record> {
    match serde_json::from_slice::<Value>(bytes)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::Criteria(format!(
            "record must be a JSON object, got {}",
            kind_of(&other)
        ))),
    }
}

fn resolve<'a>(record: &'a Record, field: &str) -> Option<&'a Value> {
    if let Some(value) = record.get(field) {
        return Some(value);
    }
    let mut parts = field.split('.');
    let mut current = record.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match integer_order(x, y) {
            Some(order) => order == Ordering::Equal,
            None => match (x.as_f64(), y.as_f64()) {
                (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
                _ => x == y,
            },
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

/// Exact ordering when both numbers are integers; `None` if either is a float.
fn integer_order(x: &Number, y: &Number) -> Option<Ordering> {
    if x.is_f64() || y.is_f64() {
        return None;
    }
    match (x.as_i64(), y.as_i64(), x.as_u64(), y.as_u64()) {
        (Some(a), Some(b), _, _) => Some(a.cmp(&b)),
        (_, _, Some(a), Some(b)) => Some(a.cmp(&b)),
        // Only one fits in i64: it is the smaller of a negative i64 and a large u64.
        (Some(_), None, _, _) => Some(Ordering::Less),
        (None, Some(_), _, _) => Some(Ordering::Greater),
        _ => None,
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn over_18() -> Criteria {
        Criteria::all(vec![Rule::new("age", Comparison::Greater, 18)])
    }

    #[test]
    fn test_empty_criteria_is_true() {
        let criteria = Criteria::default();
        assert!(criteria.evaluate(&Record::new()));
        assert!(criteria.evaluate(&record(json!({"age": 3}))));
    }

    #[test]
    fn test_greater_than_18() {
        assert!(over_18().evaluate(&record(json!({"age": 21}))));
        assert!(!over_18().evaluate(&record(json!({"age": 16}))));
        assert!(!over_18().evaluate(&record(json!({"age": 18}))));
    }

    #[test]
    fn test_missing_field_is_false_not_error() {
        let rec = record(json!({"name": "Santiago"}));
        assert!(!over_18().evaluate(&rec));
        assert!(!over_18().check(&rec).unwrap());
    }

    #[test]
    fn test_non_numeric_comparison_is_type_error() {
        let rec = record(json!({"age": "twenty"}));
        assert!(matches!(over_18().check(&rec), Err(Error::Criteria(_))));
        assert!(!over_18().evaluate(&rec));
    }

    #[test]
    fn test_equal_is_deep() {
        let criteria = Criteria::all(vec![
            Rule::new("name", Comparison::Equal, "Jacob"),
            Rule::new("address", Comparison::Equal, json!({"city": "WPB", "zip": 33401})),
        ]);
        let rec = record(json!({
            "name": "Jacob",
            "address": {"zip": 33401.0, "city": "WPB"}
        }));
        assert!(criteria.evaluate(&rec));

        let rec = record(json!({"name": "Jacob", "address": {"city": "WPB"}}));
        assert!(!criteria.evaluate(&rec));
    }

    #[test]
    fn test_in_membership() {
        let criteria = Criteria::all(vec![Rule::new(
            "country",
            Comparison::In,
            json!(["US", "CA", "MX"]),
        )]);
        assert!(criteria.evaluate(&record(json!({"country": "CA"}))));
        assert!(!criteria.evaluate(&record(json!({"country": "FR"}))));
    }

    #[test]
    fn test_in_requires_array_value() {
        let rule = Rule::new("country", Comparison::In, "US");
        assert!(rule.validate().is_err());
        assert!(rule.check(&record(json!({"country": "US"}))).is_err());
    }

    #[test]
    fn test_any_needs_one_match() {
        let criteria = Criteria::any(vec![
            Rule::new("license", Comparison::Equal, true),
            Rule::new("age", Comparison::Greater, 65),
        ]);
        assert!(criteria.evaluate(&record(json!({"license": false, "age": 70}))));
        assert!(!criteria.evaluate(&record(json!({"license": false, "age": 30}))));
        // a type error in one Any rule does not poison the others
        assert!(criteria.evaluate(&record(json!({"license": true, "age": "old"}))));
    }

    #[test]
    fn test_check_is_order_independent() {
        let rec = record(json!({"license": true, "age": "old"}));
        let senior = Rule::new("age", Comparison::Greater, 65);
        let licensed = Rule::new("license", Comparison::Equal, true);

        let forward = Criteria::any(vec![senior.clone(), licensed.clone()]);
        let reversed = Criteria::any(vec![licensed.clone(), senior.clone()]);
        assert!(forward.check(&rec).unwrap());
        assert!(reversed.check(&rec).unwrap());

        let unlicensed = Rule::new("license", Comparison::Equal, false);
        let forward = Criteria::all(vec![senior.clone(), unlicensed.clone()]);
        let reversed = Criteria::all(vec![unlicensed, senior.clone()]);
        assert!(!forward.check(&rec).unwrap());
        assert!(!reversed.check(&rec).unwrap());

        // A failed Any group decides even when an All rule errors.
        let mixed = Criteria {
            all: vec![senior.clone()],
            any: vec![Rule::new("license", Comparison::Equal, false)],
            ..Criteria::default()
        };
        assert!(!mixed.check(&rec).unwrap());

        // Nothing conclusive: the type error surfaces.
        let only = Criteria::all(vec![licensed, senior]);
        assert!(matches!(only.check(&rec), Err(Error::Criteria(_))));
    }

    #[test]
    fn test_large_integers_compare_exactly() {
        let big = 9_007_199_254_740_993_i64; // 2^53 + 1
        let rec = record(json!({"id": big, "n": u64::MAX}));
        let criteria = Criteria::all(vec![Rule::new("id", Comparison::Equal, big - 1)]);
        assert!(!criteria.evaluate(&rec));
        let criteria = Criteria::all(vec![Rule::new("id", Comparison::Equal, big)]);
        assert!(criteria.evaluate(&rec));
        let criteria = Criteria::all(vec![Rule::new("id", Comparison::Greater, big - 1)]);
        assert!(criteria.evaluate(&rec));
        let criteria = Criteria::all(vec![Rule::new("n", Comparison::Greater, -1)]);
        assert!(criteria.evaluate(&rec));
    }

    #[test]
    fn test_all_and_any_combine() {
        let criteria = Criteria {
            name: Some("adult-in-florida".to_string()),
            all: vec![Rule::new("age", Comparison::Greater, 17)],
            any: vec![
                Rule::new("state", Comparison::Equal, "FL"),
                Rule::new("resident", Comparison::Equal, true),
            ],
        };
        assert!(criteria.evaluate(&record(json!({"age": 30, "state": "FL"}))));
        assert!(!criteria.evaluate(&record(json!({"age": 30, "state": "NY"}))));
        assert!(!criteria.evaluate(&record(json!({"age": 12, "state": "FL"}))));
    }

    #[test]
    fn test_dotted_path_into_nested_record() {
        let criteria = Criteria::all(vec![Rule::new("DOB.year", Comparison::Less, 2008)]);
        let rec = record(json!({"Name": "S", "DOB": {"year": 2003, "month": 9, "day": 2}}));
        assert!(criteria.evaluate(&rec));
        assert!(!criteria.evaluate(&record(json!({"DOB": 2003}))));
    }

    #[test]
    fn test_wire_shape() {
        let raw = r#"{"All":[{"Type":"equal","Field":"name","value":"Jacob"}],"Any":[]}"#;
        let criteria: Criteria = serde_json::from_str(raw).unwrap();
        assert_eq!(criteria.all[0].op, Comparison::Equal);
        assert_eq!(criteria.all[0].field, "name");
        assert!(criteria.any.is_empty());

        let unknown = r#"{"All":[],"Any":[],"Extra":1}"#;
        assert!(serde_json::from_str::<Criteria>(unknown).is_err());

        let bad_op = r#"{"All":[{"Type":"approx","Field":"a","value":1}]}"#;
        assert!(serde_json::from_str::<Criteria>(bad_op).is_err());
    }

    #[test]
    fn test_parse_record_requires_object() {
        assert!(parse_record(br#"{"age": 21}"#).is_ok());
        assert!(parse_record(b"[1,2]").is_err());
        assert!(parse_record(b"not json").is_err());
    }

    proptest! {
        #[test]
        fn prop_empty_criteria_accepts_any_record(
            entries in proptest::collection::hash_map("[a-z]{1,8}", any::<i64>(), 0..16)
        ) {
            let rec: Record = entries
                .into_iter()
                .map(|(k, v)| (k, Value::from(v)))
                .collect();
            prop_assert!(Criteria::default().evaluate(&rec));
        }

        #[test]
        fn prop_greater_matches_numeric_order(age in -1000i64..1000, bound in -1000i64..1000) {
            let criteria = Criteria::all(vec![Rule::new("age", Comparison::Greater, bound)]);
            let rec = record(json!({"age": age}));
            prop_assert_eq!(criteria.evaluate(&rec), age > bound);
        }
    }
}
