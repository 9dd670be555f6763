use etl_core::{EtlError, Record, Result, ValidationResult, Value};
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Matches,
    Contains,
    StartsWith,
    EndsWith,
    IsNull,
    IsNotNull,
}

impl ConditionOperator {
    /// `IsNull`/`IsNotNull` ignore the comparand; `Equals`/`NotEquals` accept a null one.
    pub fn requires_comparand(self) -> bool {
        !matches!(
            self,
            ConditionOperator::IsNull
                | ConditionOperator::IsNotNull
                | ConditionOperator::Equals
                | ConditionOperator::NotEquals
        )
    }
}

/// A `(field, operator, comparand)` test against a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip)]
    pattern: OnceCell<Regex>,
}

impl PartialEq for Condition {
    fn eq(&self, other: &Self) -> bool {
        self.field == other.field && self.operator == other.operator && self.value == other.value
    }
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: Option<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            pattern: OnceCell::new(),
        }
    }

    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, ConditionOperator::Equals, Some(value.into()))
    }

    pub fn not_equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, ConditionOperator::NotEquals, Some(value.into()))
    }

    pub fn greater_than(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, ConditionOperator::GreaterThan, Some(value.into()))
    }

    pub fn less_than(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, ConditionOperator::LessThan, Some(value.into()))
    }

    pub fn matches(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(field, ConditionOperator::Matches, Some(Value::String(pattern.into())))
    }

    pub fn contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, ConditionOperator::Contains, Some(value.into()))
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Self::new(field, ConditionOperator::IsNull, None)
    }

    pub fn is_not_null(field: impl Into<String>) -> Self {
        Self::new(field, ConditionOperator::IsNotNull, None)
    }

    fn regex(&self) -> Result<&Regex> {
        self.pattern.get_or_try_init(|| {
            let pattern = self.value.as_ref().map(ToString::to_string).unwrap_or_default();
            Regex::new(&pattern).map_err(|e| {
                EtlError::validation(format!("invalid pattern for field '{}': {}", self.field, e))
            })
        })
    }

    /// Static checks: comparand presence and regex validity.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();
        if self.field.trim().is_empty() {
            result.error("condition has an empty field name");
        }
        let comparand_missing = self.value.as_ref().map_or(true, Value::is_null);
        if self.operator.requires_comparand() && comparand_missing {
            result.error(format!(
                "operator {:?} on field '{}' requires a comparand",
                self.operator, self.field
            ));
        }
        if self.operator == ConditionOperator::Matches && !comparand_missing {
            if let Err(e) = self.regex() {
                result.error(e.to_string());
            }
        }
        result
    }

    /// Evaluate against `record`, coercing the field value to the comparand's type.
    pub fn evaluate(&self, record: &Record) -> Result<bool> {
        let actual = record.lookup(&self.field).unwrap_or(&Value::Null);
        let comparand = self.value.as_ref().unwrap_or(&Value::Null);

        let outcome = match self.operator {
            ConditionOperator::IsNull => actual.is_null(),
            ConditionOperator::IsNotNull => !actual.is_null(),
            ConditionOperator::Equals => actual.compare_coerced(comparand) == Some(Ordering::Equal),
            ConditionOperator::NotEquals => actual.compare_coerced(comparand) != Some(Ordering::Equal),
            ConditionOperator::GreaterThan => actual.compare_coerced(comparand) == Some(Ordering::Greater),
            ConditionOperator::GreaterThanOrEqual => matches!(
                actual.compare_coerced(comparand),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            ConditionOperator::LessThan => actual.compare_coerced(comparand) == Some(Ordering::Less),
            ConditionOperator::LessThanOrEqual => matches!(
                actual.compare_coerced(comparand),
                Some(Ordering::Less | Ordering::Equal)
            ),
            ConditionOperator::Matches => !actual.is_null() && self.regex()?.is_match(&actual.to_string()),
            ConditionOperator::Contains => match actual {
                Value::Null => false,
                Value::List(items) => items
                    .iter()
                    .any(|item| item.compare_coerced(comparand) == Some(Ordering::Equal)),
                other => other.to_string().contains(&comparand.to_string()),
            },
            ConditionOperator::StartsWith => {
                !actual.is_null() && actual.to_string().starts_with(&comparand.to_string())
            }
            ConditionOperator::EndsWith => {
                !actual.is_null() && actual.to_string().ends_with(&comparand.to_string())
            }
        };
        Ok(outcome)
    }
}

/// Implicit AND; stops at the first failing condition. An empty list holds.
pub fn all_hold(conditions: &[Condition], record: &Record) -> Result<bool> {
    for condition in conditions {
        if !condition.evaluate(record)? {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> Record {
        Record::new()
            .with_field("amount", "150")
            .with_field("status", "shipped")
            .with_field("tags", vec![Value::from("gift"), Value::from("priority")])
            .with_field("email", "ada@example.com")
    }

    #[test]
    fn test_numeric_comparand_coerces_field() {
        let record = order();
        assert!(Condition::greater_than("amount", 100).evaluate(&record).unwrap());
        assert!(!Condition::less_than("amount", 100).evaluate(&record).unwrap());
        assert!(Condition::equals("amount", 150.0).evaluate(&record).unwrap());
    }

    #[test]
    fn test_string_comparand_compares_text() {
        let record = order();
        assert!(Condition::equals("status", "shipped").evaluate(&record).unwrap());
        assert!(Condition::not_equals("status", "pending").evaluate(&record).unwrap());
        // "150" < "9" as strings
        assert!(Condition::less_than("amount", "9").evaluate(&record).unwrap());
    }

    #[test]
    fn test_null_operators_ignore_comparand() {
        let record = order();
        assert!(Condition::is_null("missing").evaluate(&record).unwrap());
        assert!(Condition::is_not_null("status").evaluate(&record).unwrap());
        let with_value = Condition::new("missing", ConditionOperator::IsNull, Some(Value::from("x")));
        assert!(with_value.evaluate(&record).unwrap());
    }

    #[test]
    fn test_matches_and_contains() {
        let record = order();
        assert!(Condition::matches("email", r"@example\.com$").evaluate(&record).unwrap());
        assert!(!Condition::matches("missing", ".*").evaluate(&record).unwrap());
        assert!(Condition::contains("tags", "gift").evaluate(&record).unwrap());
        assert!(Condition::contains("email", "ada").evaluate(&record).unwrap());
    }

    #[test]
    fn test_invalid_regex_is_reported() {
        let condition = Condition::matches("email", "([");
        assert!(!condition.validate().is_valid());
        assert!(condition.evaluate(&order()).is_err());
    }

    #[test]
    fn test_missing_comparand_is_invalid() {
        let condition = Condition::new("amount", ConditionOperator::GreaterThan, None);
        assert!(!condition.validate().is_valid());
        assert!(Condition::is_null("amount").validate().is_valid());
    }

    #[test]
    fn test_all_hold_short_circuits() {
        let record = order();
        let conditions = vec![
            Condition::equals("status", "pending"),
            Condition::matches("email", "(["),
        ];
        // the invalid pattern is never evaluated
        assert!(!all_hold(&conditions, &record).unwrap());
        assert!(all_hold(&[], &record).unwrap());
    }

    #[test]
    fn test_condition_deserializes() {
        let condition: Condition =
            serde_json::from_str(r#"{"field": "amount", "operator": "greater_than_or_equal", "value": 150}"#).unwrap();
        assert!(condition.evaluate(&order()).unwrap());
    }
}
