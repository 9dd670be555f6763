use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use super::record::Record;

/// Dynamically-typed field value carried by a [`Record`].
///
/// Serialized untagged so plain JSON/YAML documents load without annotations.
/// RFC 3339 strings deserialize as `Date`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Date(DateTime<Utc>),
    String(String),
    List(Vec<Value>),
    Record(Record),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Date(_) => "date",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Record(_) => "record",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Numeric coercion: ints, floats and numeric strings.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(0) => Some(false),
            Value::Int(1) => Some(true),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Dates, RFC 3339 strings and plain `YYYY-MM-DD` strings (midnight UTC).
    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Date(d) => Some(*d),
            Value::String(s) => parse_date(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    /// Compare against a comparand, coercing `self` to the comparand's type.
    ///
    /// Numeric comparands use numeric coercion, bools and dates their own
    /// coercions, everything else compares rendered strings. `None` means the
    /// two values are not comparable.
    pub fn compare_coerced(&self, comparand: &Value) -> Option<Ordering> {
        match comparand {
            Value::Null => {
                if self.is_null() {
                    Some(Ordering::Equal)
                } else {
                    None
                }
            }
            Value::Int(_) | Value::Float(_) => {
                let left = self.as_f64()?;
                let right = comparand.as_f64()?;
                left.partial_cmp(&right)
            }
            Value::Bool(right) => self.as_bool().map(|left| left.cmp(right)),
            Value::Date(right) => self.as_date().map(|left| left.cmp(right)),
            _ => {
                if self.is_null() {
                    return None;
                }
                Some(self.to_string().cmp(&comparand.to_string()))
            }
        }
    }
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Date(d) => write!(f, "{}", d.to_rfc3339()),
            Value::String(s) => f.write_str(s),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            Value::Record(record) => {
                let rendered = serde_json::to_string(record).map_err(|_| fmt::Error)?;
                f.write_str(&rendered)
            }
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Date(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<Record> for Value {
    fn from(value: Record) -> Self {
        Value::Record(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(Value::from("42").as_f64(), Some(42.0));
        assert_eq!(Value::from(7).as_f64(), Some(7.0));
        assert_eq!(Value::from("abc").as_f64(), None);
        assert_eq!(Value::Null.as_f64(), None);
    }

    #[test]
    fn test_compare_coerced_uses_comparand_type() {
        // numeric comparand: "10" > 9 numerically, though "10" < "9" as strings
        assert_eq!(Value::from("10").compare_coerced(&Value::from(9)), Some(Ordering::Greater));
        assert_eq!(Value::from("10").compare_coerced(&Value::from("9")), Some(Ordering::Less));
        assert_eq!(Value::Null.compare_coerced(&Value::Null), Some(Ordering::Equal));
        assert_eq!(Value::from("x").compare_coerced(&Value::Null), None);
    }

    #[test]
    fn test_date_parsing() {
        let d = Value::from("2024-03-01").as_date().unwrap();
        assert_eq!(d.to_rfc3339(), "2024-03-01T00:00:00+00:00");
        assert!(Value::from("2024-03-01T10:00:00Z").as_date().is_some());
        assert!(Value::from("not a date").as_date().is_none());
    }

    #[test]
    fn test_untagged_deserialization() {
        let v: Value = serde_json::from_str(r#"[1, 2.5, "a", null, true, {"k": "v"}]"#).unwrap();
        let items = v.as_list().unwrap();
        assert_eq!(items[0], Value::Int(1));
        assert_eq!(items[1], Value::Float(2.5));
        assert_eq!(items[2], Value::from("a"));
        assert_eq!(items[3], Value::Null);
        assert_eq!(items[4], Value::Bool(true));
        assert_eq!(items[5].as_record().unwrap().get("k"), Some(&Value::from("v")));
    }
}
