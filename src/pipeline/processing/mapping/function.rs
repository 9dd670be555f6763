use etl_core::{EtlError, Result, Value};
use serde::{Deserialize, Serialize};
use std::fmt::Write;

use crate::pipeline::processing::transform::builtin::round_to;

/// Pure value function used by `Transformed` mappings.
///
/// Null passes through every function except `DefaultIfNull`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "function", rename_all = "snake_case")]
pub enum ValueFunction {
    ToUpper,
    ToLower,
    Trim,
    Round { digits: u32 },
    FormatDate { format: String },
    ToString,
    ToInteger,
    ToFloat,
    ToBoolean,
    DefaultIfNull { value: Value },
}

impl ValueFunction {
    pub fn apply(&self, value: Value) -> Result<Value> {
        if value.is_null() {
            return Ok(match self {
                ValueFunction::DefaultIfNull { value: default } => default.clone(),
                _ => Value::Null,
            });
        }

        match self {
            ValueFunction::ToUpper => Ok(Value::String(value.to_string().to_uppercase())),
            ValueFunction::ToLower => Ok(Value::String(value.to_string().to_lowercase())),
            ValueFunction::Trim => Ok(Value::String(value.to_string().trim().to_string())),
            ValueFunction::ToString => Ok(Value::String(value.to_string())),
            ValueFunction::Round { digits } => {
                let number = value.as_f64().ok_or_else(|| mismatch("number", &value))?;
                Ok(Value::Float(round_to(number, *digits)))
            }
            ValueFunction::FormatDate { format } => {
                let date = value.as_date().ok_or_else(|| mismatch("date", &value))?;
                let mut rendered = String::new();
                write!(rendered, "{}", date.format(format))
                    .map_err(|_| EtlError::Config(format!("invalid date format '{}'", format)))?;
                Ok(Value::String(rendered))
            }
            ValueFunction::ToInteger => match &value {
                Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                other => other
                    .as_i64()
                    .or_else(|| other.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
                    .map(Value::Int)
                    .ok_or_else(|| mismatch("int", other)),
            },
            ValueFunction::ToFloat => value
                .as_f64()
                .map(Value::Float)
                .ok_or_else(|| mismatch("float", &value)),
            ValueFunction::ToBoolean => value
                .as_bool()
                .map(Value::Bool)
                .ok_or_else(|| mismatch("bool", &value)),
            ValueFunction::DefaultIfNull { .. } => Ok(value),
        }
    }
}

fn mismatch(expected: &'static str, found: &Value) -> EtlError {
    EtlError::TypeMismatch {
        expected,
        found: found.type_name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_functions() {
        assert_eq!(ValueFunction::ToUpper.apply(Value::from("ada")).unwrap(), Value::from("ADA"));
        assert_eq!(ValueFunction::Trim.apply(Value::from("  x ")).unwrap(), Value::from("x"));
        assert_eq!(ValueFunction::ToString.apply(Value::from(12)).unwrap(), Value::from("12"));
    }

    #[test]
    fn test_null_passes_through() {
        assert_eq!(ValueFunction::ToUpper.apply(Value::Null).unwrap(), Value::Null);
        let default = ValueFunction::DefaultIfNull { value: Value::from("n/a") };
        assert_eq!(default.apply(Value::Null).unwrap(), Value::from("n/a"));
        assert_eq!(default.apply(Value::from("x")).unwrap(), Value::from("x"));
    }

    #[test]
    fn test_numeric_conversions() {
        assert_eq!(
            ValueFunction::Round { digits: 1 }.apply(Value::from("2.46")).unwrap(),
            Value::Float(2.5)
        );
        assert_eq!(ValueFunction::ToInteger.apply(Value::from(3.9)).unwrap(), Value::Int(3));
        assert_eq!(ValueFunction::ToInteger.apply(Value::from(true)).unwrap(), Value::Int(1));
        assert!(ValueFunction::ToFloat.apply(Value::from("abc")).is_err());
        assert_eq!(ValueFunction::ToBoolean.apply(Value::from("TRUE")).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_format_date() {
        let format = ValueFunction::FormatDate { format: "%d/%m/%Y".into() };
        assert_eq!(format.apply(Value::from("2024-03-01")).unwrap(), Value::from("01/03/2024"));
        assert!(format.apply(Value::from(5)).is_err());
    }

    #[test]
    fn test_function_deserializes() {
        let f: ValueFunction = serde_json::from_str(r#"{"function": "round", "digits": 2}"#).unwrap();
        assert_eq!(f, ValueFunction::Round { digits: 2 });
    }
}
