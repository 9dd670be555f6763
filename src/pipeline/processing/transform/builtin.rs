use async_trait::async_trait;
use etl_core::{ExecutionContext, Record, Result, Value};
use serde::{Deserialize, Serialize};

use super::{Transformation, TransformationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextOperation {
    Uppercase,
    Lowercase,
    Trim,
}

impl TextOperation {
    fn apply(self, text: &str) -> String {
        match self {
            TextOperation::Uppercase => text.to_uppercase(),
            TextOperation::Lowercase => text.to_lowercase(),
            TextOperation::Trim => text.trim().to_string(),
        }
    }
}

/// Uppercase, lowercase or trim a string field in place.
#[derive(Debug, Clone)]
pub struct TextTransform {
    name: String,
    field: String,
    operation: TextOperation,
}

impl TextTransform {
    pub fn new(name: impl Into<String>, field: impl Into<String>, operation: TextOperation) -> Self {
        Self {
            name: name.into(),
            field: field.into(),
            operation,
        }
    }
}

#[async_trait]
impl Transformation for TextTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        format!("{:?} text field '{}'", self.operation, self.field)
    }

    async fn transform(&self, record: &Record, ctx: &ExecutionContext) -> Result<TransformationResult> {
        ctx.ensure_not_cancelled()?;
        let mut output = record.clone();
        match record.lookup(&self.field) {
            None | Some(Value::Null) => {}
            Some(Value::String(text)) => {
                output.set_path(&self.field, self.operation.apply(text));
            }
            Some(other) => {
                return Ok(TransformationResult::failure(
                    output,
                    format!("field '{}' is {}, expected string", self.field, other.type_name()),
                ));
            }
        }
        Ok(TransformationResult::success(output))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum NumericOperation {
    Round { digits: u32 },
    Add { operand: f64 },
    Multiply { factor: f64 },
}

impl NumericOperation {
    fn apply(self, value: f64) -> f64 {
        match self {
            NumericOperation::Round { digits } => round_to(value, digits),
            NumericOperation::Add { operand } => value + operand,
            NumericOperation::Multiply { factor } => value * factor,
        }
    }
}

pub(crate) fn round_to(value: f64, digits: u32) -> f64 {
    let scale = 10f64.powi(digits.min(15) as i32);
    (value * scale).round() / scale
}

/// Render a numeric result, keeping integers as integers when the result is integral.
fn numeric_result(result: f64, integral_input: bool) -> Value {
    if integral_input && result.fract() == 0.0 && result.abs() < i64::MAX as f64 {
        Value::Int(result as i64)
    } else {
        Value::Float(result)
    }
}

fn is_integral(value: &Value) -> bool {
    match value {
        Value::Int(_) => true,
        Value::String(s) => s.trim().parse::<i64>().is_ok(),
        _ => false,
    }
}

/// Round, offset or scale a numeric field in place.
#[derive(Debug, Clone)]
pub struct NumericTransform {
    name: String,
    field: String,
    operation: NumericOperation,
}

impl NumericTransform {
    pub fn new(name: impl Into<String>, field: impl Into<String>, operation: NumericOperation) -> Self {
        Self {
            name: name.into(),
            field: field.into(),
            operation,
        }
    }
}

#[async_trait]
impl Transformation for NumericTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        format!("{:?} numeric field '{}'", self.operation, self.field)
    }

    async fn transform(&self, record: &Record, ctx: &ExecutionContext) -> Result<TransformationResult> {
        ctx.ensure_not_cancelled()?;
        let mut output = record.clone();
        let value = match record.lookup(&self.field) {
            None | Some(Value::Null) => return Ok(TransformationResult::success(output)),
            Some(value) => value,
        };
        let Some(number) = value.as_f64() else {
            return Ok(TransformationResult::failure(
                output,
                format!("field '{}' is not numeric: '{}'", self.field, value),
            ));
        };
        let result = self.operation.apply(number);
        output.set_path(&self.field, numeric_result(result, is_integral(value)));
        Ok(TransformationResult::success(output))
    }
}

/// Join the present fields with a separator into `target`.
#[derive(Debug, Clone)]
pub struct ConcatenateTransform {
    name: String,
    fields: Vec<String>,
    separator: String,
    target: String,
}

impl ConcatenateTransform {
    pub fn new(
        name: impl Into<String>,
        fields: Vec<String>,
        separator: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            fields,
            separator: separator.into(),
            target: target.into(),
        }
    }
}

#[async_trait]
impl Transformation for ConcatenateTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        format!("Concatenate [{}] into '{}'", self.fields.join(", "), self.target)
    }

    async fn transform(&self, record: &Record, ctx: &ExecutionContext) -> Result<TransformationResult> {
        ctx.ensure_not_cancelled()?;
        let parts: Vec<String> = self
            .fields
            .iter()
            .filter_map(|field| record.lookup(field))
            .filter(|value| !value.is_null())
            .map(ToString::to_string)
            .collect();

        let mut output = record.clone();
        if !parts.is_empty() {
            output.set(self.target.clone(), parts.join(&self.separator));
        }
        Ok(TransformationResult::success(output))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithmeticOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
}

/// Binary arithmetic between two fields written into `target`.
#[derive(Debug, Clone)]
pub struct ArithmeticTransform {
    name: String,
    left: String,
    right: String,
    operator: ArithmeticOperator,
    target: String,
}

impl ArithmeticTransform {
    pub fn new(
        name: impl Into<String>,
        left: impl Into<String>,
        operator: ArithmeticOperator,
        right: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            left: left.into(),
            right: right.into(),
            operator,
            target: target.into(),
        }
    }

    fn compute(&self, left: &Value, right: &Value) -> std::result::Result<Value, String> {
        let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) else {
            return Err(format!(
                "operands '{}' and '{}' must be numeric",
                self.left, self.right
            ));
        };
        let integral = is_integral(left) && is_integral(right);
        let result = match self.operator {
            ArithmeticOperator::Add => l + r,
            ArithmeticOperator::Subtract => l - r,
            ArithmeticOperator::Multiply => l * r,
            ArithmeticOperator::Divide => {
                if r == 0.0 {
                    return Err(format!("division by zero: '{}' is 0", self.right));
                }
                return Ok(Value::Float(l / r));
            }
        };
        Ok(numeric_result(result, integral))
    }
}

#[async_trait]
impl Transformation for ArithmeticTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        format!("{:?} '{}' and '{}' into '{}'", self.operator, self.left, self.right, self.target)
    }

    async fn transform(&self, record: &Record, ctx: &ExecutionContext) -> Result<TransformationResult> {
        ctx.ensure_not_cancelled()?;
        let mut output = record.clone();
        let (Some(left), Some(right)) = (record.lookup(&self.left), record.lookup(&self.right)) else {
            return Ok(TransformationResult::success(output));
        };
        if left.is_null() || right.is_null() {
            return Ok(TransformationResult::success(output));
        }
        match self.compute(left, right) {
            Ok(value) => {
                output.set(self.target.clone(), value);
                Ok(TransformationResult::success(output))
            }
            Err(message) => Ok(TransformationResult::failure(output, message)),
        }
    }
}
