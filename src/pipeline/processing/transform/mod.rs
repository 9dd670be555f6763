use async_trait::async_trait;
use etl_core::{ExecutionContext, Record, Result};

pub mod builtin;
pub mod registry;

pub use builtin::{
    ArithmeticOperator, ArithmeticTransform, ConcatenateTransform, NumericOperation, NumericTransform,
    TextOperation, TextTransform,
};
pub use registry::{TransformationRegistry, TransformationSpec};

/// Outcome of applying a transformation or a rule set to one record.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformationResult {
    pub is_successful: bool,
    pub output: Record,
    pub errors: Vec<String>,
}

impl TransformationResult {
    pub fn success(output: Record) -> Self {
        Self {
            is_successful: true,
            output,
            errors: Vec::new(),
        }
    }

    /// A failed result still carries a record, usually the unchanged input.
    pub fn failure(output: Record, error: impl Into<String>) -> Self {
        Self {
            is_successful: false,
            output,
            errors: vec![error.into()],
        }
    }

    pub fn with_errors(is_successful: bool, output: Record, errors: Vec<String>) -> Self {
        Self {
            is_successful,
            output,
            errors,
        }
    }
}

/// A single operation on one record producing a new record.
///
/// Implementations must treat a record lacking their input fields as a no-op
/// success. Expected failures are reported through the result; `Err` is
/// reserved for cancellation.
#[async_trait]
pub trait Transformation: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> String {
        String::new()
    }

    /// Transform `record` without mutating it.
    async fn transform(&self, record: &Record, ctx: &ExecutionContext) -> Result<TransformationResult>;
}
