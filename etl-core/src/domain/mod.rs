pub mod cancellation;
pub mod context;
pub mod record;
pub mod schema;
pub mod statistics;
pub mod validation;
pub mod value;

pub use cancellation::CancellationSignal;
pub use context::{ExecutionContext, ExecutionIssue};
pub use record::Record;
pub use schema::{DataSchema, FieldDefinition, FieldType};
pub use statistics::Statistics;
pub use validation::{ValidationIssue, ValidationResult};
pub use value::Value;
