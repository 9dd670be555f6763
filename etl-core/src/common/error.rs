use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Transformation '{name}' failed: {message}")]
    Transformation { name: String, message: String },

    #[error("Rule '{rule_id}' failed: {message}")]
    Rule { rule_id: String, message: String },

    #[error("Mapping to '{field}' failed: {message}")]
    Mapping { field: String, message: String },

    #[error("Connector '{connector}' failed: {message}")]
    Connector { connector: String, message: String },

    #[error("Stage '{stage_id}' failed: {message}")]
    Stage { stage_id: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid usage: {0}")]
    Usage(String),

    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("Operation cancelled")]
    Cancelled,
}

impl EtlError {
    pub fn validation(message: impl Into<String>) -> Self {
        EtlError::Validation {
            message: message.into(),
        }
    }

    /// Cancellation ends a run as `Cancelled` rather than `Failed`.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, EtlError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, EtlError>;
