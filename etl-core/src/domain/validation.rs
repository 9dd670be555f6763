use serde::{Deserialize, Serialize};
use std::fmt;

use crate::common::error::{EtlError, Result};

/// One validation finding with an optional field/record locator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_index: Option<usize>,
}

impl ValidationIssue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: None,
            record_index: None,
        }
    }

    pub fn for_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: Some(field.into()),
            record_index: None,
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.field, self.record_index) {
            (Some(field), Some(index)) => write!(f, "{} (field '{}', record {})", self.message, field, index),
            (Some(field), None) => write!(f, "{} (field '{}')", self.message, field),
            (None, Some(index)) => write!(f, "{} (record {})", self.message, index),
            (None, None) => f.write_str(&self.message),
        }
    }
}

/// Outcome of a `validate` call: valid when no errors were found.
///
/// Produced once by the validator and handed out by value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    errors: Vec<ValidationIssue>,
    warnings: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[ValidationIssue] {
        &self.errors
    }

    pub fn warnings(&self) -> &[ValidationIssue] {
        &self.warnings
    }

    pub fn add_error(&mut self, issue: ValidationIssue) {
        self.errors.push(issue);
    }

    pub fn add_warning(&mut self, issue: ValidationIssue) {
        self.warnings.push(issue);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.add_error(ValidationIssue::new(message));
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.add_warning(ValidationIssue::new(message));
    }

    /// Fold another result in, prefixing each message with `scope`.
    pub fn merge_scoped(&mut self, scope: &str, other: ValidationResult) {
        let prefix = |mut issue: ValidationIssue| {
            issue.message = format!("{}: {}", scope, issue.message);
            issue
        };
        self.errors.extend(other.errors.into_iter().map(prefix));
        self.warnings.extend(other.warnings.into_iter().map(prefix));
    }

    /// Turn an invalid result into `EtlError::Validation` listing every error.
    pub fn into_result(self) -> Result<ValidationResult> {
        if self.is_valid() {
            return Ok(self);
        }
        let message = self
            .errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Err(EtlError::validation(message))
    }
}
