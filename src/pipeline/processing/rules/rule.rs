use etl_core::{Record, Result, ValidationResult};
use serde::{Deserialize, Serialize};

use super::action::RuleAction;
use super::condition::{all_hold, Condition};

fn default_enabled() -> bool {
    true
}

/// A prioritized, condition-gated list of actions applied to a record.
///
/// Higher `priority` runs first. Conditions form an implicit AND.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformationRule {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub actions: Vec<RuleAction>,
}

impl TransformationRule {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            priority: 0,
            enabled: true,
            conditions: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn then(mut self, action: RuleAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn matches(&self, record: &Record) -> Result<bool> {
        all_hold(&self.conditions, record)
    }

    /// Checks that need no other rules or context.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();
        if self.id.trim().is_empty() {
            result.error(format!("rule '{}' has an empty id", self.name));
        }
        match (self.conditions.is_empty(), self.actions.is_empty()) {
            (true, true) => result.error("rule has no conditions and no actions"),
            (false, true) => result.warning("rule has conditions but no actions"),
            _ => {}
        }
        for condition in &self.conditions {
            result.merge_scoped(&format!("condition on '{}'", condition.field), condition.validate());
        }
        result
    }
}
