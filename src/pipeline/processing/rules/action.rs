use etl_core::{EtlError, ExecutionContext, Record, Result, Value};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

use crate::pipeline::processing::transform::TransformationRegistry;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([^{}]+)\}").expect("placeholder pattern is valid"));

/// Substitute `{field}` / `{a.b}` placeholders from `record`; missing fields render empty.
pub fn render_template(template: &str, record: &Record) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            record
                .lookup(caps[1].trim())
                .map(ToString::to_string)
                .unwrap_or_default()
        })
        .into_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Literal(Value),
    Template(String),
}

impl FieldValue {
    pub fn resolve(&self, record: &Record) -> Value {
        match self {
            FieldValue::Literal(value) => value.clone(),
            FieldValue::Template(template) => Value::String(render_template(template, record)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// Programmatic rule action.
pub trait ActionHandler: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, record: &mut Record, ctx: &ExecutionContext) -> Result<()>;
}

struct FnAction<F> {
    name: String,
    action: F,
}

impl<F> ActionHandler for FnAction<F>
where
    F: Fn(&mut Record, &ExecutionContext) -> Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, record: &mut Record, ctx: &ExecutionContext) -> Result<()> {
        (self.action)(record, ctx)
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RuleAction {
    SetField {
        field: String,
        value: FieldValue,
    },
    RemoveField {
        field: String,
    },
    Log {
        message: String,
        #[serde(default)]
        level: LogLevel,
    },
    ApplyTransformation {
        name: String,
    },
    /// Stop evaluating lower-priority rules for this record.
    Stop,
    #[serde(skip)]
    Custom(Arc<dyn ActionHandler>),
}

/// Whether rule evaluation continues after an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionFlow {
    Continue,
    Stop,
}

impl RuleAction {
    pub fn set_literal(field: impl Into<String>, value: impl Into<Value>) -> Self {
        RuleAction::SetField {
            field: field.into(),
            value: FieldValue::Literal(value.into()),
        }
    }

    pub fn set_template(field: impl Into<String>, template: impl Into<String>) -> Self {
        RuleAction::SetField {
            field: field.into(),
            value: FieldValue::Template(template.into()),
        }
    }

    pub fn log(message: impl Into<String>) -> Self {
        RuleAction::Log {
            message: message.into(),
            level: LogLevel::Info,
        }
    }

    pub fn apply_transformation(name: impl Into<String>) -> Self {
        RuleAction::ApplyTransformation { name: name.into() }
    }

    pub fn custom<F>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn(&mut Record, &ExecutionContext) -> Result<()> + Send + Sync + 'static,
    {
        RuleAction::Custom(Arc::new(FnAction {
            name: name.into(),
            action,
        }))
    }

    pub(crate) async fn execute(
        &self,
        rule_id: &str,
        record: &mut Record,
        ctx: &ExecutionContext,
        transformations: &TransformationRegistry,
    ) -> Result<ActionFlow> {
        match self {
            RuleAction::SetField { field, value } => {
                let resolved = value.resolve(record);
                record.set(field.clone(), resolved);
            }
            RuleAction::RemoveField { field } => {
                record.remove(field);
            }
            RuleAction::Log { message, level } => {
                let message = render_template(message, record);
                match level {
                    LogLevel::Trace => trace!(rule_id, "{}", message),
                    LogLevel::Debug => debug!(rule_id, "{}", message),
                    LogLevel::Info => info!(rule_id, "📝 {}", message),
                    LogLevel::Warn => warn!(rule_id, "⚠️ {}", message),
                    LogLevel::Error => error!(rule_id, "❌ {}", message),
                }
            }
            RuleAction::ApplyTransformation { name } => {
                let transformation = transformations.get(name).ok_or_else(|| EtlError::Rule {
                    rule_id: rule_id.to_string(),
                    message: format!("unknown transformation '{}'", name),
                })?;
                let result = transformation.transform(record, ctx).await?;
                if !result.is_successful {
                    return Err(EtlError::Transformation {
                        name: name.clone(),
                        message: result.errors.join("; "),
                    });
                }
                *record = result.output;
            }
            RuleAction::Stop => return Ok(ActionFlow::Stop),
            RuleAction::Custom(handler) => handler.apply(record, ctx)?,
        }
        Ok(ActionFlow::Continue)
    }
}

impl fmt::Debug for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleAction::SetField { field, value } => f
                .debug_struct("SetField")
                .field("field", field)
                .field("value", value)
                .finish(),
            RuleAction::RemoveField { field } => f.debug_struct("RemoveField").field("field", field).finish(),
            RuleAction::Log { message, level } => f
                .debug_struct("Log")
                .field("message", message)
                .field("level", level)
                .finish(),
            RuleAction::ApplyTransformation { name } => {
                f.debug_struct("ApplyTransformation").field("name", name).finish()
            }
            RuleAction::Stop => f.write_str("Stop"),
            RuleAction::Custom(handler) => f.debug_tuple("Custom").field(&handler.name()).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::processing::transform::{TextOperation, TextTransform};

    #[test]
    fn test_render_template() {
        let record = Record::new()
            .with_field("first", "Ada")
            .with_field("address", Record::new().with_field("city", "London"));
        assert_eq!(
            render_template("{first} from { address.city }{missing}!", &record),
            "Ada from London!"
        );
    }

    #[tokio::test]
    async fn test_apply_transformation_action() {
        let mut registry = TransformationRegistry::new();
        registry.register(Arc::new(TextTransform::new("upper", "name", TextOperation::Uppercase)));
        let ctx = ExecutionContext::new();

        let mut record = Record::new().with_field("name", "ada");
        let flow = RuleAction::apply_transformation("upper")
            .execute("r1", &mut record, &ctx, &registry)
            .await
            .unwrap();
        assert_eq!(flow, ActionFlow::Continue);
        assert_eq!(record.get("name"), Some(&Value::from("ADA")));

        let err = RuleAction::apply_transformation("nope")
            .execute("r1", &mut record, &ctx, &registry)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown transformation"));
    }

    #[test]
    fn test_actions_deserialize() {
        let actions: Vec<RuleAction> = serde_json::from_str(
            r#"[
                {"action": "set_field", "field": "tier", "value": {"literal": "gold"}},
                {"action": "set_field", "field": "label", "value": {"template": "{first} {last}"}},
                {"action": "log", "message": "saw {id}"},
                {"action": "stop"}
            ]"#,
        )
        .unwrap();
        assert_eq!(actions.len(), 4);
        assert!(matches!(actions[2], RuleAction::Log { level: LogLevel::Info, .. }));
        assert!(matches!(actions[3], RuleAction::Stop));
    }
}
