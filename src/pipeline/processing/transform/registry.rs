use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::builtin::{
    ArithmeticOperator, ArithmeticTransform, ConcatenateTransform, NumericOperation, NumericTransform,
    TextOperation, TextTransform,
};
use super::Transformation;

/// Declarative form of a built-in transformation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformationSpec {
    Text {
        field: String,
        operation: TextOperation,
    },
    Numeric {
        field: String,
        operation: NumericOperation,
    },
    Concatenate {
        fields: Vec<String>,
        #[serde(default)]
        separator: String,
        target: String,
    },
    Arithmetic {
        left: String,
        operator: ArithmeticOperator,
        right: String,
        target: String,
    },
}

impl TransformationSpec {
    pub fn build(&self, name: &str) -> Arc<dyn Transformation> {
        match self {
            TransformationSpec::Text { field, operation } => {
                Arc::new(TextTransform::new(name, field.clone(), *operation))
            }
            TransformationSpec::Numeric { field, operation } => {
                Arc::new(NumericTransform::new(name, field.clone(), *operation))
            }
            TransformationSpec::Concatenate {
                fields,
                separator,
                target,
            } => Arc::new(ConcatenateTransform::new(
                name,
                fields.clone(),
                separator.clone(),
                target.clone(),
            )),
            TransformationSpec::Arithmetic {
                left,
                operator,
                right,
                target,
            } => Arc::new(ArithmeticTransform::new(
                name,
                left.clone(),
                *operator,
                right.clone(),
                target.clone(),
            )),
        }
    }
}

/// Lookup table of transformations keyed by name.
#[derive(Clone, Default)]
pub struct TransformationRegistry {
    transformations: HashMap<String, Arc<dyn Transformation>>,
}

impl TransformationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_specs(specs: &BTreeMap<String, TransformationSpec>) -> Self {
        let mut registry = Self::new();
        for (name, spec) in specs {
            registry.register(spec.build(name));
        }
        registry
    }

    /// Register under the transformation's own name, replacing any previous entry.
    pub fn register(&mut self, transformation: Arc<dyn Transformation>) -> Option<Arc<dyn Transformation>> {
        let name = transformation.name().to_string();
        debug!(transformation = %name, "Registering transformation");
        self.transformations.insert(name, transformation)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Transformation>> {
        self.transformations.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.transformations.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.transformations.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.transformations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transformations.is_empty()
    }
}

impl fmt::Debug for TransformationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformationRegistry")
            .field("transformations", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etl_core::{ExecutionContext, Record, Value};

    #[tokio::test]
    async fn test_registry_builds_from_specs() {
        let specs: BTreeMap<String, TransformationSpec> = serde_json::from_str(
            r#"{
                "upper_name": {"type": "text", "field": "name", "operation": "uppercase"},
                "double": {"type": "numeric", "field": "n", "operation": {"op": "multiply", "factor": 2}}
            }"#,
        )
        .unwrap();
        let registry = TransformationRegistry::from_specs(&specs);
        assert_eq!(registry.names(), vec!["double".to_string(), "upper_name".to_string()]);

        let ctx = ExecutionContext::new();
        let double = registry.get("double").unwrap();
        let result = double
            .transform(&Record::new().with_field("n", 21), &ctx)
            .await
            .unwrap();
        assert_eq!(result.output.get("n"), Some(&Value::Int(42)));
        assert!(registry.get("missing").is_none());
    }
}
