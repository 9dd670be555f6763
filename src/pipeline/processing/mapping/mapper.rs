use async_trait::async_trait;
use etl_core::{DataSchema, EtlError, Record, Result, ValidationIssue, ValidationResult, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::function::ValueFunction;
use crate::observability::metrics;
use crate::pipeline::processing::rules::{all_hold, Condition};

/// User-supplied, possibly asynchronous value producer for a `Custom` mapping.
#[async_trait]
pub trait FieldMapping: Send + Sync {
    async fn map(&self, source: &Record) -> Result<Value>;
}

struct FnMapping<F> {
    mapping: F,
}

#[async_trait]
impl<F, Fut> FieldMapping for FnMapping<F>
where
    F: Fn(Record) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn map(&self, source: &Record) -> Result<Value> {
        (self.mapping)(source.clone()).await
    }
}

/// One source-to-destination field translation.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mapping {
    Direct {
        source: String,
        destination: String,
        #[serde(default)]
        required: bool,
    },
    Transformed {
        source: String,
        destination: String,
        function: ValueFunction,
        #[serde(default)]
        required: bool,
    },
    Constant {
        destination: String,
        value: Value,
    },
    /// Conditions are evaluated against the source record.
    Conditional {
        destination: String,
        conditions: Vec<Condition>,
        #[serde(default)]
        if_true: Value,
        #[serde(default)]
        if_false: Value,
    },
    #[serde(skip)]
    Custom {
        destination: String,
        mapping: Arc<dyn FieldMapping>,
    },
}

impl Mapping {
    pub fn direct(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Mapping::Direct {
            source: source.into(),
            destination: destination.into(),
            required: false,
        }
    }

    pub fn required(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Mapping::Direct {
            source: source.into(),
            destination: destination.into(),
            required: true,
        }
    }

    pub fn transformed(
        source: impl Into<String>,
        destination: impl Into<String>,
        function: ValueFunction,
    ) -> Self {
        Mapping::Transformed {
            source: source.into(),
            destination: destination.into(),
            function,
            required: false,
        }
    }

    pub fn constant(destination: impl Into<String>, value: impl Into<Value>) -> Self {
        Mapping::Constant {
            destination: destination.into(),
            value: value.into(),
        }
    }

    pub fn conditional(
        destination: impl Into<String>,
        conditions: Vec<Condition>,
        if_true: impl Into<Value>,
        if_false: impl Into<Value>,
    ) -> Self {
        Mapping::Conditional {
            destination: destination.into(),
            conditions,
            if_true: if_true.into(),
            if_false: if_false.into(),
        }
    }

    pub fn custom(destination: impl Into<String>, mapping: Arc<dyn FieldMapping>) -> Self {
        Mapping::Custom {
            destination: destination.into(),
            mapping,
        }
    }

    /// Wrap an async closure; it receives a copy of the source record.
    pub fn custom_fn<F, Fut>(destination: impl Into<String>, mapping: F) -> Self
    where
        F: Fn(Record) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self::custom(destination, Arc::new(FnMapping { mapping }))
    }

    pub fn destination(&self) -> &str {
        match self {
            Mapping::Direct { destination, .. }
            | Mapping::Transformed { destination, .. }
            | Mapping::Constant { destination, .. }
            | Mapping::Conditional { destination, .. }
            | Mapping::Custom { destination, .. } => destination,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Mapping::Direct { .. } => "direct",
            Mapping::Transformed { .. } => "transformed",
            Mapping::Constant { .. } => "constant",
            Mapping::Conditional { .. } => "conditional",
            Mapping::Custom { .. } => "custom",
        }
    }

    fn required_source(&self) -> Option<&str> {
        match self {
            Mapping::Direct {
                source, required: true, ..
            }
            | Mapping::Transformed {
                source, required: true, ..
            } => Some(source),
            _ => None,
        }
    }

    fn fetch(source: &Record, field: &str, required: bool, destination: &str) -> Result<Value> {
        match source.lookup(field) {
            Some(value) => Ok(value.clone()),
            None if required => Err(EtlError::Mapping {
                field: destination.to_string(),
                message: format!("required source field '{}' is missing", field),
            }),
            None => Ok(Value::Null),
        }
    }

    async fn resolve(&self, source: &Record) -> Result<Value> {
        let wrap = |destination: &str, e: EtlError| match e {
            e @ EtlError::Mapping { .. } => e,
            other => EtlError::Mapping {
                field: destination.to_string(),
                message: other.to_string(),
            },
        };
        match self {
            Mapping::Direct {
                source: field,
                destination,
                required,
            } => Self::fetch(source, field, *required, destination),
            Mapping::Transformed {
                source: field,
                destination,
                function,
                required,
            } => {
                let value = Self::fetch(source, field, *required, destination)?;
                function.apply(value).map_err(|e| wrap(destination, e))
            }
            Mapping::Constant { value, .. } => Ok(value.clone()),
            Mapping::Conditional {
                destination,
                conditions,
                if_true,
                if_false,
            } => {
                let holds = all_hold(conditions, source).map_err(|e| wrap(destination, e))?;
                Ok(if holds { if_true.clone() } else { if_false.clone() })
            }
            Mapping::Custom { destination, mapping } => {
                mapping.map(source).await.map_err(|e| wrap(destination, e))
            }
        }
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mapping::Direct {
                source,
                destination,
                required,
            } => f
                .debug_struct("Direct")
                .field("source", source)
                .field("destination", destination)
                .field("required", required)
                .finish(),
            Mapping::Transformed {
                source,
                destination,
                function,
                required,
            } => f
                .debug_struct("Transformed")
                .field("source", source)
                .field("destination", destination)
                .field("function", function)
                .field("required", required)
                .finish(),
            Mapping::Constant { destination, value } => f
                .debug_struct("Constant")
                .field("destination", destination)
                .field("value", value)
                .finish(),
            Mapping::Conditional {
                destination,
                conditions,
                if_true,
                if_false,
            } => f
                .debug_struct("Conditional")
                .field("destination", destination)
                .field("conditions", conditions)
                .field("if_true", if_true)
                .field("if_false", if_false)
                .finish(),
            Mapping::Custom { destination, .. } => {
                f.debug_struct("Custom").field("destination", destination).finish()
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MappingStatistics {
    pub total: usize,
    pub direct: usize,
    pub transformed: usize,
    pub constant: usize,
    pub conditional: usize,
    pub custom: usize,
    pub required: usize,
    pub optional: usize,
}

/// Translates a source record into a fresh destination record.
///
/// Every mapping writes one destination field and reads only the source
/// record, so mapping order never changes the outcome.
#[derive(Debug, Clone)]
pub struct DataMapper {
    name: String,
    description: Option<String>,
    mappings: Vec<Mapping>,
    source_fields: Option<BTreeSet<String>>,
}

impl DataMapper {
    pub fn new(name: impl Into<String>, mappings: Vec<Mapping>) -> Self {
        Self {
            name: name.into(),
            description: None,
            mappings,
            source_fields: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declare the fields the source can supply; checked by `validate`.
    pub fn with_source_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.source_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_source_schema(self, schema: &DataSchema) -> Self {
        let fields: Vec<String> = schema.field_names().map(str::to_string).collect();
        self.with_source_fields(fields)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    fn source_declares(&self, field: &str) -> Option<bool> {
        let declared = self.source_fields.as_ref()?;
        let head = field.split('.').next().unwrap_or(field);
        Some(declared.contains(field) || declared.contains(head))
    }

    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();
        if self.mappings.is_empty() {
            result.warning(format!("mapper '{}' has no mappings", self.name));
        }

        let mut destinations = HashSet::new();
        for mapping in &self.mappings {
            let destination = mapping.destination();
            if destination.trim().is_empty() {
                result.error(format!("{} mapping has an empty destination field", mapping.kind()));
            } else if !destinations.insert(destination) {
                result.add_error(ValidationIssue::for_field(
                    destination,
                    "destination field is mapped more than once",
                ));
            }

            if let Some(source) = mapping.required_source() {
                if self.source_declares(source) == Some(false) {
                    result.add_error(ValidationIssue::for_field(
                        source,
                        format!("required source field for '{}' is not provided by the source", destination),
                    ));
                }
            }

            if let Mapping::Conditional { conditions, .. } = mapping {
                for condition in conditions {
                    result.merge_scoped(&format!("mapping '{}'", destination), condition.validate());
                }
            }
        }
        result
    }

    /// Map one record. Missing optional source fields map to null.
    pub async fn map(&self, source: &Record) -> Result<Record> {
        let mut destination = Record::new();
        for mapping in &self.mappings {
            let value = mapping.resolve(source).await?;
            destination.set(mapping.destination(), value);
        }
        Ok(destination)
    }

    /// Map records in order; the first failure fails the batch.
    pub async fn map_batch(&self, sources: &[Record]) -> Result<Vec<Record>> {
        let mut mapped = Vec::with_capacity(sources.len());
        for (index, source) in sources.iter().enumerate() {
            match self.map(source).await {
                Ok(record) => mapped.push(record),
                Err(e) => {
                    warn!(mapper = %self.name, record_index = index, error = %e, "Mapping failed");
                    metrics::mapping::records_failed(&self.name, 1);
                    return Err(e);
                }
            }
        }
        metrics::mapping::records_mapped(&self.name, mapped.len() as u64);
        debug!(mapper = %self.name, records = mapped.len(), "Mapped batch");
        Ok(mapped)
    }

    pub fn get_statistics(&self) -> MappingStatistics {
        let mut stats = MappingStatistics {
            total: self.mappings.len(),
            ..MappingStatistics::default()
        };
        for mapping in &self.mappings {
            match mapping {
                Mapping::Direct { .. } => stats.direct += 1,
                Mapping::Transformed { .. } => stats.transformed += 1,
                Mapping::Constant { .. } => stats.constant += 1,
                Mapping::Conditional { .. } => stats.conditional += 1,
                Mapping::Custom { .. } => stats.custom += 1,
            }
            if mapping.required_source().is_some() {
                stats.required += 1;
            }
        }
        stats.optional = stats.total - stats.required;
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customer() -> Record {
        Record::new()
            .with_field("first_name", "Ada")
            .with_field("last_name", "Lovelace")
            .with_field("age", 36)
            .with_field("country", "UK")
    }

    #[tokio::test]
    async fn test_direct_mappings_copy_values() {
        let mapper = DataMapper::new(
            "customers",
            vec![
                Mapping::direct("first_name", "given"),
                Mapping::direct("last_name", "family"),
                Mapping::direct("age", "years"),
            ],
        );
        let source = customer();
        let mapped = mapper.map(&source).await.unwrap();
        assert_eq!(mapped.len(), 3);
        assert_eq!(mapped.get("given"), source.get("first_name"));
        assert_eq!(mapped.get("family"), source.get("last_name"));
        assert_eq!(mapped.get("years"), source.get("age"));
    }

    #[tokio::test]
    async fn test_missing_optional_maps_to_null_and_required_fails() {
        let optional = DataMapper::new("m", vec![Mapping::direct("email", "email")]);
        let mapped = optional.map(&customer()).await.unwrap();
        assert_eq!(mapped.get("email"), Some(&Value::Null));

        let required = DataMapper::new("m", vec![Mapping::required("email", "email")]);
        let err = required.map(&customer()).await.unwrap_err();
        assert!(matches!(err, EtlError::Mapping { ref field, .. } if field == "email"));
    }

    #[tokio::test]
    async fn test_conditional_reads_source_not_destination() {
        let conditional = Mapping::conditional("adult", vec![Condition::greater_than("age", 17)], true, false);
        // a mapping that writes a destination field with the same name as the condition field
        let shadow = Mapping::constant("age", 1);

        let forward = DataMapper::new("m", vec![shadow.clone(), conditional.clone()]);
        let backward = DataMapper::new("m", vec![conditional, shadow]);
        let a = forward.map(&customer()).await.unwrap();
        let b = backward.map(&customer()).await.unwrap();
        assert_eq!(a.get("adult"), Some(&Value::Bool(true)));
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_custom_async_mapping() {
        let mapper = DataMapper::new(
            "m",
            vec![Mapping::custom_fn("display", |record: Record| async move {
                tokio::task::yield_now().await;
                Ok(Value::String(format!(
                    "{} {}",
                    record.get("first_name").cloned().unwrap_or_default(),
                    record.get("last_name").cloned().unwrap_or_default()
                )))
            })],
        );
        let mapped = mapper.map(&customer()).await.unwrap();
        assert_eq!(mapped.get("display"), Some(&Value::from("Ada Lovelace")));
    }

    #[tokio::test]
    async fn test_transformed_and_constant() {
        let mapper = DataMapper::new(
            "m",
            vec![
                Mapping::transformed("country", "country_code", ValueFunction::ToLower),
                Mapping::transformed(
                    "nickname",
                    "nickname",
                    ValueFunction::DefaultIfNull { value: Value::from("none") },
                ),
                Mapping::constant("source_system", "crm"),
            ],
        );
        let batch = mapper.map_batch(&[customer(), customer()]).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].get("country_code"), Some(&Value::from("uk")));
        assert_eq!(batch[0].get("nickname"), Some(&Value::from("none")));
        assert_eq!(batch[1].get("source_system"), Some(&Value::from("crm")));
    }

    #[test]
    fn test_validate_duplicates_and_required_sources() {
        let mapper = DataMapper::new(
            "m",
            vec![
                Mapping::required("first_name", "name"),
                Mapping::direct("last_name", "name"),
                Mapping::required("email", "email"),
            ],
        )
        .with_source_fields(["first_name", "last_name"]);

        let first = mapper.validate();
        assert!(!first.is_valid());
        assert_eq!(first.errors().len(), 2);
        assert_eq!(first, mapper.validate());
    }

    #[test]
    fn test_statistics() {
        let mapper = DataMapper::new(
            "m",
            vec![
                Mapping::required("a", "a"),
                Mapping::direct("b", "b"),
                Mapping::constant("c", 1),
                Mapping::conditional("d", vec![Condition::is_null("x")], 1, 0),
            ],
        );
        let stats = mapper.get_statistics();
        assert_eq!(stats.direct, 2);
        assert_eq!(stats.constant, 1);
        assert_eq!(stats.conditional, 1);
        assert_eq!(stats.required, 1);
        assert_eq!(stats.optional, 3);
    }

    #[test]
    fn test_mappings_deserialize() {
        let mappings: Vec<Mapping> = serde_json::from_str(
            r#"[
                {"kind": "direct", "source": "id", "destination": "customer_id", "required": true},
                {"kind": "transformed", "source": "name", "destination": "name", "function": {"function": "to_upper"}},
                {"kind": "constant", "destination": "origin", "value": "import"},
                {"kind": "conditional", "destination": "big", "conditions": [{"field": "n", "operator": "greater_than", "value": 10}], "if_true": true, "if_false": false}
            ]"#,
        )
        .unwrap();
        let kinds: Vec<&str> = mappings.iter().map(Mapping::kind).collect();
        assert_eq!(kinds, vec!["direct", "transformed", "constant", "conditional"]);
    }
}
