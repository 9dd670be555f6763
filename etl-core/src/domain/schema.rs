use serde::{Deserialize, Serialize};

use super::record::Record;
use super::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Any,
    Bool,
    Int,
    Float,
    Date,
    String,
    List,
    Record,
}

impl FieldType {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => FieldType::Any,
            Value::Bool(_) => FieldType::Bool,
            Value::Int(_) => FieldType::Int,
            Value::Float(_) => FieldType::Float,
            Value::Date(_) => FieldType::Date,
            Value::String(_) => FieldType::String,
            Value::List(_) => FieldType::List,
            Value::Record(_) => FieldType::Record,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

/// Field layout advertised by a source connector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSchema {
    pub name: String,
    pub fields: Vec<FieldDefinition>,
}

impl DataSchema {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDefinition>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Infer a schema from a sample record; null fields are typed `Any`.
    pub fn infer(name: impl Into<String>, sample: &Record) -> Self {
        let fields = sample
            .iter()
            .map(|(field, value)| FieldDefinition {
                name: field.to_string(),
                field_type: FieldType::of(value),
                nullable: true,
            })
            .collect();
        Self::new(name, fields)
    }

    /// A dotted path counts as present when its first segment is a field.
    pub fn contains(&self, field: &str) -> bool {
        let head = field.split('.').next().unwrap_or(field);
        self.fields.iter().any(|f| f.name == field || f.name == head)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_schema() {
        let sample = Record::new().with_field("id", 1).with_field("name", "x");
        let schema = DataSchema::infer("people", &sample);
        assert_eq!(schema.fields.len(), 2);
        assert!(schema.contains("id"));
        assert!(!schema.contains("email"));
        assert_eq!(schema.fields[0].field_type, FieldType::Int);
    }
}
