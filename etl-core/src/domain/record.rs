use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::value::Value;

/// A named field bag, the unit of data flowing through a pipeline.
///
/// Field names are case-sensitive and unique. Iteration order is the sorted
/// field name order so output is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compose a record field by field: `Record::new().with_field("a", 1)`.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.fields.get_mut(name)
    }

    /// Look up a field, descending into nested records on `.` when the full
    /// name is not itself a field.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        if let Some(value) = self.fields.get(path) {
            return Some(value);
        }
        let (head, rest) = path.split_once('.')?;
        self.fields.get(head)?.as_record()?.lookup(rest)
    }

    /// Write counterpart of [`lookup`]: replaces the value `lookup(path)` would
    /// find, or sets a top-level field when the path does not resolve.
    ///
    /// [`lookup`]: Record::lookup
    pub fn set_path(&mut self, path: &str, value: impl Into<Value>) -> Option<Value> {
        if !self.fields.contains_key(path) {
            if let Some((head, rest)) = path.split_once('.') {
                if let Some(Value::Record(nested)) = self.fields.get_mut(head) {
                    if nested.lookup(rest).is_some() {
                        return nested.set_path(rest, value);
                    }
                }
            }
        }
        self.set(path, value)
    }

    /// Returns the previous value, if any.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(name.into(), value.into())
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// True when the field is absent or holds `Null`.
    pub fn is_missing(&self, name: &str) -> bool {
        self.lookup(name).map_or(true, Value::is_null)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl IntoIterator for Record {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}
