use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::cancellation::CancellationSignal;
use super::record::Record;
use super::schema::DataSchema;
use super::statistics::Statistics;
use super::value::Value;
use crate::common::error::{EtlError, Result};

/// Metadata key under which applied rule ids are counted.
pub const APPLIED_RULES_KEY: &str = "applied_rules";

/// An execution error or warning recorded during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionIssue {
    pub message: String,
    /// Component that raised the issue, e.g. `stage:load` or `rule:r1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_index: Option<usize>,
    /// Text of the underlying error, when there was one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl ExecutionIssue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
            field: None,
            record_index: None,
            detail: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_record(mut self, index: usize) -> Self {
        self.record_index = Some(index);
        self
    }

    pub fn with_detail(mut self, detail: impl fmt::Display) -> Self {
        self.detail = Some(detail.to_string());
        self
    }
}

impl fmt::Display for ExecutionIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(source) = &self.source {
            write!(f, "[{}] ", source)?;
        }
        f.write_str(&self.message)?;
        if let Some(index) = self.record_index {
            write!(f, " (record {})", index)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, ": {}", detail)?;
        }
        Ok(())
    }
}

/// Per-run mutable state threaded through every component call.
///
/// Cloning yields another handle onto the same context. [`child`] creates a
/// context whose variables and metadata are copies of this one's, while the
/// cancellation signal, statistics, error/warning lists, dataset and schema
/// stay shared with the parent.
///
/// [`child`]: ExecutionContext::child
#[derive(Clone)]
pub struct ExecutionContext {
    execution_id: Uuid,
    started_at: DateTime<Utc>,
    clock: Instant,
    cancellation: CancellationSignal,
    scope: Arc<Scope>,
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Scope {
    variables: RwLock<HashMap<String, Value>>,
    metadata: RwLock<HashMap<String, Value>>,
}

#[derive(Default)]
struct Shared {
    errors: Mutex<Vec<ExecutionIssue>>,
    warnings: Mutex<Vec<ExecutionIssue>>,
    statistics: Mutex<Statistics>,
    dataset: Mutex<Vec<Record>>,
    schema: RwLock<Option<DataSchema>>,
    error_limit: Mutex<Option<usize>>,
    max_parallelism: Mutex<Option<usize>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::with_cancellation(CancellationSignal::new())
    }

    /// Build a context driven by a caller-owned cancellation signal.
    pub fn with_cancellation(cancellation: CancellationSignal) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            started_at: Utc::now(),
            clock: Instant::now(),
            cancellation,
            scope: Arc::new(Scope::default()),
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn child(&self) -> Self {
        let scope = Scope {
            variables: RwLock::new(read(&self.scope.variables).clone()),
            metadata: RwLock::new(read(&self.scope.metadata).clone()),
        };
        Self {
            execution_id: self.execution_id,
            started_at: self.started_at,
            clock: self.clock,
            cancellation: self.cancellation.clone(),
            scope: Arc::new(scope),
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.clock.elapsed()
    }

    pub fn cancellation(&self) -> &CancellationSignal {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn ensure_not_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(EtlError::Cancelled);
        }
        Ok(())
    }

    // Variables and metadata (per context)

    pub fn variable(&self, name: &str) -> Option<Value> {
        read(&self.scope.variables).get(name).cloned()
    }

    pub fn set_variable(&self, name: impl Into<String>, value: impl Into<Value>) {
        write(&self.scope.variables).insert(name.into(), value.into());
    }

    pub fn variables(&self) -> HashMap<String, Value> {
        read(&self.scope.variables).clone()
    }

    pub fn metadata(&self, key: &str) -> Option<Value> {
        read(&self.scope.metadata).get(key).cloned()
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<Value>) {
        write(&self.scope.metadata).insert(key.into(), value.into());
    }

    pub fn metadata_snapshot(&self) -> HashMap<String, Value> {
        read(&self.scope.metadata).clone()
    }

    /// Count one application of `rule_id` under the `applied_rules` metadata entry.
    pub fn append_applied_rule(&self, rule_id: &str) {
        let mut metadata = write(&self.scope.metadata);
        let entry = metadata
            .entry(APPLIED_RULES_KEY.to_string())
            .or_insert_with(|| Value::Record(Record::new()));
        if !matches!(entry, Value::Record(_)) {
            *entry = Value::Record(Record::new());
        }
        if let Value::Record(counts) = entry {
            let next = counts.get(rule_id).and_then(Value::as_i64).unwrap_or(0) + 1;
            counts.set(rule_id, next);
        }
    }

    /// Number of times `rule_id` has been applied in this context.
    pub fn applied_rule_count(&self, rule_id: &str) -> u64 {
        read(&self.scope.metadata)
            .get(APPLIED_RULES_KEY)
            .and_then(Value::as_record)
            .and_then(|counts| counts.get(rule_id))
            .and_then(Value::as_i64)
            .map_or(0, |n| n.max(0) as u64)
    }

    // Errors and warnings (shared, single writer at a time)

    /// Record an error and return the total error count afterwards.
    pub fn add_error(&self, issue: ExecutionIssue) -> usize {
        let mut errors = lock(&self.shared.errors);
        errors.push(issue);
        errors.len()
    }

    pub fn add_warning(&self, issue: ExecutionIssue) {
        lock(&self.shared.warnings).push(issue);
    }

    pub fn errors(&self) -> Vec<ExecutionIssue> {
        lock(&self.shared.errors).clone()
    }

    pub fn warnings(&self) -> Vec<ExecutionIssue> {
        lock(&self.shared.warnings).clone()
    }

    pub fn error_count(&self) -> usize {
        lock(&self.shared.errors).len()
    }

    pub fn warning_count(&self) -> usize {
        lock(&self.shared.warnings).len()
    }

    /// `None` disables the ceiling.
    pub fn set_error_limit(&self, limit: Option<usize>) {
        *lock(&self.shared.error_limit) = limit;
    }

    pub fn error_limit(&self) -> Option<usize> {
        *lock(&self.shared.error_limit)
    }

    pub fn error_limit_reached(&self) -> bool {
        match self.error_limit() {
            Some(limit) => self.error_count() >= limit,
            None => false,
        }
    }

    /// Default record concurrency for stages that do not set their own.
    pub fn set_max_parallelism(&self, parallelism: Option<usize>) {
        *lock(&self.shared.max_parallelism) = parallelism;
    }

    pub fn max_parallelism(&self) -> Option<usize> {
        *lock(&self.shared.max_parallelism)
    }

    // Statistics (shared, additive only)

    pub fn statistics(&self) -> Statistics {
        let mut stats = lock(&self.shared.statistics);
        stats.observe_elapsed(self.elapsed());
        stats.clone()
    }

    pub fn update_statistics(&self, update: impl FnOnce(&mut Statistics)) {
        let mut stats = lock(&self.shared.statistics);
        update(&mut stats);
        stats.observe_elapsed(self.elapsed());
    }

    pub fn record_processed(&self, count: u64) {
        self.update_statistics(|s| s.add_processed(count));
    }

    pub fn record_transformed(&self, count: u64) {
        self.update_statistics(|s| s.add_transformed(count));
    }

    pub fn record_skipped(&self, count: u64) {
        self.update_statistics(|s| s.add_skipped(count));
    }

    pub fn record_failed(&self, count: u64) {
        self.update_statistics(|s| s.add_failed(count));
    }

    // Dataset handed from one stage to the next

    pub fn take_dataset(&self) -> Vec<Record> {
        std::mem::take(&mut *lock(&self.shared.dataset))
    }

    pub fn set_dataset(&self, records: Vec<Record>) {
        *lock(&self.shared.dataset) = records;
    }

    pub fn extend_dataset(&self, records: impl IntoIterator<Item = Record>) {
        lock(&self.shared.dataset).extend(records);
    }

    pub fn dataset_len(&self) -> usize {
        lock(&self.shared.dataset).len()
    }

    pub fn schema(&self) -> Option<DataSchema> {
        read(&self.shared.schema).clone()
    }

    pub fn set_schema(&self, schema: DataSchema) {
        *write(&self.shared.schema) = Some(schema);
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("execution_id", &self.execution_id)
            .field("started_at", &self.started_at)
            .field("cancelled", &self.is_cancelled())
            .field("errors", &self.error_count())
            .field("warnings", &self.warning_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_copies_variables_by_value() {
        let parent = ExecutionContext::new();
        parent.set_variable("region", "us");

        let child = parent.child();
        assert_eq!(child.variable("region"), Some(Value::from("us")));

        child.set_variable("region", "eu");
        child.set_variable("local", 1);
        assert_eq!(parent.variable("region"), Some(Value::from("us")));
        assert_eq!(parent.variable("local"), None);
    }

    #[test]
    fn test_child_shares_errors_and_statistics() {
        let parent = ExecutionContext::new();
        let child = parent.child();

        child.add_error(ExecutionIssue::new("boom").with_source("stage:a"));
        child.record_processed(3);

        assert_eq!(parent.error_count(), 1);
        assert_eq!(parent.statistics().records_processed, 3);
        assert_eq!(child.execution_id(), parent.execution_id());
    }

    #[test]
    fn test_error_limit() {
        let ctx = ExecutionContext::new();
        assert!(!ctx.error_limit_reached());
        ctx.set_error_limit(Some(2));
        ctx.add_error(ExecutionIssue::new("one"));
        assert!(!ctx.error_limit_reached());
        ctx.add_error(ExecutionIssue::new("two"));
        assert!(ctx.error_limit_reached());
    }

    #[test]
    fn test_applied_rules_are_counted() {
        let ctx = ExecutionContext::new();
        ctx.append_applied_rule("r1");
        ctx.append_applied_rule("r1");
        ctx.append_applied_rule("r2");
        assert_eq!(ctx.applied_rule_count("r1"), 2);
        assert_eq!(ctx.applied_rule_count("r2"), 1);
        assert_eq!(ctx.applied_rule_count("r3"), 0);
    }

    #[test]
    fn test_cancellation_is_shared_with_children() {
        let ctx = ExecutionContext::new();
        let child = ctx.child();
        ctx.cancellation().cancel();
        assert!(child.is_cancelled());
        assert!(matches!(child.ensure_not_cancelled(), Err(EtlError::Cancelled)));
    }

    #[test]
    fn test_issue_display() {
        let issue = ExecutionIssue::new("bad value")
            .with_source("rule:r1")
            .with_record(4)
            .with_detail("not a number");
        assert_eq!(issue.to_string(), "[rule:r1] bad value (record 4): not a number");
    }
}
