use etl_core::{EtlError, ExecutionContext, Result, ValidationResult, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock, RwLockWriteGuard};
use tracing::debug;

use super::execution::ExecutionStatus;
use super::retry::RetryPolicy;
use super::stage::PipelineStage;

fn default_stop_on_error() -> bool {
    true
}

/// Stage failure policy for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorHandling {
    /// Abort at the first failed stage.
    #[serde(default = "default_stop_on_error")]
    pub stop_on_error: bool,
    /// Abort once the context holds this many errors, whatever `stop_on_error` says.
    #[serde(default)]
    pub max_errors: Option<usize>,
}

impl Default for ErrorHandling {
    fn default() -> Self {
        Self {
            stop_on_error: true,
            max_errors: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub error_handling: ErrorHandling,
    pub retry: RetryPolicy,
    /// Record concurrency for stages that do not set their own.
    pub max_degree_of_parallelism: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            error_handling: ErrorHandling::default(),
            retry: RetryPolicy::default(),
            max_degree_of_parallelism: 1,
        }
    }
}

/// An ordered, mutable list of stages plus identity and settings.
///
/// Stages stay sorted by `order`; equal orders keep insertion order. The
/// stage list cannot change while a run is active.
pub struct Pipeline {
    id: String,
    name: String,
    description: String,
    settings: PipelineSettings,
    metadata: BTreeMap<String, Value>,
    stages: RwLock<Vec<PipelineStage>>,
    active_runs: AtomicUsize,
    last_status: Mutex<ExecutionStatus>,
}

impl Pipeline {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            settings: PipelineSettings::default(),
            metadata: BTreeMap::new(),
            stages: RwLock::new(Vec::new()),
            active_runs: AtomicUsize::new(0),
            last_status: Mutex::new(ExecutionStatus::Pending),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_stage(self, stage: PipelineStage) -> Result<Self> {
        self.add_stage(stage)?;
        Ok(self)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    /// Write access to the stage list, refused while a run is active.
    ///
    /// `begin_run` takes the same lock, so a run cannot start between the
    /// check and the change.
    fn stages_for_change(&self, operation: &str) -> Result<RwLockWriteGuard<'_, Vec<PipelineStage>>> {
        let stages = self.stages.write().unwrap_or_else(PoisonError::into_inner);
        if self.is_running() {
            return Err(EtlError::Usage(format!(
                "cannot {} on pipeline '{}' while it is running",
                operation, self.id
            )));
        }
        Ok(stages)
    }

    pub fn add_stage(&self, stage: PipelineStage) -> Result<()> {
        let mut stages = self.stages_for_change("add a stage")?;
        debug!(pipeline_id = %self.id, stage_id = %stage.id(), order = stage.order, "Adding stage");
        stages.push(stage);
        stages.sort_by_key(|s| s.order);
        Ok(())
    }

    /// Returns whether a stage with `stage_id` was removed.
    pub fn remove_stage(&self, stage_id: &str) -> Result<bool> {
        let mut stages = self.stages_for_change("remove a stage")?;
        let before = stages.len();
        stages.retain(|s| s.id() != stage_id);
        Ok(stages.len() != before)
    }

    /// Snapshot of the stages in execution order.
    pub fn stages(&self) -> Vec<PipelineStage> {
        self.stages.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn stage_count(&self) -> usize {
        self.stages.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_running(&self) -> bool {
        self.active_runs.load(Ordering::SeqCst) > 0
    }

    /// `Running` while any run is active, otherwise the last run's final status.
    pub fn status(&self) -> ExecutionStatus {
        if self.is_running() {
            return ExecutionStatus::Running;
        }
        *self.last_status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn begin_run(&self) -> RunGuard<'_> {
        let _stages = self.stages.write().unwrap_or_else(PoisonError::into_inner);
        self.active_runs.fetch_add(1, Ordering::SeqCst);
        RunGuard { pipeline: self }
    }

    pub(crate) fn record_status(&self, status: ExecutionStatus) {
        *self.last_status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    pub fn validate(&self, ctx: &ExecutionContext) -> ValidationResult {
        let mut result = ValidationResult::new();
        if self.id.trim().is_empty() {
            result.error("pipeline id is empty");
        }
        if self.settings.error_handling.max_errors == Some(0) {
            result.error("max_errors must be at least 1");
        }
        if self.settings.retry.max_attempts == 0 {
            result.error("retry max_attempts must be at least 1");
        }
        if self.settings.max_degree_of_parallelism == 0 {
            result.error("max_degree_of_parallelism must be at least 1");
        }

        let stages = self.stages();
        if stages.is_empty() {
            result.error(format!("pipeline '{}' has no stages", self.id));
        }
        let mut seen = HashSet::new();
        for stage in &stages {
            if stage.id().trim().is_empty() {
                result.error(format!("stage '{}' has an empty id", stage.name()));
            } else if !seen.insert(stage.id().to_string()) {
                result.error(format!("duplicate stage id '{}'", stage.id()));
            }
            if stage.retry.map_or(false, |r| r.max_attempts == 0) {
                result.error(format!("stage '{}' retry max_attempts must be at least 1", stage.id()));
            }

            let mut stage_result = stage.stage().validate(ctx);
            for condition in &stage.conditions {
                stage_result.merge_scoped(&format!("condition on '{}'", condition.field), condition.validate());
            }
            result.merge_scoped(&format!("stage '{}'", stage.id()), stage_result);
        }
        if !stages.is_empty() && stages.iter().all(|s| !s.enabled) {
            result.warning("all stages are disabled");
        }
        result
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("settings", &self.settings)
            .field("stages", &self.stages())
            .field("status", &self.status())
            .finish()
    }
}

/// Marks a pipeline as running until dropped.
pub(crate) struct RunGuard<'a> {
    pipeline: &'a Pipeline,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.pipeline.active_runs.fetch_sub(1, Ordering::SeqCst);
    }
}
