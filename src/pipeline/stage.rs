use async_trait::async_trait;
use etl_core::{ExecutionContext, Result, ValidationResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::retry::RetryPolicy;
use crate::pipeline::processing::rules::Condition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageType {
    Extract,
    Transform,
    Load,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Preparing,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Preparing => "preparing",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
            StageStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExecutionResult {
    pub stage_id: String,
    pub stage_name: String,
    pub status: StageStatus,
    pub is_success: bool,
    pub records_processed: u64,
    pub records_failed: u64,
    pub errors: Vec<String>,
    pub message: String,
    pub attempts: u32,
    pub duration: Duration,
}

impl StageExecutionResult {
    fn base(is_success: bool, message: String) -> Self {
        Self {
            stage_id: String::new(),
            stage_name: String::new(),
            status: if is_success {
                StageStatus::Completed
            } else {
                StageStatus::Failed
            },
            is_success,
            records_processed: 0,
            records_failed: 0,
            errors: Vec::new(),
            message,
            attempts: 1,
            duration: Duration::ZERO,
        }
    }

    pub fn success(processed: u64, message: impl Into<String>) -> Self {
        Self {
            records_processed: processed,
            ..Self::base(true, message.into())
        }
    }

    /// Successful only when nothing failed.
    pub fn with_errors(processed: u64, failed: u64, errors: Vec<String>, message: impl Into<String>) -> Self {
        let is_success = failed == 0 && errors.is_empty();
        Self {
            records_processed: processed,
            records_failed: failed,
            errors,
            ..Self::base(is_success, message.into())
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            errors: vec![message.clone()],
            ..Self::base(false, message)
        }
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Skipped,
            attempts: 0,
            ..Self::base(true, message.into())
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Cancelled,
            ..Self::base(false, message.into())
        }
    }

    /// Stamp identity, status and timing once the orchestrator has finished the stage.
    pub(crate) fn finish(mut self, stage: &PipelineStage, attempts: u32, duration: Duration) -> Self {
        self.stage_id = stage.id().to_string();
        self.stage_name = stage.name().to_string();
        self.attempts = attempts;
        self.duration = duration;
        self
    }
}

/// One unit of pipeline work with a prepare, execute and cleanup lifecycle.
#[async_trait]
pub trait Stage: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn stage_type(&self) -> StageType;

    /// Allocate resources. An error here fails the run.
    async fn prepare(&self, _ctx: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    /// Process records. Expected failures belong in the result; `Err` is
    /// retried by the orchestrator unless it is a cancellation.
    async fn execute(&self, ctx: &ExecutionContext) -> Result<StageExecutionResult>;

    /// Release resources. Called after every `execute`, on every exit path.
    async fn cleanup(&self, _ctx: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    fn validate(&self, _ctx: &ExecutionContext) -> ValidationResult {
        ValidationResult::new()
    }
}

/// A stage placed in a pipeline: order, enabled flag, run conditions and retry.
#[derive(Clone)]
pub struct PipelineStage {
    stage: Arc<dyn Stage>,
    pub order: i32,
    pub enabled: bool,
    /// All must hold for the stage to run.
    pub conditions: Vec<Condition>,
    /// Overrides the pipeline retry policy.
    pub retry: Option<RetryPolicy>,
}

impl PipelineStage {
    pub fn new(stage: Arc<dyn Stage>, order: i32) -> Self {
        Self {
            stage,
            order,
            enabled: true,
            conditions: Vec::new(),
            retry: None,
        }
    }

    pub fn from_stage<S: Stage + 'static>(stage: S, order: i32) -> Self {
        Self::new(Arc::new(stage), order)
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn id(&self) -> &str {
        self.stage.id()
    }

    pub fn name(&self) -> &str {
        self.stage.name()
    }

    pub fn stage_type(&self) -> StageType {
        self.stage.stage_type()
    }

    pub fn stage(&self) -> &Arc<dyn Stage> {
        &self.stage
    }
}

impl fmt::Debug for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineStage")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("stage_type", &self.stage_type())
            .field("order", &self.order)
            .field("enabled", &self.enabled)
            .field("conditions", &self.conditions)
            .field("retry", &self.retry)
            .finish()
    }
}
