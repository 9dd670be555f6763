use chrono::{DateTime, Utc};
use etl_core::{CancellationSignal, ExecutionIssue, Statistics};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use super::stage::StageExecutionResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of executing a complete pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineExecutionResult {
    pub execution_id: Uuid,
    pub pipeline_id: String,
    pub pipeline_name: String,
    pub status: ExecutionStatus,
    pub is_success: bool,
    pub records_processed: u64,
    pub statistics: Statistics,
    pub stage_results: Vec<StageExecutionResult>,
    pub errors: Vec<ExecutionIssue>,
    pub warnings: Vec<ExecutionIssue>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration: Duration,
}

impl PipelineExecutionResult {
    pub fn stage_result(&self, stage_id: &str) -> Option<&StageExecutionResult> {
        self.stage_results.iter().find(|r| r.stage_id == stage_id)
    }
}

/// Point-in-time view of an active execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionSnapshot {
    pub execution_id: Uuid,
    pub pipeline_id: String,
    pub pipeline_name: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub current_stage: Option<String>,
}

/// Registry entry for an in-flight execution.
pub(crate) struct ActiveExecution {
    pub execution_id: Uuid,
    pub pipeline_id: String,
    pub pipeline_name: String,
    pub started_at: DateTime<Utc>,
    pub cancellation: CancellationSignal,
    status: Mutex<ExecutionStatus>,
    current_stage: Mutex<Option<String>>,
    paused: watch::Sender<bool>,
    stop_requested: AtomicBool,
}

impl ActiveExecution {
    pub fn new(
        execution_id: Uuid,
        pipeline_id: &str,
        pipeline_name: &str,
        started_at: DateTime<Utc>,
        cancellation: CancellationSignal,
    ) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            execution_id,
            pipeline_id: pipeline_id.to_string(),
            pipeline_name: pipeline_name.to_string(),
            started_at,
            cancellation,
            status: Mutex::new(ExecutionStatus::Pending),
            current_stage: Mutex::new(None),
            paused,
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_status(&self, status: ExecutionStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    pub fn set_current_stage(&self, stage_id: Option<&str>) {
        *self.current_stage.lock().unwrap_or_else(PoisonError::into_inner) = stage_id.map(str::to_string);
    }

    /// `Running -> Paused`; false from any other state.
    pub fn pause(&self) -> bool {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if *status != ExecutionStatus::Running {
            return false;
        }
        *status = ExecutionStatus::Paused;
        self.paused.send_replace(true);
        true
    }

    /// `Paused -> Running`; false from any other state.
    pub fn resume(&self) -> bool {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if *status != ExecutionStatus::Paused {
            return false;
        }
        *status = ExecutionStatus::Running;
        self.paused.send_replace(false);
        true
    }

    /// Request a stop; `force` also interrupts the in-flight stage.
    pub fn stop(&self, force: bool) -> bool {
        let status = self.status();
        if status.is_terminal() {
            return false;
        }
        self.stop_requested.store(true, Ordering::SeqCst);
        if force {
            self.cancellation.cancel();
        }
        // wake a paused run so it can observe the stop
        self.paused.send_replace(false);
        true
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Wait while paused. Returns early on stop or cancellation.
    pub async fn wait_while_paused(&self) {
        let mut paused = self.paused.subscribe();
        loop {
            if !*paused.borrow_and_update() || self.stop_requested() || self.cancellation.is_cancelled() {
                return;
            }
            tokio::select! {
                changed = paused.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = self.cancellation.cancelled() => return,
            }
        }
    }

    pub fn snapshot(&self) -> ExecutionSnapshot {
        ExecutionSnapshot {
            execution_id: self.execution_id,
            pipeline_id: self.pipeline_id.clone(),
            pipeline_name: self.pipeline_name.clone(),
            status: self.status(),
            started_at: self.started_at,
            current_stage: self.current_stage.lock().unwrap_or_else(PoisonError::into_inner).clone(),
        }
    }
}

/// Bounded, most-recent-first execution history per pipeline id.
pub(crate) struct ExecutionHistory {
    retention: usize,
    entries: RwLock<HashMap<String, VecDeque<PipelineExecutionResult>>>,
}

impl ExecutionHistory {
    pub fn new(retention: usize) -> Self {
        Self {
            retention: retention.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn record(&self, result: PipelineExecutionResult) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let history = entries.entry(result.pipeline_id.clone()).or_default();
        history.push_front(result);
        history.truncate(self.retention);
    }

    pub fn recent(&self, pipeline_id: &str, limit: usize) -> Vec<PipelineExecutionResult> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pipeline_id)
            .map(|history| history.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn find(&self, execution_id: Uuid) -> Option<PipelineExecutionResult> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .flat_map(|history| history.iter())
            .find(|result| result.execution_id == execution_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(pipeline_id: &str) -> PipelineExecutionResult {
        let now = Utc::now();
        PipelineExecutionResult {
            execution_id: Uuid::new_v4(),
            pipeline_id: pipeline_id.to_string(),
            pipeline_name: pipeline_id.to_string(),
            status: ExecutionStatus::Completed,
            is_success: true,
            records_processed: 0,
            statistics: Statistics::default(),
            stage_results: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            started_at: now,
            completed_at: now,
            duration: Duration::ZERO,
        }
    }

    #[test]
    fn test_history_is_bounded_and_most_recent_first() {
        let history = ExecutionHistory::new(2);
        let first = result("p");
        let second = result("p");
        let third = result("p");
        let third_id = third.execution_id;
        history.record(first.clone());
        history.record(second.clone());
        history.record(third);

        let recent = history.recent("p", 10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].execution_id, third_id);
        assert_eq!(recent[1].execution_id, second.execution_id);
        assert!(history.find(first.execution_id).is_none());
        assert_eq!(history.recent("p", 1).len(), 1);
        assert!(history.recent("other", 5).is_empty());
    }

    #[test]
    fn test_pause_resume_transitions() {
        let execution = ActiveExecution::new(Uuid::new_v4(), "p", "p", Utc::now(), CancellationSignal::new());
        assert!(!execution.pause());
        execution.set_status(ExecutionStatus::Running);
        assert!(execution.pause());
        assert!(!execution.pause());
        assert_eq!(execution.status(), ExecutionStatus::Paused);
        assert!(execution.resume());
        assert!(!execution.resume());
    }

    #[tokio::test]
    async fn test_wait_while_paused_wakes_on_resume() {
        let execution = std::sync::Arc::new(ActiveExecution::new(
            Uuid::new_v4(),
            "p",
            "p",
            Utc::now(),
            CancellationSignal::new(),
        ));
        execution.set_status(ExecutionStatus::Running);
        execution.pause();

        let waiter = {
            let execution = execution.clone();
            tokio::spawn(async move { execution.wait_while_paused().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        execution.resume();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("resume should wake the waiter")
            .unwrap();
    }

    #[test]
    fn test_force_stop_cancels() {
        let execution = ActiveExecution::new(Uuid::new_v4(), "p", "p", Utc::now(), CancellationSignal::new());
        execution.set_status(ExecutionStatus::Running);
        assert!(execution.stop(true));
        assert!(execution.stop_requested());
        assert!(execution.cancellation.is_cancelled());
        execution.set_status(ExecutionStatus::Cancelled);
        assert!(!execution.stop(false));
    }
}
