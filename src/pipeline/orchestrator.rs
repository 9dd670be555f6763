use chrono::Utc;
use etl_core::{CancellationSignal, EtlError, ExecutionContext, ExecutionIssue, Record, Result, Value};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::events::{EventBus, PipelineEvent};
use super::execution::{
    ActiveExecution, ExecutionHistory, ExecutionSnapshot, ExecutionStatus, PipelineExecutionResult,
};
use super::pipeline::Pipeline;
use super::processing::rules::all_hold;
use super::retry::retry_with_policy;
use super::schedule::{Schedule, ScheduledJob};
use super::stage::{PipelineStage, Stage, StageExecutionResult, StageStatus};
use crate::observability::metrics;

pub const DEFAULT_HISTORY_RETENTION: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Results kept per pipeline id; older ones are evicted.
    pub history_retention: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            history_retention: DEFAULT_HISTORY_RETENTION,
        }
    }
}

struct ScheduledEntry {
    job: ScheduledJob,
    handle: JoinHandle<()>,
    /// Ends the schedule and cancels a run it has in flight.
    stop: CancellationSignal,
}

/// Keeps an execution registered until it is finished.
///
/// If the `execute` future is dropped before the run ends, the guard cancels
/// the run's signal, removes it from the active registry and records it as
/// `Cancelled`.
struct ExecutionGuard<'a> {
    orchestrator: &'a PipelineOrchestrator,
    pipeline: &'a Pipeline,
    execution: Arc<ActiveExecution>,
    ctx: &'a ExecutionContext,
    finished: bool,
}

impl ExecutionGuard<'_> {
    fn finish(mut self, status: ExecutionStatus, stage_results: Vec<StageExecutionResult>) -> PipelineExecutionResult {
        self.finished = true;
        self.orchestrator
            .finish_execution(self.pipeline, &self.execution, self.ctx, status, stage_results)
    }
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(
            execution_id = %self.execution.execution_id,
            "🛑 Execution of pipeline '{}' dropped before it finished",
            self.pipeline.id()
        );
        self.ctx.cancellation().cancel();
        self.orchestrator.finish_execution(
            self.pipeline,
            &self.execution,
            self.ctx,
            ExecutionStatus::Cancelled,
            Vec::new(),
        );
    }
}

/// How a single stage invocation ended, as seen by the run loop.
enum StageOutcome {
    Finished(StageExecutionResult),
    /// Preparation failed; the run cannot continue.
    Fatal(StageExecutionResult),
    Cancelled(StageExecutionResult),
}

/// Runs pipelines and tracks their executions.
///
/// Stages of one run execute strictly in order. Independent runs may share an
/// orchestrator; the active registry and history are keyed by execution and
/// pipeline id respectively.
pub struct PipelineOrchestrator {
    active: RwLock<HashMap<Uuid, Arc<ActiveExecution>>>,
    history: ExecutionHistory,
    events: EventBus,
    scheduled: Mutex<HashMap<Uuid, ScheduledEntry>>,
}

impl PipelineOrchestrator {
    pub fn new(settings: OrchestratorSettings) -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            history: ExecutionHistory::new(settings.history_retention),
            events: EventBus::default(),
            scheduled: Mutex::new(HashMap::new()),
        }
    }

    /// Run every enabled stage of `pipeline` in order.
    ///
    /// Validation errors are returned as `Err` before anything runs. Runtime
    /// failures end up in the returned result.
    #[instrument(skip_all, fields(pipeline_id = %pipeline.id(), execution_id = %ctx.execution_id()))]
    pub async fn execute(&self, pipeline: Arc<Pipeline>, ctx: ExecutionContext) -> Result<PipelineExecutionResult> {
        let validation = pipeline.validate(&ctx);
        for warning in validation.warnings() {
            ctx.add_warning(ExecutionIssue::new(warning.message.clone()).with_source("validation"));
        }
        if let Err(e) = validation.into_result() {
            error!("❌ Pipeline '{}' failed validation: {}", pipeline.id(), e);
            return Err(e);
        }

        let settings = *pipeline.settings();
        ctx.set_error_limit(settings.error_handling.max_errors);
        ctx.set_max_parallelism(Some(settings.max_degree_of_parallelism));
        let _run = pipeline.begin_run();

        let execution = Arc::new(ActiveExecution::new(
            ctx.execution_id(),
            pipeline.id(),
            pipeline.name(),
            ctx.started_at(),
            ctx.cancellation().clone(),
        ));
        execution.set_status(ExecutionStatus::Running);
        self.active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(execution.execution_id, execution.clone());
        let guard = ExecutionGuard {
            orchestrator: self,
            pipeline: &pipeline,
            execution: execution.clone(),
            ctx: &ctx,
            finished: false,
        };

        let stages = pipeline.stages();
        info!("🚀 Starting pipeline '{}' ({} stages)", pipeline.name(), stages.len());
        if !pipeline.description().is_empty() {
            info!("📋 Pipeline description: {}", pipeline.description());
        }
        metrics::pipeline::execution_started(pipeline.id());
        self.events.emit(PipelineEvent::PipelineStarted {
            execution_id: execution.execution_id,
            pipeline_id: pipeline.id().to_string(),
            pipeline_name: pipeline.name().to_string(),
        });

        let mut stage_results = Vec::with_capacity(stages.len());
        let mut statuses: BTreeMap<String, StageStatus> = BTreeMap::new();
        let mut failed = false;
        let mut cancelled = false;

        for (index, stage) in stages.iter().enumerate() {
            execution.wait_while_paused().await;
            if execution.stop_requested() || ctx.is_cancelled() {
                warn!("⏹️ Stop requested, not starting stage '{}'", stage.id());
                cancelled = true;
                break;
            }
            if !stage.enabled {
                debug!(stage_id = %stage.id(), "Stage disabled, skipping");
                continue;
            }

            execution.set_current_stage(Some(stage.id()));
            info!("🔄 Executing stage {}/{}: {}", index + 1, stages.len(), stage.name());

            let outcome = match self.conditions_hold(stage, &ctx, &statuses) {
                Ok(true) => self.run_stage(&pipeline, stage, &ctx).await,
                Ok(false) => {
                    info!("⏭️ Skipping stage '{}': execution conditions not met", stage.id());
                    metrics::stage::skipped(stage.id());
                    StageOutcome::Finished(
                        StageExecutionResult::skipped("execution conditions not met").finish(
                            stage,
                            0,
                            Default::default(),
                        ),
                    )
                }
                Err(e) => {
                    ctx.add_error(
                        ExecutionIssue::new(format!("conditions for stage '{}' could not be evaluated", stage.id()))
                            .with_source(format!("stage:{}", stage.id()))
                            .with_detail(&e),
                    );
                    StageOutcome::Finished(
                        StageExecutionResult::failure(e.to_string()).finish(stage, 0, Default::default()),
                    )
                }
            };
            execution.set_current_stage(None);

            let (result, fatal) = match outcome {
                StageOutcome::Finished(result) => (result, false),
                StageOutcome::Fatal(result) => (result, true),
                StageOutcome::Cancelled(result) => {
                    cancelled = true;
                    (result, false)
                }
            };
            statuses.insert(result.stage_id.clone(), result.status);
            self.events.emit(PipelineEvent::StageFinished {
                execution_id: execution.execution_id,
                pipeline_id: pipeline.id().to_string(),
                stage_id: result.stage_id.clone(),
                status: result.status,
            });
            let stage_failed = !result.is_success && !cancelled;
            stage_results.push(result);

            if cancelled {
                break;
            }
            if fatal {
                error!("❌ Stopping pipeline: stage '{}' could not be prepared", stage.id());
                failed = true;
                break;
            }
            if stage_failed {
                failed = true;
                if settings.error_handling.stop_on_error {
                    error!("❌ Stopping pipeline due to failure of stage '{}'", stage.id());
                    break;
                }
                warn!("⚠️ Stage '{}' failed but continuing", stage.id());
            }
            if ctx.error_limit_reached() {
                error!(
                    errors = ctx.error_count(),
                    max_errors = ?settings.error_handling.max_errors,
                    "❌ Error limit reached, aborting pipeline"
                );
                failed = true;
                break;
            }
        }

        let status = if cancelled {
            ExecutionStatus::Cancelled
        } else if failed {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };
        Ok(guard.finish(status, stage_results))
    }

    fn finish_execution(
        &self,
        pipeline: &Pipeline,
        execution: &ActiveExecution,
        ctx: &ExecutionContext,
        status: ExecutionStatus,
        stage_results: Vec<StageExecutionResult>,
    ) -> PipelineExecutionResult {
        let duration = ctx.elapsed();
        ctx.update_statistics(|stats| stats.observe_elapsed(duration));
        let statistics = ctx.statistics();

        let result = PipelineExecutionResult {
            execution_id: execution.execution_id,
            pipeline_id: pipeline.id().to_string(),
            pipeline_name: pipeline.name().to_string(),
            status,
            is_success: status == ExecutionStatus::Completed,
            records_processed: statistics.records_processed,
            statistics,
            stage_results,
            errors: ctx.errors(),
            warnings: ctx.warnings(),
            started_at: execution.started_at,
            completed_at: Utc::now(),
            duration,
        };

        execution.set_status(status);
        self.active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&execution.execution_id);
        self.history.record(result.clone());
        pipeline.record_status(status);
        metrics::pipeline::duration(pipeline.id(), duration.as_secs_f64());

        let execution_id = execution.execution_id;
        let pipeline_id = pipeline.id().to_string();
        match status {
            ExecutionStatus::Completed => {
                info!(
                    "🎉 Pipeline '{}' completed: {} records processed in {:.2}s",
                    pipeline.name(),
                    result.records_processed,
                    duration.as_secs_f64()
                );
                metrics::pipeline::execution_completed(&pipeline_id);
                self.events.emit(PipelineEvent::PipelineCompleted {
                    execution_id,
                    pipeline_id,
                    records_processed: result.records_processed,
                });
            }
            ExecutionStatus::Cancelled => {
                warn!("🛑 Pipeline '{}' cancelled", pipeline.name());
                metrics::pipeline::execution_cancelled(&pipeline_id);
                self.events.emit(PipelineEvent::PipelineCancelled {
                    execution_id,
                    pipeline_id,
                });
            }
            _ => {
                error!(
                    "❌ Pipeline '{}' failed with {} errors",
                    pipeline.name(),
                    result.errors.len()
                );
                metrics::pipeline::execution_failed(&pipeline_id);
                self.events.emit(PipelineEvent::PipelineFailed {
                    execution_id,
                    pipeline_id,
                    errors: result.errors.iter().map(ToString::to_string).collect(),
                });
            }
        }
        result
    }

    /// Conditions see the context variables plus `_error_count`,
    /// `_records_processed` and `_stages.<id>` (status of earlier stages).
    fn conditions_hold(
        &self,
        stage: &PipelineStage,
        ctx: &ExecutionContext,
        statuses: &BTreeMap<String, StageStatus>,
    ) -> Result<bool> {
        if stage.conditions.is_empty() {
            return Ok(true);
        }
        let mut scope: Record = ctx.variables().into_iter().collect();
        scope.set("_error_count", ctx.error_count() as i64);
        scope.set("_records_processed", ctx.statistics().records_processed as i64);
        let stages: Record = statuses
            .iter()
            .map(|(id, status)| (id.clone(), Value::from(status.as_str())))
            .collect();
        scope.set("_stages", stages);
        all_hold(&stage.conditions, &scope)
    }

    /// Prepare, execute with retry, and always clean up.
    #[instrument(skip_all, fields(stage_id = %stage.id()))]
    async fn run_stage(&self, pipeline: &Pipeline, stage: &PipelineStage, ctx: &ExecutionContext) -> StageOutcome {
        let started = Instant::now();
        let errors_before = ctx.error_count();
        let stage_id = stage.id().to_string();
        let inner = stage.stage().clone();

        if let Err(e) = guarded(&stage_id, inner.prepare(ctx)).await {
            run_cleanup(&stage_id, inner.as_ref(), ctx).await;
            let elapsed = started.elapsed();
            if e.is_cancellation() {
                return StageOutcome::Cancelled(
                    StageExecutionResult::cancelled("cancelled during prepare").finish(stage, 0, elapsed),
                );
            }
            error!("❌ Stage '{}' failed to prepare: {}", stage_id, e);
            metrics::stage::failed(&stage_id);
            ctx.add_error(
                ExecutionIssue::new(format!("stage '{}' failed to prepare", stage_id))
                    .with_source(format!("stage:{}", stage_id))
                    .with_detail(&e),
            );
            return StageOutcome::Fatal(
                StageExecutionResult::failure(format!("prepare failed: {}", e)).finish(stage, 0, elapsed),
            );
        }

        let policy = stage.retry.unwrap_or(pipeline.settings().retry);
        let (outcome, attempts) = retry_with_policy(&policy, ctx.cancellation(), &stage_id, |attempt| {
            let inner = inner.clone();
            let ctx = ctx.clone();
            let stage_id = stage_id.clone();
            async move {
                if attempt > 1 {
                    debug!(stage_id = %stage_id, attempt, "Retrying stage");
                }
                let cancellation = ctx.cancellation().clone();
                tokio::select! {
                    result = guarded(&stage_id, inner.execute(&ctx)) => result,
                    _ = cancellation.cancelled() => Err(EtlError::Cancelled),
                }
            }
        })
        .await;

        run_cleanup(&stage_id, inner.as_ref(), ctx).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(result) => {
                let result = result.finish(stage, attempts, elapsed);
                if result.is_success {
                    info!("✅ Stage '{}' completed: {}", stage_id, result.message);
                    metrics::stage::completed(&stage_id, elapsed.as_secs_f64());
                } else {
                    warn!("⚠️ Stage '{}' reported failure: {}", stage_id, result.message);
                    metrics::stage::failed(&stage_id);
                    if ctx.error_count() == errors_before {
                        let mut issue = ExecutionIssue::new(format!("stage '{}' failed", stage_id))
                            .with_source(format!("stage:{}", stage_id));
                        if !result.errors.is_empty() {
                            issue = issue.with_detail(result.errors.join("; "));
                        } else if !result.message.is_empty() {
                            issue = issue.with_detail(&result.message);
                        }
                        ctx.add_error(issue);
                    }
                }
                StageOutcome::Finished(result)
            }
            Err(e) if e.is_cancellation() => {
                warn!("🛑 Stage '{}' cancelled", stage_id);
                StageOutcome::Cancelled(StageExecutionResult::cancelled("stage cancelled").finish(
                    stage,
                    attempts,
                    elapsed,
                ))
            }
            Err(e) => {
                error!("❌ Stage '{}' failed with error: {}", stage_id, e);
                metrics::stage::failed(&stage_id);
                ctx.add_error(
                    ExecutionIssue::new(format!("stage '{}' failed", stage_id))
                        .with_source(format!("stage:{}", stage_id))
                        .with_detail(&e),
                );
                StageOutcome::Finished(
                    StageExecutionResult::failure(format!("Stage failed: {}", e)).finish(stage, attempts, elapsed),
                )
            }
        }
    }

    /// Register a deferred or recurring run. Returns immediately.
    pub fn schedule_pipeline(self: &Arc<Self>, pipeline: Arc<Pipeline>, schedule: Schedule) -> Uuid {
        let job_id = Uuid::new_v4();
        let job = ScheduledJob {
            job_id,
            pipeline_id: pipeline.id().to_string(),
            schedule,
            created_at: Utc::now(),
            runs: 0,
        };
        info!("📅 Scheduled pipeline '{}' as job {} ({:?})", pipeline.id(), job_id, schedule);

        // hold the lock so a job finishing immediately cannot race its own registration
        let mut scheduled = self.scheduled.lock().unwrap_or_else(PoisonError::into_inner);
        let stop = CancellationSignal::new();
        let handle = tokio::spawn(run_schedule(Arc::downgrade(self), job_id, pipeline, schedule, stop.clone()));
        scheduled.insert(job_id, ScheduledEntry { job, handle, stop });
        job_id
    }

    /// Cancel a scheduled job.
    ///
    /// A pending run never starts. A run already in flight is cancelled
    /// cooperatively: its current stage is interrupted and cleaned up and the
    /// execution ends as `Cancelled`.
    pub fn cancel_scheduled_pipeline(&self, job_id: Uuid) -> bool {
        let entry = self
            .scheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&job_id);
        match entry {
            Some(entry) => {
                entry.stop.cancel();
                info!("🗑️ Cancelled scheduled job {}", job_id);
                true
            }
            None => false,
        }
    }

    pub fn scheduled_jobs(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<ScheduledJob> = self
            .scheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|entry| entry.job.clone())
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    fn record_scheduled_run(&self, job_id: Uuid, runs: u32) {
        if let Some(entry) = self
            .scheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&job_id)
        {
            entry.job.runs = runs;
        }
    }

    fn finish_scheduled(&self, job_id: Uuid) {
        self.scheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&job_id);
    }

    fn active_execution(&self, execution_id: Uuid) -> Option<Arc<ActiveExecution>> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&execution_id)
            .cloned()
    }

    /// Stop starting new stages until resumed. Only a running execution can pause.
    pub fn pause_pipeline(&self, execution_id: Uuid) -> bool {
        let Some(execution) = self.active_execution(execution_id) else {
            return false;
        };
        if !execution.pause() {
            return false;
        }
        info!("⏸️ Paused execution {} of pipeline '{}'", execution_id, execution.pipeline_id);
        self.events.emit(PipelineEvent::PipelinePaused {
            execution_id,
            pipeline_id: execution.pipeline_id.clone(),
        });
        true
    }

    pub fn resume_pipeline(&self, execution_id: Uuid) -> bool {
        let Some(execution) = self.active_execution(execution_id) else {
            return false;
        };
        if !execution.resume() {
            return false;
        }
        info!("▶️ Resumed execution {} of pipeline '{}'", execution_id, execution.pipeline_id);
        self.events.emit(PipelineEvent::PipelineResumed {
            execution_id,
            pipeline_id: execution.pipeline_id.clone(),
        });
        true
    }

    /// End a running or paused execution as `Cancelled`.
    ///
    /// Without `force` the current stage finishes first; with it the
    /// cancellation signal fires and the stage is interrupted.
    pub fn stop_pipeline(&self, execution_id: Uuid, force: bool) -> bool {
        let Some(execution) = self.active_execution(execution_id) else {
            return false;
        };
        let stopped = execution.stop(force);
        if stopped {
            warn!(force, "🛑 Stop requested for execution {}", execution_id);
        }
        stopped
    }

    /// Status of an active execution, or of one still in history.
    pub fn get_execution_status(&self, execution_id: Uuid) -> Option<ExecutionStatus> {
        if let Some(execution) = self.active_execution(execution_id) {
            return Some(execution.status());
        }
        self.history.find(execution_id).map(|result| result.status)
    }

    pub fn get_active_executions(&self) -> Vec<ExecutionSnapshot> {
        let mut snapshots: Vec<ExecutionSnapshot> = self
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|execution| execution.snapshot())
            .collect();
        snapshots.sort_by_key(|snapshot| snapshot.started_at);
        snapshots
    }

    /// Most recent first, at most `limit` entries.
    pub fn get_execution_history(&self, pipeline_id: &str, limit: usize) -> Vec<PipelineExecutionResult> {
        self.history.recent(pipeline_id, limit)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }
}

impl Default for PipelineOrchestrator {
    fn default() -> Self {
        Self::new(OrchestratorSettings::default())
    }
}

impl Drop for PipelineOrchestrator {
    fn drop(&mut self) {
        // a job in the middle of a run holds a strong reference, so every
        // remaining job is between runs and can be aborted outright
        let scheduled = self.scheduled.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, entry) in scheduled.drain() {
            entry.stop.cancel();
            entry.handle.abort();
        }
    }
}

/// Turn a panic inside a stage future into an error.
async fn guarded<T>(stage_id: &str, future: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "stage panicked".to_string());
            Err(EtlError::Stage {
                stage_id: stage_id.to_string(),
                message,
            })
        }
    }
}

async fn run_cleanup(stage_id: &str, stage: &dyn Stage, ctx: &ExecutionContext) {
    if let Err(e) = guarded(stage_id, stage.cleanup(ctx)).await {
        warn!("⚠️ Cleanup of stage '{}' failed: {}", stage_id, e);
        ctx.add_warning(
            ExecutionIssue::new(format!("cleanup of stage '{}' failed", stage_id))
                .with_source(format!("stage:{}", stage_id))
                .with_detail(&e),
        );
    }
}

async fn run_schedule(
    orchestrator: Weak<PipelineOrchestrator>,
    job_id: Uuid,
    pipeline: Arc<Pipeline>,
    schedule: Schedule,
    stop: CancellationSignal,
) {
    let mut runs = 0u32;
    while let Some(delay) = schedule.next_delay(runs, Utc::now()) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.cancelled() => return,
        }
        if stop.is_cancelled() {
            return;
        }
        let Some(orchestrator) = orchestrator.upgrade() else {
            return;
        };
        info!("⏰ Running scheduled job {} for pipeline '{}'", job_id, pipeline.id());

        let ctx = ExecutionContext::new();
        let run_signal = ctx.cancellation().clone();
        let run = orchestrator.execute(pipeline.clone(), ctx);
        tokio::pin!(run);
        let outcome = tokio::select! {
            outcome = &mut run => outcome,
            _ = stop.cancelled() => {
                run_signal.cancel();
                run.await
            }
        };
        match outcome {
            Ok(result) => debug!(%job_id, status = %result.status, "Scheduled run finished"),
            Err(e) => error!("❌ Scheduled run of pipeline '{}' failed: {}", pipeline.id(), e),
        }
        if stop.is_cancelled() {
            return;
        }
        runs += 1;
        orchestrator.record_scheduled_run(job_id, runs);
    }
    if let Some(orchestrator) = orchestrator.upgrade() {
        orchestrator.finish_scheduled(job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::processing::rules::Condition;
    use crate::pipeline::retry::RetryPolicy;
    use crate::pipeline::stage::StageType;
    use crate::pipeline::steps::FnStage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Sleeps in `execute` until cancelled and counts `cleanup` calls.
    struct SlowStage {
        cleaned_up: Arc<AtomicUsize>,
    }

    fn slow_stage(order: i32) -> (PipelineStage, Arc<AtomicUsize>) {
        let cleaned_up = Arc::new(AtomicUsize::new(0));
        let stage = SlowStage {
            cleaned_up: cleaned_up.clone(),
        };
        (PipelineStage::from_stage(stage, order), cleaned_up)
    }

    #[async_trait]
    impl Stage for SlowStage {
        fn id(&self) -> &str {
            "slow"
        }

        fn name(&self) -> &str {
            "slow"
        }

        fn stage_type(&self) -> StageType {
            StageType::Custom
        }

        async fn execute(&self, ctx: &ExecutionContext) -> Result<StageExecutionResult> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            ctx.ensure_not_cancelled()?;
            Ok(StageExecutionResult::success(0, "done"))
        }

        async fn cleanup(&self, _ctx: &ExecutionContext) -> Result<()> {
            self.cleaned_up.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn ok_stage(id: &str, order: i32) -> PipelineStage {
        PipelineStage::from_stage(
            FnStage::new(id, StageType::Custom, |_ctx| async { Ok(StageExecutionResult::success(1, "ok")) }),
            order,
        )
    }

    #[tokio::test]
    async fn test_execute_runs_stages_in_order() {
        let orchestrator = PipelineOrchestrator::default();
        let pipeline = Arc::new(
            Pipeline::new("p", "Pipeline")
                .with_stage(ok_stage("second", 2))
                .unwrap()
                .with_stage(ok_stage("first", 1))
                .unwrap(),
        );
        let mut events = orchestrator.subscribe();

        let result = orchestrator.execute(pipeline.clone(), ExecutionContext::new()).await.unwrap();
        assert!(result.is_success);
        assert_eq!(result.status, ExecutionStatus::Completed);
        let ids: Vec<&str> = result.stage_results.iter().map(|r| r.stage_id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second"]);
        assert_eq!(pipeline.status(), ExecutionStatus::Completed);

        let first = events.recv().await.unwrap();
        assert_eq!(first.event_type(), "pipeline_started");
        assert_eq!(orchestrator.get_execution_status(result.execution_id), Some(ExecutionStatus::Completed));
        assert!(orchestrator.get_active_executions().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_pipeline_is_rejected_before_running() {
        let orchestrator = PipelineOrchestrator::default();
        let pipeline = Arc::new(Pipeline::new("empty", "Empty"));
        let err = orchestrator.execute(pipeline, ExecutionContext::new()).await.unwrap_err();
        assert!(matches!(err, EtlError::Validation { .. }));
        assert!(orchestrator.get_execution_history("empty", 10).is_empty());
    }

    #[tokio::test]
    async fn test_pipeline_parallelism_reaches_stages() {
        let seen = Arc::new(AtomicUsize::new(0));
        let observer = seen.clone();
        let stage = FnStage::new("observe", StageType::Custom, move |ctx: ExecutionContext| {
            observer.store(ctx.max_parallelism().unwrap_or(0), Ordering::SeqCst);
            async { Ok(StageExecutionResult::success(0, "ok")) }
        });
        let pipeline = Arc::new(
            Pipeline::new("p", "p")
                .with_settings(crate::pipeline::PipelineSettings {
                    max_degree_of_parallelism: 4,
                    ..Default::default()
                })
                .with_stage(PipelineStage::from_stage(stage, 1))
                .unwrap(),
        );
        PipelineOrchestrator::default()
            .execute(pipeline, ExecutionContext::new())
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_condition_on_previous_stage_status() {
        let orchestrator = PipelineOrchestrator::default();
        let pipeline = Arc::new(
            Pipeline::new("p", "p")
                .with_stage(ok_stage("extract", 1))
                .unwrap()
                .with_stage(ok_stage("report", 2).when(Condition::equals("_stages.extract", "failed")))
                .unwrap(),
        );
        let result = orchestrator.execute(pipeline, ExecutionContext::new()).await.unwrap();
        assert!(result.is_success);
        assert_eq!(result.stage_result("report").unwrap().status, StageStatus::Skipped);
    }

    #[tokio::test]
    async fn test_err_is_retried_with_policy() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let flaky = FnStage::new("flaky", StageType::Custom, move |_ctx| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt < 3 {
                    Err(EtlError::validation("transient"))
                } else {
                    Ok(StageExecutionResult::success(0, "ok"))
                }
            }
        });
        let pipeline = Arc::new(
            Pipeline::new("p", "p")
                .with_stage(PipelineStage::from_stage(flaky, 1).with_retry(RetryPolicy::new(3, Duration::ZERO)))
                .unwrap(),
        );
        let result = PipelineOrchestrator::default()
            .execute(pipeline, ExecutionContext::new())
            .await
            .unwrap();
        assert!(result.is_success);
        assert_eq!(result.stage_result("flaky").unwrap().attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_panicking_stage_becomes_failure() {
        let boom = FnStage::new("boom", StageType::Custom, |_ctx| async {
            if true {
                panic!("stage exploded");
            }
            Ok(StageExecutionResult::success(0, "unreachable"))
        });
        let pipeline = Arc::new(Pipeline::new("p", "p").with_stage(PipelineStage::from_stage(boom, 1)).unwrap());
        let result = PipelineOrchestrator::default()
            .execute(pipeline, ExecutionContext::new())
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].to_string().contains("stage exploded"));
    }

    #[tokio::test]
    async fn test_force_stop_cancels_running_stage() {
        let orchestrator = Arc::new(PipelineOrchestrator::default());
        let (slow, cleaned_up) = slow_stage(1);
        let pipeline = Arc::new(
            Pipeline::new("p", "p")
                .with_stage(slow)
                .unwrap()
                .with_stage(ok_stage("after", 2))
                .unwrap(),
        );
        let ctx = ExecutionContext::new();
        let execution_id = ctx.execution_id();
        let run = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.execute(pipeline, ctx).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(orchestrator.get_active_executions().len(), 1);
        assert!(orchestrator.stop_pipeline(execution_id, true));

        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert!(result.stage_result("after").is_none());
        assert_eq!(cleaned_up.load(Ordering::SeqCst), 1);
        assert!(!orchestrator.stop_pipeline(execution_id, true));
    }

    #[tokio::test]
    async fn test_cancelling_scheduled_job_mid_run_cleans_up_and_records_history() {
        let orchestrator = Arc::new(PipelineOrchestrator::default());
        let (slow, cleaned_up) = slow_stage(1);
        let pipeline = Arc::new(Pipeline::new("sched", "s").with_stage(slow).unwrap());
        let mut events = orchestrator.subscribe();

        let job = orchestrator.schedule_pipeline(pipeline.clone(), Schedule::Once { delay: Duration::ZERO });
        tokio::time::sleep(Duration::from_millis(100)).await;
        let active = orchestrator.get_active_executions();
        assert_eq!(active.len(), 1);
        let execution_id = active[0].execution_id;

        assert!(orchestrator.cancel_scheduled_pipeline(job));
        let cancelled = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(PipelineEvent::PipelineCancelled { execution_id: id, .. }) = events.recv().await {
                    return id;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(cancelled, execution_id);

        assert!(orchestrator.get_active_executions().is_empty());
        assert_eq!(cleaned_up.load(Ordering::SeqCst), 1);
        assert_eq!(orchestrator.get_execution_status(execution_id), Some(ExecutionStatus::Cancelled));
        let history = orchestrator.get_execution_history("sched", 10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, ExecutionStatus::Cancelled);
        assert!(!orchestrator.pause_pipeline(execution_id));
        assert!(orchestrator.scheduled_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_execution_is_recorded_as_cancelled() {
        let orchestrator = PipelineOrchestrator::default();
        let (slow, _) = slow_stage(1);
        let pipeline = Arc::new(Pipeline::new("p", "p").with_stage(slow).unwrap());
        let ctx = ExecutionContext::new();
        let execution_id = ctx.execution_id();
        let signal = ctx.cancellation().clone();

        let run = orchestrator.execute(pipeline.clone(), ctx);
        let timed_out = tokio::time::timeout(Duration::from_millis(50), run).await;
        assert!(timed_out.is_err());

        assert!(orchestrator.get_active_executions().is_empty());
        assert!(signal.is_cancelled());
        assert_eq!(orchestrator.get_execution_status(execution_id), Some(ExecutionStatus::Cancelled));
        assert_eq!(pipeline.status(), ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_schedule_runs_and_can_be_cancelled() {
        let orchestrator = Arc::new(PipelineOrchestrator::default());
        let pipeline = Arc::new(Pipeline::new("sched", "s").with_stage(ok_stage("a", 1)).unwrap());

        let once = orchestrator.schedule_pipeline(
            pipeline.clone(),
            Schedule::Once {
                delay: Duration::from_millis(10),
            },
        );
        let forever = orchestrator.schedule_pipeline(
            pipeline,
            Schedule::Interval {
                every: Duration::from_secs(3600),
                max_runs: None,
            },
        );
        assert_eq!(orchestrator.scheduled_jobs().len(), 2);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(orchestrator.get_execution_history("sched", 10).len(), 1);
        assert!(!orchestrator.cancel_scheduled_pipeline(once));
        assert!(orchestrator.cancel_scheduled_pipeline(forever));
        assert!(orchestrator.scheduled_jobs().is_empty());
    }

    #[test]
    fn test_controls_on_unknown_execution_return_false() {
        let orchestrator = PipelineOrchestrator::default();
        let id = Uuid::new_v4();
        assert!(!orchestrator.pause_pipeline(id));
        assert!(!orchestrator.resume_pipeline(id));
        assert!(!orchestrator.stop_pipeline(id, false));
        assert!(orchestrator.get_execution_status(id).is_none());
        assert!(!orchestrator.cancel_scheduled_pipeline(id));
    }
}
