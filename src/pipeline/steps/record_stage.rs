use async_trait::async_trait;
use etl_core::connector::{BatchStream, DestinationConnector, SourceConnector};
use etl_core::{EtlError, ExecutionContext, ExecutionIssue, Record, Result, ValidationResult};
use futures::stream::{self, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::observability::metrics;
use crate::pipeline::processing::mapping::DataMapper;
use crate::pipeline::processing::rules::RuleEngine;
use crate::pipeline::processing::transform::{Transformation, TransformationResult};
use crate::pipeline::stage::{Stage, StageExecutionResult, StageType};

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// One per-record processing step inside a [`RecordStage`].
#[derive(Clone)]
pub enum Processor {
    Rules(Arc<RuleEngine>),
    Mapper(Arc<DataMapper>),
    Transformation(Arc<dyn Transformation>),
}

impl Processor {
    pub fn name(&self) -> String {
        match self {
            Processor::Rules(_) => "rules".to_string(),
            Processor::Mapper(mapper) => format!("mapper:{}", mapper.name()),
            Processor::Transformation(t) => format!("transformation:{}", t.name()),
        }
    }

    /// `Err` only on cancellation.
    async fn process(&self, record: Record, ctx: &ExecutionContext) -> Result<TransformationResult> {
        match self {
            Processor::Rules(engine) => engine.apply_rules(&record, ctx).await,
            Processor::Mapper(mapper) => match mapper.map(&record).await {
                Ok(mapped) => {
                    metrics::mapping::records_mapped(mapper.name(), 1);
                    Ok(TransformationResult::success(mapped))
                }
                Err(e) if e.is_cancellation() => Err(e),
                Err(e) => {
                    metrics::mapping::records_failed(mapper.name(), 1);
                    Ok(TransformationResult::failure(record, e.to_string()))
                }
            },
            Processor::Transformation(transformation) => transformation.transform(&record, ctx).await,
        }
    }

    fn validate(&self, ctx: &ExecutionContext) -> ValidationResult {
        match self {
            Processor::Rules(engine) => engine.validate_rules(ctx),
            Processor::Mapper(mapper) => mapper.validate(),
            Processor::Transformation(_) => ValidationResult::new(),
        }
    }
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Standard record-processing stage: read, process, write.
///
/// Without a source the stage consumes the dataset the previous stage left in
/// the context; without a destination it leaves its output there.
pub struct RecordStage {
    id: String,
    name: String,
    stage_type: StageType,
    source: Option<Arc<dyn SourceConnector>>,
    destination: Option<Arc<dyn DestinationConnector>>,
    processors: Vec<Processor>,
    batch_size: usize,
    /// `None` uses the run's default from the context.
    parallelism: Option<usize>,
    destination_prepared: AtomicBool,
}

#[derive(Default)]
struct BatchOutcome {
    processed: u64,
    failed: u64,
    errors: Vec<String>,
    produced: Vec<Record>,
    /// Records the destination has accepted during this attempt.
    written: usize,
    halted: bool,
}

impl RecordStage {
    pub fn new(id: impl Into<String>, stage_type: StageType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            stage_type,
            source: None,
            destination: None,
            processors: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            parallelism: None,
            destination_prepared: AtomicBool::new(false),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_source(mut self, source: Arc<dyn SourceConnector>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_destination(mut self, destination: Arc<dyn DestinationConnector>) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_processor(mut self, processor: Processor) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Records processed concurrently within a batch; output order is preserved.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = Some(parallelism);
        self
    }

    fn effective_parallelism(&self, ctx: &ExecutionContext) -> usize {
        self.parallelism.or_else(|| ctx.max_parallelism()).unwrap_or(1).max(1)
    }

    pub fn processors(&self) -> &[Processor] {
        &self.processors
    }

    fn source_label(&self) -> String {
        format!("stage:{}", self.id)
    }

    /// Once a batch has reached the destination, a later error ends the stage
    /// as a failure instead of surfacing as `Err`, so a retry cannot write the
    /// same records twice.
    fn absorb_after_commit(&self, e: EtlError, ctx: &ExecutionContext, outcome: &mut BatchOutcome) -> Result<()> {
        if e.is_cancellation() || outcome.written == 0 {
            return Err(e);
        }
        warn!(stage_id = %self.id, written = outcome.written, "⚠️ Stage failed after writing records: {}", e);
        ctx.add_error(
            ExecutionIssue::new(format!("stage '{}' failed after {} records were written", self.id, outcome.written))
                .with_source(self.source_label())
                .with_detail(&e),
        );
        outcome.errors.push(e.to_string());
        outcome.halted = true;
        Ok(())
    }

    /// Run one record through every processor. `Ok(None)` means it failed and was dropped.
    async fn process_record(&self, record: Record, index: usize, ctx: &ExecutionContext) -> Result<Option<Record>> {
        let mut current = record;
        for processor in &self.processors {
            let result = processor.process(current, ctx).await?;
            if !result.is_successful {
                // the rule engine records its own failures
                if !matches!(processor, Processor::Rules(_)) {
                    ctx.add_error(
                        ExecutionIssue::new(format!("{} failed", processor.name()))
                            .with_source(self.source_label())
                            .with_record(index)
                            .with_detail(result.errors.join("; ")),
                    );
                }
                debug!(stage_id = %self.id, record_index = index, processor = %processor.name(), "Record dropped");
                return Ok(None);
            }
            current = result.output;
        }
        Ok(Some(current))
    }

    async fn process_batch(
        &self,
        batch: Vec<Record>,
        offset: usize,
        ctx: &ExecutionContext,
        outcome: &mut BatchOutcome,
    ) -> Result<()> {
        let batch_len = batch.len() as u64;
        let results: Vec<Result<Option<Record>>> = stream::iter(batch.into_iter().enumerate())
            .map(|(i, record)| self.process_record(record, offset + i, ctx))
            .buffered(self.effective_parallelism(ctx))
            .collect()
            .await;

        let mut survivors = Vec::with_capacity(results.len());
        let mut failed = 0u64;
        for result in results {
            match result? {
                Some(record) => survivors.push(record),
                None => failed += 1,
            }
        }

        let transformed = survivors.len() as u64;

        if let Some(destination) = &self.destination {
            if !survivors.is_empty() {
                let write = match destination.write_batch(&survivors).await {
                    Ok(write) => write,
                    Err(e) => {
                        let rejected = survivors.len() as u64;
                        self.absorb_after_commit(e, ctx, outcome)?;
                        self.count_batch(ctx, batch_len, transformed, failed + rejected, outcome);
                        return Ok(());
                    }
                };
                outcome.written += write.records_written;
                if !write.is_successful {
                    let rejected = survivors.len().saturating_sub(write.records_written) as u64;
                    failed += rejected;
                    let detail = if write.errors.is_empty() {
                        "write rejected".to_string()
                    } else {
                        write.errors.join("; ")
                    };
                    warn!(stage_id = %self.id, destination = destination.name(), rejected, "⚠️ Destination rejected records");
                    ctx.add_error(
                        ExecutionIssue::new(format!("destination '{}' rejected {} records", destination.name(), rejected))
                            .with_source(self.source_label())
                            .with_detail(&detail),
                    );
                    outcome.errors.push(detail);
                }
            }
        } else {
            outcome.produced.extend(survivors);
        }

        self.count_batch(ctx, batch_len, transformed, failed, outcome);
        Ok(())
    }

    /// Statistics are only counted once a batch is settled, so a retried
    /// attempt does not count the same records again.
    fn count_batch(
        &self,
        ctx: &ExecutionContext,
        processed: u64,
        transformed: u64,
        failed: u64,
        outcome: &mut BatchOutcome,
    ) {
        ctx.record_processed(processed);
        if !self.processors.is_empty() {
            ctx.record_transformed(transformed);
        }
        metrics::records::processed(processed);
        if failed > 0 {
            ctx.record_failed(failed);
            metrics::records::failed(failed);
        }
        outcome.processed += processed;
        outcome.failed += failed;
    }

    async fn input_batches(&self, ctx: &ExecutionContext, carried: Vec<Record>) -> Result<BatchStream> {
        let batch_size = self.batch_size.max(1);
        match &self.source {
            Some(source) => source.read_batch(batch_size, ctx.cancellation()).await,
            None => {
                let batches: Vec<Result<Vec<Record>>> =
                    carried.chunks(batch_size).map(|chunk| Ok(chunk.to_vec())).collect();
                Ok(stream::iter(batches).boxed())
            }
        }
    }

    async fn run(&self, ctx: &ExecutionContext, carried: Vec<Record>) -> Result<BatchOutcome> {
        let mut batches = self.input_batches(ctx, carried).await?;
        let mut outcome = BatchOutcome::default();
        let mut offset = 0usize;

        while let Some(batch) = batches.next().await {
            ctx.ensure_not_cancelled()?;
            if ctx.error_limit_reached() {
                warn!(stage_id = %self.id, errors = ctx.error_count(), "⏹️ Error limit reached, stopping stage");
                break;
            }
            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => {
                    self.absorb_after_commit(e, ctx, &mut outcome)?;
                    break;
                }
            };
            let len = batch.len();
            debug!(stage_id = %self.id, offset, records = len, "Processing batch");
            if let Err(e) = self.process_batch(batch, offset, ctx, &mut outcome).await {
                self.absorb_after_commit(e, ctx, &mut outcome)?;
            }
            if outcome.halted {
                break;
            }
            offset += len;
        }
        // a source stream ends quietly on cancellation
        ctx.ensure_not_cancelled()?;
        Ok(outcome)
    }
}

#[async_trait]
impl Stage for RecordStage {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn stage_type(&self) -> StageType {
        self.stage_type
    }

    async fn prepare(&self, ctx: &ExecutionContext) -> Result<()> {
        if let Some(source) = &self.source {
            let schema = source.schema().await?;
            debug!(stage_id = %self.id, source = source.name(), fields = schema.fields.len(), "Publishing source schema");
            if let Some(estimate) = source.estimated_record_count().await? {
                debug!(stage_id = %self.id, estimate, "Source record estimate");
            }
            ctx.set_schema(schema);
        }
        if let Some(destination) = &self.destination {
            destination.prepare(ctx.schema().as_ref()).await?;
            self.destination_prepared.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<StageExecutionResult> {
        info!("🔄 Running stage '{}' ({} processors)", self.name, self.processors.len());

        let carried = if self.source.is_none() {
            ctx.take_dataset()
        } else {
            Vec::new()
        };
        let restore = carried.clone();

        let outcome = match self.run(ctx, carried).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // leave the input in place for a retry
                if self.source.is_none() {
                    ctx.set_dataset(restore);
                }
                return Err(e);
            }
        };

        let produced = outcome.produced.len();
        if self.destination.is_none() {
            ctx.set_dataset(outcome.produced);
        }

        let message = format!(
            "Stage '{}' completed: {} records processed, {} failed, {} carried forward",
            self.name, outcome.processed, outcome.failed, produced
        );
        if outcome.failed == 0 && outcome.errors.is_empty() {
            info!("✅ {}", message);
        } else {
            warn!("⚠️ {}", message);
        }
        let failure_messages = if outcome.failed > 0 && outcome.errors.is_empty() {
            vec![format!("{} records failed", outcome.failed)]
        } else {
            outcome.errors
        };
        Ok(StageExecutionResult::with_errors(
            outcome.processed,
            outcome.failed,
            failure_messages,
            message,
        ))
    }

    async fn cleanup(&self, _ctx: &ExecutionContext) -> Result<()> {
        if self.destination_prepared.swap(false, Ordering::SeqCst) {
            if let Some(destination) = &self.destination {
                destination.finalize().await?;
                debug!(stage_id = %self.id, destination = destination.name(), "Destination finalized");
            }
        }
        Ok(())
    }

    fn validate(&self, ctx: &ExecutionContext) -> ValidationResult {
        let mut result = ValidationResult::new();
        if self.batch_size == 0 {
            result.error("batch_size must be at least 1");
        }
        if self.parallelism == Some(0) {
            result.error("parallelism must be at least 1");
        }
        if self.source.is_none() && self.destination.is_none() && self.processors.is_empty() {
            result.warning("stage has no source, destination or processors");
        }
        for processor in &self.processors {
            result.merge_scoped(&processor.name(), processor.validate(ctx));
        }
        result
    }
}
