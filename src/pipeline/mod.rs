// Pipeline model and execution: stages, record processing, orchestration

pub mod events;
pub mod execution;
pub mod orchestrator;
pub mod pipeline;
pub mod processing;
pub mod retry;
pub mod schedule;
pub mod stage;
pub mod steps;

// Re-export the types callers build and run pipelines with
pub use events::{EventBus, PipelineEvent};
pub use execution::{ExecutionSnapshot, ExecutionStatus, PipelineExecutionResult};
pub use orchestrator::{OrchestratorSettings, PipelineOrchestrator};
pub use pipeline::{ErrorHandling, Pipeline, PipelineSettings};
pub use retry::RetryPolicy;
pub use schedule::{Schedule, ScheduledJob};
pub use stage::{PipelineStage, Stage, StageExecutionResult, StageStatus, StageType};
pub use steps::{FnStage, Processor, RecordStage};
