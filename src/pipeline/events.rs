//! Pipeline lifecycle events.
//!
//! The orchestrator emits onto a tokio broadcast channel at each transition.
//! Emitting never blocks; slow subscribers lag and lose the oldest events.

use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::execution::ExecutionStatus;
use super::stage::StageStatus;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1_024;

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    PipelineStarted {
        execution_id: Uuid,
        pipeline_id: String,
        pipeline_name: String,
    },
    StageFinished {
        execution_id: Uuid,
        pipeline_id: String,
        stage_id: String,
        status: StageStatus,
    },
    PipelinePaused {
        execution_id: Uuid,
        pipeline_id: String,
    },
    PipelineResumed {
        execution_id: Uuid,
        pipeline_id: String,
    },
    PipelineCompleted {
        execution_id: Uuid,
        pipeline_id: String,
        records_processed: u64,
    },
    PipelineFailed {
        execution_id: Uuid,
        pipeline_id: String,
        errors: Vec<String>,
    },
    PipelineCancelled {
        execution_id: Uuid,
        pipeline_id: String,
    },
}

impl PipelineEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::PipelineStarted { .. } => "pipeline_started",
            PipelineEvent::StageFinished { .. } => "stage_finished",
            PipelineEvent::PipelinePaused { .. } => "pipeline_paused",
            PipelineEvent::PipelineResumed { .. } => "pipeline_resumed",
            PipelineEvent::PipelineCompleted { .. } => "pipeline_completed",
            PipelineEvent::PipelineFailed { .. } => "pipeline_failed",
            PipelineEvent::PipelineCancelled { .. } => "pipeline_cancelled",
        }
    }

    pub fn execution_id(&self) -> Uuid {
        match self {
            PipelineEvent::PipelineStarted { execution_id, .. }
            | PipelineEvent::StageFinished { execution_id, .. }
            | PipelineEvent::PipelinePaused { execution_id, .. }
            | PipelineEvent::PipelineResumed { execution_id, .. }
            | PipelineEvent::PipelineCompleted { execution_id, .. }
            | PipelineEvent::PipelineFailed { execution_id, .. }
            | PipelineEvent::PipelineCancelled { execution_id, .. } => *execution_id,
        }
    }

    pub fn pipeline_id(&self) -> &str {
        match self {
            PipelineEvent::PipelineStarted { pipeline_id, .. }
            | PipelineEvent::StageFinished { pipeline_id, .. }
            | PipelineEvent::PipelinePaused { pipeline_id, .. }
            | PipelineEvent::PipelineResumed { pipeline_id, .. }
            | PipelineEvent::PipelineCompleted { pipeline_id, .. }
            | PipelineEvent::PipelineFailed { pipeline_id, .. }
            | PipelineEvent::PipelineCancelled { pipeline_id, .. } => pipeline_id,
        }
    }

    /// The terminal status this event reports, if any.
    pub fn terminal_status(&self) -> Option<ExecutionStatus> {
        match self {
            PipelineEvent::PipelineCompleted { .. } => Some(ExecutionStatus::Completed),
            PipelineEvent::PipelineFailed { .. } => Some(ExecutionStatus::Failed),
            PipelineEvent::PipelineCancelled { .. } => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }
}

pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Fire-and-forget; dropped when nobody is subscribed.
    pub fn emit(&self, event: PipelineEvent) {
        debug!(
            event_type = event.event_type(),
            execution_id = %event.execution_id(),
            pipeline_id = event.pipeline_id(),
            "Emitting pipeline event"
        );
        let _ = self.tx.send(event);
    }

    /// Receives events emitted after subscription.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let execution_id = Uuid::new_v4();
        bus.emit(PipelineEvent::PipelineCancelled {
            execution_id,
            pipeline_id: "p".into(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.execution_id(), execution_id);
        assert_eq!(event.terminal_status(), Some(ExecutionStatus::Cancelled));
    }

    #[test]
    fn test_emit_without_subscribers_is_ok() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(PipelineEvent::PipelinePaused {
            execution_id: Uuid::new_v4(),
            pipeline_id: "p".into(),
        });
    }
}
