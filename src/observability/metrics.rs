//! Metrics for the ETL engine.
//!
//! Recording goes through the `metrics` facade. The engine installs no
//! recorder, so these calls are no-ops until the embedding process installs
//! one.

use std::fmt;

/// All metric names used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Pipeline metrics
    PipelineExecutionsStarted,
    PipelineExecutionsCompleted,
    PipelineExecutionsFailed,
    PipelineExecutionsCancelled,
    PipelineDuration,

    // Stage metrics
    StagesCompleted,
    StagesFailed,
    StagesSkipped,
    StageRetries,
    StageDuration,

    // Rule metrics
    RulesApplied,
    RulesFailed,

    // Mapping metrics
    MappingRecordsMapped,
    MappingRecordsFailed,

    // Record metrics
    RecordsProcessed,
    RecordsFailed,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::PipelineExecutionsStarted => "etl_pipeline_executions_started_total",
            MetricName::PipelineExecutionsCompleted => "etl_pipeline_executions_completed_total",
            MetricName::PipelineExecutionsFailed => "etl_pipeline_executions_failed_total",
            MetricName::PipelineExecutionsCancelled => "etl_pipeline_executions_cancelled_total",
            MetricName::PipelineDuration => "etl_pipeline_duration_seconds",

            MetricName::StagesCompleted => "etl_stages_completed_total",
            MetricName::StagesFailed => "etl_stages_failed_total",
            MetricName::StagesSkipped => "etl_stages_skipped_total",
            MetricName::StageRetries => "etl_stage_retries_total",
            MetricName::StageDuration => "etl_stage_duration_seconds",

            MetricName::RulesApplied => "etl_rules_applied_total",
            MetricName::RulesFailed => "etl_rules_failed_total",

            MetricName::MappingRecordsMapped => "etl_mapping_records_mapped_total",
            MetricName::MappingRecordsFailed => "etl_mapping_records_failed_total",

            MetricName::RecordsProcessed => "etl_records_processed_total",
            MetricName::RecordsFailed => "etl_records_failed_total",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Pipeline Metrics
// ============================================================================

pub mod pipeline {
    use super::MetricName;

    pub fn execution_started(pipeline_id: &str) {
        ::metrics::counter!(MetricName::PipelineExecutionsStarted.as_str(), "pipeline_id" => pipeline_id.to_string())
            .increment(1);
    }

    pub fn execution_completed(pipeline_id: &str) {
        ::metrics::counter!(MetricName::PipelineExecutionsCompleted.as_str(), "pipeline_id" => pipeline_id.to_string())
            .increment(1);
    }

    pub fn execution_failed(pipeline_id: &str) {
        ::metrics::counter!(MetricName::PipelineExecutionsFailed.as_str(), "pipeline_id" => pipeline_id.to_string())
            .increment(1);
    }

    pub fn execution_cancelled(pipeline_id: &str) {
        ::metrics::counter!(MetricName::PipelineExecutionsCancelled.as_str(), "pipeline_id" => pipeline_id.to_string())
            .increment(1);
    }

    /// Record wall-clock duration of a run
    pub fn duration(pipeline_id: &str, secs: f64) {
        ::metrics::histogram!(MetricName::PipelineDuration.as_str(), "pipeline_id" => pipeline_id.to_string())
            .record(secs);
    }
}

// ============================================================================
// Stage Metrics
// ============================================================================

pub mod stage {
    use super::MetricName;

    pub fn completed(stage_id: &str, secs: f64) {
        ::metrics::counter!(MetricName::StagesCompleted.as_str(), "stage_id" => stage_id.to_string()).increment(1);
        ::metrics::histogram!(MetricName::StageDuration.as_str(), "stage_id" => stage_id.to_string()).record(secs);
    }

    pub fn failed(stage_id: &str) {
        ::metrics::counter!(MetricName::StagesFailed.as_str(), "stage_id" => stage_id.to_string()).increment(1);
    }

    pub fn skipped(stage_id: &str) {
        ::metrics::counter!(MetricName::StagesSkipped.as_str(), "stage_id" => stage_id.to_string()).increment(1);
    }

    pub fn retried(stage_id: &str) {
        ::metrics::counter!(MetricName::StageRetries.as_str(), "stage_id" => stage_id.to_string()).increment(1);
    }
}

// ============================================================================
// Rule Metrics
// ============================================================================

pub mod rules {
    use super::MetricName;

    pub fn applied(rule_id: &str) {
        ::metrics::counter!(MetricName::RulesApplied.as_str(), "rule_id" => rule_id.to_string()).increment(1);
    }

    pub fn failed(rule_id: &str) {
        ::metrics::counter!(MetricName::RulesFailed.as_str(), "rule_id" => rule_id.to_string()).increment(1);
    }
}

// ============================================================================
// Mapping Metrics
// ============================================================================

pub mod mapping {
    use super::MetricName;

    pub fn records_mapped(mapper: &str, count: u64) {
        ::metrics::counter!(MetricName::MappingRecordsMapped.as_str(), "mapper" => mapper.to_string()).increment(count);
    }

    pub fn records_failed(mapper: &str, count: u64) {
        ::metrics::counter!(MetricName::MappingRecordsFailed.as_str(), "mapper" => mapper.to_string()).increment(count);
    }
}

// ============================================================================
// Record Metrics
// ============================================================================

pub mod records {
    use super::MetricName;

    pub fn processed(count: u64) {
        ::metrics::counter!(MetricName::RecordsProcessed.as_str()).increment(count);
    }

    pub fn failed(count: u64) {
        ::metrics::counter!(MetricName::RecordsFailed.as_str()).increment(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_are_prefixed() {
        for name in [
            MetricName::PipelineDuration,
            MetricName::RulesApplied,
            MetricName::RecordsProcessed,
        ] {
            assert!(name.as_str().starts_with("etl_"));
            assert_eq!(name.to_string(), name.as_str());
        }
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        pipeline::execution_started("p1");
        stage::completed("s1", 0.5);
        rules::applied("r1");
        mapping::records_mapped("m1", 3);
        records::processed(3);
    }
}
