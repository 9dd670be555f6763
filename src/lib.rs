//! ETL execution engine: staged pipelines, prioritized transformation rules
//! and field mapping, run by an orchestrator with scheduling and lifecycle
//! controls.

pub mod config;
pub mod observability;
pub mod pipeline;

// The shared data model
pub use etl_core;
pub use etl_core::{EtlError, ExecutionContext, Record, Result, Value};
