use async_trait::async_trait;
use etl_core::{ExecutionContext, Result};
use std::future::Future;

use crate::pipeline::stage::{Stage, StageExecutionResult, StageType};

/// A stage whose `execute` is a closure. Handy for glue steps and tests.
pub struct FnStage<F> {
    id: String,
    name: String,
    stage_type: StageType,
    run: F,
}

impl<F, Fut> FnStage<F>
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageExecutionResult>> + Send + 'static,
{
    pub fn new(id: impl Into<String>, stage_type: StageType, run: F) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            stage_type,
            run,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl<F, Fut> Stage for FnStage<F>
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageExecutionResult>> + Send + 'static,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn stage_type(&self) -> StageType {
        self.stage_type
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<StageExecutionResult> {
        (self.run)(ctx.clone()).await
    }
}
