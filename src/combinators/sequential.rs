//! Sequential combinator (spec §4.3): runs child steps in order against the
//! shared context, stopping on the first failure.

use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::step::{ArcStep, Step};
use async_trait::async_trait;

pub struct Sequential {
    name: String,
    description: String,
    steps: Vec<ArcStep>,
}

impl Sequential {
    pub fn new(name: impl Into<String>, steps: Vec<ArcStep>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            steps,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[async_trait]
impl Step for Sequential {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<(), EngineError> {
        for step in &self.steps {
            if ctx.is_cancelled() {
                return Err(ctx.cancellation_error());
            }
            tracing::debug!(step = step.name(), "step started");
            let step_start = std::time::Instant::now();
            let result = step.run(ctx).await;
            let elapsed = step_start.elapsed().as_secs_f64();
            crate::telemetry::record_step_execution(step.name(), result.is_ok(), elapsed);
            match &result {
                Ok(()) => tracing::debug!(step = step.name(), "step completed"),
                Err(e) => tracing::debug!(step = step.name(), error = %e, "step failed"),
            }
            result.map_err(|e| e.into_step_failure(step.name()))?;
        }
        Ok(())
    }
}
