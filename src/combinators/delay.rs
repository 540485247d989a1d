//! Delay combinator (spec §4.7): a cancellable sleep that never outlives the
//! execution's cancellation handle.

use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::step::Step;
use async_trait::async_trait;
use std::time::Duration;

pub struct Delay {
    name: String,
    description: String,
    duration: Duration,
}

impl Delay {
    pub fn new(name: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            duration,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[async_trait]
impl Step for Delay {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<(), EngineError> {
        tokio::select! {
            _ = tokio::time::sleep(self.duration) => Ok(()),
            _ = ctx.cancelled() => Err(ctx.cancellation_error()),
        }
    }
}
