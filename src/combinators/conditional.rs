//! Conditional combinator (spec §4.4): runs one of two branches based on a
//! field predicate, or no-ops if the predicate is false and no else-branch
//! was given.

use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::predicate::FieldPredicate;
use crate::step::{ArcStep, Step};
use async_trait::async_trait;

pub struct Conditional {
    name: String,
    description: String,
    predicate: FieldPredicate,
    then_step: ArcStep,
    else_step: Option<ArcStep>,
}

impl Conditional {
    pub fn new(name: impl Into<String>, predicate: FieldPredicate, then_step: ArcStep) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            predicate,
            then_step,
            else_step: None,
        }
    }

    pub fn with_else(mut self, else_step: ArcStep) -> Self {
        self.else_step = Some(else_step);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[async_trait]
impl Step for Conditional {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<(), EngineError> {
        let data = ctx.snapshot();
        if self.predicate.evaluate(&data) {
            self.then_step
                .run(ctx)
                .await
                .map_err(|e| e.into_step_failure(self.then_step.name()))
        } else if let Some(else_step) = &self.else_step {
            else_step
                .run(ctx)
                .await
                .map_err(|e| e.into_step_failure(else_step.name()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::predicate::Operator;
    use crate::step::step_fn;
    use serde_json::json;
    use std::sync::Arc;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("flow", Arc::new(EngineConfig::default()), None)
    }

    #[tokio::test]
    async fn runs_then_branch_when_predicate_true() {
        let context = ctx();
        context.set("role", "admin");
        let then_step = step_fn("then", |ctx| async move {
            ctx.set("ran", "then");
            Ok(())
        });
        let predicate = FieldPredicate::new("role", Operator::Equals, Some(json!("admin")));
        let cond = Conditional::new("cond", predicate, then_step);
        cond.run(&context).await.unwrap();
        assert_eq!(context.get_string("ran").unwrap(), "then");
    }

    #[tokio::test]
    async fn noop_when_predicate_false_and_no_else() {
        let context = ctx();
        context.set("role", "guest");
        let then_step = step_fn("then", |ctx| async move {
            ctx.set("ran", "then");
            Ok(())
        });
        let predicate = FieldPredicate::new("role", Operator::Equals, Some(json!("admin")));
        let cond = Conditional::new("cond", predicate, then_step);
        cond.run(&context).await.unwrap();
        assert!(!context.contains("ran"));
    }
}
