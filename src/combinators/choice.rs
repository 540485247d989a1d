//! Choice combinator (spec §4.4): evaluates predicate-ordered branches,
//! running the first whose predicate is true, falling back to an
//! `otherwise` step if none match.

use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::predicate::FieldPredicate;
use crate::step::{ArcStep, Step};
use async_trait::async_trait;

pub struct ChoiceBranch {
    pub predicate: FieldPredicate,
    pub step: ArcStep,
}

pub struct Choice {
    name: String,
    description: String,
    branches: Vec<ChoiceBranch>,
    otherwise: Option<ArcStep>,
}

impl Choice {
    pub fn new(name: impl Into<String>, branches: Vec<ChoiceBranch>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            branches,
            otherwise: None,
        }
    }

    pub fn with_otherwise(mut self, otherwise: ArcStep) -> Self {
        self.otherwise = Some(otherwise);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[async_trait]
impl Step for Choice {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<(), EngineError> {
        let data = ctx.snapshot();

        for branch in &self.branches {
            if branch.predicate.evaluate(&data) {
                return branch
                    .step
                    .run(ctx)
                    .await
                    .map_err(|e| e.into_step_failure(branch.step.name()));
            }
        }

        if let Some(otherwise) = &self.otherwise {
            return otherwise
                .run(ctx)
                .await
                .map_err(|e| e.into_step_failure(otherwise.name()));
        }

        Ok(())
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
    async fn picks_first_matching_branch_in_order() {
        let context = ctx();
        context.set("tier", "gold");

        let gold_step = step_fn("gold", |ctx| async move {
            ctx.set("picked", "gold");
            Ok(())
        });
        let silver_step = step_fn("silver", |ctx| async move {
            ctx.set("picked", "silver");
            Ok(())
        });

        let choice = Choice::new(
            "choice",
            vec![
                ChoiceBranch {
                    predicate: FieldPredicate::new("tier", Operator::Equals, Some(json!("gold"))),
                    step: gold_step,
                },
                ChoiceBranch {
                    predicate: FieldPredicate::new("tier", Operator::Equals, Some(json!("silver"))),
                    step: silver_step,
                },
            ],
        );
        choice.run(&context).await.unwrap();
        assert_eq!(context.get_string("picked").unwrap(), "gold");
    }

    #[tokio::test]
    async fn falls_back_to_otherwise() {
        let context = ctx();
        context.set("tier", "bronze");

        let gold_step = step_fn("gold", |ctx| async move {
            ctx.set("picked", "gold");
            Ok(())
        });
        let otherwise = step_fn("otherwise", |ctx| async move {
            ctx.set("picked", "otherwise");
            Ok(())
        });

        let choice = Choice::new(
            "choice",
            vec![ChoiceBranch {
                predicate: FieldPredicate::new("tier", Operator::Equals, Some(json!("gold"))),
                step: gold_step,
            }],
        )
        .with_otherwise(otherwise);

        choice.run(&context).await.unwrap();
        assert_eq!(context.get_string("picked").unwrap(), "otherwise");
    }
}
