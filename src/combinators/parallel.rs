//! Parallel combinator (spec §4.4): forks the context once per sibling,
//! runs every sibling concurrently, merges successful forks' bags back into
//! the parent (last-merge-wins on key conflict), and discards a sibling's
//! bag entirely on failure. Waits for every sibling to finish even after the
//! first failure, then reports the first error encountered in registration
//! order.

use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::step::{ArcStep, Step};
use async_trait::async_trait;

pub struct Parallel {
    name: String,
    description: String,
    steps: Vec<ArcStep>,
}

impl Parallel {
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
impl Step for Parallel {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<(), EngineError> {
        let mut handles = Vec::with_capacity(self.steps.len());

        for step in &self.steps {
            let fork = ctx.fork();
            let step = step.clone();
            handles.push(tokio::spawn(async move {
                let result = step.run(&fork).await.map_err(|e| e.into_step_failure(step.name()));
                (fork, result)
            }));
        }

        let mut first_error: Option<EngineError> = None;
        let mut merges: Vec<std::collections::HashMap<String, serde_json::Value>> = Vec::new();

        for handle in handles {
            match handle.await {
                Ok((fork, Ok(()))) => merges.push(fork.snapshot()),
                Ok((_, Err(e))) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(join_err) => {
                    if first_error.is_none() {
                        first_error = Some(EngineError::internal(format!(
                            "parallel sibling task panicked: {join_err}"
                        )));
                    }
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }

        // Last-merge-wins: later siblings (registration order) overwrite
        // earlier ones on key conflict.
        for snapshot in merges {
            for (key, value) in snapshot {
                ctx.set(key, value);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::step::step_fn;
    use std::sync::Arc;
    use std::time::Duration;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("flow", Arc::new(EngineConfig::default()), None)
    }

    #[tokio::test]
    async fn merges_successful_siblings_last_wins() {
        let a = step_fn("a", |ctx| async move {
            ctx.set("shared", "from_a");
            ctx.set("a_only", "a");
            Ok(())
        });
        let b = step_fn("b", |ctx| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            ctx.set("shared", "from_b");
            ctx.set("b_only", "b");
            Ok(())
        });
        let parallel = Parallel::new("p", vec![a, b]);
        let context = ctx();
        parallel.run(&context).await.unwrap();

        assert_eq!(context.get_string("shared").unwrap(), "from_b");
        assert_eq!(context.get_string("a_only").unwrap(), "a");
        assert_eq!(context.get_string("b_only").unwrap(), "b");
    }

    #[tokio::test]
    async fn discards_bag_on_failure_and_waits_for_all() {
        let a = step_fn("a", |ctx| async move {
            ctx.set("a_ran", true);
            Err(EngineError::validation("boom"))
        });
        let completed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let completed2 = completed.clone();
        let b = step_fn("b", move |ctx| {
            let completed2 = completed2.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                ctx.set("b_ran", true);
                completed2.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
        });
        let parallel = Parallel::new("p", vec![a, b]);
        let context = ctx();
        let err = parallel.run(&context).await.unwrap_err();

        assert!(err.to_string().contains("a"));
        assert!(completed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!context.contains("a_ran"));
        assert!(!context.contains("b_ran"));
    }
}
