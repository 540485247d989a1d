//! Aggregation step (spec §4.11): the BFF pattern — fan out to several
//! required/optional sub-steps, merge their results, and optionally apply a
//! final transformer. Required sub-steps without a fallback fail the whole
//! aggregation; optional sub-steps (or required ones with a fallback) never
//! do. The collected per-sub-step values are what get assembled into
//! `bff_aggregation` and `bff_<name>` — not a status summary.

use crate::constants::DEFAULT_HTTP_SAVE_AS;
use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::step::{ArcStep, Step};
use crate::telemetry::record_fallback_used;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// One sub-step of an aggregation, with its own requiredness and fallback.
pub struct SubStep {
    pub step: ArcStep,
    /// If true, this sub-step's failure (with no fallback) fails the whole
    /// aggregation. Required sub-steps with a fallback degrade gracefully.
    pub required: bool,
    pub fallback: Option<Value>,
}

impl SubStep {
    pub fn required(step: ArcStep) -> Self {
        Self {
            step,
            required: true,
            fallback: None,
        }
    }

    pub fn optional(step: ArcStep) -> Self {
        Self {
            step,
            required: false,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Value) -> Self {
        self.fallback = fallback.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationMode {
    Parallel,
    Sequential,
}

type FinalTransform = Arc<dyn Fn(&Value) -> Result<Value, EngineError> + Send + Sync>;

pub struct AggregationStep {
    name: String,
    description: String,
    sub_steps: Vec<SubStep>,
    mode: AggregationMode,
    fail_fast: bool,
    timeout: Option<Duration>,
    final_transform: Option<FinalTransform>,
}

/// A sub-step's primary outcome: its own name plus either the value it
/// produced (or its fallback) or a terminal error with no fallback to fall
/// back on.
enum Outcome {
    Value(Value),
    Omitted,
    Failed(EngineError),
}

impl AggregationStep {
    pub fn new(name: impl Into<String>, sub_steps: Vec<SubStep>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            sub_steps,
            mode: AggregationMode::Parallel,
            fail_fast: false,
            timeout: None,
            final_transform: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_mode(mut self, mode: AggregationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Bound the whole aggregation (every sub-step, however fanned out) by
    /// `timeout`. Enforced through the same cancellation-handle path as
    /// `failFast` (spec §4.11, §9): a timer races the sub-steps and cancels
    /// the aggregation's own scoped token on expiry, never a second polled
    /// deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_final_transform(
        mut self,
        f: impl Fn(&Value) -> Result<Value, EngineError> + Send + Sync + 'static,
    ) -> Self {
        self.final_transform = Some(Arc::new(f));
        self
    }

    /// Read a sub-step's primary result out of its (forked or shared)
    /// context: the value it wrote under its own name, falling back to
    /// `http_response` (spec §4.11).
    fn primary_value(name: &str, ctx: &ExecutionContext) -> Option<Value> {
        ctx.get(name).or_else(|| ctx.get(DEFAULT_HTTP_SAVE_AS))
    }

    fn resolve_outcome(sub: &SubStep, name: &str, result: Result<(), EngineError>, ctx: &ExecutionContext) -> Outcome {
        match result {
            Ok(()) => match Self::primary_value(name, ctx) {
                Some(value) => Outcome::Value(value),
                None => Outcome::Value(Value::Null),
            },
            Err(e) => match &sub.fallback {
                Some(fallback) => {
                    record_fallback_used(name);
                    Outcome::Value(fallback.clone())
                }
                None if sub.required => Outcome::Failed(e),
                None => Outcome::Omitted,
            },
        }
    }

    /// Fan out every sub-step on its own forked context, racing an optional
    /// overall `timeout` the same way `failFast` races a sibling failure: by
    /// cancelling the shared scoped token (spec §4.11, §9). Successful
    /// siblings' bag snapshots are returned for the caller to merge — but
    /// only once the caller knows the *whole* aggregation didn't end up
    /// failing, matching `combinators::Parallel`'s all-or-nothing merge.
    async fn run_parallel(
        &self,
        ctx: &ExecutionContext,
    ) -> (Vec<(String, Outcome)>, Vec<std::collections::HashMap<String, Value>>) {
        let group_token = ctx.child_cancellation_token();
        let mut handles = Vec::with_capacity(self.sub_steps.len());

        let timer = self.timeout.map(|timeout| {
            let token = group_token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                token.cancel();
            })
        });

        for sub in &self.sub_steps {
            let fork = ctx.fork_with_scope(group_token.clone());
            let step = sub.step.clone();
            handles.push(tokio::spawn(async move {
                let name = step.name().to_string();
                let result = step.run(&fork).await;
                (name, fork, result)
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        let mut merges = Vec::new();
        for (sub, handle) in self.sub_steps.iter().zip(handles) {
            let (name, outcome) = match handle.await {
                Ok((name, fork, result)) => {
                    if result.is_ok() {
                        merges.push(fork.snapshot());
                    }
                    let outcome = Self::resolve_outcome(sub, &name, result, &fork);
                    (name, outcome)
                }
                Err(join_err) => (
                    sub.step.name().to_string(),
                    Outcome::Failed(EngineError::internal(format!("sub-step task panicked: {join_err}"))),
                ),
            };

            if self.fail_fast && matches!(outcome, Outcome::Failed(_)) {
                group_token.cancel();
            }
            outcomes.push((name, outcome));
        }

        if let Some(timer) = timer {
            timer.abort();
        }

        (outcomes, merges)
    }

    async fn run_sequential(&self, ctx: &ExecutionContext) -> Vec<(String, Outcome)> {
        let deadline = self.timeout.map(|d| std::time::Instant::now() + d);
        let mut outcomes = Vec::with_capacity(self.sub_steps.len());
        for sub in &self.sub_steps {
            let name = sub.step.name().to_string();

            if deadline.is_some_and(|d| std::time::Instant::now() >= d) {
                let outcome = Self::resolve_outcome(
                    sub,
                    &name,
                    Err(EngineError::timeout("aggregation timeout elapsed")),
                    ctx,
                );
                outcomes.push((name, outcome));
                break;
            }

            let result = sub.step.run(ctx).await;
            let outcome = Self::resolve_outcome(sub, &name, result, ctx);
            let should_stop = self.fail_fast && matches!(outcome, Outcome::Failed(_));
            outcomes.push((name, outcome));
            if should_stop {
                break;
            }
        }
        outcomes
    }
}

#[async_trait]
impl Step for AggregationStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<(), EngineError> {
        let (outcomes, merges) = match self.mode {
            AggregationMode::Parallel => self.run_parallel(ctx).await,
            AggregationMode::Sequential => (self.run_sequential(ctx).await, Vec::new()),
        };

        let mut result = serde_json::Map::new();
        let mut first_failure = None;

        for (name, outcome) in outcomes {
            match outcome {
                Outcome::Value(value) => {
                    result.insert(name, value);
                }
                Outcome::Omitted => {}
                Outcome::Failed(e) => {
                    if first_failure.is_none() {
                        first_failure = Some(EngineError::RequiredStepFailed {
                            name,
                            cause: Box::new(e),
                        });
                    }
                }
            }
        }

        if let Some(err) = first_failure {
            return Err(err);
        }

        // All-or-nothing, mirroring `combinators::Parallel`: only merge
        // successful siblings' bag snapshots back into the parent once the
        // whole aggregation is known to succeed.
        for snapshot in merges {
            for (key, value) in snapshot {
                ctx.set(key, value);
            }
        }

        let final_value = match &self.final_transform {
            Some(transform) => transform(&Value::Object(result))
                .map_err(|e| EngineError::transformation(e.to_string()).with_cause(e))?,
            None => Value::Object(result),
        };

        ctx.set("bff_aggregation", final_value.clone());
        ctx.set(format!("bff_{}", self.name), final_value);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::step::step_fn;
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("flow", Arc::new(EngineConfig::default()), None)
    }

    #[tokio::test]
    async fn merges_required_and_optional_results() {
        let profile = step_fn("profile", |ctx| async move {
            ctx.set("profile", json!({"name": "Ada"}));
            Ok(())
        });
        let recs = step_fn("recommendations", |ctx| async move {
            ctx.set("recommendations", json!(["a", "b"]));
            Ok(())
        });

        let agg = AggregationStep::new(
            "dashboard",
            vec![SubStep::required(profile), SubStep::optional(recs)],
        );
        let context = ctx();
        agg.run(&context).await.unwrap();

        let summary = context.get_map("bff_aggregation").unwrap();
        assert_eq!(summary.get("profile").unwrap(), &json!({"name": "Ada"}));
        assert_eq!(summary.get("recommendations").unwrap(), &json!(["a", "b"]));
        assert_eq!(context.get("bff_dashboard").unwrap(), Value::Object(summary));
    }

    #[tokio::test]
    async fn required_failure_without_fallback_fails_the_aggregation() {
        let profile = step_fn("profile", |_ctx| async move {
            Err(EngineError::network("upstream down"))
        });
        let agg = AggregationStep::new("dashboard", vec![SubStep::required(profile)]);
        let err = agg.run(&ctx()).await.unwrap_err();
        assert!(matches!(err, EngineError::RequiredStepFailed { name, .. } if name == "profile"));
    }

    #[tokio::test]
    async fn optional_failure_without_fallback_is_omitted() {
        let recs = step_fn("recommendations", |_ctx| async move {
            Err(EngineError::network("upstream down"))
        });
        let agg = AggregationStep::new("dashboard", vec![SubStep::optional(recs)]);
        let context = ctx();
        agg.run(&context).await.unwrap();
        let summary = context.get_map("bff_aggregation").unwrap();
        assert!(!summary.contains_key("recommendations"));
    }

    #[tokio::test]
    async fn required_failure_with_fallback_degrades_gracefully() {
        let profile = step_fn("profile", |_ctx| async move {
            Err(EngineError::network("upstream down"))
        });
        let agg = AggregationStep::new(
            "dashboard",
            vec![SubStep::required(profile).with_fallback(json!({"name": "unknown"}))],
        );
        let context = ctx();
        agg.run(&context).await.unwrap();
        let summary = context.get_map("bff_aggregation").unwrap();
        assert_eq!(summary.get("profile").unwrap(), &json!({"name": "unknown"}));
    }

    /// Scenario S2: required `user` succeeds, optional `posts` fails (with a
    /// fallback) and optional `todos` succeeds — aggregation still succeeds
    /// with the fallback spliced in under its own name.
    #[tokio::test]
    async fn s2_parallel_aggregation_with_optional_fallback() {
        let user = step_fn("user", |ctx| async move {
            ctx.set("user", json!({"id": 1, "name": "Ada"}));
            Ok(())
        });
        let posts = step_fn("posts", |_ctx| async move { Err(EngineError::external("500")) });
        let todos = step_fn("todos", |ctx| async move {
            ctx.set("todos", json!([{"id": 1, "title": "buy milk"}]));
            Ok(())
        });

        let agg = AggregationStep::new(
            "dashboard",
            vec![
                SubStep::required(user),
                SubStep::optional(posts).with_fallback(json!([])),
                SubStep::optional(todos),
            ],
        );
        let context = ctx();
        agg.run(&context).await.unwrap();

        let summary = context.get_map("bff_aggregation").unwrap();
        assert_eq!(summary.get("user").unwrap(), &json!({"id": 1, "name": "Ada"}));
        assert_eq!(summary.get("posts").unwrap(), &json!([]));
        assert_eq!(summary.get("todos").unwrap(), &json!([{"id": 1, "title": "buy milk"}]));
    }

    /// Scenario S3: a required sub-step fails with no fallback — the whole
    /// aggregation fails and siblings' writes never land in the parent.
    #[tokio::test]
    async fn s3_required_failure_aborts_and_discards_sibling_writes() {
        let user = step_fn("user", |_ctx| async move { Err(EngineError::external("500")) });
        let posts = step_fn("posts", |ctx| async move {
            ctx.set("posts", json!(["should not surface"]));
            Ok(())
        });

        let agg = AggregationStep::new("dashboard", vec![SubStep::required(user), SubStep::optional(posts)]);
        let context = ctx();
        let err = agg.run(&context).await.unwrap_err();

        assert!(matches!(err, EngineError::RequiredStepFailed { name, .. } if name == "user"));
        assert!(!context.contains("bff_aggregation"));
        assert!(!context.contains("posts"));
    }

    #[tokio::test]
    async fn sequential_mode_respects_fail_fast() {
        let first = step_fn("first", |_ctx| async move { Err(EngineError::network("down")) });
        let ran_second = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_second2 = ran_second.clone();
        let second = step_fn("second", move |_ctx| {
            let ran_second2 = ran_second2.clone();
            async move {
                ran_second2.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
        });
        let agg = AggregationStep::new("dashboard", vec![SubStep::required(first), SubStep::optional(second)])
            .with_mode(AggregationMode::Sequential)
            .with_fail_fast(true);
        let err = agg.run(&ctx()).await.unwrap_err();
        assert!(matches!(err, EngineError::RequiredStepFailed { .. }));
        assert!(!ran_second.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn parallel_timeout_cancels_a_still_running_sibling() {
        let slow = step_fn("slow", |ctx| async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(5)) => Ok(()),
                _ = ctx.cancelled() => Err(ctx.cancellation_error()),
            }
        });
        let agg = AggregationStep::new("dashboard", vec![SubStep::required(slow)])
            .with_timeout(Duration::from_millis(20));
        let err = agg.run(&ctx()).await.unwrap_err();
        assert!(matches!(err, EngineError::RequiredStepFailed { name, .. } if name == "slow"));
    }

    #[tokio::test]
    async fn sequential_timeout_stops_before_the_next_sub_step() {
        let first = step_fn("first", |_ctx| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        });
        let ran_second = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_second2 = ran_second.clone();
        let second = step_fn("second", move |_ctx| {
            let ran_second2 = ran_second2.clone();
            async move {
                ran_second2.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
        });
        let agg = AggregationStep::new("dashboard", vec![SubStep::optional(first), SubStep::optional(second)])
            .with_mode(AggregationMode::Sequential)
            .with_timeout(Duration::from_millis(5));
        let context = ctx();
        agg.run(&context).await.unwrap();
        assert!(!ran_second.load(std::sync::atomic::Ordering::SeqCst));
    }
}
