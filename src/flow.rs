//! Flow and its fluent builder (spec §4.12, §6). Flows are assembled
//! programmatically at process startup — there is no DSL parser — and the
//! resulting `Flow` is immutable and safe to run concurrently from many
//! requests.

use crate::combinators::{Choice, ChoiceBranch, Conditional, Delay, Parallel, Retry, Sequential, Transform};
use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::predicate::FieldPredicate;
use crate::step::{step_fn, ArcStep, Step};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Wraps a step with cross-cutting behavior (logging, metrics, auth checks).
/// Middleware registered first becomes the outermost wrapper, so it sees a
/// request before any later-registered middleware and a response after.
pub trait Middleware: Send + Sync {
    fn wrap(&self, next: ArcStep) -> ArcStep;
}

/// The result of running a flow end to end (spec §4.12).
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub flow_name: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub output: HashMap<String, Value>,
}

/// An immutable, runnable flow. Build one with [`Flow::builder`].
pub struct Flow {
    name: String,
    description: String,
    timeout: Option<Duration>,
    config: Arc<EngineConfig>,
    root: ArcStep,
}

impl Flow {
    pub fn builder(name: impl Into<String>) -> FlowBuilder {
        FlowBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Run this flow against a fresh root context, enforcing the flow-level
    /// timeout (if any) through the single cancellation-handle path shared
    /// by every combinator and step.
    pub async fn execute(&self) -> ExecutionResult {
        let ctx = ExecutionContext::new(self.name.clone(), self.config.clone(), self.timeout);
        self.run_with_context(ctx).await
    }

    /// Run this flow against a caller-seeded context (e.g. one built via
    /// `ExecutionContext::for_request`), still applying the flow's timeout.
    pub async fn execute_with(&self, ctx: ExecutionContext) -> ExecutionResult {
        self.run_with_context(ctx).await
    }

    async fn run_with_context(&self, ctx: ExecutionContext) -> ExecutionResult {
        let start = std::time::Instant::now();

        tracing::info!(
            flow = %self.name,
            execution_id = %ctx.execution_id(),
            "flow execution started"
        );

        let result = if let Some(timeout) = self.timeout {
            let ctx_for_timer = ctx.clone();
            tokio::select! {
                r = self.root.run(&ctx) => r,
                _ = tokio::time::sleep(timeout) => {
                    ctx_for_timer.cancel_for_timeout();
                    Err(ctx_for_timer.cancellation_error())
                }
            }
        } else {
            self.root.run(&ctx).await
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        crate::telemetry::record_flow_execution(&self.name, result.is_ok(), duration_ms as f64 / 1000.0);
        match &result {
            Ok(()) => tracing::info!(
                flow = %self.name,
                execution_id = %ctx.execution_id(),
                duration_ms,
                "flow execution completed"
            ),
            Err(e) => tracing::info!(
                flow = %self.name,
                execution_id = %ctx.execution_id(),
                duration_ms,
                error = %e,
                "flow execution failed"
            ),
        }

        ExecutionResult {
            execution_id: ctx.execution_id(),
            flow_name: self.name.clone(),
            started_at: ctx.start_time(),
            duration_ms,
            success: result.is_ok(),
            error: result.as_ref().err().map(|e| e.to_string()),
            output: ctx.snapshot(),
        }
    }
}

enum CurrentBranch {
    When(FieldPredicate, Vec<ArcStep>),
    Otherwise(Vec<ArcStep>),
}

struct ChoiceFrame {
    name: String,
    branches: Vec<ChoiceBranch>,
    otherwise: Option<ArcStep>,
    current: Option<CurrentBranch>,
}

struct ParallelFrame {
    name: String,
    branches: Vec<ArcStep>,
}

enum Frame {
    Choice(ChoiceFrame),
    Parallel(ParallelFrame),
}

fn steps_to_step(name: &str, mut steps: Vec<ArcStep>) -> ArcStep {
    if steps.len() == 1 {
        steps.pop().unwrap()
    } else {
        Arc::new(Sequential::new(name, steps))
    }
}

/// Fluent builder for [`Flow`]. Mirrors the shape of the combinators it
/// assembles: `.Step`/`.StepFunc` append to the current scope, `.Choice`/
/// `.Parallel` open a nested scope that `.EndChoice`/`.EndParallel` closes.
pub struct FlowBuilder {
    name: String,
    description: String,
    timeout: Option<Duration>,
    config: Arc<EngineConfig>,
    middlewares: Vec<Arc<dyn Middleware>>,
    root: Vec<ArcStep>,
    stack: Vec<Frame>,
}

impl FlowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            timeout: None,
            config: Arc::new(EngineConfig::default()),
            middlewares: Vec::new(),
            root: Vec::new(),
            stack: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_config(mut self, config: Arc<EngineConfig>) -> Self {
        self.config = config;
        self
    }

    /// Register a middleware. First registration becomes the outermost
    /// wrapper once the flow is built.
    pub fn use_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Append a pre-built step to the current scope.
    pub fn step(mut self, step: ArcStep) -> Self {
        self.push_step(step);
        self
    }

    /// Append a step built from an async closure, preserving the given name.
    pub fn step_fn<Fut>(
        self,
        name: impl Into<String>,
        f: impl Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
    ) -> Self
    where
        Fut: Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        let step = step_fn(name, f);
        self.step(step)
    }

    /// Append a transform step (spec §4.8).
    pub fn transform(
        self,
        name: impl Into<String>,
        target_key: impl Into<String>,
        f: impl Fn(&ExecutionContext) -> Result<Value, EngineError> + Send + Sync + 'static,
    ) -> Self {
        let step: ArcStep = Arc::new(Transform::new(name, target_key, f));
        self.step(step)
    }

    /// Append a delay step (spec §4.7).
    pub fn delay(self, name: impl Into<String>, duration: Duration) -> Self {
        let step: ArcStep = Arc::new(Delay::new(name, duration));
        self.step(step)
    }

    /// Wrap the most recently appended step in a retry (spec §4.6). Must
    /// follow the step it applies to.
    pub fn retry(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        let Some(last) = self.current_steps_mut().pop() else {
            return self;
        };
        let name = format!("{}_retry", last.name());
        let wrapped: ArcStep = Arc::new(Retry::new(name, last, max_retries, retry_delay));
        self.current_steps_mut().push(wrapped);
        self
    }

    /// A single-branch conditional: runs `step` only if `predicate` holds.
    pub fn conditional(self, name: impl Into<String>, field: &str, operator: &str, value: Option<Value>, step: ArcStep) -> Self {
        let predicate = FieldPredicate::build(field, operator, value)
            .unwrap_or_else(|e| panic!("invalid predicate in flow builder: {e}"));
        let cond: ArcStep = Arc::new(Conditional::new(name, predicate, step));
        self.step(cond)
    }

    /// Open a choice scope. Populate branches with `.when(...)`, an optional
    /// `.otherwise()`, and close with `.end_choice()`.
    pub fn choice(mut self, name: impl Into<String>) -> Self {
        self.stack.push(Frame::Choice(ChoiceFrame {
            name: name.into(),
            branches: Vec::new(),
            otherwise: None,
            current: None,
        }));
        self
    }

    /// Start a new branch in the innermost open choice scope.
    pub fn when(mut self, field: &str, operator: &str, value: Option<Value>) -> Self {
        let predicate = FieldPredicate::build(field, operator, value)
            .unwrap_or_else(|e| panic!("invalid predicate in flow builder: {e}"));
        match self.stack.last_mut() {
            Some(Frame::Choice(frame)) => {
                Self::close_current_branch(frame);
                frame.current = Some(CurrentBranch::When(predicate, Vec::new()));
            }
            _ => panic!("`when` called outside an open choice scope"),
        }
        self
    }

    /// Start the otherwise branch in the innermost open choice scope.
    pub fn otherwise(mut self) -> Self {
        match self.stack.last_mut() {
            Some(Frame::Choice(frame)) => {
                Self::close_current_branch(frame);
                frame.current = Some(CurrentBranch::Otherwise(Vec::new()));
            }
            _ => panic!("`otherwise` called outside an open choice scope"),
        }
        self
    }

    fn close_current_branch(frame: &mut ChoiceFrame) {
        match frame.current.take() {
            Some(CurrentBranch::When(predicate, steps)) => {
                frame.branches.push(ChoiceBranch {
                    predicate,
                    step: steps_to_step(&frame.name, steps),
                });
            }
            Some(CurrentBranch::Otherwise(steps)) => {
                frame.otherwise = Some(steps_to_step(&frame.name, steps));
            }
            None => {}
        }
    }

    /// Close the innermost choice scope, appending the finished `Choice`
    /// step to the enclosing scope.
    pub fn end_choice(mut self) -> Self {
        match self.stack.pop() {
            Some(Frame::Choice(mut frame)) => {
                Self::close_current_branch(&mut frame);
                let mut choice = Choice::new(frame.name, frame.branches);
                if let Some(otherwise) = frame.otherwise {
                    choice = choice.with_otherwise(otherwise);
                }
                self.push_step(Arc::new(choice));
                self
            }
            _ => panic!("`end_choice` called without a matching `choice`"),
        }
    }

    /// Open a parallel scope. Every `.step`/`.step_fn` call made while this
    /// scope is open becomes a sibling branch; close with `.end_parallel()`.
    pub fn parallel(mut self, name: impl Into<String>) -> Self {
        self.stack.push(Frame::Parallel(ParallelFrame {
            name: name.into(),
            branches: Vec::new(),
        }));
        self
    }

    /// Close the innermost parallel scope, appending the finished
    /// `Parallel` step to the enclosing scope.
    pub fn end_parallel(mut self) -> Self {
        match self.stack.pop() {
            Some(Frame::Parallel(frame)) => {
                let parallel = Parallel::new(frame.name, frame.branches);
                self.push_step(Arc::new(parallel));
                self
            }
            _ => panic!("`end_parallel` called without a matching `parallel`"),
        }
    }

    /// Mutable handle to whichever `Vec<ArcStep>` a new step should land in:
    /// the innermost open scope's collection, or the flow's root sequence.
    fn current_steps_mut(&mut self) -> &mut Vec<ArcStep> {
        match self.stack.last_mut() {
            Some(Frame::Choice(frame)) => match &mut frame.current {
                Some(CurrentBranch::When(_, steps)) => steps,
                Some(CurrentBranch::Otherwise(steps)) => steps,
                None => panic!("step added to a choice scope before `when`/`otherwise`"),
            },
            Some(Frame::Parallel(frame)) => &mut frame.branches,
            None => &mut self.root,
        }
    }

    fn push_step(&mut self, step: ArcStep) {
        self.current_steps_mut().push(step);
    }

    /// Finalize the builder into an immutable, runnable `Flow`.
    pub fn build(self) -> Flow {
        assert!(
            self.stack.is_empty(),
            "flow '{}' built with an unclosed choice/parallel scope",
            self.name
        );

        let mut root = steps_to_step(&self.name, self.root);
        for middleware in self.middlewares.iter().rev() {
            root = middleware.wrap(root);
        }

        Flow {
            name: self.name,
            description: self.description,
            timeout: self.timeout,
            config: self.config,
            root,
        }
    }
}

/// Convenience re-export of the operator-alias parser, so callers building
/// predicates directly (rather than through `.when(...)`) don't need a
/// separate import.
pub use crate::predicate::Operator as PredicateOperator;
