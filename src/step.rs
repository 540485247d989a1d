//! The `Step` primitive (spec §4.2): the single execution capability every
//! combinator, the HTTP step, the cache step, and the aggregation step are
//! built from.

use crate::context::ExecutionContext;
use crate::error::EngineError;
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Anything that can run against an `ExecutionContext` and either mutate it
/// in place or fail. A step's `name()` is used in error wrapping (§4.3) and
/// metrics; `description()` is documentation only and never affects
/// behavior.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<(), EngineError>;
}

/// A type-erased, cloneable handle to a step, used throughout the builder
/// and combinators so flows can be assembled as plain `Vec<ArcStep>`.
pub type ArcStep = Arc<dyn Step>;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Adapts a plain async closure into a [`Step`], preserving the
/// caller-supplied name (spec §4.4's naming rule: steps built from functions
/// are named by the builder call site, not derived from the closure).
pub struct FnStep<F> {
    name: String,
    description: String,
    f: F,
}

impl<F> FnStep<F>
where
    F: for<'a> Fn(&'a ExecutionContext) -> BoxFuture<'a, Result<(), EngineError>> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            f,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[async_trait]
impl<F> Step for FnStep<F>
where
    F: for<'a> Fn(&'a ExecutionContext) -> BoxFuture<'a, Result<(), EngineError>> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<(), EngineError> {
        (self.f)(ctx).await
    }
}

/// Helper for building an `ArcStep` from an async closure without spelling
/// out the boxed-future type at every call site.
pub fn step_fn<Fut>(
    name: impl Into<String>,
    f: impl Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
) -> ArcStep
where
    Fut: Future<Output = Result<(), EngineError>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(FnStep::new(name, move |ctx: &ExecutionContext| {
        let f = f.clone();
        let ctx = ctx.clone();
        Box::pin(async move { f(ctx).await }) as BoxFuture<'_, Result<(), EngineError>>
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    #[tokio::test]
    async fn fn_step_preserves_caller_provided_name() {
        let step = step_fn("greet", |ctx| async move {
            ctx.set("greeted", true);
            Ok(())
        });
        assert_eq!(step.name(), "greet");

        let ctx = ExecutionContext::new("flow", Arc::new(EngineConfig::default()), None);
        step.run(&ctx).await.unwrap();
        assert!(ctx.get_bool("greeted").unwrap());
    }
}
