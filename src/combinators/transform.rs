//! Transform combinator (spec §4.8): an opaque synchronous function bridge
//! from one or more context values to a new value stored under a target key.

use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::step::Step;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

type TransformFn = Arc<dyn Fn(&ExecutionContext) -> Result<Value, EngineError> + Send + Sync>;

pub struct Transform {
    name: String,
    description: String,
    target_key: String,
    f: TransformFn,
}

impl Transform {
    pub fn new(
        name: impl Into<String>,
        target_key: impl Into<String>,
        f: impl Fn(&ExecutionContext) -> Result<Value, EngineError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            target_key: target_key.into(),
            f: Arc::new(f),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[async_trait]
impl Step for Transform {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<(), EngineError> {
        let value = (self.f)(ctx).map_err(|e| match e {
            EngineError::Typed { kind, .. } if kind == crate::error::ErrorKind::Transformation => e,
            other => EngineError::transformation(other.to_string()).with_cause(other),
        })?;
        ctx.set(self.target_key.clone(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use serde_json::json;

    #[tokio::test]
    async fn maps_input_to_target_key() {
        let ctx = ExecutionContext::new("flow", Arc::new(EngineConfig::default()), None);
        ctx.set("first_name", "Ada");
        ctx.set("last_name", "Lovelace");

        let transform = Transform::new("full_name", "full_name", |ctx| {
            let first = ctx.get_string("first_name")?;
            let last = ctx.get_string("last_name")?;
            Ok(json!(format!("{first} {last}")))
        });

        transform.run(&ctx).await.unwrap();
        assert_eq!(ctx.get_string("full_name").unwrap(), "Ada Lovelace");
    }

    #[tokio::test]
    async fn propagation_errors_become_transformation_errors() {
        let ctx = ExecutionContext::new("flow", Arc::new(EngineConfig::default()), None);
        let transform = Transform::new("bad", "out", |ctx| {
            ctx.get_string("missing").map(|s| json!(s))
        });
        let err = transform.run(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transformation);
    }
}
