//! HTTP step (spec §4.9): calls an upstream HTTP API with interpolated
//! url/headers/body, captures `{status, headers, body}` under a configurable
//! key, and supports retry, per-step timeout, response transformation,
//! validation, and fallback data on terminal failure.
//!
//! The "Mobile" mixin (spec §4.9) is [`MobileHttpStep`]: preset headers, a
//! bearer token, a field-projection transformer, and an integrated
//! read-through cache.

use crate::cache::Cache;
use crate::constants::{is_sensitive_key, DEFAULT_HTTP_SAVE_AS, DEFAULT_RETRY_STATUSES};
use crate::context::ExecutionContext;
use crate::error::{EngineError, ErrorKind};
use crate::interpolation::interpolate;
use crate::telemetry::record_fallback_used;
use async_trait::async_trait;
use reqwest::Method;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use crate::step::Step;

type Transformer = Arc<dyn Fn(&Value) -> Result<Value, EngineError> + Send + Sync>;
type Validator = Arc<dyn Fn(&Value) -> Result<(), EngineError> + Send + Sync>;

/// Recursively interpolate every string leaf of a JSON body template.
fn interpolate_value(value: &Value, data: &HashMap<String, Value>) -> Result<Value, EngineError> {
    Ok(match value {
        Value::String(s) => Value::String(interpolate(s, data)?),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(interpolate_value(item, data)?);
            }
            Value::Array(out)
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), interpolate_value(v, data)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

pub struct HttpStepConfig {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub save_as: String,
    pub expected_status: Option<(u16, u16)>,
    pub timeout: Option<Duration>,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub retry_statuses: Vec<u16>,
    pub transformer: Option<Transformer>,
    pub validator: Option<Validator>,
    pub fallback_data: Option<Value>,
}

impl HttpStepConfig {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            save_as: DEFAULT_HTTP_SAVE_AS.to_string(),
            expected_status: Some((200, 299)),
            timeout: None,
            max_retries: 0,
            retry_delay: Duration::from_millis(100),
            retry_statuses: DEFAULT_RETRY_STATUSES.to_vec(),
            transformer: None,
            validator: None,
            fallback_data: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn save_as(mut self, key: impl Into<String>) -> Self {
        self.save_as = key.into();
        self
    }

    pub fn expected_status_range(mut self, low: u16, high: u16) -> Self {
        self.expected_status = Some((low, high));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn transformer(mut self, f: impl Fn(&Value) -> Result<Value, EngineError> + Send + Sync + 'static) -> Self {
        self.transformer = Some(Arc::new(f));
        self
    }

    pub fn validator(mut self, f: impl Fn(&Value) -> Result<(), EngineError> + Send + Sync + 'static) -> Self {
        self.validator = Some(Arc::new(f));
        self
    }

    pub fn fallback_data(mut self, data: Value) -> Self {
        self.fallback_data = Some(data);
        self
    }
}

/// Captured upstream response, stored under `save_as` (spec §4.9).
#[derive(Debug, Clone, serde::Serialize)]
pub struct HttpResponseCapture {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

pub struct HttpStep {
    name: String,
    description: String,
    client: reqwest::Client,
    config: HttpStepConfig,
}

impl HttpStep {
    pub fn new(name: impl Into<String>, client: reqwest::Client, config: HttpStepConfig) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            client,
            config,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Resolve the effective per-attempt timeout: the step's own timeout if
    /// set, otherwise whatever remains of the context's deadline, otherwise
    /// no deadline at all.
    fn effective_timeout(&self, ctx: &ExecutionContext) -> Option<Duration> {
        self.config.timeout.or_else(|| ctx.time_remaining())
    }

    async fn attempt(&self, ctx: &ExecutionContext, data: &HashMap<String, Value>) -> Result<HttpResponseCapture, EngineError> {
        let url = interpolate(&self.config.url, data)?;

        let mut builder = self.client.request(self.config.method.clone(), &url);
        for (name, value_template) in &self.config.headers {
            let value = interpolate(value_template, data)?;
            builder = builder.header(name, value);
        }
        if let Some(body) = &self.config.body {
            let resolved = interpolate_value(body, data)?;
            builder = builder.json(&resolved);
        }
        if let Some(timeout) = self.effective_timeout(ctx) {
            builder = builder.timeout(timeout);
        }

        let send_result = tokio::select! {
            r = builder.send() => r,
            _ = ctx.cancelled() => return Err(ctx.cancellation_error()),
        };

        let response = send_result
            .map_err(classify_reqwest_error)
            .map_err(|e| e.with_context("target", url.clone()))?;
        let status = response.status().as_u16();

        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| {
                let name = k.to_string();
                let value = if is_sensitive_key(&name) {
                    "<redacted>".to_string()
                } else {
                    v.to_str().unwrap_or("").to_string()
                };
                (name, value)
            })
            .collect();

        let bytes = response
            .bytes()
            .await
            .map_err(classify_reqwest_error)
            .map_err(|e| e.with_context("target", url.clone()))?;
        let body: Value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };

        if self.config.retry_statuses.contains(&status) {
            return Err(EngineError::new(ErrorKind::External, format!("upstream returned {status}"))
                .with_context("status", status)
                .with_context("target", url.clone()));
        }

        Ok(HttpResponseCapture { status, headers, body })
    }

    async fn run_with_retry(
        &self,
        ctx: &ExecutionContext,
        data: &HashMap<String, Value>,
    ) -> Result<HttpResponseCapture, EngineError> {
        let total_attempts = 1 + self.config.max_retries;
        let mut last_error = None;

        for attempt in 1..=total_attempts {
            if ctx.is_cancelled() {
                return Err(ctx.cancellation_error());
            }
            match self.attempt(ctx, data).await {
                Ok(capture) => return Ok(capture),
                Err(e) if e.retryable() && attempt < total_attempts => {
                    tracing::warn!(step = %self.name, attempt, error = %e, "http attempt failed, retrying");
                    last_error = Some(e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.retry_delay) => {}
                        _ = ctx.cancelled() => return Err(ctx.cancellation_error()),
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| EngineError::external("http step exhausted with no error recorded")))
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> EngineError {
    if e.is_timeout() {
        EngineError::new(ErrorKind::Timeout, format!("http request timed out: {e}"))
    } else {
        EngineError::new(ErrorKind::Network, format!("http transport error: {e}"))
    }
}

#[async_trait]
impl Step for HttpStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<(), EngineError> {
        let data = ctx.snapshot();

        match self.run_to_completion(ctx, &data).await {
            Ok(()) => Ok(()),
            Err(e) => self.fall_back_or_propagate(ctx, e),
        }
    }
}

impl HttpStep {
    /// Run the request to a final captured response, applying the status
    /// check, validator, and transformer in order. Any failure here,
    /// including retry exhaustion, is terminal and routed through the same
    /// fallback path by the caller (spec §4.9 step 8: "any terminal failure
    /// after retry exhaustion").
    async fn run_to_completion(&self, ctx: &ExecutionContext, data: &HashMap<String, Value>) -> Result<(), EngineError> {
        let capture = self.run_with_retry(ctx, data).await?;

        if let Some((low, high)) = self.config.expected_status {
            if capture.status < low || capture.status > high {
                return Err(EngineError::new(
                    ErrorKind::External,
                    format!("unexpected status {} (expected {low}-{high})", capture.status),
                )
                .with_context("status", capture.status));
            }
        }

        if let Some(validator) = &self.config.validator {
            validator(&capture.body)?;
        }

        let output_body = match &self.config.transformer {
            Some(transformer) => transformer(&capture.body)?,
            None => capture.body.clone(),
        };

        let captured = serde_json::json!({
            "status": capture.status,
            "headers": capture.headers,
            "body": output_body,
        });
        ctx.set(self.config.save_as.clone(), captured);

        Ok(())
    }

    /// On a terminal failure (transport, retry-exhausted status, bad
    /// `expected_status`, failed validator, or failed transformer), use
    /// `fallback_data` if configured; otherwise propagate the error.
    fn fall_back_or_propagate(&self, ctx: &ExecutionContext, e: EngineError) -> Result<(), EngineError> {
        match &self.config.fallback_data {
            Some(fallback) => {
                tracing::warn!(step = %self.name, error = %e, "http step failed terminally, using fallback data");
                record_fallback_used(&self.name);
                ctx.set(format!("{}_fallback_used", self.name), true);
                ctx.set(self.config.save_as.clone(), fallback.clone());
                Ok(())
            }
            None => Err(e),
        }
    }
}

/// Builds a "Mobile" HTTP step: preset device-signal headers
/// (`X-Device-Type`/`X-Platform`/`X-App-Version`, spec §4.9), a bearer
/// token drawn from the context, a field-projection transformer limiting
/// the response to the fields a mobile client needs, and an integrated
/// read-through cache keyed by the resolved URL.
pub struct MobileHttpStepBuilder {
    config: HttpStepConfig,
    project_fields: Option<Vec<String>>,
    cache: Option<(Cache, String, Duration)>,
}

impl MobileHttpStepBuilder {
    /// `device_type`/`platform`/`app_version` are the mobile-client signal
    /// values upstreams key on; they're sent verbatim as the preset headers.
    pub fn new(
        method: Method,
        url: impl Into<String>,
        device_type: impl Into<String>,
        platform: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        let config = HttpStepConfig::new(method, url)
            .header("X-Device-Type", device_type.into())
            .header("X-Platform", platform.into())
            .header("X-App-Version", app_version.into());
        Self {
            config,
            project_fields: None,
            cache: None,
        }
    }

    /// Draw a bearer token from the context bag at the given key and set
    /// the `Authorization` header from it at request time. The header value
    /// is itself an interpolation template, so the token is read fresh from
    /// the live context on every attempt rather than baked in at build time.
    pub fn bearer_token_from(mut self, context_key: impl Into<String>) -> Self {
        let header_value = format!("Bearer ${{{}}}", context_key.into());
        self.config = self.config.header("Authorization", header_value);
        self
    }

    /// Project the response body down to the given top-level fields.
    pub fn project_fields(mut self, fields: Vec<String>) -> Self {
        self.project_fields = Some(fields);
        self
    }

    /// Wrap this step with a read-through cache keyed by `key_template`
    /// (spec §6 `WithCaching(keyTemplate, ttl)`), interpolated against the
    /// context on every call so distinct requests (e.g. different user ids)
    /// land in distinct cache entries.
    pub fn with_cache(mut self, cache: Cache, key_template: impl Into<String>, ttl: Duration) -> Self {
        self.cache = Some((cache, key_template.into(), ttl));
        self
    }

    pub fn config_mut(&mut self) -> &mut HttpStepConfig {
        &mut self.config
    }

    pub fn build(mut self, name: impl Into<String>, client: reqwest::Client) -> Arc<dyn Step> {
        if let Some(fields) = self.project_fields.take() {
            self.config = self.config.transformer(move |body| {
                let Some(obj) = body.as_object() else {
                    return Ok(body.clone());
                };
                let mut projected = Map::with_capacity(fields.len());
                for field in &fields {
                    if let Some(value) = obj.get(field) {
                        projected.insert(field.clone(), value.clone());
                    }
                }
                Ok(Value::Object(projected))
            });
        }

        let name = name.into();
        let base: Arc<dyn Step> = Arc::new(HttpStep::new(name.clone(), client, self.config));

        match self.cache {
            Some((cache, key_template, ttl)) => Arc::new(CachedHttpStep {
                name,
                cache,
                key_template,
                ttl,
                inner: base,
            }),
            None => base,
        }
    }
}

/// Read-through cache wrapper for the Mobile mixin's integrated cache (spec
/// §4.10 integration): a get before the call, short-circuiting on hit; on
/// miss, runs the HTTP call and writes its result back under the same key.
struct CachedHttpStep {
    name: String,
    cache: Cache,
    key_template: String,
    ttl: Duration,
    inner: Arc<dyn Step>,
}

#[async_trait]
impl Step for CachedHttpStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<(), EngineError> {
        let cache_key = interpolate(&self.key_template, &ctx.snapshot())?;
        if let Some(cached) = self.cache.get(&cache_key) {
            ctx.set(DEFAULT_HTTP_SAVE_AS, cached.value);
            crate::telemetry::record_cache_operation("get", "hit");
            return Ok(());
        }
        crate::telemetry::record_cache_operation("get", "miss");

        self.inner.run(ctx).await?;

        if let Some(value) = ctx.get(DEFAULT_HTTP_SAVE_AS) {
            self.cache.set(cache_key, value, self.ttl);
        }
        Ok(())
    }
}
