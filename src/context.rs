//! The execution context threaded through every step of a flow (spec §3).
//!
//! An `ExecutionContext` bundles a mutable, typed key/value bag with
//! immutable run metadata: execution id, start time, flow name, a tracing
//! span, a cancellation handle, an optional deadline, and a config snapshot.
//! The bag is safe under concurrent readers and writers; the metadata never
//! changes after construction.

use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorKind};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Why the shared cancellation token fired. Both a caller-driven `cancel()`
/// and an elapsed deadline trip the same `CancellationToken`; this lets
/// callers tell the two apart after the fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Timeout,
    Cancelled,
}

/// State shared between an `ExecutionContext` and every fork produced by
/// [`ExecutionContext::fork`]. Forks share cancellation, the deadline, the
/// tracing span, and the config snapshot — only the bag and identity fields
/// are copied (spec §4.4).
struct Shared {
    cancellation: CancellationToken,
    cancel_reason: Mutex<Option<CancelReason>>,
    deadline: Option<Instant>,
    span: tracing::Span,
    config: Arc<EngineConfig>,
}

/// Mutable, typed, concurrency-safe key/value bag plus immutable run
/// metadata. See spec §3 for the full contract.
#[derive(Clone)]
pub struct ExecutionContext {
    bag: Arc<RwLock<HashMap<String, Value>>>,
    execution_id: Uuid,
    start_time: DateTime<Utc>,
    flow_name: Arc<str>,
    shared: Arc<Shared>,
    /// An additional, narrower cancellation scope layered on top of
    /// `shared.cancellation` (e.g. the aggregation step's `failFast` sibling
    /// abort, spec §4.11). Always a child of the root token, so a parent
    /// cancel/timeout still reaches it, but cancelling it never reaches back
    /// up to the parent or to sibling forks outside the scope.
    scope_cancel: Option<CancellationToken>,
}

impl ExecutionContext {
    /// Construct a fresh root context for a new flow execution.
    pub fn new(flow_name: impl Into<Arc<str>>, config: Arc<EngineConfig>, timeout: Option<Duration>) -> Self {
        let deadline = timeout.map(|d| Instant::now() + d);
        Self {
            bag: Arc::new(RwLock::new(HashMap::new())),
            execution_id: Uuid::new_v4(),
            start_time: Utc::now(),
            flow_name: flow_name.into(),
            shared: Arc::new(Shared {
                cancellation: CancellationToken::new(),
                cancel_reason: Mutex::new(None),
                deadline,
                span: tracing::info_span!("flow_execution"),
                config,
            }),
            scope_cancel: None,
        }
    }

    /// Construct a root context seeded from an inbound request, per the
    /// minimal adapter contract: method, path, request id, and route params
    /// land in the bag under `request_method`/`request_path`/`request_id`/
    /// `params` so flows can interpolate against them immediately.
    pub fn for_request(
        flow_name: impl Into<Arc<str>>,
        config: Arc<EngineConfig>,
        timeout: Option<Duration>,
        method: &str,
        path: &str,
        params: HashMap<String, Value>,
    ) -> Self {
        let ctx = Self::new(flow_name, config, timeout);
        {
            let mut bag = ctx.bag.write();
            bag.insert("request_method".to_string(), Value::String(method.to_string()));
            bag.insert("request_path".to_string(), Value::String(path.to_string()));
            bag.insert(
                "request_id".to_string(),
                Value::String(ctx.execution_id.to_string()),
            );
            bag.insert("params".to_string(), Value::Object(params.into_iter().collect()));
        }
        ctx
    }

    /// Fork this context for a parallel sibling (spec §3/§4.4): a fresh
    /// execution id and start time, an independent shallow copy of the bag,
    /// but cancellation, deadline, span, and config are shared with the
    /// parent so a parent-level cancel or timeout reaches every fork.
    pub fn fork(&self) -> Self {
        let snapshot = self.bag.read().clone();
        Self {
            bag: Arc::new(RwLock::new(snapshot)),
            execution_id: Uuid::new_v4(),
            start_time: Utc::now(),
            flow_name: self.flow_name.clone(),
            shared: self.shared.clone(),
            scope_cancel: self.scope_cancel.clone(),
        }
    }

    /// A fresh child cancellation token: cancelled automatically when this
    /// context's own cancellation fires, but cancelling it does not affect
    /// this context or any fork outside the returned token's scope. Used by
    /// the aggregation step to abort its own siblings on `failFast` without
    /// cancelling the enclosing flow (spec §4.11).
    pub fn child_cancellation_token(&self) -> CancellationToken {
        self.shared.cancellation.child_token()
    }

    /// Fork this context for a parallel sibling, layering `scope` as an
    /// additional cancellation source alongside the inherited one.
    pub fn fork_with_scope(&self, scope: CancellationToken) -> Self {
        let mut forked = self.fork();
        forked.scope_cancel = Some(scope);
        forked
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn flow_name(&self) -> &str {
        &self.flow_name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn span(&self) -> &tracing::Span {
        &self.shared.span
    }

    /// Remaining time before the deadline, if one was set. `None` means no
    /// deadline is in effect; `Some(Duration::ZERO)` means it has elapsed.
    pub fn time_remaining(&self) -> Option<Duration> {
        self.shared
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.shared.deadline
    }

    /// Cooperatively cancel this execution and every fork sharing its
    /// `Shared` state. Idempotent.
    pub fn cancel(&self) {
        let mut reason = self.shared.cancel_reason.lock();
        if reason.is_none() {
            *reason = Some(CancelReason::Cancelled);
        }
        self.shared.cancellation.cancel();
    }

    /// Cancel due to an elapsed deadline, distinct from an explicit cancel so
    /// callers can report `ErrorKind::Timeout` instead of `ErrorKind::Cancelled`.
    pub fn cancel_for_timeout(&self) {
        let mut reason = self.shared.cancel_reason.lock();
        if reason.is_none() {
            *reason = Some(CancelReason::Timeout);
        }
        self.shared.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancellation.is_cancelled()
            || self.scope_cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        *self.shared.cancel_reason.lock()
    }

    /// A cancellation future that resolves when this execution (or an
    /// ancestor, or its own narrower scope if any) is cancelled or its
    /// deadline elapses. Steps select on this alongside their own work to
    /// honor cancellation promptly.
    pub async fn cancelled(&self) {
        match &self.scope_cancel {
            Some(scope) => {
                tokio::select! {
                    _ = self.shared.cancellation.cancelled() => {}
                    _ = scope.cancelled() => {}
                }
            }
            None => self.shared.cancellation.cancelled().await,
        }
    }

    /// Resolve the error kind to report for a cancellation observed right
    /// now: `Timeout` if the deadline caused it, `Cancelled` otherwise.
    pub fn cancellation_error(&self) -> EngineError {
        if self.shared.cancellation.is_cancelled() {
            match self.cancel_reason() {
                Some(CancelReason::Timeout) => {
                    return EngineError::new(ErrorKind::Timeout, "execution deadline exceeded");
                }
                _ => return EngineError::cancelled("execution was cancelled"),
            }
        }
        EngineError::cancelled("sibling execution aborted")
    }

    // -- typed bag access -----------------------------------------------

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.bag.write().insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.bag.read().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.bag.write().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.bag.read().contains_key(key)
    }

    pub fn get_string(&self, key: &str) -> Result<String, EngineError> {
        match self.get(key) {
            None => Err(EngineError::NotFound(key.to_string())),
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(EngineError::TypeMismatch {
                key: key.to_string(),
                expected: "string",
                found: value_type_name(&other),
            }),
        }
    }

    pub fn get_int(&self, key: &str) -> Result<i64, EngineError> {
        match self.get(key) {
            None => Err(EngineError::NotFound(key.to_string())),
            Some(Value::Number(n)) if n.is_i64() || n.is_u64() => {
                Ok(n.as_i64().unwrap_or_else(|| n.as_u64().unwrap() as i64))
            }
            Some(other) => Err(EngineError::TypeMismatch {
                key: key.to_string(),
                expected: "int",
                found: value_type_name(&other),
            }),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, EngineError> {
        match self.get(key) {
            None => Err(EngineError::NotFound(key.to_string())),
            Some(Value::Bool(b)) => Ok(b),
            Some(other) => Err(EngineError::TypeMismatch {
                key: key.to_string(),
                expected: "bool",
                found: value_type_name(&other),
            }),
        }
    }

    pub fn get_map(&self, key: &str) -> Result<Map<String, Value>, EngineError> {
        match self.get(key) {
            None => Err(EngineError::NotFound(key.to_string())),
            Some(Value::Object(m)) => Ok(m),
            Some(other) => Err(EngineError::TypeMismatch {
                key: key.to_string(),
                expected: "map",
                found: value_type_name(&other),
            }),
        }
    }

    /// A point-in-time, flattened copy of the bag suitable for interpolation
    /// lookups or as a final result snapshot.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.bag.read().clone()
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "map",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("test-flow", Arc::new(EngineConfig::default()), None)
    }

    #[test]
    fn get_string_round_trips() {
        let c = ctx();
        c.set("name", Value::String("Ada".to_string()));
        assert_eq!(c.get_string("name").unwrap(), "Ada");
    }

    #[test]
    fn missing_key_is_not_found() {
        let c = ctx();
        assert!(matches!(c.get_string("missing"), Err(EngineError::NotFound(_))));
    }

    #[test]
    fn wrong_type_is_type_mismatch() {
        let c = ctx();
        c.set("count", Value::Number(42.into()));
        assert!(matches!(
            c.get_string("count"),
            Err(EngineError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn fork_has_fresh_identity_and_shallow_bag_copy() {
        let parent = ctx();
        parent.set("shared_key", Value::String("v1".to_string()));

        let child = parent.fork();
        assert_ne!(parent.execution_id(), child.execution_id());
        assert_eq!(child.get_string("shared_key").unwrap(), "v1");

        // Mutating the child's bag must not be visible to the parent.
        child.set("shared_key", Value::String("v2".to_string()));
        assert_eq!(parent.get_string("shared_key").unwrap(), "v1");
        assert_eq!(child.get_string("shared_key").unwrap(), "v2");
    }

    #[test]
    fn fork_shares_cancellation_with_parent() {
        let parent = ctx();
        let child = parent.fork();
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn scoped_cancellation_does_not_escape_to_parent_or_other_scopes() {
        let parent = ctx();
        let scope_a = parent.child_cancellation_token();
        let scope_b = parent.child_cancellation_token();
        let fork_a = parent.fork_with_scope(scope_a.clone());
        let fork_b = parent.fork_with_scope(scope_b);

        scope_a.cancel();

        assert!(fork_a.is_cancelled());
        assert!(!fork_b.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn parent_cancellation_still_reaches_a_scoped_fork() {
        let parent = ctx();
        let scope = parent.child_cancellation_token();
        let fork = parent.fork_with_scope(scope);

        parent.cancel();

        assert!(fork.is_cancelled());
    }

    #[test]
    fn cancel_for_timeout_reports_timeout_kind() {
        let c = ctx();
        c.cancel_for_timeout();
        assert_eq!(c.cancellation_error().kind(), ErrorKind::Timeout);
    }

    #[test]
    fn explicit_cancel_reports_cancelled_kind() {
        let c = ctx();
        c.cancel();
        assert_eq!(c.cancellation_error().kind(), ErrorKind::Cancelled);
    }
}
