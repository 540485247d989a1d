//! Error types for the orchestration engine
//!
//! Provides a structured error hierarchy using thiserror. Every error carries
//! a retryability flag and a suggested HTTP status, so a host HTTP adapter can
//! map it to a response without re-deriving the taxonomy.

use std::collections::HashMap;
use thiserror::Error;

/// The error kind taxonomy. Mirrors the classification a host adapter uses to
/// pick an HTTP status and decide whether mechanical retry is safe.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("validation")]
    Validation,
    #[error("authentication")]
    Authentication,
    #[error("authorization")]
    Authorization,
    #[error("network")]
    Network,
    #[error("timeout")]
    Timeout,
    #[error("rate limit")]
    RateLimit,
    #[error("transformation")]
    Transformation,
    #[error("configuration")]
    Configuration,
    #[error("internal")]
    Internal,
    #[error("external")]
    External,
    #[error("cancelled")]
    Cancelled,
}

impl ErrorKind {
    /// Whether this kind is mechanically retryable by default.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::RateLimit | ErrorKind::External
        )
    }

    /// Suggested HTTP status for a host adapter (spec §7 table).
    pub fn status_hint(self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::Authentication => 401,
            ErrorKind::Authorization => 403,
            ErrorKind::Network => 503,
            ErrorKind::Timeout => 408,
            ErrorKind::RateLimit => 429,
            ErrorKind::Transformation => 422,
            ErrorKind::Configuration => 500,
            ErrorKind::Internal => 500,
            ErrorKind::External => 502,
            ErrorKind::Cancelled => 499,
        }
    }
}

/// The engine's error type. Every variant carries a stable kind, a human
/// message, optional structured context, and an optional chained cause.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{kind}: {message}")]
    Typed {
        kind: ErrorKind,
        message: String,
        details: Option<String>,
        context: HashMap<String, serde_json::Value>,
        #[source]
        cause: Option<Box<EngineError>>,
    },

    #[error("step '{step_name}' failed: {cause}")]
    StepFailure {
        step_name: String,
        #[source]
        cause: Box<EngineError>,
    },

    #[error("retry exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last_error: Box<EngineError>,
    },

    #[error("required sub-step '{name}' failed: {cause}")]
    RequiredStepFailed {
        name: String,
        #[source]
        cause: Box<EngineError>,
    },

    #[error("template error: {0}")]
    Template(String),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("type mismatch for key '{key}': expected {expected}, found {found}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("execution cancelled: {0}")]
    Cancelled(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP transport error: {0}")]
    Reqwest(#[from] reqwest::Error),
}

/// Convenient result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        EngineError::Typed {
            kind,
            message: message.into(),
            details: None,
            context: HashMap::new(),
            cause: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn external(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::External, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn transformation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transformation, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        EngineError::Cancelled(message.into())
    }

    /// Attach structured context (e.g. `target`, `status`) to a typed error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        if let EngineError::Typed { context, .. } = &mut self {
            context.insert(key.into(), value.into());
        }
        self
    }

    pub fn with_cause(mut self, cause: EngineError) -> Self {
        if let EngineError::Typed { cause: slot, .. } = &mut self {
            *slot = Some(Box::new(cause));
        }
        self
    }

    /// Best-effort error kind classification, used by the HTTP adapter and by
    /// retry predicates to decide whether an error is mechanically retryable.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Typed { kind, .. } => *kind,
            EngineError::StepFailure { cause, .. } => cause.kind(),
            EngineError::RetryExhausted { last_error, .. } => last_error.kind(),
            EngineError::RequiredStepFailed { cause, .. } => cause.kind(),
            EngineError::Template(_) => ErrorKind::Validation,
            EngineError::NotFound(_) => ErrorKind::Validation,
            EngineError::TypeMismatch { .. } => ErrorKind::Validation,
            EngineError::Cancelled(_) => ErrorKind::Cancelled,
            EngineError::Json(_) => ErrorKind::Internal,
            EngineError::Reqwest(e) => {
                if e.is_timeout() {
                    ErrorKind::Timeout
                } else {
                    ErrorKind::Network
                }
            }
        }
    }

    pub fn retryable(&self) -> bool {
        self.kind().retryable()
    }

    pub fn status_hint(&self) -> u16 {
        self.kind().status_hint()
    }

    /// Wrap this error as a step failure, preserving the cause chain (§4.3).
    pub fn into_step_failure(self, step_name: impl Into<String>) -> Self {
        EngineError::StepFailure {
            step_name: step_name.into(),
            cause: Box::new(self),
        }
    }
}
