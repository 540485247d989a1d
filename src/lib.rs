//! An embeddable API orchestration engine for Backend-for-Frontend services.
//!
//! Flows are assembled programmatically at startup from a small set of
//! composable primitives: a typed [`ExecutionContext`](context::ExecutionContext)
//! carried through every [`Step`](step::Step), control-flow
//! [combinators](combinators), an [`HttpStep`](http_step::HttpStep) for
//! calling upstream APIs, a [`Cache`](cache::Cache), and an
//! [`AggregationStep`](aggregation::AggregationStep) for fanning out to
//! several upstreams and merging their results.

pub mod aggregation;
pub mod cache;
pub mod combinators;
pub mod config;
pub mod constants;
pub mod context;
pub mod error;
pub mod flow;
pub mod http_step;
pub mod interpolation;
pub mod predicate;
pub mod step;
pub mod telemetry;

pub use config::EngineConfig;
pub use context::ExecutionContext;
pub use error::{EngineError, ErrorKind, Result};
pub use flow::{ExecutionResult, Flow, FlowBuilder, Middleware};
pub use step::{ArcStep, Step};
