//! Pipeline routing and retry policy.
//!
//! This module provides:
//! - The catalog of named pipelines and the router that freezes a plan
//! - The retry budget applied to transient stage failures

mod retry;
mod router;

pub use retry::{
    should_retry, BackoffStrategy, JitterStrategy, RetryConfig, RetryDecision, RetryState,
};
pub use router::{
    PipelineCatalog, PipelineRouter, RouteSource, StagePlan, CONTEXT_STAGE, DEFAULT_PIPELINE,
};
