//! Utility functions for identifiers, hashing and timestamps.

mod ids;
pub mod timestamps;
mod validation;

pub use ids::{
    content_hash, correlation_id, generate_job_id, generate_uuid, is_valid_job_id,
    is_valid_segment,
};
pub use timestamps::{
    days_from_now, format_iso8601, is_expired, iso_timestamp, next_after, now_utc,
    parse_timestamp, Timestamp,
};
pub use validation::{validate_stage_graph, GraphError};
