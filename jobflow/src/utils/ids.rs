//! Identifier generation and validation.

use chrono::Utc;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use uuid::Uuid;

/// Generates a new UUID v4.
#[must_use]
pub fn generate_uuid() -> Uuid {
    Uuid::new_v4()
}

/// Generates a job id of the form `job_YYYYMMDDHHMMSSmmm_xxxxxxxx`.
///
/// The timestamp prefix makes ids sort by creation time; the random suffix
/// keeps two ids minted in the same millisecond distinct.
#[must_use]
pub fn generate_job_id() -> String {
    let stamp = Utc::now().format("%Y%m%d%H%M%S%3f");
    let suffix = Uuid::new_v4().simple().to_string();
    format!("job_{stamp}_{}", &suffix[..8])
}

fn job_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^job_\d{17}(_[0-9a-f]{8})?$").expect("job id pattern is valid")
    })
}

fn segment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._\-]{0,127}$").expect("segment pattern is valid")
    })
}

/// Returns true if `job_id` has the generated format.
#[must_use]
pub fn is_valid_job_id(job_id: &str) -> bool {
    job_id_pattern().is_match(job_id)
}

/// Returns true if `segment` can be used as a tenant, client or stage name.
///
/// Segments end up inside composite keys and blob paths, so `#`, `/` and
/// whitespace are rejected.
#[must_use]
pub fn is_valid_segment(segment: &str) -> bool {
    segment_pattern().is_match(segment)
}

/// Creates a correlation id for one pickup of a job.
#[must_use]
pub fn correlation_id(job_id: &str) -> String {
    let short = Uuid::new_v4().simple().to_string();
    format!("{job_id}-{}", &short[..8])
}

/// Hex-encoded SHA-256 of a byte slice.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
