//! Collaborator that delegates a stage to an HTTP service.
//!
//! Each invocation is a `POST {base_url}/stages/{stage}` carrying the job
//! key, generation, attempt, inputs and dependency checkpoints. The service
//! answers with one of:
//!
//! ```json
//! {"status": "success", "payload": {...}, "output_refs": {"report": "outputs/..."}}
//! {"status": "retryable", "reason": "rate limited", "retry_after_ms": 5000}
//! {"status": "fatal", "reason": "document is encrypted"}
//! ```
//!
//! Transport errors, `408`, `429` and `5xx` are retryable; any other `4xx`
//! is fatal.

use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use super::{DependencyInput, StageCollaborator, StageOutcome, StageRequest};
use crate::core::{BlobRef, JobInput, JobKey};
use crate::errors::{JobflowError, Result};

#[derive(Debug, Serialize)]
struct WireDependency<'a> {
    data_ref: &'a BlobRef,
    content_hash: &'a str,
    version: u32,
    payload: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    job_key: &'a JobKey,
    stage: &'a str,
    generation: u32,
    attempt: u32,
    input_refs: &'a JobInput,
    dependencies: BTreeMap<&'a str, Option<WireDependency<'a>>>,
}

impl<'a> WireRequest<'a> {
    fn from_request(request: &'a StageRequest) -> Self {
        let dependencies = request
            .dependencies
            .iter()
            .map(|(name, input)| {
                let wire = match input {
                    DependencyInput::Present { checkpoint, payload } => Some(WireDependency {
                        data_ref: &checkpoint.data_ref,
                        content_hash: &checkpoint.content_hash,
                        version: checkpoint.version,
                        payload: serde_json::from_slice(payload).ok(),
                    }),
                    DependencyInput::Absent => None,
                };
                (name.as_str(), wire)
            })
            .collect();
        Self {
            job_key: &request.job_key,
            stage: &request.stage,
            generation: request.generation,
            attempt: request.attempt,
            input_refs: &request.input_refs,
            dependencies,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum WireOutcome {
    Success {
        #[serde(default)]
        payload: serde_json::Value,
        #[serde(default)]
        output_refs: BTreeMap<String, BlobRef>,
        #[serde(default)]
        metadata: HashMap<String, serde_json::Value>,
    },
    Retryable {
        reason: String,
        #[serde(default)]
        retry_after_ms: Option<u64>,
    },
    Fatal {
        reason: String,
    },
}

impl From<WireOutcome> for StageOutcome {
    fn from(wire: WireOutcome) -> Self {
        match wire {
            WireOutcome::Success {
                payload,
                output_refs,
                metadata,
            } => Self::Success {
                payload: payload.to_string().into_bytes(),
                output_refs,
                metadata,
            },
            WireOutcome::Retryable {
                reason,
                retry_after_ms,
            } => Self::Retryable {
                reason,
                retry_after: retry_after_ms.map(Duration::from_millis),
            },
            WireOutcome::Fatal { reason } => Self::Fatal { reason },
        }
    }
}

/// Classifies a non-success HTTP status.
fn classify_status(status: StatusCode, body: &str, retry_after: Option<Duration>) -> StageOutcome {
    let reason = format!("stage service returned {status}: {body}");
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        StageOutcome::Retryable { reason, retry_after }
    } else {
        StageOutcome::fatal(reason)
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Runs stages by calling a remote stage service.
#[derive(Debug, Clone)]
pub struct HttpCollaborator {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpCollaborator {
    /// Creates a collaborator for the service at `base_url`.
    ///
    /// `timeout` bounds each HTTP request; the executor's stage timeout
    /// still applies on top.
    pub fn new(base_url: impl AsRef<str>, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url.as_ref())
            .map_err(|e| JobflowError::Config(format!("invalid stage service URL: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(JobflowError::Config(format!(
                "stage service URL '{base_url}' cannot carry paths"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| JobflowError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, base_url })
    }

    fn stage_url(&self, stage: &str) -> Option<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut().ok()?.pop_if_empty().extend(["stages", stage]);
        Some(url)
    }
}

#[async_trait]
impl StageCollaborator for HttpCollaborator {
    async fn invoke(&self, request: StageRequest) -> StageOutcome {
        let Some(url) = self.stage_url(&request.stage) else {
            return StageOutcome::fatal("stage service URL cannot carry paths");
        };
        let response = match self
            .client
            .post(url)
            .json(&WireRequest::from_request(&request))
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(stage = %request.stage, error = %err, "Stage service unreachable");
                return StageOutcome::retryable(format!("stage service request failed: {err}"));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(&response);
            let body = response.text().await.unwrap_or_default();
            return classify_status(status, &body, retry_after);
        }
        match response.json::<WireOutcome>().await {
            Ok(wire) => wire.into(),
            Err(err) => StageOutcome::fatal(format!("malformed stage service response: {err}")),
        }
    }
}
