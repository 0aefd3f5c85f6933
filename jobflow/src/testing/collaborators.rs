//! Stage collaborators with scripted behavior.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

use crate::core::BlobRef;
use crate::executor::{StageCollaborator, StageOutcome, StageRequest};

/// A collaborator that replays scripted outcomes and records every call.
///
/// Once the script is exhausted it succeeds with a deterministic payload and
/// a single artifact `"{stage}"` pointing at `outputs/{job_id}/{stage}.json`,
/// so two runs of the same job produce identical output references.
#[derive(Debug, Default)]
pub struct ScriptedCollaborator {
    script: Mutex<VecDeque<StageOutcome>>,
    calls: Mutex<Vec<StageRequest>>,
    delay: Option<Duration>,
}

impl ScriptedCollaborator {
    /// Creates a collaborator that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a collaborator that returns `outcomes` first.
    #[must_use]
    pub fn scripted(outcomes: impl IntoIterator<Item = StageOutcome>) -> Self {
        Self {
            script: Mutex::new(outcomes.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Creates a collaborator that keeps failing transiently.
    #[must_use]
    pub fn always_retryable(reason: &str, times: usize) -> Self {
        Self::scripted((0..times).map(|_| StageOutcome::retryable(reason)))
    }

    /// Sleeps for `delay` before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of invocations so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Every request received, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<StageRequest> {
        self.calls.lock().clone()
    }

    /// The success a request receives once the script is exhausted.
    #[must_use]
    pub fn default_outcome(request: &StageRequest) -> StageOutcome {
        let inputs: Vec<&str> = request
            .dependencies
            .iter()
            .filter(|(_, input)| input.is_present())
            .map(|(name, _)| name.as_str())
            .collect();
        let payload = serde_json::json!({
            "stage": request.stage,
            "generation": request.generation,
            "inputs": inputs,
        });
        StageOutcome::success(payload.to_string()).with_output(
            request.stage.clone(),
            BlobRef::new(format!("outputs/{}/{}.json", request.job_key.job_id, request.stage)),
        )
    }
}

#[async_trait]
impl StageCollaborator for ScriptedCollaborator {
    async fn invoke(&self, request: StageRequest) -> StageOutcome {
        self.calls.lock().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| Self::default_outcome(&request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{JobInput, JobKey};
    use std::collections::BTreeMap;

    fn request(stage: &str) -> StageRequest {
        StageRequest {
            job_key: JobKey::new("acme", "c1", "job_20250101120000123").unwrap(),
            stage: stage.to_string(),
            generation: 1,
            attempt: 1,
            input_refs: JobInput::new(BlobRef::new("in/doc.pdf")),
            dependencies: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_script_then_default() {
        let collaborator = ScriptedCollaborator::scripted([StageOutcome::fatal("nope")]);
        assert_eq!(collaborator.invoke(request("extract")).await, StageOutcome::fatal("nope"));

        let StageOutcome::Success { output_refs, .. } = collaborator.invoke(request("extract")).await else {
            panic!("expected success once the script is exhausted");
        };
        assert_eq!(
            output_refs["extract"],
            BlobRef::new("outputs/job_20250101120000123/extract.json")
        );
        assert_eq!(collaborator.call_count(), 2);
    }
}
