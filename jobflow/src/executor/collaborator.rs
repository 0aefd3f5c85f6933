//! The seam between the engine and the code that does a stage's work.
//!
//! Collaborators wrap external providers (document parsers, model APIs,
//! spreadsheet writers). They never touch checkpoints or job records; the
//! executor owns persistence and classifies the outcome.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::core::{BlobRef, Checkpoint, JobInput, JobKey};

/// Output of an earlier stage as seen by a dependent stage.
#[derive(Debug, Clone, PartialEq)]
pub enum DependencyInput {
    /// The dependency ran in this generation and its payload was verified.
    Present {
        /// Checkpoint that holds the output.
        checkpoint: Checkpoint,
        /// Verified payload bytes.
        payload: Vec<u8>,
    },
    /// The dependency is not part of the plan or has no checkpoint yet.
    Absent,
}

impl DependencyInput {
    /// Payload bytes, if the dependency ran.
    #[must_use]
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Self::Present { payload, .. } => Some(payload),
            Self::Absent => None,
        }
    }

    /// Returns true if the dependency ran.
    #[must_use]
    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present { .. })
    }
}

/// Everything a collaborator receives for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct StageRequest {
    /// Job being processed.
    pub job_key: JobKey,
    /// Stage to run.
    pub stage: String,
    /// Job generation the output will be recorded under.
    pub generation: u32,
    /// Invocation number within this execution, starting at 1.
    pub attempt: u32,
    /// Uploaded inputs of the job.
    pub input_refs: JobInput,
    /// Outputs of the declared dependencies.
    pub dependencies: BTreeMap<String, DependencyInput>,
}

impl StageRequest {
    /// Output of `stage`, or `Absent` if it is not a declared dependency.
    #[must_use]
    pub fn dependency(&self, stage: &str) -> &DependencyInput {
        self.dependencies.get(stage).unwrap_or(&DependencyInput::Absent)
    }
}

/// What a collaborator reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// The stage produced output.
    Success {
        /// Serialized stage output, checkpointed verbatim.
        payload: Vec<u8>,
        /// Artifacts written by the collaborator.
        output_refs: BTreeMap<String, BlobRef>,
        /// Provider metadata (model, token counts).
        metadata: HashMap<String, serde_json::Value>,
    },
    /// The provider failed in a way that may clear up (rate limit, 5xx, timeout).
    Retryable {
        /// Provider-supplied reason.
        reason: String,
        /// Provider-suggested wait before the next attempt.
        retry_after: Option<Duration>,
    },
    /// The stage cannot succeed for this input (auth failure, malformed document).
    Fatal {
        /// Provider-supplied reason.
        reason: String,
    },
}

impl StageOutcome {
    /// A success carrying only a payload.
    #[must_use]
    pub fn success(payload: impl Into<Vec<u8>>) -> Self {
        Self::Success {
            payload: payload.into(),
            output_refs: BTreeMap::new(),
            metadata: HashMap::new(),
        }
    }

    /// A retryable failure without a wait hint.
    #[must_use]
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::Retryable {
            reason: reason.into(),
            retry_after: None,
        }
    }

    /// A fatal failure.
    #[must_use]
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    /// Adds an artifact to a success; other outcomes are returned unchanged.
    #[must_use]
    pub fn with_output(mut self, name: impl Into<String>, blob: BlobRef) -> Self {
        if let Self::Success { output_refs, .. } = &mut self {
            output_refs.insert(name.into(), blob);
        }
        self
    }
}

/// Performs the work of one stage.
///
/// Implementations must be safe to invoke more than once for the same
/// request: the engine guarantees at-least-once invocation, not exactly-once.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StageCollaborator: Send + Sync {
    /// Runs the stage.
    async fn invoke(&self, request: StageRequest) -> StageOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_output_only_touches_success() {
        let ok = StageOutcome::success(*b"{}").with_output("excel", BlobRef::new("out/a.xlsx"));
        let StageOutcome::Success { output_refs, .. } = ok else {
            panic!("expected success");
        };
        assert_eq!(output_refs.len(), 1);

        let failed = StageOutcome::fatal("bad pdf").with_output("excel", BlobRef::new("out/a.xlsx"));
        assert_eq!(failed, StageOutcome::fatal("bad pdf"));
    }

    #[test]
    fn test_missing_dependency_is_absent() {
        let request = StageRequest {
            job_key: JobKey::generate("acme", "c1").unwrap(),
            stage: "excel_generation".to_string(),
            generation: 1,
            attempt: 1,
            input_refs: JobInput::new(BlobRef::new("in/doc.pdf")),
            dependencies: BTreeMap::new(),
        };
        assert!(!request.dependency("context_processing").is_present());
        assert_eq!(request.dependency("context_processing").payload(), None);
    }
}
