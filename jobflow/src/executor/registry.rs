//! Stage definitions and the collaborators that run them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::StageCollaborator;
use crate::errors::ValidationError;
use crate::pipeline::RetryConfig;
use crate::utils::validate_stage_graph;

/// Timeout for stages without an explicit one.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(300);

/// Static description of a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDefinition {
    /// Stage name, as used in plans and checkpoint keys.
    pub name: String,
    /// Stages whose outputs this stage reads.
    pub dependencies: Vec<String>,
    /// Upper bound for one collaborator invocation.
    pub timeout: Duration,
    /// Stage-specific retry budget, overriding the executor default.
    pub retry: Option<RetryConfig>,
}

impl StageDefinition {
    /// Creates a definition with no dependencies and the default timeout.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            timeout: DEFAULT_STAGE_TIMEOUT,
            retry: None,
        }
    }

    /// Sets the dependencies.
    #[must_use]
    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the invocation timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets a stage-specific retry budget.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Definitions of the document-analysis stages.
    #[must_use]
    pub fn builtin() -> Vec<Self> {
        vec![
            Self::new("pdf_processing").with_timeout(Duration::from_secs(120)),
            Self::new("context_processing")
                .with_dependencies(["pdf_processing"])
                .with_timeout(Duration::from_secs(180)),
            Self::new("drawing_analysis")
                .with_dependencies(["pdf_processing", "context_processing"])
                .with_timeout(Duration::from_secs(600)),
            Self::new("excel_generation")
                .with_dependencies(["drawing_analysis"])
                .with_timeout(Duration::from_secs(300)),
            Self::new("evaluation")
                .with_dependencies(["pdf_processing", "drawing_analysis", "excel_generation"])
                .with_timeout(Duration::from_secs(240)),
        ]
    }
}

/// A definition paired with its collaborator.
#[derive(Clone)]
pub struct RegisteredStage {
    /// Static description.
    pub definition: StageDefinition,
    /// Code that runs the stage.
    pub collaborator: Arc<dyn StageCollaborator>,
}

impl std::fmt::Debug for RegisteredStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredStage")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

/// Name-indexed set of executable stages.
#[derive(Debug, Clone, Default)]
pub struct StageRegistry {
    stages: HashMap<String, RegisteredStage>,
}

impl StageRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stage, replacing any stage of the same name.
    pub fn register(&mut self, definition: StageDefinition, collaborator: Arc<dyn StageCollaborator>) {
        let name = definition.name.clone();
        if self
            .stages
            .insert(name.clone(), RegisteredStage { definition, collaborator })
            .is_some()
        {
            tracing::debug!(stage = %name, "Replaced stage registration");
        }
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with_stage(mut self, definition: StageDefinition, collaborator: Arc<dyn StageCollaborator>) -> Self {
        self.register(definition, collaborator);
        self
    }

    /// Looks up a stage.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RegisteredStage> {
        self.stages.get(name)
    }

    /// Returns true if `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.stages.contains_key(name)
    }

    /// Registered stage names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.stages.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Checks the dependency graph and returns a topological order.
    pub fn validate(&self) -> Result<Vec<String>, ValidationError> {
        let graph: HashMap<String, Vec<String>> = self
            .stages
            .iter()
            .map(|(name, stage)| (name.clone(), stage.definition.dependencies.clone()))
            .collect();
        validate_stage_graph(&graph).map_err(|err| ValidationError::new("stages", err.to_string()))
    }

    /// Checks that a plan is executable by this registry.
    ///
    /// Every stage must be registered, and every dependency that appears in
    /// the plan must appear before its dependent. Dependencies outside the
    /// plan are allowed; they reach the collaborator as absent.
    pub fn check_plan(&self, plan: &[String]) -> Result<(), ValidationError> {
        for (idx, stage) in plan.iter().enumerate() {
            let registered = self
                .get(stage)
                .ok_or_else(|| ValidationError::new("stage_plan", format!("stage '{stage}' is not registered")))?;
            for dep in &registered.definition.dependencies {
                if plan[idx..].contains(dep) {
                    return Err(ValidationError::new(
                        "stage_plan",
                        format!("stage '{stage}' runs before its dependency '{dep}'"),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{MockStageCollaborator, StageOutcome};
    use crate::pipeline::PipelineCatalog;

    fn noop() -> Arc<dyn StageCollaborator> {
        let mut mock = MockStageCollaborator::new();
        mock.expect_invoke().returning(|_| StageOutcome::success(*b"{}"));
        Arc::new(mock)
    }

    fn builtin_registry() -> StageRegistry {
        StageDefinition::builtin()
            .into_iter()
            .fold(StageRegistry::new(), |registry, def| registry.with_stage(def, noop()))
    }

    #[test]
    fn test_builtin_timeouts() {
        let defs = StageDefinition::builtin();
        let timeout = |name: &str| defs.iter().find(|d| d.name == name).unwrap().timeout;
        assert_eq!(timeout("pdf_processing"), Duration::from_secs(120));
        assert_eq!(timeout("drawing_analysis"), Duration::from_secs(600));
        assert_eq!(timeout("evaluation"), Duration::from_secs(240));
    }

    #[test]
    fn test_builtin_graph_is_valid() {
        let order = builtin_registry().validate().unwrap();
        assert_eq!(order.first().map(String::as_str), Some("pdf_processing"));
        assert_eq!(order.len(), 5);
    }

    #[test]
    fn test_every_builtin_pipeline_is_executable() {
        let registry = builtin_registry();
        for plan in PipelineCatalog::default().pipelines.values() {
            registry.check_plan(plan).unwrap();
        }
    }

    #[test]
    fn test_check_plan_rejects_bad_order_and_unknown_stage() {
        let registry = builtin_registry();
        let reversed = vec!["excel_generation".to_string(), "drawing_analysis".to_string()];
        assert!(registry.check_plan(&reversed).is_err());

        let unknown = vec!["pdf_processing".to_string(), "ocr".to_string()];
        assert!(registry.check_plan(&unknown).is_err());
    }

    #[test]
    fn test_cycle_rejected() {
        let registry = StageRegistry::new()
            .with_stage(StageDefinition::new("a").with_dependencies(["b"]), noop())
            .with_stage(StageDefinition::new("b").with_dependencies(["a"]), noop());
        let err = registry.validate().unwrap_err();
        assert!(err.message.contains("Cycle"));
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = StageRegistry::new();
        registry.register(StageDefinition::new("a"), noop());
        registry.register(StageDefinition::new("a").with_timeout(Duration::from_secs(1)), noop());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a").unwrap().definition.timeout, Duration::from_secs(1));
        assert_eq!(registry.names(), vec!["a"]);
    }
}
