//! Pipeline routing: input shape plus optional named choice to a stage plan.
//!
//! Named pipelines are data. The router is the only component that reads
//! the catalog; once a plan is frozen on a job record the catalog can change
//! without affecting it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::JobInput;
use crate::errors::ValidationError;

/// Pipeline used when the caller names none (or an unknown one).
pub const DEFAULT_PIPELINE: &str = "full_analysis";

/// Stage that consumes the secondary context document.
pub const CONTEXT_STAGE: &str = "context_processing";

fn stages(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| (*name).to_string()).collect()
}

fn default_pipeline_name() -> String {
    DEFAULT_PIPELINE.to_string()
}

fn default_context_stage() -> Option<String> {
    Some(CONTEXT_STAGE.to_string())
}

fn builtin_pipelines() -> BTreeMap<String, Vec<String>> {
    BTreeMap::from([
        (
            "full_analysis".to_string(),
            stages(&[
                "pdf_processing",
                "context_processing",
                "drawing_analysis",
                "excel_generation",
                "evaluation",
            ]),
        ),
        (
            "extraction_only".to_string(),
            stages(&["pdf_processing", "drawing_analysis", "excel_generation"]),
        ),
        (
            "analysis_without_evaluation".to_string(),
            stages(&[
                "pdf_processing",
                "context_processing",
                "drawing_analysis",
                "excel_generation",
            ]),
        ),
    ])
}

/// Lookup table of named pipelines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineCatalog {
    /// Pipeline name to ordered stage names.
    #[serde(default = "builtin_pipelines")]
    pub pipelines: BTreeMap<String, Vec<String>>,
    /// Pipeline applied by the default policy.
    #[serde(default = "default_pipeline_name")]
    pub default_pipeline: String,
    /// Stage dropped by the default policy when no context is supplied.
    #[serde(default = "default_context_stage")]
    pub context_stage: Option<String>,
}

impl Default for PipelineCatalog {
    fn default() -> Self {
        Self {
            pipelines: builtin_pipelines(),
            default_pipeline: default_pipeline_name(),
            context_stage: default_context_stage(),
        }
    }
}

impl PipelineCatalog {
    /// Adds or replaces a named pipeline.
    #[must_use]
    pub fn with_pipeline<I, S>(mut self, name: impl Into<String>, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pipelines
            .insert(name.into(), stages.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the default pipeline.
    #[must_use]
    pub fn with_default(mut self, name: impl Into<String>) -> Self {
        self.default_pipeline = name.into();
        self
    }

    /// Sets the context-consuming stage.
    #[must_use]
    pub fn with_context_stage(mut self, stage: Option<String>) -> Self {
        self.context_stage = stage;
        self
    }

    /// Checks that every pipeline is usable as a frozen plan.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.pipelines.contains_key(&self.default_pipeline) {
            return Err(ValidationError::new(
                "default_pipeline",
                format!("'{}' is not in the catalog", self.default_pipeline),
            ));
        }
        for (name, plan) in &self.pipelines {
            if plan.is_empty() {
                return Err(ValidationError::new("pipelines", format!("'{name}' has no stages")));
            }
            for (idx, stage) in plan.iter().enumerate() {
                if !crate::utils::is_valid_segment(stage) {
                    return Err(ValidationError::new(
                        "pipelines",
                        format!("'{name}' has invalid stage name '{stage}'"),
                    ));
                }
                if plan[..idx].contains(stage) {
                    return Err(ValidationError::new(
                        "pipelines",
                        format!("'{name}' lists '{stage}' twice"),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// How a plan was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteSource {
    /// The caller named a pipeline in the catalog.
    Named,
    /// The default policy was applied.
    Default,
}

/// An ordered stage plan, ready to be frozen on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePlan {
    /// Pipeline the plan was derived from.
    pub pipeline: String,
    /// Ordered stage names.
    pub stages: Vec<String>,
    /// How the plan was chosen.
    pub source: RouteSource,
}

/// Pure function from input shape and optional choice to a plan.
#[derive(Debug, Clone, Default)]
pub struct PipelineRouter {
    catalog: PipelineCatalog,
}

impl PipelineRouter {
    /// Creates a router over a validated catalog.
    pub fn new(catalog: PipelineCatalog) -> Result<Self, ValidationError> {
        catalog.validate()?;
        Ok(Self { catalog })
    }

    /// The catalog in use.
    #[must_use]
    pub fn catalog(&self) -> &PipelineCatalog {
        &self.catalog
    }

    /// Names of the catalog's pipelines.
    pub fn pipeline_names(&self) -> impl Iterator<Item = &str> {
        self.catalog.pipelines.keys().map(String::as_str)
    }

    /// Chooses the stage plan for `input`.
    ///
    /// A recognized `choice` is used verbatim. Otherwise the default
    /// pipeline is used, minus the context stage when the input carries no
    /// secondary context.
    #[must_use]
    pub fn route(&self, input: &JobInput, choice: Option<&str>) -> StagePlan {
        if let Some(name) = choice {
            if let Some(plan) = self.catalog.pipelines.get(name) {
                return StagePlan {
                    pipeline: name.to_string(),
                    stages: plan.clone(),
                    source: RouteSource::Named,
                };
            }
            tracing::warn!(pipeline = name, "Unknown pipeline requested, applying default policy");
        }

        let default = &self.catalog.default_pipeline;
        let mut plan = self
            .catalog
            .pipelines
            .get(default)
            .cloned()
            .unwrap_or_default();
        if !input.has_context() {
            if let Some(context_stage) = &self.catalog.context_stage {
                plan.retain(|stage| stage != context_stage);
            }
        }
        StagePlan {
            pipeline: default.clone(),
            stages: plan,
            source: RouteSource::Default,
        }
    }
}
