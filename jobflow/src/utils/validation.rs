//! Validation of stage dependency graphs.

use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Why a stage dependency graph is unusable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// A stage name is not a valid key segment.
    #[error("Invalid stage name '{0}'")]
    InvalidName(String),
    /// A stage lists itself as a dependency.
    #[error("Stage '{0}' cannot depend on itself")]
    SelfDependency(String),
    /// A stage depends on a stage that is not registered.
    #[error("Stage '{stage}' depends on unregistered stage '{missing}'")]
    MissingDependency {
        /// The dependent stage.
        stage: String,
        /// The unregistered dependency.
        missing: String,
    },
    /// The dependencies loop back on themselves.
    #[error("Cycle detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

/// Checks a `stage -> dependencies` map and returns a topological order.
///
/// Dependencies come before their dependents in the returned order. Stages
/// are visited in sorted order so the result is stable across runs.
pub fn validate_stage_graph(stages: &HashMap<String, Vec<String>>) -> Result<Vec<String>, GraphError> {
    let mut names: Vec<&String> = stages.keys().collect();
    names.sort();

    for name in &names {
        if !super::is_valid_segment(name) {
            return Err(GraphError::InvalidName((*name).clone()));
        }
        for dep in &stages[*name] {
            if dep == *name {
                return Err(GraphError::SelfDependency(dep.clone()));
            }
            if !stages.contains_key(dep) {
                return Err(GraphError::MissingDependency {
                    stage: (*name).clone(),
                    missing: dep.clone(),
                });
            }
        }
    }

    let mut done = HashSet::new();
    let mut path = Vec::new();
    let mut order = Vec::new();
    for name in names {
        visit(name, stages, &mut done, &mut path, &mut order)?;
    }
    Ok(order)
}

fn visit(
    node: &str,
    stages: &HashMap<String, Vec<String>>,
    done: &mut HashSet<String>,
    path: &mut Vec<String>,
    order: &mut Vec<String>,
) -> Result<(), GraphError> {
    if let Some(start) = path.iter().position(|n| n == node) {
        let mut cycle = path[start..].to_vec();
        cycle.push(node.to_string());
        return Err(GraphError::Cycle(cycle));
    }
    if done.contains(node) {
        return Ok(());
    }

    path.push(node.to_string());
    let mut deps: Vec<&String> = stages.get(node).into_iter().flatten().collect();
    deps.sort();
    for dep in deps {
        visit(dep, stages, done, path, order)?;
    }
    path.pop();

    done.insert(node.to_string());
    order.push(node.to_string());
    Ok(())
}
