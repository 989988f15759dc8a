use std::collections::HashMap;
use std::path::Path;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use crate::error::{ColoniesError, Result};
use crate::model::process::FunctionSpec;
use crate::model::MAX_DURATION_SECS;

/// Immutable template for a process graph: named function specs whose
/// `conditions.dependencies` form the edge list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub colony_name: String,
    pub function_specs: Vec<FunctionSpec>,
}

/// Problems found while validating a workflow.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowDefect {
    Empty,
    MissingNodeName(usize),
    TimeLimitOutOfRange(String),
    DuplicateNode(String),
    DanglingDependency { node: String, dependency: String },
    Cycle(String),
}

impl WorkflowDefect {
    /// Defects that can still be recorded as a (defunct) graph. An empty spec
    /// or a nameless node is rejected before any graph exists.
    pub fn is_structural(&self) -> bool {
        !matches!(
            self,
            WorkflowDefect::Empty
                | WorkflowDefect::MissingNodeName(_)
                | WorkflowDefect::TimeLimitOutOfRange(_)
        )
    }
}

impl std::fmt::Display for WorkflowDefect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowDefect::Empty => write!(f, "workflow has no function specs"),
            WorkflowDefect::MissingNodeName(idx) => {
                write!(f, "function spec #{idx} has no node name")
            }
            WorkflowDefect::TimeLimitOutOfRange(name) => {
                write!(f, "node {name} has a time limit above {MAX_DURATION_SECS} seconds")
            }
            WorkflowDefect::DuplicateNode(name) => write!(f, "duplicate node name: {name}"),
            WorkflowDefect::DanglingDependency { node, dependency } => {
                write!(f, "node {node} depends on unknown node {dependency}")
            }
            WorkflowDefect::Cycle(node) => write!(f, "dependency cycle through node {node}"),
        }
    }
}

impl From<WorkflowDefect> for ColoniesError {
    fn from(defect: WorkflowDefect) -> Self {
        ColoniesError::InvalidWorkflow(defect.to_string())
    }
}

impl WorkflowSpec {
    pub fn new(colony_name: impl Into<String>) -> Self {
        Self {
            colony_name: colony_name.into(),
            function_specs: Vec::new(),
        }
    }

    pub fn with_function(mut self, spec: FunctionSpec) -> Self {
        self.function_specs.push(spec);
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ColoniesError::InvalidWorkflow(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            ColoniesError::InvalidWorkflow(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// Node names without dependencies.
    pub fn roots(&self) -> Vec<&str> {
        self.function_specs
            .iter()
            .filter(|s| s.conditions.dependencies.is_empty())
            .map(|s| s.node_name.as_str())
            .collect()
    }

    /// Check names, dependency references and acyclicity.
    pub fn validate(&self) -> std::result::Result<(), WorkflowDefect> {
        if self.function_specs.is_empty() {
            return Err(WorkflowDefect::Empty);
        }

        let mut dag: DiGraph<&str, ()> = DiGraph::new();
        let mut index: HashMap<&str, NodeIndex> = HashMap::new();
        for (i, spec) in self.function_specs.iter().enumerate() {
            if spec.node_name.is_empty() {
                return Err(WorkflowDefect::MissingNodeName(i));
            }
            if !spec.time_limits_in_range() {
                return Err(WorkflowDefect::TimeLimitOutOfRange(spec.node_name.clone()));
            }
            if index.contains_key(spec.node_name.as_str()) {
                return Err(WorkflowDefect::DuplicateNode(spec.node_name.clone()));
            }
            let idx = dag.add_node(spec.node_name.as_str());
            index.insert(spec.node_name.as_str(), idx);
        }

        for spec in &self.function_specs {
            let to = index[spec.node_name.as_str()];
            for dep in &spec.conditions.dependencies {
                let from = index.get(dep.as_str()).ok_or_else(|| {
                    WorkflowDefect::DanglingDependency {
                        node: spec.node_name.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                dag.add_edge(*from, to, ());
            }
        }

        toposort(&dag, None)
            .map(|_| ())
            .map_err(|cycle| WorkflowDefect::Cycle(dag[cycle.node_id()].to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, deps: &[&str]) -> FunctionSpec {
        FunctionSpec::new(name, "echo", "dev", "cli").with_dependencies(deps.iter().copied())
    }

    fn diamond() -> WorkflowSpec {
        WorkflowSpec::new("dev")
            .with_function(node("task1", &[]))
            .with_function(node("task2", &["task1"]))
            .with_function(node("task3", &["task1"]))
            .with_function(node("task4", &["task2", "task3"]))
    }

    #[test]
    fn diamond_is_valid() {
        let wf = diamond();
        assert!(wf.validate().is_ok());
        assert_eq!(wf.roots(), vec!["task1"]);
    }

    #[test]
    fn empty_workflow_rejected() {
        assert_eq!(WorkflowSpec::new("dev").validate(), Err(WorkflowDefect::Empty));
        assert!(!WorkflowDefect::Empty.is_structural());
    }

    #[test]
    fn oversized_time_limit_rejected_before_graph() {
        let wf = WorkflowSpec::new("dev")
            .with_function(node("a", &[]).with_max_exec_time(i64::MAX));
        let defect = wf.validate().unwrap_err();
        assert_eq!(defect, WorkflowDefect::TimeLimitOutOfRange("a".into()));
        assert!(!defect.is_structural());
    }

    #[test]
    fn duplicate_node_rejected() {
        let wf = WorkflowSpec::new("dev")
            .with_function(node("a", &[]))
            .with_function(node("a", &[]));
        assert_eq!(wf.validate(), Err(WorkflowDefect::DuplicateNode("a".into())));
    }

    #[test]
    fn dangling_dependency_rejected() {
        let wf = WorkflowSpec::new("dev").with_function(node("a", &["ghost"]));
        let defect = wf.validate().unwrap_err();
        assert!(defect.is_structural());
        assert_eq!(defect.to_string(), "node a depends on unknown node ghost");
    }

    #[test]
    fn cycle_rejected() {
        let wf = WorkflowSpec::new("dev")
            .with_function(node("root", &[]))
            .with_function(node("a", &["root", "b"]))
            .with_function(node("b", &["a"]));
        assert!(matches!(wf.validate(), Err(WorkflowDefect::Cycle(_))));
    }

    #[test]
    fn loads_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wf.json");
        let json = serde_json::to_string(&diamond()).unwrap();
        std::fs::write(&path, json).unwrap();

        let loaded = WorkflowSpec::from_file(&path).unwrap();
        assert_eq!(loaded, diamond());
    }

    #[test]
    fn malformed_json_is_invalid_workflow() {
        let err = WorkflowSpec::from_json("{not json").unwrap_err();
        assert!(matches!(err, ColoniesError::InvalidWorkflow(_)));
    }
}
