use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ColoniesError, Result};
use crate::events::EventBus;
use crate::model::{
    Attribute, FunctionSpec, GraphView, Process, ProcessGraph, ProcessState, WorkflowSpec,
    MAX_DURATION_SECS,
};
use crate::store::{ProcessQuery, ProcessStore};

/// Inputs for a single graph instantiation.
#[derive(Debug, Clone, Default)]
pub struct Submission {
    /// Replaces the roots' args when non-empty
    pub args: Vec<Value>,
    /// Replaces the roots' kwargs when `args` is non-empty
    pub kwargs: HashMap<String, Value>,
    /// Becomes the roots' input
    pub root_input: Vec<Value>,
    /// Recovered ID; a graph already carrying it is returned as is
    pub idempotency_key: Option<String>,
}

impl Submission {
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            idempotency_key: Some(key.into()),
            ..Default::default()
        }
    }
}

pub(crate) fn ensure_running_owned(process: &Process, executor_id: Uuid) -> Result<()> {
    if process.cancelled {
        return Err(ColoniesError::IllegalTransition(format!(
            "process {} is cancelled",
            process.id
        )));
    }
    if process.state != ProcessState::Running {
        return Err(ColoniesError::IllegalTransition(format!(
            "process {} is {}, expected running",
            process.id, process.state
        )));
    }
    if !process.is_assigned_to(executor_id) {
        return Err(ColoniesError::IllegalTransition(format!(
            "process {} is not assigned to executor {}",
            process.id, executor_id
        )));
    }
    Ok(())
}

fn ensure_time_limits(spec: &FunctionSpec) -> Result<()> {
    if spec.time_limits_in_range() {
        Ok(())
    } else {
        Err(ColoniesError::InvalidWorkflow(format!(
            "function spec {} has a time limit above {MAX_DURATION_SECS} seconds",
            spec.node_name
        )))
    }
}

/// Expands workflows into process graphs and drives dependency resolution.
///
/// Only the command queue worker calls into this type, so reads followed by
/// writes never interleave with another mutation.
#[derive(Clone)]
pub struct GraphEngine {
    store: Arc<dyn ProcessStore>,
    events: EventBus,
}

impl GraphEngine {
    pub fn new(store: Arc<dyn ProcessStore>, events: EventBus) -> Self {
        Self { store, events }
    }

    async fn load_process(&self, id: &Uuid) -> Result<Process> {
        self.store
            .get_process(id)
            .await?
            .ok_or(ColoniesError::ProcessNotFound(*id))
    }

    async fn load_graph(&self, id: &Uuid) -> Result<ProcessGraph> {
        self.store
            .get_graph(id)
            .await?
            .ok_or(ColoniesError::GraphNotFound(*id))
    }

    /// Submit a standalone process.
    pub async fn submit_function(&self, mut spec: FunctionSpec) -> Result<Process> {
        if spec.conditions.colony_name.is_empty() {
            return Err(ColoniesError::InvalidWorkflow(
                "function spec has no colony".to_string(),
            ));
        }
        ensure_time_limits(&spec)?;
        if spec.max_exec_time == 0 {
            spec.max_exec_time = -1;
        }
        let process = Process::new(spec);
        self.store.add_process(process.clone()).await?;
        self.events.process_changed(&process);
        tracing::debug!(process_id = %process.id, colony = %process.colony_name, "Process submitted");
        Ok(process)
    }

    pub async fn create_process_graph(
        &self,
        workflow: &WorkflowSpec,
        submission: Submission,
    ) -> Result<ProcessGraph> {
        if let Some(key) = submission.idempotency_key.as_deref() {
            if let Some(existing) = self.store.find_graph_by_key(key).await? {
                tracing::debug!(graph_id = %existing.id, key, "Graph already submitted");
                return Ok(existing);
            }
        }

        let mut graph = ProcessGraph::new(&workflow.colony_name, submission.idempotency_key.clone());

        if let Err(defect) = workflow.validate() {
            if !defect.is_structural() {
                return Err(defect.into());
            }
            let reason = defect.to_string();
            graph.defunct = true;
            graph.errors.push(reason.clone());
            self.store.add_graph(graph.clone()).await?;
            tracing::warn!(graph_id = %graph.id, reason = %reason, "Workflow expansion failed, graph marked defunct");
            return Err(ColoniesError::DefunctGraph {
                graph_id: graph.id,
                reason,
            });
        }

        let mut processes: Vec<Process> = Vec::with_capacity(workflow.function_specs.len());
        let mut by_name: HashMap<String, usize> = HashMap::new();
        for spec in &workflow.function_specs {
            let mut spec = spec.clone();
            spec.conditions.colony_name = workflow.colony_name.clone();
            if spec.max_exec_time == 0 {
                spec.max_exec_time = -1;
            }
            let mut process = Process::new(spec);
            process.graph_id = Some(graph.id);
            if process.spec.conditions.dependencies.is_empty() {
                if !submission.args.is_empty() {
                    process.spec.args = submission.args.clone();
                    process.spec.kwargs = submission.kwargs.clone();
                }
                process.input = submission.root_input.clone();
                graph.roots.push(process.id);
            } else {
                process.wait_for_parents = true;
            }
            graph.process_ids.push(process.id);
            by_name.insert(process.spec.node_name.clone(), processes.len());
            processes.push(process);
        }

        // Validation guarantees every dependency resolves
        let mut edges: Vec<(usize, usize)> = Vec::new();
        for (child, process) in processes.iter().enumerate() {
            for dep in &process.spec.conditions.dependencies {
                if let Some(&parent) = by_name.get(dep) {
                    edges.push((parent, child));
                }
            }
        }
        for (parent, child) in edges {
            let parent_id = processes[parent].id;
            let child_id = processes[child].id;
            processes[parent].children.push(child_id);
            processes[child].parents.push(parent_id);
        }

        self.store.add_graph(graph.clone()).await?;
        for process in &processes {
            self.store.add_process(process.clone()).await?;
        }
        for process in processes.iter().filter(|p| !p.wait_for_parents) {
            self.events.process_changed(process);
        }

        tracing::info!(
            graph_id = %graph.id,
            colony = %graph.colony_name,
            processes = processes.len(),
            roots = graph.roots.len(),
            "Process graph created"
        );
        Ok(graph)
    }

    /// Append (or with `insert`, splice) a child below a running parent.
    pub async fn add_child(
        &self,
        graph_id: Uuid,
        parent_id: Uuid,
        executor_id: Uuid,
        mut spec: FunctionSpec,
        insert: bool,
    ) -> Result<Process> {
        let mut graph = self.load_graph(&graph_id).await?;
        if graph.cancelled || graph.defunct {
            return Err(ColoniesError::IllegalTransition(format!(
                "process graph {graph_id} no longer accepts children"
            )));
        }
        if !graph.contains(&parent_id) {
            return Err(ColoniesError::IllegalTransition(format!(
                "process {parent_id} is not part of graph {graph_id}"
            )));
        }

        let mut parent = self.load_process(&parent_id).await?;
        ensure_running_owned(&parent, executor_id)?;

        if spec.node_name.is_empty() {
            return Err(ColoniesError::InvalidWorkflow("child has no node name".to_string()));
        }
        ensure_time_limits(&spec)?;
        let members = self.store.graph_members(&graph_id).await?;
        if members.iter().any(|m| m.spec.node_name == spec.node_name) {
            return Err(ColoniesError::InvalidWorkflow(format!(
                "duplicate node name: {}",
                spec.node_name
            )));
        }

        spec.conditions.colony_name = graph.colony_name.clone();
        spec.conditions.dependencies = vec![parent.spec.node_name.clone()];
        let mut child = Process::new(spec);
        child.graph_id = Some(graph_id);
        child.wait_for_parents = true;
        child.parents.push(parent.id);

        if insert {
            for grandchild_id in &parent.children {
                let mut grandchild = self.load_process(grandchild_id).await?;
                for p in grandchild.parents.iter_mut().filter(|p| **p == parent.id) {
                    *p = child.id;
                }
                for dep in grandchild
                    .spec
                    .conditions
                    .dependencies
                    .iter_mut()
                    .filter(|d| **d == parent.spec.node_name)
                {
                    *dep = child.spec.node_name.clone();
                }
                self.store.update_process(&grandchild).await?;
            }
            child.children = std::mem::take(&mut parent.children);
        }
        parent.children.push(child.id);

        self.store.add_process(child.clone()).await?;
        self.store.update_process(&parent).await?;
        graph.process_ids.push(child.id);
        self.store.update_graph(&graph).await?;

        tracing::info!(
            graph_id = %graph_id,
            parent_id = %parent_id,
            child_id = %child.id,
            insert,
            "Child added to process graph"
        );
        Ok(child)
    }

    pub async fn set_output(&self, process_id: Uuid, executor_id: Uuid, output: Vec<Value>) -> Result<()> {
        let mut process = self.load_process(&process_id).await?;
        ensure_running_owned(&process, executor_id)?;
        process.output = output;
        self.store.update_process(&process).await
    }

    /// Attach a key/value pair to a running process owned by `executor_id`.
    pub async fn add_attribute(&self, mut attribute: Attribute, executor_id: Uuid) -> Result<Attribute> {
        let process = self.load_process(&attribute.target_id).await?;
        ensure_running_owned(&process, executor_id)?;
        attribute.colony_name = process.spec.conditions.colony_name.clone();
        attribute.graph_id = process.graph_id;
        let stored = self.store.add_attribute(attribute).await?;
        tracing::debug!(
            process_id = %process.id,
            attribute_id = %stored.id,
            key = %stored.key,
            kind = %stored.kind,
            "Attribute added"
        );
        Ok(stored)
    }

    pub async fn close_successful(
        &self,
        process_id: Uuid,
        executor_id: Uuid,
        output: Option<Vec<Value>>,
    ) -> Result<Process> {
        let mut process = self.load_process(&process_id).await?;
        ensure_running_owned(&process, executor_id)?;
        if let Some(output) = output {
            process.output = output;
        }
        process.mark_success(Utc::now());
        self.store.update_process(&process).await?;
        self.events.process_changed(&process);
        tracing::info!(process_id = %process_id, executor_id = %executor_id, "Process closed successfully");

        self.notify_children(&process).await?;
        Ok(process)
    }

    pub async fn close_failed(&self, process_id: Uuid, executor_id: Uuid, errors: Vec<String>) -> Result<Process> {
        let mut process = self.load_process(&process_id).await?;
        ensure_running_owned(&process, executor_id)?;
        self.fail(&mut process, errors).await?;
        tracing::info!(process_id = %process_id, executor_id = %executor_id, "Process closed as failed");
        Ok(process)
    }

    /// Mark a non-terminal process failed and cascade to its descendants.
    /// Terminal processes are left untouched.
    pub(crate) async fn fail(&self, process: &mut Process, errors: Vec<String>) -> Result<()> {
        if process.state.is_terminal() {
            return Ok(());
        }
        process.mark_failed(errors, Utc::now());
        self.store.update_process(process).await?;
        self.events.process_changed(process);
        self.notify_children(process).await
    }

    /// Promote children whose parents all succeeded, or propagate a failure.
    pub async fn notify_children(&self, process: &Process) -> Result<()> {
        let Some(graph_id) = process.graph_id else {
            return Ok(());
        };
        match process.state {
            ProcessState::Success => self.promote_children(graph_id, process).await,
            ProcessState::Failed => self.fail_descendants(graph_id, process).await,
            _ => Ok(()),
        }
    }

    async fn promote_children(&self, graph_id: Uuid, process: &Process) -> Result<()> {
        let graph = self.load_graph(&graph_id).await?;
        if graph.cancelled {
            return Ok(());
        }

        for child_id in &process.children {
            let Some(mut child) = self.store.get_process(child_id).await? else {
                return Err(self
                    .mark_defunct(graph_id, format!("child {child_id} of process {} is missing", process.id))
                    .await);
            };
            if !child.wait_for_parents || child.state != ProcessState::Waiting {
                continue;
            }

            let mut ready = true;
            for parent_id in &child.parents {
                match self.store.get_process(parent_id).await? {
                    Some(parent) if parent.state == ProcessState::Success => {}
                    Some(_) => {
                        ready = false;
                        break;
                    }
                    None => {
                        return Err(self
                            .mark_defunct(graph_id, format!("parent {parent_id} of process {child_id} is missing"))
                            .await);
                    }
                }
            }

            if ready {
                child.wait_for_parents = false;
                self.store.update_process(&child).await?;
                self.events.process_changed(&child);
                tracing::debug!(process_id = %child.id, graph_id = %graph_id, "Child promoted to waiting");
            }
        }
        Ok(())
    }

    async fn fail_descendants(&self, graph_id: Uuid, process: &Process) -> Result<()> {
        let mut queue: VecDeque<Uuid> = process.children.iter().copied().collect();
        let mut seen: HashSet<Uuid> = HashSet::new();
        let now = Utc::now();

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let Some(mut child) = self.store.get_process(&id).await? else {
                return Err(self
                    .mark_defunct(graph_id, format!("descendant {id} of process {} is missing", process.id))
                    .await);
            };
            queue.extend(child.children.iter().copied());
            if child.state.is_terminal() {
                continue;
            }
            child.mark_failed([format!("ancestor process {} failed", process.id)], now);
            self.store.update_process(&child).await?;
            self.events.process_changed(&child);
        }

        tracing::info!(graph_id = %graph_id, process_id = %process.id, failed = seen.len(), "Failure propagated to descendants");
        Ok(())
    }

    /// Record an inconsistency and fail every unfinished member. Returns the
    /// error to surface to the caller.
    pub async fn mark_defunct(&self, graph_id: Uuid, reason: String) -> ColoniesError {
        if let Err(e) = self.try_mark_defunct(graph_id, &reason).await {
            tracing::error!(graph_id = %graph_id, error = %e, "Failed to mark graph defunct");
        }
        ColoniesError::DefunctGraph { graph_id, reason }
    }

    async fn try_mark_defunct(&self, graph_id: Uuid, reason: &str) -> Result<()> {
        let mut graph = self.load_graph(&graph_id).await?;
        graph.defunct = true;
        graph.errors.push(reason.to_string());
        self.store.update_graph(&graph).await?;

        let now = Utc::now();
        for mut member in self.store.graph_members(&graph_id).await? {
            if member.state.is_terminal() {
                continue;
            }
            member.mark_failed([format!("process graph defunct: {reason}")], now);
            self.store.update_process(&member).await?;
            self.events.process_changed(&member);
        }
        tracing::warn!(graph_id = %graph_id, reason, "Process graph marked defunct");
        Ok(())
    }

    pub async fn cancel_process(&self, process_id: Uuid) -> Result<Process> {
        let mut process = self.load_process(&process_id).await?;
        if process.state.is_terminal() {
            return Err(ColoniesError::IllegalTransition(format!(
                "process {process_id} is already {}",
                process.state
            )));
        }
        process.cancelled = true;
        self.fail(&mut process, vec!["process cancelled".to_string()]).await?;
        tracing::info!(process_id = %process_id, "Process cancelled");
        Ok(process)
    }

    pub async fn cancel_graph(&self, graph_id: Uuid) -> Result<GraphView> {
        let mut graph = self.load_graph(&graph_id).await?;
        graph.cancelled = true;
        self.store.update_graph(&graph).await?;

        let now = Utc::now();
        for mut member in self.store.graph_members(&graph_id).await? {
            if member.state.is_terminal() {
                continue;
            }
            member.cancelled = true;
            member.mark_failed(["process graph cancelled".to_string()], now);
            self.store.update_process(&member).await?;
            self.events.process_changed(&member);
        }
        tracing::info!(graph_id = %graph_id, "Process graph cancelled");
        self.view(graph_id).await
    }

    pub async fn view(&self, graph_id: Uuid) -> Result<GraphView> {
        let graph = self.load_graph(&graph_id).await?;
        let members = self.store.graph_members(&graph_id).await?;
        Ok(GraphView::resolve(graph, &members))
    }

    pub async fn remove_process(&self, process_id: Uuid) -> Result<()> {
        let process = self.load_process(&process_id).await?;
        if let Some(graph_id) = process.graph_id {
            return Err(ColoniesError::IllegalTransition(format!(
                "process {process_id} belongs to graph {graph_id}, remove the graph instead"
            )));
        }
        if process.state == ProcessState::Running {
            return Err(ColoniesError::IllegalTransition(format!(
                "process {process_id} is running"
            )));
        }
        self.store.remove_process(&process_id).await
    }

    /// Remove standalone processes in `colony`, optionally only in `state`.
    /// Running processes are never removed.
    pub async fn remove_all_processes(&self, colony: &str, state: Option<ProcessState>) -> Result<usize> {
        if state == Some(ProcessState::Running) {
            return Err(ColoniesError::IllegalTransition(
                "running processes cannot be removed".to_string(),
            ));
        }
        let mut query = ProcessQuery::colony(colony).standalone();
        query.state = state;
        let mut removed = 0;
        for process in self.store.find_processes(&query).await? {
            if process.state == ProcessState::Running {
                continue;
            }
            self.store.remove_process(&process.id).await?;
            removed += 1;
        }
        tracing::info!(colony, removed, "Removed processes");
        Ok(removed)
    }

    pub async fn remove_graph(&self, graph_id: Uuid) -> Result<()> {
        let view = self.view(graph_id).await?;
        if view.counts.running > 0 {
            return Err(ColoniesError::IllegalTransition(format!(
                "process graph {graph_id} has running processes"
            )));
        }
        self.store.remove_graph(&graph_id).await
    }

    /// Remove graphs in `colony` whose derived state matches `state`. Graphs
    /// with running members are kept.
    pub async fn remove_all_graphs(&self, colony: &str, state: Option<ProcessState>) -> Result<usize> {
        if state == Some(ProcessState::Running) {
            return Err(ColoniesError::IllegalTransition(
                "running process graphs cannot be removed".to_string(),
            ));
        }
        let mut removed = 0;
        for graph in self.store.find_graphs(colony, None).await? {
            let view = self.view(graph.id).await?;
            if view.counts.running > 0 || state.is_some_and(|s| s != view.state) {
                continue;
            }
            self.store.remove_graph(&graph.id).await?;
            removed += 1;
        }
        tracing::info!(colony, removed, "Removed process graphs");
        Ok(removed)
    }
}
