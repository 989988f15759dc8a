//! Persistence contract consumed by the scheduling core.
//!
//! The scheduler never holds locks across store calls; it relies on the
//! single-writer command queue for ordering and on each call being atomic.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{
    Attribute, Cron, Executor, Generator, GeneratorArg, Process, ProcessGraph, ProcessState,
};

/// Filter for process queries. Unset fields match everything. Results are
/// ordered by submission time, oldest first.
#[derive(Debug, Clone, Default)]
pub struct ProcessQuery {
    pub colony_name: Option<String>,
    pub state: Option<ProcessState>,
    pub executor_id: Option<Uuid>,
    pub graph_id: Option<Uuid>,
    /// Only processes that are not part of a graph
    pub standalone: bool,
    pub submitted_after: Option<DateTime<Utc>>,
    pub ended_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl ProcessQuery {
    pub fn colony(colony_name: impl Into<String>) -> Self {
        Self {
            colony_name: Some(colony_name.into()),
            ..Default::default()
        }
    }

    pub fn with_state(mut self, state: ProcessState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_executor(mut self, executor_id: Uuid) -> Self {
        self.executor_id = Some(executor_id);
        self
    }

    pub fn standalone(mut self) -> Self {
        self.standalone = true;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, p: &Process) -> bool {
        self.colony_name.as_ref().map_or(true, |c| &p.colony_name == c)
            && self.state.map_or(true, |s| p.state == s)
            && self.executor_id.map_or(true, |e| p.assigned_executor == Some(e))
            && self.graph_id.map_or(true, |g| p.graph_id == Some(g))
            && (!self.standalone || p.graph_id.is_none())
            && self.submitted_after.map_or(true, |t| p.submitted_at >= t)
            && self
                .ended_before
                .map_or(true, |t| p.ended_at.is_some_and(|end| end < t))
    }
}

#[async_trait]
pub trait ProcessStore: Send + Sync {
    // Processes

    async fn add_process(&self, process: Process) -> Result<()>;
    async fn get_process(&self, id: &Uuid) -> Result<Option<Process>>;
    async fn update_process(&self, process: &Process) -> Result<()>;
    async fn remove_process(&self, id: &Uuid) -> Result<()>;
    async fn find_processes(&self, query: &ProcessQuery) -> Result<Vec<Process>>;
    /// Eligible WAITING processes for a colony and executor type, highest
    /// priority first, then oldest first.
    async fn find_candidates(&self, colony_name: &str, executor_type: &str)
        -> Result<Vec<Process>>;
    /// Colony names that own at least one process or graph.
    async fn colonies(&self) -> Result<Vec<String>>;

    // Process graphs

    async fn add_graph(&self, graph: ProcessGraph) -> Result<()>;
    async fn get_graph(&self, id: &Uuid) -> Result<Option<ProcessGraph>>;
    async fn update_graph(&self, graph: &ProcessGraph) -> Result<()>;
    /// Removes the graph, every member process and their attributes.
    async fn remove_graph(&self, id: &Uuid) -> Result<()>;
    async fn find_graphs(&self, colony_name: &str, limit: Option<usize>)
        -> Result<Vec<ProcessGraph>>;
    async fn find_graph_by_key(&self, idempotency_key: &str) -> Result<Option<ProcessGraph>>;
    async fn graph_members(&self, graph_id: &Uuid) -> Result<Vec<Process>>;

    // Generators

    async fn add_generator(&self, generator: Generator) -> Result<()>;
    async fn get_generator(&self, id: &Uuid) -> Result<Option<Generator>>;
    async fn find_generator_by_name(&self, colony_name: &str, name: &str)
        -> Result<Option<Generator>>;
    async fn update_generator(&self, generator: &Generator) -> Result<()>;
    /// Removes the generator and its pending args.
    async fn remove_generator(&self, id: &Uuid) -> Result<()>;
    async fn find_generators(&self, colony_name: &str, limit: Option<usize>)
        -> Result<Vec<Generator>>;
    async fn all_generators(&self) -> Result<Vec<Generator>>;
    async fn add_generator_arg(&self, arg: GeneratorArg) -> Result<()>;
    /// Oldest first.
    async fn generator_args(&self, generator_id: &Uuid, limit: usize) -> Result<Vec<GeneratorArg>>;
    async fn remove_generator_args(&self, ids: &[Uuid]) -> Result<()>;

    // Crons

    async fn add_cron(&self, cron: Cron) -> Result<()>;
    async fn get_cron(&self, id: &Uuid) -> Result<Option<Cron>>;
    async fn find_cron_by_name(&self, colony_name: &str, name: &str) -> Result<Option<Cron>>;
    async fn update_cron(&self, cron: &Cron) -> Result<()>;
    async fn remove_cron(&self, id: &Uuid) -> Result<()>;
    async fn find_crons(&self, colony_name: &str, limit: Option<usize>) -> Result<Vec<Cron>>;
    async fn all_crons(&self) -> Result<Vec<Cron>>;

    // Attributes

    /// Inserts the attribute, or replaces the value of the one already in the
    /// same `(target, kind, key)` slot. Returns the stored record.
    async fn add_attribute(&self, attribute: Attribute) -> Result<Attribute>;
    async fn get_attribute(&self, id: &Uuid) -> Result<Option<Attribute>>;
    /// Oldest first.
    async fn process_attributes(&self, process_id: &Uuid) -> Result<Vec<Attribute>>;

    // Executors

    async fn add_executor(&self, executor: Executor) -> Result<()>;
    async fn get_executor(&self, id: &Uuid) -> Result<Option<Executor>>;
    async fn update_executor(&self, executor: &Executor) -> Result<()>;
    async fn remove_executor(&self, id: &Uuid) -> Result<()>;
    async fn find_executors(&self, colony_name: &str) -> Result<Vec<Executor>>;
    async fn all_executors(&self) -> Result<Vec<Executor>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FunctionSpec;

    #[test]
    fn query_filters() {
        let mut p = Process::new(FunctionSpec::new("a", "f", "dev", "cli"));
        assert!(ProcessQuery::colony("dev").matches(&p));
        assert!(!ProcessQuery::colony("prod").matches(&p));
        assert!(ProcessQuery::colony("dev").standalone().matches(&p));

        p.graph_id = Some(Uuid::new_v4());
        assert!(!ProcessQuery::colony("dev").standalone().matches(&p));
        assert!(!ProcessQuery::colony("dev")
            .with_state(ProcessState::Running)
            .matches(&p));
    }

    #[test]
    fn ended_before_requires_end_time() {
        let mut p = Process::new(FunctionSpec::new("a", "f", "dev", "cli"));
        let query = ProcessQuery {
            ended_before: Some(Utc::now()),
            ..Default::default()
        };
        assert!(!query.matches(&p));
        p.ended_at = Some(Utc::now() - chrono::Duration::hours(1));
        assert!(query.matches(&p));
    }
}
