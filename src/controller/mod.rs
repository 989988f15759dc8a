//! Client-facing verbs. Mutations are serialized through the command queue
//! and only accepted on the leader; reads go straight to the store.

pub mod command;
pub mod handler;
pub mod queue;

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::cluster::LeaderElector;
use crate::error::{ColoniesError, Result};
use crate::events::{Event, EventBus};
use crate::model::{
    Attribute, Cron, Executor, FunctionSpec, Generator, GraphView, Process, ProcessGraph, ProcessState,
    StateCounts, WorkflowSpec,
};
use crate::scheduler::{Assignment, PauseFlags};
use crate::store::{ProcessQuery, ProcessStore};

pub use command::{Command, Lane, Reply, Sweep, SweepOutcome};
pub use handler::CommandHandler;
pub use queue::{run_worker, CommandQueue, QueueReceiver};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ColonyStatistics {
    pub processes: StateCounts,
    pub graphs: StateCounts,
    pub executors: usize,
    pub paused: bool,
}

#[derive(Clone)]
pub struct Controller {
    queue: CommandQueue,
    store: Arc<dyn ProcessStore>,
    events: EventBus,
    elector: Arc<LeaderElector>,
    pause: PauseFlags,
}

impl Controller {
    pub fn new(
        queue: CommandQueue,
        store: Arc<dyn ProcessStore>,
        events: EventBus,
        elector: Arc<LeaderElector>,
        pause: PauseFlags,
    ) -> Self {
        Self {
            queue,
            store,
            events,
            elector,
            pause,
        }
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub async fn is_leader(&self) -> bool {
        self.elector.is_leader().await
    }

    async fn mutate<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        if !self.elector.is_leader().await {
            let holder = self.elector.leader_name().await.ok().flatten();
            return Err(ColoniesError::NotLeader(holder));
        }
        self.queue.request(make).await
    }

    // Processes and graphs

    pub async fn submit_workflow_spec(&self, workflow: WorkflowSpec) -> Result<ProcessGraph> {
        self.mutate(|reply| Command::SubmitWorkflow { workflow, reply })
            .await
    }

    pub async fn submit_function_spec(&self, spec: FunctionSpec) -> Result<Process> {
        self.mutate(|reply| Command::SubmitFunction { spec, reply }).await
    }

    pub async fn add_child(
        &self,
        graph_id: Uuid,
        parent_id: Uuid,
        executor_id: Uuid,
        spec: FunctionSpec,
        insert: bool,
    ) -> Result<Process> {
        self.mutate(|reply| Command::AddChild {
            graph_id,
            parent_id,
            executor_id,
            spec,
            insert,
            reply,
        })
        .await
    }

    /// Try to assign, then wait up to `timeout` for an event that could make
    /// a process available before trying again. The subscription is taken
    /// before each attempt so no wake-up falls between attempt and wait.
    pub async fn assign(
        &self,
        executor_id: Uuid,
        colony_name: &str,
        cpu: u64,
        memory: u64,
        timeout: Duration,
    ) -> Result<Assignment> {
        let executor = self.get_executor(executor_id).await?;
        let deadline = Instant::now() + timeout;

        loop {
            let mut events = self.events.subscribe();
            let colony = colony_name.to_string();
            let assignment = self
                .mutate(|reply| Command::Assign {
                    executor_id,
                    colony_name: colony,
                    cpu,
                    memory,
                    reply,
                })
                .await?;
            if matches!(assignment, Assignment::Assigned(_)) {
                return Ok(assignment);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Assignment::NoMatch);
            }
            let wake = wait_for(&mut events, |e| {
                e.may_unblock_assign(colony_name, &executor.executor_type)
            });
            if tokio::time::timeout(remaining, wake).await.is_err() {
                return Ok(Assignment::NoMatch);
            }
        }
    }

    pub async fn set_output(&self, process_id: Uuid, executor_id: Uuid, output: Vec<Value>) -> Result<()> {
        self.mutate(|reply| Command::SetOutput {
            process_id,
            executor_id,
            output,
            reply,
        })
        .await
    }

    /// Only the executor running the target process may attach attributes.
    pub async fn add_attribute(&self, attribute: Attribute, executor_id: Uuid) -> Result<Attribute> {
        self.mutate(|reply| Command::AddAttribute {
            attribute,
            executor_id,
            reply,
        })
        .await
    }

    pub async fn close_successful(
        &self,
        process_id: Uuid,
        executor_id: Uuid,
        output: Option<Vec<Value>>,
    ) -> Result<Process> {
        self.mutate(|reply| Command::CloseSuccessful {
            process_id,
            executor_id,
            output,
            reply,
        })
        .await
    }

    pub async fn close_failed(&self, process_id: Uuid, executor_id: Uuid, errors: Vec<String>) -> Result<Process> {
        self.mutate(|reply| Command::CloseFailed {
            process_id,
            executor_id,
            errors,
            reply,
        })
        .await
    }

    pub async fn cancel_process(&self, process_id: Uuid) -> Result<Process> {
        self.mutate(|reply| Command::CancelProcess { process_id, reply })
            .await
    }

    pub async fn cancel_process_graph(&self, graph_id: Uuid) -> Result<GraphView> {
        self.mutate(|reply| Command::CancelGraph { graph_id, reply }).await
    }

    pub async fn remove_process(&self, process_id: Uuid) -> Result<()> {
        self.mutate(|reply| Command::RemoveProcess { process_id, reply })
            .await
    }

    pub async fn remove_all_processes(&self, colony_name: &str, state: Option<ProcessState>) -> Result<usize> {
        let colony_name = colony_name.to_string();
        self.mutate(|reply| Command::RemoveAllProcesses {
            colony_name,
            state,
            reply,
        })
        .await
    }

    pub async fn remove_process_graph(&self, graph_id: Uuid) -> Result<()> {
        self.mutate(|reply| Command::RemoveGraph { graph_id, reply }).await
    }

    pub async fn remove_all_process_graphs(
        &self,
        colony_name: &str,
        state: Option<ProcessState>,
    ) -> Result<usize> {
        let colony_name = colony_name.to_string();
        self.mutate(|reply| Command::RemoveAllGraphs {
            colony_name,
            state,
            reply,
        })
        .await
    }

    pub async fn get_process(&self, process_id: Uuid) -> Result<Process> {
        self.store
            .get_process(&process_id)
            .await?
            .ok_or(ColoniesError::ProcessNotFound(process_id))
    }

    pub async fn get_attribute(&self, attribute_id: Uuid) -> Result<Attribute> {
        self.store
            .get_attribute(&attribute_id)
            .await?
            .ok_or(ColoniesError::AttributeNotFound(attribute_id))
    }

    pub async fn get_process_attributes(&self, process_id: Uuid) -> Result<Vec<Attribute>> {
        self.get_process(process_id).await?;
        self.store.process_attributes(&process_id).await
    }

    pub async fn get_processes(
        &self,
        colony_name: &str,
        state: Option<ProcessState>,
        limit: usize,
    ) -> Result<Vec<Process>> {
        let mut query = ProcessQuery::colony(colony_name).with_limit(limit);
        query.state = state;
        self.store.find_processes(&query).await
    }

    /// Processes in `colony_name` submitted within the last `seconds`. A
    /// window reaching past the representable range returns the whole history.
    pub async fn get_process_hist(
        &self,
        colony_name: &str,
        executor_id: Option<Uuid>,
        state: Option<ProcessState>,
        seconds: i64,
    ) -> Result<Vec<Process>> {
        let mut query = ProcessQuery::colony(colony_name);
        query.state = state;
        query.executor_id = executor_id;
        query.submitted_after = ChronoDuration::try_seconds(seconds)
            .and_then(|window| Utc::now().checked_sub_signed(window));
        self.store.find_processes(&query).await
    }

    pub async fn get_process_graph(&self, graph_id: Uuid) -> Result<GraphView> {
        let graph = self
            .store
            .get_graph(&graph_id)
            .await?
            .ok_or(ColoniesError::GraphNotFound(graph_id))?;
        let members = self.store.graph_members(&graph_id).await?;
        Ok(GraphView::resolve(graph, &members))
    }

    pub async fn get_process_graphs(
        &self,
        colony_name: &str,
        state: Option<ProcessState>,
        limit: usize,
    ) -> Result<Vec<GraphView>> {
        let mut views = Vec::new();
        for graph in self.store.find_graphs(colony_name, None).await? {
            if views.len() >= limit {
                break;
            }
            let members = self.store.graph_members(&graph.id).await?;
            let view = GraphView::resolve(graph, &members);
            if state.map_or(true, |s| s == view.state) {
                views.push(view);
            }
        }
        Ok(views)
    }

    /// Wait until the process reaches `state` or any terminal state, or
    /// `timeout` elapses. Returns the process as last seen.
    pub async fn wait_for_process(
        &self,
        process_id: Uuid,
        state: ProcessState,
        timeout: Duration,
    ) -> Result<Process> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut events = self.events.subscribe();
            let process = self.get_process(process_id).await?;
            if process.state == state || process.state.is_terminal() {
                return Ok(process);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(process);
            }
            let changed = wait_for(&mut events, |e| {
                matches!(e, Event::Process { process_id: id, .. } if *id == process_id)
            });
            if tokio::time::timeout(remaining, changed).await.is_err() {
                return self.get_process(process_id).await;
            }
        }
    }

    // Generators

    pub async fn add_generator(&self, generator: Generator) -> Result<Generator> {
        self.mutate(|reply| Command::AddGenerator { generator, reply })
            .await
    }

    pub async fn pack_generator(&self, generator_id: Uuid, arg: impl Into<String>) -> Result<Generator> {
        let arg = arg.into();
        self.mutate(|reply| Command::PackGenerator {
            generator_id,
            arg,
            reply,
        })
        .await
    }

    pub async fn resolve_generator(&self, colony_name: &str, name: &str) -> Result<Generator> {
        self.store
            .find_generator_by_name(colony_name, name)
            .await?
            .ok_or_else(|| ColoniesError::GeneratorNotFound(name.to_string()))
    }

    pub async fn get_generator(&self, generator_id: Uuid) -> Result<Generator> {
        self.store
            .get_generator(&generator_id)
            .await?
            .ok_or_else(|| ColoniesError::GeneratorNotFound(generator_id.to_string()))
    }

    pub async fn get_generators(&self, colony_name: &str, limit: usize) -> Result<Vec<Generator>> {
        self.store.find_generators(colony_name, Some(limit)).await
    }

    pub async fn remove_generator(&self, generator_id: Uuid) -> Result<()> {
        self.mutate(|reply| Command::RemoveGenerator { generator_id, reply })
            .await
    }

    // Crons

    pub async fn add_cron(&self, cron: Cron) -> Result<Cron> {
        self.mutate(|reply| Command::AddCron { cron, reply }).await
    }

    pub async fn run_cron(&self, cron_id: Uuid) -> Result<Option<ProcessGraph>> {
        self.mutate(|reply| Command::RunCron { cron_id, reply }).await
    }

    pub async fn get_cron(&self, cron_id: Uuid) -> Result<Cron> {
        self.store
            .get_cron(&cron_id)
            .await?
            .ok_or_else(|| ColoniesError::CronNotFound(cron_id.to_string()))
    }

    pub async fn get_crons(&self, colony_name: &str, limit: usize) -> Result<Vec<Cron>> {
        self.store.find_crons(colony_name, Some(limit)).await
    }

    pub async fn remove_cron(&self, cron_id: Uuid) -> Result<()> {
        self.mutate(|reply| Command::RemoveCron { cron_id, reply }).await
    }

    // Pause

    pub async fn pause_colony_assignments(&self, colony_name: &str) -> Result<bool> {
        let colony_name = colony_name.to_string();
        self.mutate(|reply| Command::PauseColony { colony_name, reply })
            .await
    }

    pub async fn resume_colony_assignments(&self, colony_name: &str) -> Result<bool> {
        let colony_name = colony_name.to_string();
        self.mutate(|reply| Command::ResumeColony { colony_name, reply })
            .await
    }

    pub async fn get_pause_status(&self, colony_name: &str) -> bool {
        self.pause.is_paused(colony_name).await
    }

    // Executors

    pub async fn add_executor(&self, executor: Executor) -> Result<Executor> {
        self.mutate(|reply| Command::AddExecutor { executor, reply })
            .await
    }

    pub async fn approve_executor(&self, executor_id: Uuid) -> Result<Executor> {
        self.mutate(|reply| Command::ApproveExecutor { executor_id, reply })
            .await
    }

    pub async fn reject_executor(&self, executor_id: Uuid) -> Result<Executor> {
        self.mutate(|reply| Command::RejectExecutor { executor_id, reply })
            .await
    }

    pub async fn remove_executor(&self, executor_id: Uuid) -> Result<()> {
        self.mutate(|reply| Command::RemoveExecutor { executor_id, reply })
            .await
    }

    pub async fn get_executor(&self, executor_id: Uuid) -> Result<Executor> {
        self.store
            .get_executor(&executor_id)
            .await?
            .ok_or(ColoniesError::ExecutorNotFound(executor_id))
    }

    pub async fn get_executors(&self, colony_name: &str) -> Result<Vec<Executor>> {
        self.store.find_executors(colony_name).await
    }

    pub async fn get_colony_statistics(&self, colony_name: &str) -> Result<ColonyStatistics> {
        let processes = self
            .store
            .find_processes(&ProcessQuery::colony(colony_name))
            .await?;

        let mut graphs = StateCounts::default();
        for graph in self.store.find_graphs(colony_name, None).await? {
            let members = self.store.graph_members(&graph.id).await?;
            match GraphView::resolve(graph, &members).state {
                ProcessState::Waiting => graphs.waiting += 1,
                ProcessState::Running => graphs.running += 1,
                ProcessState::Success => graphs.success += 1,
                ProcessState::Failed => graphs.failed += 1,
            }
        }

        Ok(ColonyStatistics {
            processes: StateCounts::tally(&processes),
            graphs,
            executors: self.store.find_executors(colony_name).await?.len(),
            paused: self.pause.is_paused(colony_name).await,
        })
    }
}

/// Resolves once an event matching `accept` arrives. A lagged receiver
/// resolves immediately so the caller re-reads the store.
async fn wait_for(events: &mut broadcast::Receiver<Event>, accept: impl Fn(&Event) -> bool) {
    loop {
        match events.recv().await {
            Ok(event) if accept(&event) => return,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => return,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}
