use std::sync::Arc;

use uuid::Uuid;

use crate::cluster::LeaderElector;
use crate::controller::command::{Command, Sweep, SweepOutcome};
use crate::error::{ColoniesError, Result};
use crate::events::{Event, EventBus};
use crate::model::{Executor, ExecutorState};
use crate::scheduler::{
    DeadlineSweep, GraphEngine, Matcher, PauseFlags, RetentionWorker, Submission,
};
use crate::store::ProcessStore;
use crate::trigger::{CronTrigger, GeneratorTrigger};

/// Executes commands on behalf of the queue worker. Never called concurrently.
pub struct CommandHandler {
    pub(crate) store: Arc<dyn ProcessStore>,
    pub(crate) events: EventBus,
    pub(crate) elector: Arc<LeaderElector>,
    pub(crate) pause: PauseFlags,
    pub(crate) graphs: GraphEngine,
    pub(crate) matcher: Matcher,
    pub(crate) generators: GeneratorTrigger,
    pub(crate) crons: CronTrigger,
    pub(crate) retention: RetentionWorker,
    pub(crate) deadlines: DeadlineSweep,
}

impl CommandHandler {
    pub async fn dispatch(&self, command: Command) {
        if !self.elector.is_leader().await {
            tracing::debug!(command = command.name(), "Leadership lost before dispatch");
            command.reject(ColoniesError::LeadershipLost);
            return;
        }

        match command {
            Command::SubmitWorkflow { workflow, reply } => {
                let result = self
                    .graphs
                    .create_process_graph(&workflow, Submission::default())
                    .await;
                let _ = reply.send(result);
            }
            Command::SubmitFunction { spec, reply } => {
                let _ = reply.send(self.graphs.submit_function(spec).await);
            }
            Command::AddChild {
                graph_id,
                parent_id,
                executor_id,
                spec,
                insert,
                reply,
            } => {
                let result = self
                    .graphs
                    .add_child(graph_id, parent_id, executor_id, spec, insert)
                    .await;
                let _ = reply.send(result);
            }
            Command::Assign {
                executor_id,
                colony_name,
                cpu,
                memory,
                reply,
            } => {
                let result = self
                    .matcher
                    .assign(executor_id, &colony_name, cpu, memory)
                    .await;
                let _ = reply.send(result);
            }
            Command::SetOutput {
                process_id,
                executor_id,
                output,
                reply,
            } => {
                let _ = reply.send(self.graphs.set_output(process_id, executor_id, output).await);
            }
            Command::AddAttribute {
                attribute,
                executor_id,
                reply,
            } => {
                let _ = reply.send(self.graphs.add_attribute(attribute, executor_id).await);
            }
            Command::CloseSuccessful {
                process_id,
                executor_id,
                output,
                reply,
            } => {
                let result = self
                    .graphs
                    .close_successful(process_id, executor_id, output)
                    .await;
                let _ = reply.send(result);
            }
            Command::CloseFailed {
                process_id,
                executor_id,
                errors,
                reply,
            } => {
                let result = self.graphs.close_failed(process_id, executor_id, errors).await;
                let _ = reply.send(result);
            }
            Command::CancelProcess { process_id, reply } => {
                let _ = reply.send(self.graphs.cancel_process(process_id).await);
            }
            Command::CancelGraph { graph_id, reply } => {
                let _ = reply.send(self.graphs.cancel_graph(graph_id).await);
            }
            Command::RemoveProcess { process_id, reply } => {
                let _ = reply.send(self.graphs.remove_process(process_id).await);
            }
            Command::RemoveAllProcesses {
                colony_name,
                state,
                reply,
            } => {
                let _ = reply.send(self.graphs.remove_all_processes(&colony_name, state).await);
            }
            Command::RemoveGraph { graph_id, reply } => {
                let _ = reply.send(self.graphs.remove_graph(graph_id).await);
            }
            Command::RemoveAllGraphs {
                colony_name,
                state,
                reply,
            } => {
                let _ = reply.send(self.graphs.remove_all_graphs(&colony_name, state).await);
            }
            Command::AddGenerator { generator, reply } => {
                let _ = reply.send(self.generators.add(generator).await);
            }
            Command::PackGenerator {
                generator_id,
                arg,
                reply,
            } => {
                let _ = reply.send(self.generators.pack(generator_id, arg).await);
            }
            Command::RemoveGenerator { generator_id, reply } => {
                let _ = reply.send(self.remove_generator(generator_id).await);
            }
            Command::AddCron { cron, reply } => {
                let _ = reply.send(self.crons.add(cron).await);
            }
            Command::RunCron { cron_id, reply } => {
                let _ = reply.send(self.crons.run_now(cron_id).await);
            }
            Command::RemoveCron { cron_id, reply } => {
                let _ = reply.send(self.remove_cron(cron_id).await);
            }
            Command::PauseColony { colony_name, reply } => {
                let changed = self.pause.pause(&colony_name).await;
                if changed {
                    tracing::info!(colony = %colony_name, "Colony assignments paused");
                }
                let _ = reply.send(Ok(changed));
            }
            Command::ResumeColony { colony_name, reply } => {
                let changed = self.pause.resume(&colony_name).await;
                if changed {
                    tracing::info!(colony = %colony_name, "Colony assignments resumed");
                    self.events.publish(Event::ColonyResumed { colony_name });
                }
                let _ = reply.send(Ok(changed));
            }
            Command::AddExecutor { executor, reply } => {
                let _ = reply.send(self.add_executor(executor).await);
            }
            Command::ApproveExecutor { executor_id, reply } => {
                let result = self.set_executor_state(executor_id, ExecutorState::Approved).await;
                let _ = reply.send(result);
            }
            Command::RejectExecutor { executor_id, reply } => {
                let result = self.set_executor_state(executor_id, ExecutorState::Rejected).await;
                let _ = reply.send(result);
            }
            Command::RemoveExecutor { executor_id, reply } => {
                let _ = reply.send(self.remove_executor(executor_id).await);
            }
            Command::Background {
                sweep,
                lease,
                reply,
            } => {
                if lease.is_cancelled() {
                    let _ = reply.send(Err(ColoniesError::LeadershipLost));
                    return;
                }
                let result = match sweep {
                    Sweep::Generators => self
                        .generators
                        .trigger_all(&lease)
                        .await
                        .map(SweepOutcome::Submitted),
                    Sweep::Crons => self.crons.trigger_all(&lease).await.map(SweepOutcome::Submitted),
                    Sweep::Retention => self.retention.apply(&lease).await.map(SweepOutcome::Retention),
                    Sweep::Deadlines => self.deadlines.run(&lease).await.map(SweepOutcome::Deadlines),
                };
                let _ = reply.send(result);
            }
        }
    }

    async fn remove_generator(&self, generator_id: Uuid) -> Result<()> {
        if self.store.get_generator(&generator_id).await?.is_none() {
            return Err(ColoniesError::GeneratorNotFound(generator_id.to_string()));
        }
        self.store.remove_generator(&generator_id).await?;
        tracing::info!(generator_id = %generator_id, "Generator removed");
        Ok(())
    }

    async fn remove_cron(&self, cron_id: Uuid) -> Result<()> {
        if self.store.get_cron(&cron_id).await?.is_none() {
            return Err(ColoniesError::CronNotFound(cron_id.to_string()));
        }
        self.store.remove_cron(&cron_id).await?;
        tracing::info!(cron_id = %cron_id, "Cron removed");
        Ok(())
    }

    async fn add_executor(&self, mut executor: Executor) -> Result<Executor> {
        executor.state = ExecutorState::Pending;
        self.store.add_executor(executor.clone()).await?;
        tracing::info!(
            executor_id = %executor.id,
            name = %executor.name,
            colony = %executor.colony_name,
            executor_type = %executor.executor_type,
            "Executor registered"
        );
        Ok(executor)
    }

    async fn set_executor_state(&self, executor_id: Uuid, state: ExecutorState) -> Result<Executor> {
        let mut executor = self
            .store
            .get_executor(&executor_id)
            .await?
            .ok_or(ColoniesError::ExecutorNotFound(executor_id))?;
        executor.state = state;
        self.store.update_executor(&executor).await?;
        tracing::info!(executor_id = %executor_id, state = ?state, "Executor state changed");
        Ok(executor)
    }

    /// Processes running on the executor go back to waiting without
    /// consuming a retry.
    async fn remove_executor(&self, executor_id: Uuid) -> Result<()> {
        if self.store.get_executor(&executor_id).await?.is_none() {
            return Err(ColoniesError::ExecutorNotFound(executor_id));
        }
        let released = self.matcher.release_executor(executor_id, false).await?;
        self.store.remove_executor(&executor_id).await?;
        tracing::info!(executor_id = %executor_id, released, "Executor removed");
        Ok(())
    }
}
