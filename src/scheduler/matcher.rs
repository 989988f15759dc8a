use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{ColoniesError, Result};
use crate::events::EventBus;
use crate::model::{Executor, Process, ProcessState};
use crate::scheduler::graph::GraphEngine;
use crate::scheduler::pause::PauseFlags;
use crate::store::{ProcessQuery, ProcessStore};

/// Result of an assignment attempt. `NoMatch` is not an error: callers back
/// off or long-poll.
#[derive(Debug, Clone)]
pub enum Assignment {
    Assigned(Process),
    NoMatch,
}

impl Assignment {
    pub fn process(&self) -> Option<&Process> {
        match self {
            Assignment::Assigned(p) => Some(p),
            Assignment::NoMatch => None,
        }
    }

    pub fn into_process(self) -> Option<Process> {
        match self {
            Assignment::Assigned(p) => Some(p),
            Assignment::NoMatch => None,
        }
    }
}

/// Pairs executors with waiting processes.
#[derive(Clone)]
pub struct Matcher {
    store: Arc<dyn ProcessStore>,
    events: EventBus,
    graphs: GraphEngine,
    pause: PauseFlags,
    exclusive_assign: bool,
}

impl Matcher {
    pub fn new(
        store: Arc<dyn ProcessStore>,
        events: EventBus,
        graphs: GraphEngine,
        pause: PauseFlags,
        exclusive_assign: bool,
    ) -> Self {
        Self {
            store,
            events,
            graphs,
            pause,
            exclusive_assign,
        }
    }

    async fn load_executor(&self, executor_id: Uuid) -> Result<Executor> {
        self.store
            .get_executor(&executor_id)
            .await?
            .ok_or(ColoniesError::ExecutorNotFound(executor_id))
    }

    fn matches_target(&self, process: &Process, executor_id: Uuid) -> bool {
        let targets = &process.spec.conditions.executor_ids;
        !self.exclusive_assign || targets.is_empty() || targets.contains(&executor_id)
    }

    /// Hand the best eligible process in `colony` to `executor_id`.
    pub async fn assign(&self, executor_id: Uuid, colony: &str, cpu: u64, memory: u64) -> Result<Assignment> {
        let mut executor = self.load_executor(executor_id).await?;
        if !executor.is_approved() {
            return Err(ColoniesError::ExecutorNotEligible(
                executor_id,
                "executor is not approved".to_string(),
            ));
        }
        if executor.colony_name != colony {
            return Err(ColoniesError::ExecutorNotEligible(
                executor_id,
                format!("executor is not a member of colony {colony}"),
            ));
        }

        let now = Utc::now();
        executor.last_heard_from = now;
        self.store.update_executor(&executor).await?;

        if self.pause.is_paused(colony).await {
            tracing::debug!(executor_id = %executor_id, colony, "Assignments paused");
            return Ok(Assignment::NoMatch);
        }

        let candidates = self
            .store
            .find_candidates(colony, &executor.executor_type)
            .await?;
        let Some(mut process) = candidates
            .into_iter()
            .find(|p| !p.cancelled && p.fits(cpu, memory) && self.matches_target(p, executor_id))
        else {
            return Ok(Assignment::NoMatch);
        };

        if !process.parents.is_empty() {
            let mut input = Vec::new();
            for parent_id in &process.parents {
                if let Some(parent) = self.store.get_process(parent_id).await? {
                    input.extend(parent.output);
                }
            }
            process.input = input;
        }

        process.mark_running(executor_id, now);
        self.store.update_process(&process).await?;
        self.events.process_changed(&process);
        tracing::info!(process_id = %process.id, executor_id = %executor_id, colony, "Process assigned");
        Ok(Assignment::Assigned(process))
    }

    /// Return a running process to the queue after its executor was lost,
    /// or fail it once the retry budget is spent.
    pub async fn unassign(&self, process_id: Uuid) -> Result<Process> {
        self.release(process_id, true, "maximum retries exceeded").await
    }

    /// Like [`Matcher::unassign`] but without consuming a retry.
    pub async fn reset(&self, process_id: Uuid) -> Result<Process> {
        self.release(process_id, false, "").await
    }

    async fn release(&self, process_id: Uuid, count_retry: bool, exhausted_error: &str) -> Result<Process> {
        let mut process = self
            .store
            .get_process(&process_id)
            .await?
            .ok_or(ColoniesError::ProcessNotFound(process_id))?;
        if process.state != ProcessState::Running {
            return Err(ColoniesError::IllegalTransition(format!(
                "process {process_id} is {}, expected running",
                process.state
            )));
        }

        let executor = process.assigned_executor;
        if count_retry && process.retries_exhausted() {
            self.graphs
                .fail(&mut process, vec![exhausted_error.to_string()])
                .await?;
            tracing::warn!(process_id = %process_id, retries = process.retries, "Retry budget exhausted, process failed");
            return Ok(process);
        }

        if count_retry {
            process.retries += 1;
        }
        process.mark_waiting();
        self.store.update_process(&process).await?;
        self.events.process_changed(&process);
        tracing::info!(
            process_id = %process_id,
            executor_id = ?executor,
            retries = process.retries,
            "Process returned to waiting"
        );
        Ok(process)
    }

    /// Reset every process running on `executor_id`. Used when an executor is removed.
    pub async fn release_executor(&self, executor_id: Uuid, count_retry: bool) -> Result<usize> {
        let query = ProcessQuery {
            state: Some(ProcessState::Running),
            executor_id: Some(executor_id),
            ..Default::default()
        };
        let running = self.store.find_processes(&query).await?;
        let count = running.len();
        for process in running {
            if count_retry {
                self.unassign(process.id).await?;
            } else {
                self.reset(process.id).await?;
            }
        }
        Ok(count)
    }
}
