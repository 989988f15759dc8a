use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ColoniesError, Result};
use crate::model::{Process, ProcessState};
use crate::scheduler::graph::GraphEngine;
use crate::scheduler::matcher::Matcher;
use crate::store::{ProcessQuery, ProcessStore};

pub const EXEC_TIME_EXCEEDED: &str = "Maximum execution time limit exceeded";
pub const WAIT_TIME_EXCEEDED: &str = "Maximum waiting time limit exceeded";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeadlineReport {
    pub unassigned: usize,
    pub failed: usize,
    pub stale_executors: usize,
}

/// Enforces `max_exec_time`, `max_wait_time` and executor liveness.
pub struct DeadlineSweep {
    store: Arc<dyn ProcessStore>,
    graphs: GraphEngine,
    matcher: Matcher,
    stale_executor_timeout_ms: u64,
}

impl DeadlineSweep {
    pub fn new(
        store: Arc<dyn ProcessStore>,
        graphs: GraphEngine,
        matcher: Matcher,
        stale_executor_timeout_ms: u64,
    ) -> Self {
        Self {
            store,
            graphs,
            matcher,
            stale_executor_timeout_ms,
        }
    }

    pub async fn run(&self, lease: &CancellationToken) -> Result<DeadlineReport> {
        let now = Utc::now();
        let mut report = DeadlineReport::default();

        self.sweep_running(now, lease, &mut report).await?;
        self.sweep_waiting(now, lease, &mut report).await?;
        if self.stale_executor_timeout_ms > 0 {
            self.sweep_executors(now, lease, &mut report).await?;
        }

        if report != DeadlineReport::default() {
            tracing::info!(
                unassigned = report.unassigned,
                failed = report.failed,
                stale_executors = report.stale_executors,
                "Deadline sweep finished"
            );
        }
        Ok(report)
    }

    async fn sweep_running(
        &self,
        now: DateTime<Utc>,
        lease: &CancellationToken,
        report: &mut DeadlineReport,
    ) -> Result<()> {
        let query = ProcessQuery {
            state: Some(ProcessState::Running),
            ..Default::default()
        };
        for candidate in self.store.find_processes(&query).await? {
            if lease.is_cancelled() {
                return Err(ColoniesError::LeadershipLost);
            }
            if !candidate.exec_deadline.is_some_and(|deadline| deadline < now) {
                continue;
            }
            let Some(mut process) = self.current(candidate.id, ProcessState::Running).await? else {
                continue;
            };
            if process.retries_exhausted() {
                tracing::warn!(process_id = %process.id, "Execution deadline passed, retries exhausted");
                self.graphs
                    .fail(&mut process, vec![EXEC_TIME_EXCEEDED.to_string()])
                    .await?;
                report.failed += 1;
            } else {
                tracing::info!(process_id = %process.id, "Execution deadline passed, releasing process");
                self.matcher.unassign(process.id).await?;
                report.unassigned += 1;
            }
        }
        Ok(())
    }

    async fn sweep_waiting(
        &self,
        now: DateTime<Utc>,
        lease: &CancellationToken,
        report: &mut DeadlineReport,
    ) -> Result<()> {
        let query = ProcessQuery {
            state: Some(ProcessState::Waiting),
            ..Default::default()
        };
        for candidate in self.store.find_processes(&query).await? {
            if lease.is_cancelled() {
                return Err(ColoniesError::LeadershipLost);
            }
            if !candidate.wait_deadline.is_some_and(|deadline| deadline < now) {
                continue;
            }
            // An earlier failure in this sweep may already have reached it
            let Some(mut process) = self.current(candidate.id, ProcessState::Waiting).await? else {
                continue;
            };
            tracing::info!(process_id = %process.id, "Waiting deadline passed");
            self.graphs
                .fail(&mut process, vec![WAIT_TIME_EXCEEDED.to_string()])
                .await?;
            report.failed += 1;
        }
        Ok(())
    }

    /// Fresh copy of a process still in `state`.
    async fn current(&self, id: Uuid, state: ProcessState) -> Result<Option<Process>> {
        Ok(self
            .store
            .get_process(&id)
            .await?
            .filter(|p| p.state == state))
    }

    async fn sweep_executors(
        &self,
        now: DateTime<Utc>,
        lease: &CancellationToken,
        report: &mut DeadlineReport,
    ) -> Result<()> {
        for executor in self.store.all_executors().await? {
            if lease.is_cancelled() {
                return Err(ColoniesError::LeadershipLost);
            }
            if executor.is_alive(now, self.stale_executor_timeout_ms) {
                continue;
            }
            let released = self.matcher.release_executor(executor.id, true).await?;
            if released > 0 {
                tracing::warn!(executor_id = %executor.id, released, "Executor went silent, processes released");
                report.stale_executors += 1;
                report.unassigned += released;
            }
        }
        Ok(())
    }
}
