use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ColoniesError, Result};
use crate::model::{Cron, ProcessGraph};
use crate::scheduler::{GraphEngine, Submission};
use crate::store::ProcessStore;

/// Fires cron workflows on their schedule.
#[derive(Clone)]
pub struct CronTrigger {
    store: Arc<dyn ProcessStore>,
    graphs: GraphEngine,
}

impl CronTrigger {
    pub fn new(store: Arc<dyn ProcessStore>, graphs: GraphEngine) -> Self {
        Self { store, graphs }
    }

    async fn load(&self, id: &Uuid) -> Result<Cron> {
        self.store
            .get_cron(id)
            .await?
            .ok_or_else(|| ColoniesError::CronNotFound(id.to_string()))
    }

    /// `next_run` stays unset until the first evaluation by the leader.
    pub async fn add(&self, mut cron: Cron) -> Result<Cron> {
        cron.validate()?;
        cron.workflow.validate()?;
        cron.next_run = None;
        self.store.add_cron(cron.clone()).await?;
        tracing::info!(cron_id = %cron.id, name = %cron.name, colony = %cron.colony_name, "Cron added");
        Ok(cron)
    }

    /// Evaluate every cron once. Returns the number of workflows started.
    pub async fn trigger_all(&self, lease: &CancellationToken) -> Result<usize> {
        let mut started = 0;
        for mut cron in self.store.all_crons().await? {
            if lease.is_cancelled() {
                return Err(ColoniesError::LeadershipLost);
            }
            let now = Utc::now();

            if cron.next_run.is_none() {
                match cron.calc_next_run(now) {
                    Ok(next) => {
                        cron.next_run = Some(next);
                        self.store.update_cron(&cron).await?;
                        tracing::debug!(cron_id = %cron.id, next_run = %next, "Cron scheduled");
                    }
                    Err(e) => tracing::warn!(cron_id = %cron.id, error = %e, "Cannot schedule cron"),
                }
                continue;
            }

            match self.fire_if_due(&mut cron, now).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) if e.aborts_sweep() => return Err(e),
                Err(e) => tracing::warn!(cron_id = %cron.id, error = %e, "Cron run failed, skipping"),
            }
        }
        Ok(started)
    }

    async fn fire_if_due(&self, cron: &mut Cron, now: DateTime<Utc>) -> Result<bool> {
        if !cron.has_expired(now) || self.should_wait(cron).await? {
            return Ok(false);
        }
        self.start(cron).await?;
        Ok(true)
    }

    /// Start the cron immediately. Returns `None` when the previous run is
    /// still active and the cron waits for it.
    pub async fn run_now(&self, cron_id: Uuid) -> Result<Option<ProcessGraph>> {
        let mut cron = self.load(&cron_id).await?;
        if self.should_wait(&cron).await? {
            tracing::info!(cron_id = %cron.id, "Previous run still active, not starting");
            return Ok(None);
        }
        self.start(&mut cron).await.map(Some)
    }

    async fn should_wait(&self, cron: &Cron) -> Result<bool> {
        if !cron.wait_for_prev_graph {
            return Ok(false);
        }
        let Some(prev) = cron.prev_graph_id else {
            return Ok(false);
        };
        match self.graphs.view(prev).await {
            Ok(view) => Ok(!view.state.is_terminal()),
            Err(ColoniesError::GraphNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Outputs of the previous run's leaves, in member order.
    async fn previous_output(&self, cron: &Cron) -> Result<Vec<Value>> {
        let Some(prev) = cron.prev_graph_id else {
            return Ok(Vec::new());
        };
        let members = self.store.graph_members(&prev).await?;
        Ok(members
            .into_iter()
            .filter(|p| p.children.is_empty())
            .flat_map(|p| p.output)
            .collect())
    }

    async fn start(&self, cron: &mut Cron) -> Result<ProcessGraph> {
        let submission = Submission {
            root_input: self.previous_output(cron).await?,
            idempotency_key: Some(cron.recovered_id()),
            ..Default::default()
        };
        let graph = self
            .graphs
            .create_process_graph(&cron.workflow, submission)
            .await?;
        tracing::info!(cron_id = %cron.id, graph_id = %graph.id, run = cron.run_sequence, "Cron started workflow");

        if cron.one_shot {
            self.store.remove_cron(&cron.id).await?;
            tracing::info!(cron_id = %cron.id, "One-shot cron removed");
            return Ok(graph);
        }

        let now = Utc::now();
        cron.next_run = Some(cron.calc_next_run(now)?);
        cron.last_run = Some(now);
        cron.prev_graph_id = Some(graph.id);
        cron.run_sequence += 1;
        self.store.update_cron(cron).await?;
        Ok(graph)
    }
}
