use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ColoniesError, Result};
use crate::model::{Generator, GeneratorArg, ProcessGraph, TriggerDecision};
use crate::scheduler::{GraphEngine, Submission};
use crate::store::ProcessStore;

/// Accumulates packed arguments and turns them into workflow submissions.
#[derive(Clone)]
pub struct GeneratorTrigger {
    store: Arc<dyn ProcessStore>,
    graphs: GraphEngine,
}

impl GeneratorTrigger {
    pub fn new(store: Arc<dyn ProcessStore>, graphs: GraphEngine) -> Self {
        Self { store, graphs }
    }

    async fn load(&self, id: &Uuid) -> Result<Generator> {
        self.store
            .get_generator(id)
            .await?
            .ok_or_else(|| ColoniesError::GeneratorNotFound(id.to_string()))
    }

    pub async fn add(&self, generator: Generator) -> Result<Generator> {
        generator.validate()?;
        self.store.add_generator(generator.clone()).await?;
        tracing::info!(generator_id = %generator.id, name = %generator.name, colony = %generator.colony_name, "Generator added");
        Ok(generator)
    }

    pub async fn pack(&self, generator_id: Uuid, arg: String) -> Result<Generator> {
        let mut generator = self.load(&generator_id).await?;
        self.store
            .add_generator_arg(GeneratorArg::new(generator_id, arg))
            .await?;
        generator.counter += 1;
        if generator.first_pack.is_none() {
            generator.first_pack = Some(Utc::now());
        }
        self.store.update_generator(&generator).await?;
        tracing::debug!(generator_id = %generator_id, counter = generator.counter, "Generator packed");
        Ok(generator)
    }

    /// Evaluate every generator once. Returns the number of workflows submitted.
    pub async fn trigger_all(&self, lease: &CancellationToken) -> Result<usize> {
        let mut submitted = 0;
        for mut generator in self.store.all_generators().await? {
            if lease.is_cancelled() {
                return Err(ColoniesError::LeadershipLost);
            }
            match self.trigger_one(&mut generator, lease, &mut submitted).await {
                Ok(()) => {}
                Err(e) if e.aborts_sweep() => return Err(e),
                Err(e) => {
                    tracing::warn!(generator_id = %generator.id, error = %e, "Generator trigger failed, skipping");
                }
            }
        }
        Ok(submitted)
    }

    async fn trigger_one(
        &self,
        generator: &mut Generator,
        lease: &CancellationToken,
        submitted: &mut usize,
    ) -> Result<()> {
        match generator.decide(Utc::now()) {
            TriggerDecision::None => {}
            TriggerDecision::Threshold { times } => {
                tracing::info!(generator_id = %generator.id, times, counter = generator.counter, "Generator threshold reached");
                for _ in 0..times {
                    if lease.is_cancelled() {
                        return Err(ColoniesError::LeadershipLost);
                    }
                    let count = generator.trigger;
                    self.submit(generator, count).await?;
                    *submitted += 1;
                }
            }
            TriggerDecision::Timeout { count } => {
                tracing::info!(generator_id = %generator.id, counter = count, "Generator timed out");
                self.submit(generator, count).await?;
                *submitted += 1;
            }
        }
        Ok(())
    }

    /// Submit one workflow with the `count` oldest args. The graph is created
    /// before the args are consumed, keyed by the recovered ID, so a repeat
    /// after a crash finds the existing graph.
    pub async fn submit(&self, generator: &mut Generator, count: usize) -> Result<ProcessGraph> {
        let args = self.store.generator_args(&generator.id, count).await?;
        let values: Vec<Value> = args.iter().map(|a| Value::String(a.arg.clone())).collect();
        let submission = Submission {
            args: values,
            idempotency_key: Some(generator.recovered_id()),
            ..Default::default()
        };
        let graph = self
            .graphs
            .create_process_graph(&generator.workflow, submission)
            .await?;

        let ids: Vec<Uuid> = args.iter().map(|a| a.id).collect();
        self.store.remove_generator_args(&ids).await?;
        generator.counter = generator.counter.saturating_sub(ids.len());
        generator.sequence += 1;
        generator.last_run = Some(Utc::now());
        self.store.update_generator(generator).await?;

        tracing::info!(
            generator_id = %generator.id,
            graph_id = %graph.id,
            args = ids.len(),
            "Generator submitted workflow"
        );
        Ok(graph)
    }
}
