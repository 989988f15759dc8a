use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cluster::{CoordinationService, LeaderElector, LeaderSupervisor};
use crate::config::NodeConfig;
use crate::controller::{run_worker, CommandHandler, CommandQueue, Controller, QueueReceiver};
use crate::error::Result;
use crate::events::EventBus;
use crate::scheduler::{DeadlineSweep, GraphEngine, Matcher, PauseFlags, RetentionWorker};
use crate::store::ProcessStore;
use crate::trigger::{CronTrigger, GeneratorTrigger};

/// One orchestrator replica. Every replica serves reads; only the lease
/// holder accepts mutations and runs the background loops.
pub struct Node {
    pub config: NodeConfig,
    controller: Controller,
    elector: Arc<LeaderElector>,
    handler: CommandHandler,
    receiver: QueueReceiver,
}

impl Node {
    /// Wire a replica. Fails on configuration values that cannot be used.
    pub fn new(
        config: NodeConfig,
        store: Arc<dyn ProcessStore>,
        coordinator: Arc<dyn CoordinationService>,
    ) -> Result<Self> {
        let scheduler = &config.scheduler;
        let events = EventBus::new(scheduler.event_capacity);
        let pause = PauseFlags::new();
        let elector = Arc::new(LeaderElector::new(&config, coordinator));
        let (queue, receiver) = CommandQueue::new(scheduler.queue_capacity);

        let graphs = GraphEngine::new(store.clone(), events.clone());
        let matcher = Matcher::new(
            store.clone(),
            events.clone(),
            graphs.clone(),
            pause.clone(),
            scheduler.exclusive_assign,
        );
        let handler = CommandHandler {
            store: store.clone(),
            events: events.clone(),
            elector: elector.clone(),
            pause: pause.clone(),
            generators: GeneratorTrigger::new(store.clone(), graphs.clone()),
            crons: CronTrigger::new(store.clone(), graphs.clone()),
            retention: RetentionWorker::new(
                store.clone(),
                scheduler.retention_policy,
                scheduler.retention_period_secs,
            )?,
            deadlines: DeadlineSweep::new(
                store.clone(),
                graphs.clone(),
                matcher.clone(),
                scheduler.stale_executor_timeout_ms,
            ),
            graphs,
            matcher,
        };
        let controller = Controller::new(queue, store, events, elector.clone(), pause);

        Ok(Self {
            config,
            controller,
            elector,
            handler,
            receiver,
        })
    }

    pub fn controller(&self) -> Controller {
        self.controller.clone()
    }

    pub fn elector(&self) -> Arc<LeaderElector> {
        self.elector.clone()
    }

    /// Run the node until `shutdown` is cancelled.
    ///
    /// Makes one leadership attempt up front, then spawns the command queue
    /// worker, the lease renewal loop and the leader supervisor, and waits
    /// for all three to stop.
    pub async fn run(self, shutdown: CancellationToken) {
        let Node {
            config,
            controller,
            elector,
            handler,
            receiver,
        } = self;

        match elector.try_become_leader().await {
            Ok(true) => tracing::info!(node = %config.node_name, "Started as leader"),
            Ok(false) => tracing::info!(node = %config.node_name, "Started as follower"),
            Err(e) => {
                tracing::warn!(node = %config.node_name, error = %e, "Initial leadership attempt failed")
            }
        }

        let mut tasks = JoinSet::new();
        tasks.spawn(run_worker(receiver, handler, shutdown.clone()));

        let renew = elector.clone();
        let renew_shutdown = shutdown.clone();
        tasks.spawn(async move { renew.run(renew_shutdown).await });

        let supervisor = LeaderSupervisor::new(
            elector.clone(),
            controller.queue().clone(),
            config.scheduler.clone(),
        );
        tasks.spawn(supervisor.run(shutdown.clone()));

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(node = %config.node_name, error = %e, "Node task panicked");
            }
        }
        tracing::info!(node = %config.node_name, "Node stopped");
    }
}
