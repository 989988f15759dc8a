use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cluster::leader::{LeaderElector, Role};
use crate::config::SchedulerConfig;
use crate::controller::{Command, CommandQueue, Sweep};
use crate::error::ColoniesError;

/// Runs the leader-only loops for as long as this node holds the lease.
pub struct LeaderSupervisor {
    elector: Arc<LeaderElector>,
    queue: CommandQueue,
    config: SchedulerConfig,
}

struct Term {
    token: CancellationToken,
    loops: JoinSet<()>,
}

impl LeaderSupervisor {
    pub fn new(elector: Arc<LeaderElector>, queue: CommandQueue, config: SchedulerConfig) -> Self {
        Self {
            elector,
            queue,
            config,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut roles = self.elector.subscribe();
        let mut term: Option<Term> = None;

        loop {
            let role = *roles.borrow_and_update();
            match (role, term.is_some()) {
                (Role::Leader, false) => term = Some(self.start_term(&shutdown)),
                (Role::Follower, true) => {
                    if let Some(t) = term.take() {
                        stop_term(t).await;
                    }
                }
                _ => {}
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = roles.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        if let Some(t) = term.take() {
            stop_term(t).await;
        }
    }

    fn start_term(&self, shutdown: &CancellationToken) -> Term {
        let token = shutdown.child_token();
        let mut loops = JoinSet::new();

        let mut sweeps = vec![
            (Sweep::Generators, self.config.generator_period()),
            (Sweep::Crons, self.config.cron_period()),
            (Sweep::Deadlines, self.config.release_period()),
        ];
        if self.config.retention {
            sweeps.push((Sweep::Retention, self.config.retention_check_period()));
        }

        for (sweep, period) in sweeps {
            loops.spawn(sweep_loop(
                sweep,
                period,
                self.queue.clone(),
                token.clone(),
                Duration::from_millis(self.config.loop_error_backoff_ms),
                Duration::from_millis(self.config.loop_error_backoff_max_ms),
            ));
        }
        tracing::info!(node = %self.elector.node_name(), loops = loops.len(), "Leader loops started");
        Term { token, loops }
    }
}

async fn stop_term(mut term: Term) {
    term.token.cancel();
    while let Some(joined) = term.loops.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Leader loop panicked");
        }
    }
    tracing::info!("Leader loops stopped");
}

/// Submit `sweep` every `period` until `lease` is cancelled. Store and
/// coordinator errors double the delay up to `backoff_max`.
async fn sweep_loop(
    sweep: Sweep,
    period: Duration,
    queue: CommandQueue,
    lease: CancellationToken,
    backoff: Duration,
    backoff_max: Duration,
) {
    let mut delay = period;
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            _ = lease.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        let token = lease.clone();
        let result = queue
            .request(|reply| Command::Background {
                sweep,
                lease: token,
                reply,
            })
            .await;

        match result {
            Ok(outcome) => {
                tracing::trace!(sweep = %sweep, outcome = ?outcome, "Sweep finished");
                failures = 0;
                delay = period;
            }
            Err(ColoniesError::LeadershipLost) => {
                tracing::debug!(sweep = %sweep, "Sweep aborted, leadership lost");
            }
            Err(ColoniesError::QueueClosed) => break,
            Err(e) if e.is_unavailable() => {
                failures = failures.saturating_add(1);
                delay = backoff_delay(backoff, backoff_max, failures);
                tracing::warn!(sweep = %sweep, error = %e, retry_ms = delay.as_millis() as u64, "Sweep failed, backing off");
            }
            Err(e) => {
                tracing::warn!(sweep = %sweep, error = %e, "Sweep failed");
                delay = period;
            }
        }
    }
}

/// `base * 2^(failures - 1)`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.saturating_sub(1).min(16));
    base.saturating_mul(factor).min(max)
}
