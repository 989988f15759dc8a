use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::{ColoniesError, Result};
use crate::model::{GraphView, MAX_DURATION_SECS};
use crate::store::{ProcessQuery, ProcessStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub processes_removed: usize,
    pub graphs_removed: usize,
}

/// Deletes terminal processes and graphs older than the retention period,
/// always keeping the `policy` most recent of each kind per colony.
pub struct RetentionWorker {
    store: Arc<dyn ProcessStore>,
    policy: usize,
    period: Duration,
}

impl RetentionWorker {
    pub fn new(store: Arc<dyn ProcessStore>, policy: usize, period_secs: u64) -> Result<Self> {
        let period = i64::try_from(period_secs)
            .ok()
            .filter(|secs| *secs <= MAX_DURATION_SECS)
            .and_then(Duration::try_seconds)
            .ok_or_else(|| {
                ColoniesError::InvalidConfig(format!(
                    "retention period {period_secs}s exceeds {MAX_DURATION_SECS}s"
                ))
            })?;
        Ok(Self {
            store,
            policy,
            period,
        })
    }

    /// One sweep over every colony. Aborts with `LeadershipLost` when `lease`
    /// is cancelled between colonies.
    pub async fn apply(&self, lease: &CancellationToken) -> Result<RetentionReport> {
        let cutoff = Utc::now()
            .checked_sub_signed(self.period)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut report = RetentionReport::default();

        for colony in self.store.colonies().await? {
            if lease.is_cancelled() {
                return Err(ColoniesError::LeadershipLost);
            }
            report.graphs_removed += self.sweep_graphs(&colony, cutoff).await?;
            report.processes_removed += self.sweep_processes(&colony, cutoff).await?;
        }

        if report != RetentionReport::default() {
            tracing::info!(
                processes = report.processes_removed,
                graphs = report.graphs_removed,
                "Retention policy applied"
            );
        }
        Ok(report)
    }

    async fn sweep_graphs(&self, colony: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut terminal: Vec<(DateTime<Utc>, GraphView)> = Vec::new();
        for graph in self.store.find_graphs(colony, None).await? {
            let members = self.store.graph_members(&graph.id).await?;
            let view = GraphView::resolve(graph, &members);
            if !view.state.is_terminal() || view.counts.running > 0 || view.counts.waiting > 0 {
                continue;
            }
            let ended = view.ended_at.unwrap_or(view.graph.submitted_at);
            terminal.push((ended, view));
        }
        terminal.sort_by(|a, b| b.0.cmp(&a.0));

        let mut removed = 0;
        for (ended, view) in terminal.into_iter().skip(self.policy) {
            if ended < cutoff {
                self.store.remove_graph(&view.graph.id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn sweep_processes(&self, colony: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut terminal: Vec<_> = self
            .store
            .find_processes(&ProcessQuery::colony(colony).standalone())
            .await?
            .into_iter()
            .filter(|p| p.state.is_terminal())
            .filter_map(|p| p.ended_at.map(|ended| (ended, p.id)))
            .collect();
        terminal.sort_by(|a, b| b.0.cmp(&a.0));

        let mut removed = 0;
        for (ended, id) in terminal.into_iter().skip(self.policy) {
            if ended < cutoff {
                self.store.remove_process(&id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
