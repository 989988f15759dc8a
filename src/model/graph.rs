use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::process::{Process, ProcessState};

/// A DAG instance created from a workflow spec.
///
/// The aggregate state is not stored; see [`GraphView`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessGraph {
    pub id: Uuid,
    pub colony_name: String,
    pub roots: Vec<Uuid>,
    pub process_ids: Vec<Uuid>,
    /// Set when expansion or notification found an inconsistency
    pub defunct: bool,
    pub errors: Vec<String>,
    pub cancelled: bool,
    /// Recovered ID of the trigger submission that created this graph
    pub idempotency_key: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

impl ProcessGraph {
    pub fn new(colony_name: impl Into<String>, idempotency_key: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            colony_name: colony_name.into(),
            roots: Vec::new(),
            process_ids: Vec::new(),
            defunct: false,
            errors: Vec::new(),
            cancelled: false,
            idempotency_key,
            submitted_at: Utc::now(),
        }
    }

    pub fn contains(&self, process_id: &Uuid) -> bool {
        self.process_ids.contains(process_id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub waiting: usize,
    pub running: usize,
    pub success: usize,
    pub failed: usize,
}

impl StateCounts {
    pub fn tally<'a>(processes: impl IntoIterator<Item = &'a Process>) -> Self {
        let mut counts = Self::default();
        for p in processes {
            match p.state {
                ProcessState::Waiting => counts.waiting += 1,
                ProcessState::Running => counts.running += 1,
                ProcessState::Success => counts.success += 1,
                ProcessState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.waiting + self.running + self.success + self.failed
    }
}

/// A graph together with its derived state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphView {
    pub graph: ProcessGraph,
    pub state: ProcessState,
    pub counts: StateCounts,
    /// Latest member end time once the graph is terminal
    pub ended_at: Option<DateTime<Utc>>,
}

impl GraphView {
    pub fn resolve(graph: ProcessGraph, members: &[Process]) -> Self {
        let counts = StateCounts::tally(members);
        let state = aggregate_state(graph.defunct, &counts);
        let ended_at = if state.is_terminal() {
            members.iter().filter_map(|p| p.ended_at).max()
        } else {
            None
        };
        Self {
            graph,
            state,
            counts,
            ended_at,
        }
    }
}

/// FAILED if defunct or any member failed, SUCCESS if every member succeeded,
/// RUNNING once any member has started, otherwise WAITING.
pub fn aggregate_state(defunct: bool, counts: &StateCounts) -> ProcessState {
    if defunct || counts.failed > 0 {
        ProcessState::Failed
    } else if counts.total() > 0 && counts.success == counts.total() {
        ProcessState::Success
    } else if counts.running > 0 || counts.success > 0 {
        ProcessState::Running
    } else {
        ProcessState::Waiting
    }
}
