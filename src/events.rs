use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::{Process, ProcessState};

/// Notifications published by the command queue worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A process changed state, or became eligible after its parents finished
    Process {
        process_id: Uuid,
        colony_name: String,
        executor_type: String,
        state: ProcessState,
        eligible: bool,
    },
    ColonyResumed { colony_name: String },
}

impl Event {
    pub fn for_process(process: &Process) -> Self {
        Event::Process {
            process_id: process.id,
            colony_name: process.colony_name.clone(),
            executor_type: process.spec.conditions.executor_type.clone(),
            state: process.state,
            eligible: process.is_eligible(),
        }
    }

    /// Whether an executor of `executor_type` waiting on `colony` could now find work.
    pub fn may_unblock_assign(&self, colony: &str, executor_type: &str) -> bool {
        match self {
            Event::Process {
                colony_name,
                executor_type: et,
                eligible,
                ..
            } => *eligible && colony_name == colony && et == executor_type,
            Event::ColonyResumed { colony_name } => colony_name == colony,
        }
    }
}

/// Broadcast fan-out for process events. Lagging receivers lose old events,
/// so waiters re-check the store after every wake-up.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: Event) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn process_changed(&self, process: &Process) {
        self.publish(Event::for_process(process));
    }
}
