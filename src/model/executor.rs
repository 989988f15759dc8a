use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutorState {
    Pending,
    Approved,
    Rejected,
}

/// A registered worker identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Executor {
    pub id: Uuid,
    pub name: String,
    pub colony_name: String,
    pub executor_type: String,
    pub state: ExecutorState,
    /// Millicores
    pub cpu: u64,
    /// MiB
    pub memory: u64,
    pub last_heard_from: DateTime<Utc>,
}

impl Executor {
    pub fn new(
        name: impl Into<String>,
        colony_name: impl Into<String>,
        executor_type: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            colony_name: colony_name.into(),
            executor_type: executor_type.into(),
            state: ExecutorState::Pending,
            cpu: 0,
            memory: 0,
            last_heard_from: Utc::now(),
        }
    }

    pub fn with_capacity(mut self, cpu: u64, memory: u64) -> Self {
        self.cpu = cpu;
        self.memory = memory;
        self
    }

    pub fn is_approved(&self) -> bool {
        self.state == ExecutorState::Approved
    }

    pub fn is_alive(&self, now: DateTime<Utc>, timeout_ms: u64) -> bool {
        let timeout_ms = i64::try_from(timeout_ms).unwrap_or(i64::MAX);
        (now - self.last_heard_from).num_milliseconds() < timeout_ms
    }
}
