use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::model::{add_seconds, MAX_DURATION_SECS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Waiting,
    Running,
    Success,
    Failed,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Success | ProcessState::Failed)
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Waiting => write!(f, "waiting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Success => write!(f, "success"),
            ProcessState::Failed => write!(f, "failed"),
        }
    }
}

/// Placement constraints for a function spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Conditions {
    pub colony_name: String,
    pub executor_type: String,
    /// Exclusive target set; empty means any executor of the right type
    pub executor_ids: Vec<Uuid>,
    /// Node names of parents within the same workflow
    pub dependencies: Vec<String>,
    /// Millicores
    pub cpu: u64,
    /// MiB
    pub memory: u64,
}

/// What to run and under which limits.
///
/// Time limits are in seconds and a value `<= 0` disables them.
/// `max_retries < 0` allows unlimited reassignments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionSpec {
    pub node_name: String,
    pub func_name: String,
    pub args: Vec<Value>,
    pub kwargs: HashMap<String, Value>,
    pub priority: i32,
    pub max_wait_time: i64,
    pub max_exec_time: i64,
    pub max_retries: i32,
    pub conditions: Conditions,
}

impl Default for FunctionSpec {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            func_name: String::new(),
            args: Vec::new(),
            kwargs: HashMap::new(),
            priority: 0,
            max_wait_time: -1,
            max_exec_time: -1,
            max_retries: -1,
            conditions: Conditions::default(),
        }
    }
}

impl FunctionSpec {
    pub fn new(
        node_name: impl Into<String>,
        func_name: impl Into<String>,
        colony_name: impl Into<String>,
        executor_type: impl Into<String>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            func_name: func_name.into(),
            conditions: Conditions {
                colony_name: colony_name.into(),
                executor_type: executor_type.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conditions.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_exec_time(mut self, secs: i64) -> Self {
        self.max_exec_time = secs;
        self
    }

    pub fn with_max_wait_time(mut self, secs: i64) -> Self {
        self.max_wait_time = secs;
        self
    }

    pub fn with_max_retries(mut self, retries: i32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_resources(mut self, cpu: u64, memory: u64) -> Self {
        self.conditions.cpu = cpu;
        self.conditions.memory = memory;
        self
    }

    pub fn with_executor_ids(mut self, ids: Vec<Uuid>) -> Self {
        self.conditions.executor_ids = ids;
        self
    }

    /// Both time limits fit within [`MAX_DURATION_SECS`].
    pub fn time_limits_in_range(&self) -> bool {
        self.max_wait_time <= MAX_DURATION_SECS && self.max_exec_time <= MAX_DURATION_SECS
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    pub id: Uuid,
    pub colony_name: String,
    pub spec: FunctionSpec,
    pub state: ProcessState,
    /// Set while a graph member still has unfinished parents; hidden from the matcher
    pub wait_for_parents: bool,
    pub assigned_executor: Option<Uuid>,
    pub graph_id: Option<Uuid>,
    pub parents: Vec<Uuid>,
    pub children: Vec<Uuid>,
    pub input: Vec<Value>,
    pub output: Vec<Value>,
    pub errors: Vec<String>,
    pub retries: i32,
    pub cancelled: bool,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub wait_deadline: Option<DateTime<Utc>>,
    pub exec_deadline: Option<DateTime<Utc>>,
}

impl Process {
    pub fn new(spec: FunctionSpec) -> Self {
        let now = Utc::now();
        let wait_deadline = if spec.max_wait_time > 0 {
            add_seconds(now, spec.max_wait_time)
        } else {
            None
        };
        Self {
            id: Uuid::new_v4(),
            colony_name: spec.conditions.colony_name.clone(),
            spec,
            state: ProcessState::Waiting,
            wait_for_parents: false,
            assigned_executor: None,
            graph_id: None,
            parents: Vec::new(),
            children: Vec::new(),
            input: Vec::new(),
            output: Vec::new(),
            errors: Vec::new(),
            retries: 0,
            cancelled: false,
            submitted_at: now,
            started_at: None,
            ended_at: None,
            wait_deadline,
            exec_deadline: None,
        }
    }

    /// WAITING, unblocked and not cancelled.
    pub fn is_eligible(&self) -> bool {
        self.state == ProcessState::Waiting && !self.wait_for_parents && !self.cancelled
    }

    pub fn is_assigned_to(&self, executor_id: Uuid) -> bool {
        self.assigned_executor == Some(executor_id)
    }

    /// Retries exhausted for the next loss of the executor.
    pub fn retries_exhausted(&self) -> bool {
        self.spec.max_retries >= 0 && self.retries >= self.spec.max_retries
    }

    pub fn fits(&self, cpu: u64, memory: u64) -> bool {
        self.spec.conditions.cpu <= cpu && self.spec.conditions.memory <= memory
    }

    pub(crate) fn mark_running(&mut self, executor_id: Uuid, now: DateTime<Utc>) {
        self.state = ProcessState::Running;
        self.assigned_executor = Some(executor_id);
        self.started_at = Some(now);
        self.exec_deadline = if self.spec.max_exec_time > 0 {
            add_seconds(now, self.spec.max_exec_time)
        } else {
            None
        };
    }

    pub(crate) fn mark_waiting(&mut self) {
        self.state = ProcessState::Waiting;
        self.assigned_executor = None;
        self.started_at = None;
        self.exec_deadline = None;
    }

    pub(crate) fn mark_success(&mut self, now: DateTime<Utc>) {
        self.state = ProcessState::Success;
        self.assigned_executor = None;
        self.ended_at = Some(now);
        self.exec_deadline = None;
    }

    pub(crate) fn mark_failed<I>(&mut self, errors: I, now: DateTime<Utc>)
    where
        I: IntoIterator<Item = String>,
    {
        self.state = ProcessState::Failed;
        self.assigned_executor = None;
        self.ended_at = Some(now);
        self.exec_deadline = None;
        self.errors.extend(errors);
    }
}
