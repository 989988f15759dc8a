use chrono::{DateTime, Duration, Utc};

pub mod attribute;
pub mod cron;
pub mod executor;
pub mod generator;
pub mod graph;
pub mod process;
pub mod workflow;

pub use attribute::{Attribute, AttributeKind};
pub use cron::Cron;
pub use executor::{Executor, ExecutorState};
pub use generator::{Generator, GeneratorArg, GeneratorState, TriggerDecision};
pub use graph::{GraphView, ProcessGraph, StateCounts};
pub use process::{Conditions, FunctionSpec, Process, ProcessState};
pub use workflow::{WorkflowDefect, WorkflowSpec};

/// Longest time limit, timeout or interval accepted from clients, in seconds
/// (one hundred years).
pub const MAX_DURATION_SECS: i64 = 100 * 365 * 24 * 3600;

/// `from` shifted by `secs`, or `None` when the result is not representable.
pub(crate) fn add_seconds(from: DateTime<Utc>, secs: i64) -> Option<DateTime<Utc>> {
    Duration::try_seconds(secs).and_then(|delta| from.checked_add_signed(delta))
}
