use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ColoniesError, Result};
use crate::model::{
    Attribute, Cron, Executor, FunctionSpec, Generator, GraphView, Process, ProcessGraph, ProcessState,
    WorkflowSpec,
};
use crate::scheduler::{Assignment, DeadlineReport, RetentionReport};

pub type Reply<T> = oneshot::Sender<Result<T>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    /// Client calls waiting on a reply
    Blocking,
    /// Leader-only periodic sweeps
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sweep {
    Generators,
    Crons,
    Retention,
    Deadlines,
}

impl std::fmt::Display for Sweep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sweep::Generators => write!(f, "generators"),
            Sweep::Crons => write!(f, "crons"),
            Sweep::Retention => write!(f, "retention"),
            Sweep::Deadlines => write!(f, "deadlines"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    Submitted(usize),
    Retention(RetentionReport),
    Deadlines(DeadlineReport),
}

/// A mutation executed by the queue worker. Each variant carries the
/// sender its result is delivered on.
#[derive(Debug)]
pub enum Command {
    SubmitWorkflow {
        workflow: WorkflowSpec,
        reply: Reply<ProcessGraph>,
    },
    SubmitFunction {
        spec: FunctionSpec,
        reply: Reply<Process>,
    },
    AddChild {
        graph_id: Uuid,
        parent_id: Uuid,
        executor_id: Uuid,
        spec: FunctionSpec,
        insert: bool,
        reply: Reply<Process>,
    },
    Assign {
        executor_id: Uuid,
        colony_name: String,
        cpu: u64,
        memory: u64,
        reply: Reply<Assignment>,
    },
    SetOutput {
        process_id: Uuid,
        executor_id: Uuid,
        output: Vec<Value>,
        reply: Reply<()>,
    },
    AddAttribute {
        attribute: Attribute,
        executor_id: Uuid,
        reply: Reply<Attribute>,
    },
    CloseSuccessful {
        process_id: Uuid,
        executor_id: Uuid,
        output: Option<Vec<Value>>,
        reply: Reply<Process>,
    },
    CloseFailed {
        process_id: Uuid,
        executor_id: Uuid,
        errors: Vec<String>,
        reply: Reply<Process>,
    },
    CancelProcess {
        process_id: Uuid,
        reply: Reply<Process>,
    },
    CancelGraph {
        graph_id: Uuid,
        reply: Reply<GraphView>,
    },
    RemoveProcess {
        process_id: Uuid,
        reply: Reply<()>,
    },
    RemoveAllProcesses {
        colony_name: String,
        state: Option<ProcessState>,
        reply: Reply<usize>,
    },
    RemoveGraph {
        graph_id: Uuid,
        reply: Reply<()>,
    },
    RemoveAllGraphs {
        colony_name: String,
        state: Option<ProcessState>,
        reply: Reply<usize>,
    },
    AddGenerator {
        generator: Generator,
        reply: Reply<Generator>,
    },
    PackGenerator {
        generator_id: Uuid,
        arg: String,
        reply: Reply<Generator>,
    },
    RemoveGenerator {
        generator_id: Uuid,
        reply: Reply<()>,
    },
    AddCron {
        cron: Cron,
        reply: Reply<Cron>,
    },
    RunCron {
        cron_id: Uuid,
        reply: Reply<Option<ProcessGraph>>,
    },
    RemoveCron {
        cron_id: Uuid,
        reply: Reply<()>,
    },
    PauseColony {
        colony_name: String,
        reply: Reply<bool>,
    },
    ResumeColony {
        colony_name: String,
        reply: Reply<bool>,
    },
    AddExecutor {
        executor: Executor,
        reply: Reply<Executor>,
    },
    ApproveExecutor {
        executor_id: Uuid,
        reply: Reply<Executor>,
    },
    RejectExecutor {
        executor_id: Uuid,
        reply: Reply<Executor>,
    },
    RemoveExecutor {
        executor_id: Uuid,
        reply: Reply<()>,
    },
    /// Periodic sweep for the leadership term that owns `lease`
    Background {
        sweep: Sweep,
        lease: CancellationToken,
        reply: Reply<SweepOutcome>,
    },
}

impl Command {
    pub fn lane(&self) -> Lane {
        match self {
            Command::Background { .. } => Lane::Background,
            _ => Lane::Blocking,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::SubmitWorkflow { .. } => "submit_workflow",
            Command::SubmitFunction { .. } => "submit_function",
            Command::AddChild { .. } => "add_child",
            Command::Assign { .. } => "assign",
            Command::SetOutput { .. } => "set_output",
            Command::AddAttribute { .. } => "add_attribute",
            Command::CloseSuccessful { .. } => "close_successful",
            Command::CloseFailed { .. } => "close_failed",
            Command::CancelProcess { .. } => "cancel_process",
            Command::CancelGraph { .. } => "cancel_graph",
            Command::RemoveProcess { .. } => "remove_process",
            Command::RemoveAllProcesses { .. } => "remove_all_processes",
            Command::RemoveGraph { .. } => "remove_graph",
            Command::RemoveAllGraphs { .. } => "remove_all_graphs",
            Command::AddGenerator { .. } => "add_generator",
            Command::PackGenerator { .. } => "pack_generator",
            Command::RemoveGenerator { .. } => "remove_generator",
            Command::AddCron { .. } => "add_cron",
            Command::RunCron { .. } => "run_cron",
            Command::RemoveCron { .. } => "remove_cron",
            Command::PauseColony { .. } => "pause_colony",
            Command::ResumeColony { .. } => "resume_colony",
            Command::AddExecutor { .. } => "add_executor",
            Command::ApproveExecutor { .. } => "approve_executor",
            Command::RejectExecutor { .. } => "reject_executor",
            Command::RemoveExecutor { .. } => "remove_executor",
            Command::Background { .. } => "background",
        }
    }

    /// Answer the command with `err` without executing it.
    pub fn reject(self, err: ColoniesError) {
        // A caller that stopped waiting has dropped its receiver
        match self {
            Command::SubmitWorkflow { reply, .. } => drop(reply.send(Err(err))),
            Command::SubmitFunction { reply, .. }
            | Command::AddChild { reply, .. }
            | Command::CloseSuccessful { reply, .. }
            | Command::CloseFailed { reply, .. }
            | Command::CancelProcess { reply, .. } => drop(reply.send(Err(err))),
            Command::Assign { reply, .. } => drop(reply.send(Err(err))),
            Command::AddAttribute { reply, .. } => drop(reply.send(Err(err))),
            Command::SetOutput { reply, .. }
            | Command::RemoveProcess { reply, .. }
            | Command::RemoveGraph { reply, .. }
            | Command::RemoveGenerator { reply, .. }
            | Command::RemoveCron { reply, .. }
            | Command::RemoveExecutor { reply, .. } => drop(reply.send(Err(err))),
            Command::CancelGraph { reply, .. } => drop(reply.send(Err(err))),
            Command::RemoveAllProcesses { reply, .. } | Command::RemoveAllGraphs { reply, .. } => {
                drop(reply.send(Err(err)))
            }
            Command::AddGenerator { reply, .. } | Command::PackGenerator { reply, .. } => {
                drop(reply.send(Err(err)))
            }
            Command::AddCron { reply, .. } => drop(reply.send(Err(err))),
            Command::RunCron { reply, .. } => drop(reply.send(Err(err))),
            Command::PauseColony { reply, .. } | Command::ResumeColony { reply, .. } => {
                drop(reply.send(Err(err)))
            }
            Command::AddExecutor { reply, .. }
            | Command::ApproveExecutor { reply, .. }
            | Command::RejectExecutor { reply, .. } => drop(reply.send(Err(err))),
            Command::Background { reply, .. } => drop(reply.send(Err(err))),
        }
    }
}
