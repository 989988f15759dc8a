use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ColoniesError {
    #[error("Not the leader, current leader is {0:?}")]
    NotLeader(Option<String>),

    #[error("Leadership lost while executing command")]
    LeadershipLost,

    #[error("Process not found: {0}")]
    ProcessNotFound(Uuid),

    #[error("Process graph not found: {0}")]
    GraphNotFound(Uuid),

    #[error("Generator not found: {0}")]
    GeneratorNotFound(String),

    #[error("Cron not found: {0}")]
    CronNotFound(String),

    #[error("Attribute not found: {0}")]
    AttributeNotFound(Uuid),

    #[error("Executor not found: {0}")]
    ExecutorNotFound(Uuid),

    #[error("Executor {0} may not take work: {1}")]
    ExecutorNotEligible(Uuid, String),

    #[error("Illegal transition: {0}")]
    IllegalTransition(String),

    #[error("Process graph {graph_id} is defunct: {reason}")]
    DefunctGraph { graph_id: Uuid, reason: String },

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Invalid cron: {0}")]
    InvalidCron(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Coordination service error: {0}")]
    Coordination(String),

    #[error("Command queue closed")]
    QueueClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ColoniesError {
    /// Errors that mean the backing services are unavailable rather than the
    /// request being wrong. Background loops back off on these.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ColoniesError::Store(_) | ColoniesError::Coordination(_))
    }

    /// Errors that stop a sweep outright. Anything else only concerns the
    /// record being processed.
    pub fn aborts_sweep(&self) -> bool {
        matches!(self, ColoniesError::LeadershipLost) || self.is_unavailable()
    }
}

pub type Result<T> = std::result::Result<T, ColoniesError>;
