pub mod deadline;
pub mod graph;
pub mod matcher;
pub mod pause;
pub mod retention;

pub use deadline::{DeadlineReport, DeadlineSweep};
pub use graph::{GraphEngine, Submission};
pub use matcher::{Assignment, Matcher};
pub use pause::PauseFlags;
pub use retention::{RetentionReport, RetentionWorker};
