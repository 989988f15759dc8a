pub mod leader;
pub mod lease;
pub mod supervisor;

pub use leader::{LeaderElector, Role};
pub use lease::{CoordinationService, MemoryCoordinator};
pub use supervisor::LeaderSupervisor;
