//! Time and volume based workflow submission.

pub mod cron;
pub mod generator;

pub use cron::CronTrigger;
pub use generator::GeneratorTrigger;
