use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ColoniesError, Result};
use crate::model::workflow::WorkflowSpec;
use crate::model::{add_seconds, MAX_DURATION_SECS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeneratorState {
    Idle,
    Accumulating,
}

/// What a generator should do on this loop tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDecision {
    None,
    /// Submit `times` workflows of `trigger` args each
    Threshold { times: usize },
    /// Submit one workflow with every pending arg
    Timeout { count: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generator {
    pub id: Uuid,
    pub name: String,
    pub colony_name: String,
    pub workflow: WorkflowSpec,
    /// Number of packed args that triggers a submission
    pub trigger: usize,
    /// Seconds after the last run (or first pack) before pending args are flushed; `<= 0` disables
    pub timeout: i64,
    pub counter: usize,
    pub first_pack: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    /// Number of completed submissions, part of the recovered ID
    pub sequence: u64,
}

impl Generator {
    pub fn new(
        name: impl Into<String>,
        colony_name: impl Into<String>,
        workflow: WorkflowSpec,
        trigger: usize,
        timeout: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            colony_name: colony_name.into(),
            workflow,
            trigger,
            timeout,
            counter: 0,
            first_pack: None,
            last_run: None,
            sequence: 0,
        }
    }

    pub fn state(&self) -> GeneratorState {
        if self.counter == 0 {
            GeneratorState::Idle
        } else {
            GeneratorState::Accumulating
        }
    }

    pub fn recovered_id(&self) -> String {
        format!("generator:{}:{}", self.id, self.sequence)
    }

    fn timed_out(&self, now: DateTime<Utc>) -> bool {
        let since = match (self.last_run, self.first_pack) {
            (Some(last_run), _) => last_run,
            (None, Some(first_pack)) => first_pack,
            (None, None) => return false,
        };
        add_seconds(since, self.timeout).is_some_and(|deadline| now >= deadline)
    }

    pub fn validate(&self) -> Result<()> {
        if self.trigger == 0 {
            return Err(ColoniesError::InvalidWorkflow(
                "generator trigger must be at least 1".to_string(),
            ));
        }
        if self.timeout > MAX_DURATION_SECS {
            return Err(ColoniesError::InvalidWorkflow(format!(
                "generator timeout {} exceeds {MAX_DURATION_SECS} seconds",
                self.timeout
            )));
        }
        self.workflow.validate()?;
        Ok(())
    }

    pub fn decide(&self, now: DateTime<Utc>) -> TriggerDecision {
        if self.trigger > 0 && self.counter >= self.trigger {
            TriggerDecision::Threshold {
                times: self.counter / self.trigger,
            }
        } else if self.counter >= 1 && self.timeout > 0 && self.timed_out(now) {
            TriggerDecision::Timeout {
                count: self.counter,
            }
        } else {
            TriggerDecision::None
        }
    }
}

/// One packed argument waiting to be handed to a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorArg {
    pub id: Uuid,
    pub generator_id: Uuid,
    pub arg: String,
    pub added_at: DateTime<Utc>,
}

impl GeneratorArg {
    pub fn new(generator_id: Uuid, arg: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            generator_id,
            arg: arg.into(),
            added_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn generator(trigger: usize, timeout: i64) -> Generator {
        Generator::new("gen", "dev", WorkflowSpec::new("dev"), trigger, timeout)
    }

    #[test]
    fn below_threshold_does_nothing() {
        let mut g = generator(3, -1);
        g.counter = 2;
        assert_eq!(g.state(), GeneratorState::Accumulating);
        assert_eq!(g.decide(Utc::now()), TriggerDecision::None);
    }

    #[test]
    fn threshold_bursts() {
        let mut g = generator(3, -1);
        g.counter = 3;
        assert_eq!(g.decide(Utc::now()), TriggerDecision::Threshold { times: 1 });
        g.counter = 7;
        assert_eq!(g.decide(Utc::now()), TriggerDecision::Threshold { times: 2 });
    }

    #[test]
    fn timeout_counts_from_first_pack_then_last_run() {
        let now = Utc::now();
        let mut g = generator(10, 5);
        g.counter = 2;
        g.first_pack = Some(now - Duration::seconds(2));
        assert_eq!(g.decide(now), TriggerDecision::None);

        g.first_pack = Some(now - Duration::seconds(6));
        assert_eq!(g.decide(now), TriggerDecision::Timeout { count: 2 });

        g.last_run = Some(now - Duration::seconds(1));
        assert_eq!(g.decide(now), TriggerDecision::None);
    }

    #[test]
    fn timeout_needs_at_least_one_arg() {
        let now = Utc::now();
        let mut g = generator(10, 1);
        g.first_pack = Some(now - Duration::seconds(60));
        assert_eq!(g.state(), GeneratorState::Idle);
        assert_eq!(g.decide(now), TriggerDecision::None);
    }

    #[test]
    fn oversized_timeout_rejected_and_never_fires() {
        let mut g = Generator::new(
            "gen",
            "dev",
            WorkflowSpec::new("dev").with_function(crate::model::FunctionSpec::new("n", "f", "dev", "cli")),
            10,
            i64::MAX,
        );
        assert!(matches!(g.validate(), Err(ColoniesError::InvalidWorkflow(_))));

        g.counter = 1;
        g.first_pack = Some(Utc::now());
        assert_eq!(g.decide(Utc::now()), TriggerDecision::None);
    }

    #[test]
    fn recovered_id_tracks_sequence() {
        let mut g = generator(1, 0);
        let first = g.recovered_id();
        g.sequence += 1;
        assert_ne!(first, g.recovered_id());
        assert!(g.recovered_id().ends_with(":1"));
    }
}
