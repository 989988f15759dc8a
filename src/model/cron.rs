use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ColoniesError, Result};
use crate::model::workflow::WorkflowSpec;
use crate::model::{add_seconds, MAX_DURATION_SECS};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cron {
    pub id: Uuid,
    pub name: String,
    pub colony_name: String,
    pub workflow: WorkflowSpec,
    /// Cron expression with 5 or 6 fields; ignored when `interval` is positive
    pub cron_expression: String,
    /// Seconds between runs
    pub interval: i64,
    /// Pick a random point within each interval instead of its end
    pub random: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub prev_graph_id: Option<Uuid>,
    pub wait_for_prev_graph: bool,
    pub one_shot: bool,
    /// Number of completed runs, part of the recovered ID
    pub run_sequence: u64,
}

impl Cron {
    pub fn with_expression(
        name: impl Into<String>,
        colony_name: impl Into<String>,
        workflow: WorkflowSpec,
        cron_expression: impl Into<String>,
    ) -> Self {
        Self::build(name.into(), colony_name.into(), workflow, cron_expression.into(), 0)
    }

    pub fn with_interval(
        name: impl Into<String>,
        colony_name: impl Into<String>,
        workflow: WorkflowSpec,
        interval_secs: i64,
    ) -> Self {
        Self::build(name.into(), colony_name.into(), workflow, String::new(), interval_secs)
    }

    fn build(
        name: String,
        colony_name: String,
        workflow: WorkflowSpec,
        cron_expression: String,
        interval: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            colony_name,
            workflow,
            cron_expression,
            interval,
            random: false,
            next_run: None,
            last_run: None,
            prev_graph_id: None,
            wait_for_prev_graph: false,
            one_shot: false,
            run_sequence: 0,
        }
    }

    pub fn one_shot(mut self) -> Self {
        self.one_shot = true;
        self
    }

    pub fn wait_for_prev(mut self) -> Self {
        self.wait_for_prev_graph = true;
        self
    }

    pub fn randomized(mut self) -> Self {
        self.random = true;
        self
    }

    pub fn recovered_id(&self) -> String {
        format!("cron:{}:{}", self.id, self.run_sequence)
    }

    pub fn has_expired(&self, now: DateTime<Utc>) -> bool {
        self.next_run.is_some_and(|next| next <= now)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval > MAX_DURATION_SECS {
            return Err(ColoniesError::InvalidCron(format!(
                "interval {} exceeds {MAX_DURATION_SECS} seconds",
                self.interval
            )));
        }
        if self.interval > 0 {
            return Ok(());
        }
        if self.cron_expression.trim().is_empty() {
            return Err(ColoniesError::InvalidCron(
                "either a cron expression or a positive interval is required".to_string(),
            ));
        }
        parse_expression(&self.cron_expression).map(|_| ())
    }

    /// Next fire time after `from`.
    pub fn calc_next_run(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
        if self.interval > 0 {
            let secs = if self.random {
                rand::thread_rng().gen_range(1..=self.interval)
            } else {
                self.interval
            };
            return add_seconds(from, secs).ok_or_else(|| {
                ColoniesError::InvalidCron(format!("interval {secs} is out of range"))
            });
        }

        let cron = parse_expression(&self.cron_expression)?;
        cron.iter_after(from).next().ok_or_else(|| {
            ColoniesError::InvalidCron(format!(
                "expression {} has no future occurrence",
                self.cron_expression
            ))
        })
    }
}

/// Five-field expressions get a leading seconds field.
fn parse_expression(expr: &str) -> Result<croner::Cron> {
    let trimmed = expr.trim();
    let normalized = match trimmed.split_whitespace().count() {
        5 => format!("0 {trimmed}"),
        6 => trimmed.to_string(),
        n => {
            return Err(ColoniesError::InvalidCron(format!(
                "expected 5 or 6 fields, got {n}: {trimmed}"
            )))
        }
    };
    normalized
        .parse::<croner::Cron>()
        .map_err(|e| ColoniesError::InvalidCron(format!("{trimmed}: {e}")))
}
