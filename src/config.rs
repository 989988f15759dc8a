use std::time::Duration;

/// Tuning for the scheduling core and its leader-only background loops.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the generator trigger loop evaluates generators
    pub generator_period_ms: u64,
    /// How often the cron trigger loop sweeps crons
    pub cron_period_ms: u64,
    /// How often exec/wait deadlines and stale executors are checked
    pub release_period_ms: u64,
    /// How often the retention worker runs
    pub retention_period_check_ms: u64,
    /// Enable the retention worker
    pub retention: bool,
    /// Minimum number of terminal items kept per colony regardless of age
    pub retention_policy: usize,
    /// Terminal items older than this are eligible for deletion
    pub retention_period_secs: u64,
    /// Processes targeted at an executor set only match listed executors.
    /// When false, `executor_ids` on a function spec is advisory.
    pub exclusive_assign: bool,
    /// Executors not heard from within this window lose their running processes.
    /// Zero disables the check.
    pub stale_executor_timeout_ms: u64,
    /// Capacity of each command queue lane
    pub queue_capacity: usize,
    /// Capacity of the process event broadcast channel
    pub event_capacity: usize,
    /// Initial backoff after a background loop hits an unavailable store
    pub loop_error_backoff_ms: u64,
    /// Upper bound for the doubling backoff
    pub loop_error_backoff_max_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            generator_period_ms: 1000,
            cron_period_ms: 1000,
            release_period_ms: 1000,
            retention_period_check_ms: 60_000,
            retention: false,
            retention_policy: 100,
            retention_period_secs: 7 * 24 * 3600,
            exclusive_assign: true,
            stale_executor_timeout_ms: 0,
            queue_capacity: 1024,
            event_capacity: 1024,
            loop_error_backoff_ms: 500,
            loop_error_backoff_max_ms: 30_000,
        }
    }
}

impl SchedulerConfig {
    pub fn with_retention(mut self, policy: usize, period_secs: u64) -> Self {
        self.retention = true;
        self.retention_policy = policy;
        self.retention_period_secs = period_secs;
        self
    }

    pub fn generator_period(&self) -> Duration {
        Duration::from_millis(self.generator_period_ms)
    }

    pub fn cron_period(&self) -> Duration {
        Duration::from_millis(self.cron_period_ms)
    }

    pub fn release_period(&self) -> Duration {
        Duration::from_millis(self.release_period_ms)
    }

    pub fn retention_check_period(&self) -> Duration {
        Duration::from_millis(self.retention_period_check_ms)
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Unique name of this node, used as the lease holder identity
    pub node_name: String,
    /// Name of the leadership lease in the coordination service
    pub lease_name: String,
    pub lease_ttl_ms: u64,
    /// Lease renewal cadence; jitter of up to a quarter is added on top
    pub lease_renew_interval_ms: u64,
    pub scheduler: SchedulerConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "node-1".to_string(),
            lease_name: "colonies-leader".to_string(),
            lease_ttl_ms: 5000,
            lease_renew_interval_ms: 1000,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            ..Default::default()
        }
    }

    pub fn with_lease(mut self, ttl_ms: u64, renew_interval_ms: u64) -> Self {
        self.lease_ttl_ms = ttl_ms;
        self.lease_renew_interval_ms = renew_interval_ms;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_config_default() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.generator_period_ms, 1000);
        assert_eq!(cfg.cron_period_ms, 1000);
        assert!(!cfg.retention);
        assert_eq!(cfg.retention_policy, 100);
        assert!(cfg.exclusive_assign);
        assert_eq!(cfg.stale_executor_timeout_ms, 0);
    }

    #[test]
    fn scheduler_config_with_retention() {
        let cfg = SchedulerConfig::default().with_retention(10, 24 * 3600);
        assert!(cfg.retention);
        assert_eq!(cfg.retention_policy, 10);
        assert_eq!(cfg.retention_period_secs, 86_400);
    }

    #[test]
    fn node_config_default() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.node_name, "node-1");
        assert_eq!(cfg.lease_name, "colonies-leader");
        assert_eq!(cfg.lease_ttl(), Duration::from_secs(5));
        assert_eq!(cfg.lease_renew_interval_ms, 1000);
    }

    #[test]
    fn node_config_builders() {
        let cfg = NodeConfig::new("node-7")
            .with_lease(300, 50)
            .with_scheduler(SchedulerConfig {
                exclusive_assign: false,
                ..Default::default()
            });
        assert_eq!(cfg.node_name, "node-7");
        assert_eq!(cfg.lease_ttl_ms, 300);
        assert_eq!(cfg.lease_renew_interval_ms, 50);
        assert!(!cfg.scheduler.exclusive_assign);
    }
}
