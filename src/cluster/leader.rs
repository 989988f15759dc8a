use std::sync::Arc;

use rand::Rng;
use tokio::sync::{watch, RwLock};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::cluster::lease::CoordinationService;
use crate::config::NodeConfig;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// Renewal interval scattered over `[base/2, base]` so contenders do not
/// hit the coordinator in lockstep.
pub fn jittered_interval(base: Duration) -> Duration {
    let base_ms = base.as_millis().max(2) as u64;
    let ms = rand::thread_rng().gen_range(base_ms / 2..=base_ms);
    Duration::from_millis(ms)
}

/// Holds the leadership lease for one node and publishes role changes.
pub struct LeaderElector {
    node_name: String,
    lease_name: String,
    ttl: Duration,
    renew_interval: Duration,
    coordinator: Arc<dyn CoordinationService>,
    role_tx: watch::Sender<Role>,
    /// Local view of the lease expiry, measured from before the acquire call
    held_until: RwLock<Option<Instant>>,
}

impl LeaderElector {
    pub fn new(config: &NodeConfig, coordinator: Arc<dyn CoordinationService>) -> Self {
        let (role_tx, _) = watch::channel(Role::Follower);
        Self {
            node_name: config.node_name.clone(),
            lease_name: config.lease_name.clone(),
            ttl: config.lease_ttl(),
            renew_interval: Duration::from_millis(config.lease_renew_interval_ms),
            coordinator,
            role_tx,
            held_until: RwLock::new(None),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn subscribe(&self) -> watch::Receiver<Role> {
        self.role_tx.subscribe()
    }

    pub fn role(&self) -> Role {
        *self.role_tx.borrow()
    }

    /// Leader only while the lease is held and has not expired locally.
    pub async fn is_leader(&self) -> bool {
        if self.role() != Role::Leader {
            return false;
        }
        self.held_until
            .read()
            .await
            .is_some_and(|until| until > Instant::now())
    }

    /// Current lease holder according to the coordinator.
    pub async fn leader_name(&self) -> Result<Option<String>> {
        self.coordinator.holder(&self.lease_name).await
    }

    pub async fn members(&self) -> Result<Vec<String>> {
        self.coordinator.members(&self.lease_name).await
    }

    /// Acquire or renew the lease. A coordinator error demotes this node
    /// before it is returned.
    pub async fn try_become_leader(&self) -> Result<bool> {
        let started = Instant::now();
        match self
            .coordinator
            .try_acquire(&self.lease_name, &self.node_name, self.ttl)
            .await
        {
            Ok(true) => {
                *self.held_until.write().await = Some(started + self.ttl);
                self.set_role(Role::Leader);
                Ok(true)
            }
            Ok(false) => {
                self.demote().await;
                Ok(false)
            }
            Err(e) => {
                self.demote().await;
                Err(e)
            }
        }
    }

    /// Step down and hand the lease back.
    pub async fn resign(&self) -> Result<()> {
        let was_leader = self.role() == Role::Leader;
        self.demote().await;
        if was_leader {
            self.coordinator
                .release(&self.lease_name, &self.node_name)
                .await?;
            tracing::info!(node = %self.node_name, "Resigned leadership");
        }
        Ok(())
    }

    async fn demote(&self) {
        *self.held_until.write().await = None;
        self.set_role(Role::Follower);
    }

    fn set_role(&self, role: Role) {
        let changed = self.role_tx.send_if_modified(|current| {
            if *current == role {
                false
            } else {
                *current = role;
                true
            }
        });
        if changed {
            tracing::info!(node = %self.node_name, lease = %self.lease_name, role = %role, "Leadership changed");
        }
    }

    /// Renewal loop. Resigns on shutdown.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(jittered_interval(self.renew_interval)) => {
                    if let Err(e) = self.try_become_leader().await {
                        tracing::warn!(node = %self.node_name, error = %e, "Lease renewal failed");
                    }
                }
            }
        }
        if let Err(e) = self.resign().await {
            tracing::warn!(node = %self.node_name, error = %e, "Failed to release lease on shutdown");
        }
    }
}
