use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::error::{ColoniesError, Result};

/// Leadership lease and membership, backed by an external coordination service.
#[async_trait]
pub trait CoordinationService: Send + Sync {
    /// Acquire `lease` for `holder`, or renew it if `holder` already owns it.
    /// Returns false while another holder's lease is still live.
    async fn try_acquire(&self, lease: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Give up the lease. A no-op when `holder` does not own it.
    async fn release(&self, lease: &str, holder: &str) -> Result<()>;

    async fn holder(&self, lease: &str) -> Result<Option<String>>;

    /// Nodes that contended for `lease` within its TTL, sorted by name.
    async fn members(&self, lease: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Clone)]
struct LeaseRecord {
    holder: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Leases {
    held: HashMap<String, LeaseRecord>,
    seen: HashMap<String, HashMap<String, Instant>>,
}

/// In-process coordinator. Several nodes in one runtime can share it
/// through an `Arc` to elect a single leader.
#[derive(Debug)]
pub struct MemoryCoordinator {
    leases: Mutex<Leases>,
    available: AtomicBool,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self {
            leases: Mutex::new(Leases::default()),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ColoniesError::Coordination("coordinator unavailable".to_string()))
        }
    }
}

#[async_trait]
impl CoordinationService for MemoryCoordinator {
    async fn try_acquire(&self, lease: &str, holder: &str, ttl: Duration) -> Result<bool> {
        self.check()?;
        let now = Instant::now();
        let mut leases = self.leases.lock().await;
        leases
            .seen
            .entry(lease.to_string())
            .or_default()
            .insert(holder.to_string(), now + ttl);

        if let Some(record) = leases.held.get(lease) {
            if record.holder != holder && record.expires_at > now {
                return Ok(false);
            }
        }
        leases.held.insert(
            lease.to_string(),
            LeaseRecord {
                holder: holder.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, lease: &str, holder: &str) -> Result<()> {
        self.check()?;
        let mut leases = self.leases.lock().await;
        if leases.held.get(lease).is_some_and(|r| r.holder == holder) {
            leases.held.remove(lease);
        }
        if let Some(seen) = leases.seen.get_mut(lease) {
            seen.remove(holder);
        }
        Ok(())
    }

    async fn holder(&self, lease: &str) -> Result<Option<String>> {
        self.check()?;
        let now = Instant::now();
        let leases = self.leases.lock().await;
        Ok(leases
            .held
            .get(lease)
            .filter(|r| r.expires_at > now)
            .map(|r| r.holder.clone()))
    }

    async fn members(&self, lease: &str) -> Result<Vec<String>> {
        self.check()?;
        let now = Instant::now();
        let leases = self.leases.lock().await;
        let mut members: Vec<String> = leases
            .seen
            .get(lease)
            .map(|seen| {
                seen.iter()
                    .filter(|(_, expires)| **expires > now)
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn single_holder_until_expiry() {
        let coord = MemoryCoordinator::new();
        assert!(coord.try_acquire("l", "a", TTL).await.unwrap());
        assert!(!coord.try_acquire("l", "b", TTL).await.unwrap());
        assert!(coord.try_acquire("l", "a", TTL).await.unwrap());
        assert_eq!(coord.holder("l").await.unwrap().as_deref(), Some("a"));

        tokio::time::sleep(TTL + Duration::from_millis(50)).await;
        assert_eq!(coord.holder("l").await.unwrap(), None);
        assert!(coord.try_acquire("l", "b", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn release_only_by_holder() {
        let coord = MemoryCoordinator::new();
        coord.try_acquire("l", "a", TTL).await.unwrap();
        coord.release("l", "b").await.unwrap();
        assert_eq!(coord.holder("l").await.unwrap().as_deref(), Some("a"));
        coord.release("l", "a").await.unwrap();
        assert!(coord.try_acquire("l", "b", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn members_track_contenders() {
        let coord = MemoryCoordinator::new();
        coord.try_acquire("l", "b", TTL).await.unwrap();
        coord.try_acquire("l", "a", TTL).await.unwrap();
        assert_eq!(coord.members("l").await.unwrap(), vec!["a", "b"]);
        assert!(coord.members("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn outage_surfaces_coordination_error() {
        let coord = MemoryCoordinator::new();
        coord.set_available(false);
        let err = coord.try_acquire("l", "a", TTL).await.unwrap_err();
        assert!(err.is_unavailable());
    }
}
