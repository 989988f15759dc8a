use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::RwLock;

/// Per-colony "assignments paused" flags.
///
/// Writes only happen inside the command queue worker; readers go through
/// [`PauseFlags::is_paused`].
#[derive(Debug, Clone, Default)]
pub struct PauseFlags {
    paused: Arc<RwLock<HashSet<String>>>,
}

impl PauseFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_paused(&self, colony: &str) -> bool {
        self.paused.read().await.contains(colony)
    }

    /// Returns false if the colony was already paused.
    pub async fn pause(&self, colony: &str) -> bool {
        self.paused.write().await.insert(colony.to_string())
    }

    /// Returns false if the colony was not paused.
    pub async fn resume(&self, colony: &str) -> bool {
        self.paused.write().await.remove(colony)
    }
}
