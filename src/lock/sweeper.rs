//! Lock Sweeper
//!
//! Background task that reclaims expired locks so an abandoned transfer
//! cannot pin a resource until the next contender shows up.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::LockManager;

/// Configuration for the lock sweeper
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// How often to scan for expired locks
    pub interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

/// Periodically drops stale locks from a [`LockManager`]
pub struct LockSweeper {
    locks: Arc<LockManager>,
    config: SweeperConfig,
}

impl LockSweeper {
    pub fn new(locks: Arc<LockManager>, config: SweeperConfig) -> Self {
        Self { locks, config }
    }

    pub fn with_defaults(locks: Arc<LockManager>) -> Self {
        Self::new(locks, SweeperConfig::default())
    }

    /// Run the sweep loop forever
    pub async fn run(&self) -> ! {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            ceiling_ms = self.locks.ceiling().as_millis() as u64,
            "Starting lock sweeper"
        );

        loop {
            tokio::time::sleep(self.config.interval).await;
            self.sweep_once();
        }
    }

    /// Single sweep, returning the number of locks reclaimed
    pub fn sweep_once(&self) -> usize {
        let reclaimed = self.locks.reap_expired();
        if reclaimed > 0 {
            info!(
                reclaimed,
                remaining = self.locks.active_count(),
                "Lock sweep reclaimed expired locks"
            );
        } else {
            debug!("Lock sweep found nothing to reclaim");
        }
        reclaimed
    }
}
