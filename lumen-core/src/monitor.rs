//! Background reclamation of an idle residency slot.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{IdleAction, ResidencyManager, SessionStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleConfig {
    /// How long the slot may sit unused before it is demoted or evicted.
    pub timeout_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            poll_interval_secs: 10,
        }
    }
}

impl IdleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

pub struct IdleMonitor {
    residency: Arc<ResidencyManager>,
    sessions: Arc<SessionStore>,
    config: IdleConfig,
    session_ttl: Duration,
}

impl IdleMonitor {
    pub fn new(
        residency: Arc<ResidencyManager>,
        sessions: Arc<SessionStore>,
        config: IdleConfig,
        session_ttl: Duration,
    ) -> Self {
        Self {
            residency,
            sessions,
            config,
            session_ttl,
        }
    }

    /// Runs until `shutdown` is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        debug!(
            timeout_secs = self.config.timeout_secs,
            poll_interval_secs = self.config.poll_interval_secs,
            "idle monitor started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        debug!("idle monitor stopped");
    }

    pub async fn tick(&self) -> Option<IdleAction> {
        let purged = self.sessions.purge_older_than(self.session_ttl);
        if purged > 0 {
            info!(purged, "dropped unclaimed sessions");
        }
        self.residency.reclaim_idle(self.config.timeout()).await
    }
}
