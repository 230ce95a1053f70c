//! Lease-based leader election.
//!
//! Each controller replica campaigns for `leases/<resource>`. The winner
//! keeps the lease alive from a background task; losing it (renewal
//! refused, or the store unreachable until the lease ran out) fires a
//! cancellation token that the leader's work is scoped to.

use crate::lease::{Lease, LeaseManager};
use serde::{Deserialize, Serialize};
use sluice_core::{CoreError, CoreResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Election configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Lease time-to-live in milliseconds
    pub lease_ttl_ms: u64,
    /// Renewal interval in milliseconds; also the retry interval while
    /// campaigning
    pub renew_interval_ms: u64,
}

impl ElectionConfig {
    /// Create a new election config
    #[must_use]
    pub fn new(lease_ttl_ms: u64, renew_interval_ms: u64) -> Self {
        Self {
            lease_ttl_ms,
            renew_interval_ms,
        }
    }

    fn ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms.max(1))
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self::new(10_000, 3_000)
    }
}

/// Election state of one candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionState {
    /// Not campaigning
    Idle,
    /// Waiting for the lease
    Campaigning,
    /// Holding the lease
    Leader,
    /// Someone else holds the lease
    Follower(String),
}

/// One candidate for a leased resource
#[derive(Debug, Clone)]
pub struct LeaderElection {
    config: ElectionConfig,
    leases: LeaseManager,
    resource: String,
    candidate: String,
    state: Arc<RwLock<ElectionState>>,
}

impl LeaderElection {
    /// Create a candidate
    #[must_use]
    pub fn new(
        config: ElectionConfig,
        leases: LeaseManager,
        resource: impl Into<String>,
        candidate: impl Into<String>,
    ) -> Self {
        Self {
            config,
            leases,
            resource: resource.into(),
            candidate: candidate.into(),
            state: Arc::new(RwLock::new(ElectionState::Idle)),
        }
    }

    /// Get the current election state
    pub async fn state(&self) -> ElectionState {
        self.state.read().await.clone()
    }

    /// Check if this candidate is the leader
    pub async fn is_leader(&self) -> bool {
        matches!(*self.state.read().await, ElectionState::Leader)
    }

    /// Campaign until the lease is won or `shutdown` fires
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` on shutdown, or any non-transient store error
    pub async fn campaign(&self, shutdown: &CancellationToken) -> CoreResult<Leadership> {
        *self.state.write().await = ElectionState::Campaigning;
        loop {
            match self
                .leases
                .acquire(&self.resource, &self.candidate, self.config.ttl())
                .await
            {
                Ok(lease) => {
                    *self.state.write().await = ElectionState::Leader;
                    info!(resource = %self.resource, candidate = %self.candidate, epoch = lease.epoch, "became leader");
                    return Ok(self.keep_alive(lease));
                }
                Err(CoreError::NotLeader { .. }) => {
                    if let Ok(Some(holder)) = self.leases.holder(&self.resource).await {
                        *self.state.write().await = ElectionState::Follower(holder);
                    }
                }
                Err(err) if err.is_transient() => {
                    warn!(resource = %self.resource, error = %err, "campaign attempt failed");
                }
                Err(err) => {
                    *self.state.write().await = ElectionState::Idle;
                    return Err(err);
                }
            }

            tokio::select! {
                () = shutdown.cancelled() => {
                    *self.state.write().await = ElectionState::Idle;
                    return Err(CoreError::Cancelled);
                }
                () = tokio::time::sleep(self.config.renew_interval()) => {}
            }
        }
    }

    fn keep_alive(&self, lease: Lease) -> Leadership {
        let lease = Arc::new(RwLock::new(lease));
        let lost = CancellationToken::new();
        let stop = CancellationToken::new();
        let task = tokio::spawn(renew_loop(
            self.leases.clone(),
            self.config.renew_interval(),
            lease.clone(),
            lost.clone(),
            stop.clone(),
            self.state.clone(),
        ));
        Leadership {
            leases: self.leases.clone(),
            lease,
            lost,
            stop,
            task,
        }
    }
}

async fn renew_loop(
    leases: LeaseManager,
    interval: Duration,
    lease: Arc<RwLock<Lease>>,
    lost: CancellationToken,
    stop: CancellationToken,
    state: Arc<RwLock<ElectionState>>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            () = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let current = lease.read().await.clone();
        match leases.renew(&current).await {
            Ok(renewed) => {
                debug!(resource = %renewed.resource, "leadership renewed");
                *lease.write().await = renewed;
            }
            Err(err) if err.is_transient() && !current.is_expired() => {
                warn!(resource = %current.resource, error = %err, "lease renewal failed, retrying");
            }
            Err(err) => {
                warn!(resource = %current.resource, error = %err, "leadership lost");
                *state.write().await = ElectionState::Idle;
                lost.cancel();
                return;
            }
        }
    }
}

/// A won election. Dropping it without [`Leadership::resign`] stops
/// renewals and lets the lease expire.
#[derive(Debug)]
pub struct Leadership {
    leases: LeaseManager,
    lease: Arc<RwLock<Lease>>,
    lost: CancellationToken,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl Leadership {
    /// Token that fires when leadership is lost
    #[must_use]
    pub fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    /// Current lease
    pub async fn lease(&self) -> Lease {
        self.lease.read().await.clone()
    }

    /// Check the lease is still ours before acting on it
    ///
    /// # Errors
    ///
    /// Returns `NotLeader` if leadership was lost
    pub async fn validate(&self) -> CoreResult<()> {
        let lease = self.lease().await;
        if self.lost.is_cancelled() {
            return Err(CoreError::NotLeader {
                resource: lease.resource,
            });
        }
        self.leases.validate(&lease).await
    }

    /// Stop renewing and release the lease
    ///
    /// # Errors
    ///
    /// Returns error if the store fails during release
    pub async fn resign(self) -> CoreResult<()> {
        self.stop.cancel();
        self.lost.cancel();
        let lease = self.lease.read().await.clone();
        self.leases.release(&lease).await
    }
}

impl Drop for Leadership {
    fn drop(&mut self) {
        self.stop.cancel();
        self.task.abort();
    }
}
