//! Lease/campaign election
//!
//! Each attempt grants a fresh lease, keeps it alive in the background and
//! campaigns under the election name. The campaign resolves once this lease
//! owns the oldest key of the election. The winner publishes its campaign
//! key at the `elected` pointer (bound to the same lease) so followers can
//! resolve the leader identity: `elected -> campaign key -> node id`.

use super::{pause, ElectionTiming, LeaderState};
use crate::error::{ClusterError, Result};
use crate::remote::with_deadline;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

/// Client of a lease-based coordination service
#[async_trait]
pub trait LeaseClient: Send + Sync {
    /// Grant a lease, returning its id
    async fn grant(&self, ttl: Duration) -> Result<i64>;

    /// Refresh a lease; fails with `LeaseLost` once it expired
    async fn keep_alive(&self, lease: i64) -> Result<()>;

    /// Revoke a lease and every key attached to it
    async fn revoke(&self, lease: i64) -> Result<()>;

    /// Wait until `lease` leads `election`, returning the campaign key
    async fn campaign(&self, election: &str, value: &str, lease: i64) -> Result<String>;

    /// Give up leadership held through `leader_key`
    async fn resign(&self, leader_key: &str) -> Result<()>;

    async fn put(&self, key: &str, value: &str, lease: Option<i64>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;
}

/// Parameters of one lease election
pub(crate) struct LeaseElection {
    pub client: Arc<dyn LeaseClient>,
    pub election: String,
    pub elected: String,
    pub ttl: Duration,
}

impl LeaseElection {
    /// Follow the `elected` pointer to the leader's identity
    async fn resolve_leader(&self, timing: &ElectionTiming) -> Result<Option<String>> {
        with_deadline(timing.call_timeout, "resolve leader", async {
            let Some(key) = self.client.get(&self.elected).await? else {
                return Ok(None);
            };
            self.client.get(&key).await
        })
        .await
    }

    /// Background refresh of `lease`; fires `lost` when it can no longer be renewed
    fn spawn_keep_alive(
        &self,
        lease: i64,
        timing: ElectionTiming,
        lost: oneshot::Sender<ClusterError>,
    ) -> tokio::task::JoinHandle<()> {
        let client = self.client.clone();
        let period = keep_alive_period(self.ttl);
        let margin = step_down_after(self.ttl, &timing);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            let mut last_ok = tokio::time::Instant::now();
            loop {
                ticker.tick().await;
                let sent = tokio::time::Instant::now();
                match with_deadline(timing.call_timeout, "keep alive", client.keep_alive(lease))
                    .await
                {
                    Ok(()) => last_ok = sent,
                    Err(ClusterError::LeaseLost(id)) => {
                        let _ = lost.send(ClusterError::LeaseLost(id));
                        return;
                    }
                    Err(e) => {
                        // the next refresh could land after the server-side expiry
                        if last_ok.elapsed() >= margin {
                            let _ = lost.send(e);
                            return;
                        }
                        debug!(lease, error = %e, "Lease keep-alive failed");
                    }
                }
            }
        })
    }
}

fn keep_alive_period(ttl: Duration) -> Duration {
    (ttl / 3).max(Duration::from_millis(10))
}

/// Time since the last successful refresh after which leadership is given up
fn step_down_after(ttl: Duration, timing: &ElectionTiming) -> Duration {
    ttl.saturating_sub(keep_alive_period(ttl) + timing.call_timeout)
}

pub(crate) async fn run(
    state: Arc<LeaderState>,
    election: LeaseElection,
    timing: ElectionTiming,
    mut shutdown: broadcast::Receiver<()>,
) {
    let node_id = state.node_id().to_string();

    loop {
        state.start_campaign();

        let lease = match with_deadline(
            timing.call_timeout,
            "grant lease",
            election.client.grant(election.ttl),
        )
        .await
        {
            Ok(lease) => lease,
            Err(e) => {
                warn!(error = %e, "Failed to grant election lease");
                state.accept_leader(None);
                if pause(timing.retry_interval, &mut shutdown).await {
                    return;
                }
                continue;
            }
        };

        let (lost_tx, mut lost_rx) = oneshot::channel();
        let keep_alive = election.spawn_keep_alive(lease, timing, lost_tx);

        let outcome = campaign_and_lead(
            &state,
            &election,
            &node_id,
            lease,
            &timing,
            &mut lost_rx,
            &mut shutdown,
        )
        .await;

        keep_alive.abort();
        state.step_down();

        match outcome {
            Outcome::Shutdown => {
                let _ = with_deadline(
                    timing.call_timeout,
                    "revoke lease",
                    election.client.revoke(lease),
                )
                .await;
                return;
            }
            Outcome::LeaseLost => {
                // best effort; the lease may already be gone
                let _ = with_deadline(
                    timing.call_timeout,
                    "revoke lease",
                    election.client.revoke(lease),
                )
                .await;
            }
            Outcome::Failed => {
                let _ = with_deadline(
                    timing.call_timeout,
                    "revoke lease",
                    election.client.revoke(lease),
                )
                .await;
                if pause(timing.retry_interval, &mut shutdown).await {
                    return;
                }
            }
        }
    }
}

enum Outcome {
    Shutdown,
    LeaseLost,
    Failed,
}

async fn campaign_and_lead(
    state: &LeaderState,
    election: &LeaseElection,
    node_id: &str,
    lease: i64,
    timing: &ElectionTiming,
    lost: &mut oneshot::Receiver<ClusterError>,
    shutdown: &mut broadcast::Receiver<()>,
) -> Outcome {
    let campaign = election.client.campaign(&election.election, node_id, lease);
    tokio::pin!(campaign);

    let mut poll = tokio::time::interval(timing.retry_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let leader_key = loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => return Outcome::Shutdown,
            reason = &mut *lost => {
                warn!(lease, reason = ?reason.ok(), "Election lease lost while campaigning");
                return Outcome::LeaseLost;
            }
            won = &mut campaign => match won {
                Ok(key) => break key,
                Err(e) => {
                    warn!(error = %e, "Campaign failed");
                    state.accept_leader(None);
                    return Outcome::Failed;
                }
            },
            _ = poll.tick() => match election.resolve_leader(timing).await {
                Ok(holder) => {
                    if holder.as_deref() != Some(node_id) {
                        state.accept_leader(holder);
                    }
                }
                Err(e) => debug!(error = %e, "Failed to resolve leader"),
            },
        }
    };

    if let Err(e) = with_deadline(
        timing.call_timeout,
        "publish elected",
        election.client.put(&election.elected, &leader_key, Some(lease)),
    )
    .await
    {
        warn!(error = %e, "Failed to publish elected pointer");
        let _ = election.client.resign(&leader_key).await;
        return Outcome::Failed;
    }

    state.claim_leadership();
    info!(node_id, lease, key = %leader_key, "Won lease election");

    tokio::select! {
        biased;
        _ = shutdown.recv() => {
            let _ = with_deadline(
                timing.call_timeout,
                "resign",
                election.client.resign(&leader_key),
            )
            .await;
            Outcome::Shutdown
        }
        reason = &mut *lost => {
            warn!(node_id, lease, reason = ?reason.ok(), "Election lease lost");
            Outcome::LeaseLost
        }
    }
}
