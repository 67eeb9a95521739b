//! Cluster leader election
//!
//! Exactly one node of a cluster is leader at a time. Mutual exclusion is
//! delegated to the coordination service:
//!
//! - **tree** ([`tree`]): whoever creates the ephemeral election node wins;
//!   followers watch it for deletion.
//! - **lease** ([`lease`]): nodes campaign with a lease under the election
//!   name; the winner publishes its campaign key at the `elected` pointer.
//!
//! ```text
//!              create ok / campaign won
//!   Candidate ─────────────────────────────▶ Leader
//!       │  ▲                                   │
//!  held │  │ vacancy observed                  │ session expired / lease lost
//!       ▼  │                                   ▼
//!   Follower ◀──────────────────────────────────┘
//! ```
//!
//! Every flip of `is_leader` is published as an [`ElectionEvent`]. Outages of
//! the coordination service never end the loop; the node degrades to
//! follower and retries.

pub mod lease;
pub mod memory;
pub mod tree;

#[cfg(feature = "etcd")]
pub mod etcd;

use crate::error::{ClusterError, Result};
use crate::observability::ElectionMetrics;
use crate::remote::TreeClient;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use lease::LeaseClient;
pub use memory::MemoryLeaseService;

#[cfg(feature = "etcd")]
pub use etcd::EtcdLeaseClient;

/// Election state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    /// Attempting to acquire the election primitive
    Candidate,
    /// Holding the election primitive
    Leader,
    /// Another node (or nobody reachable) holds it
    Follower,
}

/// Election events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionEvent {
    /// We became the leader
    BecameLeader(u64),
    /// We lost leadership
    LostLeadership,
    /// A different leader was observed
    NewLeader(String),
}

impl ElectionEvent {
    /// The `is_leader` value after this event, if it flipped it
    pub fn is_leader(&self) -> Option<bool> {
        match self {
            ElectionEvent::BecameLeader(_) => Some(true),
            ElectionEvent::LostLeadership => Some(false),
            ElectionEvent::NewLeader(_) => None,
        }
    }
}

/// Last-known election view of this node
pub struct LeaderState {
    node_id: String,
    state: RwLock<ElectionState>,
    generation: RwLock<u64>,
    leader: RwLock<Option<String>>,
    event_tx: broadcast::Sender<ElectionEvent>,
}

impl LeaderState {
    pub fn new(node_id: impl Into<String>) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            node_id: node_id.into(),
            state: RwLock::new(ElectionState::Candidate),
            generation: RwLock::new(0),
            leader: RwLock::new(None),
            event_tx,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn state(&self) -> ElectionState {
        *self.state.read()
    }

    /// Number of campaigns this node has started
    pub fn generation(&self) -> u64 {
        *self.generation.read()
    }

    pub fn is_leader(&self) -> bool {
        *self.state.read() == ElectionState::Leader
    }

    pub fn leader(&self) -> Option<String> {
        self.leader.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ElectionEvent> {
        self.event_tx.subscribe()
    }

    /// Enter a new campaign
    ///
    /// A leader never campaigns; it must step down first.
    pub fn start_campaign(&self) -> u64 {
        let mut state = self.state.write();
        let mut generation = self.generation.write();

        if *state != ElectionState::Leader {
            *state = ElectionState::Candidate;
            *generation += 1;
            ElectionMetrics::record_campaign();
        }
        *generation
    }

    /// Record that this node acquired the election primitive
    pub fn claim_leadership(&self) {
        let mut state = self.state.write();
        let mut leader = self.leader.write();
        let generation = *self.generation.read();

        if *state == ElectionState::Leader {
            return;
        }

        *state = ElectionState::Leader;
        *leader = Some(self.node_id.clone());
        ElectionMetrics::set_leader(true);
        let _ = self.event_tx.send(ElectionEvent::BecameLeader(generation));

        info!(node_id = %self.node_id, generation, "Became leader");
    }

    /// Record that `holder` (or an unknown node) holds leadership
    pub fn accept_leader(&self, holder: Option<String>) {
        let mut state = self.state.write();
        let mut leader = self.leader.write();

        if *state == ElectionState::Leader {
            ElectionMetrics::set_leader(false);
            let _ = self.event_tx.send(ElectionEvent::LostLeadership);
            warn!(node_id = %self.node_id, new_leader = ?holder, "Lost leadership");
        }
        *state = ElectionState::Follower;

        if holder.is_some() && *leader != holder {
            if let Some(ref name) = holder {
                let _ = self.event_tx.send(ElectionEvent::NewLeader(name.clone()));
                info!(node_id = %self.node_id, leader = %name, "Following leader");
            }
            *leader = holder;
        }
    }

    /// Give up leadership without knowing the successor
    pub fn step_down(&self) {
        let mut state = self.state.write();
        let mut leader = self.leader.write();

        if *state == ElectionState::Leader {
            *leader = None;
            ElectionMetrics::set_leader(false);
            let _ = self.event_tx.send(ElectionEvent::LostLeadership);
            info!(node_id = %self.node_id, "Stepped down from leadership");
        }
        *state = ElectionState::Follower;
    }
}

/// Loop timing shared by the election drivers
#[derive(Debug, Clone, Copy)]
pub struct ElectionTiming {
    /// Delay before retrying after a coordination failure
    pub retry_interval: Duration,
    /// Deadline for each coordination call
    pub call_timeout: Duration,
}

impl Default for ElectionTiming {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(1),
            call_timeout: Duration::from_secs(1),
        }
    }
}

/// Backend-specific election loop
pub enum ElectionDriver {
    /// Single node: leader as soon as elected
    Standalone,
    /// Ephemeral-node election
    Tree {
        client: Arc<dyn TreeClient>,
        path: String,
    },
    /// Lease/campaign election
    Lease {
        client: Arc<dyn LeaseClient>,
        election: String,
        elected: String,
        ttl: Duration,
    },
}

impl ElectionDriver {
    fn name(&self) -> &'static str {
        match self {
            ElectionDriver::Standalone => "standalone",
            ElectionDriver::Tree { .. } => "tree",
            ElectionDriver::Lease { .. } => "lease",
        }
    }
}

/// Cluster leader election service
pub struct ElectionService {
    state: Arc<LeaderState>,
    driver: ElectionDriver,
    timing: ElectionTiming,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ElectionService {
    pub fn new(node_id: impl Into<String>, driver: ElectionDriver, timing: ElectionTiming) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            state: Arc::new(LeaderState::new(node_id)),
            driver,
            timing,
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    pub fn standalone(node_id: impl Into<String>) -> Self {
        Self::new(node_id, ElectionDriver::Standalone, ElectionTiming::default())
    }

    /// Start participating in the election; idempotent
    pub fn elect(&self) -> Result<()> {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }

        info!(
            node_id = %self.state.node_id(),
            backend = self.driver.name(),
            "Joining leader election"
        );

        let state = self.state.clone();
        let shutdown = self.shutdown_tx.subscribe();
        let timing = self.timing;

        let handle = match &self.driver {
            ElectionDriver::Standalone => {
                state.start_campaign();
                state.claim_leadership();
                return Ok(());
            }
            ElectionDriver::Tree { client, path } => tokio::spawn(tree::run(
                state,
                client.clone(),
                path.clone(),
                timing,
                shutdown,
            )),
            ElectionDriver::Lease {
                client,
                election,
                elected,
                ttl,
            } => tokio::spawn(lease::run(
                state,
                lease::LeaseElection {
                    client: client.clone(),
                    election: election.clone(),
                    elected: elected.clone(),
                    ttl: *ttl,
                },
                timing,
                shutdown,
            )),
        };
        *task = Some(handle);
        Ok(())
    }

    pub fn is_leader(&self) -> bool {
        self.state.is_leader()
    }

    pub fn leader(&self) -> Option<String> {
        self.state.leader()
    }

    pub fn state(&self) -> ElectionState {
        self.state.state()
    }

    pub fn node_id(&self) -> &str {
        self.state.node_id()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ElectionEvent> {
        self.state.subscribe()
    }

    /// Fail unless this node currently leads
    pub fn ensure_leader(&self) -> Result<()> {
        if self.is_leader() {
            Ok(())
        } else {
            Err(ClusterError::NotLeader {
                leader: self.leader(),
            })
        }
    }

    /// Leave the election, releasing the primitive if held
    pub async fn resign(&self) {
        let _ = self.shutdown_tx.send(());
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Election task ended abnormally");
            }
        }
        self.state.step_down();
    }
}

impl Drop for ElectionService {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

/// Sleep for `delay` unless shutdown fires first; returns `true` on shutdown
pub(crate) async fn pause(delay: Duration, shutdown: &mut broadcast::Receiver<()>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.recv() => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_lifecycle() {
        let state = LeaderState::new("node-1");
        let mut events = state.subscribe();

        assert_eq!(state.state(), ElectionState::Candidate);
        assert!(!state.is_leader());

        assert_eq!(state.start_campaign(), 1);
        state.claim_leadership();
        assert!(state.is_leader());
        assert_eq!(state.leader().as_deref(), Some("node-1"));
        assert_eq!(events.try_recv().unwrap(), ElectionEvent::BecameLeader(1));

        // a leader does not restart campaigns
        assert_eq!(state.start_campaign(), 1);
        assert!(state.is_leader());

        state.step_down();
        assert_eq!(state.state(), ElectionState::Follower);
        assert_eq!(events.try_recv().unwrap(), ElectionEvent::LostLeadership);
    }

    #[test]
    fn test_accept_leader_only_announces_changes() {
        let state = LeaderState::new("node-2");
        let mut events = state.subscribe();

        state.start_campaign();
        state.accept_leader(Some("node-1".into()));
        state.accept_leader(Some("node-1".into()));
        assert_eq!(
            events.try_recv().unwrap(),
            ElectionEvent::NewLeader("node-1".into())
        );
        assert!(events.try_recv().is_err());

        // outage: last known leader is kept
        state.accept_leader(None);
        assert_eq!(state.leader().as_deref(), Some("node-1"));
    }

    #[test]
    fn test_losing_leadership_to_other_node() {
        let state = LeaderState::new("node-1");
        state.start_campaign();
        state.claim_leadership();

        let mut events = state.subscribe();
        state.accept_leader(Some("node-3".into()));
        assert_eq!(events.try_recv().unwrap(), ElectionEvent::LostLeadership);
        assert_eq!(
            events.try_recv().unwrap(),
            ElectionEvent::NewLeader("node-3".into())
        );
        assert!(!state.is_leader());
    }

    #[tokio::test]
    async fn test_standalone_is_leader_immediately() {
        let election = ElectionService::standalone("solo");
        assert!(election.ensure_leader().is_err());

        election.elect().unwrap();
        assert!(election.is_leader());
        assert_eq!(election.leader().as_deref(), Some("solo"));
        election.ensure_leader().unwrap();

        election.resign().await;
        assert!(!election.is_leader());
    }

    #[test]
    fn test_event_flip() {
        assert_eq!(ElectionEvent::BecameLeader(3).is_leader(), Some(true));
        assert_eq!(ElectionEvent::LostLeadership.is_leader(), Some(false));
        assert_eq!(ElectionEvent::NewLeader("x".into()).is_leader(), None);
    }
}
