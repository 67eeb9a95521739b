//! Ephemeral-node election
//!
//! The election node is created ephemeral with the node identity as payload.
//! The creator leads for as long as its session lives; everyone else reads
//! the holder, follows it and watches the node for deletion.

use super::{pause, ElectionTiming, LeaderState};
use crate::error::ClusterError;
use crate::remote::{with_deadline, CreateMode, SessionInfo, TreeClient};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, info, warn};

/// Why a wait on the election node ended
enum Wake {
    Vacancy,
    SessionChanged,
    Shutdown,
}

pub(crate) async fn run(
    state: Arc<LeaderState>,
    client: Arc<dyn TreeClient>,
    path: String,
    timing: ElectionTiming,
    mut shutdown: broadcast::Receiver<()>,
) {
    let node_id = state.node_id().to_string();
    let mut session = client.session();

    loop {
        state.start_campaign();
        let current = *session.borrow_and_update();

        if !current.is_connected() {
            state.accept_leader(None);
            match wait_session(&mut session, &mut shutdown).await {
                Wake::Shutdown => return,
                _ => continue,
            }
        }

        let attempt = with_deadline(
            timing.call_timeout,
            "create election node",
            client.create(&path, node_id.as_bytes(), CreateMode::Ephemeral),
        )
        .await;

        match attempt {
            Ok(()) => {
                state.claim_leadership();
                match hold(&state, &client, &path, current, &mut session, &timing, &mut shutdown)
                    .await
                {
                    Wake::Shutdown => {
                        release(&client, &path, &node_id, &timing).await;
                        state.step_down();
                        return;
                    }
                    Wake::Vacancy | Wake::SessionChanged => {
                        state.step_down();
                        continue;
                    }
                }
            }
            Err(ClusterError::AlreadyExists(_)) => {
                let read = with_deadline(
                    timing.call_timeout,
                    "read election node",
                    client.get(&path),
                )
                .await;
                let holder = match read {
                    Ok((data, _)) => String::from_utf8_lossy(&data).into_owned(),
                    // vacated between create and read
                    Err(ClusterError::NotFound(_)) => continue,
                    Err(e) => {
                        warn!(error = %e, "Failed to read election holder");
                        state.accept_leader(None);
                        if pause(timing.retry_interval, &mut shutdown).await {
                            return;
                        }
                        continue;
                    }
                };

                if holder == node_id {
                    // left over from an earlier session of this identity
                    debug!(%path, "Removing stale election node");
                    release(&client, &path, &node_id, &timing).await;
                    continue;
                }

                state.accept_leader(Some(holder));
                match follow(&client, &path, &mut session, &timing, &mut shutdown).await {
                    Wake::Shutdown => return,
                    Wake::Vacancy | Wake::SessionChanged => continue,
                }
            }
            Err(e) => {
                warn!(error = %e, "Election attempt failed");
                state.accept_leader(None);
                if pause(timing.retry_interval, &mut shutdown).await {
                    return;
                }
            }
        }
    }
}

/// Lead until the node disappears, the session changes or shutdown
async fn hold(
    state: &LeaderState,
    client: &Arc<dyn TreeClient>,
    path: &str,
    elected_in: SessionInfo,
    session: &mut watch::Receiver<SessionInfo>,
    timing: &ElectionTiming,
    shutdown: &mut broadcast::Receiver<()>,
) -> Wake {
    let deleted = match arm_deletion(client, path, timing).await {
        Some(rx) => rx,
        None => return Wake::Vacancy,
    };
    tokio::pin!(deleted);

    info!(node_id = %state.node_id(), %path, "Holding election node");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => return Wake::Shutdown,
            _ = &mut deleted => return Wake::Vacancy,
            changed = session.changed() => {
                if changed.is_err() {
                    return Wake::SessionChanged;
                }
                let now = *session.borrow_and_update();
                if now.id != elected_in.id || !now.is_connected() {
                    warn!(node_id = %state.node_id(), state = ?now.state, "Election session lost");
                    return Wake::SessionChanged;
                }
            }
        }
    }
}

/// Wait until the current holder vacates, the session changes or shutdown
async fn follow(
    client: &Arc<dyn TreeClient>,
    path: &str,
    session: &mut watch::Receiver<SessionInfo>,
    timing: &ElectionTiming,
    shutdown: &mut broadcast::Receiver<()>,
) -> Wake {
    let Some(deleted) = arm_deletion(client, path, timing).await else {
        return Wake::Vacancy;
    };

    tokio::select! {
        biased;
        _ = shutdown.recv() => Wake::Shutdown,
        _ = deleted => Wake::Vacancy,
        _ = session.changed() => Wake::SessionChanged,
    }
}

async fn wait_session(
    session: &mut watch::Receiver<SessionInfo>,
    shutdown: &mut broadcast::Receiver<()>,
) -> Wake {
    tokio::select! {
        changed = session.changed() => {
            if changed.is_err() {
                // client gone; nothing will ever change again
                let _ = shutdown.recv().await;
                return Wake::Shutdown;
            }
            Wake::SessionChanged
        }
        _ = shutdown.recv() => Wake::Shutdown,
    }
}

async fn arm_deletion(
    client: &Arc<dyn TreeClient>,
    path: &str,
    timing: &ElectionTiming,
) -> Option<oneshot::Receiver<()>> {
    match with_deadline(timing.call_timeout, "watch election node", client.watch_deletion(path))
        .await
    {
        Ok(rx) => rx,
        Err(e) => {
            warn!(error = %e, "Failed to watch election node");
            None
        }
    }
}

/// Delete the election node if it still carries our identity
async fn release(client: &Arc<dyn TreeClient>, path: &str, node_id: &str, timing: &ElectionTiming) {
    let result = with_deadline(timing.call_timeout, "release election node", async {
        let (data, version) = client.get(path).await?;
        if data == node_id.as_bytes() {
            client.delete(path, Some(version)).await?;
        }
        Ok(())
    })
    .await;

    match result {
        Ok(()) | Err(ClusterError::NotFound(_)) => {}
        Err(e) => warn!(error = %e, %path, "Failed to release election node"),
    }
}

#[cfg(test)]
mod tests {
    use super::super::{ElectionDriver, ElectionService, ElectionTiming};
    use crate::remote::{MemoryTree, MemoryTreeClient, TreeClient};
    use std::sync::Arc;
    use std::time::Duration;

    const PATH: &str = "/test/election";

    fn timing() -> ElectionTiming {
        ElectionTiming {
            retry_interval: Duration::from_millis(20),
            call_timeout: Duration::from_millis(500),
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn member(tree: &MemoryTree, name: &str) -> (Arc<MemoryTreeClient>, ElectionService) {
        let client = Arc::new(tree.connect());
        client.ensure_path("/test").await.unwrap();
        let election = ElectionService::new(
            name,
            ElectionDriver::Tree {
                client: client.clone(),
                path: PATH.to_string(),
            },
            timing(),
        );
        (client, election)
    }

    #[tokio::test]
    async fn test_single_leader_and_failover() {
        let tree = MemoryTree::new();
        let mut members = Vec::new();
        for name in ["node-1", "node-2", "node-3"] {
            members.push(member(&tree, name).await);
        }
        for (_, election) in &members {
            election.elect().unwrap();
        }

        wait_until(|| members.iter().filter(|(_, e)| e.is_leader()).count() == 1).await;
        let leader = members.iter().position(|(_, e)| e.is_leader()).unwrap();
        let leader_name = members[leader].1.node_id().to_string();
        wait_until(|| {
            members
                .iter()
                .all(|(_, e)| e.leader().as_deref() == Some(leader_name.as_str()))
        })
        .await;

        members[leader].0.expire();
        members[leader].1.resign().await;

        wait_until(|| {
            let leaders: Vec<_> = members.iter().filter(|(_, e)| e.is_leader()).collect();
            leaders.len() == 1 && leaders[0].1.node_id() != leader_name
        })
        .await;
    }

    #[tokio::test]
    async fn test_resign_hands_over() {
        let tree = MemoryTree::new();
        let (_c1, first) = member(&tree, "node-1").await;
        let (_c2, second) = member(&tree, "node-2").await;

        first.elect().unwrap();
        wait_until(|| first.is_leader()).await;
        second.elect().unwrap();
        wait_until(|| second.leader().as_deref() == Some("node-1")).await;

        let mut events = second.subscribe();
        first.resign().await;
        assert!(!first.is_leader());

        wait_until(|| second.is_leader()).await;
        let event = events.recv().await.unwrap();
        assert_eq!(event.is_leader(), Some(true));
    }

    #[tokio::test]
    async fn test_outage_degrades_to_follower() {
        let tree = MemoryTree::new();
        let (_client, election) = member(&tree, "node-1").await;

        election.elect().unwrap();
        wait_until(|| election.is_leader()).await;

        tree.set_available(false);
        wait_until(|| !election.is_leader()).await;

        tree.set_available(true);
        wait_until(|| election.is_leader()).await;
    }

    #[tokio::test]
    async fn test_stale_node_of_same_identity_is_replaced() {
        let tree = MemoryTree::new();
        let old = tree.connect();
        old.ensure_path("/test").await.unwrap();
        old.create(PATH, b"node-1", crate::remote::CreateMode::Ephemeral)
            .await
            .unwrap();

        let (_client, election) = member(&tree, "node-1").await;
        election.elect().unwrap();
        wait_until(|| election.is_leader()).await;
        drop(old);
    }
}
