//! Background reconciliation of the local cache
//!
//! Every node runs a [`Reconciler`]. It pulls the remote listing of every
//! kind on a fixed interval, follows change notifications from the remote
//! store with targeted `refresh_one` calls, and, while this node leads,
//! replays cascade writes the remote store never acknowledged.

use crate::election::{ElectionEvent, ElectionService};
use crate::error::Result;
use crate::metadata::{MetadataRepository, RefreshOutcome, RefreshReport, ReplayReport};
use crate::model::{EndpointInfo, MetadataKind, PipelineInfo, SourceInfo};
use crate::observability::MetadataMetrics;
use crate::remote::{MetadataBackend, MetadataChange};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The three replicated repositories of a node
#[derive(Clone)]
pub struct Repositories {
    pub sources: MetadataRepository<SourceInfo>,
    pub endpoints: MetadataRepository<EndpointInfo>,
    pub pipelines: MetadataRepository<PipelineInfo>,
}

impl Repositories {
    /// Route a change notification to the repository of its kind
    pub async fn refresh_one(
        &self,
        kind: MetadataKind,
        id: u64,
        observed: Option<i32>,
    ) -> Result<RefreshOutcome> {
        match kind {
            MetadataKind::Source => self.sources.refresh_one(id, observed).await,
            MetadataKind::Endpoint => self.endpoints.refresh_one(id, observed).await,
            MetadataKind::Pipeline => self.pipelines.refresh_one(id, observed).await,
            // rules travel inside their pipeline
            MetadataKind::Rule => Ok(RefreshOutcome::Unchanged),
        }
    }

    /// `refresh_all` for every kind; a failing kind does not stop the others
    pub async fn refresh_all(&self) -> Vec<(MetadataKind, Result<RefreshReport>)> {
        let (sources, endpoints, pipelines) = futures::join!(
            self.sources.refresh_all(),
            self.endpoints.refresh_all(),
            self.pipelines.refresh_all(),
        );
        vec![
            (MetadataKind::Source, sources),
            (MetadataKind::Endpoint, endpoints),
            (MetadataKind::Pipeline, pipelines),
        ]
    }

    pub async fn replay_intents(&self) -> Vec<(MetadataKind, Result<ReplayReport>)> {
        let results = vec![
            (MetadataKind::Source, self.sources.replay_intents().await),
            (MetadataKind::Endpoint, self.endpoints.replay_intents().await),
            (MetadataKind::Pipeline, self.pipelines.replay_intents().await),
        ];
        if let Ok(pending) = self.sources.intents().len() {
            MetadataMetrics::set_pending_intents(pending);
        }
        results
    }
}

/// Periodic and notification-driven cache refresh
pub struct Reconciler {
    repositories: Repositories,
    remote: Arc<dyn MetadataBackend>,
    election: Arc<ElectionService>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        repositories: Repositories,
        remote: Arc<dyn MetadataBackend>,
        election: Arc<ElectionService>,
        interval: Duration,
    ) -> Self {
        Self {
            repositories,
            remote,
            election,
            interval,
        }
    }

    /// One full pass: replay pending writes if leading, then refresh all kinds
    pub async fn run_once(&self) {
        if self.election.is_leader() {
            self.replay().await;
        }

        for (kind, result) in self.repositories.refresh_all().await {
            if let Err(e) = result {
                warn!(%kind, error = %e, "Metadata reconciliation failed");
            }
        }
    }

    async fn replay(&self) {
        for (kind, result) in self.repositories.replay_intents().await {
            if let Err(e) = result {
                warn!(%kind, error = %e, "Failed to replay pending metadata writes");
            }
        }
    }

    async fn dispatch(&self, change: MetadataChange) {
        match self
            .repositories
            .refresh_one(change.kind, change.id, None)
            .await
        {
            Ok(RefreshOutcome::Unchanged) => {}
            Ok(outcome) => debug!(kind = %change.kind, id = change.id, ?outcome, "Applied remote change"),
            Err(e) => warn!(kind = %change.kind, id = change.id, error = %e, "Failed to apply remote change"),
        }
    }

    async fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<MetadataChange>> {
        match self.remote.watch_changes().await {
            Ok(watch) => watch,
            Err(e) => {
                warn!(backend = self.remote.name(), error = %e, "Failed to watch metadata changes");
                None
            }
        }
    }

    /// Run until `shutdown` fires
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut events = self.election.subscribe();
            let mut watch = self.subscribe().await;

            info!(
                backend = self.remote.name(),
                interval_ms = self.interval.as_millis() as u64,
                watching = watch.is_some(),
                "Metadata reconciler started"
            );

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => break,
                    event = events.recv() => match event {
                        Ok(ElectionEvent::BecameLeader(_)) => self.replay().await,
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "Reconciler lagged behind election events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            events = self.election.subscribe();
                        }
                    },
                    change = next_change(&mut watch) => match change {
                        Some(change) => self.dispatch(change).await,
                        None => {
                            debug!("Metadata change stream ended");
                            watch = None;
                        }
                    },
                    _ = ticker.tick() => {
                        self.run_once().await;
                        if watch.is_none() {
                            watch = self.subscribe().await;
                        }
                    }
                }
            }

            info!("Metadata reconciler stopped");
        })
    }
}

async fn next_change(
    watch: &mut Option<mpsc::UnboundedReceiver<MetadataChange>>,
) -> Option<MetadataChange> {
    match watch {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
