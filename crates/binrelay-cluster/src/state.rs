//! Pipeline run-state and binlog positions
//!
//! Standalone nodes keep both in the local store. Clustered nodes keep them
//! in the remote store so a newly elected leader resumes from the last
//! committed position.

use crate::error::{ClusterError, Result};
use crate::model::{PipelineState, Position};
use crate::observability::RunStateMetrics;
use crate::remote::StateBackend;
use crate::storage::{Bucket, LocalStore};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

enum Backing {
    Local(LocalStore),
    Remote(Arc<dyn StateBackend>),
}

/// Run-state store of one node
pub struct RunStateStore {
    backing: Backing,
    /// Pipeline ids known to have a remote state entry
    states: Mutex<HashSet<u64>>,
    /// Pipeline ids known to have a remote position entry
    positions: Mutex<HashSet<u64>>,
}

impl RunStateStore {
    pub fn local(store: LocalStore) -> Self {
        Self::with_backing(Backing::Local(store))
    }

    pub fn remote(backend: Arc<dyn StateBackend>) -> Self {
        Self::with_backing(Backing::Remote(backend))
    }

    fn with_backing(backing: Backing) -> Self {
        Self {
            backing,
            states: Mutex::new(HashSet::new()),
            positions: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.backing, Backing::Remote(_))
    }

    pub async fn save_state(&self, state: &PipelineState) -> Result<()> {
        let id = state.pipeline_id;
        RunStateMetrics::increment_state_writes();

        match &self.backing {
            Backing::Local(store) => store.put_json(Bucket::State, id, state),
            Backing::Remote(backend) => {
                let started = Instant::now();
                let known = self.states.lock().contains(&id);
                let exists = known || backend.state_exists(id).await?;

                let result = if exists {
                    match backend.update_state(id, state).await {
                        // removed behind our back
                        Err(ClusterError::NotFound(_)) => backend.create_state(id, state).await,
                        other => other,
                    }
                } else {
                    match backend.create_state(id, state).await {
                        Err(ClusterError::AlreadyExists(_)) => backend.update_state(id, state).await,
                        other => other,
                    }
                };
                RunStateMetrics::record_remote_latency("save_state", started.elapsed());

                result?;
                self.states.lock().insert(id);
                debug!(pipeline = id, status = %state.status, "Saved pipeline state");
                Ok(())
            }
        }
    }

    pub async fn get_state(&self, pipeline_id: u64) -> Result<Option<PipelineState>> {
        match &self.backing {
            Backing::Local(store) => store.get_json(Bucket::State, pipeline_id),
            Backing::Remote(backend) => {
                let state = backend.get_state(pipeline_id).await?;
                if state.is_some() {
                    self.states.lock().insert(pipeline_id);
                }
                Ok(state)
            }
        }
    }

    /// Whether a state entry exists for the pipeline
    pub async fn exists(&self, pipeline_id: u64) -> Result<bool> {
        match &self.backing {
            Backing::Local(store) => Ok(store.get(Bucket::State, pipeline_id)?.is_some()),
            Backing::Remote(backend) => {
                if self.states.lock().contains(&pipeline_id) {
                    return Ok(true);
                }
                let exists = backend.state_exists(pipeline_id).await?;
                if exists {
                    self.states.lock().insert(pipeline_id);
                }
                Ok(exists)
            }
        }
    }

    pub async fn save_position(&self, pipeline_id: u64, position: &Position) -> Result<()> {
        RunStateMetrics::increment_position_writes();

        match &self.backing {
            Backing::Local(store) => store.put_json(Bucket::Position, pipeline_id, position),
            Backing::Remote(backend) => {
                let started = Instant::now();
                let known = self.positions.lock().contains(&pipeline_id);
                let exists = known || backend.position_exists(pipeline_id).await?;

                let result = if exists {
                    match backend.update_position(pipeline_id, position).await {
                        Err(ClusterError::NotFound(_)) => {
                            backend.create_position(pipeline_id, position).await
                        }
                        other => other,
                    }
                } else {
                    match backend.create_position(pipeline_id, position).await {
                        Err(ClusterError::AlreadyExists(_)) => {
                            backend.update_position(pipeline_id, position).await
                        }
                        other => other,
                    }
                };
                RunStateMetrics::record_remote_latency("save_position", started.elapsed());

                result?;
                self.positions.lock().insert(pipeline_id);
                Ok(())
            }
        }
    }

    pub async fn get_position(&self, pipeline_id: u64) -> Result<Option<Position>> {
        match &self.backing {
            Backing::Local(store) => store.get_json(Bucket::Position, pipeline_id),
            Backing::Remote(backend) => backend.get_position(pipeline_id).await,
        }
    }

    /// Drop state and position of a deleted pipeline
    pub async fn remove(&self, pipeline_id: u64) -> Result<()> {
        match &self.backing {
            Backing::Local(store) => {
                store.write(|txn| {
                    txn.delete(Bucket::State, pipeline_id)?;
                    txn.delete(Bucket::Position, pipeline_id)?;
                    Ok(())
                })?;
            }
            Backing::Remote(backend) => backend.delete_run_state(pipeline_id).await?,
        }
        self.states.lock().remove(&pipeline_id);
        self.positions.lock().remove(&pipeline_id);
        debug!(pipeline = pipeline_id, "Removed pipeline run-state");
        Ok(())
    }
}
