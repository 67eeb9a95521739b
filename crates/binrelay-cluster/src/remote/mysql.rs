//! Relational metadata backend on MySQL
//!
//! One row per entity carrying an explicit `version` column. Updates are a
//! single conditional statement:
//!
//! ```sql
//! UPDATE t_metadata SET data = ?, version = version + 1
//!  WHERE type = ? AND id = ? AND version = ?
//! ```
//!
//! Zero affected rows with the row still present is the conflict signal.

use super::{with_deadline, MetadataBackend, StateBackend};
use crate::error::{ClusterError, Result};
use crate::id::MAX_MACHINE_INDEX;
use crate::model::{MetadataKind, MetadataVersion, PipelineState, Position};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, Pool};
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS t_metadata (
        id BIGINT UNSIGNED NOT NULL,
        type VARCHAR(16) NOT NULL,
        version INT NOT NULL,
        data MEDIUMBLOB NOT NULL,
        update_time BIGINT NOT NULL,
        PRIMARY KEY (type, id)
    )",
    "CREATE TABLE IF NOT EXISTS t_position (
        id BIGINT UNSIGNED NOT NULL PRIMARY KEY,
        name VARCHAR(255) NOT NULL,
        pos INT UNSIGNED NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS t_state (
        id BIGINT UNSIGNED NOT NULL PRIMARY KEY,
        status VARCHAR(16) NOT NULL,
        insert_count BIGINT UNSIGNED NOT NULL,
        update_count BIGINT UNSIGNED NOT NULL,
        delete_count BIGINT UNSIGNED NOT NULL,
        node VARCHAR(255) NOT NULL,
        start_time BIGINT NOT NULL,
        update_time BIGINT NOT NULL,
        message TEXT NULL
    )",
    "CREATE TABLE IF NOT EXISTS t_machine (
        id INT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY,
        node VARCHAR(255) NOT NULL,
        UNIQUE KEY uk_node (node)
    )",
];

type StateRow = (
    String,
    u64,
    u64,
    u64,
    String,
    i64,
    i64,
    Option<String>,
);

/// Metadata, run-state and machine indices stored in MySQL tables
pub struct MySqlBackend {
    pool: Pool,
    timeout: Duration,
}

impl MySqlBackend {
    pub fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let opts = Opts::from_url(url)
            .map_err(|e| ClusterError::InvalidConfig(format!("invalid mysql url: {}", e)))?;
        Ok(Self {
            pool: Pool::new(opts),
            timeout,
        })
    }

    async fn conn(&self) -> Result<Conn> {
        with_deadline(self.timeout, "mysql connect", async {
            Ok(self.pool.get_conn().await?)
        })
        .await
    }

    /// Close every pooled connection
    pub async fn disconnect(self) -> Result<()> {
        self.pool.disconnect().await?;
        Ok(())
    }

    async fn exists(&self, sql: &str, id: u64) -> Result<bool> {
        with_deadline(self.timeout, "mysql select", async {
            let mut conn = self.conn().await?;
            let found: Option<u64> = conn.exec_first(sql, (id,)).await?;
            Ok(found.is_some())
        })
        .await
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl MetadataBackend for MySqlBackend {
    fn name(&self) -> &'static str {
        "mysql"
    }

    async fn bootstrap(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        for ddl in SCHEMA {
            with_deadline(self.timeout, "mysql ddl", async {
                Ok(conn.query_drop(ddl).await?)
            })
            .await?;
        }
        info!("MySQL metadata tables ready");
        Ok(())
    }

    async fn insert(&self, kind: MetadataKind, id: u64, payload: &[u8]) -> Result<()> {
        with_deadline(self.timeout, "mysql insert", async {
            let mut conn = self.conn().await?;
            conn.exec_drop(
                "INSERT INTO t_metadata (id, type, version, data, update_time) VALUES (?, ?, 1, ?, ?)",
                (id, kind.as_str(), payload.to_vec(), now_ms()),
            )
            .await
            .map_err(|e| match ClusterError::from(e) {
                ClusterError::AlreadyExists(_) => {
                    ClusterError::AlreadyExists(format!("{} {}", kind, id))
                }
                other => other,
            })
        })
        .await
    }

    async fn delete(&self, kind: MetadataKind, id: u64) -> Result<()> {
        with_deadline(self.timeout, "mysql delete", async {
            let mut conn = self.conn().await?;
            conn.exec_drop(
                "DELETE FROM t_metadata WHERE type = ? AND id = ?",
                (kind.as_str(), id),
            )
            .await?;
            Ok(())
        })
        .await
    }

    async fn update(
        &self,
        kind: MetadataKind,
        id: u64,
        expected: i32,
        payload: &[u8],
    ) -> Result<i32> {
        with_deadline(self.timeout, "mysql update", async {
            let mut conn = self.conn().await?;
            conn.exec_drop(
                "UPDATE t_metadata SET data = ?, version = version + 1, update_time = ? \
                 WHERE type = ? AND id = ? AND version = ?",
                (payload.to_vec(), now_ms(), kind.as_str(), id, expected),
            )
            .await?;

            if conn.affected_rows() == 1 {
                return Ok(expected + 1);
            }

            let current: Option<i32> = conn
                .exec_first(
                    "SELECT version FROM t_metadata WHERE type = ? AND id = ?",
                    (kind.as_str(), id),
                )
                .await?;
            match current {
                None => Err(ClusterError::entity_not_found(kind, id)),
                Some(version) => {
                    debug!(%kind, id, expected, version, "Conditional update rejected");
                    Err(ClusterError::VersionConflict {
                        key: format!("{}/{}", kind, id),
                        expected,
                    })
                }
            }
        })
        .await
    }

    async fn get_version(&self, kind: MetadataKind, id: u64) -> Result<i32> {
        with_deadline(self.timeout, "mysql select", async {
            let mut conn = self.conn().await?;
            let version: Option<i32> = conn
                .exec_first(
                    "SELECT version FROM t_metadata WHERE type = ? AND id = ?",
                    (kind.as_str(), id),
                )
                .await?;
            version.ok_or_else(|| ClusterError::entity_not_found(kind, id))
        })
        .await
    }

    async fn get(&self, kind: MetadataKind, id: u64) -> Result<(Vec<u8>, i32)> {
        with_deadline(self.timeout, "mysql select", async {
            let mut conn = self.conn().await?;
            let row: Option<(Vec<u8>, i32)> = conn
                .exec_first(
                    "SELECT data, version FROM t_metadata WHERE type = ? AND id = ?",
                    (kind.as_str(), id),
                )
                .await?;
            row.ok_or_else(|| ClusterError::entity_not_found(kind, id))
        })
        .await
    }

    async fn list_versions(&self, kind: MetadataKind) -> Result<Vec<MetadataVersion>> {
        with_deadline(self.timeout, "mysql select", async {
            let mut conn = self.conn().await?;
            let rows: Vec<(u64, i32)> = conn
                .exec(
                    "SELECT id, version FROM t_metadata WHERE type = ? ORDER BY id",
                    (kind.as_str(),),
                )
                .await?;
            Ok(rows
                .into_iter()
                .map(|(id, version)| MetadataVersion { id, version })
                .collect())
        })
        .await
    }
}

#[async_trait]
impl StateBackend for MySqlBackend {
    async fn bootstrap(&self) -> Result<()> {
        MetadataBackend::bootstrap(self).await
    }

    async fn machine_index(&self, node: &str) -> Result<u16> {
        let index = with_deadline(self.timeout, "mysql machine index", async {
            let mut conn = self.conn().await?;
            let existing: Option<u32> = conn
                .exec_first("SELECT id FROM t_machine WHERE node = ?", (node,))
                .await?;
            if let Some(id) = existing {
                return Ok(id);
            }

            match conn
                .exec_drop("INSERT INTO t_machine (node) VALUES (?)", (node,))
                .await
                .map_err(ClusterError::from)
            {
                Ok(()) => conn
                    .last_insert_id()
                    .map(|id| id as u32)
                    .ok_or_else(|| ClusterError::Backend("no insert id for t_machine".into())),
                // a concurrent start of the same identity won the insert
                Err(ClusterError::AlreadyExists(_)) => conn
                    .exec_first("SELECT id FROM t_machine WHERE node = ?", (node,))
                    .await?
                    .ok_or_else(|| ClusterError::Backend("t_machine row vanished".into())),
                Err(e) => Err(e),
            }
        })
        .await?;

        u16::try_from(index)
            .ok()
            .filter(|i| *i <= MAX_MACHINE_INDEX)
            .ok_or_else(|| {
                ClusterError::InvalidConfig(format!("machine index {} out of range", index))
            })
    }

    async fn position_exists(&self, pipeline_id: u64) -> Result<bool> {
        self.exists("SELECT id FROM t_position WHERE id = ?", pipeline_id)
            .await
    }

    async fn create_position(&self, pipeline_id: u64, position: &Position) -> Result<()> {
        with_deadline(self.timeout, "mysql insert", async {
            let mut conn = self.conn().await?;
            conn.exec_drop(
                "INSERT INTO t_position (id, name, pos) VALUES (?, ?, ?)",
                (pipeline_id, position.name.as_str(), position.pos),
            )
            .await?;
            Ok(())
        })
        .await
    }

    async fn update_position(&self, pipeline_id: u64, position: &Position) -> Result<()> {
        with_deadline(self.timeout, "mysql update", async {
            let mut conn = self.conn().await?;
            conn.exec_drop(
                "UPDATE t_position SET name = ?, pos = ? WHERE id = ?",
                (position.name.as_str(), position.pos, pipeline_id),
            )
            .await?;
            Ok(())
        })
        .await
    }

    async fn get_position(&self, pipeline_id: u64) -> Result<Option<Position>> {
        with_deadline(self.timeout, "mysql select", async {
            let mut conn = self.conn().await?;
            let row: Option<(String, u32)> = conn
                .exec_first(
                    "SELECT name, pos FROM t_position WHERE id = ?",
                    (pipeline_id,),
                )
                .await?;
            Ok(row.map(|(name, pos)| Position { name, pos }))
        })
        .await
    }

    async fn state_exists(&self, pipeline_id: u64) -> Result<bool> {
        self.exists("SELECT id FROM t_state WHERE id = ?", pipeline_id)
            .await
    }

    async fn create_state(&self, pipeline_id: u64, state: &PipelineState) -> Result<()> {
        with_deadline(self.timeout, "mysql insert", async {
            let mut conn = self.conn().await?;
            conn.exec_drop(
                "INSERT INTO t_state (id, status, insert_count, update_count, delete_count, \
                 node, start_time, update_time, message) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    pipeline_id,
                    state.status.as_str(),
                    state.insert_count,
                    state.update_count,
                    state.delete_count,
                    state.node.as_str(),
                    state.start_time,
                    state.update_time,
                    state.message.clone(),
                ),
            )
            .await?;
            Ok(())
        })
        .await
    }

    async fn update_state(&self, pipeline_id: u64, state: &PipelineState) -> Result<()> {
        with_deadline(self.timeout, "mysql update", async {
            let mut conn = self.conn().await?;
            conn.exec_drop(
                "UPDATE t_state SET status = ?, insert_count = ?, update_count = ?, \
                 delete_count = ?, node = ?, start_time = ?, update_time = ?, message = ? \
                 WHERE id = ?",
                (
                    state.status.as_str(),
                    state.insert_count,
                    state.update_count,
                    state.delete_count,
                    state.node.as_str(),
                    state.start_time,
                    state.update_time,
                    state.message.clone(),
                    pipeline_id,
                ),
            )
            .await?;
            Ok(())
        })
        .await
    }

    async fn get_state(&self, pipeline_id: u64) -> Result<Option<PipelineState>> {
        let row: Option<StateRow> = with_deadline(self.timeout, "mysql select", async {
            let mut conn = self.conn().await?;
            Ok(conn
                .exec_first(
                    "SELECT status, insert_count, update_count, delete_count, node, \
                     start_time, update_time, message FROM t_state WHERE id = ?",
                    (pipeline_id,),
                )
                .await?)
        })
        .await?;

        row.map(
            |(status, insert_count, update_count, delete_count, node, start_time, update_time, message)| {
                Ok(PipelineState {
                    pipeline_id,
                    status: status.parse()?,
                    insert_count,
                    update_count,
                    delete_count,
                    node,
                    start_time,
                    update_time,
                    message,
                })
            },
        )
        .transpose()
    }

    async fn delete_run_state(&self, pipeline_id: u64) -> Result<()> {
        with_deadline(self.timeout, "mysql delete", async {
            let mut conn = self.conn().await?;
            conn.exec_drop("DELETE FROM t_position WHERE id = ?", (pipeline_id,))
                .await?;
            conn.exec_drop("DELETE FROM t_state WHERE id = ?", (pipeline_id,))
                .await?;
            Ok(())
        })
        .await
    }
}
