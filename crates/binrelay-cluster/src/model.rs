//! Replicated configuration entities and pipeline run-state types
//!
//! Every configuration entity carries a `data_version`, the optimistic
//! concurrency token maintained by the remote system of record. The local
//! cache never decides versions on its own in clustered mode; it copies them
//! from whatever the remote store last acknowledged.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ClusterError;

/// Metadata entity categories stored in both the local cache and the remote store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataKind {
    Source,
    Endpoint,
    Pipeline,
    Rule,
}

impl MetadataKind {
    /// Kinds that are replicated as standalone entities
    pub const REPLICATED: [MetadataKind; 3] = [
        MetadataKind::Source,
        MetadataKind::Endpoint,
        MetadataKind::Pipeline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataKind::Source => "source",
            MetadataKind::Endpoint => "endpoint",
            MetadataKind::Pipeline => "pipeline",
            MetadataKind::Rule => "rule",
        }
    }
}

impl fmt::Display for MetadataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetadataKind {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source" => Ok(MetadataKind::Source),
            "endpoint" => Ok(MetadataKind::Endpoint),
            "pipeline" => Ok(MetadataKind::Pipeline),
            "rule" => Ok(MetadataKind::Rule),
            other => Err(ClusterError::InvalidConfig(format!(
                "unknown metadata kind '{}'",
                other
            ))),
        }
    }
}

/// Administrative status shared by all configuration entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntityStatus {
    #[default]
    Enabled,
    Disabled,
}

/// A replicated configuration entity
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Category this entity is stored under
    const KIND: MetadataKind;

    fn id(&self) -> u64;

    fn name(&self) -> &str;

    fn status(&self) -> EntityStatus;

    fn data_version(&self) -> i32;

    fn set_data_version(&mut self, version: i32);

    /// Rules owned by this entity. They are written to the rule bucket
    /// alongside the entity and replaced as a whole set on every write.
    fn rules(&self) -> &[TransformRule] {
        &[]
    }
}

/// MySQL data source the relay streams binlog events from
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceInfo {
    pub id: u64,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_charset")]
    pub charset: String,
    #[serde(default)]
    pub status: EntityStatus,
    #[serde(default)]
    pub data_version: i32,
    #[serde(default)]
    pub create_time: i64,
    #[serde(default)]
    pub update_time: i64,
}

fn default_charset() -> String {
    "utf8mb4".to_string()
}

impl SourceInfo {
    pub fn new(id: u64, name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id,
            name: name.into(),
            host: host.into(),
            port,
            username: "root".to_string(),
            password: String::new(),
            charset: default_charset(),
            status: EntityStatus::Enabled,
            data_version: 0,
            create_time: now,
            update_time: now,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// `host:port` address of the MySQL server
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for SourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceInfo")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("charset", &self.charset)
            .field("status", &self.status)
            .field("data_version", &self.data_version)
            .finish()
    }
}

impl Entity for SourceInfo {
    const KIND: MetadataKind = MetadataKind::Source;

    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> EntityStatus {
        self.status
    }

    fn data_version(&self) -> i32 {
        self.data_version
    }

    fn set_data_version(&mut self, version: i32) {
        self.data_version = version;
    }
}

/// Sink system a pipeline forwards transformed rows to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    Redis,
    Mongodb,
    Elasticsearch,
    Rocketmq,
    Kafka,
    Rabbitmq,
    Http,
}

/// Sink endpoint configuration
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointInfo {
    pub id: u64,
    pub name: String,
    pub endpoint_type: EndpointType,
    pub addresses: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub status: EntityStatus,
    #[serde(default)]
    pub data_version: i32,
    #[serde(default)]
    pub create_time: i64,
    #[serde(default)]
    pub update_time: i64,
}

impl EndpointInfo {
    pub fn new(id: u64, name: impl Into<String>, endpoint_type: EndpointType, addresses: Vec<String>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id,
            name: name.into(),
            endpoint_type,
            addresses,
            username: String::new(),
            password: String::new(),
            options: BTreeMap::new(),
            status: EntityStatus::Enabled,
            data_version: 0,
            create_time: now,
            update_time: now,
        }
    }
}

impl fmt::Debug for EndpointInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointInfo")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("endpoint_type", &self.endpoint_type)
            .field("addresses", &self.addresses)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("status", &self.status)
            .field("data_version", &self.data_version)
            .finish()
    }
}

impl Entity for EndpointInfo {
    const KIND: MetadataKind = MetadataKind::Endpoint;

    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> EntityStatus {
        self.status
    }

    fn data_version(&self) -> i32 {
        self.data_version
    }

    fn set_data_version(&mut self, version: i32) {
        self.data_version = version;
    }
}

/// One source-table mapping inside a pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransformRule {
    pub id: u64,
    pub pipeline_id: u64,
    pub schema: String,
    pub table: String,
    /// Columns forwarded to the sink (empty = all columns)
    #[serde(default)]
    pub include_columns: Vec<String>,
    #[serde(default)]
    pub exclude_columns: Vec<String>,
    /// Lua script handed to the transformation engine, if any
    #[serde(default)]
    pub script: Option<String>,
    /// Sink-specific options (target key, topic, index, ...)
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl TransformRule {
    pub fn new(id: u64, pipeline_id: u64, schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            id,
            pipeline_id,
            schema: schema.into(),
            table: table.into(),
            include_columns: Vec::new(),
            exclude_columns: Vec::new(),
            script: None,
            options: BTreeMap::new(),
        }
    }

    /// Fully qualified `schema.table` name
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

/// Transform pipeline: a source, an endpoint and the rules between them
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineInfo {
    pub id: u64,
    pub name: String,
    pub source_id: u64,
    pub endpoint_id: u64,
    #[serde(default)]
    pub rules: Vec<TransformRule>,
    /// Maximum rows per sink batch
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Flush interval for partial batches, in milliseconds
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default)]
    pub status: EntityStatus,
    #[serde(default)]
    pub data_version: i32,
    #[serde(default)]
    pub create_time: i64,
    #[serde(default)]
    pub update_time: i64,
}

fn default_batch_size() -> u32 {
    100
}

fn default_flush_interval_ms() -> u64 {
    200
}

impl PipelineInfo {
    pub fn new(id: u64, name: impl Into<String>, source_id: u64, endpoint_id: u64) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id,
            name: name.into(),
            source_id,
            endpoint_id,
            rules: Vec::new(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            status: EntityStatus::Enabled,
            data_version: 0,
            create_time: now,
            update_time: now,
        }
    }

    /// Attach a rule, re-parenting it to this pipeline
    pub fn with_rule(mut self, mut rule: TransformRule) -> Self {
        rule.pipeline_id = self.id;
        self.rules.push(rule);
        self
    }
}

impl Entity for PipelineInfo {
    const KIND: MetadataKind = MetadataKind::Pipeline;

    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> EntityStatus {
        self.status
    }

    fn data_version(&self) -> i32 {
        self.data_version
    }

    fn set_data_version(&mut self, version: i32) {
        self.data_version = version;
    }

    fn rules(&self) -> &[TransformRule] {
        &self.rules
    }
}

/// `{id, version}` projection used by bulk reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataVersion {
    pub id: u64,
    pub version: i32,
}

/// Operational status of a running pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    #[default]
    Cease,
    Running,
    Fault,
    Batching,
    BatchEnd,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Cease => "cease",
            PipelineStatus::Running => "running",
            PipelineStatus::Fault => "fault",
            PipelineStatus::Batching => "batching",
            PipelineStatus::BatchEnd => "batchend",
        }
    }

    /// Whether a pipeline in this status is actively consuming events
    pub fn is_active(&self) -> bool {
        matches!(self, PipelineStatus::Running | PipelineStatus::Batching)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStatus {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cease" => Ok(PipelineStatus::Cease),
            "running" => Ok(PipelineStatus::Running),
            "fault" => Ok(PipelineStatus::Fault),
            "batching" => Ok(PipelineStatus::Batching),
            "batchend" => Ok(PipelineStatus::BatchEnd),
            other => Err(ClusterError::Serialization(format!(
                "unknown pipeline status '{}'",
                other
            ))),
        }
    }
}

/// Persisted run-state of one pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PipelineState {
    pub pipeline_id: u64,
    pub status: PipelineStatus,
    pub insert_count: u64,
    pub update_count: u64,
    pub delete_count: u64,
    /// Identity of the node driving the pipeline
    pub node: String,
    pub start_time: i64,
    pub update_time: i64,
    /// Last fault reported by the pipeline, if any
    #[serde(default)]
    pub message: Option<String>,
}

impl PipelineState {
    /// Fresh state for a pipeline starting on `node`
    pub fn started(pipeline_id: u64, node: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            pipeline_id,
            status: PipelineStatus::Running,
            node: node.into(),
            start_time: now,
            update_time: now,
            ..Default::default()
        }
    }

    /// Transition to a new status, stamping the update time
    pub fn transition(&mut self, status: PipelineStatus) {
        self.status = status;
        self.update_time = chrono::Utc::now().timestamp_millis();
        if status != PipelineStatus::Fault {
            self.message = None;
        }
    }

    /// Record a fault with its reason
    pub fn fault(&mut self, message: impl Into<String>) {
        self.transition(PipelineStatus::Fault);
        self.message = Some(message.into());
    }

    /// Add row counters from an applied batch
    pub fn record_batch(&mut self, inserts: u64, updates: u64, deletes: u64) {
        self.insert_count += inserts;
        self.update_count += updates;
        self.delete_count += deletes;
        self.update_time = chrono::Utc::now().timestamp_millis();
    }
}

/// Binlog resumption checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Position {
    /// Binlog file name, e.g. `mysql-bin.000003`
    pub name: String,
    /// Byte offset within the file
    pub pos: u32,
}

impl Position {
    pub fn new(name: impl Into<String>, pos: u32) -> Self {
        Self {
            name: name.into(),
            pos,
        }
    }

    /// An empty position means "start from the master's current position"
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.pos)
    }
}

impl FromStr for Position {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, pos) = s
            .rsplit_once(':')
            .ok_or_else(|| ClusterError::Serialization(format!("invalid binlog position '{}'", s)))?;
        let pos = pos
            .parse()
            .map_err(|_| ClusterError::Serialization(format!("invalid binlog offset '{}'", pos)))?;
        Ok(Position::new(name, pos))
    }
}
