//! The canonical cross-instance record and its ordering metadata.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::config::{SessionConfig, SyncMode};
use crate::snapshot::SessionSnapshot;
use crate::{require_i64, require_object, require_string, require_u64, ErrorInfo};
use crate::{LEADER_RECORD_VERSION, SHARED_STATE_VERSION};

/// Operation that produced a shared-state write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharedOperation {
    Bootstrap,
    Start,
    Stop,
    Reset,
    Extend,
    Expire,
    Pause,
    Resume,
    Config,
    Sync,
}

impl SharedOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SharedOperation::Bootstrap => "bootstrap",
            SharedOperation::Start => "start",
            SharedOperation::Stop => "stop",
            SharedOperation::Reset => "reset",
            SharedOperation::Extend => "extend",
            SharedOperation::Expire => "expire",
            SharedOperation::Pause => "pause",
            SharedOperation::Resume => "resume",
            SharedOperation::Config => "config",
            SharedOperation::Sync => "sync",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "bootstrap" => Some(SharedOperation::Bootstrap),
            "start" => Some(SharedOperation::Start),
            "stop" => Some(SharedOperation::Stop),
            "reset" => Some(SharedOperation::Reset),
            "extend" => Some(SharedOperation::Extend),
            "expire" => Some(SharedOperation::Expire),
            "pause" => Some(SharedOperation::Pause),
            "resume" => Some(SharedOperation::Resume),
            "config" => Some(SharedOperation::Config),
            "sync" => Some(SharedOperation::Sync),
            _ => None,
        }
    }
}

pub fn causality_token(writer_id: &str, logical_clock: u64) -> String {
    format!("{}:{}", writer_id, logical_clock)
}

/// Conflict-resolution key. Field order is the comparison priority:
/// revision, then logical clock, then writer id by ordinal string order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Triplet<'a> {
    pub revision: u64,
    pub logical_clock: u64,
    pub writer_id: &'a str,
}

impl<'a> Triplet<'a> {
    pub fn new(revision: u64, logical_clock: u64, writer_id: &'a str) -> Self {
        Triplet {
            revision,
            logical_clock,
            writer_id,
        }
    }

    /// True only when `self` strictly wins against `other`.
    pub fn beats(&self, other: &Triplet<'_>) -> bool {
        self.cmp(other) == Ordering::Greater
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub revision: u64,
    pub logical_clock: u64,
    pub writer_id: String,
    pub operation: SharedOperation,
    pub causality_token: String,
}

impl Metadata {
    pub fn new(revision: u64, logical_clock: u64, writer_id: &str, operation: SharedOperation) -> Self {
        Metadata {
            revision,
            logical_clock,
            writer_id: writer_id.to_string(),
            operation,
            causality_token: causality_token(writer_id, logical_clock),
        }
    }

    pub fn triplet(&self) -> Triplet<'_> {
        Triplet::new(self.revision, self.logical_clock, &self.writer_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderInfo {
    pub id: String,
    pub heartbeat_at: i64,
    pub epoch: u64,
}

/// Leader record persisted under the election namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderRecord {
    pub version: u32,
    pub id: String,
    pub updated_at: i64,
    pub epoch: u64,
}

impl LeaderRecord {
    pub fn new(id: &str, updated_at: i64, epoch: u64) -> Self {
        LeaderRecord {
            version: LEADER_RECORD_VERSION,
            id: id.to_string(),
            updated_at,
            epoch,
        }
    }

    pub fn info(&self) -> LeaderInfo {
        LeaderInfo {
            id: self.id.clone(),
            heartbeat_at: self.updated_at,
            epoch: self.epoch,
        }
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self, ErrorInfo> {
        let obj = require_object(value, "leader record")?;
        let id = require_string(obj, "id")?;
        let updated_at = require_i64(obj, "updatedAt")?;
        // Records written before epochs existed count as epoch 0.
        let epoch = obj.get("epoch").and_then(|v| v.as_u64()).unwrap_or(0);
        Ok(LeaderRecord::new(&id, updated_at, epoch))
    }
}

pub fn parse_leader_record(raw: &str) -> Result<LeaderRecord, ErrorInfo> {
    let value: serde_json::Value = serde_json::from_str(raw).map_err(|err| {
        ErrorInfo::new("invalid_json", format!("leader record is not JSON: {}", err))
    })?;
    LeaderRecord::from_value(&value)
}

/// Config projection with its own ordering triplet so config and snapshot
/// changes from different writers merge independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedConfig {
    pub config: SessionConfig,
    pub revision: u64,
    pub logical_clock: u64,
    pub writer_id: String,
}

impl SharedConfig {
    pub fn triplet(&self) -> Triplet<'_> {
        Triplet::new(self.revision, self.logical_clock, &self.writer_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedSessionState {
    pub version: u32,
    pub updated_at: i64,
    pub sync_mode: SyncMode,
    #[serde(default)]
    pub leader: Option<LeaderInfo>,
    pub metadata: Metadata,
    pub snapshot: SessionSnapshot,
    pub config: SharedConfig,
}

impl SharedSessionState {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.version != SHARED_STATE_VERSION {
            return Err(ErrorInfo::new(
                "unsupported_version",
                format!("shared state version {} is not current", self.version),
            ));
        }
        if self.metadata.writer_id.trim().is_empty() {
            return Err(ErrorInfo::new("missing_field", "metadata.writerId is required"));
        }
        if self.config.writer_id.trim().is_empty() {
            return Err(ErrorInfo::new("missing_field", "config.writerId is required"));
        }
        if let Some(leader) = self.leader.as_ref() {
            if leader.id.trim().is_empty() {
                return Err(ErrorInfo::new("missing_field", "leader.id is required"));
            }
        }
        self.snapshot.validate()
    }
}

pub(crate) fn parse_metadata_fields(
    value: &serde_json::Value,
) -> Result<(u64, u64, String), ErrorInfo> {
    let obj = require_object(value, "metadata")?;
    Ok((
        require_u64(obj, "revision")?,
        require_u64(obj, "logicalClock")?,
        require_string(obj, "writerId")?,
    ))
}
