//! Record and message types for idlesync cross-instance session sync.
//!
//! This crate is shared by the session core and its host tooling to prevent
//! schema drift. The core remains the authority on conflict resolution; this
//! crate only validates shape and coerces older persisted records into the
//! current schema.
//!
//! Everything here serializes as camelCase JSON because the same records are
//! written to storage and published to peers verbatim.

use serde::{Deserialize, Serialize};

mod config;
mod message;
mod migrate;
mod shared;
mod snapshot;

pub use config::{
    leader_ttl_ms, normalize_config, sanitize_config, ActionDelays, ActionDelaysPatch,
    ConfigOutcome, PersistedConfig, ResumeBehavior, SessionConfig, SessionConfigPatch, SyncMode,
    ValidationIssue, DEFAULT_STORAGE_KEY_PREFIX, LEADER_TTL_MULTIPLIER, MAX_DURATION_MS,
    MAX_INTERVAL_MS,
};
pub use message::{parse_wire_message, CrossTabKind, CrossTabMessage, WireMessage};
pub use migrate::{migrate_shared_state, parse_persisted_config, parse_shared_state};
pub use shared::{
    causality_token, parse_leader_record, LeaderInfo, LeaderRecord, Metadata, SharedConfig,
    SharedOperation, SharedSessionState, Triplet,
};
pub use snapshot::{parse_persisted_snapshot, PersistedSnapshot, SessionSnapshot, SessionState};

/// Current schema of the canonical shared-state record.
pub const SHARED_STATE_VERSION: u32 = 3;
pub const SNAPSHOT_VERSION: u32 = 1;
pub const CONFIG_VERSION: u32 = 1;
pub const LEADER_RECORD_VERSION: u32 = 1;

/// Peer payloads above this size are dropped before parsing.
pub const MAX_MESSAGE_BYTES: usize = 256 * 1024;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorInfo {}

// Field accessors shared by the hand-written validators. Peer payloads are
// checked field by field so that a partially valid record is never applied.

pub(crate) fn require_object<'a>(
    value: &'a serde_json::Value,
    what: &str,
) -> Result<&'a serde_json::Map<String, serde_json::Value>, ErrorInfo> {
    value
        .as_object()
        .ok_or_else(|| ErrorInfo::new("invalid_shape", format!("{} must be an object", what)))
}

pub(crate) fn require_string(
    obj: &serde_json::Map<String, serde_json::Value>,
    field: &str,
) -> Result<String, ErrorInfo> {
    match obj.get(field).and_then(|v| v.as_str()) {
        Some(value) if !value.trim().is_empty() => Ok(value.to_string()),
        _ => Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        )),
    }
}

pub(crate) fn require_i64(
    obj: &serde_json::Map<String, serde_json::Value>,
    field: &str,
) -> Result<i64, ErrorInfo> {
    obj.get(field).and_then(|v| v.as_i64()).ok_or_else(|| {
        ErrorInfo::new(
            "missing_field",
            format!("{} must be an integer timestamp", field),
        )
    })
}

pub(crate) fn require_u64(
    obj: &serde_json::Map<String, serde_json::Value>,
    field: &str,
) -> Result<u64, ErrorInfo> {
    obj.get(field).and_then(|v| v.as_u64()).ok_or_else(|| {
        ErrorInfo::new(
            "missing_field",
            format!("{} must be a non-negative integer", field),
        )
    })
}

pub(crate) fn require_bool(
    obj: &serde_json::Map<String, serde_json::Value>,
    field: &str,
) -> Result<bool, ErrorInfo> {
    obj.get(field)
        .and_then(|v| v.as_bool())
        .ok_or_else(|| ErrorInfo::new("missing_field", format!("{} must be a boolean", field)))
}
