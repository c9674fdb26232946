//! Versioned migration of persisted and received records.
//!
//! Older shared-state records lack ordering metadata. Missing metadata is
//! synthesized deterministically from `writerId`/`updatedAt` with revision 0,
//! so a migrated record always loses to any write made under the current
//! schema while still ordering consistently among other legacy records.

use serde_json::{Map, Value};

use crate::config::{
    normalize_config, sanitize_config, PersistedConfig, SessionConfig, SessionConfigPatch, SyncMode,
};
use crate::shared::{
    parse_metadata_fields, LeaderInfo, Metadata, SharedConfig, SharedOperation, SharedSessionState,
};
use crate::snapshot::SessionSnapshot;
use crate::{require_i64, require_object, ErrorInfo, CONFIG_VERSION, SHARED_STATE_VERSION};

const LEGACY_WRITER_ID: &str = "legacy";

pub fn parse_shared_state(raw: &str) -> Result<SharedSessionState, ErrorInfo> {
    let value: Value = serde_json::from_str(raw).map_err(|err| {
        ErrorInfo::new("invalid_json", format!("shared state is not JSON: {}", err))
    })?;
    migrate_shared_state(value)
}

pub fn migrate_shared_state(value: Value) -> Result<SharedSessionState, ErrorInfo> {
    let version = value
        .get("version")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| ErrorInfo::new("missing_version", "shared state has no version"))?;

    match version {
        1 => migrate_v1(require_object(&value, "shared state")?),
        2 => migrate_v2(require_object(&value, "shared state")?),
        v if v == u64::from(SHARED_STATE_VERSION) => parse_current(value),
        other => Err(ErrorInfo::new(
            "unsupported_version",
            format!("shared state version {} is not supported", other),
        )),
    }
}

fn parse_current(value: Value) -> Result<SharedSessionState, ErrorInfo> {
    let mut state: SharedSessionState = serde_json::from_value(value).map_err(|err| {
        ErrorInfo::new("invalid_shape", format!("shared state: {}", err))
    })?;
    state.snapshot = state.snapshot.normalize()?;
    state.config.config = sanitize_config(&state.config.config).config;
    state.validate()?;
    Ok(state)
}

/// v1: `{ version, updatedAt, writerId, snapshot, config }`.
fn migrate_v1(obj: &Map<String, Value>) -> Result<SharedSessionState, ErrorInfo> {
    let updated_at = require_i64(obj, "updatedAt")?;
    let writer_id = obj
        .get("writerId")
        .and_then(|v| v.as_str())
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(LEGACY_WRITER_ID)
        .to_string();
    let snapshot = parse_snapshot(obj.get("snapshot"))?;
    let config = parse_config(obj.get("config"))?;
    let clock = updated_at.max(0) as u64;

    Ok(SharedSessionState {
        version: SHARED_STATE_VERSION,
        updated_at,
        sync_mode: config.sync_mode,
        leader: None,
        metadata: Metadata::new(0, clock, &writer_id, SharedOperation::Sync),
        snapshot,
        config: SharedConfig {
            config,
            revision: 0,
            logical_clock: clock,
            writer_id,
        },
    })
}

/// v2: metadata without operation/causality token; config without its own
/// ordering triplet.
fn migrate_v2(obj: &Map<String, Value>) -> Result<SharedSessionState, ErrorInfo> {
    let updated_at = require_i64(obj, "updatedAt")?;
    let metadata_value = obj
        .get("metadata")
        .ok_or_else(|| ErrorInfo::new("missing_field", "metadata is required"))?;
    let (revision, logical_clock, writer_id) = parse_metadata_fields(metadata_value)?;
    let operation = metadata_value
        .get("operation")
        .and_then(|v| v.as_str())
        .and_then(SharedOperation::parse)
        .unwrap_or(SharedOperation::Sync);
    let snapshot = parse_snapshot(obj.get("snapshot"))?;
    let config = parse_config(obj.get("config"))?;
    let sync_mode = obj
        .get("syncMode")
        .and_then(|v| serde_json::from_value::<SyncMode>(v.clone()).ok())
        .unwrap_or(config.sync_mode);
    // A malformed leader block is not needed to order the record; drop it.
    let leader = obj
        .get("leader")
        .and_then(|v| serde_json::from_value::<LeaderInfo>(v.clone()).ok())
        .filter(|leader| !leader.id.trim().is_empty());

    Ok(SharedSessionState {
        version: SHARED_STATE_VERSION,
        updated_at,
        sync_mode,
        leader,
        metadata: Metadata::new(revision, logical_clock, &writer_id, operation),
        snapshot,
        config: SharedConfig {
            config,
            revision,
            logical_clock,
            writer_id,
        },
    })
}

fn parse_snapshot(value: Option<&Value>) -> Result<SessionSnapshot, ErrorInfo> {
    let value = value.ok_or_else(|| ErrorInfo::new("missing_field", "snapshot is required"))?;
    let snapshot: SessionSnapshot = serde_json::from_value(value.clone())
        .map_err(|err| ErrorInfo::new("invalid_snapshot", format!("snapshot: {}", err)))?;
    snapshot.normalize()
}

fn parse_config(value: Option<&Value>) -> Result<SessionConfig, ErrorInfo> {
    let Some(value) = value else {
        return Ok(SessionConfig::default());
    };
    let patch: SessionConfigPatch = serde_json::from_value(value.clone())
        .map_err(|err| ErrorInfo::new("invalid_config", format!("config: {}", err)))?;
    Ok(normalize_config(&SessionConfig::default(), &patch).config)
}

/// Parses `{prefix}:config`. A bare, unversioned object is treated as a
/// config patch written before the envelope existed.
pub fn parse_persisted_config(raw: &str) -> Result<PersistedConfig, ErrorInfo> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|err| ErrorInfo::new("invalid_json", format!("config is not JSON: {}", err)))?;

    match value.get("version").and_then(|v| v.as_u64()) {
        Some(version) if version == u64::from(CONFIG_VERSION) => {
            let persisted: PersistedConfig = serde_json::from_value(value).map_err(|err| {
                ErrorInfo::new("invalid_config", format!("config envelope: {}", err))
            })?;
            persisted.validate()?;
            Ok(PersistedConfig::new(
                persisted.saved_at,
                sanitize_config(&persisted.config).config,
            ))
        }
        Some(version) => Err(ErrorInfo::new(
            "unsupported_version",
            format!("config version {} is not supported", version),
        )),
        None => Ok(PersistedConfig::new(0, parse_config(Some(&value))?)),
    }
}
