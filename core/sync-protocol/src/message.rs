//! Messages exchanged between live instances over the transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::migrate::migrate_shared_state;
use crate::shared::{LeaderRecord, SharedSessionState};
use crate::{require_bool, require_i64, require_object, require_string, ErrorInfo, MAX_MESSAGE_BYTES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CrossTabKind {
    Extend,
    Expire,
    Sync,
    Reset,
    SyncRequest,
}

impl CrossTabKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrossTabKind::Extend => "extend",
            CrossTabKind::Expire => "expire",
            CrossTabKind::Sync => "sync",
            CrossTabKind::Reset => "reset",
            CrossTabKind::SyncRequest => "sync-request",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "extend" => Some(CrossTabKind::Extend),
            "expire" => Some(CrossTabKind::Expire),
            "sync" => Some(CrossTabKind::Sync),
            "reset" => Some(CrossTabKind::Reset),
            "sync-request" => Some(CrossTabKind::SyncRequest),
            _ => None,
        }
    }
}

/// Ephemeral low-latency delta. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossTabMessage {
    pub source_id: String,
    #[serde(rename = "type")]
    pub kind: CrossTabKind,
    pub at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl CrossTabMessage {
    pub fn new(source_id: &str, kind: CrossTabKind, at: i64, payload: Option<Value>) -> Self {
        CrossTabMessage {
            source_id: source_id.to_string(),
            kind,
            at,
            payload,
        }
    }

    fn from_value(value: &Value) -> Result<Self, ErrorInfo> {
        let obj = require_object(value, "message")?;
        let source_id = require_string(obj, "sourceId")?;
        let kind_str = require_string(obj, "type")?;
        let kind = CrossTabKind::parse(&kind_str).ok_or_else(|| {
            ErrorInfo::new("invalid_type", format!("unknown cross-tab type {}", kind_str))
        })?;
        let at = require_i64(obj, "at")?;
        let payload = obj.get("payload").filter(|v| !v.is_null()).cloned();
        Ok(CrossTabMessage::new(&source_id, kind, at, payload))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WireMessage {
    #[serde(rename_all = "camelCase")]
    State {
        source_id: String,
        state: SharedSessionState,
    },
    #[serde(rename_all = "camelCase")]
    RequestSync {
        source_id: String,
        reason: String,
        expect_reply: bool,
    },
    #[serde(rename_all = "camelCase")]
    Delta { message: CrossTabMessage },
    #[serde(rename_all = "camelCase")]
    Leader {
        source_id: String,
        record: Option<LeaderRecord>,
    },
}

impl WireMessage {
    pub fn source_id(&self) -> &str {
        match self {
            WireMessage::State { source_id, .. }
            | WireMessage::RequestSync { source_id, .. }
            | WireMessage::Leader { source_id, .. } => source_id,
            WireMessage::Delta { message } => &message.source_id,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            WireMessage::State { .. } => "state",
            WireMessage::RequestSync { .. } => "request-sync",
            WireMessage::Delta { .. } => "delta",
            WireMessage::Leader { .. } => "leader",
        }
    }

    pub fn to_json(&self) -> Result<String, ErrorInfo> {
        serde_json::to_string(self).map_err(|err| {
            ErrorInfo::new(
                "serialization_error",
                format!("failed to serialize {} message: {}", self.type_name(), err),
            )
        })
    }
}

/// Parses and structurally validates a peer payload. Shared-state payloads
/// go through schema migration, so older peers are coerced rather than
/// rejected when their records can be upgraded safely.
pub fn parse_wire_message(raw: &str) -> Result<WireMessage, ErrorInfo> {
    if raw.len() > MAX_MESSAGE_BYTES {
        return Err(ErrorInfo::new(
            "message_too_large",
            "message exceeded maximum size",
        ));
    }
    let value: Value = serde_json::from_str(raw).map_err(|err| {
        ErrorInfo::new("invalid_json", format!("message was not valid JSON: {}", err))
    })?;
    let obj = require_object(&value, "message")?;
    let kind = require_string(obj, "type")?;

    match kind.as_str() {
        "state" => {
            let source_id = require_string(obj, "sourceId")?;
            let state_value = obj
                .get("state")
                .cloned()
                .ok_or_else(|| ErrorInfo::new("missing_field", "state is required"))?;
            let state = migrate_shared_state(state_value)?;
            Ok(WireMessage::State { source_id, state })
        }
        "request-sync" => Ok(WireMessage::RequestSync {
            source_id: require_string(obj, "sourceId")?,
            reason: obj
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or("unspecified")
                .to_string(),
            expect_reply: require_bool(obj, "expectReply")?,
        }),
        "delta" => {
            let message = obj
                .get("message")
                .ok_or_else(|| ErrorInfo::new("missing_field", "message is required"))?;
            Ok(WireMessage::Delta {
                message: CrossTabMessage::from_value(message)?,
            })
        }
        "leader" => {
            let source_id = require_string(obj, "sourceId")?;
            let record = match obj.get("record") {
                None | Some(Value::Null) => None,
                Some(value) => Some(LeaderRecord::from_value(value)?),
            };
            Ok(WireMessage::Leader { source_id, record })
        }
        other => Err(ErrorInfo::new(
            "invalid_type",
            format!("unknown message type {}", other),
        )),
    }
}
