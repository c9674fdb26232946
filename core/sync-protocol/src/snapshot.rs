//! Per-instance session snapshot and its persisted envelope.

use serde::{Deserialize, Serialize};

use crate::{ErrorInfo, SNAPSHOT_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Idle,
    Countdown,
    Warn,
    Expired,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "IDLE",
            SessionState::Countdown => "COUNTDOWN",
            SessionState::Warn => "WARN",
            SessionState::Expired => "EXPIRED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "IDLE" => Some(SessionState::Idle),
            "COUNTDOWN" => Some(SessionState::Countdown),
            "WARN" => Some(SessionState::Warn),
            "EXPIRED" => Some(SessionState::Expired),
            _ => None,
        }
    }

    /// COUNTDOWN and WARN both run against `countdownEndAt`.
    pub fn is_counting_down(&self) -> bool {
        matches!(self, SessionState::Countdown | SessionState::Warn)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub remaining_ms: u64,
    #[serde(default)]
    pub idle_start_at: Option<i64>,
    #[serde(default)]
    pub countdown_end_at: Option<i64>,
    #[serde(default)]
    pub last_activity_at: Option<i64>,
    #[serde(default)]
    pub paused: bool,
    /// Wall-clock instant the session was paused. Resume shifts the running
    /// timestamps by the paused span so the frozen remaining time survives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<i64>,
}

impl SessionSnapshot {
    /// IDLE with every timestamp cleared. This is the shape of a session that
    /// was never started or was explicitly stopped.
    pub fn stopped(countdown_ms: u64) -> Self {
        SessionSnapshot {
            state: SessionState::Idle,
            remaining_ms: countdown_ms,
            idle_start_at: None,
            countdown_end_at: None,
            last_activity_at: None,
            paused: false,
            paused_at: None,
        }
    }

    /// A stopped session sits in IDLE with no idle anchor and never advances.
    pub fn is_running(&self) -> bool {
        self.state != SessionState::Idle || self.idle_start_at.is_some()
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.state.is_counting_down() && self.countdown_end_at.is_none() {
            return Err(ErrorInfo::new(
                "invalid_snapshot",
                format!("{} requires countdownEndAt", self.state),
            ));
        }
        if self.state == SessionState::Idle && self.countdown_end_at.is_some() {
            return Err(ErrorInfo::new(
                "invalid_snapshot",
                "IDLE must not carry countdownEndAt",
            ));
        }
        if self.state == SessionState::Expired && self.remaining_ms != 0 {
            return Err(ErrorInfo::new(
                "invalid_snapshot",
                "EXPIRED requires remainingMs = 0",
            ));
        }
        if self.paused_at.is_some() && !self.paused {
            return Err(ErrorInfo::new(
                "invalid_snapshot",
                "pausedAt is only valid while paused",
            ));
        }
        Ok(())
    }

    /// Coerces the invariants that can be repaired without guessing, then
    /// validates what is left.
    pub fn normalize(mut self) -> Result<Self, ErrorInfo> {
        match self.state {
            SessionState::Expired => self.remaining_ms = 0,
            SessionState::Idle => self.countdown_end_at = None,
            SessionState::Countdown | SessionState::Warn => {}
        }
        if !self.paused {
            self.paused_at = None;
        }
        self.validate()?;
        Ok(self)
    }
}

/// Envelope stored under `{prefix}:snapshot`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSnapshot {
    pub version: u32,
    pub saved_at: i64,
    pub writer_id: String,
    pub snapshot: SessionSnapshot,
}

impl PersistedSnapshot {
    pub fn new(saved_at: i64, writer_id: &str, snapshot: SessionSnapshot) -> Self {
        PersistedSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at,
            writer_id: writer_id.to_string(),
            snapshot,
        }
    }
}

/// Parses `{prefix}:snapshot`. Unversioned records are bare snapshots written
/// before the envelope existed; they are wrapped with `savedAt = 0`.
pub fn parse_persisted_snapshot(raw: &str) -> Result<PersistedSnapshot, ErrorInfo> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|err| ErrorInfo::new("invalid_json", format!("snapshot is not JSON: {}", err)))?;

    match value.get("version").and_then(|v| v.as_u64()) {
        Some(version) if version == u64::from(SNAPSHOT_VERSION) => {
            let persisted: PersistedSnapshot = serde_json::from_value(value).map_err(|err| {
                ErrorInfo::new("invalid_snapshot", format!("snapshot envelope: {}", err))
            })?;
            let snapshot = persisted.snapshot.normalize()?;
            Ok(PersistedSnapshot {
                snapshot,
                ..persisted
            })
        }
        Some(version) => Err(ErrorInfo::new(
            "unsupported_version",
            format!("snapshot version {} is not supported", version),
        )),
        None => {
            let snapshot: SessionSnapshot = serde_json::from_value(value).map_err(|err| {
                ErrorInfo::new("invalid_snapshot", format!("legacy snapshot: {}", err))
            })?;
            Ok(PersistedSnapshot::new(0, "legacy", snapshot.normalize()?))
        }
    }
}
