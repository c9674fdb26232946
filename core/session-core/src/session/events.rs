//! Lifecycle events emitted by the session machine.

use serde::Serialize;

use idlesync_protocol::{SessionSnapshot, ValidationIssue};

use crate::activity::ActivitySource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionEventKind {
    Started,
    CountdownStarted,
    Extended,
    WarnShown,
    Expired,
    Stopped,
    ResetByActivity,
    ResetByRouter,
    Paused,
    Resumed,
    ConfigChanged,
    LeaderElected,
    LeaderLost,
}

impl SessionEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEventKind::Started => "started",
            SessionEventKind::CountdownStarted => "countdown-started",
            SessionEventKind::Extended => "extended",
            SessionEventKind::WarnShown => "warn-shown",
            SessionEventKind::Expired => "expired",
            SessionEventKind::Stopped => "stopped",
            SessionEventKind::ResetByActivity => "reset-by-activity",
            SessionEventKind::ResetByRouter => "reset-by-router",
            SessionEventKind::Paused => "paused",
            SessionEventKind::Resumed => "resumed",
            SessionEventKind::ConfigChanged => "config-changed",
            SessionEventKind::LeaderElected => "leader-elected",
            SessionEventKind::LeaderLost => "leader-lost",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "detail", rename_all = "kebab-case")]
pub enum EventDetail {
    None,
    Timeout,
    #[serde(rename_all = "camelCase")]
    Manual { reason: String },
    #[serde(rename_all = "camelCase")]
    Activity { source: ActivitySource },
    #[serde(rename_all = "camelCase")]
    Config { issues: Vec<ValidationIssue> },
    #[serde(rename_all = "camelCase")]
    Leader { leader_id: String, epoch: u64 },
    /// Applied from another instance's canonical record.
    #[serde(rename_all = "camelCase")]
    Remote { writer_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub at: i64,
    pub instance_id: String,
    pub snapshot: SessionSnapshot,
    #[serde(flatten)]
    pub detail: EventDetail,
}
