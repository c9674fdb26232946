//! Session timing configuration, partial patches, and normalization.
//!
//! Invalid values are never applied verbatim: `normalize_config` replaces
//! each offending field with its default and reports a `ValidationIssue`.

use serde::{Deserialize, Serialize};

use crate::{ErrorInfo, CONFIG_VERSION};

pub const DEFAULT_STORAGE_KEY_PREFIX: &str = "idlesync";

/// Leader records older than `leaderHeartbeatMs * LEADER_TTL_MULTIPLIER` are stale.
pub const LEADER_TTL_MULTIPLIER: u64 = 3;

/// Largest accepted timing duration or action delay (one year).
pub const MAX_DURATION_MS: u64 = 365 * 24 * 60 * 60 * 1000;

/// Largest accepted poll or heartbeat interval (one hour).
pub const MAX_INTERVAL_MS: u64 = 60 * 60 * 1000;

/// Age after which a leader record with the given heartbeat is stale.
pub fn leader_ttl_ms(heartbeat_ms: u64) -> u64 {
    heartbeat_ms.saturating_mul(LEADER_TTL_MULTIPLIER)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncMode {
    /// One advisory leader publishes canonical state; followers send deltas.
    Leader,
    /// Every instance publishes; conflicts resolve by revision/clock/writer.
    Distributed,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Leader => "leader",
            SyncMode::Distributed => "distributed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResumeBehavior {
    Manual,
    AutoOnServerSync,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActionDelays {
    pub start: u64,
    pub stop: u64,
    pub reset: u64,
    pub extend: u64,
    pub expire: u64,
    pub pause: u64,
    pub resume: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub idle_grace_ms: u64,
    pub countdown_ms: u64,
    pub warn_before_ms: u64,
    pub activity_reset_cooldown_ms: u64,
    pub poll_interval_ms: u64,
    pub leader_heartbeat_ms: u64,
    pub storage_key_prefix: String,
    pub sync_mode: SyncMode,
    pub resume_behavior: ResumeBehavior,
    pub ignore_user_activity_when_paused: bool,
    pub allow_manual_extend_when_expired: bool,
    pub action_delays: ActionDelays,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            idle_grace_ms: 120_000,
            countdown_ms: 60_000,
            warn_before_ms: 30_000,
            activity_reset_cooldown_ms: 5_000,
            poll_interval_ms: 500,
            leader_heartbeat_ms: 2_000,
            storage_key_prefix: DEFAULT_STORAGE_KEY_PREFIX.to_string(),
            sync_mode: SyncMode::Leader,
            resume_behavior: ResumeBehavior::Manual,
            ignore_user_activity_when_paused: false,
            allow_manual_extend_when_expired: false,
            action_delays: ActionDelays::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActionDelaysPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extend: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume: Option<i64>,
}

/// Partial configuration. Durations are signed so that negative input can be
/// detected and reported instead of wrapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfigPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_grace_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub countdown_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warn_before_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_reset_cooldown_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_heartbeat_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_key_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_mode: Option<SyncMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_behavior: Option<ResumeBehavior>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore_user_activity_when_paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_manual_extend_when_expired: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_delays: Option<ActionDelaysPatch>,
}

impl SessionConfigPatch {
    pub fn is_empty(&self) -> bool {
        *self == SessionConfigPatch::default()
    }

    /// A patch that sets every field of `config`. Used to re-validate configs
    /// received from peers or storage.
    pub fn from_config(config: &SessionConfig) -> Self {
        let delays = &config.action_delays;
        SessionConfigPatch {
            idle_grace_ms: Some(to_signed(config.idle_grace_ms)),
            countdown_ms: Some(to_signed(config.countdown_ms)),
            warn_before_ms: Some(to_signed(config.warn_before_ms)),
            activity_reset_cooldown_ms: Some(to_signed(config.activity_reset_cooldown_ms)),
            poll_interval_ms: Some(to_signed(config.poll_interval_ms)),
            leader_heartbeat_ms: Some(to_signed(config.leader_heartbeat_ms)),
            storage_key_prefix: Some(config.storage_key_prefix.clone()),
            sync_mode: Some(config.sync_mode),
            resume_behavior: Some(config.resume_behavior),
            ignore_user_activity_when_paused: Some(config.ignore_user_activity_when_paused),
            allow_manual_extend_when_expired: Some(config.allow_manual_extend_when_expired),
            action_delays: Some(ActionDelaysPatch {
                start: Some(to_signed(delays.start)),
                stop: Some(to_signed(delays.stop)),
                reset: Some(to_signed(delays.reset)),
                extend: Some(to_signed(delays.extend)),
                expire: Some(to_signed(delays.expire)),
                pause: Some(to_signed(delays.pause)),
                resume: Some(to_signed(delays.resume)),
            }),
        }
    }
}

fn to_signed(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(field: &str, message: impl Into<String>) -> Self {
        ValidationIssue {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigOutcome {
    pub config: SessionConfig,
    pub issues: Vec<ValidationIssue>,
}

/// Merges `patch` into `base`. Fields absent from the patch keep the base
/// value; invalid fields fall back to the default and are reported.
pub fn normalize_config(base: &SessionConfig, patch: &SessionConfigPatch) -> ConfigOutcome {
    let defaults = SessionConfig::default();
    let mut issues = Vec::new();
    let mut config = base.clone();

    config.idle_grace_ms = merge_duration(
        "idleGraceMs",
        patch.idle_grace_ms,
        base.idle_grace_ms,
        defaults.idle_grace_ms,
        Bound::duration(),
        &mut issues,
    );
    config.countdown_ms = merge_duration(
        "countdownMs",
        patch.countdown_ms,
        base.countdown_ms,
        defaults.countdown_ms,
        Bound::duration(),
        &mut issues,
    );
    config.warn_before_ms = merge_duration(
        "warnBeforeMs",
        patch.warn_before_ms,
        base.warn_before_ms,
        defaults.warn_before_ms,
        Bound::duration(),
        &mut issues,
    );
    config.activity_reset_cooldown_ms = merge_duration(
        "activityResetCooldownMs",
        patch.activity_reset_cooldown_ms,
        base.activity_reset_cooldown_ms,
        defaults.activity_reset_cooldown_ms,
        Bound::duration(),
        &mut issues,
    );
    config.poll_interval_ms = merge_duration(
        "pollIntervalMs",
        patch.poll_interval_ms,
        base.poll_interval_ms,
        defaults.poll_interval_ms,
        Bound::interval(),
        &mut issues,
    );
    config.leader_heartbeat_ms = merge_duration(
        "leaderHeartbeatMs",
        patch.leader_heartbeat_ms,
        base.leader_heartbeat_ms,
        defaults.leader_heartbeat_ms,
        Bound::interval(),
        &mut issues,
    );

    if let Some(prefix) = patch.storage_key_prefix.as_ref() {
        if prefix.trim().is_empty() {
            issues.push(ValidationIssue::new(
                "storageKeyPrefix",
                "must not be empty; using default",
            ));
            config.storage_key_prefix = defaults.storage_key_prefix.clone();
        } else {
            config.storage_key_prefix = prefix.trim().to_string();
        }
    }
    if let Some(mode) = patch.sync_mode {
        config.sync_mode = mode;
    }
    if let Some(behavior) = patch.resume_behavior {
        config.resume_behavior = behavior;
    }
    if let Some(flag) = patch.ignore_user_activity_when_paused {
        config.ignore_user_activity_when_paused = flag;
    }
    if let Some(flag) = patch.allow_manual_extend_when_expired {
        config.allow_manual_extend_when_expired = flag;
    }

    if let Some(delays) = patch.action_delays.as_ref() {
        let current = &base.action_delays;
        config.action_delays = ActionDelays {
            start: merge_duration("actionDelays.start", delays.start, current.start, 0, Bound::duration(), &mut issues),
            stop: merge_duration("actionDelays.stop", delays.stop, current.stop, 0, Bound::duration(), &mut issues),
            reset: merge_duration("actionDelays.reset", delays.reset, current.reset, 0, Bound::duration(), &mut issues),
            extend: merge_duration("actionDelays.extend", delays.extend, current.extend, 0, Bound::duration(), &mut issues),
            expire: merge_duration("actionDelays.expire", delays.expire, current.expire, 0, Bound::duration(), &mut issues),
            pause: merge_duration("actionDelays.pause", delays.pause, current.pause, 0, Bound::duration(), &mut issues),
            resume: merge_duration("actionDelays.resume", delays.resume, current.resume, 0, Bound::duration(), &mut issues),
        };
    }

    // Cross-field check runs on the merged result so an inherited base value
    // that conflicts with a new countdown is caught too.
    if config.warn_before_ms > config.countdown_ms {
        issues.push(ValidationIssue::new(
            "warnBeforeMs",
            format!(
                "{} exceeds countdownMs {}; using default",
                config.warn_before_ms, config.countdown_ms
            ),
        ));
        config.warn_before_ms = defaults.warn_before_ms.min(config.countdown_ms);
    }

    ConfigOutcome { config, issues }
}

#[derive(Debug, Clone, Copy)]
struct Bound {
    allow_zero: bool,
    max: u64,
}

impl Bound {
    fn duration() -> Self {
        Bound {
            allow_zero: true,
            max: MAX_DURATION_MS,
        }
    }

    fn interval() -> Self {
        Bound {
            allow_zero: false,
            max: MAX_INTERVAL_MS,
        }
    }
}

fn merge_duration(
    field: &str,
    value: Option<i64>,
    current: u64,
    default: u64,
    bound: Bound,
    issues: &mut Vec<ValidationIssue>,
) -> u64 {
    let Some(v) = value else {
        return current;
    };
    if v < 0 {
        issues.push(ValidationIssue::new(
            field,
            format!("{} is negative; using default {}", v, default),
        ));
        return default;
    }
    if v == 0 && !bound.allow_zero {
        issues.push(ValidationIssue::new(
            field,
            format!("must be greater than zero; using default {}", default),
        ));
        return default;
    }
    match u64::try_from(v) {
        Ok(ms) if ms <= bound.max => ms,
        _ => {
            issues.push(ValidationIssue::new(
                field,
                format!("{} exceeds the maximum {}; using default {}", v, bound.max, default),
            ));
            default
        }
    }
}

/// Re-validates a config that did not come through `normalize_config`,
/// e.g. one read from storage or received from a peer.
pub fn sanitize_config(config: &SessionConfig) -> ConfigOutcome {
    normalize_config(&SessionConfig::default(), &SessionConfigPatch::from_config(config))
}

/// Envelope stored under `{prefix}:config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedConfig {
    pub version: u32,
    pub saved_at: i64,
    pub config: SessionConfig,
}

impl PersistedConfig {
    pub fn new(saved_at: i64, config: SessionConfig) -> Self {
        PersistedConfig {
            version: CONFIG_VERSION,
            saved_at,
            config,
        }
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.version != CONFIG_VERSION {
            return Err(ErrorInfo::new(
                "unsupported_version",
                format!("config version {} is not supported", self.version),
            ));
        }
        Ok(())
    }
}
