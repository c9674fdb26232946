use std::sync::Arc;

use serde_json::{json, Value};
use ulid::Ulid;

use idlesync_protocol::{
    normalize_config, parse_persisted_config, parse_persisted_snapshot, sanitize_config, CrossTabKind,
    CrossTabMessage, Metadata, PersistedConfig, PersistedSnapshot, ResumeBehavior, SessionConfig,
    SessionConfigPatch, SessionSnapshot, SessionState, SharedConfig, SharedOperation,
    SharedSessionState, SyncMode, ValidationIssue, SHARED_STATE_VERSION,
};

use crate::activity::{ActivityEvent, ActivitySource};
use crate::clock::{Clock, SystemClock};
use crate::coordinator::{Inbound, PublishOptions, SharedStateCoordinator};
use crate::leader::{LeaderElection, LeadershipChange};
use crate::observer::{Observers, SubscriptionId};
use crate::storage::{DurableStore, MemoryBackend, StorageBackend, StorageKeys};
use crate::transport::{BroadcastHub, TransportKind};

use super::conflict::{self, AcceptContext, LamportState};
use super::delay::{ActionKind, DelayedActions, PendingAction};
use super::events::{EventDetail, SessionEvent, SessionEventKind};
use super::tick;

/// Where an operation came from. Remote operations are deltas forwarded by
/// a follower and are never forwarded again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Local,
    Remote,
}

#[derive(Default)]
pub struct SessionTimeoutBuilder {
    clock: Option<Arc<dyn Clock>>,
    backend: Option<Arc<dyn StorageBackend>>,
    hub: Option<BroadcastHub>,
    config: SessionConfigPatch,
    instance_id: Option<String>,
}

impl SessionTimeoutBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn broadcast_hub(mut self, hub: BroadcastHub) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn config(mut self, patch: SessionConfigPatch) -> Self {
        self.config = patch;
        self
    }

    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    /// Restores persisted state and joins the peer group. Storage and
    /// transport faults degrade silently; building never fails.
    pub fn build(self) -> SessionTimeout {
        let instance_id = self
            .instance_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Ulid::new().to_string());
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(MemoryBackend::new()));
        let store = Arc::new(DurableStore::new(backend, &instance_id));

        // The prefix locates everything else, so it comes from the explicit
        // patch (or the default) alone.
        let initial = normalize_config(&SessionConfig::default(), &self.config);
        let keys = StorageKeys::new(&initial.config.storage_key_prefix);
        let mut startup_issues = initial.issues;
        let mut config = initial.config;
        if let Some(persisted) = read_persisted_config(&store, &keys) {
            let outcome = normalize_config(&persisted.config, &self.config);
            startup_issues = outcome.issues;
            config = outcome.config;
            config.storage_key_prefix = keys.prefix().to_string();
        }

        let persisted_snapshot = read_persisted_snapshot(&store, &keys);
        let mut coordinator =
            SharedStateCoordinator::connect(&instance_id, store.clone(), self.hub, keys.clone());

        let canonical = coordinator.load_persisted();
        let lamport = canonical.as_ref().map(LamportState::restore).unwrap_or_default();
        let mut snapshot = persisted_snapshot
            .as_ref()
            .map(|persisted| persisted.snapshot.clone())
            .unwrap_or_else(|| SessionSnapshot::stopped(config.countdown_ms));

        if let Some(canonical) = canonical {
            let local_saved_at = persisted_snapshot
                .as_ref()
                .map(|persisted| persisted.saved_at)
                .unwrap_or(i64::MIN);
            if canonical.updated_at >= local_saved_at {
                snapshot = canonical.snapshot.clone();
            }
            if canonical.config.revision > 0
                && canonical.config.config.storage_key_prefix == keys.prefix()
            {
                config = canonical.config.config.clone();
            }
            coordinator.remember(canonical);
        }

        let expiry_fired = snapshot.state == SessionState::Expired;
        tracing::info!(
            instance = %instance_id,
            state = %snapshot.state,
            sync_mode = config.sync_mode.as_str(),
            transport = coordinator.transport_kind().as_str(),
            "Session timeout restored"
        );

        let mut machine = SessionTimeout {
            instance_id,
            clock,
            store,
            config,
            startup_issues,
            snapshot,
            coordinator,
            leader: None,
            lamport,
            delays: DelayedActions::new(),
            applying_shared: false,
            expiry_fired,
            last_activity_reset_at: None,
            closed: false,
            events: Observers::new("session-events"),
            activity: Observers::new("activity"),
            cross_tab: Observers::new("cross-tab"),
            expiry_hooks: Observers::new("expiry-hooks"),
        };

        if machine.config.sync_mode == SyncMode::Leader {
            machine.leader = Some(machine.new_election());
            machine.drive_leader(LeaderElection::configure);
        }
        machine.coordinator.request_sync("bootstrap", true);
        machine
    }
}

/// Idle/countdown/warn/expiry state machine for one instance, kept in sync
/// with its peers through the shared store and transport.
pub struct SessionTimeout {
    instance_id: String,
    clock: Arc<dyn Clock>,
    store: Arc<DurableStore>,
    config: SessionConfig,
    startup_issues: Vec<ValidationIssue>,
    snapshot: SessionSnapshot,
    coordinator: SharedStateCoordinator,
    leader: Option<LeaderElection>,
    lamport: LamportState,
    delays: DelayedActions,
    /// Set while a received record is being applied; suppresses publishing.
    applying_shared: bool,
    expiry_fired: bool,
    last_activity_reset_at: Option<i64>,
    closed: bool,
    events: Observers<SessionEvent>,
    activity: Observers<ActivityEvent>,
    cross_tab: Observers<CrossTabMessage>,
    expiry_hooks: Observers<SessionSnapshot>,
}

impl SessionTimeout {
    pub fn builder() -> SessionTimeoutBuilder {
        SessionTimeoutBuilder::default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn snapshot(&self) -> &SessionSnapshot {
        &self.snapshot
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Issues found while merging the construction-time config.
    pub fn startup_issues(&self) -> &[ValidationIssue] {
        &self.startup_issues
    }

    pub fn is_leader(&self) -> bool {
        self.leader.as_ref().map(LeaderElection::is_leader).unwrap_or(false)
    }

    pub fn leader_id(&self) -> Option<&str> {
        self.leader.as_ref().and_then(LeaderElection::leader_id)
    }

    pub fn leader_epoch(&self) -> Option<u64> {
        self.leader.as_ref().map(LeaderElection::epoch)
    }

    pub fn shared_state(&self) -> Option<&SharedSessionState> {
        self.coordinator.latest()
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.coordinator.transport_kind()
    }

    pub fn is_storage_degraded(&self) -> bool {
        self.store.is_degraded()
    }

    /// Cadence the host should call [`SessionTimeout::tick`] at.
    pub fn poll_interval_ms(&self) -> u64 {
        self.config.poll_interval_ms
    }

    pub fn is_action_pending(&self, kind: ActionKind) -> bool {
        self.delays.is_pending(kind)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Observers
    // ─────────────────────────────────────────────────────────────────────────

    pub fn on_event(&mut self, f: impl FnMut(&SessionEvent) + Send + 'static) -> SubscriptionId {
        self.events.subscribe(f)
    }

    pub fn off_event(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn on_activity(&mut self, f: impl FnMut(&ActivityEvent) + Send + 'static) -> SubscriptionId {
        self.activity.subscribe(f)
    }

    pub fn off_activity(&mut self, id: SubscriptionId) -> bool {
        self.activity.unsubscribe(id)
    }

    pub fn on_cross_tab(
        &mut self,
        f: impl FnMut(&CrossTabMessage) + Send + 'static,
    ) -> SubscriptionId {
        self.cross_tab.subscribe(f)
    }

    pub fn off_cross_tab(&mut self, id: SubscriptionId) -> bool {
        self.cross_tab.unsubscribe(id)
    }

    /// Runs once per expiry, when the session first reaches EXPIRED.
    pub fn on_expire(&mut self, f: impl FnMut(&SessionSnapshot) + Send + 'static) -> SubscriptionId {
        self.expiry_hooks.subscribe(f)
    }

    pub fn off_expire(&mut self, id: SubscriptionId) -> bool {
        self.expiry_hooks.unsubscribe(id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Public operations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn start(&mut self) {
        self.dispatch(PendingAction::Start);
    }

    pub fn stop(&mut self) {
        self.dispatch(PendingAction::Stop);
    }

    pub fn reset_idle(&mut self, source: ActivitySource) {
        self.dispatch(PendingAction::Reset(source));
    }

    pub fn extend(&mut self) {
        self.dispatch(PendingAction::Extend);
    }

    pub fn pause(&mut self) {
        self.dispatch(PendingAction::Pause);
    }

    pub fn resume(&mut self) {
        self.dispatch(PendingAction::Resume);
    }

    pub fn expire_now(&mut self, reason: &str) {
        self.dispatch(PendingAction::Expire(reason.to_string()));
    }

    /// Merges `patch` into the live config. Invalid fields fall back to
    /// defaults and are returned (and carried on the `ConfigChanged` event).
    pub fn set_config(&mut self, patch: SessionConfigPatch) -> Vec<ValidationIssue> {
        if self.closed {
            return Vec::new();
        }
        self.change_config(patch, Origin::Local)
    }

    /// Activity signal from any source. Returns whether it reset the idle
    /// timer. Every signal is echoed on the activity stream.
    pub fn notify_activity(&mut self, source: ActivitySource, at: i64, meta: Option<Value>) -> bool {
        let accepted = self.accepts_activity(source, at);
        self.activity.notify(&ActivityEvent {
            source,
            at,
            meta,
            accepted,
        });
        if accepted {
            self.last_activity_reset_at = Some(at);
            self.reset_idle(source);
        }
        accepted
    }

    /// One scheduler step: inbound messages, leadership, due delayed
    /// actions, then time-driven transitions.
    pub fn tick(&mut self) {
        if self.closed {
            return;
        }
        self.pump();
        self.poll_leader();
        let now = self.now();
        for action in self.delays.take_due(now) {
            self.perform(action, Origin::Local);
        }
        let now = self.now();
        self.evaluate_now(now);
    }

    /// Drains and applies messages from peers.
    pub fn pump(&mut self) {
        if self.closed {
            return;
        }
        for message in self.coordinator.poll() {
            match message {
                Inbound::State(state) => self.receive_state(state),
                Inbound::SyncRequest {
                    source_id,
                    reason,
                    expect_reply,
                } => self.answer_sync(&source_id, &reason, expect_reply),
                Inbound::Delta(message) => self.receive_delta(message),
                Inbound::Leader { record, .. } => {
                    self.drive_leader(|election| election.observe(record))
                }
            }
        }
    }

    pub fn request_sync(&mut self, reason: &str) {
        if !self.closed {
            self.coordinator.request_sync(reason, true);
        }
    }

    /// Removes the canonical shared record. Peers keep their local view.
    pub fn clear_shared_state(&mut self) {
        tracing::info!(instance = %self.instance_id, "Clearing shared session state");
        self.coordinator.clear();
    }

    /// Aligns the clock with a server timestamp.
    pub fn sync_server_time(&mut self, server_now: i64) {
        let local = self.clock.now().saturating_sub(self.clock.offset());
        let offset = server_now.saturating_sub(local);
        self.clock.set_offset(offset);
        tracing::debug!(instance = %self.instance_id, offset_ms = offset, "Server time offset updated");
        if self.snapshot.paused && self.config.resume_behavior == ResumeBehavior::AutoOnServerSync {
            self.resume();
        }
    }

    pub fn reset_server_offset(&mut self) {
        self.clock.reset_offset();
    }

    /// Cancels delayed actions, releases leadership and closes the
    /// transport. Further calls are ignored.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.delays.cancel_all();
        if let Some(mut election) = self.leader.take() {
            let changes = election.step_down();
            for record in election.take_announcements() {
                self.coordinator.announce_leader(record);
            }
            self.handle_leadership(changes, election.epoch());
        }
        self.coordinator.close();
        self.closed = true;
        tracing::info!(instance = %self.instance_id, "Session timeout shut down");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Operation dispatch
    // ─────────────────────────────────────────────────────────────────────────

    fn dispatch(&mut self, action: PendingAction) {
        if self.closed {
            return;
        }
        let kind = action.kind();
        let delay = self.delay_for(kind);
        if delay == 0 {
            self.delays.cancel(kind);
            self.perform(action, Origin::Local);
            return;
        }
        let due_at = self.now().saturating_add(i64::try_from(delay).unwrap_or(i64::MAX));
        if self.delays.schedule(action, due_at) {
            tracing::debug!(instance = %self.instance_id, action = ?kind, "Replaced pending delayed action");
        }
    }

    fn delay_for(&self, kind: ActionKind) -> u64 {
        let delays = &self.config.action_delays;
        match kind {
            ActionKind::Start => delays.start,
            ActionKind::Stop => delays.stop,
            ActionKind::Reset => delays.reset,
            ActionKind::Extend => delays.extend,
            ActionKind::Expire => delays.expire,
            ActionKind::Pause => delays.pause,
            ActionKind::Resume => delays.resume,
        }
    }

    fn perform(&mut self, action: PendingAction, origin: Origin) {
        match action {
            PendingAction::Start => self.apply_start(origin),
            PendingAction::Stop => self.apply_stop(origin),
            PendingAction::Reset(source) => self.apply_reset(source, origin),
            PendingAction::Extend => self.apply_extend(origin),
            PendingAction::Expire(reason) => self.apply_expire(&reason, origin),
            PendingAction::Pause => self.apply_pause(origin),
            PendingAction::Resume => self.apply_resume(origin),
        }
    }

    fn apply_start(&mut self, origin: Origin) {
        let now = self.now();
        self.snapshot = SessionSnapshot {
            idle_start_at: Some(now),
            last_activity_at: self.snapshot.last_activity_at,
            ..SessionSnapshot::stopped(self.config.countdown_ms)
        };
        self.expiry_fired = false;
        self.last_activity_reset_at = None;
        self.emit(SessionEventKind::Started, EventDetail::None);
        self.commit(SharedOperation::Start, origin, None);
    }

    fn apply_stop(&mut self, origin: Origin) {
        let stopped = SessionSnapshot::stopped(self.config.countdown_ms);
        if self.snapshot == stopped {
            return;
        }
        self.snapshot = stopped;
        self.expiry_fired = false;
        self.emit(SessionEventKind::Stopped, EventDetail::None);
        self.commit(SharedOperation::Stop, origin, None);
    }

    fn apply_reset(&mut self, source: ActivitySource, origin: Origin) {
        if !self.snapshot.is_running() || self.snapshot.state == SessionState::Expired {
            tracing::debug!(instance = %self.instance_id, source = source.as_str(), "Ignoring reset outside a running session");
            return;
        }
        let payload = json!({ "source": source.as_str() });
        if origin == Origin::Local && self.is_follower() {
            // Followers do not mutate; the leader's record comes back.
            self.lamport.tick_clock();
            let message = self.delta_for(SharedOperation::Reset, Some(payload));
            self.coordinator.send_delta(message);
            return;
        }

        let now = self.now();
        let paused = self.snapshot.paused;
        self.snapshot = SessionSnapshot {
            state: SessionState::Idle,
            remaining_ms: self.config.countdown_ms,
            idle_start_at: Some(now),
            countdown_end_at: None,
            last_activity_at: Some(now),
            paused,
            paused_at: paused.then_some(now),
        };
        let kind = if source == ActivitySource::Router {
            SessionEventKind::ResetByRouter
        } else {
            SessionEventKind::ResetByActivity
        };
        self.emit(kind, EventDetail::Activity { source });
        self.commit(SharedOperation::Reset, origin, Some(payload));
    }

    fn apply_extend(&mut self, origin: Origin) {
        if self.snapshot.state == SessionState::Expired && !self.config.allow_manual_extend_when_expired {
            tracing::debug!(instance = %self.instance_id, "Ignoring extend on expired session");
            return;
        }
        let now = self.now();
        let countdown = i64::try_from(self.config.countdown_ms).unwrap_or(i64::MAX);
        let state = if self.config.warn_before_ms >= self.config.countdown_ms {
            SessionState::Warn
        } else {
            SessionState::Countdown
        };
        self.snapshot = SessionSnapshot {
            state,
            remaining_ms: self.config.countdown_ms,
            idle_start_at: self.snapshot.idle_start_at,
            countdown_end_at: Some(now.saturating_add(countdown)),
            last_activity_at: self.snapshot.last_activity_at,
            paused: false,
            paused_at: None,
        };
        self.expiry_fired = false;
        self.emit(SessionEventKind::Extended, EventDetail::None);
        self.commit(SharedOperation::Extend, origin, None);
    }

    fn apply_expire(&mut self, reason: &str, origin: Origin) {
        if self.snapshot.state == SessionState::Expired {
            return;
        }
        let now = self.now();
        self.snapshot = SessionSnapshot {
            state: SessionState::Expired,
            remaining_ms: 0,
            idle_start_at: self.snapshot.idle_start_at,
            countdown_end_at: Some(now),
            last_activity_at: self.snapshot.last_activity_at,
            paused: false,
            paused_at: None,
        };
        self.emit(
            SessionEventKind::Expired,
            EventDetail::Manual {
                reason: reason.to_string(),
            },
        );
        self.fire_expiry();
        self.commit(SharedOperation::Expire, origin, Some(json!({ "reason": reason })));
    }

    fn apply_pause(&mut self, origin: Origin) {
        if self.snapshot.paused || self.snapshot.state == SessionState::Expired {
            return;
        }
        let now = self.now();
        // Freeze the remaining time as of this instant.
        self.evaluate_now(now);
        if self.snapshot.state == SessionState::Expired {
            return;
        }
        self.snapshot.paused = true;
        self.snapshot.paused_at = Some(now);
        self.emit(SessionEventKind::Paused, EventDetail::None);
        self.commit(SharedOperation::Pause, origin, None);
    }

    fn apply_resume(&mut self, origin: Origin) {
        if !self.snapshot.paused {
            return;
        }
        let now = self.now();
        let span = self
            .snapshot
            .paused_at
            .map(|at| now.saturating_sub(at).max(0))
            .unwrap_or(0);
        self.snapshot.idle_start_at = self.snapshot.idle_start_at.map(|at| at.saturating_add(span));
        if self.snapshot.state.is_counting_down() {
            self.snapshot.countdown_end_at =
                self.snapshot.countdown_end_at.map(|at| at.saturating_add(span));
        }
        self.snapshot.paused = false;
        self.snapshot.paused_at = None;
        self.emit(SessionEventKind::Resumed, EventDetail::None);
        self.commit(SharedOperation::Resume, origin, None);
        self.evaluate_now(now);
    }

    fn change_config(&mut self, patch: SessionConfigPatch, origin: Origin) -> Vec<ValidationIssue> {
        let outcome = normalize_config(&self.config, &patch);
        for issue in &outcome.issues {
            tracing::warn!(field = %issue.field, message = %issue.message, "Config value rejected");
        }
        self.apply_config(outcome.config);
        self.last_activity_reset_at = None;
        self.persist_config();
        self.emit(
            SessionEventKind::ConfigChanged,
            EventDetail::Config {
                issues: outcome.issues.clone(),
            },
        );

        if !self.applying_shared {
            if !self.is_follower() {
                self.publish_config();
            } else if origin == Origin::Local {
                self.lamport.tick_clock();
                let payload = match serde_json::to_value(&patch) {
                    Ok(patch) => Some(json!({ "patch": patch })),
                    Err(err) => {
                        tracing::warn!(error = %err, "Failed to encode config patch for leader");
                        None
                    }
                };
                let message = self.delta_for(SharedOperation::Config, payload);
                self.coordinator.send_delta(message);
            }
        }
        outcome.issues
    }

    /// Installs a new config and rewires whatever depends on it: storage
    /// namespace, channel, leader election and heartbeat.
    fn apply_config(&mut self, config: SessionConfig) {
        let previous = std::mem::replace(&mut self.config, config);

        if previous.storage_key_prefix != self.config.storage_key_prefix {
            if let Some(mut election) = self.leader.take() {
                let changes = election.step_down();
                for record in election.take_announcements() {
                    self.coordinator.announce_leader(record);
                }
                self.handle_leadership(changes, election.epoch());
            }
            self.coordinator
                .reconnect(StorageKeys::new(&self.config.storage_key_prefix));
        }

        match self.config.sync_mode {
            SyncMode::Leader => match self.leader.as_mut() {
                Some(election) => {
                    if previous.leader_heartbeat_ms != self.config.leader_heartbeat_ms {
                        election.set_heartbeat(self.config.leader_heartbeat_ms);
                    }
                }
                None => {
                    self.leader = Some(self.new_election());
                    self.drive_leader(LeaderElection::configure);
                }
            },
            SyncMode::Distributed => {
                if let Some(mut election) = self.leader.take() {
                    let changes = election.step_down();
                    for record in election.take_announcements() {
                        self.coordinator.announce_leader(record);
                    }
                    self.handle_leadership(changes, election.epoch());
                }
            }
        }

        if previous.poll_interval_ms != self.config.poll_interval_ms {
            tracing::debug!(
                instance = %self.instance_id,
                poll_interval_ms = self.config.poll_interval_ms,
                "Tick cadence changed"
            );
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Time-driven transitions
    // ─────────────────────────────────────────────────────────────────────────

    fn evaluate_now(&mut self, now: i64) {
        let outcome = tick::evaluate(&self.snapshot, &self.config, now);
        let changed = outcome.changed_state();
        self.snapshot = outcome.snapshot;
        if !changed {
            return;
        }
        for state in outcome.entered {
            match state {
                SessionState::Countdown => {
                    self.emit(SessionEventKind::CountdownStarted, EventDetail::None)
                }
                SessionState::Warn => self.emit(SessionEventKind::WarnShown, EventDetail::None),
                SessionState::Expired => {
                    self.emit(SessionEventKind::Expired, EventDetail::Timeout);
                    self.fire_expiry();
                }
                SessionState::Idle => {}
            }
        }
        self.persist_snapshot();
    }

    fn accepts_activity(&self, source: ActivitySource, at: i64) -> bool {
        if self.closed || !self.snapshot.is_running() {
            return false;
        }
        if self.snapshot.state == SessionState::Expired {
            return false;
        }
        if self.snapshot.paused
            && self.config.ignore_user_activity_when_paused
            && source == ActivitySource::User
        {
            return false;
        }
        if let Some(last) = self.last_activity_reset_at {
            let cooldown = i64::try_from(self.config.activity_reset_cooldown_ms).unwrap_or(i64::MAX);
            if at.saturating_sub(last) < cooldown {
                return false;
            }
        }
        true
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Replication
    // ─────────────────────────────────────────────────────────────────────────

    fn is_follower(&self) -> bool {
        self.config.sync_mode == SyncMode::Leader && !self.is_leader()
    }

    /// Persists the local snapshot and either publishes the new canonical
    /// record or, on a leader-mode follower, forwards the operation.
    fn commit(&mut self, operation: SharedOperation, origin: Origin, payload: Option<Value>) {
        self.persist_snapshot();
        if self.applying_shared {
            return;
        }
        if !self.is_follower() {
            self.publish_snapshot(operation);
        } else if origin == Origin::Local {
            self.lamport.tick_clock();
            let message = self.delta_for(operation, payload);
            self.coordinator.send_delta(message);
        }
    }

    fn delta_for(&self, operation: SharedOperation, payload: Option<Value>) -> CrossTabMessage {
        let (kind, payload) = match operation {
            SharedOperation::Extend => (CrossTabKind::Extend, payload),
            SharedOperation::Expire => (CrossTabKind::Expire, payload),
            SharedOperation::Reset => (CrossTabKind::Reset, payload),
            other => {
                let mut body = payload.unwrap_or_else(|| json!({}));
                if let Some(obj) = body.as_object_mut() {
                    obj.insert("operation".to_string(), json!(other.as_str()));
                }
                (CrossTabKind::Sync, Some(body))
            }
        };
        CrossTabMessage::new(&self.instance_id, kind, self.now(), payload)
    }

    fn publish_snapshot(&mut self, operation: SharedOperation) {
        let (revision, logical_clock) = self.lamport.next_snapshot_write();
        let metadata = Metadata::new(revision, logical_clock, &self.instance_id, operation);
        let config = self.current_config_part();
        let state = self.shared_record(metadata, config);
        self.coordinator.publish_state(state, PublishOptions::default());
    }

    fn publish_config(&mut self) {
        let (revision, logical_clock) = self.lamport.next_config_write();
        let config = SharedConfig {
            config: self.config.clone(),
            revision,
            logical_clock,
            writer_id: self.instance_id.clone(),
        };
        let metadata = self.current_metadata();
        let state = self.shared_record(metadata, config);
        self.coordinator.publish_state(state, PublishOptions::default());
    }

    fn current_metadata(&self) -> Metadata {
        match self.coordinator.latest() {
            Some(latest) => latest.metadata.clone(),
            None => Metadata::new(
                self.lamport.revision,
                self.lamport.logical_clock,
                &self.instance_id,
                SharedOperation::Bootstrap,
            ),
        }
    }

    fn current_config_part(&self) -> SharedConfig {
        match self.coordinator.latest() {
            Some(latest) => latest.config.clone(),
            None => SharedConfig {
                config: self.config.clone(),
                revision: self.lamport.config_revision,
                logical_clock: self.lamport.config_clock,
                writer_id: self.instance_id.clone(),
            },
        }
    }

    fn shared_record(&self, metadata: Metadata, config: SharedConfig) -> SharedSessionState {
        SharedSessionState {
            version: SHARED_STATE_VERSION,
            updated_at: self.now(),
            sync_mode: self.config.sync_mode,
            leader: self.leader.as_ref().and_then(LeaderElection::leader_info),
            metadata,
            snapshot: self.snapshot.clone(),
            config,
        }
    }

    fn receive_state(&mut self, remote: SharedSessionState) {
        let ctx = AcceptContext {
            mode: self.config.sync_mode,
            is_leader: self.is_leader(),
            known_leader: self.leader_id(),
        };
        let decision = conflict::decide(self.coordinator.latest(), &remote, &ctx);
        self.lamport.observe(&remote);
        if decision.is_noop() {
            tracing::trace!(
                instance = %self.instance_id,
                writer = %remote.metadata.writer_id,
                revision = remote.metadata.revision,
                "Ignoring shared state"
            );
            return;
        }

        let mut merged = self
            .coordinator
            .latest()
            .cloned()
            .unwrap_or_else(|| remote.clone());
        if decision.snapshot {
            merged.updated_at = remote.updated_at;
            merged.sync_mode = remote.sync_mode;
            merged.leader = remote.leader.clone();
            merged.metadata = remote.metadata.clone();
            merged.snapshot = remote.snapshot.clone();
        }
        if decision.config {
            merged.config = remote.config.clone();
        }

        self.applying_shared = true;
        if decision.config {
            self.adopt_config(&remote);
        }
        if decision.snapshot {
            self.adopt_snapshot(&remote);
        }
        self.applying_shared = false;
        self.coordinator.remember(merged);
    }

    fn adopt_config(&mut self, remote: &SharedSessionState) {
        let outcome = sanitize_config(&remote.config.config);
        if outcome.config == self.config {
            return;
        }
        self.apply_config(outcome.config);
        self.last_activity_reset_at = None;
        self.persist_config();
        self.emit(
            SessionEventKind::ConfigChanged,
            EventDetail::Remote {
                writer_id: remote.config.writer_id.clone(),
            },
        );
    }

    fn adopt_snapshot(&mut self, remote: &SharedSessionState) {
        let previous = std::mem::replace(&mut self.snapshot, remote.snapshot.clone());
        let operation = remote.metadata.operation;
        let kind = match operation {
            SharedOperation::Start => Some(SessionEventKind::Started),
            SharedOperation::Stop => Some(SessionEventKind::Stopped),
            SharedOperation::Reset => Some(SessionEventKind::ResetByActivity),
            SharedOperation::Extend => Some(SessionEventKind::Extended),
            SharedOperation::Expire => Some(SessionEventKind::Expired),
            SharedOperation::Pause => Some(SessionEventKind::Paused),
            SharedOperation::Resume => Some(SessionEventKind::Resumed),
            SharedOperation::Bootstrap | SharedOperation::Sync | SharedOperation::Config => None,
        };
        if matches!(
            operation,
            SharedOperation::Start | SharedOperation::Stop | SharedOperation::Reset | SharedOperation::Extend
        ) {
            self.expiry_fired = false;
        }

        if previous != self.snapshot {
            let detail = || EventDetail::Remote {
                writer_id: remote.metadata.writer_id.clone(),
            };
            if let Some(kind) = kind {
                self.emit(kind, detail());
            }
            let newly_expired =
                self.snapshot.state == SessionState::Expired && previous.state != SessionState::Expired;
            if newly_expired {
                if kind != Some(SessionEventKind::Expired) {
                    self.emit(SessionEventKind::Expired, detail());
                }
                self.fire_expiry();
            }
        }
        self.persist_snapshot();
        let now = self.now();
        self.evaluate_now(now);
    }

    fn receive_delta(&mut self, message: CrossTabMessage) {
        self.cross_tab.notify(&message);
        if message.kind == CrossTabKind::SyncRequest {
            self.answer_sync(&message.source_id, "delta", true);
            return;
        }
        if !(self.config.sync_mode == SyncMode::Leader && self.is_leader()) {
            return;
        }
        let payload = message.payload.as_ref();
        let field = |name: &str| {
            payload
                .and_then(|p| p.get(name))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        tracing::debug!(
            instance = %self.instance_id,
            from = %message.source_id,
            kind = message.kind.as_str(),
            "Applying forwarded operation"
        );
        match message.kind {
            CrossTabKind::Reset => {
                let source = field("source")
                    .and_then(|s| ActivitySource::parse(&s))
                    .unwrap_or(ActivitySource::CrossTab);
                self.perform(PendingAction::Reset(source), Origin::Remote);
            }
            CrossTabKind::Extend => self.perform(PendingAction::Extend, Origin::Remote),
            CrossTabKind::Expire => {
                let reason = field("reason").unwrap_or_else(|| "remote".to_string());
                self.perform(PendingAction::Expire(reason), Origin::Remote);
            }
            CrossTabKind::Sync => match field("operation").as_deref() {
                Some("start") => self.perform(PendingAction::Start, Origin::Remote),
                Some("stop") => self.perform(PendingAction::Stop, Origin::Remote),
                Some("pause") => self.perform(PendingAction::Pause, Origin::Remote),
                Some("resume") => self.perform(PendingAction::Resume, Origin::Remote),
                Some("config") => {
                    let patch = payload
                        .and_then(|p| p.get("patch"))
                        .cloned()
                        .map(serde_json::from_value::<SessionConfigPatch>);
                    match patch {
                        Some(Ok(patch)) => {
                            self.change_config(patch, Origin::Remote);
                        }
                        Some(Err(err)) => {
                            tracing::warn!(error = %err, "Ignoring malformed forwarded config patch")
                        }
                        None => tracing::debug!("Forwarded config change without patch"),
                    }
                }
                other => {
                    tracing::debug!(operation = ?other, "Ignoring unknown forwarded operation")
                }
            },
            CrossTabKind::SyncRequest => {}
        }
    }

    fn answer_sync(&mut self, source_id: &str, reason: &str, expect_reply: bool) {
        let message = CrossTabMessage::new(
            source_id,
            CrossTabKind::SyncRequest,
            self.now(),
            Some(json!({ "reason": reason })),
        );
        self.cross_tab.notify(&message);
        if !expect_reply || self.is_follower() {
            return;
        }
        if self.coordinator.rebroadcast_latest() {
            return;
        }
        if self.snapshot.is_running() {
            self.publish_snapshot(SharedOperation::Bootstrap);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Leadership
    // ─────────────────────────────────────────────────────────────────────────

    fn new_election(&self) -> LeaderElection {
        let mut election = LeaderElection::new(
            &self.coordinator.keys().leader(),
            &self.instance_id,
            self.store.clone(),
            self.clock.clone(),
            self.config.leader_heartbeat_ms,
        );
        if let Some(leader) = self.coordinator.latest().and_then(|s| s.leader.as_ref()) {
            election.seed_epoch(leader.epoch);
        }
        election
    }

    fn poll_leader(&mut self) {
        self.drive_leader(LeaderElection::poll);
    }

    fn drive_leader(&mut self, f: impl FnOnce(&mut LeaderElection) -> Vec<LeadershipChange>) {
        let Some(election) = self.leader.as_mut() else {
            return;
        };
        let changes = f(election);
        let announcements = election.take_announcements();
        let epoch = election.epoch();
        for record in announcements {
            self.coordinator.announce_leader(record);
        }
        self.handle_leadership(changes, epoch);
    }

    fn handle_leadership(&mut self, changes: Vec<LeadershipChange>, epoch: u64) {
        for change in changes {
            match change {
                LeadershipChange::Elected { leader_id, epoch } => {
                    let is_self = leader_id == self.instance_id;
                    self.emit(
                        SessionEventKind::LeaderElected,
                        EventDetail::Leader { leader_id, epoch },
                    );
                    // A new leader republishes so followers converge on it.
                    if is_self && !self.applying_shared && !self.closed {
                        self.publish_snapshot(SharedOperation::Bootstrap);
                    }
                }
                LeadershipChange::Lost { previous_id } => self.emit(
                    SessionEventKind::LeaderLost,
                    EventDetail::Leader {
                        leader_id: previous_id,
                        epoch,
                    },
                ),
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────

    fn now(&self) -> i64 {
        self.clock.now()
    }

    fn emit(&mut self, kind: SessionEventKind, detail: EventDetail) {
        let event = SessionEvent {
            kind,
            at: self.now(),
            instance_id: self.instance_id.clone(),
            snapshot: self.snapshot.clone(),
            detail,
        };
        tracing::debug!(
            instance = %self.instance_id,
            event = kind.as_str(),
            state = %self.snapshot.state,
            remaining_ms = self.snapshot.remaining_ms,
            "Session event"
        );
        self.events.notify(&event);
    }

    fn fire_expiry(&mut self) {
        if self.expiry_fired {
            return;
        }
        self.expiry_fired = true;
        tracing::info!(instance = %self.instance_id, "Session expired");
        let snapshot = self.snapshot.clone();
        self.expiry_hooks.notify(&snapshot);
    }

    fn persist_snapshot(&self) {
        let persisted = PersistedSnapshot::new(self.now(), &self.instance_id, self.snapshot.clone());
        match serde_json::to_string(&persisted) {
            Ok(raw) => self.store.write(&self.coordinator.keys().snapshot(), &raw),
            Err(err) => tracing::warn!(error = %err, "Failed to encode snapshot"),
        }
    }

    fn persist_config(&self) {
        let persisted = PersistedConfig::new(self.now(), self.config.clone());
        match serde_json::to_string(&persisted) {
            Ok(raw) => self.store.write(&self.coordinator.keys().config(), &raw),
            Err(err) => tracing::warn!(error = %err, "Failed to encode config"),
        }
    }
}

impl Drop for SessionTimeout {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn read_persisted_config(store: &DurableStore, keys: &StorageKeys) -> Option<PersistedConfig> {
    let key = keys.config();
    let raw = store.read(&key)?;
    match parse_persisted_config(&raw) {
        Ok(config) => Some(config),
        Err(err) => {
            tracing::warn!(key = %key, error = %err, "Ignoring unreadable persisted config");
            None
        }
    }
}

fn read_persisted_snapshot(store: &DurableStore, keys: &StorageKeys) -> Option<PersistedSnapshot> {
    let key = keys.snapshot();
    let raw = store.read(&key)?;
    match parse_persisted_snapshot(&raw) {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
            tracing::warn!(key = %key, error = %err, "Ignoring unreadable persisted snapshot");
            None
        }
    }
}
