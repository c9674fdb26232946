//! Soft leader election over the shared store.
//!
//! A single record under the leader key names the current leader, its last
//! heartbeat and an epoch. The leader rewrites it every heartbeat; anyone may
//! claim once it is older than the TTL. There is no compare-and-set, so two
//! instances can briefly both believe they lead. The overlap resolves at the
//! next heartbeat: higher epoch wins, then the larger id.

use std::sync::mpsc::Receiver;
use std::sync::Arc;

use idlesync_protocol::{leader_ttl_ms, parse_leader_record, LeaderInfo, LeaderRecord};

use crate::clock::Clock;
use crate::storage::{DurableStore, StorageEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipChange {
    Elected { leader_id: String, epoch: u64 },
    Lost { previous_id: String },
}

pub struct LeaderElection {
    key: String,
    instance_id: String,
    store: Arc<DurableStore>,
    clock: Arc<dyn Clock>,
    heartbeat_ms: u64,
    role: Role,
    leader: Option<LeaderRecord>,
    epoch: u64,
    last_heartbeat_at: Option<i64>,
    watch: Option<Receiver<StorageEvent>>,
    announcements: Vec<Option<LeaderRecord>>,
}

impl LeaderElection {
    pub fn new(
        key: &str,
        instance_id: &str,
        store: Arc<DurableStore>,
        clock: Arc<dyn Clock>,
        heartbeat_ms: u64,
    ) -> Self {
        let watch = store.watch();
        LeaderElection {
            key: key.to_string(),
            instance_id: instance_id.to_string(),
            store,
            clock,
            heartbeat_ms: heartbeat_ms.max(1),
            role: Role::Follower,
            leader: None,
            epoch: 0,
            last_heartbeat_at: None,
            watch,
            announcements: Vec::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn leader_id(&self) -> Option<&str> {
        self.leader.as_ref().map(|record| record.id.as_str())
    }

    pub fn leader_info(&self) -> Option<LeaderInfo> {
        self.leader.as_ref().map(LeaderRecord::info)
    }

    /// Highest epoch this instance has seen. Never decreases.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn ttl_ms(&self) -> u64 {
        leader_ttl_ms(self.heartbeat_ms)
    }

    /// Raises the known epoch, e.g. from a persisted shared record, so a
    /// claim after the leader record was cleared still moves forward.
    pub fn seed_epoch(&mut self, epoch: u64) {
        self.epoch = self.epoch.max(epoch);
    }

    pub fn set_heartbeat(&mut self, heartbeat_ms: u64) {
        self.heartbeat_ms = heartbeat_ms.max(1);
    }

    /// Records written by this instance that peers should hear about. `None`
    /// announces a step-down.
    pub fn take_announcements(&mut self) -> Vec<Option<LeaderRecord>> {
        std::mem::take(&mut self.announcements)
    }

    /// Reads the current record and claims or follows.
    pub fn configure(&mut self) -> Vec<LeadershipChange> {
        let now = self.clock.now();
        let current = self.read_record();
        match current {
            Some(record) if !self.is_stale(&record, now) => {
                if record.id == self.instance_id {
                    self.resume_hold(record, now)
                } else {
                    self.follow(record)
                }
            }
            other => self.claim(other.as_ref(), now),
        }
    }

    pub fn poll(&mut self) -> Vec<LeadershipChange> {
        let mut changes = Vec::new();

        let events: Vec<StorageEvent> = match self.watch.as_ref() {
            Some(watch) => watch.try_iter().filter(|e| e.key == self.key).collect(),
            None => Vec::new(),
        };
        for event in events {
            let record = event.new_value.as_deref().and_then(|raw| self.parse(raw));
            changes.extend(self.observe(record));
        }

        let now = self.clock.now();
        let current = self.read_record();
        match self.role {
            Role::Leader => {
                let due = self
                    .last_heartbeat_at
                    .map(|at| now.saturating_sub(at) >= as_ms(self.heartbeat_ms))
                    .unwrap_or(true);
                if due {
                    changes.extend(self.heartbeat(current, now));
                }
            }
            Role::Follower => match current {
                Some(record) if !self.is_stale(&record, now) => {
                    if record.id != self.instance_id {
                        changes.extend(self.follow(record));
                    }
                }
                other => changes.extend(self.claim(other.as_ref(), now)),
            },
        }
        changes
    }

    /// Applies a record heard from a peer. `None` means the peer stepped
    /// down, which lets a follower claim without waiting for the TTL.
    pub fn observe(&mut self, record: Option<LeaderRecord>) -> Vec<LeadershipChange> {
        let now = self.clock.now();
        match record {
            None => {
                if self.role == Role::Follower {
                    let current = self.read_record();
                    match current {
                        Some(record) if !self.is_stale(&record, now) && record.id != self.instance_id => {
                            self.follow(record)
                        }
                        other => self.claim(other.as_ref(), now),
                    }
                } else {
                    Vec::new()
                }
            }
            Some(record) if record.id == self.instance_id => Vec::new(),
            Some(record) => {
                if self.is_stale(&record, now) {
                    self.epoch = self.epoch.max(record.epoch);
                    return Vec::new();
                }
                match self.role {
                    Role::Leader if self.outranked_by(&record) => self.follow(record),
                    Role::Leader => Vec::new(),
                    Role::Follower => {
                        let known_epoch = self.leader.as_ref().map(|r| r.epoch).unwrap_or(0);
                        if record.epoch >= known_epoch {
                            self.follow(record)
                        } else {
                            self.epoch = self.epoch.max(record.epoch);
                            Vec::new()
                        }
                    }
                }
            }
        }
    }

    /// Releases leadership if this instance holds the record.
    pub fn step_down(&mut self) -> Vec<LeadershipChange> {
        if self.role != Role::Leader {
            return Vec::new();
        }
        if let Some(record) = self.read_record() {
            if record.id == self.instance_id {
                self.store.remove(&self.key);
            }
        }
        tracing::info!(instance = %self.instance_id, epoch = self.epoch, "Stepping down as leader");
        self.role = Role::Follower;
        self.leader = None;
        self.last_heartbeat_at = None;
        self.announcements.push(None);
        vec![LeadershipChange::Lost {
            previous_id: self.instance_id.clone(),
        }]
    }

    fn heartbeat(&mut self, current: Option<LeaderRecord>, now: i64) -> Vec<LeadershipChange> {
        if let Some(record) = current {
            if record.id != self.instance_id
                && !self.is_stale(&record, now)
                && self.outranked_by(&record)
            {
                return self.follow(record);
            }
        }
        let record = LeaderRecord::new(&self.instance_id, now, self.epoch);
        self.write_record(&record);
        self.leader = Some(record);
        self.last_heartbeat_at = Some(now);
        Vec::new()
    }

    fn claim(&mut self, current: Option<&LeaderRecord>, now: i64) -> Vec<LeadershipChange> {
        let observed = current.map(|record| record.epoch).unwrap_or(0);
        self.epoch = self.epoch.max(observed).saturating_add(1);
        let record = LeaderRecord::new(&self.instance_id, now, self.epoch);
        self.write_record(&record);
        self.announcements.push(Some(record.clone()));
        self.last_heartbeat_at = Some(now);

        let was_leader = self.role == Role::Leader;
        self.role = Role::Leader;
        self.leader = Some(record);
        tracing::info!(instance = %self.instance_id, epoch = self.epoch, "Claimed leadership");
        if was_leader {
            Vec::new()
        } else {
            vec![LeadershipChange::Elected {
                leader_id: self.instance_id.clone(),
                epoch: self.epoch,
            }]
        }
    }

    fn resume_hold(&mut self, record: LeaderRecord, now: i64) -> Vec<LeadershipChange> {
        self.epoch = self.epoch.max(record.epoch);
        let refreshed = LeaderRecord::new(&self.instance_id, now, self.epoch);
        self.write_record(&refreshed);
        self.leader = Some(refreshed);
        self.last_heartbeat_at = Some(now);
        if self.role == Role::Leader {
            return Vec::new();
        }
        self.role = Role::Leader;
        vec![LeadershipChange::Elected {
            leader_id: self.instance_id.clone(),
            epoch: self.epoch,
        }]
    }

    fn follow(&mut self, record: LeaderRecord) -> Vec<LeadershipChange> {
        self.epoch = self.epoch.max(record.epoch);
        let mut changes = Vec::new();
        if self.role == Role::Leader {
            tracing::info!(instance = %self.instance_id, leader = %record.id, "Yielding leadership");
            self.role = Role::Follower;
            self.last_heartbeat_at = None;
            changes.push(LeadershipChange::Lost {
                previous_id: self.instance_id.clone(),
            });
        }
        let leader_changed = self.leader_id() != Some(record.id.as_str());
        if leader_changed {
            tracing::debug!(instance = %self.instance_id, leader = %record.id, epoch = record.epoch, "Following leader");
            changes.push(LeadershipChange::Elected {
                leader_id: record.id.clone(),
                epoch: record.epoch,
            });
        }
        self.leader = Some(record);
        changes
    }

    fn outranked_by(&self, record: &LeaderRecord) -> bool {
        (record.epoch, record.id.as_str()) > (self.epoch, self.instance_id.as_str())
    }

    /// A record dated further in the future than one TTL is as untrustworthy
    /// as an old one.
    fn is_stale(&self, record: &LeaderRecord, now: i64) -> bool {
        now.saturating_sub(record.updated_at).saturating_abs() >= as_ms(self.ttl_ms())
    }

    fn read_record(&self) -> Option<LeaderRecord> {
        let raw = self.store.read(&self.key)?;
        self.parse(&raw)
    }

    fn parse(&self, raw: &str) -> Option<LeaderRecord> {
        match parse_leader_record(raw) {
            Ok(record) => Some(record),
            Err(err) => {
                tracing::warn!(key = %self.key, error = %err, "Ignoring malformed leader record");
                None
            }
        }
    }

    fn write_record(&self, record: &LeaderRecord) {
        match serde_json::to_string(record) {
            Ok(raw) => self.store.write(&self.key, &raw),
            Err(err) => tracing::warn!(error = %err, "Failed to encode leader record"),
        }
    }
}

fn as_ms(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::{MemoryBackend, StorageBackend};

    struct Fixture {
        clock: Arc<ManualClock>,
        backend: Arc<dyn StorageBackend>,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                clock: Arc::new(ManualClock::new(1_000)),
                backend: Arc::new(MemoryBackend::new()),
            }
        }

        fn election(&self, id: &str) -> LeaderElection {
            let store = Arc::new(DurableStore::new(self.backend.clone(), id));
            LeaderElection::new("p:leader", id, store, self.clock.clone(), 100)
        }
    }

    #[test]
    fn first_instance_claims_epoch_one() {
        let fx = Fixture::new();
        let mut a = fx.election("a");
        let changes = a.configure();
        assert!(a.is_leader());
        assert_eq!(a.epoch(), 1);
        assert_eq!(
            changes,
            vec![LeadershipChange::Elected {
                leader_id: "a".to_string(),
                epoch: 1
            }]
        );
        assert_eq!(a.take_announcements().len(), 1);
    }

    #[test]
    fn second_instance_follows_fresh_leader() {
        let fx = Fixture::new();
        let mut a = fx.election("a");
        let mut b = fx.election("b");
        a.configure();
        b.configure();
        assert!(!b.is_leader());
        assert_eq!(b.leader_id(), Some("a"));
        assert_eq!(b.epoch(), 1);
    }

    #[test]
    fn follower_claims_after_ttl_with_higher_epoch() {
        let fx = Fixture::new();
        let mut a = fx.election("a");
        let mut b = fx.election("b");
        a.configure();
        b.configure();

        // a stops heartbeating.
        fx.clock.advance(299);
        assert!(b.poll().is_empty());
        fx.clock.advance(1);
        let changes = b.poll();
        assert!(b.is_leader());
        assert_eq!(b.epoch(), 2);
        assert!(changes.contains(&LeadershipChange::Elected {
            leader_id: "b".to_string(),
            epoch: 2
        }));

        // a wakes up, sees the higher epoch and yields.
        let changes = a.poll();
        assert!(!a.is_leader());
        assert_eq!(changes[0], LeadershipChange::Lost { previous_id: "a".to_string() });
    }

    #[test]
    fn heartbeat_keeps_record_fresh() {
        let fx = Fixture::new();
        let mut a = fx.election("a");
        let mut b = fx.election("b");
        a.configure();
        b.configure();
        for _ in 0..10 {
            fx.clock.advance(100);
            a.poll();
            b.poll();
        }
        assert!(a.is_leader());
        assert!(!b.is_leader());
        assert_eq!(a.epoch(), 1);
    }

    #[test]
    fn step_down_lets_follower_claim_immediately() {
        let fx = Fixture::new();
        let mut a = fx.election("a");
        let mut b = fx.election("b");
        a.configure();
        b.configure();

        let lost = a.step_down();
        assert_eq!(lost, vec![LeadershipChange::Lost { previous_id: "a".to_string() }]);
        assert_eq!(a.take_announcements().pop(), Some(None));

        b.poll();
        assert!(b.is_leader());
        assert_eq!(b.epoch(), 2);
    }

    #[test]
    fn concurrent_claims_converge() {
        let fx = Fixture::new();
        let mut a = fx.election("a");
        let mut b = fx.election("b");
        // Both read an empty record before either writes.
        a.claim(None, fx.clock.now());
        b.claim(None, fx.clock.now());
        assert!(a.is_leader() && b.is_leader());

        fx.clock.advance(100);
        a.poll();
        b.poll();
        fx.clock.advance(100);
        a.poll();
        b.poll();
        assert!(b.is_leader());
        assert!(!a.is_leader());
    }

    #[test]
    fn epoch_never_decreases_on_observe() {
        let fx = Fixture::new();
        let mut a = fx.election("a");
        a.observe(Some(LeaderRecord::new("z", fx.clock.now(), 7)));
        assert_eq!(a.epoch(), 7);
        a.observe(Some(LeaderRecord::new("y", fx.clock.now(), 3)));
        assert_eq!(a.epoch(), 7);
        assert_eq!(a.leader_id(), Some("z"));
    }

    #[test]
    fn malformed_record_is_treated_as_absent() {
        let fx = Fixture::new();
        fx.backend.write("p:leader", "{broken", "x").unwrap();
        let mut a = fx.election("a");
        a.configure();
        assert!(a.is_leader());
    }

    #[test]
    fn record_with_extreme_timestamp_is_stale() {
        let fx = Fixture::new();
        fx.backend
            .write(
                "p:leader",
                r#"{"version":1,"id":"zz","updatedAt":-9223372036854775808,"epoch":1}"#,
                "x",
            )
            .unwrap();
        let mut a = fx.election("a");
        a.configure();
        assert!(a.is_leader());
        assert_eq!(a.epoch(), 2);

        fx.backend
            .write(
                "p:leader",
                r#"{"version":1,"id":"zz","updatedAt":9223372036854775807,"epoch":5}"#,
                "x",
            )
            .unwrap();
        let mut b = fx.election("b");
        b.configure();
        assert!(b.is_leader());
        assert_eq!(b.epoch(), 6);
    }

    #[test]
    fn maximal_epoch_saturates_on_claim() {
        let fx = Fixture::new();
        fx.backend
            .write(
                "p:leader",
                &format!(r#"{{"version":1,"id":"zz","updatedAt":0,"epoch":{}}}"#, u64::MAX),
                "x",
            )
            .unwrap();
        let mut a = fx.election("a");
        a.configure();
        assert!(a.is_leader());
        assert_eq!(a.epoch(), u64::MAX);
    }

    #[test]
    fn huge_heartbeat_does_not_overflow() {
        let fx = Fixture::new();
        let store = Arc::new(DurableStore::new(fx.backend.clone(), "a"));
        let mut a = LeaderElection::new("p:leader", "a", store, fx.clock.clone(), u64::MAX);
        assert_eq!(a.ttl_ms(), u64::MAX);
        a.configure();
        fx.clock.advance(10_000);
        a.poll();
        assert!(a.is_leader());

        let store = Arc::new(DurableStore::new(fx.backend.clone(), "b"));
        let mut b = LeaderElection::new("p:leader", "b", store, fx.clock.clone(), u64::MAX);
        b.configure();
        assert!(!b.is_leader());
        assert_eq!(b.leader_id(), Some("a"));
    }
}
