mod common;

use std::sync::Arc;

use common::{count_expiries, fast_config, Cluster};
use idlesync_core::protocol::{SessionConfigPatch, SessionState, SharedOperation, SyncMode};
use idlesync_core::{
    BroadcastHub, FileBackend, ManualClock, MemoryBackend, SessionTimeout, StorageBackend,
    TransportKind,
};
use tempfile::tempdir;

fn on_disk(clock: &Arc<ManualClock>, dir: &std::path::Path, id: &str) -> SessionTimeout {
    SessionTimeout::builder()
        .clock(clock.clone())
        .backend(Arc::new(FileBackend::new(dir)))
        .config(fast_config(SyncMode::Leader))
        .instance_id(id)
        .build()
}

#[test]
fn reload_resumes_countdown_from_disk() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(0));

    let mut first = on_disk(&clock, dir.path(), "tab-a");
    // No storage events on disk, so nothing to carry messages.
    assert_eq!(first.transport_kind(), TransportKind::Noop);
    assert_eq!(first.leader_epoch(), Some(1));
    first.start();
    clock.set(500);
    first.tick();
    assert_eq!(first.snapshot().state, SessionState::Countdown);
    drop(first);

    clock.set(700);
    let mut second = on_disk(&clock, dir.path(), "tab-b");
    second.tick();
    assert_eq!(second.snapshot().state, SessionState::Countdown);
    assert_eq!(second.snapshot().countdown_end_at, Some(1_200));
    assert_eq!(second.snapshot().remaining_ms, 500);
    // The shared record remembers the previous epoch after step-down.
    assert!(second.is_leader());
    assert_eq!(second.leader_epoch(), Some(2));
}

#[test]
fn reload_after_long_absence_expires_once() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(0));

    let mut first = on_disk(&clock, dir.path(), "tab-a");
    first.start();
    clock.set(300);
    first.tick();
    drop(first);

    clock.set(60_000);
    let mut second = on_disk(&clock, dir.path(), "tab-b");
    assert!(second.snapshot().is_running());
    let expiries = count_expiries(&mut second);
    second.tick();
    assert_eq!(second.snapshot().state, SessionState::Expired);
    assert_eq!(second.snapshot().remaining_ms, 0);
    second.tick();
    assert_eq!(*expiries.lock().unwrap(), 1);
}

#[test]
fn restored_expired_session_does_not_rerun_hooks() {
    let cluster = Cluster::new(SyncMode::Distributed, true);
    let mut first = cluster.spawn("tab-a");
    first.start();
    first.expire_now("logout");
    drop(first);

    cluster.clock.advance(1_000);
    let mut second = cluster.spawn("tab-b");
    assert_eq!(second.snapshot().state, SessionState::Expired);
    let expiries = count_expiries(&mut second);
    second.tick();
    assert_eq!(*expiries.lock().unwrap(), 0);

    second.start();
    assert_eq!(second.snapshot().state, SessionState::Idle);
}

#[test]
fn persisted_config_survives_reload() {
    let cluster = Cluster::new(SyncMode::Distributed, false);
    let mut first = cluster.spawn("tab-a");
    first.set_config(SessionConfigPatch {
        warn_before_ms: Some(700),
        ..Default::default()
    });
    drop(first);

    let second = cluster.spawn("tab-b");
    assert_eq!(second.config().warn_before_ms, 700);
    assert_eq!(second.config().countdown_ms, 1_000);
}

#[test]
fn legacy_shared_state_is_migrated_and_outranked() {
    let clock = Arc::new(ManualClock::new(5_000));
    let backend = Arc::new(MemoryBackend::new());
    backend
        .write(
            "idlesync:shared-state",
            r#"{
                "version": 1,
                "updatedAt": 5000,
                "writerId": "old-tab",
                "snapshot": {
                    "state": "IDLE",
                    "remainingMs": 1000,
                    "idleStartAt": 4900,
                    "countdownEndAt": null,
                    "lastActivityAt": 4900,
                    "paused": false
                }
            }"#,
            "legacy-writer",
        )
        .unwrap();

    let dyn_backend: Arc<dyn StorageBackend> = backend.clone();
    let mut session = SessionTimeout::builder()
        .clock(clock.clone())
        .backend(dyn_backend)
        .config(fast_config(SyncMode::Distributed))
        .instance_id("tab-a")
        .build();

    assert_eq!(session.snapshot().idle_start_at, Some(4_900));
    let shared = session.shared_state().cloned().unwrap();
    assert_eq!(shared.metadata.revision, 0);
    assert_eq!(shared.metadata.writer_id, "old-tab");

    session.start();
    let shared = session.shared_state().cloned().unwrap();
    assert_eq!(shared.metadata.revision, 1);
    assert_eq!(shared.metadata.logical_clock, 5_001);
    assert_eq!(shared.metadata.operation, SharedOperation::Start);
    assert_eq!(shared.version, 3);
}

#[test]
fn corrupt_snapshot_is_ignored() {
    let cluster = Cluster::new(SyncMode::Distributed, false);
    cluster
        .backend
        .write("idlesync:snapshot", "{\"version\":1,\"snapshot\":", "other")
        .unwrap();
    let session = cluster.spawn("tab-a");
    assert!(!session.snapshot().is_running());
    assert_eq!(session.snapshot().state, SessionState::Idle);
}

#[test]
fn disabled_storage_degrades_to_memory() {
    let cluster = Cluster::new(SyncMode::Distributed, true);
    cluster.backend.set_disabled(true);
    let mut a = cluster.spawn("tab-a");
    let mut b = cluster.spawn("tab-b");
    assert_eq!(a.transport_kind(), TransportKind::Broadcast);

    a.start();
    assert!(a.is_storage_degraded());
    assert!(a.snapshot().is_running());

    cluster.step(250, &mut [&mut a, &mut b]);
    assert_eq!(a.snapshot().state, SessionState::Countdown);
    assert_eq!(a.snapshot(), b.snapshot());
}

#[test]
fn quota_exceeded_keeps_session_running() {
    let clock = Arc::new(ManualClock::new(0));
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::with_quota(64));
    let mut session = SessionTimeout::builder()
        .clock(clock.clone())
        .backend(backend)
        .broadcast_hub(BroadcastHub::new())
        .config(fast_config(SyncMode::Distributed))
        .instance_id("tab-a")
        .build();

    session.start();
    assert!(session.is_storage_degraded());
    clock.set(1_200);
    session.tick();
    assert_eq!(session.snapshot().state, SessionState::Expired);
}

#[test]
fn leader_record_dated_far_in_the_future_is_replaced() {
    let cluster = Cluster::new(SyncMode::Leader, false);
    cluster
        .backend
        .write(
            "idlesync:leader",
            r#"{"version":1,"id":"ghost","updatedAt":9223372036854775807,"epoch":3}"#,
            "other",
        )
        .unwrap();

    let mut session = cluster.spawn("tab-a");
    assert!(session.is_leader());
    assert_eq!(session.leader_epoch(), Some(4));

    session.start();
    cluster.clock.advance(100);
    session.tick();
    assert!(session.is_leader());
}

#[test]
fn shared_state_with_extreme_timestamps_does_not_crash() {
    let cluster = Cluster::new(SyncMode::Distributed, false);
    cluster
        .backend
        .write(
            "idlesync:shared-state",
            r#"{
                "version": 1,
                "updatedAt": 9223372036854775807,
                "writerId": "far-future",
                "snapshot": {
                    "state": "IDLE",
                    "remainingMs": 1000,
                    "idleStartAt": -9223372036854775808,
                    "countdownEndAt": null,
                    "lastActivityAt": -9223372036854775808,
                    "paused": false
                }
            }"#,
            "other",
        )
        .unwrap();

    let mut session = cluster.spawn("tab-a");
    session.tick();
    assert_eq!(session.snapshot().state, SessionState::Expired);

    session.start();
    assert_eq!(session.snapshot().state, SessionState::Idle);
    assert_eq!(session.snapshot().idle_start_at, Some(0));
    let shared = session.shared_state().cloned().unwrap();
    assert_eq!(shared.metadata.revision, 1);
    assert_eq!(shared.metadata.logical_clock, i64::MAX as u64 + 1);
}

#[test]
fn persisted_config_with_overflowing_heartbeat_is_repaired() {
    let clock = Arc::new(ManualClock::new(0));
    let backend = Arc::new(MemoryBackend::new());
    backend
        .write(
            "idlesync:config",
            r#"{"version":1,"savedAt":0,"config":{"idleGraceMs":200,"leaderHeartbeatMs":18446744073709551615}}"#,
            "other",
        )
        .unwrap();

    let dyn_backend: Arc<dyn StorageBackend> = backend.clone();
    let mut session = SessionTimeout::builder()
        .clock(clock.clone())
        .backend(dyn_backend)
        .config(SessionConfigPatch {
            sync_mode: Some(SyncMode::Leader),
            ..Default::default()
        })
        .instance_id("tab-a")
        .build();

    assert_eq!(session.config().idle_grace_ms, 200);
    assert_eq!(session.config().leader_heartbeat_ms, 2_000);
    assert!(session.is_leader());

    session.start();
    clock.set(200);
    session.tick();
    assert_eq!(session.snapshot().state, SessionState::Countdown);
}
