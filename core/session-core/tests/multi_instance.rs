mod common;

use std::sync::Arc;

use common::{count_expiries, fast_config, record_events, Cluster};
use idlesync_core::protocol::{SessionConfigPatch, SessionState, SyncMode};
use idlesync_core::{
    ActivitySource, SessionEventKind, SessionTimeout, StorageBackend, TransportKind,
};

#[test]
fn follower_adopts_leader_state_and_forwards_resets() {
    let cluster = Cluster::new(SyncMode::Leader, true);
    let mut a = cluster.spawn("tab-a");
    let mut b = cluster.spawn("tab-b");
    assert!(a.is_leader());
    assert!(!b.is_leader());
    assert_eq!(b.leader_id(), Some("tab-a"));

    a.start();
    cluster.step(50, &mut [&mut a, &mut b]);
    assert!(b.snapshot().is_running());
    assert_eq!(a.snapshot(), b.snapshot());

    cluster.step(200, &mut [&mut a, &mut b]);
    assert_eq!(a.snapshot().state, SessionState::Countdown);
    assert_eq!(a.snapshot(), b.snapshot());

    // Follower resets are forwarded, not applied locally.
    b.reset_idle(ActivitySource::User);
    assert_eq!(b.snapshot().state, SessionState::Countdown);

    cluster.step(50, &mut [&mut a, &mut b]);
    assert_eq!(a.snapshot().state, SessionState::Idle);
    assert_eq!(a.snapshot().idle_start_at, Some(300));
    assert_eq!(a.snapshot(), b.snapshot());
    assert_eq!(
        a.shared_state().map(|s| s.metadata.triplet()),
        b.shared_state().map(|s| s.metadata.triplet())
    );
}

#[test]
fn follower_extend_is_applied_optimistically_then_confirmed() {
    let cluster = Cluster::new(SyncMode::Leader, true);
    let mut a = cluster.spawn("tab-a");
    let mut b = cluster.spawn("tab-b");
    a.start();
    cluster.step(1_000, &mut [&mut a, &mut b]);
    assert_eq!(b.snapshot().state, SessionState::Warn);

    b.extend();
    assert_eq!(b.snapshot().state, SessionState::Countdown);
    assert_eq!(b.snapshot().countdown_end_at, Some(2_000));

    cluster.step(10, &mut [&mut a, &mut b]);
    assert_eq!(a.snapshot().state, SessionState::Countdown);
    assert_eq!(a.snapshot().countdown_end_at, Some(2_010));
    assert_eq!(a.snapshot(), b.snapshot());
}

#[test]
fn instances_expire_together_and_each_runs_hooks_once() {
    let cluster = Cluster::new(SyncMode::Leader, true);
    let mut a = cluster.spawn("tab-a");
    let mut b = cluster.spawn("tab-b");
    let a_hooks = count_expiries(&mut a);
    let b_hooks = count_expiries(&mut b);
    a.start();
    for _ in 0..30 {
        cluster.step(50, &mut [&mut a, &mut b]);
    }
    assert_eq!(a.snapshot().state, SessionState::Expired);
    assert_eq!(b.snapshot().state, SessionState::Expired);
    assert_eq!(*a_hooks.lock().unwrap(), 1);
    assert_eq!(*b_hooks.lock().unwrap(), 1);
}

#[test]
fn follower_takes_over_when_leader_goes_silent() {
    let cluster = Cluster::new(SyncMode::Leader, true);
    let mut a = cluster.spawn("tab-a");
    let mut b = cluster.spawn("tab-b");
    let b_events = record_events(&mut b);
    a.start();
    cluster.step(50, &mut [&mut a, &mut b]);
    assert_eq!(a.leader_epoch(), Some(1));

    // tab-a stops ticking (frozen or backgrounded); its record goes stale.
    for _ in 0..4 {
        cluster.step(100, &mut [&mut b]);
    }
    assert!(b.is_leader());
    assert_eq!(b.leader_epoch(), Some(2));
    assert!(b_events
        .lock()
        .unwrap()
        .contains(&SessionEventKind::LeaderElected));

    // tab-a wakes up, sees the newer epoch and follows.
    let a_events = record_events(&mut a);
    cluster.step(10, &mut [&mut a, &mut b]);
    assert!(!a.is_leader());
    assert_eq!(a.leader_id(), Some("tab-b"));
    assert_eq!(a.leader_epoch(), Some(2));
    assert!(a_events.lock().unwrap().contains(&SessionEventKind::LeaderLost));
    assert_eq!(a.snapshot(), b.snapshot());
}

#[test]
fn shutdown_hands_leadership_over_immediately() {
    let cluster = Cluster::new(SyncMode::Leader, true);
    let mut a = cluster.spawn("tab-a");
    let mut b = cluster.spawn("tab-b");
    let mut c = cluster.spawn("tab-c");
    a.start();
    cluster.step(50, &mut [&mut a, &mut b, &mut c]);

    a.shutdown();
    cluster.step(1, &mut [&mut b, &mut c]);
    cluster.step(100, &mut [&mut b, &mut c]);

    let leaders = [b.is_leader(), c.is_leader()];
    assert_eq!(leaders.iter().filter(|l| **l).count(), 1);
    assert_eq!(b.leader_id(), c.leader_id());
    assert_eq!(b.leader_epoch(), Some(2));
    assert_eq!(c.leader_epoch(), Some(2));
}

#[test]
fn epochs_never_decrease_across_failovers() {
    let cluster = Cluster::new(SyncMode::Leader, true);
    let mut a = cluster.spawn("tab-a");
    let mut b = cluster.spawn("tab-b");
    let mut last = 0;
    for round in 0..3 {
        // Alternate which tab is silent.
        for _ in 0..4 {
            if round % 2 == 0 {
                cluster.step(100, &mut [&mut b]);
            } else {
                cluster.step(100, &mut [&mut a]);
            }
        }
        cluster.step(10, &mut [&mut a, &mut b]);
        for epoch in [a.leader_epoch(), b.leader_epoch()] {
            let epoch = epoch.unwrap_or(0);
            assert!(epoch >= last);
        }
        last = a.leader_epoch().unwrap_or(0).max(b.leader_epoch().unwrap_or(0));
        assert_eq!(a.leader_id(), b.leader_id());
    }
    assert!(last >= 3);
}

#[test]
fn distributed_conflict_resolves_to_the_same_winner() {
    let cluster = Cluster::new(SyncMode::Distributed, true);
    let mut a = cluster.spawn("tab-a");
    let mut b = cluster.spawn("tab-b");
    let a_hooks = count_expiries(&mut a);
    a.start();
    cluster.step(10, &mut [&mut a, &mut b]);
    assert!(b.snapshot().is_running());

    // Concurrent writes from the same revision: equal revision and clock,
    // so the larger writer id wins everywhere.
    a.extend();
    b.expire_now("signed out elsewhere");
    cluster.step(10, &mut [&mut a, &mut b]);

    assert_eq!(a.snapshot().state, SessionState::Expired);
    assert_eq!(b.snapshot().state, SessionState::Expired);
    assert_eq!(
        a.shared_state().map(|s| s.metadata.writer_id.clone()),
        Some("tab-b".to_string())
    );
    assert_eq!(
        a.shared_state().map(|s| s.metadata.triplet()),
        b.shared_state().map(|s| s.metadata.triplet())
    );
    assert_eq!(*a_hooks.lock().unwrap(), 1);
}

#[test]
fn distributed_later_revision_wins() {
    let cluster = Cluster::new(SyncMode::Distributed, true);
    let mut a = cluster.spawn("tab-a");
    let mut b = cluster.spawn("tab-b");
    a.start();
    cluster.step(10, &mut [&mut a, &mut b]);
    b.extend();
    cluster.step(10, &mut [&mut a, &mut b]);
    a.stop();
    cluster.step(10, &mut [&mut a, &mut b]);

    assert!(!a.snapshot().is_running());
    assert!(!b.snapshot().is_running());
    assert_eq!(b.shared_state().map(|s| s.metadata.revision), Some(3));
}

#[test]
fn config_changes_replicate_independently_of_snapshot() {
    let cluster = Cluster::new(SyncMode::Distributed, true);
    let mut a = cluster.spawn("tab-a");
    let mut b = cluster.spawn("tab-b");
    let b_events = record_events(&mut b);
    a.start();
    cluster.step(10, &mut [&mut a, &mut b]);

    b.extend();
    a.set_config(SessionConfigPatch {
        countdown_ms: Some(2_000),
        ..Default::default()
    });
    cluster.step(10, &mut [&mut a, &mut b]);

    assert_eq!(b.config().countdown_ms, 2_000);
    assert_eq!(a.snapshot().state, SessionState::Countdown);
    assert_eq!(a.snapshot(), b.snapshot());
    assert!(b_events
        .lock()
        .unwrap()
        .contains(&SessionEventKind::ConfigChanged));
}

#[test]
fn storage_events_carry_sync_without_broadcast() {
    let cluster = Cluster::new(SyncMode::Leader, false);
    let mut a = cluster.spawn("tab-a");
    let mut b = cluster.spawn("tab-b");
    assert_eq!(a.transport_kind(), TransportKind::Storage);
    assert_eq!(b.transport_kind(), TransportKind::Storage);

    a.start();
    cluster.step(250, &mut [&mut a, &mut b]);
    assert_eq!(b.snapshot().state, SessionState::Countdown);

    b.reset_idle(ActivitySource::Router);
    cluster.step(10, &mut [&mut a, &mut b]);
    assert_eq!(a.snapshot().state, SessionState::Idle);
    assert_eq!(a.snapshot(), b.snapshot());
}

#[test]
fn unavailable_broadcast_falls_back_to_storage() {
    let cluster = Cluster::new(SyncMode::Distributed, true);
    if let Some(hub) = cluster.hub.as_ref() {
        hub.set_available(false);
    }
    let mut a = cluster.spawn("tab-a");
    let mut b = cluster.spawn("tab-b");
    assert_eq!(a.transport_kind(), TransportKind::Storage);

    a.start();
    cluster.step(10, &mut [&mut a, &mut b]);
    assert_eq!(a.snapshot(), b.snapshot());
}

#[test]
fn cross_tab_stream_reports_forwarded_operations() {
    let cluster = Cluster::new(SyncMode::Leader, true);
    let mut a = cluster.spawn("tab-a");
    let mut b = cluster.spawn("tab-b");
    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    a.on_cross_tab(move |message| sink.lock().unwrap().push(message.kind));

    a.start();
    cluster.step(250, &mut [&mut a, &mut b]);
    b.extend();
    cluster.step(10, &mut [&mut a, &mut b]);

    let kinds = seen.lock().unwrap().clone();
    assert!(kinds.contains(&idlesync_core::protocol::CrossTabKind::Extend));
}

#[test]
fn oversized_heartbeat_is_reported_and_instance_still_follows() {
    let cluster = Cluster::new(SyncMode::Leader, true);
    let mut a = cluster.spawn("tab-a");

    let backend: Arc<dyn StorageBackend> = cluster.backend.clone();
    let mut b = SessionTimeout::builder()
        .clock(cluster.clock.clone())
        .backend(backend)
        .broadcast_hub(cluster.hub.clone().unwrap())
        .config(SessionConfigPatch {
            leader_heartbeat_ms: Some(i64::MAX),
            ..fast_config(SyncMode::Leader)
        })
        .instance_id("tab-b")
        .build();

    assert!(b
        .startup_issues()
        .iter()
        .any(|issue| issue.field == "leaderHeartbeatMs"));
    assert_eq!(b.config().leader_heartbeat_ms, 2_000);
    assert!(!b.is_leader());
    assert_eq!(b.leader_id(), Some("tab-a"));

    a.start();
    for _ in 0..5 {
        cluster.step(100, &mut [&mut a, &mut b]);
    }
    assert!(a.is_leader());
    assert!(!b.is_leader());
    assert_eq!(a.snapshot(), b.snapshot());
}
