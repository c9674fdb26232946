#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use idlesync_core::protocol::{SessionConfigPatch, SyncMode};
use idlesync_core::{
    BroadcastHub, ManualClock, MemoryBackend, SessionEventKind, SessionTimeout, StorageBackend,
};

/// Short timings so scenarios run in a few hundred simulated milliseconds.
pub fn fast_config(mode: SyncMode) -> SessionConfigPatch {
    SessionConfigPatch {
        idle_grace_ms: Some(200),
        countdown_ms: Some(1_000),
        warn_before_ms: Some(300),
        activity_reset_cooldown_ms: Some(0),
        poll_interval_ms: Some(50),
        leader_heartbeat_ms: Some(100),
        sync_mode: Some(mode),
        ..Default::default()
    }
}

pub struct Cluster {
    pub clock: Arc<ManualClock>,
    pub backend: Arc<MemoryBackend>,
    pub hub: Option<BroadcastHub>,
    pub mode: SyncMode,
}

impl Cluster {
    pub fn new(mode: SyncMode, broadcast: bool) -> Self {
        Cluster {
            clock: Arc::new(ManualClock::new(0)),
            backend: Arc::new(MemoryBackend::new()),
            hub: broadcast.then(BroadcastHub::new),
            mode,
        }
    }

    pub fn spawn(&self, id: &str) -> SessionTimeout {
        let backend: Arc<dyn StorageBackend> = self.backend.clone();
        let mut builder = SessionTimeout::builder()
            .clock(self.clock.clone())
            .backend(backend)
            .config(fast_config(self.mode))
            .instance_id(id);
        if let Some(hub) = self.hub.as_ref() {
            builder = builder.broadcast_hub(hub.clone());
        }
        builder.build()
    }

    /// Advances the shared clock and ticks every listed instance in order.
    pub fn step(&self, ms: i64, instances: &mut [&mut SessionTimeout]) {
        self.clock.advance(ms);
        for instance in instances.iter_mut() {
            instance.tick();
        }
    }
}

pub fn record_events(machine: &mut SessionTimeout) -> Arc<Mutex<Vec<SessionEventKind>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    machine.on_event(move |event| sink.lock().unwrap().push(event.kind));
    seen
}

pub fn count_expiries(machine: &mut SessionTimeout) -> Arc<Mutex<u32>> {
    let count = Arc::new(Mutex::new(0));
    let hook = count.clone();
    machine.on_expire(move |_| *hook.lock().unwrap() += 1);
    count
}
