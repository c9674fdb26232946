//! Deterministic multi-instance run on a shared manual clock.

use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use idlesync_core::protocol::{SessionConfigPatch, SessionState, SyncMode};
use idlesync_core::{
    ActivitySource, BroadcastHub, Clock, FileBackend, ManualClock, MemoryBackend, SessionEvent,
    SessionTimeout, StorageBackend,
};

use crate::error::{Result, SimError};

/// `INSTANCE@MS`, relative to the simulation start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceAt {
    pub instance: String,
    pub at: i64,
}

impl FromStr for InstanceAt {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        let (instance, at) = value
            .rsplit_once('@')
            .ok_or_else(|| format!("expected INSTANCE@MS, got {:?}", value))?;
        if instance.trim().is_empty() {
            return Err(format!("missing instance in {:?}", value));
        }
        let at = at
            .trim()
            .parse::<i64>()
            .map_err(|err| format!("bad time in {:?}: {}", value, err))?;
        if at < 0 {
            return Err(format!("time must not be negative in {:?}", value));
        }
        Ok(InstanceAt {
            instance: instance.trim().to_string(),
            at,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Script {
    pub activity: Vec<InstanceAt>,
    pub extend: Vec<InstanceAt>,
    pub expire: Vec<InstanceAt>,
    pub freeze: Vec<InstanceAt>,
    pub shutdown: Vec<InstanceAt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Activity,
    Extend,
    Expire,
    Freeze,
    Shutdown,
}

#[derive(Debug, Clone)]
struct Scheduled {
    at: i64,
    slot: usize,
    action: Action,
}

impl Script {
    fn schedule(&self, names: &[String]) -> Result<Vec<Scheduled>> {
        let groups = [
            (Action::Activity, &self.activity),
            (Action::Extend, &self.extend),
            (Action::Expire, &self.expire),
            (Action::Freeze, &self.freeze),
            (Action::Shutdown, &self.shutdown),
        ];
        let mut scheduled = Vec::new();
        for (action, entries) in groups {
            for entry in entries {
                let slot = names
                    .iter()
                    .position(|name| *name == entry.instance)
                    .ok_or_else(|| SimError::UnknownInstance {
                        name: entry.instance.clone(),
                        count: names.len(),
                    })?;
                scheduled.push(Scheduled {
                    at: entry.at,
                    slot,
                    action,
                });
            }
        }
        // Stable, so same-time actions keep their command-line grouping.
        scheduled.sort_by_key(|s| s.at);
        Ok(scheduled)
    }
}

pub struct SimulateOptions {
    pub instances: usize,
    pub mode: SyncMode,
    pub step_ms: u64,
    pub duration_ms: u64,
    pub start_at: i64,
    pub script: Script,
    pub broadcast: bool,
    pub state_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

pub fn run(options: SimulateOptions) -> Result<()> {
    let mut patch = match options.config.as_ref() {
        Some(path) => crate::check_config::load_patch(path)?,
        None => SessionConfigPatch::default(),
    };
    patch.sync_mode = Some(options.mode);

    let backend: Arc<dyn StorageBackend> = match options.state_dir.as_ref() {
        Some(dir) => {
            fs_err::create_dir_all(dir)?;
            Arc::new(FileBackend::new(dir))
        }
        None => Arc::new(MemoryBackend::new()),
    };

    let mut simulation = Simulation::new(
        options.instances,
        options.start_at,
        backend,
        options.broadcast.then(BroadcastHub::new),
        patch,
    )?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    simulation.run(
        &options.script,
        options.step_ms,
        options.duration_ms,
        &mut out,
    )?;
    out.flush()?;
    Ok(())
}

struct Slot {
    name: String,
    session: Option<SessionTimeout>,
    frozen: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Summary<'a> {
    kind: &'static str,
    instance_id: &'a str,
    state: Option<SessionState>,
    running: bool,
    leader: bool,
    epoch: Option<u64>,
    transport: &'static str,
    degraded: bool,
    closed: bool,
}

pub struct Simulation {
    clock: Arc<ManualClock>,
    start_at: i64,
    slots: Vec<Slot>,
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl Simulation {
    pub fn new(
        instances: usize,
        start_at: i64,
        backend: Arc<dyn StorageBackend>,
        hub: Option<BroadcastHub>,
        patch: SessionConfigPatch,
    ) -> Result<Self> {
        if instances == 0 {
            return Err(SimError::NoInstances);
        }
        let clock = Arc::new(ManualClock::new(start_at));
        let events = Arc::new(Mutex::new(Vec::new()));

        let mut slots = Vec::with_capacity(instances);
        for index in 1..=instances {
            let name = format!("tab-{}", index);
            let mut builder = SessionTimeout::builder()
                .clock(clock.clone())
                .backend(backend.clone())
                .config(patch.clone())
                .instance_id(name.clone());
            if let Some(hub) = hub.as_ref() {
                builder = builder.broadcast_hub(hub.clone());
            }
            let mut session = builder.build();
            for issue in session.startup_issues() {
                tracing::warn!(instance = %name, field = %issue.field, message = %issue.message, "Config field rejected");
            }
            let sink = events.clone();
            session.on_event(move |event| {
                if let Ok(mut events) = sink.lock() {
                    events.push(event.clone());
                }
            });
            slots.push(Slot {
                name,
                session: Some(session),
                frozen: false,
            });
        }

        Ok(Simulation {
            clock,
            start_at,
            slots,
            events,
        })
    }

    pub fn run(
        &mut self,
        script: &Script,
        step_ms: u64,
        duration_ms: u64,
        out: &mut impl Write,
    ) -> Result<()> {
        let names: Vec<String> = self.slots.iter().map(|slot| slot.name.clone()).collect();
        let mut pending = script.schedule(&names)?.into_iter().peekable();
        let step = i64::try_from(step_ms.max(1)).unwrap_or(i64::MAX);
        let end = self
            .start_at
            .saturating_add(i64::try_from(duration_ms).unwrap_or(i64::MAX));

        if let Some(first) = self.slots.first_mut().and_then(|slot| slot.session.as_mut()) {
            if !first.snapshot().is_running() {
                first.start();
            }
        }
        self.flush(out)?;

        while self.clock.now() < end {
            self.clock.advance(step);
            let elapsed = self.clock.now() - self.start_at;
            while let Some(next) = pending.next_if(|s| s.at <= elapsed) {
                self.apply(&next);
            }
            for slot in self.slots.iter_mut().filter(|slot| !slot.frozen) {
                if let Some(session) = slot.session.as_mut() {
                    session.tick();
                }
            }
            self.flush(out)?;
        }

        for slot in &self.slots {
            write_json_line(out, &summarize(slot))?;
        }
        Ok(())
    }

    fn apply(&mut self, scheduled: &Scheduled) {
        let now = self.clock.now();
        let Some(slot) = self.slots.get_mut(scheduled.slot) else {
            return;
        };
        tracing::info!(instance = %slot.name, action = ?scheduled.action, at = now, "Scripted action");
        match scheduled.action {
            Action::Freeze => slot.frozen = true,
            Action::Shutdown => {
                if let Some(mut session) = slot.session.take() {
                    session.shutdown();
                }
            }
            Action::Activity => {
                if let Some(session) = slot.session.as_mut() {
                    session.notify_activity(ActivitySource::User, now, None);
                }
            }
            Action::Extend => {
                if let Some(session) = slot.session.as_mut() {
                    session.extend();
                }
            }
            Action::Expire => {
                if let Some(session) = slot.session.as_mut() {
                    session.expire_now("scripted");
                }
            }
        }
    }

    fn flush(&self, out: &mut impl Write) -> Result<()> {
        let drained: Vec<SessionEvent> = match self.events.lock() {
            Ok(mut events) => events.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for event in &drained {
            write_json_line(out, event)?;
        }
        Ok(())
    }
}

fn summarize(slot: &Slot) -> Summary<'_> {
    match slot.session.as_ref() {
        Some(session) => Summary {
            kind: "summary",
            instance_id: &slot.name,
            state: Some(session.snapshot().state),
            running: session.snapshot().is_running(),
            leader: session.is_leader(),
            epoch: session.leader_epoch(),
            transport: session.transport_kind().as_str(),
            degraded: session.is_storage_degraded(),
            closed: session.is_closed(),
        },
        None => Summary {
            kind: "summary",
            instance_id: &slot.name,
            state: None,
            running: false,
            leader: false,
            epoch: None,
            transport: "none",
            degraded: false,
            closed: true,
        },
    }
}

fn write_json_line(out: &mut impl Write, value: &impl Serialize) -> Result<()> {
    let line = serde_json::to_string(value).map_err(|source| idlesync_core::SyncError::Json {
        context: "encoding simulation output".to_string(),
        source,
    })?;
    writeln!(out, "{}", line)?;
    Ok(())
}
