//! Accept rule for received shared state and Lamport bookkeeping.
//!
//! The snapshot part and the config part of a record carry separate
//! ordering triplets and are accepted independently.

use idlesync_protocol::{SharedSessionState, SyncMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeDecision {
    pub snapshot: bool,
    pub config: bool,
}

impl MergeDecision {
    pub fn is_noop(&self) -> bool {
        !self.snapshot && !self.config
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcceptContext<'a> {
    pub mode: SyncMode,
    pub is_leader: bool,
    pub known_leader: Option<&'a str>,
}

/// Decides which parts of `remote` replace the local canonical record.
///
/// - Leader mode, this instance leads: nothing is accepted; the leader's
///   own record is authoritative.
/// - Leader mode, record written by the leader: adopted, except exact
///   duplicates and older records from the same writer.
/// - Otherwise: a part is adopted only when its triplet strictly wins.
///
/// Config at revision 0 is the writer's construction-time config and never
/// replaces a local one.
pub fn decide(
    local: Option<&SharedSessionState>,
    remote: &SharedSessionState,
    ctx: &AcceptContext<'_>,
) -> MergeDecision {
    if ctx.mode == SyncMode::Leader && ctx.is_leader {
        return MergeDecision::default();
    }
    let config_candidate = remote.config.revision > 0;

    let Some(local) = local else {
        return MergeDecision {
            snapshot: true,
            config: config_candidate,
        };
    };

    if ctx.mode == SyncMode::Leader && written_by_leader(remote, ctx) {
        let superseded = remote.metadata.writer_id == local.metadata.writer_id
            && !remote.metadata.triplet().beats(&local.metadata.triplet());
        return MergeDecision {
            snapshot: !superseded,
            config: config_candidate && remote.config.triplet() != local.config.triplet(),
        };
    }

    MergeDecision {
        snapshot: remote.metadata.triplet().beats(&local.metadata.triplet()),
        config: config_candidate && remote.config.triplet().beats(&local.config.triplet()),
    }
}

fn written_by_leader(remote: &SharedSessionState, ctx: &AcceptContext<'_>) -> bool {
    let writer = remote.metadata.writer_id.as_str();
    match ctx.known_leader {
        Some(leader) => writer == leader,
        None => remote
            .leader
            .as_ref()
            .map(|leader| leader.id == writer)
            .unwrap_or(false),
    }
}

/// Local revision and logical-clock counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LamportState {
    pub revision: u64,
    pub logical_clock: u64,
    pub config_revision: u64,
    pub config_clock: u64,
}

impl LamportState {
    pub fn restore(state: &SharedSessionState) -> Self {
        let mut lamport = LamportState::default();
        lamport.observe(state);
        lamport
    }

    /// Raises every counter to at least the values carried by `state`.
    pub fn observe(&mut self, state: &SharedSessionState) {
        self.revision = self.revision.max(state.metadata.revision);
        self.logical_clock = self.logical_clock.max(state.metadata.logical_clock);
        self.config_revision = self.config_revision.max(state.config.revision);
        self.config_clock = self.config_clock.max(state.config.logical_clock);
    }

    /// Counters for a snapshot-changing write.
    pub fn next_snapshot_write(&mut self) -> (u64, u64) {
        self.revision = self.revision.saturating_add(1);
        self.logical_clock = self.logical_clock.saturating_add(1);
        (self.revision, self.logical_clock)
    }

    /// Counters for a config-changing write.
    pub fn next_config_write(&mut self) -> (u64, u64) {
        self.config_revision = self.config_revision.saturating_add(1);
        self.config_clock = self.config_clock.saturating_add(1);
        (self.config_revision, self.config_clock)
    }

    /// Meaningful mutation that does not produce a write of its own.
    pub fn tick_clock(&mut self) -> u64 {
        self.logical_clock = self.logical_clock.saturating_add(1);
        self.logical_clock
    }
}
