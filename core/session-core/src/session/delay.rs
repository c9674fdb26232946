//! Deferred public operations.
//!
//! Each action kind has at most one pending invocation. Scheduling the same
//! kind again replaces the earlier one, which gives debounce semantics.

use crate::activity::ActivitySource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Start,
    Stop,
    Reset,
    Extend,
    Expire,
    Pause,
    Resume,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingAction {
    Start,
    Stop,
    Reset(ActivitySource),
    Extend,
    Expire(String),
    Pause,
    Resume,
}

impl PendingAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            PendingAction::Start => ActionKind::Start,
            PendingAction::Stop => ActionKind::Stop,
            PendingAction::Reset(_) => ActionKind::Reset,
            PendingAction::Extend => ActionKind::Extend,
            PendingAction::Expire(_) => ActionKind::Expire,
            PendingAction::Pause => ActionKind::Pause,
            PendingAction::Resume => ActionKind::Resume,
        }
    }
}

#[derive(Debug)]
struct Scheduled {
    due_at: i64,
    sequence: u64,
    action: PendingAction,
}

#[derive(Debug, Default)]
pub struct DelayedActions {
    pending: Vec<Scheduled>,
    sequence: u64,
}

impl DelayedActions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when an earlier pending action of the same kind was
    /// replaced.
    pub fn schedule(&mut self, action: PendingAction, due_at: i64) -> bool {
        let replaced = self.cancel(action.kind());
        self.sequence += 1;
        self.pending.push(Scheduled {
            due_at,
            sequence: self.sequence,
            action,
        });
        replaced
    }

    pub fn cancel(&mut self, kind: ActionKind) -> bool {
        let before = self.pending.len();
        self.pending.retain(|s| s.action.kind() != kind);
        self.pending.len() != before
    }

    pub fn cancel_all(&mut self) {
        self.pending.clear();
    }

    pub fn is_pending(&self, kind: ActionKind) -> bool {
        self.pending.iter().any(|s| s.action.kind() == kind)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn next_due(&self) -> Option<i64> {
        self.pending.iter().map(|s| s.due_at).min()
    }

    /// Removes and returns every action due at `now`, earliest first.
    pub fn take_due(&mut self, now: i64) -> Vec<PendingAction> {
        let (mut due, rest): (Vec<Scheduled>, Vec<Scheduled>) =
            self.pending.drain(..).partition(|s| s.due_at <= now);
        self.pending = rest;
        due.sort_by_key(|s| (s.due_at, s.sequence));
        due.into_iter().map(|s| s.action).collect()
    }
}
