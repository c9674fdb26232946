//! Pure tick evaluation.
//!
//! Given the stored timestamps, the config and the current time, computes
//! the state the session should be in. Every instance runs this on the same
//! shared timestamps, so tick-driven transitions never need to be
//! broadcast.

use idlesync_protocol::{SessionConfig, SessionSnapshot, SessionState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    pub snapshot: SessionSnapshot,
    /// States entered during this evaluation, in order.
    pub entered: Vec<SessionState>,
}

impl TickOutcome {
    pub fn changed_state(&self) -> bool {
        !self.entered.is_empty()
    }
}

pub fn evaluate(snapshot: &SessionSnapshot, config: &SessionConfig, now: i64) -> TickOutcome {
    let mut next = snapshot.clone();
    let mut entered = Vec::new();

    if next.paused {
        return TickOutcome {
            snapshot: next,
            entered,
        };
    }

    match next.state {
        SessionState::Expired => {
            next.remaining_ms = 0;
        }
        SessionState::Idle => {
            let Some(idle_start) = next.idle_start_at else {
                next.remaining_ms = config.countdown_ms;
                return TickOutcome {
                    snapshot: next,
                    entered,
                };
            };
            let grace_deadline = idle_start.saturating_add(as_ms(config.idle_grace_ms));
            if now < grace_deadline {
                next.remaining_ms = config.countdown_ms;
                return TickOutcome {
                    snapshot: next,
                    entered,
                };
            }
            // Anchored at the deadline rather than `now`, so a late tick or a
            // reload computes the same end the timely tick would have.
            next.countdown_end_at = Some(grace_deadline.saturating_add(as_ms(config.countdown_ms)));
            next.state = if config.warn_before_ms >= config.countdown_ms {
                SessionState::Warn
            } else {
                SessionState::Countdown
            };
            entered.push(next.state);
            advance_countdown(&mut next, config, now, &mut entered);
        }
        SessionState::Countdown | SessionState::Warn => {
            advance_countdown(&mut next, config, now, &mut entered);
        }
    }

    TickOutcome {
        snapshot: next,
        entered,
    }
}

fn advance_countdown(
    next: &mut SessionSnapshot,
    config: &SessionConfig,
    now: i64,
    entered: &mut Vec<SessionState>,
) {
    let Some(end) = next.countdown_end_at else {
        return;
    };
    let remaining = end.saturating_sub(now).max(0) as u64;
    if remaining == 0 {
        next.state = SessionState::Expired;
        next.remaining_ms = 0;
        entered.push(SessionState::Expired);
        return;
    }
    if next.state == SessionState::Countdown && remaining <= config.warn_before_ms {
        next.state = SessionState::Warn;
        entered.push(SessionState::Warn);
    }
    next.remaining_ms = remaining;
}

fn as_ms(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
