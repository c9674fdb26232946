//! The session timeout state machine.
//!
//! ```text
//!            start/reset           grace elapsed          remaining <= warn
//!  (stopped) ──────────► IDLE ───────────────► COUNTDOWN ─────────────────► WARN
//!                         ▲                        │                         │
//!                         └──── activity reset ────┴──────────┬──────────────┘
//!                                                             │ remaining = 0 / expire_now
//!                                                             ▼
//!                                                          EXPIRED ── start ──► IDLE
//! ```
//!
//! [`SessionTimeout`] is the composition root: it owns the clock, the
//! durable store, the shared-state coordinator and (in leader mode) the
//! leader election, and is driven entirely by the host calling
//! [`SessionTimeout::tick`].

pub mod conflict;
pub mod delay;
pub mod events;
mod machine;
pub mod tick;

pub use events::{EventDetail, SessionEvent, SessionEventKind};
pub use machine::{SessionTimeout, SessionTimeoutBuilder};
