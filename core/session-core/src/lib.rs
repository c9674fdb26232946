//! # idlesync-core
//!
//! Session idle timeout with a countdown/warn phase, kept consistent across
//! several live instances of the same application sharing one storage area.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. The host drives everything through
//!   [`SessionTimeout::tick`] at `pollIntervalMs`.
//! - **Graceful degradation**: Storage faults fall back to memory, a missing
//!   broadcast channel falls back to storage events, and an instance with
//!   neither runs standalone. Public operations never return errors.
//! - **Deterministic**: Time comes from a [`Clock`]; every transition derives
//!   from stored timestamps, so replaying the same clock yields the same
//!   states on every instance.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use idlesync_core::{MemoryBackend, SessionTimeout, SystemClock};
//!
//! let mut session = SessionTimeout::builder()
//!     .clock(Arc::new(SystemClock::new()))
//!     .backend(Arc::new(MemoryBackend::new()))
//!     .build();
//! session.on_expire(|snapshot| println!("expired: {:?}", snapshot));
//! session.start();
//! loop {
//!     session.tick();
//!     std::thread::sleep(std::time::Duration::from_millis(session.poll_interval_ms()));
//! }
//! ```

pub mod activity;
pub mod clock;
pub mod coordinator;
pub mod error;
pub mod leader;
pub mod observer;
pub mod session;
pub mod storage;
pub mod transport;

pub use activity::{ActivityEvent, ActivitySource};
pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{Inbound, PublishOptions, SharedStateCoordinator};
pub use error::{Result, StoreError, SyncError, TransportError};
pub use leader::{LeaderElection, LeadershipChange, Role};
pub use observer::{Observers, SubscriptionId};
pub use session::delay::ActionKind;
pub use session::tick::{evaluate, TickOutcome};
pub use session::{EventDetail, SessionEvent, SessionEventKind, SessionTimeout, SessionTimeoutBuilder};
pub use storage::{
    DurableStore, FileBackend, MemoryBackend, StorageBackend, StorageEvent, StorageKeys,
};
pub use transport::{
    BroadcastHub, BroadcastTransport, NoopTransport, StorageTransport, Transport, TransportKind,
};

pub use idlesync_protocol as protocol;
