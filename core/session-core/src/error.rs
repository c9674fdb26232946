//! Error types for idlesync-core.
//!
//! None of these cross the public `SessionTimeout` operations: storage and
//! transport faults are logged and degraded where they happen. They surface
//! only from the lower-level building blocks and the host tooling.

use std::path::PathBuf;

use idlesync_protocol::ErrorInfo;

// ═══════════════════════════════════════════════════════════════════════════════
// Storage
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage is disabled")]
    Disabled,

    #[error("Storage quota exceeded writing {key}: {needed} bytes, quota {quota}")]
    QuotaExceeded {
        key: String,
        needed: usize,
        quota: usize,
    },

    #[error("Storage I/O error: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage lock poisoned")]
    Poisoned,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Transport
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Broadcast channel unavailable: {0}")]
    Unavailable(String),

    #[error("Transport closed")]
    Closed,

    #[error("Transport lock poisoned")]
    Poisoned,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Crate-level
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Invalid record: {0}")]
    Protocol(#[from] ErrorInfo),

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, SyncError>;
