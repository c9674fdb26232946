//! Best-effort message transport between live instances.
//!
//! Preferred path is a named broadcast channel ([`BroadcastHub`]). When the
//! hub is missing or refuses the channel, messages ride on storage change
//! events instead ([`StorageTransport`]). If neither works the instance runs
//! alone on a [`NoopTransport`]. Nothing here guarantees delivery.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::storage::{DurableStore, StorageEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Broadcast,
    Storage,
    Noop,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Broadcast => "broadcast",
            TransportKind::Storage => "storage",
            TransportKind::Noop => "noop",
        }
    }
}

pub trait Transport: Send {
    fn publish(&mut self, payload: &str) -> Result<(), TransportError>;

    /// Drains payloads received since the last call.
    fn poll(&mut self) -> Vec<String>;

    fn close(&mut self);

    fn kind(&self) -> TransportKind;
}

// ─────────────────────────────────────────────────────────────────────────────
// Broadcast channel
// ─────────────────────────────────────────────────────────────────────────────

struct Member {
    id: u64,
    sender: Sender<String>,
}

struct HubInner {
    available: bool,
    next_id: u64,
    channels: HashMap<String, Vec<Member>>,
}

/// In-process registry of named broadcast channels. Clones share the same
/// registry, so every instance handed a clone can reach the others.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<Mutex<HubInner>>,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        BroadcastHub {
            inner: Arc::new(Mutex::new(HubInner {
                available: true,
                next_id: 1,
                channels: HashMap::new(),
            })),
        }
    }

    /// Toggles whether new channels can be opened. Existing members keep
    /// working.
    pub fn set_available(&self, available: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.available = available;
        }
    }

    pub fn open(&self, name: &str) -> Result<BroadcastTransport, TransportError> {
        let mut inner = self.inner.lock().map_err(|_| TransportError::Poisoned)?;
        if !inner.available {
            return Err(TransportError::Unavailable(name.to_string()));
        }
        let id = inner.next_id;
        inner.next_id += 1;
        let (sender, receiver) = mpsc::channel();
        inner
            .channels
            .entry(name.to_string())
            .or_default()
            .push(Member { id, sender });

        Ok(BroadcastTransport {
            hub: self.clone(),
            name: name.to_string(),
            member_id: id,
            receiver,
            closed: false,
        })
    }

    pub fn member_count(&self, name: &str) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.channels.get(name).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }

    fn leave(&self, name: &str, member_id: u64) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(members) = inner.channels.get_mut(name) {
                members.retain(|member| member.id != member_id);
                if members.is_empty() {
                    inner.channels.remove(name);
                }
            }
        }
    }
}

pub struct BroadcastTransport {
    hub: BroadcastHub,
    name: String,
    member_id: u64,
    receiver: Receiver<String>,
    closed: bool,
}

impl BroadcastTransport {
    pub fn channel(&self) -> &str {
        &self.name
    }
}

impl Transport for BroadcastTransport {
    fn publish(&mut self, payload: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let mut inner = self.hub.inner.lock().map_err(|_| TransportError::Poisoned)?;
        if let Some(members) = inner.channels.get_mut(&self.name) {
            let sender_id = self.member_id;
            members.retain(|member| {
                member.id == sender_id || member.sender.send(payload.to_string()).is_ok()
            });
        }
        Ok(())
    }

    fn poll(&mut self) -> Vec<String> {
        if self.closed {
            return Vec::new();
        }
        self.receiver.try_iter().collect()
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.hub.leave(&self.name, self.member_id);
        }
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Broadcast
    }
}

impl Drop for BroadcastTransport {
    fn drop(&mut self) {
        self.close();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Storage-event fallback
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct StorageEnvelope {
    nonce: String,
    payload: String,
}

/// Carries messages through a single storage key. The nonce makes every
/// write a distinct value so repeated payloads still raise change events.
pub struct StorageTransport {
    store: Arc<DurableStore>,
    key: String,
    receiver: Receiver<StorageEvent>,
    sequence: u64,
    closed: bool,
}

impl StorageTransport {
    pub fn open(store: Arc<DurableStore>, key: &str) -> Result<Self, TransportError> {
        let receiver = store
            .watch()
            .ok_or_else(|| TransportError::Unavailable(format!("storage events for {}", key)))?;
        Ok(StorageTransport {
            store,
            key: key.to_string(),
            receiver,
            sequence: 0,
            closed: false,
        })
    }
}

impl Transport for StorageTransport {
    fn publish(&mut self, payload: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.sequence += 1;
        let envelope = StorageEnvelope {
            nonce: format!("{}:{}", self.store.origin(), self.sequence),
            payload: payload.to_string(),
        };
        match serde_json::to_string(&envelope) {
            Ok(raw) => {
                self.store.write(&self.key, &raw);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to encode storage transport envelope");
                Ok(())
            }
        }
    }

    fn poll(&mut self) -> Vec<String> {
        if self.closed {
            return Vec::new();
        }
        let mut payloads = Vec::new();
        for event in self.receiver.try_iter() {
            if event.key != self.key {
                continue;
            }
            let Some(raw) = event.new_value else {
                continue;
            };
            match serde_json::from_str::<StorageEnvelope>(&raw) {
                Ok(envelope) => payloads.push(envelope.payload),
                Err(err) => {
                    tracing::debug!(error = %err, "Ignoring malformed storage transport envelope")
                }
            }
        }
        payloads
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Storage
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// No transport
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct NoopTransport;

impl Transport for NoopTransport {
    fn publish(&mut self, _payload: &str) -> Result<(), TransportError> {
        Ok(())
    }

    fn poll(&mut self) -> Vec<String> {
        Vec::new()
    }

    fn close(&mut self) {}

    fn kind(&self) -> TransportKind {
        TransportKind::Noop
    }
}

/// Opens the best transport available for `channel`: broadcast, then
/// storage events on `{channel}:message`, then nothing.
pub fn connect(
    hub: Option<&BroadcastHub>,
    store: &Arc<DurableStore>,
    channel: &str,
) -> Box<dyn Transport> {
    if let Some(hub) = hub {
        match hub.open(channel) {
            Ok(transport) => return Box::new(transport),
            Err(err) => {
                tracing::info!(channel = %channel, error = %err, "Broadcast unavailable; falling back to storage events")
            }
        }
    }

    let message_key = format!("{}:message", channel);
    match StorageTransport::open(Arc::clone(store), &message_key) {
        Ok(transport) => Box::new(transport),
        Err(err) => {
            tracing::warn!(channel = %channel, error = %err, "No cross-instance transport available; running standalone");
            Box::new(NoopTransport)
        }
    }
}
