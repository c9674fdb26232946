//! Publishes and receives the canonical shared session record.
//!
//! The coordinator owns the transport and the shared-state storage watch.
//! It turns raw payloads into validated [`Inbound`] messages and drops its
//! own echoes; deciding whether a received state wins is left to the session
//! machine.

use std::sync::mpsc::Receiver;
use std::sync::Arc;

use idlesync_protocol::{
    parse_shared_state, parse_wire_message, CrossTabMessage, LeaderRecord, SharedSessionState,
    WireMessage,
};

use crate::storage::{DurableStore, StorageEvent, StorageKeys};
use crate::transport::{self, BroadcastHub, Transport, TransportKind};

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    State(SharedSessionState),
    SyncRequest {
        source_id: String,
        reason: String,
        expect_reply: bool,
    },
    Delta(CrossTabMessage),
    Leader {
        source_id: String,
        record: Option<LeaderRecord>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    pub persist: bool,
    pub broadcast: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        PublishOptions {
            persist: true,
            broadcast: true,
        }
    }
}

pub struct SharedStateCoordinator {
    instance_id: String,
    store: Arc<DurableStore>,
    hub: Option<BroadcastHub>,
    keys: StorageKeys,
    transport: Box<dyn Transport>,
    watch: Option<Receiver<StorageEvent>>,
    latest: Option<SharedSessionState>,
}

impl SharedStateCoordinator {
    pub fn connect(
        instance_id: &str,
        store: Arc<DurableStore>,
        hub: Option<BroadcastHub>,
        keys: StorageKeys,
    ) -> Self {
        let transport = transport::connect(hub.as_ref(), &store, &keys.channel());
        let watch = store.watch();
        tracing::debug!(
            instance = %instance_id,
            transport = transport.kind().as_str(),
            channel = %keys.channel(),
            "Shared-state coordinator connected"
        );
        SharedStateCoordinator {
            instance_id: instance_id.to_string(),
            store,
            hub,
            keys,
            transport,
            watch,
            latest: None,
        }
    }

    pub fn keys(&self) -> &StorageKeys {
        &self.keys
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Last canonical record this instance wrote or accepted.
    pub fn latest(&self) -> Option<&SharedSessionState> {
        self.latest.as_ref()
    }

    pub fn remember(&mut self, state: SharedSessionState) {
        self.latest = Some(state);
    }

    pub fn load_persisted(&self) -> Option<SharedSessionState> {
        let key = self.keys.shared_state();
        let raw = self.store.read(&key)?;
        match parse_shared_state(&raw) {
            Ok(state) => Some(state),
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "Ignoring unreadable shared state");
                None
            }
        }
    }

    pub fn publish_state(&mut self, state: SharedSessionState, options: PublishOptions) {
        if options.persist {
            match serde_json::to_string(&state) {
                Ok(raw) => self.store.write(&self.keys.shared_state(), &raw),
                Err(err) => tracing::warn!(error = %err, "Failed to encode shared state"),
            }
        }
        if options.broadcast {
            self.send(&WireMessage::State {
                source_id: self.instance_id.clone(),
                state: state.clone(),
            });
        }
        self.latest = Some(state);
    }

    /// Re-sends the latest record without persisting it again.
    pub fn rebroadcast_latest(&mut self) -> bool {
        let Some(state) = self.latest.clone() else {
            return false;
        };
        self.send(&WireMessage::State {
            source_id: self.instance_id.clone(),
            state,
        });
        true
    }

    pub fn request_sync(&mut self, reason: &str, expect_reply: bool) {
        self.send(&WireMessage::RequestSync {
            source_id: self.instance_id.clone(),
            reason: reason.to_string(),
            expect_reply,
        });
    }

    pub fn send_delta(&mut self, message: CrossTabMessage) {
        self.send(&WireMessage::Delta { message });
    }

    pub fn announce_leader(&mut self, record: Option<LeaderRecord>) {
        self.send(&WireMessage::Leader {
            source_id: self.instance_id.clone(),
            record,
        });
    }

    pub fn poll(&mut self) -> Vec<Inbound> {
        let mut inbound = Vec::new();

        for raw in self.transport.poll() {
            match parse_wire_message(&raw) {
                Ok(message) if message.source_id() == self.instance_id => {}
                Ok(message) => inbound.push(into_inbound(message)),
                Err(err) => {
                    tracing::debug!(error = %err, "Dropping invalid cross-instance message")
                }
            }
        }

        let shared_key = self.keys.shared_state();
        let events: Vec<StorageEvent> = match self.watch.as_ref() {
            Some(watch) => watch.try_iter().filter(|e| e.key == shared_key).collect(),
            None => Vec::new(),
        };
        for event in events {
            let Some(raw) = event.new_value else {
                continue;
            };
            match parse_shared_state(&raw) {
                Ok(state) => inbound.push(Inbound::State(state)),
                Err(err) => {
                    tracing::debug!(error = %err, "Ignoring invalid shared state from storage event")
                }
            }
        }

        inbound
    }

    /// Removes the canonical record. Only for an explicit reset by the host.
    pub fn clear(&mut self) {
        self.store.remove(&self.keys.shared_state());
        self.latest = None;
    }

    /// Moves to a new key namespace, reopening the channel.
    pub fn reconnect(&mut self, keys: StorageKeys) {
        if keys == self.keys {
            return;
        }
        self.transport.close();
        self.transport = transport::connect(self.hub.as_ref(), &self.store, &keys.channel());
        self.watch = self.store.watch();
        tracing::info!(
            instance = %self.instance_id,
            from = %self.keys.prefix(),
            to = %keys.prefix(),
            "Shared-state coordinator moved namespace"
        );
        self.keys = keys;
        self.latest = None;
    }

    pub fn close(&mut self) {
        self.transport.close();
        self.watch = None;
    }

    fn send(&mut self, message: &WireMessage) {
        let raw = match message.to_json() {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to encode cross-instance message");
                return;
            }
        };
        if let Err(err) = self.transport.publish(&raw) {
            tracing::debug!(
                message_type = message.type_name(),
                error = %err,
                "Cross-instance publish failed"
            );
        }
    }
}

fn into_inbound(message: WireMessage) -> Inbound {
    match message {
        WireMessage::State { state, .. } => Inbound::State(state),
        WireMessage::RequestSync {
            source_id,
            reason,
            expect_reply,
        } => Inbound::SyncRequest {
            source_id,
            reason,
            expect_reply,
        },
        WireMessage::Delta { message } => Inbound::Delta(message),
        WireMessage::Leader { source_id, record } => Inbound::Leader { source_id, record },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryBackend, StorageBackend};
    use idlesync_protocol::{
        CrossTabKind, Metadata, SessionConfig, SessionSnapshot, SharedConfig, SharedOperation,
        SyncMode, SHARED_STATE_VERSION,
    };

    fn state(writer: &str, revision: u64) -> SharedSessionState {
        SharedSessionState {
            version: SHARED_STATE_VERSION,
            updated_at: 10,
            sync_mode: SyncMode::Distributed,
            leader: None,
            metadata: Metadata::new(revision, revision, writer, SharedOperation::Start),
            snapshot: SessionSnapshot::stopped(1_000),
            config: SharedConfig {
                config: SessionConfig::default(),
                revision: 0,
                logical_clock: 0,
                writer_id: writer.to_string(),
            },
        }
    }

    fn pair(hub: Option<BroadcastHub>) -> (SharedStateCoordinator, SharedStateCoordinator) {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let keys = StorageKeys::new("t");
        let a = SharedStateCoordinator::connect(
            "a",
            Arc::new(DurableStore::new(backend.clone(), "a")),
            hub.clone(),
            keys.clone(),
        );
        let b = SharedStateCoordinator::connect(
            "b",
            Arc::new(DurableStore::new(backend, "b")),
            hub,
            keys,
        );
        (a, b)
    }

    #[test]
    fn broadcast_and_storage_both_deliver_state() {
        let (mut a, mut b) = pair(Some(BroadcastHub::new()));
        a.publish_state(state("a", 1), PublishOptions::default());

        let inbound = b.poll();
        assert_eq!(inbound.len(), 2);
        assert!(inbound.iter().all(|m| matches!(m, Inbound::State(s) if s.metadata.revision == 1)));
        assert!(a.poll().is_empty());
        assert_eq!(a.latest().map(|s| s.metadata.revision), Some(1));
    }

    #[test]
    fn storage_fallback_carries_messages() {
        let (mut a, mut b) = pair(None);
        assert_eq!(a.transport_kind(), TransportKind::Storage);

        a.request_sync("bootstrap", true);
        a.send_delta(CrossTabMessage::new("a", CrossTabKind::Extend, 5, None));

        let inbound = b.poll();
        assert_eq!(inbound.len(), 2);
        assert!(matches!(&inbound[0], Inbound::SyncRequest { reason, .. } if reason == "bootstrap"));
        assert!(matches!(&inbound[1], Inbound::Delta(m) if m.kind == CrossTabKind::Extend));
    }

    #[test]
    fn persisted_state_loads_back() {
        let (mut a, b) = pair(None);
        a.publish_state(
            state("a", 4),
            PublishOptions {
                persist: true,
                broadcast: false,
            },
        );
        assert_eq!(b.load_persisted().map(|s| s.metadata.revision), Some(4));
    }

    #[test]
    fn clear_removes_record() {
        let (mut a, b) = pair(None);
        a.publish_state(state("a", 1), PublishOptions::default());
        a.clear();
        assert!(a.latest().is_none());
        assert!(b.load_persisted().is_none());
    }

    #[test]
    fn drops_invalid_payloads() {
        let hub = BroadcastHub::new();
        let (_a, mut b) = pair(Some(hub.clone()));
        let mut rogue = hub.open("t:channel").unwrap();
        rogue.publish("{not json").unwrap();
        rogue.publish(r#"{"type":"state","sourceId":"x","state":{"version":3}}"#).unwrap();
        assert!(b.poll().is_empty());
    }

    #[test]
    fn reconnect_switches_namespace() {
        let hub = BroadcastHub::new();
        let (mut a, mut b) = pair(Some(hub.clone()));
        a.reconnect(StorageKeys::new("other"));
        assert_eq!(hub.member_count("t:channel"), 1);
        assert_eq!(hub.member_count("other:channel"), 1);

        a.announce_leader(None);
        assert!(b.poll().is_empty());
    }
}
