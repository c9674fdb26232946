//! Durable key-value storage.
//!
//! Backends are fallible and model a browser storage area: a shared
//! `MemoryBackend` (with storage-event notifications to other origins) and a
//! directory-backed `FileBackend` for state that survives the process.
//!
//! The core never talks to a backend directly. It goes through
//! [`DurableStore`], which swallows backend faults: failed writes are kept in
//! an in-memory map so the owning instance keeps a coherent view while the
//! backend is unavailable.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use fs_err as fs;
use tempfile::NamedTempFile;

use crate::error::StoreError;

/// Change notification delivered to watchers of other origins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    /// `None` when the key was removed.
    pub new_value: Option<String>,
    pub origin: String,
}

pub trait StorageBackend: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn write(&self, key: &str, value: &str, origin: &str) -> Result<(), StoreError>;

    fn remove(&self, key: &str, origin: &str) -> Result<(), StoreError>;

    /// Subscribes to changes made by other origins. Backends without change
    /// notifications return `None`.
    fn watch(&self, origin: &str) -> Option<Receiver<StorageEvent>>;

    /// Keys currently stored, for diagnostics.
    fn keys(&self) -> Result<Vec<String>, StoreError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Key layout
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    prefix: String,
}

impl StorageKeys {
    pub fn new(prefix: &str) -> Self {
        StorageKeys {
            prefix: prefix.to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn snapshot(&self) -> String {
        format!("{}:snapshot", self.prefix)
    }

    pub fn config(&self) -> String {
        format!("{}:config", self.prefix)
    }

    pub fn shared_state(&self) -> String {
        format!("{}:shared-state", self.prefix)
    }

    pub fn leader(&self) -> String {
        format!("{}:leader", self.prefix)
    }

    pub fn channel(&self) -> String {
        format!("{}:channel", self.prefix)
    }

    pub fn channel_message(&self) -> String {
        format!("{}:message", self.channel())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory backend
// ─────────────────────────────────────────────────────────────────────────────

struct Watcher {
    origin: String,
    sender: Sender<StorageEvent>,
}

#[derive(Default)]
struct Area {
    entries: HashMap<String, String>,
    watchers: Vec<Watcher>,
    quota: Option<usize>,
    disabled: bool,
}

impl Area {
    fn used_bytes(&self) -> usize {
        self.entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    fn notify(&mut self, event: StorageEvent) {
        self.watchers.retain(|watcher| {
            if watcher.origin == event.origin {
                return true;
            }
            watcher.sender.send(event.clone()).is_ok()
        });
    }
}

/// Storage area shared by every instance holding the same `Arc`.
#[derive(Default)]
pub struct MemoryBackend {
    area: Mutex<Area>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(bytes: usize) -> Self {
        let backend = Self::default();
        backend.set_quota(Some(bytes));
        backend
    }

    pub fn set_quota(&self, bytes: Option<usize>) {
        if let Ok(mut area) = self.area.lock() {
            area.quota = bytes;
        }
    }

    pub fn set_disabled(&self, disabled: bool) {
        if let Ok(mut area) = self.area.lock() {
            area.disabled = disabled;
        }
    }
}

impl StorageBackend for MemoryBackend {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        let area = self.area.lock().map_err(|_| StoreError::Poisoned)?;
        if area.disabled {
            return Err(StoreError::Disabled);
        }
        Ok(area.entries.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str, origin: &str) -> Result<(), StoreError> {
        let mut area = self.area.lock().map_err(|_| StoreError::Poisoned)?;
        if area.disabled {
            return Err(StoreError::Disabled);
        }
        if let Some(quota) = area.quota {
            let existing = area.entries.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
            let needed = area.used_bytes() - existing + key.len() + value.len();
            if needed > quota {
                return Err(StoreError::QuotaExceeded {
                    key: key.to_string(),
                    needed,
                    quota,
                });
            }
        }
        if area.entries.get(key).map(String::as_str) == Some(value) {
            return Ok(());
        }
        area.entries.insert(key.to_string(), value.to_string());
        area.notify(StorageEvent {
            key: key.to_string(),
            new_value: Some(value.to_string()),
            origin: origin.to_string(),
        });
        Ok(())
    }

    fn remove(&self, key: &str, origin: &str) -> Result<(), StoreError> {
        let mut area = self.area.lock().map_err(|_| StoreError::Poisoned)?;
        if area.disabled {
            return Err(StoreError::Disabled);
        }
        if area.entries.remove(key).is_some() {
            area.notify(StorageEvent {
                key: key.to_string(),
                new_value: None,
                origin: origin.to_string(),
            });
        }
        Ok(())
    }

    fn watch(&self, origin: &str) -> Option<Receiver<StorageEvent>> {
        let mut area = self.area.lock().ok()?;
        let (sender, receiver) = mpsc::channel();
        area.watchers.push(Watcher {
            origin: origin.to_string(),
            sender,
        });
        Some(receiver)
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let area = self.area.lock().map_err(|_| StoreError::Poisoned)?;
        let mut keys: Vec<String> = area.entries.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File backend
// ─────────────────────────────────────────────────────────────────────────────

/// One file per key under a directory. Writes are atomic (temp file +
/// rename). Keys are percent-encoded into file names.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileBackend { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_key(key)))
    }

    fn io_error(path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl StorageBackend for FileBackend {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Self::io_error(&path, err)),
        }
    }

    fn write(&self, key: &str, value: &str, _origin: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        fs::create_dir_all(&self.dir).map_err(|err| Self::io_error(&self.dir, err))?;

        let mut temp_file =
            NamedTempFile::new_in(&self.dir).map_err(|err| Self::io_error(&self.dir, err))?;
        temp_file
            .write_all(value.as_bytes())
            .map_err(|err| Self::io_error(&path, err))?;
        temp_file
            .flush()
            .map_err(|err| Self::io_error(&path, err))?;
        temp_file
            .persist(&path)
            .map_err(|err| Self::io_error(&path, err.error))?;
        Ok(())
    }

    fn remove(&self, key: &str, _origin: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Self::io_error(&path, err)),
        }
    }

    fn watch(&self, _origin: &str) -> Option<Receiver<StorageEvent>> {
        None
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(Self::io_error(&self.dir, err)),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| Self::io_error(&self.dir, err))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(key) = name.strip_suffix(".json").and_then(decode_key) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => out.push(byte as char),
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

// ─────────────────────────────────────────────────────────────────────────────
// Non-failing store
// ─────────────────────────────────────────────────────────────────────────────

/// Store handle owned by one instance. Never returns errors.
///
/// Keys whose last write or remove failed are shadowed by a local map until
/// a later operation on the same key reaches the backend again.
pub struct DurableStore {
    backend: Arc<dyn StorageBackend>,
    origin: String,
    fallback: Mutex<HashMap<String, Option<String>>>,
    degraded: AtomicBool,
}

impl DurableStore {
    pub fn new(backend: Arc<dyn StorageBackend>, origin: &str) -> Self {
        DurableStore {
            backend,
            origin: origin.to_string(),
            fallback: Mutex::new(HashMap::new()),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn read(&self, key: &str) -> Option<String> {
        if let Some(shadowed) = self.shadowed(key) {
            return shadowed;
        }
        match self.backend.read(key) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "Storage read failed");
                self.degraded.store(true, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn write(&self, key: &str, value: &str) {
        match self.backend.write(key, value, &self.origin) {
            Ok(()) => self.clear_shadow(key),
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "Storage write failed; keeping value in memory");
                self.shadow(key, Some(value.to_string()));
            }
        }
    }

    pub fn remove(&self, key: &str) {
        match self.backend.remove(key, &self.origin) {
            Ok(()) => self.clear_shadow(key),
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "Storage remove failed; keeping removal in memory");
                self.shadow(key, None);
            }
        }
    }

    pub fn watch(&self) -> Option<Receiver<StorageEvent>> {
        self.backend.watch(&self.origin)
    }

    fn shadowed(&self, key: &str) -> Option<Option<String>> {
        self.fallback.lock().ok()?.get(key).cloned()
    }

    fn shadow(&self, key: &str, value: Option<String>) {
        self.degraded.store(true, Ordering::Relaxed);
        if let Ok(mut fallback) = self.fallback.lock() {
            fallback.insert(key.to_string(), value);
        }
    }

    fn clear_shadow(&self, key: &str) {
        if let Ok(mut fallback) = self.fallback.lock() {
            fallback.remove(key);
        }
    }
}
