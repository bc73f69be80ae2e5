//! Snapshot persistence.
//!
//! The manager persists documents through a [`SnapshotStore`], injected at
//! construction. A snapshot is the minimal durable record: the document's
//! persistable bytes plus its creation time. Versions and step logs are
//! deliberately not stored; a document recreated from a snapshot starts a
//! fresh instance at version zero and clients resynchronize against it.
//!
//! Two stores ship here. [`MemoryStore`] backs tests and ephemeral deploys.
//! [`FileStore`] writes one LZ4-compressed file per document, named by the
//! hex of the document name so path-hostile names ("notes/2024") stay safe,
//! and replaces files atomically via a rename.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

const SNAPSHOT_EXT: &str = "snap";

/// Durable form of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedDoc {
    pub doc: Vec<u8>,
    pub created_ms: u64,
}

impl PersistedDoc {
    pub fn new(doc: Vec<u8>) -> Self {
        Self::with_created(doc, SystemTime::now())
    }

    pub fn with_created(doc: Vec<u8>, created: SystemTime) -> Self {
        let created_ms = created
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        PersistedDoc { doc, created_ms }
    }

    pub fn created(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.created_ms)
    }
}

#[derive(Debug)]
pub enum StoreError {
    Io(String),
    Corrupt(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "snapshot io error: {e}"),
            StoreError::Corrupt(e) => write!(f, "snapshot corrupt: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Where snapshots live. Calls are synchronous and are expected to be quick;
/// the manager keeps them off its hot paths.
pub trait SnapshotStore: Send + Sync + 'static {
    fn save(&self, name: &str, snapshot: &PersistedDoc) -> Result<(), StoreError>;
    fn load(&self, name: &str) -> Result<Option<PersistedDoc>, StoreError>;
    fn list(&self) -> Result<Vec<String>, StoreError>;
}

/// Keeps snapshots in a map. The save counter exists so tests can observe
/// write coalescing.
pub struct MemoryStore {
    docs: Mutex<HashMap<String, PersistedDoc>>,
    saves: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            docs: Mutex::new(HashMap::new()),
            saves: AtomicU64::new(0),
        }
    }

    /// Total number of `save` calls observed.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    fn docs(&self) -> MutexGuard<'_, HashMap<String, PersistedDoc>> {
        self.docs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore for MemoryStore {
    fn save(&self, name: &str, snapshot: &PersistedDoc) -> Result<(), StoreError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.docs().insert(name.to_string(), snapshot.clone());
        Ok(())
    }

    fn load(&self, name: &str) -> Result<Option<PersistedDoc>, StoreError> {
        Ok(self.docs().get(name).cloned())
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self.docs().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// One compressed file per document under a root directory.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(FileStore { root })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root
            .join(hex_encode(name))
            .with_extension(SNAPSHOT_EXT)
    }
}

impl SnapshotStore for FileStore {
    fn save(&self, name: &str, snapshot: &PersistedDoc) -> Result<(), StoreError> {
        let encoded = bincode::serde::encode_to_vec(snapshot, bincode::config::standard())
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);
        let path = self.path_for(name);
        let staging = path.with_extension("tmp");
        std::fs::write(&staging, &compressed)?;
        std::fs::rename(&staging, &path)?;
        log::debug!(
            "saved snapshot for '{name}' ({} bytes, {} compressed)",
            encoded.len(),
            compressed.len()
        );
        Ok(())
    }

    fn load(&self, name: &str) -> Result<Option<PersistedDoc>, StoreError> {
        let compressed = match std::fs::read(self.path_for(name)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let encoded = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let (snapshot, _) =
            bincode::serde::decode_from_slice(&encoded, bincode::config::standard())
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(Some(snapshot))
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(stem) = file_name
                .to_str()
                .and_then(|n| n.strip_suffix(&format!(".{SNAPSHOT_EXT}")))
            else {
                continue;
            };
            match hex_decode(stem) {
                Some(name) => names.push(name),
                None => log::warn!("ignoring undecodable snapshot file {file_name:?}"),
            }
        }
        names.sort();
        Ok(names)
    }
}

fn hex_encode(name: &str) -> String {
    let mut out = String::with_capacity(name.len() * 2);
    for byte in name.bytes() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn hex_decode(hex: &str) -> Option<String> {
    if hex.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    for pair in hex.as_bytes().chunks(2) {
        let pair = std::str::from_utf8(pair).ok()?;
        bytes.push(u8::from_str_radix(pair, 16).ok()?);
    }
    String::from_utf8(bytes).ok()
}
