//! Conversation state: which provider conversation each chat session is bound to.
//!
//! Bindings are written through to a [`KeyValueStorage`] on every change, so a
//! restart of the client sees the last conversation id the provider issued.
//! Two turns racing on the same session are last-write-wins.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{ChatError, CoreResult};

/// Prefix shared by every binding key.
pub const KEY_PREFIX: &str = "vizier-conversation:";

/// Storage key of a session's binding.
pub fn key_for(session_id: &str) -> String {
    format!("{KEY_PREFIX}{session_id}")
}

/// Durable string key-value storage. Reads and writes are synchronous and local.
pub trait KeyValueStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> CoreResult<()>;
    fn remove(&self, key: &str) -> CoreResult<()>;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-local storage, used in tests and when no file is configured.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.entries).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> CoreResult<()> {
        lock(&self.entries).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> CoreResult<()> {
        lock(&self.entries).remove(key);
        Ok(())
    }
}

/// JSON file on disk. The whole map is rewritten atomically on each change.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStorage {
    /// Open (or lazily create) the storage file. A missing file is an empty store.
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                ChatError::Other(anyhow::anyhow!(
                    "corrupt storage file {}: {e}",
                    path.display()
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> CoreResult<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        let json = serde_json::to_vec_pretty(entries)
            .map_err(|e| ChatError::Other(e.into()))?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| ChatError::Io(e.error))?;
        Ok(())
    }
}

impl KeyValueStorage for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.entries).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> CoreResult<()> {
        let mut entries = lock(&self.entries);
        if entries.get(key).map(String::as_str) == Some(value) {
            return Ok(());
        }
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries)
    }

    fn remove(&self, key: &str) -> CoreResult<()> {
        let mut entries = lock(&self.entries);
        if entries.remove(key).is_none() {
            return Ok(());
        }
        self.persist(&entries)
    }
}

/// Session → conversation id bindings, as seen by the chat adapter.
pub trait ConversationStore: Send + Sync {
    fn get(&self, session_id: &str) -> Option<String>;
    /// `None` removes the binding; `Some` overwrites it.
    fn set(&self, session_id: &str, conversation_id: Option<&str>) -> CoreResult<()>;
}

/// [`ConversationStore`] over any [`KeyValueStorage`].
#[derive(Clone)]
pub struct ConversationBindings {
    storage: Arc<dyn KeyValueStorage>,
}

impl ConversationBindings {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self { storage }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    pub fn open_file(path: impl AsRef<Path>) -> CoreResult<Self> {
        Ok(Self::new(Arc::new(FileStorage::open(path)?)))
    }
}

impl std::fmt::Debug for ConversationBindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationBindings").finish_non_exhaustive()
    }
}

impl ConversationStore for ConversationBindings {
    fn get(&self, session_id: &str) -> Option<String> {
        self.storage.get(&key_for(session_id))
    }

    fn set(&self, session_id: &str, conversation_id: Option<&str>) -> CoreResult<()> {
        let key = key_for(session_id);
        match conversation_id {
            Some(id) => self.storage.set(&key, id),
            None => self.storage.remove(&key),
        }
    }
}
