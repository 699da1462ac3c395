//! Persisted key/value preferences: active-peer selection and per-peer forwarding ports.
//!
//! Writes are advisory. There is no transaction across keys; both values are re-derived
//! on the next peer-list delivery if they disagree.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::carrier::PeerId;

/// Key holding the active (checked) peer identity.
pub const CHECKED_SERVER_KEY: &str = "checkedServerId";

/// Key holding the forwarding port chosen for `peer`.
pub fn port_key(peer: &PeerId) -> String {
    format!("{}:port", peer)
}

/// Bucket of string settings provided by the host.
pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: &str, value: &str) -> Result<(), PreferenceError>;
    fn remove(&self, key: &str) -> Result<(), PreferenceError>;
}

#[derive(Debug, thiserror::Error)]
pub enum PreferenceError {
    #[error("preference file io: {0}")]
    Io(#[from] std::io::Error),
    #[error("preference encoding: {0}")]
    Serde(#[from] serde_json::Error),
}

fn lock(values: &Mutex<BTreeMap<String, String>>) -> MutexGuard<'_, BTreeMap<String, String>> {
    values.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory store. Nothing survives the process.
#[derive(Default)]
pub struct MemoryPreferences {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferences {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.values).get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) -> Result<(), PreferenceError> {
        lock(&self.values).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PreferenceError> {
        lock(&self.values).remove(key);
        Ok(())
    }
}

/// JSON object in a single file. Every change rewrites the file (temp file + rename).
pub struct FilePreferences {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FilePreferences {
    /// Open (or lazily create) the store at `path`. An unreadable or corrupt file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(s) => match serde_json::from_str::<BTreeMap<String, String>>(&s) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("ignoring corrupt preference file {}: {e}", path.display());
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                tracing::warn!("cannot read preference file {}: {e}", path.display());
                BTreeMap::new()
            }
        };
        Self {
            path,
            values: Mutex::new(values),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn commit(&self, values: &BTreeMap<String, String>) -> Result<(), PreferenceError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(values)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

// The in-memory map only changes once the file write has succeeded.
impl PreferenceStore for FilePreferences {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.values).get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) -> Result<(), PreferenceError> {
        let mut values = lock(&self.values);
        if values.get(key).map(String::as_str) == Some(value) {
            return Ok(());
        }
        let mut next = values.clone();
        next.insert(key.to_string(), value.to_string());
        self.commit(&next)?;
        *values = next;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PreferenceError> {
        let mut values = lock(&self.values);
        if !values.contains_key(key) {
            return Ok(());
        }
        let mut next = values.clone();
        next.remove(key);
        self.commit(&next)?;
        *values = next;
        Ok(())
    }
}
