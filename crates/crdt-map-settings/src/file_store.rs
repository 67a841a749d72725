//! Settings file store.
//!
//! Keeps every key in one JSON file (e.g. `.settings/crdt-map.json`) with an
//! in-memory cache. The whole file is rewritten on each mutation through a
//! temporary sibling file and a rename, so a crash never leaves a torn file.

use crate::store::{Result, SettingsStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

/// On-disk layout of the settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SettingsFile {
    /// Stored blobs by key.
    values: BTreeMap<String, Vec<u8>>,
}

/// Settings store backed by a single JSON file.
pub struct FileStore {
    /// Path to the settings file.
    path: PathBuf,
    /// In-memory cache of the file contents.
    cache: RwLock<SettingsFile>,
}

impl FileStore {
    /// Open (or lazily create) the settings file at `path`.
    ///
    /// A missing file starts empty. An unreadable file is logged and also
    /// starts empty; it is replaced on the first write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cache = match Self::load(&path) {
            Ok(file) => file,
            Err(e) => {
                warn!("Ignoring unreadable settings file {}: {}", path.display(), e);
                SettingsFile::default()
            }
        };

        Self {
            path,
            cache: RwLock::new(cache),
        }
    }

    /// Get the settings file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<SettingsFile> {
        if !path.exists() {
            return Ok(SettingsFile::default());
        }

        let contents = fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn save(&self, file: &SettingsFile) -> Result<()> {
        // Ensure directory exists
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(file)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &self.path)?;

        debug!("Saved {} key(s) to {}", file.values.len(), self.path.display());
        Ok(())
    }

    /// Apply `change` to a copy of the cache, persist it, then publish it.
    fn update(&self, change: impl FnOnce(&mut SettingsFile)) -> Result<()> {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        let mut next = cache.clone();
        change(&mut next);
        self.save(&next)?;
        *cache = next;
        Ok(())
    }
}

impl SettingsStore for FileStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        Ok(cache.values.get(key).cloned())
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        self.update(|file| {
            file.values.insert(key.to_string(), value.to_vec());
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        if self.read(key)?.is_none() {
            return Ok(());
        }
        self.update(|file| {
            file.values.remove(key);
        })
    }
}
