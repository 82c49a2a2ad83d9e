//! Persistent checkpoint records.
//!
//! Records live under `~/.config/ossxfer/checkpoints/{upload,download}/` by
//! default, one JSON document per transfer, named after a hash of the
//! (bucket, object key, local path) triple.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use sha2::{Digest, Sha256};
use tracing::debug;

/// Errors from checkpoint store operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt checkpoint record {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("invalid checkpoint key: {0:?}")]
    InvalidKey(String),

    #[error("checkpoint directory not available")]
    NoCheckpointDir,
}

/// Key/value store holding one record per transfer.
///
/// `put` replaces the whole record. Implementations are shared between
/// workers and must serialize their own writes per key.
pub trait CheckpointStore: Send + Sync {
    /// Loads a record; `Ok(None)` when none exists.
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, CheckpointError>;

    fn put(&self, key: &str, record: &serde_json::Value) -> Result<(), CheckpointError>;

    /// Removes a record. Removing a missing record succeeds.
    fn delete(&self, key: &str) -> Result<(), CheckpointError>;

    /// Derives the record key of a transfer.
    fn make_key(&self, bucket: &str, object_key: &str, local_path: &Path) -> String {
        make_store_key(bucket, object_key, local_path)
    }
}

/// Creates a deterministic record key for a transfer.
///
/// Two 16-byte SHA-256 prefixes (32 hex characters each): one of the object
/// URL, one of the raw bytes of the local path.
pub fn make_store_key(bucket: &str, object_key: &str, local_path: &Path) -> String {
    let object = Sha256::digest(format!("oss://{bucket}/{object_key}").as_bytes());
    let local = Sha256::digest(local_path.as_os_str().as_encoded_bytes());
    format!("{}--{}", hex::encode(&object[..16]), hex::encode(&local[..16]))
}

// ---------------------------------------------------------------------------
// FileCheckpointStore
// ---------------------------------------------------------------------------

/// Stores each record as `<dir>/<key>.json`.
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Opens a store rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, key: &str) -> Result<PathBuf, CheckpointError> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(CheckpointError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, CheckpointError> {
        let path = self.record_path(key)?;
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| CheckpointError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    fn put(&self, key: &str, record: &serde_json::Value) -> Result<(), CheckpointError> {
        let path = self.record_path(key)?;
        let data = serde_json::to_vec_pretty(record).map_err(|e| CheckpointError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        std::fs::write(&path, data)?;
        debug!(path = %path.display(), "checkpoint written");
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CheckpointError> {
        let path = self.record_path(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryCheckpointStore
// ---------------------------------------------------------------------------

/// Process-local store. Records do not survive the process.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    records: Mutex<HashMap<String, serde_json::Value>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, CheckpointError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(key).cloned())
    }

    fn put(&self, key: &str, record: &serde_json::Value) -> Result<(), CheckpointError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.insert(key.to_string(), record.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CheckpointError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Default stores
// ---------------------------------------------------------------------------

/// Returns the default checkpoint root, `<config dir>/ossxfer/checkpoints`.
pub fn default_checkpoint_dir() -> Result<PathBuf, CheckpointError> {
    let base = config_dir().ok_or(CheckpointError::NoCheckpointDir)?;
    Ok(checkpoint_dir_in(&base))
}

/// Opens the default store for upload records.
pub fn make_upload_store() -> Result<FileCheckpointStore, CheckpointError> {
    FileCheckpointStore::new(default_checkpoint_dir()?.join("upload"))
}

/// Opens the default store for download records.
pub fn make_download_store() -> Result<FileCheckpointStore, CheckpointError> {
    FileCheckpointStore::new(default_checkpoint_dir()?.join("download"))
}

fn checkpoint_dir_in(config_base: &Path) -> PathBuf {
    config_base.join("ossxfer").join("checkpoints")
}

/// Per-user configuration root: `%APPDATA%` on Windows, otherwise
/// `$XDG_CONFIG_HOME` or `$HOME/.config`.
fn config_dir() -> Option<PathBuf> {
    if cfg!(windows) {
        return std::env::var_os("APPDATA").map(PathBuf::from);
    }
    resolve_config_base(std::env::var_os("XDG_CONFIG_HOME"), std::env::var_os("HOME"))
}

/// A relative or empty `XDG_CONFIG_HOME` is ignored, as the XDG base
/// directory rules require.
fn resolve_config_base(xdg: Option<OsString>, home: Option<OsString>) -> Option<PathBuf> {
    xdg.map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .or_else(|| home.map(|h| PathBuf::from(h).join(".config")))
}
