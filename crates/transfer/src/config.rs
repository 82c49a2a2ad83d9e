//! Transfer configuration.
//!
//! Every field has a default, so a partial JSON file is accepted.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_MULTIPART_THRESHOLD, DEFAULT_NUM_THREADS, DEFAULT_PART_SIZE, TransferError};

/// Tunables shared by uploads and downloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Uploads smaller than this use a single put.
    pub multipart_threshold: u64,

    /// Preferred upload part size.
    pub part_size: u64,

    /// Downloads smaller than this use a single GET.
    pub multiget_threshold: u64,

    /// Preferred download segment size.
    pub multiget_part_size: u64,

    pub num_threads: usize,

    /// Root of the checkpoint stores. `None` uses the per-user default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            part_size: DEFAULT_PART_SIZE,
            multiget_threshold: DEFAULT_MULTIPART_THRESHOLD,
            multiget_part_size: DEFAULT_PART_SIZE,
            num_threads: DEFAULT_NUM_THREADS,
            checkpoint_dir: None,
        }
    }
}

impl TransferConfig {
    /// Loads configuration from a JSON file.
    ///
    /// A missing file yields the defaults; so does a file that fails to
    /// parse, with a warning.
    pub fn load(path: &Path) -> Result<Self, TransferError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        match serde_json::from_str::<Self>(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse transfer config, using defaults"
                );
                Ok(Self::default())
            }
        }
    }

    /// Saves configuration as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<(), TransferError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "transfer config saved");
        Ok(())
    }

    /// Directory of the upload checkpoint store, when overridden.
    pub fn upload_checkpoint_dir(&self) -> Option<PathBuf> {
        self.checkpoint_dir.as_ref().map(|d| d.join("upload"))
    }

    /// Directory of the download checkpoint store, when overridden.
    pub fn download_checkpoint_dir(&self) -> Option<PathBuf> {
        self.checkpoint_dir.as_ref().map(|d| d.join("download"))
    }
}
