//! Resumable, parallel, CRC64-verified transfers against an S3-like object
//! store.
//!
//! The [`ResumableUploader`] splits a local file into parts and drives a
//! multipart upload; the [`ResumableDownloader`] fetches an object as ranged
//! segments into a temporary file. Both persist progress to a
//! [`CheckpointStore`] after every committed unit so an interrupted run
//! resumes where it stopped, and both verify the result with CRC64.

mod api;
mod checkpoint;
mod config;
pub mod crc64;
mod download;
mod fileio;
pub mod plan;
mod pool;
mod progress;
mod types;
mod upload;
mod validation;

use std::path::Path;

use ossxfer_crypto::CryptoError;
use ossxfer_protocol::ApiError;

pub use api::{ApiFuture, BodyReader, GetObjectOutput, ObjectApi};
pub use checkpoint::{
    CheckpointError, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
    default_checkpoint_dir, make_download_store, make_store_key, make_upload_store,
};
pub use config::TransferConfig;
pub use download::{ResumableDownloader, cleanup_download};
pub use pool::{WorkQueue, WorkerPool};
pub use progress::{ProgressCallback, ProgressReporter};
pub use types::{
    CompletedPart, CompletedSegment, DownloadOutcome, DownloadRecord, Part, Segment,
    TransferPhase, UploadOutcome, UploadRecord,
};
pub use upload::{ResumableUploader, abort_upload};
pub use validation::{DownloadTarget, UploadSource, check_download_record, check_upload_record};

/// Smallest part size chosen automatically: 100 KiB.
pub const MIN_PART_SIZE: u64 = 100 * 1024;

/// Most parts one multipart upload may have.
pub const MAX_PART_COUNT: u64 = 10_000;

/// Preferred part and segment size: 10 MiB.
pub const DEFAULT_PART_SIZE: u64 = 10 * 1024 * 1024;

/// Objects below this size skip multipart transfer: 10 MiB.
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Default worker count.
pub const DEFAULT_NUM_THREADS: usize = 1;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("source file changed: {0}")]
    SourceChanged(String),

    #[error("object changed on the server: {0}")]
    ObjectChanged(String),

    #[error("{operation}: crc64 mismatch (expected {expected:#018x}, got {actual:#018x})")]
    Inconsistent {
        operation: &'static str,
        expected: u64,
        actual: u64,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("client-side encryption: {0}")]
    Crypto(#[from] CryptoError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("worker task failed: {0}")]
    Worker(String),
}

impl From<tokio::task::JoinError> for TransferError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Worker(e.to_string())
    }
}

impl TransferError {
    /// `true` when re-invoking the same operation may succeed.
    ///
    /// A retried upload or download resumes from its checkpoint.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api(e) => e.is_transient(),
            Self::Io(_) | Self::Checkpoint(_) => true,
            Self::SourceChanged(_)
            | Self::ObjectChanged(_)
            | Self::Inconsistent { .. }
            | Self::InvalidArgument(_)
            | Self::Crypto(_)
            | Self::Json(_)
            | Self::Worker(_) => false,
        }
    }
}

/// Uploads `path` to `key` with the settings in `config`.
///
/// Progress is checkpointed in `config.checkpoint_dir`, or in the default
/// upload store when unset.
pub async fn resumable_upload<A>(
    api: A,
    key: &str,
    path: impl AsRef<Path>,
    config: &TransferConfig,
) -> Result<UploadOutcome, TransferError>
where
    A: ObjectApi + 'static,
{
    ResumableUploader::new(api)
        .with_config(config)?
        .upload(key, path.as_ref())
        .await
}

/// Downloads `key` to `path` with the settings in `config`.
pub async fn resumable_download<A>(
    api: A,
    key: &str,
    path: impl AsRef<Path>,
    config: &TransferConfig,
) -> Result<DownloadOutcome, TransferError>
where
    A: ObjectApi + 'static,
{
    ResumableDownloader::new(api)
        .with_config(config)?
        .download(key, path.as_ref())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use ossxfer_protocol::{ServiceError, ServiceErrorCode};

    #[test]
    fn retryable_classification() {
        assert!(TransferError::Api(ApiError::Timeout).is_retryable());
        assert!(
            !TransferError::Api(ApiError::Service(ServiceError::new(
                ServiceErrorCode::AccessDenied,
                "denied"
            )))
            .is_retryable()
        );
        assert!(!TransferError::SourceChanged("x".into()).is_retryable());
        assert!(!TransferError::ObjectChanged("x".into()).is_retryable());
        assert!(
            !TransferError::Inconsistent {
                operation: "upload",
                expected: 1,
                actual: 2
            }
            .is_retryable()
        );
        assert!(TransferError::Io(std::io::Error::other("disk")).is_retryable());
    }

    #[test]
    fn inconsistent_message_shows_both_values() {
        let e = TransferError::Inconsistent {
            operation: "complete multipart upload",
            expected: 0xab,
            actual: 0xcd,
        };
        let msg = e.to_string();
        assert!(msg.contains("0x00000000000000ab"));
        assert!(msg.contains("0x00000000000000cd"));
    }
}
