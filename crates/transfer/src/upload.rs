//! Resumable multipart upload.
//!
//! A file at least as large as the multipart threshold is split into parts
//! which a [`WorkerPool`] uploads in parallel. Every acknowledged part is
//! written to the checkpoint record before it counts as committed, so a
//! later run with the same (bucket, key, path) uploads only what is missing.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use ossxfer_crypto::{CryptoAdapter, CryptoError, MultipartContext, Operation};
use ossxfer_protocol::{CompletedPartRef, Headers};
use tracing::{debug, info, warn};

use crate::api::ObjectApi;
use crate::checkpoint::{CheckpointError, CheckpointStore, FileCheckpointStore, make_upload_store};
use crate::config::TransferConfig;
use crate::crc64;
use crate::fileio::{absolute, file_identity, read_range};
use crate::plan::{determine_part_size, fit_part_size, plan_parts};
use crate::pool::WorkerPool;
use crate::progress::{ProgressCallback, ProgressReporter};
use crate::types::{CompletedPart, Part, TransferPhase, UploadOutcome, UploadRecord};
use crate::validation::{UploadSource, check_upload_record};
use crate::{DEFAULT_MULTIPART_THRESHOLD, DEFAULT_NUM_THREADS, DEFAULT_PART_SIZE, TransferError};

/// Uploads local files, resuming interrupted multipart uploads.
pub struct ResumableUploader<A> {
    api: Arc<A>,
    part_size: Option<u64>,
    num_threads: usize,
    multipart_threshold: u64,
    store: Option<Arc<dyn CheckpointStore>>,
    headers: Headers,
    progress: Option<ProgressCallback>,
    crypto: Option<CryptoAdapter>,
    phase: Mutex<TransferPhase>,
}

impl<A: ObjectApi + 'static> ResumableUploader<A> {
    pub fn new(api: A) -> Self {
        Self {
            api: Arc::new(api),
            part_size: None,
            num_threads: DEFAULT_NUM_THREADS,
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            store: None,
            headers: Headers::new(),
            progress: None,
            crypto: None,
            phase: Mutex::new(TransferPhase::Initiating),
        }
    }

    /// Uses `part_size` instead of choosing one. It is still grown if the
    /// file would need more than 10,000 parts.
    pub fn part_size(mut self, part_size: u64) -> Self {
        self.part_size = Some(part_size);
        self
    }

    pub fn num_threads(mut self, n: usize) -> Self {
        self.num_threads = n.max(1);
        self
    }

    pub fn multipart_threshold(mut self, threshold: u64) -> Self {
        self.multipart_threshold = threshold;
        self
    }

    /// Stores records in `store` instead of the default upload store.
    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Extra headers sent with put-object and init-multipart-upload.
    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Encrypts uploaded bytes client-side.
    pub fn crypto(mut self, adapter: CryptoAdapter) -> Self {
        self.crypto = Some(adapter);
        self
    }

    /// Applies thresholds, sizing, worker count and checkpoint location.
    pub fn with_config(mut self, config: &TransferConfig) -> Result<Self, TransferError> {
        self.multipart_threshold = config.multipart_threshold;
        self.part_size = Some(config.part_size);
        self.num_threads = config.num_threads.max(1);
        if let Some(dir) = config.upload_checkpoint_dir() {
            self.store = Some(Arc::new(FileCheckpointStore::new(dir)?));
        }
        Ok(self)
    }

    /// Phase reached by the most recent run.
    pub fn phase(&self) -> TransferPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: TransferPhase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
    }

    fn store(&self) -> Result<Arc<dyn CheckpointStore>, TransferError> {
        match &self.store {
            Some(store) => Ok(Arc::clone(store)),
            None => Ok(Arc::new(make_upload_store()?)),
        }
    }

    /// Uploads `path` to `key`.
    pub async fn upload(&self, key: &str, path: &Path) -> Result<UploadOutcome, TransferError> {
        self.set_phase(TransferPhase::Initiating);
        let result = self.run(key, path).await;
        self.set_phase(match &result {
            Ok(_) => TransferPhase::Done,
            Err(_) => TransferPhase::Aborted,
        });
        result
    }

    async fn run(&self, key: &str, path: &Path) -> Result<UploadOutcome, TransferError> {
        let abspath = absolute(path)?;
        let (size, mtime) = file_identity(&abspath)?;

        if size == 0 || size < self.multipart_threshold {
            return self.put_single(key, &abspath, size).await;
        }
        if let Some(adapter) = &self.crypto {
            adapter.check_operation(Operation::MultipartUpload)?;
        }

        let store = self.store()?;
        let bucket = self.api.bucket_name().to_string();
        let abspath_str = abspath.to_string_lossy().into_owned();
        let record_key = store.make_key(&bucket, key, &abspath);
        let source = UploadSource {
            bucket: &bucket,
            object_name: key,
            abspath: &abspath_str,
            size,
            mtime,
        };

        let resumed = self
            .load_record(store.as_ref(), &record_key, key, &source)
            .await?;
        let (record, context) = match resumed {
            Some(resumed) => resumed,
            None => {
                let part_size = self.choose_part_size(size);
                let context = match &self.crypto {
                    Some(adapter) => Some(adapter.new_multipart_context(size, part_size)?),
                    None => None,
                };
                let mut headers = self.headers.clone();
                if let Some(ctx) = &context {
                    headers.extend(ctx.headers());
                }
                let upload_id = self.api.init_multipart_upload(key, &headers).await?;
                info!(key, upload_id = %upload_id, size, part_size, "multipart upload initiated");

                let record = UploadRecord {
                    upload_id,
                    bucket: bucket.clone(),
                    object_name: key.to_string(),
                    abspath: abspath_str.clone(),
                    size,
                    mtime,
                    part_size,
                    parts: Vec::new(),
                    crypto: context.as_ref().map(|c| c.material.envelope.to_metadata()),
                };
                store.put(&record_key, &serde_json::to_value(&record)?)?;
                (record, context)
            }
        };

        self.set_phase(TransferPhase::Transferring);
        let upload_id = record.upload_id.clone();
        let part_size = record.part_size;
        let done: HashSet<u32> = record.parts.iter().map(|p| p.part_number).collect();
        let already: u64 = record.parts.iter().map(|p| p.size).sum();
        let todo: Vec<Part> = plan_parts(size, part_size)
            .into_iter()
            .filter(|p| !done.contains(&p.part_number))
            .collect();
        debug!(
            key,
            upload_id = %upload_id,
            resumed = done.len(),
            remaining = todo.len(),
            "planned parts"
        );

        let progress = ProgressReporter::new(size, already, self.progress.clone());
        if already > 0 {
            progress.notify();
        }
        let run = Arc::new(UploadRun {
            state: Mutex::new(RunState {
                record,
                invalidated: false,
            }),
            store: Arc::clone(&store),
            record_key: record_key.clone(),
            progress,
            uploaded: AtomicUsize::new(0),
        });
        let encryption = match (&self.crypto, context) {
            (Some(adapter), Some(ctx)) => Some(Arc::new((adapter.clone(), ctx))),
            _ => None,
        };

        let api = Arc::clone(&self.api);
        let key_owned = key.to_string();
        let run_for_workers = Arc::clone(&run);
        let upload_id_for_workers = upload_id.clone();
        WorkerPool::new(self.num_threads)
            .run(
                move |queue| async move {
                    for part in todo {
                        if !queue.put(part).await {
                            break;
                        }
                    }
                    Ok(())
                },
                move |part: Part| {
                    let api = Arc::clone(&api);
                    let run = Arc::clone(&run_for_workers);
                    let encryption = encryption.clone();
                    let key = key_owned.clone();
                    let upload_id = upload_id_for_workers.clone();
                    let abspath = abspath.clone();
                    async move {
                        let encryption = encryption.as_deref();
                        upload_one_part(&*api, &run, encryption, &key, &upload_id, &abspath, part)
                            .await
                    }
                },
            )
            .await?;

        self.set_phase(TransferPhase::Finalizing);
        let mut parts = run.snapshot().parts;
        parts.sort_by_key(|p| p.part_number);
        let refs: Vec<CompletedPartRef> = parts
            .iter()
            .map(|p| CompletedPartRef {
                part_number: p.part_number,
                etag: p.etag.clone(),
            })
            .collect();
        let expected = parts
            .iter()
            .map(|p| p.crc64.map(|crc| (crc, p.size)))
            .collect::<Option<Vec<_>>>()
            .map(crc64::fold);

        let completed = match self
            .api
            .complete_multipart_upload(key, &upload_id, &refs, &Headers::new())
            .await
        {
            Ok(out) => out,
            Err(e) => {
                if e.is_no_such_upload() {
                    warn!(key, upload_id = %upload_id, "upload vanished before completion");
                    run.invalidate();
                }
                return Err(e.into());
            }
        };

        if let (Some(expected), Some(actual)) = (expected, completed.crc64) {
            if expected != actual {
                warn!(key, upload_id = %upload_id, "whole-object crc64 mismatch, keeping record");
                return Err(TransferError::Inconsistent {
                    operation: "complete multipart upload",
                    expected,
                    actual,
                });
            }
        }

        if let Err(e) = store.delete(&record_key) {
            warn!(key, error = %e, "failed to delete upload checkpoint");
        }
        info!(key, upload_id = %upload_id, parts = parts.len(), "multipart upload complete");

        Ok(UploadOutcome {
            etag: completed.etag,
            crc64: completed.crc64.or(expected),
            upload_id: Some(upload_id),
            parts_uploaded: run.uploaded.load(Ordering::SeqCst),
        })
    }

    fn choose_part_size(&self, size: u64) -> u64 {
        let part_size = match self.part_size {
            Some(requested) => fit_part_size(size, requested),
            None => determine_part_size(size, DEFAULT_PART_SIZE),
        };
        match &self.crypto {
            Some(adapter) => adapter.adjust_part_size(part_size),
            None => part_size,
        }
    }

    /// Single put for files below the multipart threshold.
    async fn put_single(
        &self,
        key: &str,
        abspath: &Path,
        size: u64,
    ) -> Result<UploadOutcome, TransferError> {
        let mut body = read_range(abspath.to_path_buf(), 0, size).await?;
        let mut headers = self.headers.clone();
        if let Some(adapter) = &self.crypto {
            adapter.check_operation(Operation::PutObject)?;
            let material = adapter.new_content(size)?;
            adapter.encrypt_at(&material, 0, &mut body)?;
            headers.extend(material.envelope.to_headers());
        }
        let body = body.freeze();
        let local = crc64::checksum(&body);

        self.set_phase(TransferPhase::Transferring);
        let out = self.api.put_object(key, body, &headers).await?;
        if let Some(actual) = out.crc64 {
            if actual != local {
                return Err(TransferError::Inconsistent {
                    operation: "put object",
                    expected: local,
                    actual,
                });
            }
        }
        ProgressReporter::new(size, 0, self.progress.clone()).add(size);
        debug!(key, size, "single put complete");

        Ok(UploadOutcome {
            etag: out.etag,
            crc64: Some(local),
            upload_id: None,
            parts_uploaded: 0,
        })
    }

    /// Loads and validates the record for this transfer.
    ///
    /// Invalid records are deleted and `None` is returned so a fresh upload
    /// starts. With an adapter configured, a recorded part size that is not
    /// block aligned is rejected rather than re-planned, and the record is
    /// kept.
    async fn load_record(
        &self,
        store: &dyn CheckpointStore,
        record_key: &str,
        key: &str,
        source: &UploadSource<'_>,
    ) -> Result<Option<(UploadRecord, Option<MultipartContext>)>, TransferError> {
        let value = match store.get(record_key) {
            Ok(Some(value)) => value,
            Ok(None) => return Ok(None),
            Err(CheckpointError::Corrupt { reason, .. }) => {
                return discard(store, record_key, key, &reason);
            }
            Err(e) => return Err(e.into()),
        };
        let record: UploadRecord = match serde_json::from_value(value) {
            Ok(record) => record,
            Err(e) => return discard(store, record_key, key, &e.to_string()),
        };
        if let Err(reason) = check_upload_record(&record, source) {
            return discard(store, record_key, key, &reason);
        }

        let context = match (&self.crypto, &record.crypto) {
            (None, None) => None,
            (Some(adapter), Some(metadata)) => {
                adapter.check_part_size(record.part_size)?;
                match adapter.resume_multipart_context(metadata) {
                    Ok(ctx) if ctx.data_size == record.size && ctx.part_size == record.part_size => {
                        Some(ctx)
                    }
                    Ok(_) => {
                        return discard(store, record_key, key, "envelope does not match record");
                    }
                    Err(e @ CryptoError::InvalidPartSize(_)) => return Err(e.into()),
                    Err(e) => return discard(store, record_key, key, &e.to_string()),
                }
            }
            (Some(adapter), None) => {
                adapter.check_part_size(record.part_size)?;
                return discard(store, record_key, key, "record is not encrypted");
            }
            (None, Some(_)) => return discard(store, record_key, key, "record is encrypted"),
        };

        match self.api.list_parts(key, &record.upload_id, 1).await {
            Ok(_) => {}
            Err(e) if e.is_no_such_upload() => {
                return discard(store, record_key, key, "upload no longer exists");
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            key,
            upload_id = %record.upload_id,
            parts = record.parts.len(),
            "resuming multipart upload"
        );
        Ok(Some((record, context)))
    }
}

fn discard<T>(
    store: &dyn CheckpointStore,
    record_key: &str,
    key: &str,
    reason: &str,
) -> Result<Option<T>, TransferError> {
    warn!(key, reason, "discarding upload checkpoint");
    store.delete(record_key)?;
    Ok(None)
}

// ---------------------------------------------------------------------------
// Per-run shared state
// ---------------------------------------------------------------------------

struct RunState {
    record: UploadRecord,
    /// Set once the record was deleted; later commits must not recreate it.
    invalidated: bool,
}

struct UploadRun {
    state: Mutex<RunState>,
    store: Arc<dyn CheckpointStore>,
    record_key: String,
    progress: ProgressReporter,
    uploaded: AtomicUsize,
}

impl UploadRun {
    fn lock(&self) -> std::sync::MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> UploadRecord {
        self.lock().record.clone()
    }

    /// Appends a part and rewrites the record.
    fn commit(&self, part: CompletedPart) -> Result<(), TransferError> {
        let size = part.size;
        {
            let mut state = self.lock();
            if state.invalidated {
                return Ok(());
            }
            state.record.parts.push(part);
            let value = serde_json::to_value(&state.record)?;
            self.store.put(&self.record_key, &value)?;
        }
        self.uploaded.fetch_add(1, Ordering::SeqCst);
        self.progress.add(size);
        Ok(())
    }

    /// Deletes the record and stops further writes to it.
    fn invalidate(&self) {
        let mut state = self.lock();
        state.invalidated = true;
        if let Err(e) = self.store.delete(&self.record_key) {
            warn!(error = %e, "failed to delete upload checkpoint");
        }
    }
}

async fn upload_one_part<A: ObjectApi + ?Sized>(
    api: &A,
    run: &UploadRun,
    encryption: Option<&(CryptoAdapter, MultipartContext)>,
    key: &str,
    upload_id: &str,
    abspath: &Path,
    part: Part,
) -> Result<(), TransferError> {
    let mut body = match read_range(abspath.to_path_buf(), part.start, part.len()).await {
        Ok(body) => body,
        Err(e @ TransferError::SourceChanged(_)) => {
            warn!(key, part = part.part_number, "source shrank during upload");
            run.invalidate();
            return Err(e);
        }
        Err(e) => return Err(e),
    };
    if let Some((adapter, ctx)) = encryption {
        adapter.encrypt_at(&ctx.material, part.start, &mut body)?;
    }
    let body = body.freeze();
    let local = crc64::checksum(&body);

    let out = match api.upload_part(key, upload_id, part.part_number, body).await {
        Ok(out) => out,
        Err(e) => {
            if e.is_no_such_upload() {
                warn!(key, upload_id, "upload vanished, dropping record");
                run.invalidate();
            }
            return Err(e.into());
        }
    };

    run.commit(CompletedPart {
        part_number: part.part_number,
        etag: out.etag,
        size: part.len(),
        crc64: Some(out.crc64.unwrap_or(local)),
    })?;
    debug!(key, part = part.part_number, "part committed");
    Ok(())
}

/// Aborts the multipart upload recorded for (`key`, `path`) and deletes the
/// record.
///
/// An upload the service no longer knows counts as already aborted, as does
/// the absence of a record.
pub async fn abort_upload<A: ObjectApi + ?Sized>(
    api: &A,
    store: &dyn CheckpointStore,
    key: &str,
    path: &Path,
) -> Result<(), TransferError> {
    let abspath: PathBuf = absolute(path)?;
    let record_key = store.make_key(api.bucket_name(), key, &abspath);

    let value = match store.get(&record_key) {
        Ok(Some(value)) => value,
        Ok(None) => return Ok(()),
        Err(CheckpointError::Corrupt { .. }) => {
            store.delete(&record_key)?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    if let Ok(record) = serde_json::from_value::<UploadRecord>(value) {
        match api.abort_multipart_upload(key, &record.upload_id).await {
            Ok(()) => info!(key, upload_id = %record.upload_id, "multipart upload aborted"),
            Err(e) if e.is_no_such_upload() => {
                debug!(key, upload_id = %record.upload_id, "upload already gone");
            }
            Err(e) => return Err(TransferError::Api(e)),
        }
    }
    store.delete(&record_key)?;
    Ok(())
}

