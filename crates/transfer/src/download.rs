//! Resumable ranged download.
//!
//! The object identity captured by an initial `HEAD` pins every ranged GET.
//! Segments are written into a preallocated `<path>.tmp-<random>` file which
//! is renamed over the target once all of them have been committed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::BytesMut;
use ossxfer_crypto::{ContentCipher, ContentMaterial, CryptoAdapter, Operation};
use ossxfer_protocol::{ByteRange, ObjectInfo, Params};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::api::{BodyReader, GetObjectOutput, ObjectApi};
use crate::checkpoint::{CheckpointError, CheckpointStore, FileCheckpointStore, make_download_store};
use crate::config::TransferConfig;
use crate::crc64::{self, Crc64};
use crate::fileio::{SegmentFile, absolute, remove_if_exists, temp_suffix, with_suffix};
use crate::plan::{determine_part_size, fit_part_size, plan_segments};
use crate::pool::WorkerPool;
use crate::progress::{ProgressCallback, ProgressReporter};
use crate::types::{CompletedSegment, DownloadOutcome, DownloadRecord, Segment, TransferPhase};
use crate::validation::{DownloadTarget, check_download_record};
use crate::{DEFAULT_MULTIPART_THRESHOLD, DEFAULT_NUM_THREADS, DEFAULT_PART_SIZE, TransferError};

/// Bytes pulled from a response body per read.
const COPY_CHUNK: usize = 256 * 1024;

/// Downloads objects to local files, resuming interrupted downloads.
pub struct ResumableDownloader<A> {
    api: Arc<A>,
    part_size: Option<u64>,
    num_threads: usize,
    multiget_threshold: u64,
    store: Option<Arc<dyn CheckpointStore>>,
    params: Params,
    version_id: Option<String>,
    progress: Option<ProgressCallback>,
    crypto: Option<CryptoAdapter>,
    phase: Mutex<TransferPhase>,
}

impl<A: ObjectApi + 'static> ResumableDownloader<A> {
    pub fn new(api: A) -> Self {
        Self {
            api: Arc::new(api),
            part_size: None,
            num_threads: DEFAULT_NUM_THREADS,
            multiget_threshold: DEFAULT_MULTIPART_THRESHOLD,
            store: None,
            params: Params::new(),
            version_id: None,
            progress: None,
            crypto: None,
            phase: Mutex::new(TransferPhase::Initiating),
        }
    }

    pub fn part_size(mut self, part_size: u64) -> Self {
        self.part_size = Some(part_size);
        self
    }

    pub fn num_threads(mut self, n: usize) -> Self {
        self.num_threads = n.max(1);
        self
    }

    pub fn multiget_threshold(mut self, threshold: u64) -> Self {
        self.multiget_threshold = threshold;
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Extra query parameters passed to HEAD and every GET.
    pub fn params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    /// Downloads a specific object version.
    pub fn version_id(mut self, version_id: impl Into<String>) -> Self {
        self.version_id = Some(version_id.into());
        self
    }

    pub fn progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Decrypts client-side encrypted objects.
    pub fn crypto(mut self, adapter: CryptoAdapter) -> Self {
        self.crypto = Some(adapter);
        self
    }

    /// Applies thresholds, sizing, worker count and checkpoint location.
    pub fn with_config(mut self, config: &TransferConfig) -> Result<Self, TransferError> {
        self.multiget_threshold = config.multiget_threshold;
        self.part_size = Some(config.multiget_part_size);
        self.num_threads = config.num_threads.max(1);
        if let Some(dir) = config.download_checkpoint_dir() {
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
            None => Ok(Arc::new(make_download_store()?)),
        }
    }

    /// Downloads `key` to `path`, replacing any existing file.
    pub async fn download(&self, key: &str, path: &Path) -> Result<DownloadOutcome, TransferError> {
        self.set_phase(TransferPhase::Initiating);
        let result = self.run(key, path).await;
        self.set_phase(match &result {
            Ok(_) => TransferPhase::Done,
            Err(_) => TransferPhase::Aborted,
        });
        result
    }

    async fn run(&self, key: &str, path: &Path) -> Result<DownloadOutcome, TransferError> {
        let abspath = absolute(path)?;
        let info = self
            .api
            .head_object(key, self.version_id.as_deref(), &self.params)
            .await?;
        if info.delete_marker {
            return Err(TransferError::InvalidArgument(format!(
                "{key} is a delete marker"
            )));
        }
        let version_id = info.version_id.clone().or_else(|| self.version_id.clone());

        let material = match &self.crypto {
            Some(adapter) => {
                adapter.check_operation(Operation::GetObject)?;
                match adapter.envelope_from_metadata(&info.metadata)? {
                    Some(envelope) => Some(adapter.open(envelope)?),
                    None => None,
                }
            }
            None => None,
        };
        let decrypt = match (&self.crypto, material) {
            (Some(adapter), Some(material)) => Some(Arc::new((adapter.clone(), material))),
            _ => None,
        };

        if info.size == 0 || info.size < self.multiget_threshold {
            return self
                .get_single(key, &abspath, &info, version_id.as_deref(), decrypt.as_deref())
                .await;
        }

        let store = self.store()?;
        let bucket = self.api.bucket_name().to_string();
        let abspath_str = abspath.to_string_lossy().into_owned();
        let record_key = store.make_key(&bucket, key, &abspath);
        let target = DownloadTarget {
            bucket: &bucket,
            object_name: key,
            abspath: &abspath_str,
            info: &info,
            version_id: version_id.as_deref(),
        };

        let resumed = load_record(store.as_ref(), &record_key, key, &abspath, &target)?;
        let (record, file) = match resumed {
            Some(resumed) => resumed,
            None => {
                let part_size = match self.part_size {
                    Some(requested) => fit_part_size(info.size, requested),
                    None => determine_part_size(info.size, DEFAULT_PART_SIZE),
                };
                let record = DownloadRecord {
                    bucket: bucket.clone(),
                    object_name: key.to_string(),
                    etag: info.etag.clone(),
                    size: info.size,
                    last_modified: info.last_modified,
                    version_id: version_id.clone(),
                    abspath: abspath_str.clone(),
                    tmp_suffix: temp_suffix(),
                    part_size,
                    segments: Vec::new(),
                };
                let tmp_path = with_suffix(&abspath, &record.tmp_suffix);
                let file = SegmentFile::create(&tmp_path, info.size)?;
                store.put(&record_key, &serde_json::to_value(&record)?)?;
                info!(key, size = info.size, part_size, "ranged download started");
                (record, file)
            }
        };

        self.set_phase(TransferPhase::Transferring);
        let done: HashSet<u32> = record.segments.iter().map(|s| s.index).collect();
        let already: u64 = record.segments.iter().map(|s| s.end - s.start + 1).sum();
        let todo: Vec<Segment> = plan_segments(record.size, record.part_size)
            .into_iter()
            .filter(|s| !done.contains(&s.index))
            .collect();
        debug!(key, resumed = done.len(), remaining = todo.len(), "planned segments");

        let progress = ProgressReporter::new(record.size, already, self.progress.clone());
        if already > 0 {
            progress.notify();
        }
        let run = Arc::new(DownloadRun {
            state: Mutex::new(RunState {
                record,
                invalidated: false,
            }),
            store: Arc::clone(&store),
            record_key: record_key.clone(),
            file,
            progress,
            downloaded: AtomicUsize::new(0),
        });

        let api = Arc::clone(&self.api);
        let params = self.params.clone();
        let key_owned = key.to_string();
        let run_for_workers = Arc::clone(&run);
        let version_for_workers = version_id.clone();
        WorkerPool::new(self.num_threads)
            .run(
                move |queue| async move {
                    for segment in todo {
                        if !queue.put(segment).await {
                            break;
                        }
                    }
                    Ok(())
                },
                move |segment: Segment| {
                    let api = Arc::clone(&api);
                    let run = Arc::clone(&run_for_workers);
                    let decrypt = decrypt.clone();
                    let key = key_owned.clone();
                    let version_id = version_for_workers.clone();
                    let params = params.clone();
                    async move {
                        let request = SegmentRequest {
                            key: &key,
                            version_id: version_id.as_deref(),
                            params: &params,
                        };
                        download_one_segment(&*api, &run, decrypt.as_deref(), &request, segment)
                            .await
                    }
                },
            )
            .await?;

        self.set_phase(TransferPhase::Finalizing);
        let record = run.snapshot();
        let mut verified = None;
        if let Some(expected) = info.crc64 {
            let mut segments = record.segments.clone();
            segments.sort_by_key(|s| s.index);
            let folded = segments
                .iter()
                .map(|s| s.crc64.map(|crc| (crc, s.end - s.start + 1)))
                .collect::<Option<Vec<_>>>()
                .map(crc64::fold);
            if let Some(actual) = folded {
                if actual != expected {
                    warn!(key, "whole-object crc64 mismatch, keeping temp file");
                    return Err(TransferError::Inconsistent {
                        operation: "download",
                        expected,
                        actual,
                    });
                }
                verified = Some(actual);
            }
        }

        run.file.sync().await?;
        let tmp_path = run.file.path().to_path_buf();
        let segments_downloaded = run.downloaded.load(Ordering::SeqCst);
        drop(run);
        tokio::fs::rename(&tmp_path, &abspath).await?;
        if let Err(e) = store.delete(&record_key) {
            warn!(key, error = %e, "failed to delete download checkpoint");
        }
        info!(key, path = %abspath.display(), "ranged download complete");

        Ok(DownloadOutcome {
            size: record.size,
            segments_downloaded,
            crc64: verified,
        })
    }

    /// Single GET for objects below the multiget threshold.
    async fn get_single(
        &self,
        key: &str,
        abspath: &Path,
        info: &ObjectInfo,
        version_id: Option<&str>,
        decrypt: Option<&(CryptoAdapter, ContentMaterial)>,
    ) -> Result<DownloadOutcome, TransferError> {
        self.set_phase(TransferPhase::Transferring);
        let out = self
            .api
            .get_object(key, None, version_id, &self.params)
            .await?;
        check_identity(&out, &info.etag, info.last_modified)?;

        let GetObjectOutput { body, crc64: range_crc, .. } = out;
        let mut body: BodyReader = match decrypt {
            Some((adapter, material)) => Box::pin(adapter.decrypt_reader(body, material, 0)?),
            None => body,
        };

        let tmp_path = with_suffix(abspath, &temp_suffix());
        let file = SegmentFile::create(&tmp_path, info.size)?;
        let copied = copy_range(&mut body, None, &file, 0, 0, info.size, info.size).await;
        let crc = match copied {
            Ok(crc) => crc,
            Err(e) => {
                remove_if_exists(&tmp_path)?;
                return Err(e);
            }
        };

        let mut verified = None;
        if decrypt.is_none() {
            if let Some(expected) = range_crc.or(info.crc64) {
                if expected != crc {
                    remove_if_exists(&tmp_path)?;
                    return Err(TransferError::Inconsistent {
                        operation: "get object",
                        expected,
                        actual: crc,
                    });
                }
                verified = Some(crc);
            }
        }

        file.sync().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, abspath).await?;
        ProgressReporter::new(info.size, 0, self.progress.clone()).add(info.size);
        debug!(key, size = info.size, "single get complete");

        Ok(DownloadOutcome {
            size: info.size,
            segments_downloaded: 0,
            crc64: verified,
        })
    }
}

/// Loads the record and reopens its temp file.
///
/// A record that fails any check is deleted along with its temp file.
fn load_record(
    store: &dyn CheckpointStore,
    record_key: &str,
    key: &str,
    abspath: &Path,
    target: &DownloadTarget<'_>,
) -> Result<Option<(DownloadRecord, SegmentFile)>, TransferError> {
    let value = match store.get(record_key) {
        Ok(Some(value)) => value,
        Ok(None) => return Ok(None),
        Err(CheckpointError::Corrupt { reason, .. }) => {
            return discard(store, record_key, key, None, &reason);
        }
        Err(e) => return Err(e.into()),
    };
    let record: DownloadRecord = match serde_json::from_value(value) {
        Ok(record) => record,
        Err(e) => return discard(store, record_key, key, None, &e.to_string()),
    };
    let tmp_path = with_suffix(abspath, &record.tmp_suffix);
    if let Err(reason) = check_download_record(&record, target) {
        let tmp = (!record.tmp_suffix.contains(['/', '\\'])).then_some(tmp_path.as_path());
        return discard(store, record_key, key, tmp, &reason);
    }
    let file = match SegmentFile::reopen(&tmp_path, record.size) {
        Ok(file) => file,
        Err(e) => return discard(store, record_key, key, Some(&tmp_path), &e.to_string()),
    };

    info!(key, segments = record.segments.len(), "resuming ranged download");
    Ok(Some((record, file)))
}

fn discard<T>(
    store: &dyn CheckpointStore,
    record_key: &str,
    key: &str,
    tmp_path: Option<&Path>,
    reason: &str,
) -> Result<Option<T>, TransferError> {
    warn!(key, reason, "discarding download checkpoint");
    if let Some(tmp) = tmp_path {
        remove_if_exists(tmp)?;
    }
    store.delete(record_key)?;
    Ok(None)
}

fn check_identity(
    out: &GetObjectOutput,
    etag: &str,
    last_modified: i64,
) -> Result<(), TransferError> {
    if out.etag != etag {
        return Err(TransferError::ObjectChanged(format!(
            "etag {} differs from {etag}",
            out.etag
        )));
    }
    if out.last_modified != last_modified {
        return Err(TransferError::ObjectChanged(format!(
            "last-modified {} differs from {last_modified}",
            out.last_modified
        )));
    }
    Ok(())
}

/// Streams `body` into `file` at `offset`.
///
/// The first `skip` bytes after decryption are dropped and at most `len`
/// bytes are written. The body must yield exactly `expected` bytes. Returns
/// the CRC64 of the bytes as received.
async fn copy_range(
    body: &mut BodyReader,
    mut cipher: Option<ContentCipher>,
    file: &SegmentFile,
    offset: u64,
    skip: u64,
    len: u64,
    expected: u64,
) -> Result<u64, TransferError> {
    let mut crc = Crc64::new();
    let mut received = 0u64;
    let mut written = 0u64;

    loop {
        let mut buf = BytesMut::with_capacity(COPY_CHUNK);
        let n = body.read_buf(&mut buf).await? as u64;
        if n == 0 {
            break;
        }
        if received + n > expected {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("response body longer than {expected} bytes"),
            )));
        }
        crc.update(&buf);
        if let Some(cipher) = cipher.as_mut() {
            cipher.apply(&mut buf);
        }

        let lo = skip.saturating_sub(received).min(n);
        let hi = (skip + len).saturating_sub(received).min(n);
        received += n;
        if lo < hi {
            let data = buf.freeze().slice(lo as usize..hi as usize);
            file.write_at(offset + written, data).await?;
            written += hi - lo;
        }
    }

    if received != expected {
        return Err(TransferError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("response body ended after {received} of {expected} bytes"),
        )));
    }
    Ok(crc.value())
}

// ---------------------------------------------------------------------------
// Per-run shared state
// ---------------------------------------------------------------------------

struct RunState {
    record: DownloadRecord,
    invalidated: bool,
}

struct DownloadRun {
    state: Mutex<RunState>,
    store: Arc<dyn CheckpointStore>,
    record_key: String,
    file: SegmentFile,
    progress: ProgressReporter,
    downloaded: AtomicUsize,
}

impl DownloadRun {
    fn lock(&self) -> std::sync::MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> DownloadRecord {
        self.lock().record.clone()
    }

    fn commit(&self, segment: CompletedSegment) -> Result<(), TransferError> {
        let size = segment.end - segment.start + 1;
        {
            let mut state = self.lock();
            if state.invalidated {
                return Ok(());
            }
            state.record.segments.push(segment);
            let value = serde_json::to_value(&state.record)?;
            self.store.put(&self.record_key, &value)?;
        }
        self.downloaded.fetch_add(1, Ordering::SeqCst);
        self.progress.add(size);
        Ok(())
    }

    /// Deletes the record and the temp file.
    fn invalidate(&self) {
        let mut state = self.lock();
        state.invalidated = true;
        if let Err(e) = self.store.delete(&self.record_key) {
            warn!(error = %e, "failed to delete download checkpoint");
        }
        if let Err(e) = remove_if_exists(self.file.path()) {
            warn!(error = %e, "failed to remove temp file");
        }
    }
}

struct SegmentRequest<'a> {
    key: &'a str,
    version_id: Option<&'a str>,
    params: &'a Params,
}

async fn download_one_segment<A: ObjectApi + ?Sized>(
    api: &A,
    run: &DownloadRun,
    decrypt: Option<&(CryptoAdapter, ContentMaterial)>,
    request: &SegmentRequest<'_>,
    segment: Segment,
) -> Result<(), TransferError> {
    let (etag, last_modified, size) = {
        let state = run.lock();
        (
            state.record.etag.clone(),
            state.record.last_modified,
            state.record.size,
        )
    };

    let wanted = ByteRange::new(segment.start, segment.end);
    let (range, skip, cipher) = match decrypt {
        Some((adapter, material)) => {
            let aligned = adapter.adjust_range(wanted, size);
            let cipher = adapter.cipher_at(material, aligned.range.start)?;
            (aligned.range, aligned.skip, Some(cipher))
        }
        None => (wanted, 0, None),
    };

    let out = api
        .get_object(request.key, Some(range), request.version_id, request.params)
        .await?;
    if let Err(e) = check_identity(&out, &etag, last_modified) {
        warn!(key = request.key, segment = segment.index, "object changed during download");
        run.invalidate();
        return Err(e);
    }

    let GetObjectOutput { mut body, crc64: range_crc, .. } = out;
    let crc = copy_range(
        &mut body,
        cipher,
        &run.file,
        segment.start,
        skip,
        segment.len(),
        range.len(),
    )
    .await?;
    if let Some(expected) = range_crc {
        if expected != crc {
            return Err(TransferError::Inconsistent {
                operation: "get object range",
                expected,
                actual: crc,
            });
        }
    }

    run.commit(CompletedSegment {
        index: segment.index,
        start: segment.start,
        end: segment.end,
        crc64: decrypt.is_none().then_some(crc),
    })?;
    debug!(key = request.key, segment = segment.index, "segment committed");
    Ok(())
}

/// Removes the temp file and record left by an interrupted download of `key`
/// to `path`.
pub async fn cleanup_download<A: ObjectApi + ?Sized>(
    api: &A,
    store: &dyn CheckpointStore,
    key: &str,
    path: &Path,
) -> Result<(), TransferError> {
    let abspath: PathBuf = absolute(path)?;
    let record_key = store.make_key(api.bucket_name(), key, &abspath);

    let value = match store.get(&record_key) {
        Ok(Some(value)) => Some(value),
        Ok(None) => None,
        Err(CheckpointError::Corrupt { .. }) => None,
        Err(e) => return Err(e.into()),
    };
    if let Some(record) = value.and_then(|v| serde_json::from_value::<DownloadRecord>(v).ok()) {
        if !record.tmp_suffix.is_empty() && !record.tmp_suffix.contains(['/', '\\']) {
            let tmp = with_suffix(&abspath, &record.tmp_suffix);
            tokio::task::spawn_blocking(move || remove_if_exists(&tmp)).await??;
            debug!(key, "temp file removed");
        }
    }
    store.delete(&record_key)?;
    Ok(())
}
