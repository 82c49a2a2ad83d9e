//! In-memory object store implementing `ObjectApi`, with call recording and
//! fault injection.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use ossxfer_protocol::headers::strip_meta_prefix;
use ossxfer_protocol::{
    ApiError, ByteRange, CompleteMultipartOutput, CompletedPartRef, Headers, ObjectInfo, Params,
    PartInfo, PutObjectOutput, ServiceError, ServiceErrorCode, UploadPartOutput,
};
use ossxfer_transfer::crc64;
use ossxfer_transfer::{ApiFuture, GetObjectOutput, ObjectApi};

pub const BUCKET: &str = "test-bucket";

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub etag: String,
    pub last_modified: i64,
    pub version_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub delete_marker: bool,
}

#[derive(Debug, Default)]
struct PendingUpload {
    key: String,
    metadata: BTreeMap<String, String>,
    parts: BTreeMap<u32, (Bytes, String)>,
}

#[derive(Debug, Default)]
struct State {
    objects: HashMap<String, StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    next_id: u64,
    clock: i64,
}

/// Faults applied to subsequent calls.
#[derive(Debug, Default, Clone)]
pub struct Faults {
    /// `upload_part` fails for every part number at or above this one.
    pub fail_parts_from: Option<u32>,
    /// The CRC reported for this part number has its lowest bit flipped.
    pub flip_part_crc: Option<u32>,
    /// Ranged GETs beyond this many (counted from the fault being set) fail.
    pub fail_gets_after: Option<usize>,
    /// After this many ranged GETs the object is overwritten with new bytes.
    pub overwrite_after_gets: Option<usize>,
    /// GET responses report a CRC with its lowest bit flipped.
    pub flip_get_crc: bool,
    /// HEAD responses report a CRC with its lowest bit flipped.
    pub flip_head_crc: bool,
}

/// Recorded calls.
#[derive(Debug, Default, Clone)]
pub struct Calls {
    pub put_object: usize,
    pub head_object: usize,
    pub init: usize,
    pub upload_part: Vec<u32>,
    pub complete: usize,
    pub abort: usize,
    pub list_parts: usize,
    /// `(range, version_id)` of every GET.
    pub gets: Vec<(Option<ByteRange>, Option<String>)>,
}

#[derive(Debug, Default)]
pub struct FakeOss {
    state: Mutex<State>,
    faults: Mutex<Faults>,
    calls: Mutex<Calls>,
    ranged_gets_since_fault: AtomicUsize,
    versioned: bool,
}

impl FakeOss {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write creates a new object version.
    pub fn versioned() -> Self {
        Self {
            versioned: true,
            ..Self::default()
        }
    }

    pub fn set_faults(&self, faults: Faults) {
        *self.faults.lock().unwrap() = faults;
        self.ranged_gets_since_fault.store(0, Ordering::SeqCst);
    }

    pub fn clear_faults(&self) {
        self.set_faults(Faults::default());
    }

    pub fn calls(&self) -> Calls {
        self.calls.lock().unwrap().clone()
    }

    pub fn reset_calls(&self) {
        *self.calls.lock().unwrap() = Calls::default();
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    pub fn pending_uploads(&self) -> usize {
        self.state.lock().unwrap().uploads.len()
    }

    /// Stores `data` under `key` directly, bypassing the API.
    pub fn insert(&self, key: &str, data: Vec<u8>) -> StoredObject {
        let mut state = self.state.lock().unwrap();
        self.store_locked(&mut state, key, Bytes::from(data), BTreeMap::new())
    }

    /// Replaces `key` with a delete marker.
    pub fn insert_delete_marker(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        let mut obj = self.store_locked(&mut state, key, Bytes::new(), BTreeMap::new());
        obj.delete_marker = true;
        state.objects.insert(key.to_string(), obj);
    }

    fn store_locked(
        &self,
        state: &mut State,
        key: &str,
        data: Bytes,
        metadata: BTreeMap<String, String>,
    ) -> StoredObject {
        state.clock += 1;
        state.next_id += 1;
        let obj = StoredObject {
            etag: format!("\"{:016x}-{}\"", crc64::checksum(&data), state.next_id),
            data,
            last_modified: 1_700_000_000 + state.clock,
            version_id: self.versioned.then(|| format!("v{}", state.next_id)),
            metadata,
            delete_marker: false,
        };
        state.objects.insert(key.to_string(), obj.clone());
        obj
    }

    fn no_such_key(key: &str) -> ApiError {
        ServiceError::new(ServiceErrorCode::NoSuchKey, format!("{key} does not exist")).into()
    }

    fn no_such_upload(id: &str) -> ApiError {
        ServiceError::new(ServiceErrorCode::NoSuchUpload, format!("upload {id} not found")).into()
    }

    fn lookup(&self, key: &str, version_id: Option<&str>) -> Result<StoredObject, ApiError> {
        let state = self.state.lock().unwrap();
        let obj = state.objects.get(key).ok_or_else(|| Self::no_such_key(key))?;
        if let Some(v) = version_id {
            if obj.version_id.as_deref() != Some(v) {
                return Err(Self::no_such_key(key));
            }
        }
        Ok(obj.clone())
    }

    fn do_get(
        &self,
        key: &str,
        range: Option<ByteRange>,
        version_id: Option<&str>,
    ) -> Result<GetObjectOutput, ApiError> {
        self.calls
            .lock()
            .unwrap()
            .gets
            .push((range, version_id.map(str::to_string)));

        if range.is_some() {
            let n = self.ranged_gets_since_fault.fetch_add(1, Ordering::SeqCst) + 1;
            let faults = self.faults.lock().unwrap().clone();
            if faults.overwrite_after_gets.is_some_and(|limit| n > limit) {
                let current = self.lookup(key, None)?;
                let mut changed = current.data.to_vec();
                changed.reverse();
                let mut state = self.state.lock().unwrap();
                self.store_locked(&mut state, key, Bytes::from(changed), current.metadata);
            }
            if faults.fail_gets_after.is_some_and(|limit| n > limit) {
                return Err(ApiError::Transport("connection reset".into()));
            }
        }

        let flip = self.faults.lock().unwrap().flip_get_crc;
        let obj = self.lookup(key, version_id)?;
        let data = match range {
            Some(r) => {
                if r.start >= obj.data.len() as u64 {
                    let e = ServiceError::new(ServiceErrorCode::InvalidRange, "bad range");
                    return Err(e.into());
                }
                let end = (r.end + 1).min(obj.data.len() as u64);
                obj.data.slice(r.start as usize..end as usize)
            }
            None => obj.data.clone(),
        };
        Ok(GetObjectOutput {
            content_length: data.len() as u64,
            crc64: Some(crc64::checksum(&data) ^ u64::from(flip)),
            etag: obj.etag,
            last_modified: obj.last_modified,
            body: Box::pin(std::io::Cursor::new(data)),
        })
    }

    fn do_upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<UploadPartOutput, ApiError> {
        self.calls.lock().unwrap().upload_part.push(part_number);
        let faults = self.faults.lock().unwrap().clone();
        if faults.fail_parts_from.is_some_and(|n| part_number >= n) {
            return Err(ApiError::Transport("connection reset".into()));
        }

        let mut state = self.state.lock().unwrap();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| Self::no_such_upload(upload_id))?;
        let mut crc = crc64::checksum(&body);
        if faults.flip_part_crc == Some(part_number) {
            crc ^= 1;
        }
        let etag = format!("\"part-{part_number}-{:016x}\"", crc64::checksum(&body));
        upload.parts.insert(part_number, (body, etag.clone()));
        Ok(UploadPartOutput {
            etag,
            crc64: Some(crc),
        })
    }

    fn do_complete(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPartRef],
    ) -> Result<CompleteMultipartOutput, ApiError> {
        self.calls.lock().unwrap().complete += 1;
        let mut state = self.state.lock().unwrap();
        let upload = state
            .uploads
            .remove(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| Self::no_such_upload(upload_id))?;

        let mut data = Vec::new();
        let mut last = 0;
        for p in parts {
            assert!(p.part_number > last, "parts must be sorted and unique");
            last = p.part_number;
            let (bytes, etag) = upload.parts.get(&p.part_number).ok_or_else(|| {
                ServiceError::new(ServiceErrorCode::InvalidArgument, "missing part")
            })?;
            assert_eq!(etag, &p.etag, "etag mismatch for part {}", p.part_number);
            data.extend_from_slice(bytes);
        }
        let obj = self.store_locked(&mut state, key, Bytes::from(data), upload.metadata);
        Ok(CompleteMultipartOutput {
            etag: obj.etag,
            crc64: Some(crc64::checksum(&obj.data)),
            version_id: obj.version_id,
        })
    }
}

fn user_metadata(headers: &Headers) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(k, v)| strip_meta_prefix(k).map(|name| (name.to_string(), v.clone())))
        .collect()
}

impl ObjectApi for FakeOss {
    fn bucket_name(&self) -> &str {
        BUCKET
    }

    fn put_object(
        &self,
        key: &str,
        body: Bytes,
        headers: &Headers,
    ) -> ApiFuture<'_, PutObjectOutput> {
        self.calls.lock().unwrap().put_object += 1;
        let mut state = self.state.lock().unwrap();
        let obj = self.store_locked(&mut state, key, body, user_metadata(headers));
        let out = PutObjectOutput {
            etag: obj.etag,
            crc64: Some(crc64::checksum(&obj.data)),
            version_id: obj.version_id,
        };
        Box::pin(async move { Ok(out) })
    }

    fn head_object(
        &self,
        key: &str,
        version_id: Option<&str>,
        _params: &Params,
    ) -> ApiFuture<'_, ObjectInfo> {
        self.calls.lock().unwrap().head_object += 1;
        let flip = self.faults.lock().unwrap().flip_head_crc;
        let result = self.lookup(key, version_id).map(|obj| ObjectInfo {
            size: obj.data.len() as u64,
            etag: obj.etag,
            last_modified: obj.last_modified,
            version_id: obj.version_id,
            storage_class: "Standard".into(),
            crc64: Some(crc64::checksum(&obj.data) ^ u64::from(flip)),
            delete_marker: obj.delete_marker,
            metadata: obj.metadata,
        });
        Box::pin(async move { result })
    }

    fn get_object(
        &self,
        key: &str,
        range: Option<ByteRange>,
        version_id: Option<&str>,
        _params: &Params,
    ) -> ApiFuture<'_, GetObjectOutput> {
        let result = self.do_get(key, range, version_id);
        Box::pin(async move { result })
    }

    fn init_multipart_upload(&self, key: &str, headers: &Headers) -> ApiFuture<'_, String> {
        self.calls.lock().unwrap().init += 1;
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("upload-{}", state.next_id);
        state.uploads.insert(
            id.clone(),
            PendingUpload {
                key: key.to_string(),
                metadata: user_metadata(headers),
                parts: BTreeMap::new(),
            },
        );
        Box::pin(async move { Ok(id) })
    }

    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> ApiFuture<'_, UploadPartOutput> {
        let result = self.do_upload_part(key, upload_id, part_number, body);
        Box::pin(async move { result })
    }

    fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPartRef],
        _headers: &Headers,
    ) -> ApiFuture<'_, CompleteMultipartOutput> {
        let result = self.do_complete(key, upload_id, parts);
        Box::pin(async move { result })
    }

    fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> ApiFuture<'_, ()> {
        self.calls.lock().unwrap().abort += 1;
        let removed = self.state.lock().unwrap().uploads.remove(upload_id);
        let result = match removed {
            Some(_) => Ok(()),
            None => Err(Self::no_such_upload(upload_id)),
        };
        Box::pin(async move { result })
    }

    fn list_parts(
        &self,
        _key: &str,
        upload_id: &str,
        max_parts: u32,
    ) -> ApiFuture<'_, Vec<PartInfo>> {
        self.calls.lock().unwrap().list_parts += 1;
        let state = self.state.lock().unwrap();
        let result = match state.uploads.get(upload_id) {
            Some(upload) => Ok(upload
                .parts
                .iter()
                .take(max_parts as usize)
                .map(|(n, (data, etag))| PartInfo {
                    part_number: *n,
                    etag: etag.clone(),
                    size: data.len() as u64,
                    crc64: Some(crc64::checksum(data)),
                })
                .collect()),
            None => Err(Self::no_such_upload(upload_id)),
        };
        Box::pin(async move { result })
    }
}

/// Deterministic pseudo-random test payload.
pub fn payload(len: usize, seed: u64) -> Vec<u8> {
    let mut x = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            (x >> 24) as u8
        })
        .collect()
}
