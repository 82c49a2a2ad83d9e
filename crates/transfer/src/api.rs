//! The object API consumed by the transfer engine.
//!
//! The surrounding storage client implements [`ObjectApi`] on top of its
//! HTTP transport and request signing. Keeping the engine behind a trait
//! keeps it independent of the transport and testable with fakes.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use ossxfer_protocol::{
    ApiError, ByteRange, CompleteMultipartOutput, CompletedPartRef, Headers, ObjectInfo, Params,
    PartInfo, PutObjectOutput, UploadPartOutput,
};
use tokio::io::AsyncRead;

/// Boxed future returned by every [`ObjectApi`] call.
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

/// Streaming response body.
pub type BodyReader = Pin<Box<dyn AsyncRead + Send>>;

/// Response of a (ranged) GET.
pub struct GetObjectOutput {
    pub body: BodyReader,
    /// Number of bytes the body will yield.
    pub content_length: u64,
    pub etag: String,
    pub last_modified: i64,
    /// CRC64 of the returned bytes, when the service publishes one.
    pub crc64: Option<u64>,
}

impl std::fmt::Debug for GetObjectOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetObjectOutput")
            .field("content_length", &self.content_length)
            .field("etag", &self.etag)
            .field("last_modified", &self.last_modified)
            .field("crc64", &self.crc64)
            .finish_non_exhaustive()
    }
}

/// Narrow object API bound to a single bucket.
///
/// Returned futures borrow only `self`; implementations copy any argument
/// they need before the first await.
pub trait ObjectApi: Send + Sync {
    /// Name of the bucket this client is bound to.
    fn bucket_name(&self) -> &str;

    fn put_object(&self, key: &str, body: Bytes, headers: &Headers)
    -> ApiFuture<'_, PutObjectOutput>;

    fn head_object(
        &self,
        key: &str,
        version_id: Option<&str>,
        params: &Params,
    ) -> ApiFuture<'_, ObjectInfo>;

    /// GETs the object, or the inclusive `range` of it.
    fn get_object(
        &self,
        key: &str,
        range: Option<ByteRange>,
        version_id: Option<&str>,
        params: &Params,
    ) -> ApiFuture<'_, GetObjectOutput>;

    /// Starts a multipart upload and returns its upload id.
    fn init_multipart_upload(&self, key: &str, headers: &Headers) -> ApiFuture<'_, String>;

    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> ApiFuture<'_, UploadPartOutput>;

    /// Completes a multipart upload; `parts` are sorted by part number.
    fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPartRef],
        headers: &Headers,
    ) -> ApiFuture<'_, CompleteMultipartOutput>;

    fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> ApiFuture<'_, ()>;

    /// Lists up to `max_parts` uploaded parts.
    ///
    /// Fails with `NoSuchUpload` when the service no longer knows the upload.
    fn list_parts(
        &self,
        key: &str,
        upload_id: &str,
        max_parts: u32,
    ) -> ApiFuture<'_, Vec<PartInfo>>;
}

impl<T: ObjectApi + ?Sized> ObjectApi for Arc<T> {
    fn bucket_name(&self) -> &str {
        (**self).bucket_name()
    }

    fn put_object(
        &self,
        key: &str,
        body: Bytes,
        headers: &Headers,
    ) -> ApiFuture<'_, PutObjectOutput> {
        (**self).put_object(key, body, headers)
    }

    fn head_object(
        &self,
        key: &str,
        version_id: Option<&str>,
        params: &Params,
    ) -> ApiFuture<'_, ObjectInfo> {
        (**self).head_object(key, version_id, params)
    }

    fn get_object(
        &self,
        key: &str,
        range: Option<ByteRange>,
        version_id: Option<&str>,
        params: &Params,
    ) -> ApiFuture<'_, GetObjectOutput> {
        (**self).get_object(key, range, version_id, params)
    }

    fn init_multipart_upload(&self, key: &str, headers: &Headers) -> ApiFuture<'_, String> {
        (**self).init_multipart_upload(key, headers)
    }

    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> ApiFuture<'_, UploadPartOutput> {
        (**self).upload_part(key, upload_id, part_number, body)
    }

    fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPartRef],
        headers: &Headers,
    ) -> ApiFuture<'_, CompleteMultipartOutput> {
        (**self).complete_multipart_upload(key, upload_id, parts, headers)
    }

    fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> ApiFuture<'_, ()> {
        (**self).abort_multipart_upload(key, upload_id)
    }

    fn list_parts(
        &self,
        key: &str,
        upload_id: &str,
        max_parts: u32,
    ) -> ApiFuture<'_, Vec<PartInfo>> {
        (**self).list_parts(key, upload_id, max_parts)
    }
}
