use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Extra request headers passed through to put / init calls.
pub type Headers = BTreeMap<String, String>;

/// Extra query parameters passed through to get / head calls.
pub type Params = BTreeMap<String, String>;

/// An inclusive byte range `[start, end]` of a remote object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Creates a range; `end` is inclusive.
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of bytes covered by the range.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start) + 1
    }

    /// A well-formed range always covers at least one byte.
    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// Formats the range as an HTTP `Range` header value.
    pub fn to_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Result of a `HEAD` on an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectInfo {
    pub size: u64,
    pub etag: String,
    /// Last-modified timestamp as seconds since the Unix epoch.
    pub last_modified: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage_class: String,
    /// Whole-object CRC64 when the service publishes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crc64: Option<u64>,
    #[serde(default)]
    pub delete_marker: bool,
    /// User metadata with the `x-oss-meta-` prefix stripped.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// Result of a single-shot put.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutObjectOutput {
    pub etag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crc64: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
}

/// Result of uploading one part of a multipart upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPartOutput {
    pub etag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crc64: Option<u64>,
}

/// A part reference sent with complete-multipart-upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPartRef {
    pub part_number: u32,
    pub etag: String,
}

/// Result of complete-multipart-upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteMultipartOutput {
    pub etag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crc64: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
}

/// One entry of a list-parts response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartInfo {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crc64: Option<u64>,
}
