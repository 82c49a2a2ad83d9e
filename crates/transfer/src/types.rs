use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A contiguous span `[start, end)` of the local file uploaded as one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Part {
    /// 1-based part number.
    pub part_number: u32,
    pub start: u64,
    /// Exclusive end offset.
    pub end: u64,
}

impl Part {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// A part the service has acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crc64: Option<u64>,
}

/// Persistent resume state of one multipart upload.
///
/// Every field except `crypto` is required; a document missing one does not
/// deserialize and is discarded. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub upload_id: String,
    pub bucket: String,
    pub object_name: String,
    pub abspath: String,
    pub size: u64,
    /// Source modification time, milliseconds since the Unix epoch.
    pub mtime: i64,
    pub part_size: u64,
    pub parts: Vec<CompletedPart>,
    /// Envelope metadata of a client-side encrypted upload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto: Option<BTreeMap<String, String>>,
}

/// An inclusive span `[start, end]` of the remote object downloaded as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// 0-based slot index.
    pub index: u32,
    pub start: u64,
    /// Inclusive end offset.
    pub end: u64,
}

impl Segment {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// A segment fully written to the temporary file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedSegment {
    pub index: u32,
    pub start: u64,
    pub end: u64,
    /// CRC64 of the bytes received for this segment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crc64: Option<u64>,
}

/// Persistent resume state of one ranged download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub bucket: String,
    pub object_name: String,
    pub etag: String,
    pub size: u64,
    pub last_modified: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    pub abspath: String,
    pub tmp_suffix: String,
    pub part_size: u64,
    pub segments: Vec<CompletedSegment>,
}

/// Lifecycle of one transfer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Initiating,
    Transferring,
    Finalizing,
    Done,
    Aborted,
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub etag: String,
    /// Whole-object CRC64 as verified against the service.
    pub crc64: Option<u64>,
    /// `None` when the single-shot path was taken.
    pub upload_id: Option<String>,
    /// Parts uploaded by this run (resumed parts excluded).
    pub parts_uploaded: usize,
}

/// Result of a successful download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub size: u64,
    /// Segments fetched by this run (resumed segments excluded).
    pub segments_downloaded: usize,
    /// Whole-object CRC64, when it was verified.
    pub crc64: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_upload_record() -> UploadRecord {
        UploadRecord {
            upload_id: "u-1".into(),
            bucket: "b".into(),
            object_name: "k".into(),
            abspath: "/data/f.bin".into(),
            size: 300,
            mtime: 1_700_000_000_000,
            part_size: 100,
            parts: vec![CompletedPart {
                part_number: 2,
                etag: "e2".into(),
                size: 100,
                crc64: Some(42),
            }],
            crypto: None,
        }
    }

    #[test]
    fn part_len() {
        let p = Part {
            part_number: 1,
            start: 100,
            end: 250,
        };
        assert_eq!(p.len(), 150);
        assert!(!p.is_empty());
    }

    #[test]
    fn segment_len_is_inclusive() {
        let s = Segment {
            index: 0,
            start: 0,
            end: 0,
        };
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn upload_record_json_roundtrip() {
        let rec = sample_upload_record();
        let v = serde_json::to_value(&rec).unwrap();
        assert!(v.get("crypto").is_none());
        let back: UploadRecord = serde_json::from_value(v).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn upload_record_missing_field_is_rejected() {
        let mut v = serde_json::to_value(sample_upload_record()).unwrap();
        v.as_object_mut().unwrap().remove("upload_id");
        assert!(serde_json::from_value::<UploadRecord>(v).is_err());
    }

    #[test]
    fn upload_record_wrong_type_is_rejected() {
        let mut v = serde_json::to_value(sample_upload_record()).unwrap();
        v["size"] = serde_json::json!("three hundred");
        assert!(serde_json::from_value::<UploadRecord>(v).is_err());
    }

    #[test]
    fn upload_record_unknown_fields_ignored() {
        let mut v = serde_json::to_value(sample_upload_record()).unwrap();
        v["written_by"] = serde_json::json!("a newer release");
        assert!(serde_json::from_value::<UploadRecord>(v).is_ok());
    }

    #[test]
    fn download_record_optional_version() {
        let v = serde_json::json!({
            "bucket": "b",
            "object_name": "k",
            "etag": "\"e\"",
            "size": 10,
            "last_modified": 5,
            "abspath": "/tmp/out",
            "tmp_suffix": ".tmp-abc",
            "part_size": 4,
            "segments": [{"index": 0, "start": 0, "end": 3}]
        });
        let rec: DownloadRecord = serde_json::from_value(v).unwrap();
        assert_eq!(rec.version_id, None);
        assert_eq!(rec.segments[0].crc64, None);
    }
}
